use std::fs::OpenOptions;

use anyhow::Context;
use clap::Parser;
use musb_diag::Controller;
use musb_diag::io::{MappedRegisters, RegisterIo};
use tracing_subscriber::EnvFilter;

use cli::{Cli, Commands};

mod cli;
mod testmode;
mod util;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let timings = cli.timings();
    if cli.snapshot {
        let image = OpenOptions::new()
            .read(true)
            .write(cli.command.writes_registers())
            .open(&cli.device)
            .with_context(|| format!("failed to open snapshot {}", cli.device.display()))?;
        let registers = MappedRegisters::new(image, cli.base);
        run(Controller::with_timings(registers, timings), cli.command, cli.poll_ms).await
    } else {
        let registers = live::open(&cli)?;
        run(Controller::with_timings(registers, timings), cli.command, cli.poll_ms).await
    }
}

async fn run<R>(controller: Controller<R>, command: Commands, poll_ms: u64) -> anyhow::Result<()>
where
    R: RegisterIo + Send + 'static,
{
    match command {
        Commands::Regdump => print!(
            "{}",
            controller
                .register_dump()
                .context("failed to dump registers")?
        ),
        Commands::Testmode(command) => testmode::action(&controller, command, poll_ms).await?,
    }
    Ok(())
}

#[cfg(unix)]
mod live {
    use anyhow::Context;
    use musb_diag::io::MmioRegisters;
    use musb_diag::registers::BLOCK_SIZE;

    use crate::cli::Cli;

    pub(crate) fn open(cli: &Cli) -> anyhow::Result<MmioRegisters> {
        MmioRegisters::open(&cli.device, cli.base, BLOCK_SIZE).with_context(|| {
            format!(
                "failed to map registers at {:#x} from {}",
                cli.base,
                cli.device.display()
            )
        })
    }
}

#[cfg(not(unix))]
mod live {
    use musb_diag::io::MappedRegisters;

    use crate::cli::Cli;

    pub(crate) fn open(_: &Cli) -> anyhow::Result<MappedRegisters<std::fs::File>> {
        anyhow::bail!("live register access needs /dev/mem; pass --snapshot to use an image")
    }
}

#[cfg(test)]
mod test {
    use crate::cli::Cli;

    use clap::CommandFactory;

    #[test]
    fn check_cli_debug_asserts() {
        Cli::command().debug_assert();
    }
}
