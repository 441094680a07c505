use std::path::PathBuf;
use std::time::Duration;

use crate::testmode::TestmodeCommand;
use crate::util;

use clap::Parser;
use musb_diag::SequenceTimings;

/// CLI for the MUSB USB host controller diagnostics
///
/// Dumps the controller's register block and drives its USB 2.0 electrical
/// compliance test modes, including the timed suspend/resume and
/// GET_DESCRIPTOR sequences used with an oscilloscope.
///
/// On the target the register block is mapped from /dev/mem at the physical
/// address given by --base. With --snapshot the device is a register image
/// instead, and --base is the block's offset inside it.
#[derive(Debug, Parser)]
#[command(version, about)]
pub(crate) struct Cli {
    /// Physical memory device, or the image file with --snapshot
    #[arg(short, long, default_value = "/dev/mem")]
    pub(crate) device: PathBuf,
    /// Physical address of the register block, or its offset in the image, in
    /// hexadecimal
    #[arg(short, long, default_value = "0x0", value_parser = util::u64_from_hex)]
    pub(crate) base: u64,
    /// Treat the device as a register snapshot image read with file I/O
    #[arg(short, long)]
    pub(crate) snapshot: bool,
    /// How often to report sequence progress, in milliseconds
    #[arg(long, default_value_t = 250)]
    pub(crate) poll_ms: u64,
    /// Initial SOF window of the suspend/resume sequence
    #[arg(long, value_name = "MS")]
    sof_window_ms: Option<u64>,
    /// Time allowed to trigger suspend or resume on the test equipment
    #[arg(long, value_name = "MS")]
    trigger_window_ms: Option<u64>,
    /// Time the bus is held in suspend
    #[arg(long, value_name = "MS")]
    suspend_ms: Option<u64>,
    /// Length of resume signaling
    #[arg(long, value_name = "MS")]
    resume_ms: Option<u64>,
    /// SOF window before the GET_DESCRIPTOR packet is sent
    #[arg(long, value_name = "MS")]
    descriptor_window_ms: Option<u64>,
    #[command(subcommand)]
    pub(crate) command: Commands,
}

impl Cli {
    /// Default timings with any overrides from the command line applied.
    pub(crate) fn timings(&self) -> SequenceTimings {
        let mut timings = SequenceTimings::default();
        let ms = Duration::from_millis;
        if let Some(v) = self.sof_window_ms {
            timings.sof_window = ms(v);
        }
        if let Some(v) = self.trigger_window_ms {
            timings.suspend_trigger = ms(v);
            timings.resume_trigger = ms(v);
        }
        if let Some(v) = self.suspend_ms {
            timings.suspended = ms(v);
        }
        if let Some(v) = self.resume_ms {
            timings.resume_signaling = ms(v);
        }
        if let Some(v) = self.descriptor_window_ms {
            timings.descriptor_trigger = ms(v);
        }
        timings
    }
}

#[derive(Debug, Parser)]
pub(crate) enum Commands {
    /// Print every controller register.
    Regdump,
    /// Read or select the USB test modes.
    #[command(subcommand)]
    Testmode(TestmodeCommand),
}

impl Commands {
    /// Whether the command needs the register window opened for writing.
    pub(crate) fn writes_registers(&self) -> bool {
        matches!(self, Commands::Testmode(TestmodeCommand::Write { .. }))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn overrides_replace_defaults() {
        let cli = Cli::parse_from([
            "musb-diag",
            "--snapshot",
            "--base",
            "0x11200000",
            "--trigger-window-ms",
            "500",
            "--resume-ms",
            "30",
            "testmode",
            "read",
        ]);
        assert_eq!(cli.base, 0x1120_0000);
        assert!(cli.snapshot);
        let timings = cli.timings();
        assert_eq!(timings.suspend_trigger, Duration::from_millis(500));
        assert_eq!(timings.resume_trigger, Duration::from_millis(500));
        assert_eq!(timings.resume_signaling, Duration::from_millis(30));
        assert_eq!(timings.sof_window, SequenceTimings::default().sof_window);
        assert!(!cli.command.writes_registers());
    }
}
