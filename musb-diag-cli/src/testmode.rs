use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use musb_diag::io::RegisterIo;
use musb_diag::sequence::SequenceState;
use musb_diag::{Controller, SequenceHandle, SequenceOutcome, StdDelay, TestModeStart};
use tracing::warn;

#[derive(Debug, Parser)]
#[command(flatten_help = true)]
pub(crate) enum TestmodeCommand {
    /// Show the test modes currently selected.
    Read,
    /// Select a test mode or run a timed test sequence.
    ///
    /// Recognised commands: "test SE0 NAK", "test J", "test K", "test packet",
    /// "force high-speed", "force full-speed", "fifo access", "force host",
    /// "test suspend_resume" and "test get_descripter". Anything else clears
    /// all test modes.
    ///
    /// Ctrl-C during a timed sequence cancels it. A suspended bus is resumed
    /// before the command exits.
    Write {
        /// Command words, joined with single spaces.
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
}

pub(crate) async fn action<R>(
    controller: &Controller<R>,
    command: TestmodeCommand,
    poll_ms: u64,
) -> anyhow::Result<()>
where
    R: RegisterIo + Send + 'static,
{
    match command {
        TestmodeCommand::Read => print!(
            "{}",
            controller
                .test_mode_read()
                .context("failed to read test mode")?
        ),
        TestmodeCommand::Write { command } => {
            let input = command.join(" ");
            match controller
                .test_mode_start(input.as_bytes(), StdDelay)
                .with_context(|| format!("failed to apply {input:?}"))?
            {
                TestModeStart::Applied(command) => println!("{command}"),
                TestModeStart::Running(handle) => {
                    follow(handle, Duration::from_millis(poll_ms), shutdown_signal()).await?;
                }
            }
        }
    }
    Ok(())
}

/// Resolves on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!("failed to install Ctrl-C handler: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                warn!("failed to install SIGTERM handler: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm => {},
    }
}

/// Follow a running sequence to its end, cancelling it if `interrupt` resolves
/// first.
///
/// Cancellation still waits for the sequence to finish, so the bus is resumed
/// before this returns.
pub(crate) async fn follow(
    handle: SequenceHandle,
    poll: Duration,
    interrupt: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<SequenceOutcome> {
    let kind = handle.kind();
    let cancel = handle.cancel_token();
    let watcher = tokio::spawn(async move {
        interrupt.await;
        warn!("interrupted, cancelling the {kind} sequence");
        cancel.cancel();
    });
    let outcome = tokio::task::spawn_blocking(move || report(handle, poll)).await;
    watcher.abort();
    outcome.context("sequence monitor panicked")?
}

/// Print each phase of a running sequence as it is entered, then its outcome.
fn report(handle: SequenceHandle, poll: Duration) -> anyhow::Result<SequenceOutcome> {
    let kind = handle.kind();
    let mut last = None;
    loop {
        let state = handle.wait_timeout(poll);
        if last != Some(state) {
            if let SequenceState::Running(phase) = state {
                println!("{kind}: {phase:?}");
            }
            last = Some(state);
        }
        if state.is_finished() {
            break;
        }
    }
    let outcome = handle
        .wait()
        .with_context(|| format!("{kind} sequence failed"))?;
    println!("{kind}: {outcome:?}");
    Ok(outcome)
}
