use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, Condvar, Mutex, PoisonError};

use embedded_hal::delay::DelayNs;
use tracing::{debug, info};

use crate::Error;
use crate::io::RegisterIo;
use crate::registers::TESTMODE;
use crate::regmap::{REGISTER_MAP, RegisterDump};
use crate::sequence::{
    CancelToken, Progress, SequenceHandle, SequenceKind, SequenceOutcome, SequencePhase,
    SequenceRun, SequenceState, SequenceTimings,
};
use crate::setup::load_test_packet;
use crate::testmode::{CommandBuffer, TestCommand};

/// Diagnostics front end for one MUSB controller instance.
///
/// # Quick start
///
/// Wrap any [`RegisterIo`] implementation, then use
/// [`Controller::register_dump`] to snapshot the registers and
/// [`Controller::test_mode_write`] or [`Controller::test_mode_start`] to drive the
/// electrical test modes.
///
/// ```rust
/// # use musb_diag::{Controller, StdDelay, TestCommand};
/// # use musb_diag::io::RegisterFile;
/// # fn main() -> Result<(), musb_diag::Error> {
/// let controller = Controller::new(RegisterFile::new());
/// controller.test_mode_write(b"test K", StdDelay)?;
/// let report = controller.test_mode_read()?;
/// assert_eq!(report.active(), &[TestCommand::TestK]);
/// # Ok(())
/// # }
/// ```
///
/// # Locking
///
/// Register accesses are serialized by an internal mutex. On top of that, a
/// session lock admits one test-mode command at a time. It is held for the whole
/// of a timed sequence, including the waits. Register dumps and test-mode
/// read-back also take the session lock, so they never observe a sequence
/// half-way through. A caller that finds the session busy blocks until it is free.
#[derive(Debug)]
pub struct Controller<R> {
    registers: Arc<Mutex<R>>,
    session: Arc<SessionLock>,
    timings: SequenceTimings,
}

impl<R: RegisterIo> Controller<R> {
    /// Diagnostics over `registers` with the default sequence timings.
    pub fn new(registers: R) -> Self {
        Self::with_timings(registers, SequenceTimings::default())
    }

    /// Diagnostics over `registers` with custom sequence timings.
    pub fn with_timings(registers: R, timings: SequenceTimings) -> Self {
        Self {
            registers: Arc::new(Mutex::new(registers)),
            session: Arc::new(SessionLock::default()),
            timings,
        }
    }

    /// Timings used by the timed sequences.
    pub fn timings(&self) -> &SequenceTimings {
        &self.timings
    }

    /// True while a test-mode command (including a background sequence) is running.
    pub fn is_busy(&self) -> bool {
        self.session.is_held()
    }

    /// Run `f` with exclusive access to the register block.
    ///
    /// This does not wait for the test-mode session, so it can be used to observe
    /// the registers while a sequence is running.
    pub fn with_registers<T>(&self, f: impl FnOnce(&mut R) -> T) -> T {
        let mut registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut registers)
    }

    /// Give back the register block.
    ///
    /// Returns `None` if a background sequence still holds it.
    pub fn into_registers(self) -> Option<R> {
        Arc::try_unwrap(self.registers)
            .ok()
            .map(|registers| registers.into_inner().unwrap_or_else(PoisonError::into_inner))
    }

    ////////////////////////////////////////////////////////////////////////////////
    // Register dump
    ////////////////////////////////////////////////////////////////////////////////

    /// Read every register in [`REGISTER_MAP`].
    pub fn register_dump(&self) -> Result<RegisterDump, Error> {
        let _session = self.session.acquire();
        self.with_registers(|io| RegisterDump::capture(REGISTER_MAP, io))
    }

    ////////////////////////////////////////////////////////////////////////////////
    // Test mode
    ////////////////////////////////////////////////////////////////////////////////

    /// Report the test modes currently selected in the test-mode register.
    pub fn test_mode_read(&self) -> Result<TestModeReport, Error> {
        let _session = self.session.acquire();
        let value = self.with_registers(|io| io.read8(TESTMODE))?;
        Ok(TestModeReport::new(value))
    }

    /// Parse and run an operator test-mode command, blocking until it is done.
    ///
    /// Only the first [`MAX_COMMAND_LEN`] bytes of `input` are looked at. Input
    /// that matches no command clears the test-mode register.
    ///
    /// The timed sequences block the calling thread for 15 to 30 seconds with the
    /// default timings. Use [`Controller::test_mode_start`] to run them in the
    /// background instead.
    ///
    /// [`MAX_COMMAND_LEN`]: crate::testmode::MAX_COMMAND_LEN
    pub fn test_mode_write(&self, input: &[u8], delay: impl DelayNs) -> Result<TestCommand, Error> {
        let command = CommandBuffer::new(input).command();
        let _session = self.session.acquire();
        info!(%command, "test mode command");
        if let Some(pattern) = command.register_pattern() {
            self.apply(command, pattern)?;
        } else if let Some(kind) = SequenceKind::from_command(command) {
            let progress = Progress::new(first_phase(kind));
            let outcome = SequenceRun {
                registers: &*self.registers,
                delay,
                timings: &self.timings,
                cancel: &CancelToken::new(),
                progress: &progress,
            }
            .run(kind)?;
            debug!(?outcome, "inline sequence finished");
        }
        Ok(command)
    }

    /// Write the register pattern of a non-sequence command.
    fn apply(&self, command: TestCommand, pattern: u8) -> Result<(), Error> {
        self.with_registers(|io| {
            if command == TestCommand::TestPacket {
                load_test_packet(io)?;
            }
            debug!("testmode <- {pattern:#04x}");
            io.write8(TESTMODE, pattern)
        })
    }
}

impl<R: RegisterIo + Send + 'static> Controller<R> {
    /// Parse and start an operator test-mode command.
    ///
    /// Register-pattern commands are applied before this returns. Timed sequences
    /// are started on a background thread that keeps the test-mode session until
    /// the sequence ends. The returned [`SequenceHandle`] can poll, wait for, or
    /// cancel it.
    ///
    /// If another command is running, this blocks until it has finished.
    ///
    /// # Errors
    ///
    /// A register access fault while applying a pattern, or
    /// [`Error::OutOfResources`] if the worker thread cannot be spawned.
    pub fn test_mode_start<D>(&self, input: &[u8], delay: D) -> Result<TestModeStart, Error>
    where
        D: DelayNs + Send + 'static,
    {
        let command = CommandBuffer::new(input).command();
        let session = self.session.acquire();
        info!(%command, "test mode command");
        if let Some(pattern) = command.register_pattern() {
            self.apply(command, pattern)?;
            return Ok(TestModeStart::Applied(command));
        }
        let Some(kind) = SequenceKind::from_command(command) else {
            return Ok(TestModeStart::Applied(command));
        };

        let cancel = CancelToken::new();
        let progress = Arc::new(Progress::new(first_phase(kind)));
        let registers = Arc::clone(&self.registers);
        let timings = self.timings;
        let worker_cancel = cancel.clone();
        let worker_progress = Arc::clone(&progress);

        let worker = std::thread::Builder::new()
            .name(format!("musb-{kind}"))
            .spawn(move || {
                let result = catch_unwind(AssertUnwindSafe(|| {
                    SequenceRun {
                        registers: &*registers,
                        delay,
                        timings: &timings,
                        cancel: &worker_cancel,
                        progress: &worker_progress,
                    }
                    .run(kind)
                }))
                .unwrap_or(Err(Error::SequenceAborted));
                // Free the controller before announcing the result.
                drop(session);
                worker_progress.set(match &result {
                    Ok(outcome) => SequenceState::Finished(*outcome),
                    Err(_) => SequenceState::Failed,
                });
                result
            })
            .map_err(|_| Error::OutOfResources)?;

        Ok(TestModeStart::Running(SequenceHandle::new(
            kind, cancel, progress, worker,
        )))
    }
}

fn first_phase(kind: SequenceKind) -> SequencePhase {
    match kind {
        SequenceKind::SuspendResume => SequencePhase::SofWindow,
        SequenceKind::GetDescriptor => SequencePhase::ArmingTrigger,
    }
}

/// Result of [`Controller::test_mode_start`].
#[derive(Debug)]
pub enum TestModeStart {
    /// The command's register pattern has been written.
    Applied(TestCommand),
    /// A timed sequence is running in the background.
    Running(SequenceHandle),
}

impl TestModeStart {
    /// Wait for a background sequence, if one was started.
    ///
    /// Applied commands report [`SequenceOutcome::Completed`] straight away.
    pub fn wait(self) -> Result<SequenceOutcome, Error> {
        match self {
            TestModeStart::Applied(_) => Ok(SequenceOutcome::Completed),
            TestModeStart::Running(handle) => handle.wait(),
        }
    }
}

/// Test modes selected in the test-mode register.
///
/// `Display` prints one keyword per line, in the fixed read-back order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestModeReport {
    raw: u8,
    active: Vec<TestCommand>,
}

impl TestModeReport {
    fn new(raw: u8) -> Self {
        Self {
            raw,
            active: TestCommand::active_in(raw).collect(),
        }
    }

    /// Raw test-mode register value.
    pub fn raw(&self) -> u8 {
        self.raw
    }

    /// Selected test modes.
    pub fn active(&self) -> &[TestCommand] {
        &self.active
    }
}

impl std::fmt::Display for TestModeReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for command in &self.active {
            writeln!(f, "{command}")?;
        }
        Ok(())
    }
}

/// One-command-at-a-time gate for the test-mode endpoint.
///
/// Unlike a `MutexGuard`, the guard owns an `Arc` to the lock so it can be moved
/// into the worker thread of a background sequence.
#[derive(Debug, Default)]
struct SessionLock {
    held: Mutex<bool>,
    released: Condvar,
}

impl SessionLock {
    fn acquire(self: &Arc<Self>) -> SessionGuard {
        let held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        let mut held = self
            .released
            .wait_while(held, |held| *held)
            .unwrap_or_else(PoisonError::into_inner);
        *held = true;
        SessionGuard {
            lock: Arc::clone(self),
        }
    }

    fn is_held(&self) -> bool {
        *self.held.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[derive(Debug)]
struct SessionGuard {
    lock: Arc<SessionLock>,
}

impl Drop for SessionGuard {
    fn drop(&mut self) {
        *self.lock.held.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.lock.released.notify_one();
    }
}
