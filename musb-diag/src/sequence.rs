//! Timed electrical test sequences.
//!
//! Both sequences are long (15 to 30 seconds) so they are normally run on a
//! background thread via [`Controller::test_mode_start`], which hands back a
//! [`SequenceHandle`] to poll, wait on, or cancel. The register block is only
//! locked for each individual step, while the test-mode session stays held for
//! the whole run.
//!
//! [`Controller::test_mode_start`]: crate::Controller::test_mode_start

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;

use bit_field::BitField;
use embedded_hal::delay::DelayNs;
use tracing::{debug, info, warn};

use crate::Error;
use crate::io::RegisterIo;
use crate::registers::{POWER, POWER_ENSUSPEND, POWER_RESUME, POWER_SUSPENDM};
use crate::setup::{SetupPacket, inject_setup};
use crate::testmode::TestCommand;

/// Durations of the waits in the timed sequences.
///
/// The defaults are the compliance-test timings. Shorter values are useful when
/// exercising the sequences against a simulated register block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceTimings {
    /// Initial window in which the host keeps sending SOFs.
    pub sof_window: Duration,
    /// Time for the operator to trigger suspend on the test equipment.
    pub suspend_trigger: Duration,
    /// Time the bus is held in suspend before the resume prompt.
    pub suspended: Duration,
    /// Time for the operator to trigger resume on the test equipment.
    pub resume_trigger: Duration,
    /// Length of resume signaling. Never cut short by cancellation.
    pub resume_signaling: Duration,
    /// SOF window for arming the scope trigger before GET_DESCRIPTOR.
    pub descriptor_trigger: Duration,
    /// Longest single delay between cancellation checks.
    pub poll_interval: Duration,
}

impl Default for SequenceTimings {
    fn default() -> Self {
        Self {
            sof_window: Duration::from_secs(5),
            suspend_trigger: Duration::from_secs(10),
            suspended: Duration::from_secs(5),
            resume_trigger: Duration::from_secs(10),
            resume_signaling: Duration::from_millis(25),
            descriptor_trigger: Duration::from_secs(15),
            poll_interval: Duration::from_millis(100),
        }
    }
}

/// Which timed sequence to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// HS_HOST_PORT_SUSPEND_RESUME.
    SuspendResume,
    /// SINGLE_STEP_GET_DEVICE_DESCRIPTOR.
    GetDescriptor,
}

impl SequenceKind {
    /// The sequence run by `command`, if it is a sequence command.
    pub fn from_command(command: TestCommand) -> Option<Self> {
        match command {
            TestCommand::SuspendResumeSequence => Some(Self::SuspendResume),
            TestCommand::GetDescriptorSequence => Some(Self::GetDescriptor),
            _ => None,
        }
    }
}

impl std::fmt::Display for SequenceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SequenceKind::SuspendResume => write!(f, "suspend-resume"),
            SequenceKind::GetDescriptor => write!(f, "get-descriptor"),
        }
    }
}

/// Step a running sequence is in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencePhase {
    /// Waiting while the host sends SOFs.
    SofWindow,
    /// Waiting for the operator to trigger suspend.
    AwaitingSuspend,
    /// Bus suspended.
    Suspended,
    /// Waiting for the operator to trigger resume.
    AwaitingResume,
    /// Driving resume signaling.
    Resuming,
    /// Waiting for the operator to arm the scope trigger.
    ArmingTrigger,
    /// Sending the GET_DESCRIPTOR setup packet.
    InjectingSetup,
}

/// How a sequence that did not fail ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceOutcome {
    /// Every step ran and the setup packet was injected.
    Completed,
    /// Stopped early on request. The power register was still returned to a
    /// state with neither suspend nor resume asserted, but no setup packet was sent.
    Cancelled,
}

/// Observable state of a sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceState {
    /// Still running, in the given phase.
    Running(SequencePhase),
    /// Ended normally.
    Finished(SequenceOutcome),
    /// Stopped by a register access fault or a worker panic.
    Failed,
}

impl SequenceState {
    /// True once the sequence is no longer running.
    pub fn is_finished(&self) -> bool {
        !matches!(self, SequenceState::Running(_))
    }
}

/// Cooperative cancellation flag shared with a running sequence.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Fresh, uncancelled token.
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the sequence to stop at its next check.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    /// True once [`CancelToken::cancel`] has been called.
    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Sequence state shared between the worker and its handle.
#[derive(Debug)]
pub(crate) struct Progress {
    state: Mutex<SequenceState>,
    changed: Condvar,
}

impl Progress {
    pub(crate) fn new(initial: SequencePhase) -> Self {
        Self {
            state: Mutex::new(SequenceState::Running(initial)),
            changed: Condvar::new(),
        }
    }

    pub(crate) fn get(&self) -> SequenceState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, state: SequenceState) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = state;
        self.changed.notify_all();
    }

    fn wait_finished(&self, timeout: Duration) -> SequenceState {
        let guard = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let (guard, _) = self
            .changed
            .wait_timeout_while(guard, timeout, |state| !state.is_finished())
            .unwrap_or_else(PoisonError::into_inner);
        *guard
    }
}

/// `DelayNs` implementation that sleeps the current thread.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns.into()));
    }

    fn delay_us(&mut self, us: u32) {
        std::thread::sleep(Duration::from_micros(us.into()));
    }

    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(Duration::from_millis(ms.into()));
    }
}

/// Sleep for `duration` through a `DelayNs` that only takes `u32` microseconds.
fn delay_for(delay: &mut impl DelayNs, duration: Duration) {
    let mut remaining = duration.as_micros();
    while remaining > 0 {
        let step = u32::try_from(remaining).unwrap_or(u32::MAX);
        delay.delay_us(step);
        remaining -= u128::from(step);
    }
}

/// One run of a timed sequence.
pub(crate) struct SequenceRun<'a, R, D> {
    pub(crate) registers: &'a Mutex<R>,
    pub(crate) delay: D,
    pub(crate) timings: &'a SequenceTimings,
    pub(crate) cancel: &'a CancelToken,
    pub(crate) progress: &'a Progress,
}

impl<R: RegisterIo, D: DelayNs> SequenceRun<'_, R, D> {
    pub(crate) fn run(&mut self, kind: SequenceKind) -> Result<SequenceOutcome, Error> {
        info!(%kind, "starting timed sequence");
        let outcome = match kind {
            SequenceKind::SuspendResume => self.suspend_resume(),
            SequenceKind::GetDescriptor => self.get_descriptor(),
        }?;
        match outcome {
            SequenceOutcome::Completed => info!(%kind, "timed sequence complete"),
            SequenceOutcome::Cancelled => warn!(%kind, "timed sequence cancelled"),
        }
        Ok(outcome)
    }

    fn enter(&self, phase: SequencePhase) {
        debug!(?phase, "sequence phase");
        self.progress.set(SequenceState::Running(phase));
    }

    fn with_registers<T>(&self, f: impl FnOnce(&mut R) -> Result<T, Error>) -> Result<T, Error> {
        let mut registers = self.registers.lock().unwrap_or_else(PoisonError::into_inner);
        f(&mut registers)
    }

    /// Wait for `duration` in slices of at most `poll_interval`.
    ///
    /// Returns false if the run was cancelled before or during the wait.
    fn wait(&mut self, duration: Duration) -> bool {
        let mut remaining = duration;
        while !remaining.is_zero() {
            if self.cancel.is_cancelled() {
                return false;
            }
            let slice = match self.timings.poll_interval {
                poll if poll.is_zero() => remaining,
                poll => remaining.min(poll),
            };
            delay_for(&mut self.delay, slice);
            remaining -= slice;
        }
        !self.cancel.is_cancelled()
    }

    fn suspend_resume(&mut self) -> Result<SequenceOutcome, Error> {
        let timings = *self.timings;

        // The host must keep sending SOFs for 15 seconds in total.
        self.enter(SequencePhase::SofWindow);
        if !self.wait(timings.sof_window) {
            return Ok(SequenceOutcome::Cancelled);
        }
        info!("please begin to trigger suspend");
        self.enter(SequencePhase::AwaitingSuspend);
        if !self.wait(timings.suspend_trigger) {
            return Ok(SequenceOutcome::Cancelled);
        }

        let power = self.with_registers(|io| {
            let mut power = io.read8(POWER)?;
            power.set_bit(POWER_SUSPENDM, true);
            power.set_bit(POWER_ENSUSPEND, true);
            io.write8(POWER, power)?;
            Ok(power)
        })?;
        debug!("power after suspend: {power:#04x}");
        self.enter(SequencePhase::Suspended);

        let mut resumed = self.wait(timings.suspended);
        if resumed {
            info!("please begin to trigger resume");
            self.enter(SequencePhase::AwaitingResume);
            resumed = self.wait(timings.resume_trigger);
        }

        // Resume runs even when cancelled so the bus is never left suspended.
        self.enter(SequencePhase::Resuming);
        self.resume(power, timings.resume_signaling)?;
        if !resumed {
            return Ok(SequenceOutcome::Cancelled);
        }

        self.inject()?;
        Ok(SequenceOutcome::Completed)
    }

    fn resume(&mut self, mut power: u8, signaling: Duration) -> Result<(), Error> {
        power.set_bit(POWER_SUSPENDM, false);
        power.set_bit(POWER_RESUME, true);
        self.with_registers(|io| io.write8(POWER, power))?;
        delay_for(&mut self.delay, signaling);
        power.set_bit(POWER_RESUME, false);
        self.with_registers(|io| io.write8(POWER, power))?;
        debug!("power after resume: {power:#04x}");
        Ok(())
    }

    fn get_descriptor(&mut self) -> Result<SequenceOutcome, Error> {
        // The host sends SOFs so the test engineer can raise the scope trigger
        // just above the SOF voltage level.
        self.enter(SequencePhase::ArmingTrigger);
        if !self.wait(self.timings.descriptor_trigger) {
            return Ok(SequenceOutcome::Cancelled);
        }
        self.inject()?;
        Ok(SequenceOutcome::Completed)
    }

    fn inject(&mut self) -> Result<(), Error> {
        self.enter(SequencePhase::InjectingSetup);
        let packet = SetupPacket::get_device_descriptor(0x40);
        self.with_registers(|io| inject_setup(io, &packet))
    }
}

/// Handle to a timed sequence running on a background thread.
///
/// Dropping the handle does not stop the sequence. It runs to completion and
/// releases the test-mode session when it ends.
#[derive(Debug)]
pub struct SequenceHandle {
    kind: SequenceKind,
    cancel: CancelToken,
    progress: Arc<Progress>,
    worker: JoinHandle<Result<SequenceOutcome, Error>>,
}

impl SequenceHandle {
    pub(crate) fn new(
        kind: SequenceKind,
        cancel: CancelToken,
        progress: Arc<Progress>,
        worker: JoinHandle<Result<SequenceOutcome, Error>>,
    ) -> Self {
        Self {
            kind,
            cancel,
            progress,
            worker,
        }
    }

    /// Which sequence is running.
    pub fn kind(&self) -> SequenceKind {
        self.kind
    }

    /// Current state, without blocking.
    pub fn state(&self) -> SequenceState {
        self.progress.get()
    }

    /// Request cancellation.
    ///
    /// The sequence stops at its next wait slice. A suspended bus is resumed
    /// first, so the call to [`SequenceHandle::wait`] may take up to one
    /// poll interval plus the resume signaling time to return.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// A token that cancels this sequence, for use from another thread or task.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Block until the sequence has finished or `timeout` has elapsed, whichever
    /// comes first, and return the state at that point.
    pub fn wait_timeout(&self, timeout: Duration) -> SequenceState {
        self.progress.wait_finished(timeout)
    }

    /// Block until the sequence ends and return how it ended.
    ///
    /// # Errors
    ///
    /// The register access fault that stopped the sequence, or
    /// [`Error::SequenceAborted`] if the worker panicked.
    pub fn wait(self) -> Result<SequenceOutcome, Error> {
        self.worker.join().map_err(|_| Error::SequenceAborted)?
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::RegisterFile;
    use crate::registers::{CSR0, FIFO_EP0, TESTMODE};

    /// Records the total time slept without sleeping.
    #[derive(Default)]
    struct TallyDelay {
        total_ns: u64,
        calls: usize,
    }

    impl DelayNs for TallyDelay {
        fn delay_ns(&mut self, ns: u32) {
            self.total_ns += u64::from(ns);
            self.calls += 1;
        }
    }

    fn run(
        kind: SequenceKind,
        registers: &Mutex<RegisterFile>,
        delay: &mut TallyDelay,
        cancel: &CancelToken,
    ) -> Result<SequenceOutcome, Error> {
        let timings = SequenceTimings::default();
        let progress = Progress::new(SequencePhase::SofWindow);
        SequenceRun {
            registers,
            delay,
            timings: &timings,
            cancel,
            progress: &progress,
        }
        .run(kind)
    }

    #[test]
    fn suspend_resume_timing_and_final_power_state() -> Result<(), Error> {
        let registers = Mutex::new(RegisterFile::new());
        // HSENAB and SOFTCONN set before the test; they must be preserved.
        registers.lock().unwrap().write8(POWER, 0x60)?;
        registers.lock().unwrap().clear_journal();
        let mut delay = TallyDelay::default();

        let outcome = run(
            SequenceKind::SuspendResume,
            &registers,
            &mut delay,
            &CancelToken::new(),
        )?;
        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(delay.total_ns, 30_025_000_000);

        let regs = registers.into_inner().unwrap();
        let power_writes: Vec<u32> = regs
            .writes()
            .filter(|&(offset, _, _)| offset == POWER)
            .map(|(_, _, value)| value)
            .collect();
        // ENSUSPEND stays set, SUSPENDM and RESUME end up clear.
        assert_eq!(power_writes, [0x63, 0x65, 0x61]);
        assert_eq!(regs.as_bytes()[POWER], 0x61);
        assert!(regs.writes().all(|(offset, _, _)| offset != TESTMODE));
        Ok(())
    }

    #[test]
    fn get_descriptor_waits_then_injects_once() -> Result<(), Error> {
        let registers = Mutex::new(RegisterFile::new());
        let mut delay = TallyDelay::default();
        let outcome = run(
            SequenceKind::GetDescriptor,
            &registers,
            &mut delay,
            &CancelToken::new(),
        )?;
        assert_eq!(outcome, SequenceOutcome::Completed);
        assert_eq!(delay.total_ns, 15_000_000_000);

        let regs = registers.into_inner().unwrap();
        assert_eq!(regs.writes().filter(|w| w.0 == FIFO_EP0).count(), 8);
        assert_eq!(regs.writes().filter(|w| w.0 == CSR0).count(), 1);
        Ok(())
    }

    #[test]
    fn waits_are_sliced_by_poll_interval() {
        let registers = Mutex::new(RegisterFile::new());
        let mut delay = TallyDelay::default();
        let _ = run(
            SequenceKind::GetDescriptor,
            &registers,
            &mut delay,
            &CancelToken::new(),
        );
        // 15 s in 100 ms slices.
        assert!(delay.calls >= 150);
    }

    #[test]
    fn cancelled_before_start_touches_nothing() -> Result<(), Error> {
        let registers = Mutex::new(RegisterFile::new());
        let cancel = CancelToken::new();
        cancel.cancel();
        let outcome = run(
            SequenceKind::SuspendResume,
            &registers,
            &mut TallyDelay::default(),
            &cancel,
        )?;
        assert_eq!(outcome, SequenceOutcome::Cancelled);
        assert!(registers.into_inner().unwrap().journal().is_empty());
        Ok(())
    }

    #[test]
    fn delay_for_splits_long_durations() {
        let mut delay = TallyDelay::default();
        delay_for(&mut delay, Duration::from_secs(5000));
        assert_eq!(delay.total_ns, 5_000_000_000_000);
    }

    #[test]
    fn only_sequence_commands_have_a_kind() {
        assert_eq!(
            SequenceKind::from_command(TestCommand::SuspendResumeSequence),
            Some(SequenceKind::SuspendResume)
        );
        assert_eq!(
            SequenceKind::from_command(TestCommand::GetDescriptorSequence),
            Some(SequenceKind::GetDescriptor)
        );
        assert_eq!(SequenceKind::from_command(TestCommand::TestK), None);
    }
}
