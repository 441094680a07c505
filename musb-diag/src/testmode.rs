//! Test-mode commands and the text vocabulary used to select them.

use std::io::Read;

use bit_field::BitField;

use crate::Error;
use crate::registers::{
    TEST_FIFO_ACCESS, TEST_FORCE_FS, TEST_FORCE_HOST, TEST_FORCE_HS, TEST_J, TEST_K,
    TEST_PACKET, TEST_SE0_NAK,
};

/// Longest command accepted from an operator, in bytes.
///
/// Anything past this is dropped without being read.
pub const MAX_COMMAND_LEN: usize = 19;

/// Operator command with its trailing bytes cut off at [`MAX_COMMAND_LEN`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandBuffer {
    bytes: [u8; MAX_COMMAND_LEN],
    len: usize,
}

impl CommandBuffer {
    /// Keep the first [`MAX_COMMAND_LEN`] bytes of `input`.
    pub fn new(input: &[u8]) -> Self {
        let len = input.len().min(MAX_COMMAND_LEN);
        let mut bytes = [0u8; MAX_COMMAND_LEN];
        bytes[..len].copy_from_slice(&input[..len]);
        Self { bytes, len }
    }

    /// Read at most [`MAX_COMMAND_LEN`] bytes from `source`.
    ///
    /// # Errors
    ///
    /// [`Error::InputFault`] if the source cannot be read.
    pub fn read_from(source: impl Read) -> Result<Self, Error> {
        let mut bytes = Vec::with_capacity(MAX_COMMAND_LEN);
        source
            .take(MAX_COMMAND_LEN as u64)
            .read_to_end(&mut bytes)
            .map_err(Error::InputFault)?;
        Ok(Self::new(&bytes))
    }

    /// The retained bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    /// Match against the vocabulary. See [`TestCommand::parse`].
    pub fn command(&self) -> TestCommand {
        TestCommand::parse(self.as_bytes())
    }
}

/// A recognised test-mode command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TestCommand {
    /// Force host mode without a session.
    ForceHost,
    /// Let the CPU access the endpoint-0 FIFO directly.
    FifoAccess,
    /// Force full-speed operation.
    ForceFullSpeed,
    /// Force high-speed operation.
    ForceHighSpeed,
    /// Repeatedly transmit the USB 2.0 test packet.
    TestPacket,
    /// Drive a continuous K state.
    TestK,
    /// Drive a continuous J state.
    TestJ,
    /// Enter the SE0 NAK test mode.
    TestSE0Nak,
    /// Timed suspend, resume, then GET_DESCRIPTOR.
    SuspendResumeSequence,
    /// Timed window of SOFs, then GET_DESCRIPTOR.
    GetDescriptorSequence,
    /// Leave all test modes.
    Clear,
}

/// Vocabulary in match order, with the number of leading bytes compared.
///
/// The lengths are not always the full keyword length and must not be "fixed".
const VOCABULARY: &[(&str, usize, TestCommand)] = &[
    ("force host", 10, TestCommand::ForceHost),
    ("fifo access", 11, TestCommand::FifoAccess),
    ("force full-speed", 15, TestCommand::ForceFullSpeed),
    ("force high-speed", 15, TestCommand::ForceHighSpeed),
    ("test packet", 10, TestCommand::TestPacket),
    ("test suspend_resume", 18, TestCommand::SuspendResumeSequence),
    ("test get_descripter", 18, TestCommand::GetDescriptorSequence),
    ("test K", 6, TestCommand::TestK),
    ("test J", 6, TestCommand::TestJ),
    ("test SE0 NAK", 12, TestCommand::TestSE0Nak),
];

/// Commands backed by a test-mode register bit, in read-back order.
const REGISTER_COMMANDS: [TestCommand; 8] = [
    TestCommand::ForceHost,
    TestCommand::FifoAccess,
    TestCommand::ForceFullSpeed,
    TestCommand::ForceHighSpeed,
    TestCommand::TestPacket,
    TestCommand::TestK,
    TestCommand::TestJ,
    TestCommand::TestSE0Nak,
];

impl TestCommand {
    /// Match operator input against the vocabulary.
    ///
    /// The first entry whose prefix matches wins. Input matching nothing is
    /// [`TestCommand::Clear`], never an error.
    pub fn parse(input: &[u8]) -> Self {
        VOCABULARY
            .iter()
            .find(|(keyword, len, _)| {
                input.len() >= *len && input[..*len] == keyword.as_bytes()[..*len]
            })
            .map(|&(_, _, command)| command)
            .unwrap_or(TestCommand::Clear)
    }

    /// Test-mode register value for this command.
    ///
    /// `None` for the timed sequences, which leave the test-mode register alone.
    pub fn register_pattern(self) -> Option<u8> {
        match self {
            TestCommand::ForceHost => Some(TEST_FORCE_HOST),
            TestCommand::FifoAccess => Some(TEST_FIFO_ACCESS),
            TestCommand::ForceFullSpeed => Some(TEST_FORCE_FS),
            TestCommand::ForceHighSpeed => Some(TEST_FORCE_HS),
            TestCommand::TestPacket => Some(TEST_PACKET),
            TestCommand::TestK => Some(TEST_K),
            TestCommand::TestJ => Some(TEST_J),
            TestCommand::TestSE0Nak => Some(TEST_SE0_NAK),
            TestCommand::Clear => Some(0),
            TestCommand::SuspendResumeSequence | TestCommand::GetDescriptorSequence => None,
        }
    }

    /// True for the commands that run a timed sequence.
    pub fn is_sequence(self) -> bool {
        self.register_pattern().is_none()
    }

    /// Canonical keyword for the command, as shown in the read-back report.
    pub fn keyword(self) -> &'static str {
        match self {
            TestCommand::Clear => "clear",
            command => VOCABULARY
                .iter()
                .find(|(_, _, c)| *c == command)
                .map(|(keyword, _, _)| *keyword)
                .unwrap_or("clear"),
        }
    }

    /// Register-backed commands whose bit is set in `value`, in read-back order.
    ///
    /// Bits that do not belong to a command are ignored.
    pub fn active_in(value: u8) -> impl Iterator<Item = TestCommand> {
        REGISTER_COMMANDS.into_iter().filter(move |command| {
            command
                .register_pattern()
                .map(|pattern| value.get_bit(pattern.trailing_zeros() as usize))
                .unwrap_or(false)
        })
    }
}

impl std::fmt::Display for TestCommand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.keyword())
    }
}

impl std::str::FromStr for TestCommand {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CommandBuffer::new(s.as_bytes()).command())
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn every_keyword_parses_to_its_command() {
        for &(keyword, _, command) in VOCABULARY {
            assert_eq!(TestCommand::parse(keyword.as_bytes()), command, "{keyword}");
        }
    }

    #[test]
    fn trailing_newline_still_matches() {
        assert_eq!(TestCommand::parse(b"test K\n"), TestCommand::TestK);
        assert_eq!(TestCommand::parse(b"force host\n"), TestCommand::ForceHost);
    }

    #[test]
    fn shortened_prefixes_match() {
        // Only the first 15 bytes of "force full-speed" are compared.
        assert_eq!(
            TestCommand::parse(b"force full-speeX"),
            TestCommand::ForceFullSpeed
        );
        assert_eq!(TestCommand::parse(b"test packeX"), TestCommand::TestPacket);
        assert_eq!(
            TestCommand::parse(b"test get_descripterZ"),
            TestCommand::GetDescriptorSequence
        );
        assert_eq!(
            TestCommand::parse(b"test suspend_resumX"),
            TestCommand::SuspendResumeSequence
        );
    }

    #[test]
    fn short_or_unknown_input_clears() {
        assert_eq!(TestCommand::parse(b""), TestCommand::Clear);
        assert_eq!(TestCommand::parse(b"test"), TestCommand::Clear);
        assert_eq!(TestCommand::parse(b"force hos"), TestCommand::Clear);
        assert_eq!(TestCommand::parse(b"test k"), TestCommand::Clear);
        assert_eq!(TestCommand::parse(b"reboot"), TestCommand::Clear);
    }

    #[test]
    fn register_patterns_are_single_bits() {
        for command in REGISTER_COMMANDS {
            let pattern = command.register_pattern().unwrap();
            assert_eq!(pattern.count_ones(), 1, "{command:?}");
        }
        assert_eq!(TestCommand::Clear.register_pattern(), Some(0));
        assert!(TestCommand::SuspendResumeSequence.is_sequence());
        assert!(TestCommand::GetDescriptorSequence.is_sequence());
    }

    #[test]
    fn active_commands_follow_readback_order() {
        let active: Vec<_> = TestCommand::active_in(0xff).collect();
        assert_eq!(active, REGISTER_COMMANDS);
        let active: Vec<_> = TestCommand::active_in(TEST_K | TEST_FORCE_HOST).collect();
        assert_eq!(active, [TestCommand::ForceHost, TestCommand::TestK]);
        assert_eq!(TestCommand::active_in(0).count(), 0);
    }

    #[test]
    fn buffer_truncates_long_input() {
        let buffer = CommandBuffer::new(b"test get_descripter and some more");
        assert_eq!(buffer.as_bytes(), b"test get_descripter");
        assert_eq!(buffer.command(), TestCommand::GetDescriptorSequence);
    }

    #[test]
    fn buffer_reads_at_most_capacity() -> Result<(), Error> {
        let mut source: &[u8] = b"test SE0 NAK, then a very long tail";
        let buffer = CommandBuffer::read_from(&mut source)?;
        assert_eq!(buffer.as_bytes().len(), MAX_COMMAND_LEN);
        let full_len = b"test SE0 NAK, then a very long tail".len();
        assert_eq!(source.len(), full_len - MAX_COMMAND_LEN);
        assert_eq!(buffer.command(), TestCommand::TestSE0Nak);
        Ok(())
    }

    #[test]
    fn unreadable_input_is_a_fault() {
        struct Broken;
        impl Read for Broken {
            fn read(&mut self, _: &mut [u8]) -> std::io::Result<usize> {
                Err(std::io::Error::other("bad address"))
            }
        }
        assert!(matches!(
            CommandBuffer::read_from(Broken),
            Err(Error::InputFault(_))
        ));
    }

    #[test]
    fn display_uses_keyword() {
        assert_eq!(TestCommand::TestSE0Nak.to_string(), "test SE0 NAK");
        assert_eq!("test J".parse::<TestCommand>(), Ok(TestCommand::TestJ));
    }
}
