//! Offsets and bit positions of the MUSB core registers used by the diagnostics.
//!
//! Offsets are byte offsets from the start of the mapped register block. Bit
//! positions are given as indices for use with [`bit_field::BitField`], alongside
//! the equivalent masks where a whole pattern is written at once.

/// Power management register (8-bit).
pub const POWER: usize = 0x01;
/// Endpoint index register (8-bit), selects the endpoint for indexed registers.
pub const INDEX: usize = 0x0e;
/// Electrical test-mode register (8-bit).
pub const TESTMODE: usize = 0x0f;
/// FIFO register for endpoint 0.
pub const FIFO_EP0: usize = 0x20;
/// Endpoint-0 control/status register in the flat (non-indexed) register space (16-bit).
pub const CSR0: usize = 0x102;

// Power register bits.
/// Enable SUSPENDM output.
pub const POWER_ENSUSPEND: usize = 0;
/// Drive the bus into suspend.
pub const POWER_SUSPENDM: usize = 1;
/// Generate resume signaling.
pub const POWER_RESUME: usize = 2;

// CSR0 bits (host mode).
/// Packet loaded into the FIFO, ready to send.
pub const CSR0_TXPKTRDY: usize = 1;
/// The packet in the FIFO is a SETUP packet.
pub const CSR0_H_SETUPPKT: usize = 3;

// Test-mode register patterns.
pub(crate) const TEST_SE0_NAK: u8 = 0x01;
pub(crate) const TEST_J: u8 = 0x02;
pub(crate) const TEST_K: u8 = 0x04;
pub(crate) const TEST_PACKET: u8 = 0x08;
pub(crate) const TEST_FORCE_HS: u8 = 0x10;
pub(crate) const TEST_FORCE_FS: u8 = 0x20;
pub(crate) const TEST_FIFO_ACCESS: u8 = 0x40;
pub(crate) const TEST_FORCE_HOST: u8 = 0x80;

/// Size of the register window covered by [`REGISTER_MAP`](crate::REGISTER_MAP).
pub const BLOCK_SIZE: usize = 0x400;
