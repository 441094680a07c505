//! USB control requests and their injection through endpoint 0.

use bit_field::BitField;
use tracing::debug;

use crate::Error;
use crate::io::RegisterIo;
use crate::registers::{CSR0, CSR0_H_SETUPPKT, CSR0_TXPKTRDY, FIFO_EP0, INDEX};

/// GET_DESCRIPTOR standard request code.
pub const REQ_GET_DESCRIPTOR: u8 = 0x06;
/// Device descriptor type, as the high byte of `wValue`.
pub const DESCRIPTOR_DEVICE: u8 = 0x01;

/// Direction of the data stage of a control transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Host to device (OUT).
    HostToDevice,
    /// Device to host (IN).
    DeviceToHost,
}

/// Request type: standard, class or vendor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    /// Defined by chapter 9 of the USB specification.
    Standard,
    /// Defined by a device class.
    Class,
    /// Vendor specific.
    Vendor,
}

impl From<RequestKind> for u8 {
    fn from(value: RequestKind) -> Self {
        match value {
            RequestKind::Standard => 0b00,
            RequestKind::Class => 0b01,
            RequestKind::Vendor => 0b10,
        }
    }
}

/// Recipient of a control request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// The device as a whole.
    Device,
    /// An interface.
    Interface,
    /// An endpoint.
    Endpoint,
    /// Something else.
    Other,
}

impl From<Recipient> for u8 {
    fn from(value: Recipient) -> Self {
        match value {
            Recipient::Device => 0,
            Recipient::Interface => 1,
            Recipient::Endpoint => 2,
            Recipient::Other => 3,
        }
    }
}

/// Composes the `bmRequestType` byte.
///
/// Bit 7 is the direction, bits 5-6 the kind, and bits 0-4 the recipient.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestType {
    /// Data stage direction.
    pub direction: Direction,
    /// Standard, class or vendor request.
    pub kind: RequestKind,
    /// Request recipient.
    pub recipient: Recipient,
}

impl From<RequestType> for u8 {
    fn from(value: RequestType) -> Self {
        let mut byte = 0u8;
        byte.set_bit(7, value.direction == Direction::DeviceToHost);
        byte.set_bits(5..7, value.kind.into());
        byte.set_bits(0..5, value.recipient.into());
        byte
    }
}

/// The 8-byte header of a USB control transfer.
///
/// Field order matches the wire layout. Multi-byte fields are sent little-endian.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SetupPacket {
    /// `bmRequestType`
    pub request_type: u8,
    /// `bRequest`
    pub request: u8,
    /// `wValue`
    pub value: u16,
    /// `wIndex`
    pub index: u16,
    /// `wLength`
    pub length: u16,
}

impl SetupPacket {
    /// Standard GET_DESCRIPTOR request for the device descriptor.
    ///
    /// This is the packet the timed test-mode sequences end with, using a
    /// `length` of 0x40.
    pub fn get_device_descriptor(length: u16) -> Self {
        let request_type = RequestType {
            direction: Direction::DeviceToHost,
            kind: RequestKind::Standard,
            recipient: Recipient::Device,
        };
        Self {
            request_type: request_type.into(),
            request: REQ_GET_DESCRIPTOR,
            value: u16::from_be_bytes([DESCRIPTOR_DEVICE, 0]),
            index: 0,
            length,
        }
    }

    /// Raw bytes in wire order.
    pub fn to_bytes(&self) -> [u8; 8] {
        let [value_lo, value_hi] = self.value.to_le_bytes();
        let [index_lo, index_hi] = self.index.to_le_bytes();
        let [length_lo, length_hi] = self.length.to_le_bytes();
        [
            self.request_type,
            self.request,
            value_lo,
            value_hi,
            index_lo,
            index_hi,
            length_lo,
            length_hi,
        ]
    }
}

/// Write `data` into the endpoint-0 FIFO, one byte at a time.
pub fn write_fifo(io: &mut impl RegisterIo, data: &[u8]) -> Result<(), Error> {
    debug!(len = data.len(), "writing endpoint 0 FIFO");
    for &byte in data {
        io.write8(FIFO_EP0, byte)?;
    }
    Ok(())
}

/// Send `packet` as a SETUP transaction on endpoint 0.
///
/// The packet is loaded into the FIFO, then SETUPPKT and TXPKTRDY are set in CSR0
/// with a read-modify-write so the other CSR0 bits are kept.
pub fn inject_setup(io: &mut impl RegisterIo, packet: &SetupPacket) -> Result<(), Error> {
    debug!(?packet, "injecting setup packet");
    write_fifo(io, &packet.to_bytes())?;
    let mut csr0 = io.read16(CSR0)?;
    debug!("csr0 before setup: {csr0:#06x}");
    csr0.set_bit(CSR0_H_SETUPPKT, true);
    csr0.set_bit(CSR0_TXPKTRDY, true);
    io.write16(CSR0, csr0)?;
    Ok(())
}

/// Test packet from section 7.1.20 of the USB 2.0 specification.
///
/// SYNC, the DATA0 PID, CRC16 and EOP are added by the controller.
pub const TEST_PACKET: [u8; 53] = [
    // JKJKJKJK x9
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
    // JJKKJJKK x8
    0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa, 0xaa,
    // JJJJKKKK x8
    0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee, 0xee,
    // JJJJJJJKKKKKKK x8
    0xfe, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
    // JJJJJJJK x8
    0x7f, 0xbf, 0xdf, 0xef, 0xf7, 0xfb, 0xfd,
    // JKKKKKKK x10, JK
    0xfc, 0x7e, 0xbf, 0xdf, 0xef, 0xf7, 0xfb, 0xfd, 0x7e,
];

/// Load the test packet into endpoint 0 ready for the TEST_PACKET test mode.
///
/// CSR0 is overwritten with TXPKTRDY alone.
pub fn load_test_packet(io: &mut impl RegisterIo) -> Result<(), Error> {
    io.write8(INDEX, 0)?;
    write_fifo(io, &TEST_PACKET)?;
    let mut csr0 = 0u16;
    csr0.set_bit(CSR0_TXPKTRDY, true);
    io.write16(CSR0, csr0)?;
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::io::RegisterFile;

    #[test]
    fn canned_request_matches_usb_layout() {
        let packet = SetupPacket::get_device_descriptor(0x40);
        assert_eq!(packet.request_type, 0x80);
        assert_eq!(packet.request, 6);
        assert_eq!(packet.value, 0x0100);
        assert_eq!(packet.index, 0);
        assert_eq!(
            packet.to_bytes(),
            [0x80, 0x06, 0x00, 0x01, 0x00, 0x00, 0x40, 0x00]
        );
    }

    #[test]
    fn request_type_bits() {
        let class_out_interface = RequestType {
            direction: Direction::HostToDevice,
            kind: RequestKind::Class,
            recipient: Recipient::Interface,
        };
        assert_eq!(u8::from(class_out_interface), 0x21);
        let vendor_in_other = RequestType {
            direction: Direction::DeviceToHost,
            kind: RequestKind::Vendor,
            recipient: Recipient::Other,
        };
        assert_eq!(u8::from(vendor_in_other), 0xc3);
    }

    #[test]
    fn inject_writes_fifo_then_sets_csr0_bits() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        // Pre-existing CSR0 bit that must survive the read-modify-write.
        regs.write16(CSR0, 0x0100)?;
        regs.clear_journal();

        let packet = SetupPacket::get_device_descriptor(0x40);
        inject_setup(&mut regs, &packet)?;

        let writes: Vec<_> = regs.writes().collect();
        let fifo: Vec<u8> = writes[..8]
            .iter()
            .map(|&(offset, width, value)| {
                assert_eq!((offset, width), (FIFO_EP0, 8));
                value as u8
            })
            .collect();
        assert_eq!(fifo, packet.to_bytes());
        assert_eq!(writes[8], (CSR0, 16, 0x010a));
        assert_eq!(writes.len(), 9);
        Ok(())
    }

    #[test]
    fn test_packet_is_loaded_on_endpoint_zero() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        regs.write16(CSR0, 0xffff)?;
        regs.clear_journal();
        load_test_packet(&mut regs)?;

        let writes: Vec<_> = regs.writes().collect();
        assert_eq!(writes.first(), Some(&(INDEX, 8, 0)));
        assert_eq!(writes.len(), 1 + TEST_PACKET.len() + 1);
        assert_eq!(writes.last(), Some(&(CSR0, 16, 0x0002)));
        Ok(())
    }
}
