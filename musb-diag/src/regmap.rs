//! Named register table and the textual register dump built from it.

use crate::Error;
use crate::io::RegisterIo;

/// Access width of a register.
///
/// The width selects which read primitive is used for the dump, and how many hex
/// digits the value is printed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RegisterWidth {
    /// 8-bit register.
    Bits8,
    /// 16-bit register.
    Bits16,
    /// 32-bit register.
    Bits32,
}

impl RegisterWidth {
    /// Width in bits.
    pub const fn bits(self) -> u8 {
        match self {
            RegisterWidth::Bits8 => 8,
            RegisterWidth::Bits16 => 16,
            RegisterWidth::Bits32 => 32,
        }
    }

    /// Number of hex digits needed to print a value of this width.
    pub const fn hex_digits(self) -> usize {
        self.bits() as usize / 4
    }
}

impl From<RegisterWidth> for u8 {
    fn from(value: RegisterWidth) -> Self {
        value.bits()
    }
}

/// Description of one named register in the dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterDescriptor {
    /// Short register name, as printed in the dump.
    pub name: &'static str,
    /// Byte offset into the register block.
    pub offset: usize,
    /// Access width.
    pub width: RegisterWidth,
}

impl RegisterDescriptor {
    const fn new(name: &'static str, offset: usize, width: RegisterWidth) -> Self {
        Self {
            name,
            offset,
            width,
        }
    }

    /// Read the register's current value, zero-extended to 32 bits.
    pub fn read(&self, io: &mut impl RegisterIo) -> Result<u32, Error> {
        Ok(match self.width {
            RegisterWidth::Bits8 => io.read8(self.offset)?.into(),
            RegisterWidth::Bits16 => io.read16(self.offset)?.into(),
            RegisterWidth::Bits32 => io.read32(self.offset)?,
        })
    }
}

use RegisterWidth::{Bits8 as B8, Bits16 as B16, Bits32 as B32};

/// Registers included in the dump, in output order.
pub static REGISTER_MAP: &[RegisterDescriptor] = &[
    RegisterDescriptor::new("FAddr", 0x00, B8),
    RegisterDescriptor::new("Power", 0x01, B8),
    RegisterDescriptor::new("Frame", 0x0c, B16),
    RegisterDescriptor::new("Index", 0x0e, B8),
    RegisterDescriptor::new("Testmode", 0x0f, B8),
    RegisterDescriptor::new("TxMaxPp", 0x10, B16),
    RegisterDescriptor::new("TxCSRp", 0x12, B16),
    RegisterDescriptor::new("RxMaxPp", 0x14, B16),
    RegisterDescriptor::new("RxCSR", 0x16, B16),
    RegisterDescriptor::new("RxCount", 0x18, B16),
    RegisterDescriptor::new("ConfigData", 0x1f, B8),
    RegisterDescriptor::new("DevCtl", 0x60, B8),
    RegisterDescriptor::new("MISC", 0x61, B8),
    RegisterDescriptor::new("TxFIFOsz", 0x62, B8),
    RegisterDescriptor::new("RxFIFOsz", 0x63, B8),
    RegisterDescriptor::new("TxFIFOadd", 0x64, B16),
    RegisterDescriptor::new("RxFIFOadd", 0x66, B16),
    RegisterDescriptor::new("VControl", 0x68, B32),
    RegisterDescriptor::new("HWVers", 0x6c, B16),
    RegisterDescriptor::new("EPInfo", 0x78, B8),
    RegisterDescriptor::new("RAMInfo", 0x79, B8),
    RegisterDescriptor::new("LinkInfo", 0x7a, B8),
    RegisterDescriptor::new("VPLen", 0x7b, B8),
    RegisterDescriptor::new("HS_EOF1", 0x7c, B8),
    RegisterDescriptor::new("FS_EOF1", 0x7d, B8),
    RegisterDescriptor::new("LS_EOF1", 0x7e, B8),
    RegisterDescriptor::new("SOFT_RST", 0x7f, B8),
    RegisterDescriptor::new("DMA_CNTLch0", 0x204, B16),
    RegisterDescriptor::new("DMA_ADDRch0", 0x208, B32),
    RegisterDescriptor::new("DMA_COUNTch0", 0x20c, B32),
    RegisterDescriptor::new("DMA_CNTLch1", 0x214, B16),
    RegisterDescriptor::new("DMA_ADDRch1", 0x218, B32),
    RegisterDescriptor::new("DMA_COUNTch1", 0x21c, B32),
    RegisterDescriptor::new("DMA_CNTLch2", 0x224, B16),
    RegisterDescriptor::new("DMA_ADDRch2", 0x228, B32),
    RegisterDescriptor::new("DMA_COUNTch2", 0x22c, B32),
    RegisterDescriptor::new("DMA_CNTLch3", 0x234, B16),
    RegisterDescriptor::new("DMA_ADDRch3", 0x238, B32),
    RegisterDescriptor::new("DMA_COUNTch3", 0x23c, B32),
    RegisterDescriptor::new("DMA_CNTLch4", 0x244, B16),
    RegisterDescriptor::new("DMA_ADDRch4", 0x248, B32),
    RegisterDescriptor::new("DMA_COUNTch4", 0x24c, B32),
    RegisterDescriptor::new("DMA_CNTLch5", 0x254, B16),
    RegisterDescriptor::new("DMA_ADDRch5", 0x258, B32),
    RegisterDescriptor::new("DMA_COUNTch5", 0x25c, B32),
    RegisterDescriptor::new("DMA_CNTLch6", 0x264, B16),
    RegisterDescriptor::new("DMA_ADDRch6", 0x268, B32),
    RegisterDescriptor::new("DMA_COUNTch6", 0x26c, B32),
    RegisterDescriptor::new("DMA_CNTLch7", 0x274, B16),
    RegisterDescriptor::new("DMA_ADDRch7", 0x278, B32),
    RegisterDescriptor::new("DMA_COUNTch7", 0x27c, B32),
];

/// Snapshot of every register in [`REGISTER_MAP`].
///
/// The `Display` implementation produces the textual report: a title line, then
/// one `name: value` line per register in table order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisterDump {
    entries: Vec<(RegisterDescriptor, u32)>,
}

impl RegisterDump {
    /// Title line printed ahead of the register lines.
    pub const TITLE: &'static str = "MUSB (M)HDRC Register Dump";

    /// Read every register in `map`, in order.
    ///
    /// Only reads are performed, so this is safe to call at any time.
    pub fn capture(map: &[RegisterDescriptor], io: &mut impl RegisterIo) -> Result<Self, Error> {
        let entries = map
            .iter()
            .map(|desc| desc.read(io).map(|value| (*desc, value)))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { entries })
    }

    /// Registers and the values read from them, in table order.
    pub fn entries(&self) -> &[(RegisterDescriptor, u32)] {
        &self.entries
    }

    /// Value read for the register called `name`, if it is in the dump.
    pub fn value_of(&self, name: &str) -> Option<u32> {
        self.entries
            .iter()
            .find(|(desc, _)| desc.name == name)
            .map(|(_, value)| *value)
    }

    /// One formatted line per register, without the title.
    pub fn lines(&self) -> impl Iterator<Item = String> + '_ {
        self.entries
            .iter()
            .map(|(desc, value)| format_line(desc, *value))
    }
}

fn format_line(desc: &RegisterDescriptor, value: u32) -> String {
    format!(
        "{:<12.12}: {:0digits$x}",
        desc.name,
        value,
        digits = desc.width.hex_digits()
    )
}

impl std::fmt::Display for RegisterDump {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "{}", Self::TITLE)?;
        for line in self.lines() {
            writeln!(f, "{line}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::collections::HashSet;

    use super::*;
    use crate::io::{Access, RegisterFile};

    #[test]
    fn map_has_no_aliased_locations() {
        let mut seen = HashSet::new();
        for desc in REGISTER_MAP {
            assert!(
                seen.insert((desc.offset, desc.width)),
                "{} aliases another register",
                desc.name
            );
        }
        let names: HashSet<_> = REGISTER_MAP.iter().map(|d| d.name).collect();
        assert_eq!(names.len(), REGISTER_MAP.len());
    }

    #[test]
    fn names_fit_the_name_column() {
        assert!(REGISTER_MAP.iter().all(|d| d.name.len() <= 12));
    }

    #[test]
    fn width_selects_read_primitive() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        RegisterDump::capture(REGISTER_MAP, &mut regs)?;
        for (access, desc) in regs.journal().iter().zip(REGISTER_MAP) {
            assert_eq!(
                *access,
                Access::Read {
                    offset: desc.offset,
                    width: desc.width.bits()
                }
            );
        }
        assert_eq!(regs.journal().len(), REGISTER_MAP.len());
        Ok(())
    }

    #[test]
    fn lines_are_padded_per_width() -> Result<(), Error> {
        let mut regs = RegisterFile::new();
        regs.write8(0x01, 0x60)?;
        regs.write16(0x6c, 0x0a0b)?;
        regs.write32(0x208, 0xdead_beef)?;
        let dump = RegisterDump::capture(REGISTER_MAP, &mut regs)?;
        let lines: Vec<String> = dump.lines().collect();
        assert_eq!(lines[0], "FAddr       : 00");
        assert_eq!(lines[1], "Power       : 60");
        assert_eq!(lines[18], "HWVers      : 0a0b");
        assert_eq!(lines[28], "DMA_ADDRch0 : deadbeef");
        assert_eq!(lines[29], "DMA_COUNTch0: 00000000");
        assert_eq!(dump.value_of("VControl"), Some(0));
        Ok(())
    }

    #[test]
    fn long_names_are_truncated() {
        let desc = RegisterDescriptor::new("ABCDEFGHIJKLMNOP", 0, B8);
        assert_eq!(format_line(&desc, 0xff), "ABCDEFGHIJKL: ff");
    }

    #[test]
    fn display_starts_with_title() -> Result<(), Error> {
        let dump = RegisterDump::capture(REGISTER_MAP, &mut RegisterFile::new())?;
        let text = dump.to_string();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some(RegisterDump::TITLE));
        assert_eq!(lines.count(), REGISTER_MAP.len());
        Ok(())
    }
}
