//! Sized bus accesses.

/// Width of a single bus access.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum AccessWidth {
    Byte,
    Word,
    Dword,
    Qword,
}

impl AccessWidth {
    /// Size in bytes.
    #[must_use]
    pub const fn bytes(self) -> u8 {
        match self {
            Self::Byte => 1,
            Self::Word => 2,
            Self::Dword => 4,
            Self::Qword => 8,
        }
    }

    #[must_use]
    pub const fn bits(self) -> u32 {
        self.bytes() as u32 * 8
    }

    /// All-ones value of this width.
    #[must_use]
    pub const fn mask(self) -> u64 {
        match self {
            Self::Qword => u64::MAX,
            _ => (1u64 << self.bits()) - 1,
        }
    }

    #[must_use]
    pub const fn from_bytes(bytes: u8) -> Option<Self> {
        match bytes {
            1 => Some(Self::Byte),
            2 => Some(Self::Word),
            4 => Some(Self::Dword),
            8 => Some(Self::Qword),
            _ => None,
        }
    }

    /// The next narrower width, or `None` for a byte.
    #[must_use]
    pub const fn half(self) -> Option<Self> {
        match self {
            Self::Byte => None,
            Self::Word => Some(Self::Byte),
            Self::Dword => Some(Self::Word),
            Self::Qword => Some(Self::Dword),
        }
    }
}

/// Memory and I/O bus interface.
///
/// Devices reach memory and registers through this trait. The implementor
/// decodes the address and routes the access to whatever is mapped there.
pub trait Bus {
    /// Read `width` bytes starting at `address`.
    fn read(&mut self, address: u64, width: AccessWidth) -> u64;

    /// Write the low `width` bytes of `value` starting at `address`.
    fn write(&mut self, address: u64, width: AccessWidth, value: u64);

    fn read_u8(&mut self, address: u64) -> u8 {
        self.read(address, AccessWidth::Byte) as u8
    }

    fn write_u8(&mut self, address: u64, value: u8) {
        self.write(address, AccessWidth::Byte, u64::from(value));
    }

    fn read_u16(&mut self, address: u64) -> u16 {
        self.read(address, AccessWidth::Word) as u16
    }

    fn write_u16(&mut self, address: u64, value: u16) {
        self.write(address, AccessWidth::Word, u64::from(value));
    }
}
