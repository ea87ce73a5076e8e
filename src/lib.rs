//! Transaction-layer core of a PCIe hardware/software co-simulation bridge.
//!
//! An RTL simulation of a PCIe-attached accelerator (the AFU) exchanges TLPs
//! with an emulated host through [`engine::TransactionEngine`], which is
//! called once per simulated clock edge in each direction. DMA traffic is
//! served by a host-memory collaborator over channels ([`host_memory`]) that
//! resolves device-visible addresses through the simulated [`page_table`].

use std::fmt;

pub mod ats;
pub mod codec;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod header;
pub mod host_memory;
pub mod page_table;
mod parser;
pub mod rand;
pub mod wire;

pub use codec::{pack, unpack};
pub use config::{RuntimeOptions, StreamConfig, StreamParams};
pub use engine::TransactionEngine;
pub use header::TlpHeader;
pub use page_table::PageTable;
pub use wire::Flit;

/// Byte 0 bits 7:5
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq)]
enum Fmt {
    Dw3NoData = 0b000,
    Dw4NoData = 0b001,
    Dw3 = 0b010,
    Dw4 = 0b011,
    Prefix = 0b100,
}

impl TryFrom<u8> for Fmt {
    type Error = UnknownFmtType;
    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0b000 => Ok(Fmt::Dw3NoData),
            0b001 => Ok(Fmt::Dw4NoData),
            0b010 => Ok(Fmt::Dw3),
            0b011 => Ok(Fmt::Dw4),
            0b100 => Ok(Fmt::Prefix),
            _ => Err(UnknownFmtType(value << 5)),
        }
    }
}

/// Raised when the 8-bit fmt/type field names no TLP this bridge knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("unknown TLP fmt/type {0:#04x}")]
pub struct UnknownFmtType(pub u8);

/// The type of the tlp, tightly coupled with TYPE[4:0] field and FMT[2:0]
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum PacketType {
    MemoryRead,
    MemoryReadLock,
    MemoryWrite,
    IoRead,
    IoWrite,
    Config0Read,
    Config0Write,
    Config1Read,
    Config1Write,
    /// Vendor interrupt request, carried in the routed-to-root-complex message
    /// encoding.
    Interrupt,
    Message(u8),
    MessageData(u8),
    Completion,
    CompletionData,
    CompletionLocked,
    CompletionLockedData,
    FetchAddAtomic,
    SwapAtomic,
    CasAtomic,
    LocalPrefix(u8),
    EndToEndPrefix(u8),
}

#[derive(Debug, PartialEq, Clone, Copy)]
pub struct PacketFormat {
    pub kind: PacketType,
    fmt: Fmt,
}

impl PacketFormat {
    /// True when the header carries a 64 bit address (4 DW format).
    pub fn is_4dw(&self) -> bool {
        matches!(self.fmt, Fmt::Dw4NoData | Fmt::Dw4)
    }
}

impl TryFrom<u8> for PacketFormat {
    type Error = UnknownFmtType;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        use Fmt::*;
        use PacketType::*;

        let _type = value & 0b11111;
        let fmt = Fmt::try_from(value >> 5)?;

        Ok(PacketFormat {
            kind: match (fmt, _type) {
                (Dw3NoData, 0b00000) | (Dw4NoData, 0b00000) => Ok(MemoryRead),
                (Dw3NoData, 0b00001) | (Dw4NoData, 0b00001) => Ok(MemoryReadLock),
                (Dw3, 0b00000) | (Dw4, 0b00000) => Ok(MemoryWrite),
                (Dw3NoData, 0b00010) => Ok(IoRead),
                (Dw3, 0b00010) => Ok(IoWrite),
                (Dw3NoData, 0b00100) => Ok(Config0Read),
                (Dw3, 0b00100) => Ok(Config0Write),
                (Dw3NoData, 0b00101) => Ok(Config1Read),
                (Dw3, 0b00101) => Ok(Config1Write),
                (Dw4NoData, 0b10000) => Ok(Interrupt),
                (Dw4NoData, _) if _type >> 3 == 0b10 => Ok(Message(_type & 0b111)),
                (Dw4, _) if _type >> 3 == 0b10 => Ok(MessageData(_type & 0b111)),
                (Dw3NoData, 0b01010) => Ok(Completion),
                (Dw3, 0b01010) => Ok(CompletionData),
                (Dw3NoData, 0b01011) => Ok(CompletionLocked),
                (Dw3, 0b01011) => Ok(CompletionLockedData),
                (Dw3, 0b01100) | (Dw4, 0b01100) => Ok(FetchAddAtomic),
                (Dw3, 0b01101) | (Dw4, 0b01101) => Ok(SwapAtomic),
                (Dw3, 0b01110) | (Dw4, 0b01110) => Ok(CasAtomic),
                (Prefix, _) if _type >> 4 == 0 => Ok(LocalPrefix(_type & 0b1111)),
                (Prefix, _) if _type >> 4 == 1 => Ok(EndToEndPrefix(_type & 0b1111)),
                _ => Err(UnknownFmtType(value)),
            }?,
            fmt,
        })
    }
}

/// The raw 8-bit fmt/type byte of a TLP header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct FmtType(pub u8);

impl FmtType {
    pub const MEM_READ32: FmtType = FmtType(0b000_00000);
    pub const MEM_READ64: FmtType = FmtType(0b001_00000);
    pub const MEM_WRITE32: FmtType = FmtType(0b010_00000);
    pub const MEM_WRITE64: FmtType = FmtType(0b011_00000);
    pub const CFG_WRITE: FmtType = FmtType(0b010_00100);
    pub const INTR: FmtType = FmtType(0b001_10000);
    pub const CPL: FmtType = FmtType(0b000_01010);
    pub const CPLD: FmtType = FmtType(0b010_01010);
    pub const FETCH_ADD32: FmtType = FmtType(0b010_01100);
    pub const FETCH_ADD64: FmtType = FmtType(0b011_01100);
    pub const SWAP32: FmtType = FmtType(0b010_01101);
    pub const SWAP64: FmtType = FmtType(0b011_01101);
    pub const CAS32: FmtType = FmtType(0b010_01110);
    pub const CAS64: FmtType = FmtType(0b011_01110);

    const TYPE_CPL: u8 = 0b01010;
    const TYPE_MEM_RW: u8 = 0b00000;

    pub fn is_addr64(self) -> bool {
        self.0 & 0x20 != 0
    }

    pub fn has_data(self) -> bool {
        self.0 & 0x40 != 0
    }

    pub fn is_completion(self) -> bool {
        self.0 & 0x1f == Self::TYPE_CPL
    }

    pub fn is_interrupt(self) -> bool {
        self == Self::INTR
    }

    pub fn is_atomic(self) -> bool {
        self.has_data() && (self.0 & 0x1c) == 0x0c
    }

    pub fn is_atomic_cas(self) -> bool {
        self == Self::CAS32 || self == Self::CAS64
    }

    /// Message requests. Note that the interrupt encoding is also a message.
    pub fn is_msg(self) -> bool {
        self.0 & 0xb8 == 0x30
    }

    pub fn is_mem_req(self) -> bool {
        self.0 & 0x1f == Self::TYPE_MEM_RW || self.is_atomic()
    }

    pub fn is_mwr(self) -> bool {
        self.is_mem_req() && self.has_data()
    }

    pub fn is_mrd(self) -> bool {
        self.is_mem_req() && !self.has_data()
    }

    /// Six character mnemonic used in stream traces.
    pub fn mnemonic(self) -> &'static str {
        match self {
            Self::MEM_READ32 => "MRd32 ",
            Self::MEM_READ64 => "MRd64 ",
            Self::MEM_WRITE32 => "MWr32 ",
            Self::MEM_WRITE64 => "MWr64 ",
            Self::CFG_WRITE => "CfgWr ",
            Self::INTR => "Intr  ",
            Self::CPL => "Cpl   ",
            Self::CPLD => "CplD  ",
            Self::FETCH_ADD32 => "FAdd32",
            Self::FETCH_ADD64 => "FAdd64",
            Self::SWAP32 => "Swap32",
            Self::SWAP64 => "Swap64",
            Self::CAS32 => "Cas32 ",
            Self::CAS64 => "Cas64 ",
            _ => "Unknown",
        }
    }

    pub fn packet_format(self) -> Result<PacketFormat, UnknownFmtType> {
        PacketFormat::try_from(self.0)
    }
}

impl fmt::Display for FmtType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

impl From<u8> for FmtType {
    fn from(v: u8) -> Self {
        FmtType(v)
    }
}

#[cfg(test)]
mod tests {
    use crate::*;
    #[test]
    fn packet_type() {
        let format = PacketFormat::try_from(0b01101100u8).unwrap();
        assert_eq!(
            format,
            PacketFormat {
                kind: PacketType::FetchAddAtomic,
                fmt: Fmt::Dw4
            }
        );

        let format = PacketFormat::try_from(0b00110110u8).unwrap();
        assert_eq!(
            format,
            PacketFormat {
                kind: PacketType::Message(0b110),
                fmt: Fmt::Dw4NoData
            }
        );

        assert_eq!(
            FmtType::INTR.packet_format().unwrap().kind,
            PacketType::Interrupt
        );
        assert!(PacketFormat::try_from(0b01010110).is_err());
    }

    #[test]
    fn classification() {
        assert!(FmtType::MEM_READ64.is_mrd());
        assert!(FmtType::MEM_READ64.is_addr64());
        assert!(FmtType::MEM_WRITE32.is_mwr());
        assert!(!FmtType::MEM_WRITE32.is_addr64());
        assert!(FmtType::CPLD.is_completion() && FmtType::CPLD.has_data());
        assert!(FmtType::CPL.is_completion() && !FmtType::CPL.has_data());

        for atomic in [
            FmtType::FETCH_ADD32,
            FmtType::FETCH_ADD64,
            FmtType::SWAP32,
            FmtType::SWAP64,
            FmtType::CAS32,
            FmtType::CAS64,
        ] {
            assert!(atomic.is_atomic(), "{}", atomic);
            assert!(atomic.is_mem_req());
            assert!(atomic.is_mwr());
        }
        assert!(FmtType::CAS64.is_atomic_cas());
        assert!(!FmtType::SWAP64.is_atomic_cas());

        assert!(FmtType::INTR.is_interrupt());
        assert!(FmtType::INTR.is_msg());
        assert!(!FmtType::INTR.is_mem_req());
        assert_eq!(FmtType(0x7f).mnemonic(), "Unknown");
    }
}
