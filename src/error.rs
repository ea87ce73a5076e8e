//! Errors surfaced by the transaction engine.

use crate::codec::CodecError;
use crate::header::TlpHeader;
use crate::host_memory::MemStatus;

/// A protocol rule broken by a TLP, or by a request handed to the engine.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Violation {
    #[error("expected EOP with {0}")]
    ExpectedEop(&'static str),
    #[error("premature end of {0}")]
    PrematureEop(&'static str),
    #[error("unsupported TLP type")]
    UnsupportedType,
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("interrupt vector {vector} out of range (max {max})")]
    IrqOutOfRange { vector: u16, max: u32 },

    #[error("unexpected completion without data")]
    CompletionWithoutData,
    #[error("illegal MMIO read response tag")]
    MmioTagRange,
    #[error("split MMIO completion not supported")]
    SplitMmioCompletion,
    #[error("MMIO completion larger than max payload bytes ({0})")]
    MmioCompletionTooLarge(u32),
    #[error("MMIO completion larger than 64 bytes not supported")]
    MmioCompletionOver64,
    #[error("MMIO read response tag is not active")]
    MmioTagInactive,

    #[error("{mode} DMA {op} larger than max payload bytes ({max})")]
    TooLong {
        mode: &'static str,
        op: &'static str,
        max: u32,
    },
    #[error("DMA {0} length is 0")]
    ZeroLength(&'static str),
    #[error("DMA write first_be is 0")]
    WriteFirstBeZero,
    #[error("DMA {0} last_be must be 0 on single DWORD requests")]
    LastBeOnSingleDword(&'static str),
    #[error("DMA {0} last_be is 0 on a multiple DWORD request")]
    LastBeZero(&'static str),
    #[error("PCIe does not allow 64 bit {0} when address fits in 32 bits")]
    NeedlessAddr64(&'static str),
    #[error("ATS translation request not allowed on writes")]
    AtsOnWrite,
    #[error("illegal address type")]
    IllegalAddressType,

    #[error("atomic functions must be PU encoded")]
    AtomicDm,
    #[error("atomic {op} must specify {allowed} bytes")]
    AtomicLength {
        op: &'static str,
        allowed: &'static str,
    },
    #[error("FBE/LBE fields are reserved in atomic functions and must be 0")]
    AtomicByteEnables,
    #[error("DMA read first_be is 0 and not a zero-length read (fence)")]
    ReadFirstBeZero,
    #[error("ATS translation request {0}")]
    AtsRequest(&'static str),
    #[error("data mover DMA reads are not supported")]
    DmRead,
    #[error("illegal DMA read request tag")]
    DmaTagRange,
    #[error("no available emulated mapped read tags")]
    TagMapperExhausted,
    #[error("DMA read request tag already in use")]
    DmaTagBusy,
    #[error("illegal byte enables for a {0} DWORD read")]
    ReadByteEnables(u32),

    #[error("MMIO width of {0} bits not supported")]
    MmioWidth(u32),
    #[error("MMIO read slot {slot} exceeds max MMIO read index ({max})")]
    MmioSlotRange { slot: u16, max: u32 },
    #[error("MMIO read slot {0} already busy")]
    MmioSlotBusy(u16),

    #[error("host memory read response for inactive tag {0}")]
    ReadResponseTag(u16),
    #[error("host memory read response carries {got} bytes, expected {expected}")]
    ReadResponseLength { got: usize, expected: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Fatal. The engine stops processing traffic.
    #[error("cycle {cycle}: {violation}")]
    Protocol {
        cycle: u64,
        violation: Violation,
        header: Option<TlpHeader>,
    },
    #[error("engine halted by an earlier protocol violation")]
    Halted,
    /// The host memory collaborator refused an access. The engine keeps
    /// running.
    #[error("{access} error: {status} (PA {pa:#x}, VA {va:#x})")]
    MemoryAccess {
        access: &'static str,
        status: MemStatus,
        pa: u64,
        va: u64,
    },
    #[error("host memory service disconnected")]
    Disconnected,
}

impl EngineError {
    pub fn violation(&self) -> Option<&Violation> {
        match self {
            EngineError::Protocol { violation, .. } => Some(violation),
            _ => None,
        }
    }
}
