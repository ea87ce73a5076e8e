//! PCIe address translation service helpers: translation entry encoding and
//! the invalidation tag (itag) allocator.

use log::error;
use parking_lot::{Condvar, Mutex};

pub const ITAGS: usize = 32;
/// Cycles an invalidation may stay outstanding before it is reported.
pub const ITAG_TIMEOUT_CYCLES: u64 = 10_000;

/// Translation entry permission bits.
pub const ATS_READ: u32 = 1 << 0;
pub const ATS_WRITE: u32 = 1 << 1;

/// Encodes a page address and size for ATS completions and invalidation
/// requests (PCIe 10.2.3.2). The size is a mask of ones starting at the S bit
/// (bit 11), and the result is in wire byte order.
pub fn encode_translation(pa: u64, page_len: u64, flags: u32) -> u64 {
    if pa == 0 {
        return 0;
    }
    let size_mask = (page_len >> 12).saturating_sub(1);
    let entry = (pa & !0xfff) | flags as u64 | (size_mask << 11);
    entry.swap_bytes()
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ItagError {
    #[error("released itag {0} is not busy")]
    NotBusy(u8),
    #[error("itag {tag} completion count {got} differs from the first response ({expected})")]
    CountMismatch { tag: u8, expected: u8, got: u8 },
    #[error("ATS invalidation request has no completion (itag {tag}, {cycles} cycles)")]
    Timeout { tag: u8, cycles: u64 },
}

#[derive(Debug, Clone, Copy, Default)]
struct ItagState {
    set_cycle: u64,
    /// Learned from the first response.
    expected: Option<u8>,
    received: u8,
}

#[derive(Debug, Default)]
struct Itags {
    busy: u32,
    state: [ItagState; ITAGS],
    cycle: u64,
}

impl Itags {
    fn take_free(&mut self) -> Option<u8> {
        if self.busy == u32::MAX {
            return None;
        }
        let tag = (!self.busy).trailing_zeros() as u8;
        self.state[tag as usize] = ItagState {
            set_cycle: self.cycle,
            expected: None,
            received: 0,
        };
        self.busy |= 1 << tag;
        Some(tag)
    }
}

/// Tags for outstanding ATS invalidation requests. Tags are allocated by the
/// host side and released by responses arriving from the simulation, possibly
/// on another thread.
#[derive(Debug, Default)]
pub struct ItagAllocator {
    inner: Mutex<Itags>,
    released: Condvar,
}

impl ItagAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Blocks until a tag is free.
    pub fn alloc(&self) -> u8 {
        let mut inner = self.inner.lock();
        loop {
            if let Some(tag) = inner.take_free() {
                return tag;
            }
            self.released.wait(&mut inner);
        }
    }

    pub fn try_alloc(&self) -> Option<u8> {
        self.inner.lock().take_free()
    }

    /// Records one invalidation completion for every tag set in `tag_vec`.
    /// A completion count of 0 means 8.
    pub fn free(&self, tag_vec: u32, cc: u8) -> Result<(), ItagError> {
        let cc = if cc == 0 { 8 } else { cc };
        let mut inner = self.inner.lock();

        for tag in (0..ITAGS as u8).filter(|t| tag_vec & (1 << t) != 0) {
            if inner.busy & (1 << tag) == 0 {
                error!("released itag {} is not busy", tag);
                return Err(ItagError::NotBusy(tag));
            }

            let state = &mut inner.state[tag as usize];
            match state.expected {
                None => state.expected = Some(cc),
                Some(expected) if expected != cc => {
                    error!(
                        "itag {}: cc must be the same on all responses ({}, expected {})",
                        tag, cc, expected
                    );
                    return Err(ItagError::CountMismatch {
                        tag,
                        expected,
                        got: cc,
                    });
                }
                Some(_) => {}
            }
            state.received += 1;

            if state.received == cc {
                inner.busy &= !(1 << tag);
                self.released.notify_all();
            }
        }
        Ok(())
    }

    /// Advances the allocator's notion of time and reports the first tag that
    /// has been busy for more than [`ITAG_TIMEOUT_CYCLES`]. Diagnostic only,
    /// the tag stays allocated.
    pub fn check_timeouts(&self, cycle: u64) -> Result<(), ItagError> {
        let mut inner = self.inner.lock();
        inner.cycle = cycle;

        for tag in 0..ITAGS as u8 {
            if inner.busy & (1 << tag) == 0 {
                continue;
            }
            let cycles = cycle.saturating_sub(inner.state[tag as usize].set_cycle);
            if cycles > ITAG_TIMEOUT_CYCLES {
                error!("PCIe ATS invalidation request has no completion (itag {})", tag);
                return Err(ItagError::Timeout { tag, cycles });
            }
        }
        Ok(())
    }

    pub fn busy_vector(&self) -> u32 {
        self.inner.lock().busy
    }
}
