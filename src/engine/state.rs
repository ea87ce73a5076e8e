//! Outstanding request bookkeeping.

use std::sync::Arc;

use crate::header::TlpHeader;

#[derive(Debug, Clone, Copy, Default)]
pub(super) struct MmioReadState {
    pub busy: bool,
    pub start_cycle: u64,
    pub tid: u16,
}

#[derive(Debug, Clone, Default)]
pub(super) struct DmaReadState {
    pub busy: bool,
    pub start_cycle: u64,
    /// The request as received, with CAS lengths already halved.
    pub req: Option<TlpHeader>,
}

/// DMA read slots, indexed by tag. With tag mapping emulated, slots are
/// handed out from a LIFO free list instead and the AFU's tag is kept only
/// in the request header.
#[derive(Debug)]
pub(super) struct ReadSlots {
    pub states: Vec<DmaReadState>,
    free: Vec<usize>,
    mapped: bool,
}

impl ReadSlots {
    pub fn new(n: usize, mapped: bool) -> Self {
        ReadSlots {
            states: vec![DmaReadState::default(); n],
            free: (0..n).rev().collect(),
            mapped,
        }
    }

    pub fn mapped(&self) -> bool {
        self.mapped
    }

    pub fn has_free(&self) -> bool {
        !self.mapped || !self.free.is_empty()
    }

    pub fn pop_free(&mut self) -> Option<usize> {
        self.free.pop()
    }

    /// Marks `slot` idle, returning it to the free list when mapping tags.
    pub fn release(&mut self, slot: usize) {
        let state = &mut self.states[slot];
        if !state.busy {
            return;
        }
        state.busy = false;
        if self.mapped {
            self.free.push(slot);
        }
    }
}

/// One completion packet still to be sent for a DMA read. All packets of a
/// request share its data.
#[derive(Debug, Clone)]
pub(super) struct ReadCompletion {
    pub slot: usize,
    pub data: Arc<[u32]>,
    pub len_bytes: u32,
    /// Offset of this packet's first DWORD within `data`.
    pub start_dw: u32,
    /// Bytes remaining for the request, this packet included.
    pub byte_count: u32,
    pub is_first: bool,
    pub is_last: bool,
}
