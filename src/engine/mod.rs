//! The TLP transaction engine.
//!
//! The simulator calls [`TransactionEngine::afu_to_host`] for every valid
//! beat the AFU drives, [`TransactionEngine::afu_to_host_tready`] to learn
//! whether the host accepts a beat, and [`TransactionEngine::host_to_afu`]
//! once per cycle for the beat to present to the AFU. Nothing blocks. DMA
//! requests go to the host memory collaborator and their responses are
//! collected on later cycles.
//!
//! Every stream beat is traced at debug level under the
//! `pcie_tlp_cosim::stream` target.

mod afu_tx;
mod cpl_queue;
mod host_tx;
mod state;

use std::collections::VecDeque;

use log::error;

use crate::config::{RuntimeOptions, StreamConfig};
use crate::device::{InterruptSink, MmioRequest, MmioResponder};
use crate::error::{EngineError, Violation};
use crate::header::TlpHeader;
use crate::host_memory::HostMemoryPort;
use crate::rand::{self, RandomSource};
use crate::wire::Flit;

use cpl_queue::CompletionQueue;
use state::{MmioReadState, ReadCompletion, ReadSlots};

pub(crate) const STREAM_TARGET: &str = "pcie_tlp_cosim::stream";

/// MMIO reads are answered by a single completion of at most 64 bytes.
const MAX_MMIO_WIDTH: u32 = 512;

/// Packet in flight from the AFU.
#[derive(Debug)]
struct PartialPacket {
    hdr: TlpHeader,
    /// Payload DWORDs received so far.
    payload: Vec<u32>,
}

#[derive(Debug, Default)]
enum AfuTxState {
    #[default]
    Sop,
    Cpl(PartialPacket),
    Mem(PartialPacket),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum HostTxState {
    #[default]
    Sop,
    Cpl,
    Mem,
}

pub struct TransactionEngine {
    cfg: StreamConfig,
    options: RuntimeOptions,
    rng: Box<dyn RandomSource + Send>,
    memory: HostMemoryPort,
    mmio: Box<dyn MmioResponder + Send>,
    irq: Box<dyn InterruptSink + Send>,

    halted: bool,
    cycle: u64,

    afu_state: AfuTxState,
    host_state: HostTxState,

    mmio_reads: Vec<MmioReadState>,
    mmio_queue: VecDeque<MmioRequest>,
    last_mmio_cycle: Option<u64>,
    /// DWORDs of the head MMIO write still to be sent.
    mmio_dw_rem: u32,

    read_slots: ReadSlots,
    cpl_queue: CompletionQueue<ReadCompletion>,
    /// DWORDs of the head completion still to be sent.
    cpl_dw_rem: u32,

    pending_reads: u32,
    pending_writes: u32,
}

impl TransactionEngine {
    pub fn new(
        cfg: StreamConfig,
        options: RuntimeOptions,
        memory: HostMemoryPort,
        mmio: impl MmioResponder + Send + 'static,
        irq: impl InterruptSink + Send + 'static,
    ) -> Self {
        let p = cfg.params();
        let mmio_reads = vec![MmioReadState::default(); p.max_outstanding_mmio_rd_reqs as usize];
        let read_slots = ReadSlots::new(
            p.max_outstanding_dma_rd_reqs as usize,
            p.emulate_tag_mapper,
        );

        TransactionEngine {
            rng: rand::from_options(&options),
            cfg,
            options,
            memory,
            mmio: Box::new(mmio),
            irq: Box::new(irq),
            halted: false,
            cycle: 0,
            afu_state: AfuTxState::Sop,
            host_state: HostTxState::Sop,
            mmio_reads,
            mmio_queue: VecDeque::new(),
            last_mmio_cycle: None,
            mmio_dw_rem: 0,
            read_slots,
            cpl_queue: CompletionQueue::default(),
            cpl_dw_rem: 0,
            pending_reads: 0,
            pending_writes: 0,
        }
    }

    /// Replaces the random source behind back-pressure and reordering.
    pub fn with_random(mut self, rng: impl RandomSource + Send + 'static) -> Self {
        self.rng = Box::new(rng);
        self
    }

    pub fn config(&self) -> &StreamConfig {
        &self.cfg
    }

    pub fn is_halted(&self) -> bool {
        self.halted
    }

    /// DMA reads sent to host memory and not yet answered.
    pub fn pending_reads(&self) -> u32 {
        self.pending_reads
    }

    pub fn pending_writes(&self) -> u32 {
        self.pending_writes
    }

    /// Completion packets waiting to be sent to the AFU.
    pub fn queued_completions(&self) -> usize {
        self.cpl_queue.len()
    }

    /// True while the read in `slot` has completions left to send.
    pub fn dma_read_busy(&self, slot: usize) -> bool {
        self.read_slots
            .states
            .get(slot)
            .map(|s| s.busy)
            .unwrap_or(false)
    }

    /// Whether the host accepts an AFU beat this cycle.
    pub fn afu_to_host_tready(&mut self, _cycle: u64) -> bool {
        if self.halted {
            return false;
        }
        (self.rng.next_u32() & 0xff) < 0xf0 && self.read_slots.has_free()
    }

    /// Queues a host MMIO access for transmission to the AFU.
    pub fn new_mmio_request(&mut self, req: MmioRequest) -> Result<(), EngineError> {
        self.check_halted()?;

        let width = req.width_bits;
        if width % 32 != 0 || !(32..=MAX_MMIO_WIDTH).contains(&width) {
            return Err(self.fail(None, Violation::MmioWidth(width)));
        }
        if req.write && req.data.len() < req.len_bytes() as usize {
            return Err(self.fail(None, Violation::MmioWidth(req.data.len() as u32 * 8)));
        }

        if !req.write {
            let max = self.mmio_reads.len() as u32;
            let slot = req.slot_idx;
            if slot as u32 >= max {
                return Err(self.fail(None, Violation::MmioSlotRange { slot, max }));
            }
            let cycle = self.cycle;
            let state = &mut self.mmio_reads[slot as usize];
            if state.busy {
                return Err(self.fail(None, Violation::MmioSlotBusy(slot)));
            }
            state.busy = true;
            state.start_cycle = cycle;
            state.tid = req.tid;
        }

        self.mmio_queue.push_back(req);
        Ok(())
    }

    /// Returns both directions to the start-of-packet state and drops any
    /// packet in progress. Outstanding requests are kept.
    pub fn reset(&mut self) {
        self.afu_state = AfuTxState::Sop;
        self.host_state = HostTxState::Sop;
        self.mmio_dw_rem = 0;
        self.cpl_dw_rem = 0;
    }

    fn check_halted(&self) -> Result<(), EngineError> {
        if self.halted {
            return Err(EngineError::Halted);
        }
        Ok(())
    }

    /// Reports a fatal violation and stops the engine.
    fn fail(&mut self, hdr: Option<&TlpHeader>, violation: Violation) -> EngineError {
        match hdr {
            Some(hdr) => error!("cycle {}: AFU Tx TLP - {}:\n  {}", self.cycle, violation, hdr),
            None => error!("cycle {}: {}", self.cycle, violation),
        }
        self.halted = true;
        EngineError::Protocol {
            cycle: self.cycle,
            violation,
            header: hdr.copied(),
        }
    }

    fn fail_flit(&mut self, hdr: Option<&TlpHeader>, flit: &Flit, violation: Violation) -> EngineError {
        let err = self.fail(hdr, violation);
        error!("  {}", flit);
        err
    }
}

#[cfg(test)]
mod tests;
