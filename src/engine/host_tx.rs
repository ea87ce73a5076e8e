//! Host to AFU: collecting host memory responses, then emitting read
//! completions and MMIO requests one beat at a time.

use std::sync::Arc;

use log::{debug, error};

use super::state::ReadCompletion;
use super::{HostTxState, TransactionEngine, STREAM_TARGET};
use crate::codec::{self, completion_byte_count, lower_addr_byte_offset};
use crate::device::{MmioRequest, MmioResponse};
use crate::error::{EngineError, Violation};
use crate::header::{CompletionFields, HeaderBody, RequestFields, TlpHeader};
use crate::host_memory::MemStatus;
use crate::parser::HDR_DWORDS;
use crate::wire::Flit;
use crate::FmtType;

/// Minimum cycles between the starts of two MMIO requests.
const MMIO_SPACING_CYCLES: u64 = 63;
/// Minimum cycles between a DMA read request and its first completion.
const MIN_READ_LATENCY_CYCLES: u64 = 250;

/// Outcome of one attempt to drive a beat.
#[derive(Debug, Clone, Copy)]
struct Beat {
    valid: bool,
    /// The packet is finished, or was never started.
    done: bool,
}

impl Beat {
    const IDLE: Beat = Beat {
        valid: false,
        done: true,
    };
}

fn le_dwords(bytes: &[u8]) -> Vec<u32> {
    bytes
        .chunks(4)
        .map(|c| {
            let mut dw = [0u8; 4];
            dw[..c.len()].copy_from_slice(c);
            u32::from_le_bytes(dw)
        })
        .collect()
}

fn trace_beat(cycle: u64, hdr: Option<&TlpHeader>, flit: &Flit) {
    debug!(
        target: STREAM_TARGET,
        "host_to_afu: {} {} {} {}{}",
        cycle,
        if hdr.is_some() { "sop" } else { "   " },
        if flit.last { "eop" } else { "   " },
        hdr.map(|h| format!("{} ", h)).unwrap_or_default(),
        flit
    );
}

impl TransactionEngine {
    /// Collects host memory responses, then returns the beat presented to
    /// the AFU this cycle, if any. `tready` is the AFU's ready signal.
    pub fn host_to_afu(&mut self, cycle: u64, tready: bool) -> Result<Option<Flit>, EngineError> {
        self.check_halted()?;
        self.cycle = cycle;

        self.complete_dma_writes()?;
        self.receive_dma_reads()?;

        if !tready {
            return Ok(None);
        }

        let mut flit = Flit::new(&self.cfg);
        let beat = match self.host_state {
            HostTxState::Sop => {
                let mut beat = Beat::IDLE;
                if !self.mmio_queue.is_empty() {
                    beat = self.h2a_mem(&mut flit)?;
                    if !beat.done {
                        self.host_state = HostTxState::Mem;
                    }
                }
                if !beat.valid && !self.cpl_queue.is_empty() {
                    beat = self.h2a_cpld(&mut flit)?;
                    if !beat.done {
                        self.host_state = HostTxState::Cpl;
                    }
                }
                beat
            }
            HostTxState::Cpl => {
                let beat = self.h2a_cpld(&mut flit)?;
                if beat.done {
                    self.host_state = HostTxState::Sop;
                }
                beat
            }
            HostTxState::Mem => {
                let beat = self.h2a_mem(&mut flit)?;
                if beat.done {
                    self.host_state = HostTxState::Sop;
                }
                beat
            }
        };

        Ok(beat.valid.then_some(flit))
    }

    /// Write responses only report errors. Nothing goes to the AFU.
    fn complete_dma_writes(&mut self) -> Result<(), EngineError> {
        while self.pending_writes > 0 {
            let rsp = match self.memory.try_recv_write() {
                Ok(Some(rsp)) => rsp,
                Ok(None) => break,
                Err(_) => return Err(EngineError::Disconnected),
            };
            self.pending_writes -= 1;

            if rsp.status != MemStatus::Valid {
                error!(
                    "WRITE error: {} (PA {:#x}, VA {:#x})",
                    rsp.status, rsp.pa, rsp.va
                );
                return Err(EngineError::MemoryAccess {
                    access: "WRITE",
                    status: rsp.status,
                    pa: rsp.pa,
                    va: rsp.va,
                });
            }
        }
        Ok(())
    }

    /// Turns read responses into queued completion packets.
    fn receive_dma_reads(&mut self) -> Result<(), EngineError> {
        while self.pending_reads > 0 {
            let rsp = match self.memory.try_recv_read() {
                Ok(Some(rsp)) => rsp,
                Ok(None) => break,
                Err(_) => return Err(EngineError::Disconnected),
            };
            self.pending_reads -= 1;

            let slot = rsp.tag as usize;
            let req = match self.read_slots.states.get(slot) {
                Some(state) if state.busy => state.req,
                _ => None,
            };
            let Some(req) = req else {
                return Err(self.fail(None, Violation::ReadResponseTag(rsp.tag)));
            };

            if rsp.status != MemStatus::Valid {
                self.read_slots.release(slot);
                error!(
                    "READ error: {} (PA {:#x}, VA {:#x})",
                    rsp.status, rsp.pa, rsp.va
                );
                return Err(EngineError::MemoryAccess {
                    access: "READ",
                    status: rsp.status,
                    pa: rsp.pa,
                    va: rsp.va,
                });
            }

            self.queue_read_completions(slot, &req, &rsp.data)?;
        }
        Ok(())
    }

    /// Splits the response to `req` into completion packets.
    fn queue_read_completions(&mut self, slot: usize, req: &TlpHeader, data: &[u8]) -> Result<(), EngineError> {
        let RequestFields {
            first_dw_be: fbe,
            last_dw_be: lbe,
            ..
        } = req.request().copied().unwrap_or_default();
        let len_dw = req.len_dwords();
        let fence = req.len_bytes <= 4 && fbe == 0 && lbe == 0;
        let expected = if fence { 0 } else { req.len_bytes };
        if data.len() != expected as usize {
            let violation = Violation::ReadResponseLength {
                got: data.len(),
                expected,
            };
            return Err(self.fail(Some(req), violation));
        }

        let mut dws = le_dwords(data);
        dws.resize(len_dw as usize, 0);
        let dws: Arc<[u32]> = dws.into();

        let Some(mut byte_count_rem) = completion_byte_count(len_dw, fbe, lbe) else {
            return Err(self.fail(Some(req), Violation::ReadByteEnables(len_dw)));
        };
        let mut len_bytes_rem = req.len_bytes;
        let mut dw_rem = len_dw;
        let mut start_dw = 0;

        while dw_rem > 0 {
            let this_dw = self.random_cpl_length(dw_rem);
            let is_first = start_dw == 0;
            let is_last = this_dw == dw_rem;

            self.push_read_completion(ReadCompletion {
                slot,
                data: dws.clone(),
                len_bytes: if is_last { len_bytes_rem } else { this_dw * 4 },
                start_dw,
                byte_count: byte_count_rem,
                is_first,
                is_last,
            });

            let sent = completion_byte_count(
                this_dw,
                if is_first { fbe } else { 0xf },
                if is_last { lbe } else { 0xf },
            )
            .unwrap_or(this_dw * 4);
            byte_count_rem = byte_count_rem.saturating_sub(sent);
            len_bytes_rem = len_bytes_rem.saturating_sub(this_dw * 4);
            start_dw += this_dw;
            dw_rem -= this_dw;
        }
        Ok(())
    }

    /// DWORDs in the next completion packet: the remainder when it fits in
    /// one completion boundary, otherwise a random number of boundaries up
    /// to the maximum read size.
    fn random_cpl_length(&mut self, dw_rem: u32) -> u32 {
        let p = self.cfg.params();
        let rcb = p.request_completion_boundary;
        let max_chunks = (p.max_rd_req_bytes / rcb).max(1);
        let rcb_dw = rcb / 4;
        if dw_rem <= rcb_dw {
            return dw_rem;
        }

        let r = self.rng.next_u32();
        let chunks = if r == 0 { max_chunks } else { 1 + r % max_chunks };
        dw_rem.min(chunks * rcb_dw)
    }

    /// Queues a completion, possibly ahead of completions for other
    /// requests.
    fn push_read_completion(&mut self, cpl: ReadCompletion) {
        let r = if self.cfg.params().ordered_completions {
            0
        } else {
            self.rng.next_u32() & 0xff
        };
        let n_later = match r {
            0 => 0,
            r if r >= 0x80 => 0,
            r if r >= 0x20 => 5,
            r if r >= 0x10 => 2,
            _ => 1,
        };

        let slot = cpl.slot;
        self.cpl_queue
            .insert_reordered(cpl, n_later, |c| c.slot == slot);
    }

    fn refuse_beat(&mut self) -> bool {
        (self.rng.next_u32() & 0xff) > 0xd0
    }

    fn h2a_cpld(&mut self, flit: &mut Flit) -> Result<Beat, EngineError> {
        let tdata_dwords = self.cfg.tdata_dwords() as u32;
        let mid_packet = self.cpl_dw_rem > 0;

        if self.refuse_beat() {
            return Ok(if mid_packet {
                Beat {
                    valid: false,
                    done: false,
                }
            } else {
                Beat::IDLE
            });
        }
        let Some(cpl) = self.cpl_queue.front().cloned() else {
            return Ok(Beat::IDLE);
        };
        let cpl_dw = (cpl.len_bytes + 3) / 4;

        let (hdr, start_dw, tdata_start) = if mid_packet {
            (None, cpl.start_dw + cpl_dw - self.cpl_dw_rem, 0)
        } else {
            let (req, start_cycle) = match self.read_slots.states.get(cpl.slot) {
                Some(state) => (state.req, state.start_cycle),
                None => (None, 0),
            };
            let Some(req) = req else {
                return Err(self.fail(None, Violation::ReadResponseTag(cpl.slot as u16)));
            };
            if self.cycle.saturating_sub(start_cycle) < MIN_READ_LATENCY_CYCLES
                && !self.options.unlimited_bw
            {
                return Ok(Beat::IDLE);
            }

            let hdr = self.completion_header(&req, &cpl);
            if cpl.is_last {
                self.read_slots.release(cpl.slot);
            }
            if let Err(e) = codec::pack(&hdr, flit) {
                error!("  {}", hdr);
                return Err(self.fail(None, e.into()));
            }
            self.cpl_dw_rem = cpl_dw;
            (Some(hdr), cpl.start_dw, HDR_DWORDS as u32)
        };

        let avail = tdata_dwords - tdata_start;
        let last = self.cpl_dw_rem <= avail;
        let n = self.cpl_dw_rem.min(avail);
        for i in 0..n {
            let keep = if last && i + 1 == n && cpl.len_bytes & 3 != 0 {
                (1u8 << (cpl.len_bytes & 3)) - 1
            } else {
                0xf
            };
            let dw = cpl.data.get((start_dw + i) as usize).copied().unwrap_or(0);
            flit.put_dw((tdata_start + i) as usize, dw, keep);
        }
        self.cpl_dw_rem -= n;
        flit.last = last;

        trace_beat(self.cycle, hdr.as_ref(), flit);
        if last {
            self.cpl_queue.pop_front();
        }
        Ok(Beat {
            valid: true,
            done: last,
        })
    }

    fn completion_header(&self, req: &TlpHeader, cpl: &ReadCompletion) -> TlpHeader {
        let fields = req.request().copied().unwrap_or_default();
        let mut low_addr = fields.addr.wrapping_add(cpl.start_dw as u64 * 4) as u32;
        if cpl.is_first {
            low_addr = low_addr.wrapping_add(lower_addr_byte_offset(fields.first_dw_be));
        }

        let mut hdr = TlpHeader::new(FmtType::CPLD);
        hdr.dm_mode = req.dm_mode;
        hdr.routing.pf_num = req.routing.pf_num;
        hdr.routing.vf_num = req.routing.vf_num;
        hdr.routing.vf_active = req.routing.vf_active;
        hdr.len_bytes = cpl.len_bytes;
        hdr.req_id = req.req_id;
        hdr.tag = req.tag;
        hdr.body = HeaderBody::Completion(CompletionFields {
            byte_count: cpl.byte_count as u16,
            // PU completions carry only the low 7 bits
            low_addr: low_addr & 0x7f,
            fc: req.dm_mode && cpl.is_last,
            ..Default::default()
        });
        hdr
    }

    fn mmio_header(&self, req: &MmioRequest) -> TlpHeader {
        let p = self.cfg.params();
        let addr64 = req.addr > u32::MAX as u64;
        let fmt_type = match (req.write, addr64) {
            (true, false) => FmtType::MEM_WRITE32,
            (true, true) => FmtType::MEM_WRITE64,
            (false, false) => FmtType::MEM_READ32,
            (false, true) => FmtType::MEM_READ64,
        };

        let mut hdr = TlpHeader::new(fmt_type);
        hdr.len_bytes = req.len_bytes();
        hdr.tag = req.slot_idx;
        hdr.routing.pf_num = p.default_pf_num;
        hdr.routing.vf_num = p.default_vf_num;
        hdr.routing.vf_active = p.default_vf_active;
        hdr.body = HeaderBody::Request(RequestFields {
            addr: req.addr,
            first_dw_be: 0xf,
            last_dw_be: if req.width_bits <= 32 { 0 } else { 0xf },
            ..Default::default()
        });
        hdr
    }

    fn h2a_mem(&mut self, flit: &mut Flit) -> Result<Beat, EngineError> {
        let tdata_dwords = self.cfg.tdata_dwords() as u32;
        let Some(req) = self.mmio_queue.front().cloned() else {
            return Ok(Beat::IDLE);
        };
        let req_dws = req.len_bytes() / 4;

        let (hdr, start_dw, tdata_start) = if self.mmio_dw_rem > 0 {
            (None, req_dws - self.mmio_dw_rem, 0)
        } else {
            if let Some(last) = self.last_mmio_cycle {
                if self.cycle.saturating_sub(last) < MMIO_SPACING_CYCLES {
                    return Ok(Beat::IDLE);
                }
            }
            if self.refuse_beat() {
                return Ok(Beat::IDLE);
            }

            let hdr = self.mmio_header(&req);
            if let Err(e) = codec::pack(&hdr, flit) {
                error!("  {}", hdr);
                return Err(self.fail(None, e.into()));
            }
            self.last_mmio_cycle = Some(self.cycle);
            self.mmio_dw_rem = req_dws;
            (Some(hdr), 0, HDR_DWORDS as u32)
        };

        let last = if req.write {
            let avail = tdata_dwords - tdata_start;
            let n = self.mmio_dw_rem.min(avail);
            let dws = le_dwords(&req.data);
            for i in 0..n {
                let dw = dws.get((start_dw + i) as usize).copied().unwrap_or(0);
                flit.put_dw((tdata_start + i) as usize, dw, 0xf);
            }
            self.mmio_dw_rem -= n;
            self.mmio_dw_rem == 0
        } else {
            self.mmio_dw_rem = 0;
            true
        };
        flit.last = last;

        trace_beat(self.cycle, hdr.as_ref(), flit);
        if last {
            self.mmio_queue.pop_front();
            if req.write {
                // writes are acknowledged once sent
                self.mmio.mmio_response(MmioResponse::from(&req));
            }
        }
        Ok(Beat {
            valid: true,
            done: last,
        })
    }
}
