//! AFU to host: checking and dispatching TLPs driven by the device.

use log::debug;

use super::{AfuTxState, PartialPacket, TransactionEngine, STREAM_TARGET};
use crate::codec::{self, CodecError};
use crate::device::MmioResponse;
use crate::error::{EngineError, Violation};
use crate::header::{AddressType, TlpHeader};
use crate::host_memory::{AtomicOp, ReadRequest, WriteRequest};
use crate::parser::{self, HDR_DWORDS};
use crate::wire::Flit;
use crate::PacketType;

fn eop(flit: &Flit) -> &'static str {
    if flit.last {
        "eop"
    } else {
        "   "
    }
}

fn payload_bytes(payload: &[u32], len_bytes: u32) -> Vec<u8> {
    let mut data: Vec<u8> = payload.iter().flat_map(|dw| dw.to_le_bytes()).collect();
    data.truncate(len_bytes as usize);
    data
}

impl TransactionEngine {
    /// Consumes one valid beat driven by the AFU.
    pub fn afu_to_host(&mut self, cycle: u64, flit: &Flit) -> Result<(), EngineError> {
        self.check_halted()?;
        self.cycle = cycle;

        match std::mem::take(&mut self.afu_state) {
            AfuTxState::Sop => self.afu_sop(flit),
            AfuTxState::Cpl(pkt) => {
                debug!(target: STREAM_TARGET, "afu_to_host: {}     {} {}", cycle, eop(flit), flit);
                self.a2h_cpld(pkt, flit, 0)
            }
            AfuTxState::Mem(pkt) => {
                debug!(target: STREAM_TARGET, "afu_to_host: {}     {} {}", cycle, eop(flit), flit);
                self.a2h_mwr(pkt, flit, 0)
            }
        }
    }

    fn afu_sop(&mut self, flit: &Flit) -> Result<(), EngineError> {
        let hdr = match codec::unpack(flit) {
            Ok(hdr) => hdr,
            Err(e) => return Err(self.fail_flit(None, flit, e.into())),
        };
        debug!(
            target: STREAM_TARGET,
            "afu_to_host: {} sop {} {} {}",
            self.cycle,
            eop(flit),
            hdr,
            flit
        );

        let ft = hdr.fmt_type;
        if ft.is_interrupt() {
            self.a2h_interrupt(&hdr, flit)
        } else if ft.is_completion() {
            if !ft.has_data() {
                return Err(self.fail_flit(Some(&hdr), flit, Violation::CompletionWithoutData));
            }
            self.a2h_cpld_sop(hdr, flit)
        } else if ft.is_mem_req() {
            if ft.is_mwr() && !ft.is_atomic() {
                self.a2h_mwr_sop(hdr, flit)
            } else {
                self.a2h_mrd(hdr, flit)
            }
        } else {
            Err(self.fail_flit(Some(&hdr), flit, Violation::UnsupportedType))
        }
    }

    /// Appends this beat's share of the payload to `pkt`, starting at DWORD
    /// `start` of tdata. Returns whether the packet is complete.
    fn take_payload(
        &mut self,
        pkt: &mut PartialPacket,
        flit: &Flit,
        start: usize,
        total_dws: usize,
        what: &'static str,
    ) -> Result<bool, EngineError> {
        let remaining = total_dws.saturating_sub(pkt.payload.len());
        let avail = flit.tdata_dwords().saturating_sub(start);

        let n = if remaining > avail {
            if flit.last {
                return Err(self.fail_flit(Some(&pkt.hdr), flit, Violation::PrematureEop(what)));
            }
            avail
        } else {
            if !flit.last {
                return Err(self.fail_flit(Some(&pkt.hdr), flit, Violation::ExpectedEop(what)));
            }
            remaining
        };

        match parser::payload_dwords(&flit.data.as_bytes()[start * 4..], n) {
            Ok((_, dws)) => pkt.payload.extend(dws),
            Err(_) => {
                return Err(self.fail_flit(
                    Some(&pkt.hdr),
                    flit,
                    Violation::Codec(CodecError::Truncated),
                ))
            }
        }
        Ok(flit.last)
    }

    fn a2h_interrupt(&mut self, hdr: &TlpHeader, flit: &Flit) -> Result<(), EngineError> {
        if !flit.last {
            return Err(self.fail_flit(Some(hdr), flit, Violation::ExpectedEop("interrupt request")));
        }

        let vector = hdr.vector_num().unwrap_or_default();
        let max = self.cfg.params().num_afu_interrupts;
        if vector as u32 >= max {
            return Err(self.fail_flit(Some(hdr), flit, Violation::IrqOutOfRange { vector, max }));
        }

        self.irq.interrupt(vector);
        Ok(())
    }

    fn a2h_cpld_sop(&mut self, hdr: TlpHeader, flit: &Flit) -> Result<(), EngineError> {
        let Some(cpl) = hdr.completion().copied() else {
            return Err(self.fail_flit(Some(&hdr), flit, Violation::UnsupportedType));
        };
        let p = self.cfg.params();
        let (max_mmio, max_bytes) = (p.max_outstanding_mmio_rd_reqs, p.max_rd_req_bytes);

        let violation = if hdr.tag as u32 >= max_mmio {
            Some(Violation::MmioTagRange)
        } else if !self.mmio_reads[hdr.tag as usize].busy {
            Some(Violation::MmioTagInactive)
        } else if hdr.len_bytes != cpl.byte_count as u32 {
            Some(Violation::SplitMmioCompletion)
        } else if hdr.len_bytes > max_bytes {
            Some(Violation::MmioCompletionTooLarge(max_bytes))
        } else if cpl.byte_count > 64 {
            Some(Violation::MmioCompletionOver64)
        } else {
            None
        };
        if let Some(v) = violation {
            return Err(self.fail_flit(Some(&hdr), flit, v));
        }

        let pkt = PartialPacket {
            payload: Vec::with_capacity(hdr.len_dwords() as usize),
            hdr,
        };
        self.a2h_cpld(pkt, flit, HDR_DWORDS)
    }

    fn a2h_cpld(&mut self, mut pkt: PartialPacket, flit: &Flit, start: usize) -> Result<(), EngineError> {
        let total = (pkt.hdr.len_bytes / 4) as usize;
        if !self.take_payload(&mut pkt, flit, start, total, "MMIO completion")? {
            self.afu_state = AfuTxState::Cpl(pkt);
            return Ok(());
        }

        let slot = pkt.hdr.tag as usize;
        let state = &mut self.mmio_reads[slot];
        state.busy = false;
        debug!(
            "MMIO read slot {} completed after {} cycles",
            slot,
            self.cycle.saturating_sub(state.start_cycle)
        );

        let low_addr = pkt.hdr.completion().map(|c| c.low_addr).unwrap_or_default();
        let rsp = MmioResponse {
            tid: state.tid,
            write: false,
            width_bits: pkt.hdr.len_bytes * 8,
            addr: low_addr as u64,
            slot_idx: slot as u16,
            data: payload_bytes(&pkt.payload, pkt.hdr.len_bytes),
        };
        self.mmio.mmio_response(rsp);
        Ok(())
    }

    fn a2h_mwr_sop(&mut self, hdr: TlpHeader, flit: &Flit) -> Result<(), EngineError> {
        let Some(req) = hdr.request().copied() else {
            return Err(self.fail_flit(Some(&hdr), flit, Violation::UnsupportedType));
        };
        let p = self.cfg.params();
        let (mode, max) = if hdr.dm_mode {
            ("DM", p.max_dm_wr_payload_bytes)
        } else {
            ("PU", p.max_wr_payload_bytes)
        };
        let len = hdr.len_bytes;

        let violation = if len > max {
            Some(Violation::TooLong {
                mode,
                op: "write",
                max,
            })
        } else if len == 0 {
            Some(Violation::ZeroLength("write"))
        } else if req.first_dw_be == 0 {
            Some(Violation::WriteFirstBeZero)
        } else if !hdr.dm_mode && len <= 4 && req.last_dw_be != 0 {
            Some(Violation::LastBeOnSingleDword("write"))
        } else if len > 4 && req.last_dw_be == 0 {
            Some(Violation::LastBeZero("write"))
        } else if !hdr.dm_mode && req.addr <= u32::MAX as u64 && hdr.fmt_type.is_addr64() {
            Some(Violation::NeedlessAddr64("writes"))
        } else if req.attr.at == AddressType::TranslationRequest {
            Some(Violation::AtsOnWrite)
        } else if req.attr.at == AddressType::Reserved {
            Some(Violation::IllegalAddressType)
        } else {
            None
        };
        if let Some(v) = violation {
            return Err(self.fail_flit(Some(&hdr), flit, v));
        }

        let pkt = PartialPacket {
            payload: Vec::with_capacity(hdr.len_dwords() as usize),
            hdr,
        };
        self.a2h_mwr(pkt, flit, HDR_DWORDS)
    }

    fn a2h_mwr(&mut self, mut pkt: PartialPacket, flit: &Flit, start: usize) -> Result<(), EngineError> {
        let total = pkt.hdr.len_dwords() as usize;
        if !self.take_payload(&mut pkt, flit, start, total, "DMA write")? {
            self.afu_state = AfuTxState::Mem(pkt);
            return Ok(());
        }

        let hdr = &pkt.hdr;
        let req = hdr.request().copied().unwrap_or_default();
        let (fbe, lbe) = (req.first_dw_be, req.last_dw_be);
        let partial = fbe != 0xf || (hdr.len_bytes > 4 && lbe != 0xf);

        let wr = WriteRequest {
            addr: req.addr,
            addr_type: req.attr.at,
            pasid: hdr.pasid(),
            byte_en: partial.then_some((fbe, lbe)),
            data: payload_bytes(&pkt.payload, hdr.len_bytes),
        };
        self.memory
            .send_write(wr)
            .map_err(|_| EngineError::Disconnected)?;
        self.pending_writes += 1;
        Ok(())
    }

    /// Reads, fences, atomics and ATS translation requests.
    fn a2h_mrd(&mut self, mut hdr: TlpHeader, flit: &Flit) -> Result<(), EngineError> {
        if let Err(v) = self.check_read(&mut hdr, flit) {
            return Err(self.fail_flit(Some(&hdr), flit, v));
        }

        let mut slot = hdr.tag as usize;
        if self.read_slots.mapped() {
            match self.read_slots.pop_free() {
                Some(free) => slot = free,
                None => {
                    return Err(self.fail_flit(Some(&hdr), flit, Violation::TagMapperExhausted))
                }
            }
        }
        if self.read_slots.states[slot].busy {
            return Err(self.fail_flit(Some(&hdr), flit, Violation::DmaTagBusy));
        }

        let req = hdr.request().copied().unwrap_or_default();
        let ft = hdr.fmt_type;
        let fence = hdr.len_bytes <= 4 && req.first_dw_be == 0 && req.last_dw_be == 0;
        let mut data_bytes = if fence { 0 } else { hdr.len_bytes };

        let atomic = if ft.is_atomic() {
            // operands follow the header
            let op = |i: usize| flit.get_dw(HDR_DWORDS + i) as u64;
            if ft.is_atomic_cas() {
                // the completion carries half the request
                data_bytes >>= 1;
                hdr.len_bytes >>= 1;
                Some(if data_bytes == 4 {
                    AtomicOp::Cas {
                        compare: op(0),
                        swap: op(1),
                    }
                } else {
                    AtomicOp::Cas {
                        compare: op(1) << 32 | op(0),
                        swap: op(3) << 32 | op(2),
                    }
                })
            } else {
                let operand = if data_bytes == 4 { op(0) } else { op(1) << 32 | op(0) };
                Some(match ft.packet_format().map(|f| f.kind) {
                    Ok(PacketType::SwapAtomic) => AtomicOp::Swap(operand),
                    _ => AtomicOp::FetchAdd(operand),
                })
            }
        } else {
            None
        };

        let state = &mut self.read_slots.states[slot];
        state.busy = true;
        state.start_cycle = self.cycle;
        state.req = Some(hdr);

        let rd = ReadRequest {
            addr: req.addr,
            addr_type: req.attr.at,
            data_bytes,
            tag: slot as u16,
            pasid: hdr.pasid(),
            atomic,
        };
        self.memory
            .send_read(rd)
            .map_err(|_| EngineError::Disconnected)?;
        self.pending_reads += 1;
        Ok(())
    }

    /// Rule checks for a read-class request. Atomic byte enables are
    /// normalized in `hdr` once they pass.
    fn check_read(&self, hdr: &mut TlpHeader, flit: &Flit) -> Result<(), Violation> {
        let p = self.cfg.params();
        let ft = hdr.fmt_type;
        let dm = hdr.dm_mode;
        let len = hdr.len_bytes;
        let tag = hdr.tag;

        if !flit.last {
            return Err(Violation::ExpectedEop("DMA read request"));
        }
        let (mode, max) = if dm {
            ("DM", p.max_dm_rd_req_bytes)
        } else {
            ("PU", p.max_rd_req_bytes)
        };
        if len > max {
            return Err(Violation::TooLong {
                mode,
                op: "read",
                max,
            });
        }
        if len == 0 {
            return Err(Violation::ZeroLength("read"));
        }

        let Some(req) = hdr.request_mut() else {
            return Err(Violation::UnsupportedType);
        };

        if ft.is_atomic() {
            if dm {
                return Err(Violation::AtomicDm);
            }
            if ft.is_atomic_cas() {
                if len != 8 && len != 16 {
                    return Err(Violation::AtomicLength {
                        op: "CAS",
                        allowed: "8 or 16",
                    });
                }
            } else if len != 4 && len != 8 {
                return Err(Violation::AtomicLength {
                    op: "FetchAdd and Swap",
                    allowed: "4 or 8",
                });
            }
            if req.first_dw_be != 0 || req.last_dw_be != 0 {
                return Err(Violation::AtomicByteEnables);
            }
            req.first_dw_be = 0xf;
            if len > 4 {
                req.last_dw_be = 0xf;
            }
        }

        if dm {
            return Err(Violation::DmRead);
        }

        if req.first_dw_be == 0 && (req.last_dw_be != 0 || len > 4) {
            return Err(Violation::ReadFirstBeZero);
        }
        if len <= 4 && req.last_dw_be != 0 {
            return Err(Violation::LastBeOnSingleDword("read"));
        }
        if len > 4 && req.last_dw_be == 0 {
            return Err(Violation::LastBeZero("read"));
        }
        if req.addr <= u32::MAX as u64 && ft.is_addr64() {
            return Err(Violation::NeedlessAddr64("reads"));
        }

        match req.attr.at {
            AddressType::TranslationRequest => {
                if len % 8 != 0 {
                    return Err(Violation::AtsRequest("byte length must be a multiple of 8"));
                }
                if req.addr & 0xfff != 0 {
                    return Err(Violation::AtsRequest("address must be 4KB aligned"));
                }
                if len > 128 {
                    return Err(Violation::AtsRequest("length is limited to 128 bytes"));
                }
                if ft.is_atomic() {
                    return Err(Violation::AtsRequest("illegal atomic op"));
                }
            }
            AddressType::Reserved => return Err(Violation::IllegalAddressType),
            _ => {}
        }

        if tag as u32 >= p.max_outstanding_dma_rd_reqs {
            return Err(Violation::DmaTagRange);
        }
        Ok(())
    }
}
