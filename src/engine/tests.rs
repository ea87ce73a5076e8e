use crossbeam_channel::{unbounded, Receiver};

use super::*;
use crate::codec;
use crate::config::StreamParams;
use crate::device::MmioResponse;
use crate::header::{AddressType, CompletionFields, HeaderBody, RequestFields};
use crate::host_memory::{
    self, AtomicOp, HostMemoryEndpoint, MemRequest, MemStatus, ReadRequest, ReadResponse,
    WriteResponse,
};
use crate::parser::HDR_DWORDS;
use crate::rand::{FullBandwidth, Lcg};
use crate::FmtType;

struct Bench {
    engine: TransactionEngine,
    memory: HostMemoryEndpoint,
    mmio_rx: Receiver<MmioResponse>,
    irq_rx: Receiver<u16>,
}

fn bench_with(params: StreamParams, options: RuntimeOptions) -> Bench {
    let _ = env_logger::builder().is_test(true).try_init();
    let cfg = params.validate().unwrap();
    let (port, memory) = host_memory::channel();
    let (mmio_tx, mmio_rx) = unbounded::<MmioResponse>();
    let (irq_tx, irq_rx) = unbounded::<u16>();
    let engine = TransactionEngine::new(cfg, options, port, mmio_tx, irq_tx);
    Bench {
        engine,
        memory,
        mmio_rx,
        irq_rx,
    }
}

fn bench() -> Bench {
    bench_with(
        StreamParams::default(),
        RuntimeOptions {
            unlimited_bw: true,
            ..Default::default()
        },
    )
}

fn request(ft: FmtType, tag: u16, addr: u64, len_bytes: u32, fbe: u8, lbe: u8) -> TlpHeader {
    let mut hdr = TlpHeader::new(ft);
    hdr.tag = tag;
    hdr.len_bytes = len_bytes;
    hdr.body = HeaderBody::Request(RequestFields {
        addr,
        first_dw_be: fbe,
        last_dw_be: lbe,
        ..Default::default()
    });
    hdr
}

fn read(tag: u16, addr: u64, len_bytes: u32) -> TlpHeader {
    let lbe = if len_bytes > 4 { 0xf } else { 0 };
    request(FmtType::MEM_READ32, tag, addr, len_bytes, 0xf, lbe)
}

fn write(addr: u64, len_bytes: u32) -> TlpHeader {
    let lbe = if len_bytes > 4 { 0xf } else { 0 };
    request(FmtType::MEM_WRITE32, 0, addr, len_bytes, 0xf, lbe)
}

impl Bench {
    fn flit(&self, hdr: Option<&TlpHeader>, payload: &[u32], last: bool) -> Flit {
        let mut flit = Flit::new(self.engine.config());
        let start = match hdr {
            Some(hdr) => {
                codec::pack(hdr, &mut flit).unwrap();
                HDR_DWORDS
            }
            None => 0,
        };
        for (i, dw) in payload.iter().enumerate() {
            flit.put_dw(start + i, *dw, 0xf);
        }
        flit.last = last;
        flit
    }

    fn send(&mut self, cycle: u64, hdr: &TlpHeader, payload: &[u32]) -> Result<(), EngineError> {
        let flit = self.flit(Some(hdr), payload, true);
        self.engine.afu_to_host(cycle, &flit)
    }

    fn violation(&mut self, hdr: &TlpHeader, payload: &[u32]) -> Violation {
        let err = self.send(1, hdr, payload).unwrap_err();
        assert!(self.engine.is_halted());
        err.violation().cloned().unwrap()
    }

    fn read_request(&self) -> ReadRequest {
        match self.memory.req_rx.try_recv().unwrap() {
            MemRequest::Read(req) => req,
            other => panic!("expected a read, got {:?}", other),
        }
    }

    fn respond(&self, tag: u16, data: Vec<u8>) {
        self.memory
            .rd_rsp_tx
            .send(ReadResponse {
                tag,
                status: MemStatus::Valid,
                pa: 0,
                va: 0,
                data,
            })
            .unwrap();
    }
}

fn violation_for(hdr: TlpHeader, payload: &[u32]) -> Violation {
    bench().violation(&hdr, payload)
}

#[test]
fn interrupts() {
    let mut b = bench();
    let mut intr = TlpHeader::new(FmtType::INTR);
    intr.dm_mode = true;
    intr.body = HeaderBody::Interrupt { vector_num: 2 };
    b.send(1, &intr, &[]).unwrap();
    assert_eq!(b.irq_rx.try_recv(), Ok(2));

    intr.body = HeaderBody::Interrupt { vector_num: 4 };
    assert_eq!(
        b.violation(&intr, &[]),
        Violation::IrqOutOfRange { vector: 4, max: 4 }
    );
    assert!(matches!(b.send(2, &intr, &[]), Err(EngineError::Halted)));
    assert!(!b.engine.afu_to_host_tready(3));
}

#[test]
fn unsupported_tlps() {
    assert_eq!(
        violation_for(TlpHeader::new(FmtType::CFG_WRITE), &[]),
        Violation::UnsupportedType
    );

    let mut cpl = completion(0, 4, 4, 0);
    cpl.fmt_type = FmtType::CPL;
    assert_eq!(violation_for(cpl, &[]), Violation::CompletionWithoutData);

    // interrupts are DM only
    let mut b = bench();
    let mut flit = b.flit(None, &[0; 8], true);
    flit.put_dw(0, (FmtType::INTR.0 as u32) << 24, 0xf);
    let err = b.engine.afu_to_host(1, &flit).unwrap_err();
    assert!(matches!(
        err.violation(),
        Some(Violation::Codec(codec::CodecError::UnsupportedEncoding(_)))
    ));
}

#[test]
fn dma_write() {
    let mut b = bench();
    b.send(5, &write(0x1000, 16), &[1, 2, 3, 4]).unwrap();
    assert_eq!(b.engine.pending_writes(), 1);

    match b.memory.req_rx.try_recv().unwrap() {
        MemRequest::Write(req) => {
            assert_eq!(req.addr, 0x1000);
            assert_eq!(req.addr_type, AddressType::Untranslated);
            assert_eq!(req.byte_en, None);
            assert_eq!(req.data.len(), 16);
            assert_eq!(&req.data[4..8], &2u32.to_le_bytes());
        }
        other => panic!("unexpected {:?}", other),
    }

    b.memory
        .wr_rsp_tx
        .send(WriteResponse {
            status: MemStatus::Valid,
            pa: 0x1000,
            va: 0x7000,
        })
        .unwrap();
    assert!(b.engine.host_to_afu(6, true).unwrap().is_none());
    assert_eq!(b.engine.pending_writes(), 0);
}

#[test]
fn dma_write_partial_bytes_and_pasid() {
    let mut b = bench();
    let mut hdr = request(FmtType::MEM_WRITE64, 0, 0x1_0000_0000, 8, 0xc, 0x3);
    hdr.prefix = crate::header::Prefix::pasid(0x42);
    b.send(1, &hdr, &[0xaabb_ccdd, 0x1122_3344]).unwrap();

    match b.memory.req_rx.try_recv().unwrap() {
        MemRequest::Write(req) => {
            assert_eq!(req.byte_en, Some((0xc, 0x3)));
            assert_eq!(req.pasid, Some(0x42));
            assert_eq!(req.data, vec![0xdd, 0xcc, 0xbb, 0xaa, 0x44, 0x33, 0x22, 0x11]);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn multi_beat_write() {
    let mut b = bench();
    let hdr = write(0x4000, 128);
    let payload: Vec<u32> = (0..32).collect();

    let first = b.flit(Some(&hdr), &payload[..8], false);
    b.engine.afu_to_host(1, &first).unwrap();
    let middle = b.flit(None, &payload[8..24], false);
    b.engine.afu_to_host(2, &middle).unwrap();
    assert_eq!(b.engine.pending_writes(), 0);
    let last = b.flit(None, &payload[24..], true);
    b.engine.afu_to_host(3, &last).unwrap();
    assert_eq!(b.engine.pending_writes(), 1);

    match b.memory.req_rx.try_recv().unwrap() {
        MemRequest::Write(req) => {
            let dws: Vec<u32> = req
                .data
                .chunks(4)
                .map(|c| u32::from_le_bytes(c.try_into().unwrap()))
                .collect();
            assert_eq!(dws, payload);
        }
        other => panic!("unexpected {:?}", other),
    }
}

#[test]
fn write_framing() {
    let mut b = bench();
    let flit = b.flit(Some(&write(0x4000, 128)), &[0; 8], true);
    let err = b.engine.afu_to_host(1, &flit).unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::PrematureEop("DMA write")));

    let mut b = bench();
    let flit = b.flit(Some(&write(0x4000, 16)), &[0; 4], false);
    let err = b.engine.afu_to_host(1, &flit).unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::ExpectedEop("DMA write")));
}

#[test]
fn write_rules() {
    assert_eq!(
        violation_for(write(0x1000, 516), &[]),
        Violation::TooLong {
            mode: "PU",
            op: "write",
            max: 512
        }
    );
    assert_eq!(violation_for(write(0x1000, 0), &[]), Violation::ZeroLength("write"));
    assert_eq!(
        violation_for(request(FmtType::MEM_WRITE32, 0, 0x1000, 4, 0, 0), &[0]),
        Violation::WriteFirstBeZero
    );
    assert_eq!(
        violation_for(request(FmtType::MEM_WRITE32, 0, 0x1000, 4, 0xf, 0xf), &[0]),
        Violation::LastBeOnSingleDword("write")
    );
    assert_eq!(
        violation_for(request(FmtType::MEM_WRITE32, 0, 0x1000, 8, 0xf, 0), &[0, 0]),
        Violation::LastBeZero("write")
    );
    assert_eq!(
        violation_for(request(FmtType::MEM_WRITE64, 0, 0x1000, 4, 0xf, 0), &[0]),
        Violation::NeedlessAddr64("writes")
    );

    let mut ats = write(0x1000, 4);
    if let Some(req) = ats.request_mut() {
        req.attr.at = AddressType::TranslationRequest;
    }
    assert_eq!(violation_for(ats, &[0]), Violation::AtsOnWrite);
}

#[test]
fn dma_read_completion() {
    let mut b = bench();
    b.send(10, &read(3, 0x2040, 64), &[]).unwrap();
    assert_eq!(b.engine.pending_reads(), 1);
    assert!(b.engine.dma_read_busy(3));

    let req = b.read_request();
    assert_eq!(req.tag, 3);
    assert_eq!(req.addr, 0x2040);
    assert_eq!(req.data_bytes, 64);
    assert_eq!(req.atomic, None);

    b.respond(3, (0..64).collect());
    let first = b.engine.host_to_afu(11, true).unwrap().unwrap();
    assert_eq!(b.engine.pending_reads(), 0);
    assert!(!first.last);
    assert!(!b.engine.dma_read_busy(3));

    let hdr = codec::unpack(&first).unwrap();
    assert_eq!(hdr.fmt_type, FmtType::CPLD);
    assert_eq!(hdr.tag, 3);
    assert_eq!(hdr.len_bytes, 64);
    let cpl = hdr.completion().unwrap();
    assert_eq!(cpl.byte_count, 64);
    assert_eq!(cpl.low_addr, 0x40);
    assert_eq!(first.get_dw(HDR_DWORDS), 0x0302_0100);

    let second = b.engine.host_to_afu(12, true).unwrap().unwrap();
    assert!(second.last);
    assert_eq!(second.get_dw(0), u32::from_le_bytes([32, 33, 34, 35]));
    assert_eq!(second.get_dw(7), u32::from_le_bytes([60, 61, 62, 63]));

    assert!(b.engine.host_to_afu(13, true).unwrap().is_none());
}

#[test]
fn fence() {
    let mut b = bench();
    b.send(1, &request(FmtType::MEM_READ32, 0, 0x100, 4, 0, 0), &[])
        .unwrap();
    let req = b.read_request();
    assert_eq!(req.data_bytes, 0);

    b.respond(0, Vec::new());
    let flit = b.engine.host_to_afu(2, true).unwrap().unwrap();
    assert!(flit.last);
    let hdr = codec::unpack(&flit).unwrap();
    assert_eq!(hdr.len_bytes, 4);
    assert_eq!(hdr.completion().unwrap().byte_count, 1);
}

#[test]
fn partial_read_byte_count() {
    let mut b = bench();
    b.send(1, &request(FmtType::MEM_READ32, 1, 0x2000, 8, 0x1, 0x8), &[])
        .unwrap();
    b.read_request();
    b.respond(1, vec![0; 8]);
    let flit = b.engine.host_to_afu(2, true).unwrap().unwrap();
    let hdr = codec::unpack(&flit).unwrap();
    assert_eq!(hdr.completion().unwrap().byte_count, 8);

    let mut b = bench();
    b.send(1, &request(FmtType::MEM_READ32, 1, 0x2000, 4, 0x4, 0), &[])
        .unwrap();
    b.read_request();
    b.respond(1, vec![0; 4]);
    let flit = b.engine.host_to_afu(2, true).unwrap().unwrap();
    let cpl = *codec::unpack(&flit).unwrap().completion().unwrap();
    assert_eq!(cpl.byte_count, 1);
    assert_eq!(cpl.low_addr, 2);
    // the last DWORD of a DWORD-aligned payload keeps every byte
    assert_eq!(flit.keep.get_bits(HDR_DWORDS * 4, 4), 0xf);
}

#[test]
fn read_rules() {
    let mut b = bench();
    let flit = b.flit(Some(&read(0, 0x1000, 4)), &[], false);
    let err = b.engine.afu_to_host(1, &flit).unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::ExpectedEop("DMA read request")));

    assert_eq!(
        violation_for(read(0, 0x1000, 516), &[]),
        Violation::TooLong {
            mode: "PU",
            op: "read",
            max: 512
        }
    );
    assert_eq!(violation_for(read(0, 0x1000, 0), &[]), Violation::ZeroLength("read"));
    assert_eq!(
        violation_for(request(FmtType::MEM_READ32, 0, 0x1000, 8, 0, 0xf), &[]),
        Violation::ReadFirstBeZero
    );
    assert_eq!(
        violation_for(request(FmtType::MEM_READ32, 0, 0x1000, 4, 0xf, 0x1), &[]),
        Violation::LastBeOnSingleDword("read")
    );
    assert_eq!(
        violation_for(request(FmtType::MEM_READ64, 0, 0x1000, 4, 0xf, 0), &[]),
        Violation::NeedlessAddr64("reads")
    );
    assert_eq!(violation_for(read(256, 0x1000, 4), &[]), Violation::DmaTagRange);

    let mut dm = read(0, 0x1000, 6);
    dm.dm_mode = true;
    assert_eq!(violation_for(dm, &[]), Violation::DmRead);

    let mut b = bench();
    b.send(1, &read(9, 0x1000, 4), &[]).unwrap();
    assert_eq!(b.violation(&read(9, 0x2000, 4), &[]), Violation::DmaTagBusy);
}

#[test]
fn ats_requests() {
    let ats = |addr: u64, len: u32| {
        let mut hdr = read(0, addr, len);
        if let Some(req) = hdr.request_mut() {
            req.attr.at = AddressType::TranslationRequest;
        }
        hdr
    };

    let mut b = bench();
    b.send(1, &ats(0x8000, 16), &[]).unwrap();
    let req = b.read_request();
    assert_eq!(req.addr_type, AddressType::TranslationRequest);
    assert_eq!(req.data_bytes, 16);

    assert_eq!(
        violation_for(ats(0x8000, 12), &[]),
        Violation::AtsRequest("byte length must be a multiple of 8")
    );
    assert_eq!(
        violation_for(ats(0x8040, 16), &[]),
        Violation::AtsRequest("address must be 4KB aligned")
    );
    assert_eq!(
        violation_for(ats(0x8000, 136), &[]),
        Violation::AtsRequest("length is limited to 128 bytes")
    );

    let mut reserved = read(0, 0x8000, 4);
    if let Some(req) = reserved.request_mut() {
        req.attr.at = AddressType::Reserved;
    }
    assert_eq!(violation_for(reserved, &[]), Violation::IllegalAddressType);
}

#[test]
fn atomics() {
    let mut b = bench();
    b.send(1, &request(FmtType::FETCH_ADD32, 0, 0x3000, 8, 0, 0), &[5, 1])
        .unwrap();
    let req = b.read_request();
    assert_eq!(req.data_bytes, 8);
    assert_eq!(req.atomic, Some(AtomicOp::FetchAdd(0x1_0000_0005)));

    b.send(2, &request(FmtType::SWAP32, 1, 0x3000, 4, 0, 0), &[7])
        .unwrap();
    assert_eq!(b.read_request().atomic, Some(AtomicOp::Swap(7)));

    b.send(3, &request(FmtType::CAS32, 2, 0x3000, 16, 0, 0), &[1, 2, 3, 4])
        .unwrap();
    let req = b.read_request();
    assert_eq!(req.data_bytes, 8);
    assert_eq!(
        req.atomic,
        Some(AtomicOp::Cas {
            compare: 0x2_0000_0001,
            swap: 0x4_0000_0003
        })
    );

    // the completion carries half the CAS request
    b.respond(2, 9u64.to_le_bytes().to_vec());
    let flit = b.engine.host_to_afu(4, true).unwrap().unwrap();
    let hdr = codec::unpack(&flit).unwrap();
    assert_eq!(hdr.tag, 2);
    assert_eq!(hdr.len_bytes, 8);
    assert_eq!(flit.get_dw(HDR_DWORDS), 9);
}

#[test]
fn atomic_rules() {
    assert_eq!(
        violation_for(request(FmtType::CAS32, 0, 0x3000, 4, 0, 0), &[0]),
        Violation::AtomicLength {
            op: "CAS",
            allowed: "8 or 16"
        }
    );
    assert_eq!(
        violation_for(request(FmtType::FETCH_ADD32, 0, 0x3000, 16, 0, 0), &[0; 4]),
        Violation::AtomicLength {
            op: "FetchAdd and Swap",
            allowed: "4 or 8"
        }
    );
    assert_eq!(
        violation_for(request(FmtType::SWAP32, 0, 0x3000, 4, 0xf, 0), &[0]),
        Violation::AtomicByteEnables
    );

    let mut dm = request(FmtType::SWAP32, 0, 0x3000, 4, 0xf, 0xf);
    dm.dm_mode = true;
    assert_eq!(violation_for(dm, &[0]), Violation::AtomicDm);
}

#[test]
fn memory_errors_do_not_halt() {
    let mut b = bench();
    b.send(1, &write(0x1000, 4), &[0]).unwrap();
    b.memory
        .wr_rsp_tx
        .send(WriteResponse {
            status: MemStatus::NotPinned,
            pa: 0x1000,
            va: 0,
        })
        .unwrap();
    let err = b.engine.host_to_afu(2, true).unwrap_err();
    assert!(matches!(
        err,
        EngineError::MemoryAccess {
            access: "WRITE",
            status: MemStatus::NotPinned,
            pa: 0x1000,
            ..
        }
    ));
    assert!(!b.engine.is_halted());
    assert_eq!(b.engine.pending_writes(), 0);

    b.send(3, &read(2, 0x1000, 4), &[]).unwrap();
    b.memory
        .rd_rsp_tx
        .send(ReadResponse {
            tag: 2,
            status: MemStatus::NotMapped,
            pa: 0x1000,
            va: 0,
            data: Vec::new(),
        })
        .unwrap();
    let err = b.engine.host_to_afu(4, true).unwrap_err();
    assert!(matches!(err, EngineError::MemoryAccess { access: "READ", .. }));
    assert!(!b.engine.dma_read_busy(2));

    // the tag is usable again
    b.send(5, &read(2, 0x1000, 4), &[]).unwrap();
}

#[test]
fn stray_read_response() {
    let mut b = bench();
    b.send(1, &read(0, 0x1000, 4), &[]).unwrap();
    b.respond(7, vec![0; 4]);
    let err = b.engine.host_to_afu(2, true).unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::ReadResponseTag(7)));
}

#[test]
fn minimum_read_latency() {
    let mut b = bench_with(StreamParams::default(), RuntimeOptions::default());
    b.engine = b.engine.with_random(FullBandwidth);
    b.send(0, &read(0, 0x1000, 4), &[]).unwrap();
    b.respond(0, vec![0; 4]);

    assert!(b.engine.host_to_afu(100, true).unwrap().is_none());
    assert!(b.engine.host_to_afu(249, true).unwrap().is_none());
    assert!(b.engine.host_to_afu(250, true).unwrap().is_some());
}

#[test]
fn held_back_without_tready() {
    let mut b = bench();
    b.send(0, &read(0, 0x1000, 4), &[]).unwrap();
    b.respond(0, vec![0; 4]);
    assert!(b.engine.host_to_afu(1, false).unwrap().is_none());
    // the response was still collected
    assert_eq!(b.engine.pending_reads(), 0);
    assert_eq!(b.engine.queued_completions(), 1);
    assert!(b.engine.host_to_afu(2, true).unwrap().is_some());
}

#[test]
fn tag_mapper() {
    let params = StreamParams {
        max_outstanding_dma_rd_reqs: 2,
        emulate_tag_mapper: true,
        ..Default::default()
    };
    let mut b = bench_with(
        params,
        RuntimeOptions {
            unlimited_bw: true,
            ..Default::default()
        },
    );

    // duplicate AFU tags land in different slots
    b.send(1, &read(1, 0x1000, 4), &[]).unwrap();
    b.send(2, &read(1, 0x2000, 4), &[]).unwrap();
    assert_eq!(b.read_request().tag, 0);
    assert_eq!(b.read_request().tag, 1);
    assert!(!b.engine.afu_to_host_tready(3));

    // completions carry the AFU's tag
    b.respond(1, vec![0xaa; 4]);
    let flit = b.engine.host_to_afu(4, true).unwrap().unwrap();
    assert_eq!(codec::unpack(&flit).unwrap().tag, 1);
    assert!(b.engine.afu_to_host_tready(5));

    b.send(6, &read(0, 0x3000, 4), &[]).unwrap();
    assert_eq!(b.read_request().tag, 1);
    assert_eq!(b.violation(&read(0, 0x4000, 4), &[]), Violation::TagMapperExhausted);
}

fn completion(tag: u16, len_bytes: u32, byte_count: u16, low_addr: u32) -> TlpHeader {
    let mut hdr = TlpHeader::new(FmtType::CPLD);
    hdr.tag = tag;
    hdr.len_bytes = len_bytes;
    hdr.body = HeaderBody::Completion(CompletionFields {
        byte_count,
        low_addr,
        ..Default::default()
    });
    hdr
}

#[test]
fn mmio_read() {
    let mut b = bench();
    b.engine
        .new_mmio_request(MmioRequest::read(9, 1, 0x40, 64))
        .unwrap();

    let flit = b.engine.host_to_afu(1, true).unwrap().unwrap();
    assert!(flit.last);
    let hdr = codec::unpack(&flit).unwrap();
    assert_eq!(hdr.fmt_type, FmtType::MEM_READ32);
    assert_eq!(hdr.tag, 1);
    assert_eq!(hdr.len_bytes, 8);
    let req = hdr.request().unwrap();
    assert_eq!(req.addr, 0x40);
    assert_eq!((req.first_dw_be, req.last_dw_be), (0xf, 0xf));

    b.send(5, &completion(1, 8, 8, 0x40), &[0x1111_2222, 0x3333_4444])
        .unwrap();
    let rsp = b.mmio_rx.try_recv().unwrap();
    assert_eq!(rsp.tid, 9);
    assert_eq!(rsp.slot_idx, 1);
    assert_eq!(rsp.addr, 0x40);
    assert_eq!(rsp.width_bits, 64);
    assert!(!rsp.write);
    assert_eq!(rsp.data, vec![0x22, 0x22, 0x11, 0x11, 0x44, 0x44, 0x33, 0x33]);

    // the slot was freed
    assert_eq!(
        b.violation(&completion(1, 8, 8, 0x40), &[0, 0]),
        Violation::MmioTagInactive
    );
}

#[test]
fn mmio_request_checks() {
    let mut b = bench();
    b.engine
        .new_mmio_request(MmioRequest::read(0, 3, 0, 32))
        .unwrap();
    let err = b
        .engine
        .new_mmio_request(MmioRequest::read(1, 3, 0, 32))
        .unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::MmioSlotBusy(3)));

    let mut b = bench();
    let err = b
        .engine
        .new_mmio_request(MmioRequest::read(0, 64, 0, 32))
        .unwrap_err();
    assert_eq!(
        err.violation(),
        Some(&Violation::MmioSlotRange { slot: 64, max: 64 })
    );

    let mut b = bench();
    let err = b
        .engine
        .new_mmio_request(MmioRequest::read(0, 0, 0, 48))
        .unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::MmioWidth(48)));
}

#[test]
fn mmio_completion_rules() {
    let waiting = || {
        let mut b = bench();
        b.engine
            .new_mmio_request(MmioRequest::read(0, 0, 0, 64))
            .unwrap();
        b
    };
    assert_eq!(
        waiting().violation(&completion(64, 4, 4, 0), &[0]),
        Violation::MmioTagRange
    );
    assert_eq!(
        waiting().violation(&completion(0, 4, 8, 0), &[0]),
        Violation::SplitMmioCompletion
    );
    assert_eq!(
        waiting().violation(&completion(0, 128, 128, 0), &[0; 8]),
        Violation::MmioCompletionOver64
    );
    assert_eq!(
        violation_for(completion(0, 4, 4, 0), &[0]),
        Violation::MmioTagInactive
    );
}

#[test]
fn mmio_completion_to_idle_slot_fails_on_first_beat() {
    let mut b = bench();
    let cpl = completion(2, 64, 64, 0);
    let first = b.flit(Some(&cpl), &[0; 8], false);
    let err = b.engine.afu_to_host(1, &first).unwrap_err();
    assert_eq!(err.violation(), Some(&Violation::MmioTagInactive));
    assert!(b.engine.is_halted());
    assert!(b.mmio_rx.try_recv().is_err());
}

#[test]
fn mmio_write_spans_beats() {
    let mut b = bench();
    let data: Vec<u8> = (0..64).collect();
    b.engine
        .new_mmio_request(MmioRequest::write(3, 0x80, data.clone()))
        .unwrap();
    b.engine
        .new_mmio_request(MmioRequest::read(4, 0, 0x100, 32))
        .unwrap();

    let first = b.engine.host_to_afu(1, true).unwrap().unwrap();
    assert!(!first.last);
    let hdr = codec::unpack(&first).unwrap();
    assert_eq!(hdr.fmt_type, FmtType::MEM_WRITE32);
    assert_eq!(hdr.len_bytes, 64);
    assert_eq!(first.get_dw(HDR_DWORDS), 0x0302_0100);
    assert!(b.mmio_rx.try_recv().is_err());

    let second = b.engine.host_to_afu(2, true).unwrap().unwrap();
    assert!(second.last);
    assert_eq!(second.get_dw(0), u32::from_le_bytes([32, 33, 34, 35]));

    let ack = b.mmio_rx.try_recv().unwrap();
    assert!(ack.write);
    assert_eq!(ack.tid, 3);
    assert_eq!(ack.data, data);

    // MMIO starts are spaced out
    assert!(b.engine.host_to_afu(3, true).unwrap().is_none());
    assert!(b.engine.host_to_afu(63, true).unwrap().is_none());
    let read = b.engine.host_to_afu(64, true).unwrap().unwrap();
    assert_eq!(codec::unpack(&read).unwrap().len_bytes, 4);
    assert_eq!(
        codec::unpack(&read).unwrap().request().unwrap().last_dw_be,
        0
    );
}

#[test]
fn mmio_goes_before_completions() {
    let mut b = bench();
    b.send(0, &read(0, 0x1000, 4), &[]).unwrap();
    b.respond(0, vec![0; 4]);
    b.engine
        .new_mmio_request(MmioRequest::write(1, 0x8, vec![0; 4]))
        .unwrap();

    let first = b.engine.host_to_afu(1, true).unwrap().unwrap();
    assert_eq!(codec::unpack(&first).unwrap().fmt_type, FmtType::MEM_WRITE32);
    let second = b.engine.host_to_afu(2, true).unwrap().unwrap();
    assert_eq!(codec::unpack(&second).unwrap().fmt_type, FmtType::CPLD);
}

#[test]
fn reset_drops_partial_packet() {
    let mut b = bench();
    let first = b.flit(Some(&write(0x4000, 128)), &[0; 8], false);
    b.engine.afu_to_host(1, &first).unwrap();
    b.engine.reset();

    b.send(2, &read(0, 0x1000, 4), &[]).unwrap();
    assert_eq!(b.engine.pending_reads(), 1);
    assert_eq!(b.engine.pending_writes(), 0);
}

/// Follows the completions of several reads through random splitting,
/// reordering and back-pressure.
#[test]
fn split_completions() {
    let mut b = bench();
    b.engine = b.engine.with_random(Lcg::new(7));

    let reads = [
        (0u16, 0x1_0000u64, 512u32, 0xfu8, 0xfu8),
        (1, 0x2_0040, 256, 0xe, 0x7),
        (2, 0x3_0000, 128, 0xf, 0xf),
    ];
    for (i, (tag, addr, len, fbe, lbe)) in reads.iter().enumerate() {
        let hdr = request(FmtType::MEM_READ32, *tag, *addr, *len, *fbe, *lbe);
        b.send(i as u64, &hdr, &[]).unwrap();
        b.read_request();
        b.respond(*tag, vec![0x5a; *len as usize]);
    }

    // (len, byte_count, low_addr) per tag, in arrival order
    let mut seen: Vec<Vec<(u32, u32, u32)>> = vec![Vec::new(); reads.len()];
    let mut sop = true;
    for cycle in 10..5000 {
        let Some(flit) = b.engine.host_to_afu(cycle, true).unwrap() else {
            continue;
        };
        if sop {
            let hdr = codec::unpack(&flit).unwrap();
            let cpl = hdr.completion().unwrap();
            seen[hdr.tag as usize].push((hdr.len_bytes, cpl.byte_count as u32, cpl.low_addr));
        }
        sop = flit.last;
    }

    for (tag, addr, len, fbe, lbe) in reads {
        let cpls = &seen[tag as usize];
        assert!(!cpls.is_empty());
        assert!(!b.engine.dma_read_busy(tag as usize));
        assert_eq!(cpls.iter().map(|c| c.0).sum::<u32>(), len);

        let leading = fbe.trailing_zeros();
        let trailing = lbe.leading_zeros() - 4;
        let mut offset = 0;
        for (i, (cpl_len, byte_count, low_addr)) in cpls.iter().enumerate() {
            assert_eq!(cpl_len % 64, if i + 1 == cpls.len() { len % 64 } else { 0 });
            if i == 0 {
                assert_eq!(*byte_count, len - leading - trailing);
                assert_eq!(*low_addr as u64, (addr + leading as u64) & 0x7f);
            } else {
                assert_eq!(*byte_count, len - offset - trailing);
                assert_eq!(*low_addr as u64, (addr + offset as u64) & 0x7f);
            }
            offset += cpl_len;
        }
    }
}
