//! DMA traffic between the engine and the emulated host memory.
//!
//! The engine posts requests and polls for responses without blocking. A
//! [`HostMemoryService`] on the other end of the channels resolves addresses
//! through the [`PageTable`] and touches guest memory while the table stays
//! locked, so a concurrent unpin cannot pull a page out from under an access.

use std::fmt;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{select, unbounded, Receiver, Sender, TryRecvError};
use log::{debug, error, trace, warn};
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

use crate::ats::{encode_translation, ATS_READ, ATS_WRITE};
use crate::header::AddressType;
use crate::page_table::PageTable;

const PAGE_4K: u64 = 0x1000;

/// Outcome of a host memory access.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemStatus {
    Valid = 0,
    Illegal = 1,
    /// No IOVA mapping.
    NotPinned = 2,
    /// No PA mapping.
    NotMapped = 3,
    /// The access runs past the end of a 4 KiB page.
    Crosses4K = 4,
}

impl fmt::Display for MemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            MemStatus::Valid => "valid",
            MemStatus::Illegal => "illegal address",
            MemStatus::NotPinned => "page not pinned",
            MemStatus::NotMapped => "physical address not mapped",
            MemStatus::Crosses4K => "access crosses a 4KB boundary",
        })
    }
}

/// Operands of an atomic read-modify-write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomicOp {
    FetchAdd(u64),
    Swap(u64),
    Cas { compare: u64, swap: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadRequest {
    pub addr: u64,
    pub addr_type: AddressType,
    /// 0 for a fence. For atomics, the operand size.
    pub data_bytes: u32,
    pub tag: u16,
    pub pasid: Option<u32>,
    pub atomic: Option<AtomicOp>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRequest {
    pub addr: u64,
    pub addr_type: AddressType,
    pub pasid: Option<u32>,
    /// First and last DWORD byte enables, `None` when every byte is written.
    pub byte_en: Option<(u8, u8)>,
    pub data: Vec<u8>,
}

/// Requests share one queue so that a read issued after a write observes it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemRequest {
    Read(ReadRequest),
    Write(WriteRequest),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadResponse {
    pub tag: u16,
    pub status: MemStatus,
    pub pa: u64,
    pub va: u64,
    /// The old value for atomics, the translation entries for ATS requests.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteResponse {
    pub status: MemStatus,
    pub pa: u64,
    pub va: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("host memory channel disconnected")]
pub struct Disconnected;

/// The engine's end of the channels.
pub struct HostMemoryPort {
    req_tx: Sender<MemRequest>,
    rd_rsp_rx: Receiver<ReadResponse>,
    wr_rsp_rx: Receiver<WriteResponse>,
}

/// The service's end of the channels.
pub struct HostMemoryEndpoint {
    pub req_rx: Receiver<MemRequest>,
    pub rd_rsp_tx: Sender<ReadResponse>,
    pub wr_rsp_tx: Sender<WriteResponse>,
}

pub fn channel() -> (HostMemoryPort, HostMemoryEndpoint) {
    let (req, rd, wr) = (unbounded(), unbounded(), unbounded());
    (
        HostMemoryPort {
            req_tx: req.0,
            rd_rsp_rx: rd.1,
            wr_rsp_rx: wr.1,
        },
        HostMemoryEndpoint {
            req_rx: req.1,
            rd_rsp_tx: rd.0,
            wr_rsp_tx: wr.0,
        },
    )
}

fn try_recv<T>(rx: &Receiver<T>) -> Result<Option<T>, Disconnected> {
    match rx.try_recv() {
        Ok(v) => Ok(Some(v)),
        Err(TryRecvError::Empty) => Ok(None),
        Err(TryRecvError::Disconnected) => Err(Disconnected),
    }
}

impl HostMemoryPort {
    pub fn send_read(&self, req: ReadRequest) -> Result<(), Disconnected> {
        self.req_tx
            .send(MemRequest::Read(req))
            .map_err(|_| Disconnected)
    }

    pub fn send_write(&self, req: WriteRequest) -> Result<(), Disconnected> {
        self.req_tx
            .send(MemRequest::Write(req))
            .map_err(|_| Disconnected)
    }

    pub fn try_recv_read(&self) -> Result<Option<ReadResponse>, Disconnected> {
        try_recv(&self.rd_rsp_rx)
    }

    pub fn try_recv_write(&self) -> Result<Option<WriteResponse>, Disconnected> {
        try_recv(&self.wr_rsp_rx)
    }
}

/// Where an access failed.
#[derive(Debug, Clone, Copy)]
struct Fault {
    status: MemStatus,
    pa: u64,
    va: u64,
}

impl Fault {
    fn new(status: MemStatus, pa: u64) -> Self {
        Fault { status, pa, va: 0 }
    }
}

/// Byte enable of byte `idx` in a `len` byte write.
fn byte_enabled(idx: usize, len: usize, first_be: u8, last_be: u8) -> bool {
    let dw = idx / 4;
    let last_dw = (len.max(1) - 1) / 4;
    let be = if dw == 0 {
        first_be
    } else if dw == last_dw {
        last_be
    } else {
        0xf
    };
    be & (1 << (idx % 4)) != 0
}

fn atomic_result(op: AtomicOp, old: u64, mask: u64) -> u64 {
    let new = match op {
        AtomicOp::FetchAdd(v) => old.wrapping_add(v),
        AtomicOp::Swap(v) => v,
        AtomicOp::Cas { compare, swap } => {
            if old == compare & mask {
                swap
            } else {
                old
            }
        }
    };
    new & mask
}

/// Serves DMA requests against guest memory indexed by host virtual address.
pub struct HostMemoryService {
    page_table: Arc<PageTable>,
    memory: GuestMemoryMmap,
    endpoint: HostMemoryEndpoint,
}

impl HostMemoryService {
    pub fn new(
        page_table: Arc<PageTable>,
        memory: GuestMemoryMmap,
        endpoint: HostMemoryEndpoint,
    ) -> Self {
        HostMemoryService {
            page_table,
            memory,
            endpoint,
        }
    }

    /// Runs `f` with the VA of every 4 KiB piece of `[addr, addr + len)`,
    /// holding the page table lock for the duration of each call. `f` gets
    /// the VA and the piece's offset range within the access.
    fn for_each_page<F>(
        &self,
        addr: u64,
        addr_type: AddressType,
        len: usize,
        mut f: F,
    ) -> Result<(u64, u64), Fault>
    where
        F: FnMut(u64, std::ops::Range<usize>) -> Result<(), MemStatus>,
    {
        let mut first = None;
        let mut done = 0;
        while done < len {
            let cur = addr.wrapping_add(done as u64);
            let chunk = ((PAGE_4K - (cur & (PAGE_4K - 1))) as usize).min(len - done);

            let locked = match addr_type {
                AddressType::Untranslated => self
                    .page_table
                    .translate_locked(cur)
                    .ok_or(Fault::new(MemStatus::NotPinned, cur))?,
                AddressType::Translated => self
                    .page_table
                    .pa_to_va_locked(cur)
                    .ok_or(Fault::new(MemStatus::NotMapped, cur))?,
                _ => return Err(Fault::new(MemStatus::Illegal, cur)),
            };
            let va = locked.va();
            first.get_or_insert((cur, va));
            f(va, done..done + chunk).map_err(|status| Fault { status, pa: cur, va })?;
            drop(locked);

            done += chunk;
        }
        Ok(first.unwrap_or((addr, 0)))
    }

    fn read(&self, req: &ReadRequest) -> Result<(u64, u64, Vec<u8>), Fault> {
        if req.addr_type == AddressType::TranslationRequest {
            return self.translate(req);
        }

        if let Some(op) = req.atomic {
            return self.atomic(req, op);
        }

        let mut data = vec![0u8; req.data_bytes as usize];
        if data.is_empty() {
            // fence
            return Ok((req.addr, 0, data));
        }
        let (pa, va) = self.for_each_page(req.addr, req.addr_type, data.len(), |va, r| {
            self.memory
                .read_slice(&mut data[r], GuestAddress(va))
                .map_err(|_| MemStatus::Illegal)
        })?;
        Ok((pa, va, data))
    }

    fn atomic(&self, req: &ReadRequest, op: AtomicOp) -> Result<(u64, u64, Vec<u8>), Fault> {
        let size = req.data_bytes as usize;
        if size != 4 && size != 8 {
            return Err(Fault::new(MemStatus::Illegal, req.addr));
        }
        if (req.addr & (PAGE_4K - 1)) as usize + size > PAGE_4K as usize {
            return Err(Fault::new(MemStatus::Crosses4K, req.addr));
        }
        let mask = if size == 4 { u32::MAX as u64 } else { u64::MAX };

        let mut old = [0u8; 8];
        let (pa, va) = self.for_each_page(req.addr, req.addr_type, size, |va, _| {
            let addr = GuestAddress(va);
            self.memory
                .read_slice(&mut old[..size], addr)
                .map_err(|_| MemStatus::Illegal)?;
            let new = atomic_result(op, u64::from_le_bytes(old), mask);
            self.memory
                .write_slice(&new.to_le_bytes()[..size], addr)
                .map_err(|_| MemStatus::Illegal)
        })?;
        Ok((pa, va, old[..size].to_vec()))
    }

    /// One translation entry per 4 KiB IOVA page. Unmapped pages translate
    /// to 0, which grants no access.
    fn translate(&self, req: &ReadRequest) -> Result<(u64, u64, Vec<u8>), Fault> {
        let entries = req.data_bytes as u64 / 8;
        let mut data = Vec::with_capacity(req.data_bytes as usize);
        let mut first_va = 0;
        for i in 0..entries {
            let iova = req
                .addr
                .checked_add(i * PAGE_4K)
                .ok_or(Fault::new(MemStatus::Illegal, req.addr))?;
            let entry = match self.page_table.translate(iova) {
                Some(va) => {
                    if i == 0 {
                        first_va = va;
                    }
                    match self.page_table.va_to_pa(va) {
                        Ok(Some((pa, page_len))) => {
                            encode_translation(pa, page_len, ATS_READ | ATS_WRITE)
                        }
                        Ok(None) => 0,
                        Err(e) => {
                            error!("translation of iova {:#x} failed: {}", iova, e);
                            return Err(Fault::new(MemStatus::Illegal, iova));
                        }
                    }
                }
                None => 0,
            };
            data.extend_from_slice(&entry.to_le_bytes());
        }
        Ok((req.addr, first_va, data))
    }

    fn write(&self, req: &WriteRequest) -> Result<(u64, u64), Fault> {
        let len = req.data.len();
        self.for_each_page(req.addr, req.addr_type, len, |va, r| {
            let addr = GuestAddress(va);
            let res = match req.byte_en {
                None => self.memory.write_slice(&req.data[r], addr),
                Some((fbe, lbe)) => {
                    let mut merged = vec![0u8; r.len()];
                    self.memory
                        .read_slice(&mut merged, addr)
                        .map_err(|_| MemStatus::Illegal)?;
                    for (i, byte) in merged.iter_mut().enumerate() {
                        let idx = r.start + i;
                        if byte_enabled(idx, len, fbe, lbe) {
                            *byte = req.data[idx];
                        }
                    }
                    self.memory.write_slice(&merged, addr)
                }
            };
            res.map_err(|_| MemStatus::Illegal)
        })
    }

    /// Serves one request and posts its response.
    pub fn handle(&self, req: MemRequest) {
        match req {
            MemRequest::Read(req) => {
                let rsp = match self.read(&req) {
                    Ok((pa, va, data)) => ReadResponse {
                        tag: req.tag,
                        status: MemStatus::Valid,
                        pa,
                        va,
                        data,
                    },
                    Err(fault) => {
                        debug!(
                            "read {:#x} ({} bytes) failed: {}",
                            req.addr, req.data_bytes, fault.status
                        );
                        ReadResponse {
                            tag: req.tag,
                            status: fault.status,
                            pa: fault.pa,
                            va: fault.va,
                            data: Vec::new(),
                        }
                    }
                };
                trace!("read tag {} -> {}", rsp.tag, rsp.status);
                if let Err(e) = self.endpoint.rd_rsp_tx.send(rsp) {
                    warn!("engine gone, read tag {} response dropped", e.0.tag);
                }
            }
            MemRequest::Write(req) => {
                let rsp = match self.write(&req) {
                    Ok((pa, va)) => WriteResponse {
                        status: MemStatus::Valid,
                        pa,
                        va,
                    },
                    Err(fault) => {
                        debug!(
                            "write {:#x} ({} bytes) failed: {}",
                            req.addr,
                            req.data.len(),
                            fault.status
                        );
                        WriteResponse {
                            status: fault.status,
                            pa: fault.pa,
                            va: fault.va,
                        }
                    }
                };
                if self.endpoint.wr_rsp_tx.send(rsp).is_err() {
                    warn!("engine gone, write {:#x} response dropped", req.addr);
                }
            }
        }
    }

    /// Serves every request already queued and returns how many there were.
    pub fn service_pending(&self) -> usize {
        let mut served = 0;
        while let Ok(req) = self.endpoint.req_rx.try_recv() {
            self.handle(req);
            served += 1;
        }
        served
    }

    /// Serves requests until `exit` fires or the engine drops its port.
    pub fn run(&self, exit: &Receiver<()>) {
        loop {
            select! {
                recv(self.endpoint.req_rx) -> msg => {
                    match msg {
                        Ok(req) => self.handle(req),
                        Err(_) => break,
                    }
                },

                recv(exit) -> _ => break,
            }
        }
    }

    /// Moves the service onto its own thread.
    pub fn spawn(self) -> HostMemoryThread {
        let (exit_tx, exit_rx) = unbounded();
        let handle = thread::spawn(move || self.run(&exit_rx));
        HostMemoryThread {
            exit: exit_tx,
            handle,
        }
    }
}

pub struct HostMemoryThread {
    exit: Sender<()>,
    handle: JoinHandle<()>,
}

impl HostMemoryThread {
    pub fn stop(self) {
        let _ = self.exit.send(());
        if self.handle.join().is_err() {
            error!("host memory thread panicked");
        }
    }
}
