// The engine sits between the RTL device and the host side of the simulator.
// Host initiated traffic (MMIO) arrives through `TransactionEngine::new_mmio_request`
// and leaves through the traits below, so the host side can be a plain channel
// or a callback into the simulator.

use crossbeam_channel::Sender;
use log::warn;

/// A host MMIO access targeting the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioRequest {
    /// Transaction id chosen by the host side, echoed in the response.
    pub tid: u16,
    pub addr: u64,
    /// 32, 64 or a wider multiple of 32.
    pub width_bits: u32,
    pub write: bool,
    /// Outstanding read slot. Ignored for writes.
    pub slot_idx: u16,
    /// Write data, `width_bits / 8` bytes.
    pub data: Vec<u8>,
}

impl MmioRequest {
    pub fn read(tid: u16, slot_idx: u16, addr: u64, width_bits: u32) -> Self {
        MmioRequest {
            tid,
            addr,
            width_bits,
            write: false,
            slot_idx,
            data: Vec::new(),
        }
    }

    pub fn write(tid: u16, addr: u64, data: Vec<u8>) -> Self {
        MmioRequest {
            tid,
            addr,
            width_bits: data.len() as u32 * 8,
            write: true,
            slot_idx: 0,
            data,
        }
    }

    pub fn len_bytes(&self) -> u32 {
        self.width_bits / 8
    }
}

/// Read data returned by the device, or the acknowledgement of a write once
/// it has been sent to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MmioResponse {
    pub tid: u16,
    pub write: bool,
    pub width_bits: u32,
    /// Full request address for writes, the completion's lower address for
    /// reads.
    pub addr: u64,
    pub slot_idx: u16,
    pub data: Vec<u8>,
}

impl From<&MmioRequest> for MmioResponse {
    fn from(req: &MmioRequest) -> Self {
        MmioResponse {
            tid: req.tid,
            write: req.write,
            width_bits: req.width_bits,
            addr: req.addr,
            slot_idx: req.slot_idx,
            data: req.data.clone(),
        }
    }
}

pub trait MmioResponder {
    fn mmio_response(&mut self, rsp: MmioResponse);
}

/// Receives interrupts raised by the device.
pub trait InterruptSink {
    fn interrupt(&mut self, vector: u16);
}

impl MmioResponder for Sender<MmioResponse> {
    fn mmio_response(&mut self, rsp: MmioResponse) {
        if let Err(e) = self.send(rsp) {
            warn!("dropping MMIO response tid {}: receiver gone", e.0.tid);
        }
    }
}

impl InterruptSink for Sender<u16> {
    fn interrupt(&mut self, vector: u16) {
        if self.send(vector).is_err() {
            warn!("dropping interrupt {}: receiver gone", vector);
        }
    }
}
