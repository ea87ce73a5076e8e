//! Stream parameters handed over by the RTL side at initialization, and the
//! environment toggles read once per process.

use std::env;

use crate::parser::HDR_DWORDS;

/// Set to force zero back-pressure and in-order completions.
pub const UNLIMITED_BW_ENV: &str = "ASE_UNLIMITED_BW";
/// Set to dump the simulated page tables on every change.
pub const PT_DEBUG_ENV: &str = "ASE_PT_DBG";

/// PU lengths are 10-bit DWORD counts, so 4 KiB is one byte too far.
const PU_MAX_BYTES: u32 = 4096 - 4;
/// DM lengths are 24 bits wide.
const DM_MAX_BYTES: u32 = (1 << 24) - 1;
/// Tags are 10 bits wide.
const MAX_TAGS: u32 = 1 << 10;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    #[error("tdata width {0} must be a multiple of 32 bits and hold an 8 DWORD header")]
    TdataWidth(u32),
    #[error("tuser width must be at least 1 bit")]
    TuserWidth,
    #[error("{name} ({value}) out of range 1..={max}")]
    OutOfRange {
        name: &'static str,
        value: u32,
        max: u32,
    },
    #[error("request completion boundary {0} must be a power of two of at least 4 bytes")]
    CompletionBoundary(u32),
    #[error("max read request bytes {max_rd_req_bytes} must be a multiple of the completion boundary {rcb}")]
    ReadRequestGranularity { max_rd_req_bytes: u32, rcb: u32 },
    #[error("default function pf {pf} vf {vf} does not fit the routing fields")]
    DefaultFunction { pf: u8, vf: u16 },
}

/// Parameter block mirrored from the simulator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamParams {
    pub tdata_width_bits: u32,
    pub tuser_width_bits: u32,
    /// DMA read tags must be less than this value.
    pub max_outstanding_dma_rd_reqs: u32,
    /// MMIO read tags must be less than this value.
    pub max_outstanding_mmio_rd_reqs: u32,
    pub num_afu_interrupts: u32,
    pub max_rd_req_bytes: u32,
    pub max_wr_payload_bytes: u32,
    pub max_dm_rd_req_bytes: u32,
    pub max_dm_wr_payload_bytes: u32,
    /// Minimum size of a split read completion.
    pub request_completion_boundary: u32,
    pub ordered_completions: bool,
    /// Accept duplicate DMA read tags, the way a FIM tag mapper would.
    pub emulate_tag_mapper: bool,
    pub default_pf_num: u8,
    pub default_vf_num: u16,
    pub default_vf_active: bool,
}

impl Default for StreamParams {
    fn default() -> Self {
        StreamParams {
            tdata_width_bits: 512,
            tuser_width_bits: 10,
            max_outstanding_dma_rd_reqs: 256,
            max_outstanding_mmio_rd_reqs: 64,
            num_afu_interrupts: 4,
            max_rd_req_bytes: 512,
            max_wr_payload_bytes: 512,
            max_dm_rd_req_bytes: 512,
            max_dm_wr_payload_bytes: 512,
            request_completion_boundary: 64,
            ordered_completions: false,
            emulate_tag_mapper: false,
            default_pf_num: 0,
            default_vf_num: 0,
            default_vf_active: false,
        }
    }
}

fn in_range(name: &'static str, value: u32, max: u32) -> Result<(), ConfigError> {
    if value == 0 || value > max {
        return Err(ConfigError::OutOfRange { name, value, max });
    }
    Ok(())
}

impl StreamParams {
    /// Checks the block once and derives the values the engine works with.
    pub fn validate(self) -> Result<StreamConfig, ConfigError> {
        let hdr_bits = (HDR_DWORDS * 32) as u32;
        if self.tdata_width_bits % 32 != 0 || self.tdata_width_bits < hdr_bits {
            return Err(ConfigError::TdataWidth(self.tdata_width_bits));
        }
        if self.tuser_width_bits == 0 {
            return Err(ConfigError::TuserWidth);
        }

        in_range("max_outstanding_dma_rd_reqs", self.max_outstanding_dma_rd_reqs, MAX_TAGS)?;
        in_range("max_outstanding_mmio_rd_reqs", self.max_outstanding_mmio_rd_reqs, MAX_TAGS)?;
        in_range("num_afu_interrupts", self.num_afu_interrupts, 1 << 16)?;
        in_range("max_rd_req_bytes", self.max_rd_req_bytes, PU_MAX_BYTES)?;
        in_range("max_wr_payload_bytes", self.max_wr_payload_bytes, PU_MAX_BYTES)?;
        in_range("max_dm_rd_req_bytes", self.max_dm_rd_req_bytes, DM_MAX_BYTES)?;
        in_range("max_dm_wr_payload_bytes", self.max_dm_wr_payload_bytes, DM_MAX_BYTES)?;

        let rcb = self.request_completion_boundary;
        if rcb < 4 || !rcb.is_power_of_two() {
            return Err(ConfigError::CompletionBoundary(rcb));
        }
        if self.max_rd_req_bytes % rcb != 0 {
            return Err(ConfigError::ReadRequestGranularity {
                max_rd_req_bytes: self.max_rd_req_bytes,
                rcb,
            });
        }

        if self.default_pf_num >= 8 || self.default_vf_num >= 1 << 11 {
            return Err(ConfigError::DefaultFunction {
                pf: self.default_pf_num,
                vf: self.default_vf_num,
            });
        }

        Ok(StreamConfig {
            tdata_dwords: (self.tdata_width_bits / 32) as usize,
            max_any_rd_req_bytes: self.max_rd_req_bytes.max(self.max_dm_rd_req_bytes),
            max_any_wr_payload_bytes: self.max_wr_payload_bytes.max(self.max_dm_wr_payload_bytes),
            params: self,
        })
    }
}

/// Validated parameters plus the values derived from them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamConfig {
    params: StreamParams,
    tdata_dwords: usize,
    max_any_rd_req_bytes: u32,
    max_any_wr_payload_bytes: u32,
}

impl StreamConfig {
    pub fn params(&self) -> &StreamParams {
        &self.params
    }

    pub fn hdr_dwords(&self) -> usize {
        HDR_DWORDS
    }

    pub fn tdata_dwords(&self) -> usize {
        self.tdata_dwords
    }

    pub fn tdata_width_bits(&self) -> usize {
        self.params.tdata_width_bits as usize
    }

    pub fn tuser_width_bits(&self) -> usize {
        self.params.tuser_width_bits as usize
    }

    pub fn max_any_rd_req_bytes(&self) -> u32 {
        self.max_any_rd_req_bytes
    }

    pub fn max_any_wr_payload_bytes(&self) -> u32 {
        self.max_any_wr_payload_bytes
    }
}

/// Process-wide switches taken from the environment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RuntimeOptions {
    /// Zero back-pressure, no reordering, no minimum completion latency.
    pub unlimited_bw: bool,
    pub pt_debug: bool,
}

impl RuntimeOptions {
    pub fn from_env() -> Self {
        RuntimeOptions {
            unlimited_bw: env::var_os(UNLIMITED_BW_ENV).is_some(),
            pt_debug: env::var_os(PT_DEBUG_ENV).is_some(),
        }
    }
}
