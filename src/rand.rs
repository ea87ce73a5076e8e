//! Pseudo-random source behind back-pressure, completion splitting and
//! completion reordering.
//!
//! Every decision compares draws against fixed thresholds, with a draw of 0
//! always meaning "maximum throughput". [`FullBandwidth`] therefore turns all
//! of the randomization off.

use crate::config::RuntimeOptions;

pub trait RandomSource {
    /// A value in `0..32768`.
    fn next_u32(&mut self) -> u32;
}

/// The repeatable linear congruential generator of the C library example
/// `rand()`. Runs with the same seed and inputs produce the same streams.
#[derive(Debug, Clone)]
pub struct Lcg {
    state: u64,
}

impl Lcg {
    pub fn new(seed: u64) -> Self {
        Lcg { state: seed }
    }
}

impl Default for Lcg {
    fn default() -> Self {
        Lcg::new(1)
    }
}

impl RandomSource for Lcg {
    fn next_u32(&mut self) -> u32 {
        self.state = self.state.wrapping_mul(1_103_515_245).wrapping_add(12_345);
        ((self.state / 65_536) as u32) % 32_768
    }
}

/// Always draws 0.
#[derive(Debug, Clone, Copy, Default)]
pub struct FullBandwidth;

impl RandomSource for FullBandwidth {
    fn next_u32(&mut self) -> u32 {
        0
    }
}

/// The source selected by `ASE_UNLIMITED_BW`.
pub fn from_options(options: &RuntimeOptions) -> Box<dyn RandomSource + Send> {
    if options.unlimited_bw {
        Box::new(FullBandwidth)
    } else {
        Box::new(Lcg::default())
    }
}
