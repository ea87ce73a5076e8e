//! The fixed-width stream lanes exchanged with the RTL simulator once per
//! clock edge.

use std::fmt;

use crate::config::StreamConfig;

/// A packed little-endian bit vector, bit 0 being the LSB of byte 0.
///
/// Part selects outside the vector width read as zero and are dropped on
/// write, the same way a SystemVerilog part select behaves.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct BitVector {
    bytes: Vec<u8>,
    width_bits: usize,
}

impl BitVector {
    pub fn new(width_bits: usize) -> Self {
        BitVector {
            bytes: vec![0; (width_bits + 7) / 8],
            width_bits,
        }
    }

    /// Builds a vector from a byte image. Missing bytes are zero, excess bytes
    /// are truncated.
    pub fn from_bytes(bytes: &[u8], width_bits: usize) -> Self {
        let mut v = BitVector::new(width_bits);
        let n = bytes.len().min(v.bytes.len());
        v.bytes[..n].copy_from_slice(&bytes[..n]);
        v.mask_top();
        v
    }

    pub fn width_bits(&self) -> usize {
        self.width_bits
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn clear(&mut self) {
        self.bytes.iter_mut().for_each(|b| *b = 0);
    }

    pub fn is_zero(&self) -> bool {
        self.bytes.iter().all(|b| *b == 0)
    }

    pub fn get_bit(&self, idx: usize) -> bool {
        idx < self.width_bits && self.bytes[idx / 8] & (1 << (idx % 8)) != 0
    }

    pub fn put_bit(&mut self, idx: usize, value: bool) {
        if idx >= self.width_bits {
            return;
        }
        let mask = 1u8 << (idx % 8);
        if value {
            self.bytes[idx / 8] |= mask;
        } else {
            self.bytes[idx / 8] &= !mask;
        }
    }

    /// Reads `width` (at most 64) bits starting at `lsb`.
    pub fn get_bits(&self, lsb: usize, width: usize) -> u64 {
        debug_assert!(width <= 64);
        (0..width).fold(0u64, |acc, i| acc | (self.get_bit(lsb + i) as u64) << i)
    }

    /// Writes the low `width` (at most 64) bits of `value` starting at `lsb`.
    pub fn put_bits(&mut self, lsb: usize, width: usize, value: u64) {
        debug_assert!(width <= 64);
        for i in 0..width {
            self.put_bit(lsb + i, (value >> i) & 1 != 0);
        }
    }

    pub fn get_dw(&self, idx: usize) -> u32 {
        self.get_bits(idx * 32, 32) as u32
    }

    pub fn put_dw(&mut self, idx: usize, value: u32) {
        self.put_bits(idx * 32, 32, value as u64);
    }

    fn mask_top(&mut self) {
        let rem = self.width_bits % 8;
        if rem != 0 {
            if let Some(last) = self.bytes.last_mut() {
                *last &= (1u8 << rem) - 1;
            }
        }
    }
}

impl fmt::Display for BitVector {
    /// Hex dump, most significant DWORD first, with an underscore every
    /// 64 bits.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n_dwords = ((self.width_bits + 31) / 32).max(1);
        f.write_str("0x")?;
        for i in (0..n_dwords).rev() {
            if i & 1 != 0 && i != n_dwords - 1 {
                f.write_str("_")?;
            }
            write!(f, "{:08x}", self.get_dw(i))?;
        }
        Ok(())
    }
}

impl fmt::Debug for BitVector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BitVector<{}>({})", self.width_bits, self)
    }
}

/// One beat of the AXI-S TLP stream: tdata, tuser, tkeep and tlast.
#[derive(Clone, PartialEq, Eq, Debug)]
pub struct Flit {
    pub data: BitVector,
    pub user: BitVector,
    /// One bit per tdata byte.
    pub keep: BitVector,
    pub last: bool,
}

impl Flit {
    pub fn new(cfg: &StreamConfig) -> Self {
        Flit::with_widths(cfg.tdata_width_bits(), cfg.tuser_width_bits())
    }

    pub fn with_widths(tdata_width_bits: usize, tuser_width_bits: usize) -> Self {
        Flit {
            data: BitVector::new(tdata_width_bits),
            user: BitVector::new(tuser_width_bits),
            keep: BitVector::new(tdata_width_bits / 8),
            last: false,
        }
    }

    pub fn reset(&mut self) {
        self.data.clear();
        self.user.clear();
        self.keep.clear();
        self.last = false;
    }

    pub fn tdata_dwords(&self) -> usize {
        self.data.width_bits() / 32
    }

    /// tuser bit 0 selects the data mover encoding.
    pub fn dm_mode(&self) -> bool {
        self.user.get_bit(0)
    }

    pub fn set_dm_mode(&mut self, dm_mode: bool) {
        self.user.put_bit(0, dm_mode);
    }

    /// Stores a DWORD and its 4-bit keep mask.
    pub fn put_dw(&mut self, idx: usize, value: u32, keep: u8) {
        self.data.put_dw(idx, value);
        self.keep.put_bits(idx * 4, 4, (keep & 0xf) as u64);
    }

    pub fn get_dw(&self, idx: usize) -> u32 {
        self.data.get_dw(idx)
    }
}

impl fmt::Display for Flit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} tkeep {}", self.data, self.keep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_select() {
        let mut v = BitVector::new(96);
        v.put_bits(30, 8, 0xff);
        assert_eq!(v.get_dw(0), 0xc000_0000);
        assert_eq!(v.get_dw(1), 0x3f);
        assert_eq!(v.get_bits(30, 8), 0xff);

        v.put_bits(90, 16, 0xffff);
        assert_eq!(v.get_bits(90, 16), 0x3f);
        assert_eq!(v.get_dw(2), 0xfc00_0000);

        v.put_bits(31, 2, 0);
        assert_eq!(v.get_bits(30, 8), 0xf9);
    }

    #[test]
    fn from_bytes_truncates() {
        let v = BitVector::from_bytes(&[0xff, 0xff, 0xff], 12);
        assert_eq!(v.as_bytes(), &[0xff, 0x0f]);
        assert_eq!(v.get_bits(0, 16), 0xfff);
    }

    #[test]
    fn display() {
        let mut v = BitVector::new(128);
        v.put_dw(0, 0x1);
        v.put_dw(3, 0xdeadbeef);
        assert_eq!(v.to_string(), "0xdeadbeef00000000_0000000000000001");

        let mut flit = Flit::with_widths(64, 10);
        flit.put_dw(1, 0xabcd, 0xf);
        flit.set_dm_mode(true);
        assert!(flit.dm_mode());
        assert_eq!(flit.to_string(), "0x0000abcd00000000 tkeep 0x000000f0");
    }
}
