//! Simulated IOMMU page tables.
//!
//! Two 4-level radix trees map device-visible addresses to process virtual
//! addresses: the IOVA tree, filled by explicit [`PageTable::pin`] calls, and
//! the PA tree used for ATS emulation, where physical addresses are derived
//! from the VA with an invertible XOR mask. Both trees, the IOVA allocator
//! and the page-size cache share one mutex.

use std::fs;
use std::io;
use std::path::PathBuf;

use log::{debug, error, trace};
use parking_lot::{Mutex, MutexGuard};
use vm_allocator::{AddressAllocator, AllocPolicy};

use crate::config::RuntimeOptions;
use crate::parser;

const ENTRIES: usize = 512;
const ROOT_LEVEL: usize = 3;

/// The radix trees cover a 48-bit address space.
const ADDR_SPACE_SIZE: u64 = 1 << 48;
/// Interrupt window kept out of the IOVA space.
const MSI_HOLE_START: u64 = 0xfee0_0000;
const MSI_HOLE_SIZE: u64 = 0x10_0000;

#[derive(Debug, thiserror::Error)]
pub enum PageTableError {
    #[error("unsupported page length {0:#x}")]
    BadLength(u64),
    #[error("va {va:#x} is not aligned to its {len:#x} byte page")]
    Misaligned { va: u64, len: u64 },
    #[error("no free IOVA range of {0:#x} bytes")]
    AllocationExhausted(u64),
    #[error("nothing pinned at {addr:#x}")]
    NotPinned { addr: u64 },
    #[error("pin count at {addr:#x} would exceed 255")]
    RefcountOverflow { addr: u64 },
    #[error("kernel page size of {0} kB is not supported")]
    UnsupportedPageSize(u64),
    #[error("failed to read the process memory map")]
    MemoryMap(#[from] io::Error),
    #[error(transparent)]
    Allocator(#[from] vm_allocator::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageSize {
    Size4K,
    Size2M,
    Size1G,
}

impl PageSize {
    /// Smallest page holding `len` bytes. Lengths above 2 MiB must be exactly
    /// 1 GiB.
    pub fn from_len(len: u64) -> Result<Self, PageTableError> {
        match len {
            0 => Err(PageTableError::BadLength(len)),
            l if l <= 0x1000 => Ok(PageSize::Size4K),
            l if l <= 0x20_0000 => Ok(PageSize::Size2M),
            0x4000_0000 => Ok(PageSize::Size1G),
            _ => Err(PageTableError::BadLength(len)),
        }
    }

    /// Maps a `KernelPageSize` entry onto the page sizes the tables support.
    pub fn from_kernel_kb(kb: u64) -> Result<Self, PageTableError> {
        if kb >= 1024 * 1024 {
            Ok(PageSize::Size1G)
        } else if kb >= 2048 {
            Ok(PageSize::Size2M)
        } else if kb >= 4 {
            Ok(PageSize::Size4K)
        } else {
            Err(PageTableError::UnsupportedPageSize(kb))
        }
    }

    pub fn level(self) -> usize {
        match self {
            PageSize::Size4K => 0,
            PageSize::Size2M => 1,
            PageSize::Size1G => 2,
        }
    }

    pub fn bytes(self) -> u64 {
        1 << level_shift(self.level())
    }
}

fn level_shift(level: usize) -> u32 {
    12 + 9 * level as u32
}

fn index(addr: u64, level: usize) -> usize {
    ((addr >> level_shift(level)) & (ENTRIES as u64 - 1)) as usize
}

/// XOR mask turning a VA into the simulated PA at a given level. Offset bits
/// inside the page are left untouched.
fn pa_mask(level: usize) -> u64 {
    0x7fff_ffff_ffff & (!0u64 << level_shift(level))
}

enum Slot {
    Empty,
    Table(Box<Node>),
    Leaf { va: u64, refcount: u8 },
}

struct Node {
    slots: Vec<Slot>,
}

impl Node {
    fn new() -> Self {
        Node {
            slots: (0..ENTRIES).map(|_| Slot::Empty).collect(),
        }
    }
}

fn child_mut(slot: &mut Slot) -> &mut Node {
    if !matches!(slot, Slot::Table(_)) {
        *slot = Slot::Table(Box::new(Node::new()));
    }
    match slot {
        Slot::Table(child) => &mut **child,
        _ => unreachable!(),
    }
}

/// A terminal entry found by a lookup.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mapping {
    /// Page-aligned target VA.
    pub va: u64,
    pub level: usize,
    pub refcount: u8,
}

impl Mapping {
    /// VA for `addr` inside this page.
    pub fn translate(&self, addr: u64) -> u64 {
        self.va | (addr & ((1u64 << level_shift(self.level)) - 1))
    }
}

/// One 4-level tree. Level 3 is the root and never holds a leaf.
pub struct RadixTable {
    root: Node,
}

impl Default for RadixTable {
    fn default() -> Self {
        RadixTable { root: Node::new() }
    }
}

impl RadixTable {
    /// Maps the page of `level` holding `addr` to `va`, bumping its pin count.
    ///
    /// A smaller-page subtree already occupying the slot is dropped, and a
    /// huge page met on the way down is split away, so the newest pin always
    /// wins.
    pub fn pin(&mut self, addr: u64, va: u64, level: usize) -> Result<u8, PageTableError> {
        let mut node = &mut self.root;
        for l in (level + 1..=ROOT_LEVEL).rev() {
            let slot = &mut node.slots[index(addr, l)];
            if let Slot::Leaf { va: old, .. } = slot {
                debug!(
                    "addr {:#x}: replacing level {} page (va {:#x}) with a table",
                    addr, l, old
                );
            }
            node = child_mut(slot);
        }

        let slot = &mut node.slots[index(addr, level)];
        let refcount = match slot {
            Slot::Leaf { refcount, .. } => refcount
                .checked_add(1)
                .ok_or(PageTableError::RefcountOverflow { addr })?,
            Slot::Table(_) => {
                debug!(
                    "addr {:#x}: dropping smaller pages under the level {} page",
                    addr, level
                );
                1
            }
            Slot::Empty => 1,
        };
        *slot = Slot::Leaf { va, refcount };
        Ok(refcount)
    }

    fn slot_mut(&mut self, addr: u64, level: usize) -> Option<&mut Slot> {
        let mut node = &mut self.root;
        for l in (level + 1..=ROOT_LEVEL).rev() {
            match &mut node.slots[index(addr, l)] {
                Slot::Table(child) => node = &mut **child,
                _ => return None,
            }
        }
        Some(&mut node.slots[index(addr, level)])
    }

    /// Drops one pin of the level `level` page at `addr` and returns the pins
    /// left. The entry is cleared when none are.
    pub fn unpin(&mut self, addr: u64, level: usize) -> Result<u8, PageTableError> {
        let slot = self
            .slot_mut(addr, level)
            .ok_or(PageTableError::NotPinned { addr })?;
        let left = match slot {
            Slot::Leaf { refcount, .. } => {
                *refcount -= 1;
                *refcount
            }
            _ => return Err(PageTableError::NotPinned { addr }),
        };
        if left == 0 {
            *slot = Slot::Empty;
        }
        Ok(left)
    }

    /// Clears the level `level` page at `addr` regardless of its pin count.
    pub fn remove(&mut self, addr: u64, level: usize) -> bool {
        match self.slot_mut(addr, level) {
            Some(slot) if matches!(slot, Slot::Leaf { .. }) => {
                *slot = Slot::Empty;
                true
            }
            _ => false,
        }
    }

    pub fn lookup(&self, addr: u64) -> Option<Mapping> {
        let mut node = &self.root;
        for level in (0..=ROOT_LEVEL).rev() {
            match &node.slots[index(addr, level)] {
                Slot::Empty => return None,
                Slot::Leaf { va, refcount } => {
                    return Some(Mapping {
                        va: *va,
                        level,
                        refcount: *refcount,
                    })
                }
                Slot::Table(child) => node = &**child,
            }
        }
        None
    }

    pub fn leaf_count(&self) -> usize {
        fn count(node: &Node) -> usize {
            node.slots
                .iter()
                .map(|slot| match slot {
                    Slot::Empty => 0,
                    Slot::Leaf { .. } => 1,
                    Slot::Table(child) => count(child),
                })
                .sum()
        }
        count(&self.root)
    }

    pub fn clear(&mut self) {
        self.root = Node::new();
    }

    /// Writes every populated slot to the trace log.
    pub fn dump(&self, name: &str) {
        fn walk(node: &Node, level: usize, base: u64, name: &str) {
            let indent = 2 * (ROOT_LEVEL - level);
            for (i, slot) in node.slots.iter().enumerate() {
                let addr = base | ((i as u64) << level_shift(level));
                match slot {
                    Slot::Empty => {}
                    Slot::Leaf { va, refcount } => trace!(
                        "{}: {:indent$}L{} {:#014x} -> va {:#014x} [{}]",
                        name,
                        "",
                        level,
                        addr,
                        va,
                        refcount,
                        indent = indent
                    ),
                    Slot::Table(child) => {
                        trace!("{}: {:indent$}L{} {:#014x}", name, "", level, addr, indent = indent);
                        if let Some(next) = level.checked_sub(1) {
                            walk(child, next, addr, name);
                        }
                    }
                }
            }
        }
        walk(&self.root, ROOT_LEVEL, 0, name);
    }
}

/// One mapped VA range and the page size backing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VaRange {
    pub start: u64,
    pub end: u64,
    pub page_size_kb: u64,
}

/// Where [`PageTable::va_to_pa`] learns the page size backing a VA.
pub trait PageSizeSource: Send {
    fn scan(&mut self) -> io::Result<Vec<VaRange>>;
}

/// Reads `/proc/self/smaps`.
pub struct ProcSmaps {
    path: PathBuf,
}

impl Default for ProcSmaps {
    fn default() -> Self {
        ProcSmaps {
            path: PathBuf::from("/proc/self/smaps"),
        }
    }
}

impl PageSizeSource for ProcSmaps {
    fn scan(&mut self) -> io::Result<Vec<VaRange>> {
        let text = fs::read_to_string(&self.path)?;
        Ok(parse_smaps(&text))
    }
}

/// A fixed memory map, for processes whose layout is known up front.
#[derive(Debug, Clone, Default)]
pub struct FixedMemoryMap(pub Vec<VaRange>);

impl PageSizeSource for FixedMemoryMap {
    fn scan(&mut self) -> io::Result<Vec<VaRange>> {
        Ok(self.0.clone())
    }
}

fn parse_smaps(text: &str) -> Vec<VaRange> {
    let mut ranges = Vec::new();
    let mut current = None;
    for line in text.lines() {
        if let Ok((_, range)) = parser::smaps_range(line) {
            current = Some(range);
        } else if let Ok((_, kb)) = parser::kernel_page_size(line) {
            if let Some((start, end)) = current.take() {
                ranges.push(VaRange {
                    start,
                    end,
                    page_size_kb: kb,
                });
            }
        }
    }
    ranges
}

struct PageSizeCache {
    source: Box<dyn PageSizeSource>,
    ranges: Option<Vec<VaRange>>,
}

impl PageSizeCache {
    fn find(&self, va: u64) -> Option<VaRange> {
        self.ranges
            .as_ref()?
            .iter()
            .find(|r| r.start <= va && va < r.end)
            .copied()
    }

    /// `None` when nothing is mapped at `va`.
    fn page_size(&mut self, va: u64) -> Result<Option<PageSize>, PageTableError> {
        let range = match self.find(va) {
            Some(range) => Some(range),
            None => {
                self.ranges = Some(self.source.scan()?);
                self.find(va)
            }
        };
        range
            .map(|r| PageSize::from_kernel_kb(r.page_size_kb))
            .transpose()
    }

    fn invalidate(&mut self) {
        self.ranges = None;
    }
}

struct Inner {
    iova: RadixTable,
    pa: RadixTable,
    iova_space: AddressAllocator,
    page_sizes: PageSizeCache,
}

fn iova_space() -> Result<AddressAllocator, PageTableError> {
    let mut space = AddressAllocator::new(0, ADDR_SPACE_SIZE)?;
    space.allocate(
        MSI_HOLE_SIZE,
        0x1000,
        AllocPolicy::ExactMatch(MSI_HOLE_START),
    )?;
    Ok(space)
}

/// A translation that keeps the tables locked until dropped.
///
/// No other [`PageTable`] call may be made while one is alive.
pub struct LockedTranslation<'a> {
    _guard: MutexGuard<'a, Inner>,
    va: u64,
}

impl LockedTranslation<'_> {
    pub fn va(&self) -> u64 {
        self.va
    }
}

pub struct PageTable {
    inner: Mutex<Inner>,
    pt_debug: bool,
}

impl PageTable {
    /// Tables whose page sizes come from `/proc/self/smaps`.
    pub fn new(options: &RuntimeOptions) -> Result<Self, PageTableError> {
        Self::with_page_sizes(options, ProcSmaps::default())
    }

    pub fn with_page_sizes(
        options: &RuntimeOptions,
        source: impl PageSizeSource + 'static,
    ) -> Result<Self, PageTableError> {
        Ok(PageTable {
            inner: Mutex::new(Inner {
                iova: RadixTable::default(),
                pa: RadixTable::default(),
                iova_space: iova_space()?,
                page_sizes: PageSizeCache {
                    source: Box::new(source),
                    ranges: None,
                },
            }),
            pt_debug: options.pt_debug,
        })
    }

    fn dump(&self, inner: &Inner) {
        if self.pt_debug {
            inner.iova.dump("IOVA");
            inner.pa.dump("PA");
        }
    }

    /// Pins the `len` byte page at `va` and returns a fresh IOVA for it.
    pub fn pin(&self, va: u64, len: u64) -> Result<u64, PageTableError> {
        let size = PageSize::from_len(len)?;
        let bytes = size.bytes();
        if va & (bytes - 1) != 0 {
            return Err(PageTableError::Misaligned { va, len: bytes });
        }

        let mut inner = self.inner.lock();
        let range = inner
            .iova_space
            .allocate(bytes, bytes, AllocPolicy::FirstMatch)
            .map_err(|_| PageTableError::AllocationExhausted(bytes))?;
        let iova = range.start();
        if let Err(e) = inner.iova.pin(iova, va, size.level()) {
            inner.iova_space.free(&range)?;
            return Err(e);
        }
        debug!("pin va {:#x} len {:#x} -> iova {:#x}", va, bytes, iova);
        self.dump(&inner);
        Ok(iova)
    }

    pub fn unpin(&self, iova: u64, len: u64) -> Result<(), PageTableError> {
        let size = PageSize::from_len(len)?;
        let bytes = size.bytes();

        let mut inner = self.inner.lock();
        let left = inner.iova.unpin(iova, size.level())?;
        if left == 0 {
            let range = vm_allocator::RangeInclusive::new(iova, iova + bytes - 1)?;
            inner.iova_space.free(&range)?;
        }
        debug!("unpin iova {:#x} len {:#x}, {} pins left", iova, bytes, left);
        self.dump(&inner);
        Ok(())
    }

    pub fn translate(&self, iova: u64) -> Option<u64> {
        let inner = self.inner.lock();
        inner.iova.lookup(iova).map(|m| m.translate(iova))
    }

    /// Like [`translate`](Self::translate), but the mapping stays valid until
    /// the returned guard is dropped.
    pub fn translate_locked(&self, iova: u64) -> Option<LockedTranslation<'_>> {
        let guard = self.inner.lock();
        let va = guard.iova.lookup(iova)?.translate(iova);
        Some(LockedTranslation { _guard: guard, va })
    }

    pub fn pa_to_va(&self, pa: u64) -> Option<u64> {
        let inner = self.inner.lock();
        inner.pa.lookup(pa).map(|m| m.translate(pa))
    }

    pub fn pa_to_va_locked(&self, pa: u64) -> Option<LockedTranslation<'_>> {
        let guard = self.inner.lock();
        let va = guard.pa.lookup(pa)?.translate(pa);
        Some(LockedTranslation { _guard: guard, va })
    }

    /// Simulated physical address and page length for `va`, recording the
    /// mapping in the PA tree. `None` when `va` is not mapped.
    pub fn va_to_pa(&self, va: u64) -> Result<Option<(u64, u64)>, PageTableError> {
        let mut inner = self.inner.lock();
        let size = match inner.page_sizes.page_size(va)? {
            Some(size) => size,
            None => return Ok(None),
        };
        let level = size.level();
        let page_mask = size.bytes() - 1;
        let pa = va ^ pa_mask(level);
        let (va_page, pa_page) = (va & !page_mask, pa & !page_mask);

        match inner.pa.lookup(pa_page) {
            Some(m) if m.va == va_page && m.level == level => {}
            existing => {
                if let Some(m) = existing {
                    error!(
                        "pa {:#x} maps va {:#x} at level {}, expected va {:#x} at level {}",
                        pa_page, m.va, m.level, va_page, level
                    );
                }
                inner.pa.pin(pa_page, va_page, level)?;
                debug!("map va {:#x} -> pa {:#x} level {}", va_page, pa_page, level);
                self.dump(&inner);
            }
        }

        Ok(Some((pa, size.bytes())))
    }

    /// Forgets every PA translation inside `[va, va + len)`. Called when the
    /// process address space changes under those pages.
    pub fn invalidate_va_range(&self, va: u64, len: u64) {
        let mut inner = self.inner.lock();
        inner.page_sizes.invalidate();

        let end = va.saturating_add(len);
        let mut cur = va & !0xfff;
        while cur < end {
            let mut next = cur + 0x1000;
            for size in [PageSize::Size1G, PageSize::Size2M, PageSize::Size4K] {
                let level = size.level();
                let va_page = cur & !(size.bytes() - 1);
                let pa_page = va_page ^ pa_mask(level);
                let hit = inner
                    .pa
                    .lookup(pa_page)
                    .filter(|m| m.level == level && m.va == va_page);
                if hit.is_some() {
                    inner.pa.remove(pa_page, level);
                    debug!("invalidate va {:#x} pa {:#x}", va_page, pa_page);
                    next = va_page + size.bytes();
                    break;
                }
            }
            cur = next;
        }
        self.dump(&inner);
    }

    /// Number of pinned IOVA pages.
    pub fn pinned_pages(&self) -> usize {
        self.inner.lock().iova.leaf_count()
    }

    /// Tears both trees down and returns every IOVA to the allocator.
    pub fn terminate(&self) -> Result<(), PageTableError> {
        let mut inner = self.inner.lock();
        inner.iova.clear();
        inner.pa.clear();
        inner.iova_space = iova_space()?;
        inner.page_sizes.invalidate();
        debug!("page tables torn down");
        Ok(())
    }
}
