use std::collections::HashMap;
use std::sync::Arc;

use crate::symbols::SymbolTable;

/// The traces we parse target 32-bit virtual address layouts; everything
/// above that is context-marker noise or sign extension.
const ADDR_MASK: u64 = 0xffff_ffff;

/// 4 MiB buckets keep each lookup to a short scan instead of a walk over
/// every mapping in the process.
const BUCKET_SHIFT: u32 = 22;
const BUCKET_SIZE: u64 = 1 << BUCKET_SHIFT;

#[derive(Clone)]
struct Mapping {
    start: u64,
    end: u64,
    file_offset: u64,
    symbols: Arc<SymbolTable>,
}

/// A process's (or the kernel's) view of which object backs each range of
/// virtual addresses. Mappings are recorded in arrival order and scanned
/// in reverse, so a later overlapping mapping supersedes an earlier one
/// without any explicit unmap handling.
#[derive(Clone, Default)]
pub struct AddressSpace {
    buckets: HashMap<u64, Vec<Mapping>>,
}

impl AddressSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a mapping of `[start, end)` to `symbols` at `file_offset`.
    /// The range is split across buckets so a lookup only ever tests the
    /// entries of one bucket.
    pub fn map(&mut self, start: u64, end: u64, file_offset: u64, symbols: Arc<SymbolTable>) {
        let start = start & ADDR_MASK;
        let end = end & ADDR_MASK;
        if end <= start {
            return;
        }
        for bucket in (start >> BUCKET_SHIFT)..=((end - 1) >> BUCKET_SHIFT) {
            let slice_start = start.max(bucket * BUCKET_SIZE);
            let slice_end = end.min((bucket + 1) * BUCKET_SIZE);
            self.buckets.entry(bucket).or_default().push(Mapping {
                start: slice_start,
                end: slice_end,
                file_offset: file_offset + (slice_start - start),
                symbols: symbols.clone(),
            });
        }
    }

    /// Translate an address to the symbol table mapped there and the
    /// corresponding file offset. The most recent covering mapping wins.
    pub fn lookup(&self, addr: u64) -> Option<(&Arc<SymbolTable>, u64)> {
        let addr = addr & ADDR_MASK;
        let mappings = self.buckets.get(&(addr >> BUCKET_SHIFT))?;
        mappings
            .iter()
            .rev()
            .find(|m| m.start <= addr && addr < m.end)
            .map(|m| (&m.symbols, m.file_offset + (addr - m.start)))
    }
}
