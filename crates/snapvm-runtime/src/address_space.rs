//! Paged guest memory.
//!
//! An address space is an ordered set of disjoint memory maps plus three
//! page-index permission sets. Pages are reference-counted and shared
//! between cloned spaces; the first write to a shared page forks that
//! single page, preserving sharing for the rest of the map. Writes to
//! executable pages raise a sticky flag that the trace cache consumes to
//! decide when lifted code may be stale.

use log::debug;
use rustc_hash::{FxHashMap, FxHashSet};
use serde::{Deserialize, Serialize};
use snapvm_core::{page_of, PAGE_MASK, PAGE_SIZE};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

const PAGE_LEN: usize = PAGE_SIZE as usize;

/// Structural errors on map mutation. Byte-level access failures are
/// `None`/`false` returns, not errors.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    #[error("range base {base:#x} / size {size:#x} is not page-aligned")]
    Unaligned { base: u64, size: u64 },

    #[error("range [{base:#x}, {limit:#x}) overlaps an existing map")]
    Overlap { base: u64, limit: u64 },

    #[error("empty range at {base:#x}")]
    Empty { base: u64 },

    #[error("address space is dead")]
    Dead,
}

/// Permission triple of a map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Perms {
    pub read: bool,
    pub write: bool,
    pub exec: bool,
}

impl Perms {
    pub const RW: Self = Self {
        read: true,
        write: true,
        exec: false,
    };
    pub const RWX: Self = Self {
        read: true,
        write: true,
        exec: true,
    };
    pub const RX: Self = Self {
        read: true,
        write: false,
        exec: true,
    };

    pub fn new(read: bool, write: bool, exec: bool) -> Self {
        Self { read, write, exec }
    }
}

impl std::fmt::Display for Perms {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}{}{}",
            if self.read { 'r' } else { '-' },
            if self.write { 'w' } else { '-' },
            if self.exec { 'x' } else { '-' }
        )
    }
}

/// What backs a page range, as recorded in snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageRangeKind {
    Anonymous,
    FileBacked,
}

/// One 4 KiB page. Cloned lazily through `Arc::make_mut`.
#[derive(Clone, PartialEq, Eq)]
struct Page([u8; PAGE_LEN]);

impl Page {
    fn zeroed() -> Self {
        Self([0; PAGE_LEN])
    }
}

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Page(..)")
    }
}

/// A contiguous page-aligned range with one permission triple. Contents
/// are per-page reference-counted; `None` pages read as zero until the
/// first write allocates them.
#[derive(Debug, Clone)]
pub struct MemoryMap {
    base: u64,
    limit: u64,
    perms: Perms,
    kind: PageRangeKind,
    name: String,
    pages: Vec<Option<Arc<Page>>>,
}

impl MemoryMap {
    fn new(base: u64, limit: u64, perms: Perms, kind: PageRangeKind, name: String) -> Self {
        let page_count = ((limit - base) / PAGE_SIZE) as usize;
        Self {
            base,
            limit,
            perms,
            kind,
            name,
            pages: vec![None; page_count],
        }
    }

    pub fn base(&self) -> u64 {
        self.base
    }

    pub fn limit(&self) -> u64 {
        self.limit
    }

    pub fn perms(&self) -> Perms {
        self.perms
    }

    pub fn kind(&self) -> PageRangeKind {
        self.kind
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copies the whole range out (zero pages included).
    pub fn contents(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity((self.limit - self.base) as usize);
        for page in &self.pages {
            match page {
                Some(p) => out.extend_from_slice(&p.0),
                None => out.extend_from_slice(&[0; PAGE_LEN]),
            }
        }
        out
    }

    fn slot(&self, addr: u64) -> usize {
        ((addr - self.base) / PAGE_SIZE) as usize
    }

    fn read_byte(&self, addr: u64) -> u8 {
        match &self.pages[self.slot(addr)] {
            Some(page) => page.0[(addr & PAGE_MASK) as usize],
            None => 0,
        }
    }

    fn write_byte(&mut self, addr: u64, val: u8) {
        let slot = self.slot(addr);
        let page = self.pages[slot].get_or_insert_with(|| Arc::new(Page::zeroed()));
        // First write to a shared page materializes a private copy.
        Arc::make_mut(page).0[(addr & PAGE_MASK) as usize] = val;
    }

    /// Splits at a page-aligned `addr` strictly inside the range; `self`
    /// keeps `[base, addr)` and the returned map owns `[addr, limit)`.
    fn split_at(&mut self, addr: u64) -> MemoryMap {
        debug_assert!(addr > self.base && addr < self.limit);
        let cut = ((addr - self.base) / PAGE_SIZE) as usize;
        let tail_pages = self.pages.split_off(cut);
        let tail = MemoryMap {
            base: addr,
            limit: self.limit,
            perms: self.perms,
            kind: self.kind,
            name: self.name.clone(),
            pages: tail_pages,
        };
        self.limit = addr;
        tail
    }
}

/// A guest address space.
#[derive(Debug, Clone)]
pub struct AddressSpace {
    id: u64,
    /// Disjoint maps keyed by base address.
    maps: BTreeMap<u64, MemoryMap>,
    /// Cache: page number to owning map base. Rebuilt on any structural
    /// change.
    page_to_map: FxHashMap<u64, u64>,
    page_is_readable: FxHashSet<u64>,
    page_is_writable: FxHashSet<u64>,
    page_is_executable: FxHashSet<u64>,
    dead: bool,
    /// Write to executable memory since the last executable read.
    seen_write_to_exec: bool,
}

impl AddressSpace {
    pub fn new(id: u64) -> Self {
        Self {
            id,
            maps: BTreeMap::new(),
            page_to_map: FxHashMap::default(),
            page_is_readable: FxHashSet::default(),
            page_is_writable: FxHashSet::default(),
            page_is_executable: FxHashSet::default(),
            dead: false,
            seen_write_to_exec: false,
        }
    }

    /// Clones this space under a new id. Page contents are shared until
    /// either side writes; permission sets are copied.
    pub fn clone_with_id(&self, id: u64) -> Self {
        let mut clone = self.clone();
        clone.id = id;
        clone.seen_write_to_exec = false;
        clone
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_dead(&self) -> bool {
        self.dead
    }

    /// Kills this space: all future operations fail, backing memory is
    /// released.
    pub fn kill(&mut self) {
        debug!("killing address space {}", self.id);
        self.dead = true;
        self.maps.clear();
        self.page_to_map.clear();
        self.page_is_readable.clear();
        self.page_is_writable.clear();
        self.page_is_executable.clear();
    }

    pub fn can_read(&self, addr: u64) -> bool {
        !self.dead && self.page_is_readable.contains(&page_of(addr))
    }

    pub fn can_write(&self, addr: u64) -> bool {
        !self.dead && self.page_is_writable.contains(&page_of(addr))
    }

    pub fn can_execute(&self, addr: u64) -> bool {
        !self.dead && self.page_is_executable.contains(&page_of(addr))
    }

    /// Reads one byte through the readable view.
    pub fn read_byte(&self, addr: u64) -> Option<u8> {
        if !self.can_read(addr) {
            return None;
        }
        self.find_map(addr).map(|m| m.read_byte(addr))
    }

    /// Writes one byte. Raises the write-to-exec flag when the target
    /// page is also executable.
    pub fn write_byte(&mut self, addr: u64, val: u8) -> bool {
        if !self.can_write(addr) {
            return false;
        }
        if self.page_is_executable.contains(&page_of(addr)) && !self.seen_write_to_exec {
            debug!(
                "space {}: write to executable memory at {:#x}",
                self.id, addr
            );
            self.seen_write_to_exec = true;
        }
        let Some(base) = self.page_to_map.get(&page_of(addr)).copied() else {
            return false;
        };
        match self.maps.get_mut(&base) {
            Some(map) => {
                map.write_byte(addr, val);
                true
            }
            None => false,
        }
    }

    /// Reads one byte through the executable view, for instruction
    /// decoding. Clears the write-to-exec flag: the caller is assumed to
    /// have consulted it before decoding.
    pub fn read_exec_byte(&mut self, addr: u64) -> Option<u8> {
        if !self.can_execute(addr) {
            return None;
        }
        self.seen_write_to_exec = false;
        self.find_map(addr).map(|m| m.read_byte(addr))
    }

    /// True if executable memory has been written since the last
    /// executable read.
    pub fn seen_write_to_exec(&self) -> bool {
        self.seen_write_to_exec
    }

    /// Returns and clears the sticky write-to-exec flag. The trace cache
    /// is the intended consumer.
    pub fn consume_write_to_exec(&mut self) -> bool {
        std::mem::take(&mut self.seen_write_to_exec)
    }

    /// Copies bytes out through the readable view.
    pub fn read(&self, addr: u64, buf: &mut [u8]) -> bool {
        for (i, slot) in buf.iter_mut().enumerate() {
            match self.read_byte(addr + i as u64) {
                Some(byte) => *slot = byte,
                None => return false,
            }
        }
        true
    }

    /// Copies bytes in through the writable view.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> bool {
        for (i, &byte) in bytes.iter().enumerate() {
            if !self.write_byte(addr + i as u64, byte) {
                return false;
            }
        }
        true
    }

    /// Adds a new map with uniform permissions.
    pub fn add_map(
        &mut self,
        base: u64,
        size: u64,
        perms: Perms,
        kind: PageRangeKind,
        name: impl Into<String>,
    ) -> Result<(), AddressSpaceError> {
        if self.dead {
            return Err(AddressSpaceError::Dead);
        }
        if base & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            return Err(AddressSpaceError::Unaligned { base, size });
        }
        if size == 0 {
            return Err(AddressSpaceError::Empty { base });
        }
        let limit = base + size;
        if self.overlaps(base, limit) {
            return Err(AddressSpaceError::Overlap { base, limit });
        }
        let name = name.into();
        debug!(
            "space {}: map [{:#x}, {:#x}) {} {:?}",
            self.id, base, limit, perms, name
        );
        self.maps
            .insert(base, MemoryMap::new(base, limit, perms, kind, name));
        self.rebuild_indices();
        Ok(())
    }

    /// Removes all pages in `[base, base+size)`, splitting any maps that
    /// straddle the boundary.
    pub fn remove_map(&mut self, base: u64, size: u64) -> Result<(), AddressSpaceError> {
        if self.dead {
            return Err(AddressSpaceError::Dead);
        }
        if base & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            return Err(AddressSpaceError::Unaligned { base, size });
        }
        let limit = base + size;
        self.cut_at(base);
        self.cut_at(limit);
        self.maps.retain(|_, m| m.limit <= base || m.base >= limit);
        self.rebuild_indices();
        Ok(())
    }

    /// Changes permissions over `[base, base+size)`, splitting maps at
    /// the boundaries so permissions stay uniform per map.
    pub fn set_permissions(
        &mut self,
        base: u64,
        size: u64,
        perms: Perms,
    ) -> Result<(), AddressSpaceError> {
        if self.dead {
            return Err(AddressSpaceError::Dead);
        }
        if base & PAGE_MASK != 0 || size & PAGE_MASK != 0 {
            return Err(AddressSpaceError::Unaligned { base, size });
        }
        let limit = base + size;
        self.cut_at(base);
        self.cut_at(limit);
        for map in self.maps.values_mut() {
            if map.base >= base && map.limit <= limit {
                map.perms = perms;
            }
        }
        self.rebuild_indices();
        Ok(())
    }

    /// Largest map base that is less than or equal to `find`.
    pub fn nearest_base_le(&self, find: u64) -> Option<u64> {
        self.maps.range(..=find).next_back().map(|(&base, _)| base)
    }

    /// Smallest map limit that is greater than `find`.
    pub fn nearest_limit_gt(&self, find: u64) -> Option<u64> {
        self.maps
            .values()
            .map(|m| m.limit)
            .find(|&limit| limit > find)
    }

    /// The maps, in address order.
    pub fn maps(&self) -> impl Iterator<Item = &MemoryMap> {
        self.maps.values()
    }

    /// Logs the current map table.
    pub fn log_maps(&self) {
        debug!("address space {} ({} maps):", self.id, self.maps.len());
        for map in self.maps.values() {
            debug!(
                "  [{:#010x}, {:#010x}) {} {:?}",
                map.base, map.limit, map.perms, map.name
            );
        }
    }

    fn overlaps(&self, base: u64, limit: u64) -> bool {
        self.maps
            .values()
            .any(|m| m.base < limit && base < m.limit)
    }

    fn find_map(&self, addr: u64) -> Option<&MemoryMap> {
        let base = self.page_to_map.get(&page_of(addr))?;
        self.maps.get(base)
    }

    /// Splits any map spanning `addr` so that `addr` becomes a map
    /// boundary. Cuts are page-aligned because all bases/limits are.
    fn cut_at(&mut self, addr: u64) {
        let Some((&base, _)) = self.maps.range(..addr).next_back() else {
            return;
        };
        let map = self.maps.get_mut(&base).expect("map base must resolve");
        if addr > map.base && addr < map.limit {
            let tail = map.split_at(addr);
            self.maps.insert(tail.base, tail);
        }
    }

    /// Recreates the page-to-map cache and the three permission sets.
    fn rebuild_indices(&mut self) {
        self.page_to_map.clear();
        self.page_is_readable.clear();
        self.page_is_writable.clear();
        self.page_is_executable.clear();
        for map in self.maps.values() {
            let mut page = page_of(map.base);
            let end = page_of(map.limit);
            while page < end {
                self.page_to_map.insert(page, map.base);
                if map.perms.read {
                    self.page_is_readable.insert(page);
                }
                if map.perms.write {
                    self.page_is_writable.insert(page);
                }
                if map.perms.exec {
                    self.page_is_executable.insert(page);
                }
                page += 1;
            }
        }
    }
}
