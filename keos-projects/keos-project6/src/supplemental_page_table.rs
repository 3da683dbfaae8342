//! C4: the supplemental page table (SPT) — per-process backing state for
//! every virtual page beyond what the hardware page table records.
//!
//! This is the busiest seam in the crate: it is the [`FrameOwner`] eviction
//! calls back into, the thing [`mmap`](Self::mmap)/[`munmap`](Self::munmap)
//! mutate through the [`MappingRegistry`](crate::mapping_registry::MappingRegistry)
//! it owns, and the place [`page_fault`](crate::page_fault) dispatches to.
//! One [`keos::sync::SpinLock`] guards the page map, the hardware page
//! directory, and the mapping registry together, since all three describe
//! one process's address space and must be observed consistently.
//!
//! The frame table's lock nests *outside* this one: any operation that
//! touches both — installing a freshly-allocated frame, or writing a victim
//! back and freeing it — opens one [`FrameTableSession`] up front and keeps
//! it for the whole sequence, taking this SPT's own lock only in short,
//! non-overlapping inner critical sections. That is the one order this
//! module ever acquires the two locks in: frame lock, then SPT lock, never
//! the reverse. [`commit_eviction`](FrameOwner::commit_eviction) already runs
//! nested this way — called from inside [`FrameTable`]'s own locked section —
//! so an eviction that lands on one of this process's own pages re-enters
//! cleanly: this SPT's lock is never held across the call into the frame
//! table that might trigger it.

use crate::{
    capability::{FileHandle, Host, PageDirectory, PageFlags},
    frame_table::{FrameOwner, FrameTable, FrameTableSession},
    mapping_registry::MappingRegistry,
    swap::SwapArea,
};
use alloc::{collections::BTreeMap, sync::Arc, vec::Vec};
use keos::{
    KernelError,
    addressing::{PAGE_SIZE, Va},
    sync::SpinLock,
};

/// One virtual page's logical backing state.
///
/// Kept private to this module — callers outside observe it only through
/// [`PageSnapshot`], since the real struct is parameterized over the host's
/// file-handle type and carries invariants (`!valid ⇒ swap_idx` names a slot
/// this page owns) that must only ever be touched under the SPT's lock.
struct Page<H: Host> {
    addr: Va,
    loaded: bool,
    valid: bool,
    mapid: Option<usize>,
    file: Option<H::FileHandle>,
    file_ofs: usize,
    file_read_bytes: usize,
    file_writable: bool,
    swap_idx: usize,
}

/// A read-only, point-in-time view of one page's state, for callers (tests,
/// diagnostics) that need to observe the SPT without reaching into it.
#[derive(Debug, Clone, Copy)]
pub struct PageSnapshot {
    /// Page-aligned virtual address this entry describes.
    pub addr: Va,
    /// Whether a resident frame currently backs this page.
    pub loaded: bool,
    /// Whether the page is not currently swapped out.
    pub valid: bool,
    /// The file mapping this page belongs to, if any.
    pub mapid: Option<usize>,
    /// Byte offset into the backing file, meaningful iff the page has a file.
    pub file_ofs: usize,
    /// Bytes of the page read from file; the remainder is zero-filled.
    pub file_read_bytes: usize,
    /// Whether writes to this page are permitted to reach the backing file.
    pub file_writable: bool,
    /// Swap slot index, meaningful iff `!valid`.
    pub swap_idx: usize,
}

struct Inner<H: Host> {
    pagedir: H::PageDirectory,
    pages: BTreeMap<usize, Page<H>>,
    mapping: MappingRegistry,
}

/// Per-process supplemental page table: every page's backing state, the
/// hardware address space it describes, and the file-mapping ledger carved
/// out of it.
pub struct SupplementalPageTable<H: Host> {
    inner: SpinLock<Inner<H>>,
    frames: Arc<FrameTable<H::FrameAllocator>>,
    swap: Arc<SwapArea<H::SwapDevice, H::SwapBitmap>>,
}

/// What a fault against a known page should do.
enum Loader {
    Swap,
    File,
    Zero,
}

impl<H: Host> SupplementalPageTable<H> {
    /// Creates an empty SPT over a fresh hardware address space, sharing a
    /// process-wide [`FrameTable`] and [`SwapArea`].
    pub fn new(
        pagedir: H::PageDirectory,
        frames: Arc<FrameTable<H::FrameAllocator>>,
        swap: Arc<SwapArea<H::SwapDevice, H::SwapBitmap>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            inner: SpinLock::new(Inner {
                pagedir,
                pages: BTreeMap::new(),
                mapping: MappingRegistry::new(),
            }),
            frames,
            swap,
        })
    }

    fn insert_locked(guard: &mut Inner<H>, page: Page<H>) -> bool {
        let key = page.addr.into_usize();
        if guard.pages.contains_key(&key) {
            return false;
        }
        guard.pages.insert(key, page);
        true
    }

    /// Installs a lazily-zero-filled page at `addr` (stack growth, BSS).
    /// Returns `false` without side effects if `addr` is already mapped.
    pub fn insert_zero(&self, addr: Va) -> bool {
        let mut guard = self.inner.lock();
        let r = Self::insert_locked(
            &mut guard,
            Page {
                addr,
                loaded: false,
                valid: true,
                mapid: None,
                file: None,
                file_ofs: 0,
                file_read_bytes: 0,
                file_writable: false,
                swap_idx: 0,
            },
        );
        guard.unlock();
        r
    }

    /// Installs a lazily-file-backed page at `addr` (executable load, or one
    /// page of an `mmap`). Returns `false` without side effects if `addr` is
    /// already mapped.
    pub fn insert_file(
        &self,
        addr: Va,
        file: H::FileHandle,
        file_ofs: usize,
        file_read_bytes: usize,
        file_writable: bool,
        mapid: Option<usize>,
    ) -> bool {
        let mut guard = self.inner.lock();
        let r = Self::insert_locked(
            &mut guard,
            Page {
                addr,
                loaded: false,
                valid: true,
                mapid,
                file: Some(file),
                file_ofs,
                file_read_bytes,
                file_writable,
                swap_idx: 0,
            },
        );
        guard.unlock();
        r
    }

    /// Looks up `addr`, returning `None` if it names no page this process
    /// knows about (the caller should treat that as a bad address).
    pub fn snapshot(&self, addr: Va) -> Option<PageSnapshot> {
        let guard = self.inner.lock();
        let s = guard.pages.get(&addr.into_usize()).map(|p| PageSnapshot {
            addr: p.addr,
            loaded: p.loaded,
            valid: p.valid,
            mapid: p.mapid,
            file_ofs: p.file_ofs,
            file_read_bytes: p.file_read_bytes,
            file_writable: p.file_writable,
            swap_idx: p.swap_idx,
        });
        guard.unlock();
        s
    }

    /// Whether `addr` names a known page.
    pub fn contains(&self, addr: Va) -> bool {
        let guard = self.inner.lock();
        let r = guard.pages.contains_key(&addr.into_usize());
        guard.unlock();
        r
    }

    /// The next `mapid` [`mmap`](Self::mmap) will draw. Exposed for tests and
    /// for the rollback-restores-the-counter property.
    pub fn peek_next_mapid(&self) -> usize {
        let guard = self.inner.lock();
        let n = guard.mapping.peek_next_mapid();
        guard.unlock();
        n
    }

    /// Sets the hardware dirty bit for `addr`. Exposed so callers (and
    /// tests) can simulate a user-mode write without a real CPU.
    pub fn set_dirty(&self, addr: Va, value: bool) {
        let mut guard = self.inner.lock();
        guard.pagedir.set_dirty(addr, value);
        guard.unlock();
    }

    /// Whether `slot` is currently occupied in the swap area backing this
    /// process. Exposed for tests.
    pub fn swap_slot_occupied(&self, slot: usize) -> bool {
        self.swap.is_occupied(slot)
    }

    /// Runs `f` over the resident frame's bytes at `addr`, or returns `None`
    /// if `addr` is not currently resident.
    pub fn frame_bytes<R>(&self, addr: Va, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let kaddr = {
            let guard = self.inner.lock();
            let k = guard.pagedir.get(addr);
            guard.unlock();
            k
        }?;
        self.frames.with_bytes(kaddr, f)
    }

    /// Mutable counterpart of [`Self::frame_bytes`].
    pub fn frame_bytes_mut<R>(&self, addr: Va, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let kaddr = {
            let guard = self.inner.lock();
            let k = guard.pagedir.get(addr);
            guard.unlock();
            k
        }?;
        self.frames.with_bytes_mut(kaddr, f)
    }

    /// Installs `kaddr` at `addr` in the hardware table, marks it accessed,
    /// and (on success) flips `loaded = true` on the SPT entry. On failure
    /// (an install collision — a caller bug, since the entry's `!loaded`
    /// precondition should preclude this) the frame is freed through
    /// `session`, which the caller must already hold — this runs as one
    /// step of the caller's alloc-then-install sequence, not its own
    /// independent critical section.
    fn finish_install(
        &self,
        session: &mut FrameTableSession<'_, H::FrameAllocator>,
        addr: Va,
        kaddr: usize,
        writable: bool,
    ) -> bool {
        let mut guard = self.inner.lock();
        let installed = guard.pagedir.set(addr, kaddr, writable);
        if installed {
            guard.pagedir.set_accessed(addr, true);
            if let Some(p) = guard.pages.get_mut(&addr.into_usize()) {
                p.loaded = true;
            }
        }
        guard.unlock();
        if !installed {
            session.free(kaddr);
        }
        installed
    }

    /// Loads a lazily-zero page on its first fault.
    ///
    /// Precondition: the page must exist and be `!loaded`. Takes `self` by
    /// value (an owned `Arc`) because it must hand `self` to
    /// [`FrameTable::alloc`] as an `Arc<dyn FrameOwner>` — callers reach this
    /// through [`Arc::clone`] (see [`Self::fault`]).
    ///
    /// The allocation and the pagedir install below it run under one
    /// [`FrameTableSession`], so eviction can never land on this frame
    /// between the two steps — it has no pagedir entry yet, which would
    /// otherwise make it indistinguishable from an unaccessed, perfectly
    /// evictable frame.
    pub fn load_zero(self: Arc<Self>, addr: Va) -> bool {
        {
            let guard = self.inner.lock();
            let known = match guard.pages.get(&addr.into_usize()) {
                Some(p) => {
                    debug_assert!(!p.loaded, "load_zero: page is already resident");
                    true
                }
                None => false,
            };
            guard.unlock();
            if !known {
                return false;
            }
        }
        let mut session = self.frames.locked();
        let Some(kaddr) = session.alloc(self.clone(), addr, PageFlags::USER | PageFlags::ZERO) else {
            session.unlock();
            return false;
        };
        let installed = self.finish_install(&mut session, addr, kaddr, true);
        session.unlock();
        installed
    }

    /// Loads a file-backed page on its first fault: reads `file_read_bytes`
    /// from `(file, file_ofs)` and zero-fills the remainder of the page.
    ///
    /// Precondition: the page must exist, be `!loaded`, and carry a file.
    ///
    /// The allocation, the file read, the zero-fill, and the pagedir install
    /// all run under one [`FrameTableSession`] — the same session the alloc
    /// opened — so the frame can't be evicted out from under the read, and
    /// the read can't observe a frame that a concurrent evict has already
    /// repurposed.
    pub fn load_file(self: Arc<Self>, addr: Va) -> bool {
        let (file, file_ofs, file_read_bytes, file_writable) = {
            let guard = self.inner.lock();
            let page = guard.pages.get(&addr.into_usize());
            let info = match page {
                Some(p) => {
                    debug_assert!(!p.loaded, "load_file: page is already resident");
                    let file = p
                        .file
                        .clone()
                        .expect("load_file precondition: page must carry a file");
                    Some((file, p.file_ofs, p.file_read_bytes, p.file_writable))
                }
                None => None,
            };
            guard.unlock();
            match info {
                Some(info) => info,
                None => return false,
            }
        };

        let flags = if file_read_bytes == 0 {
            PageFlags::USER | PageFlags::ZERO
        } else {
            PageFlags::USER
        };
        let mut session = self.frames.locked();
        let Some(kaddr) = session.alloc(self.clone(), addr, flags) else {
            session.unlock();
            return false;
        };

        let read_ok = if file_read_bytes > 0 {
            let n = session
                .with_bytes_mut(kaddr, |bytes| file.read_at(&mut bytes[..file_read_bytes], file_ofs))
                .expect("the frame we just allocated must still be resident");
            match n {
                Ok(n) if n == file_read_bytes => {
                    session.with_bytes_mut(kaddr, |bytes| bytes[file_read_bytes..].fill(0));
                    true
                }
                _ => false,
            }
        } else {
            true
        };

        if !read_ok {
            session.free(kaddr);
            session.unlock();
            return false;
        }
        let installed = self.finish_install(&mut session, addr, kaddr, file_writable);
        session.unlock();
        installed
    }

    /// Loads a page back from swap on fault. The slot is consumed by
    /// [`SwapArea::in_`] regardless of whether the install below succeeds.
    ///
    /// Precondition: the page must exist and be `!valid`.
    ///
    /// Allocation, the swap read, and the pagedir install share one
    /// [`FrameTableSession`] for the same reason as [`Self::load_file`]: the
    /// frame must not be evictable until it is actually installed and
    /// marked accessed.
    pub fn load_swap(self: Arc<Self>, addr: Va) -> bool {
        let slot = {
            let guard = self.inner.lock();
            let page = guard.pages.get(&addr.into_usize());
            let slot = match page {
                Some(p) => {
                    debug_assert!(!p.valid, "load_swap: page is not swapped out");
                    Some(p.swap_idx)
                }
                None => None,
            };
            guard.unlock();
            match slot {
                Some(slot) => slot,
                None => return false,
            }
        };
        let mut session = self.frames.locked();
        let Some(kaddr) = session.alloc(self.clone(), addr, PageFlags::USER) else {
            session.unlock();
            return false;
        };
        session
            .with_bytes_mut(kaddr, |bytes| {
                let mut page_bytes = [0u8; PAGE_SIZE];
                self.swap.in_(slot, &mut page_bytes);
                bytes.copy_from_slice(&page_bytes);
            })
            .expect("the frame we just allocated must still be resident");

        let mut guard = self.inner.lock();
        let installed = guard.pagedir.set(addr, kaddr, true);
        if installed {
            // A swapped-in page is marked dirty and accessed so it is not
            // immediately re-evicted as clean-and-reconstructible: unlike a
            // fresh zero page, its only authoritative copy was just
            // consumed out of swap.
            guard.pagedir.set_dirty(addr, true);
            guard.pagedir.set_accessed(addr, true);
            if let Some(p) = guard.pages.get_mut(&addr.into_usize()) {
                p.valid = true;
                p.loaded = true;
            }
        }
        guard.unlock();
        if !installed {
            session.free(kaddr);
        }
        session.unlock();
        installed
    }

    /// Resolves a page fault at `addr`: classifies the address via the SPT
    /// and dispatches to the matching loader. Returns `false` if `addr`
    /// names no page (the caller should terminate the faulting process) or
    /// if the matching loader fails.
    pub fn fault(self: Arc<Self>, addr: Va) -> bool {
        let addr = addr.page_down();
        let dispatch = {
            let guard = self.inner.lock();
            let d = guard.pages.get(&addr.into_usize()).map(|p| {
                if p.loaded {
                    None
                } else if !p.valid {
                    Some(Loader::Swap)
                } else if p.file.is_some() {
                    Some(Loader::File)
                } else {
                    Some(Loader::Zero)
                }
            });
            guard.unlock();
            d
        };
        match dispatch {
            None => false,
            Some(None) => true,
            Some(Some(Loader::Swap)) => self.load_swap(addr),
            Some(Some(Loader::File)) => self.load_file(addr),
            Some(Some(Loader::Zero)) => self.load_zero(addr),
        }
    }

    /// Creates a file mapping of `file` at `addr`, one page at a time.
    /// Invalid arguments (zero-length file, unaligned or null `addr`) and
    /// mapping collisions both fail without partially installing anything.
    pub fn mmap(&self, file: H::FileHandle, addr: Va) -> Result<usize, KernelError> {
        let len = file.length();
        if len == 0 || addr.into_usize() == 0 || addr.into_usize() % PAGE_SIZE != 0 {
            return Err(KernelError::InvalidArgument);
        }
        let backing = file.reopen();
        let page_count = len.div_ceil(PAGE_SIZE);

        let mut guard = self.inner.lock();
        let mapid = guard.mapping.reserve_mapid();
        for k in 0..page_count {
            let ofs = k * PAGE_SIZE;
            let page_addr = addr + ofs;
            let read_bytes = (len - ofs).min(PAGE_SIZE);
            let page = Page {
                addr: page_addr,
                loaded: false,
                valid: true,
                mapid: Some(mapid),
                file: Some(backing.clone()),
                file_ofs: ofs,
                file_read_bytes: read_bytes,
                file_writable: true,
                swap_idx: 0,
            };
            if !Self::insert_locked(&mut guard, page) {
                for rolled_back in guard.mapping.rollback(mapid) {
                    guard.pages.remove(&rolled_back.into_usize());
                }
                guard.unlock();
                return Err(KernelError::FileExist);
            }
            guard.mapping.push(mapid, page_addr);
        }
        guard.unlock();
        Ok(mapid)
    }

    /// Tears down the mapping named `mapid`: writes back pages whose
    /// hardware dirty bit is set, clears their hardware mapping, and frees
    /// their frames. A no-op (not an error) if `mapid` is already unmapped,
    /// so a second `munmap` of the same id is idempotent.
    ///
    /// The whole walk — detaching each page from the pagedir, reading its
    /// bytes back for write-back, and freeing its frame — runs under one
    /// [`FrameTableSession`] opened before any pagedir mutation, so a
    /// concurrent eviction can never pick up a frame this call has already
    /// detached but not yet freed.
    pub fn munmap(&self, mapid: usize) -> Result<(), KernelError> {
        struct Removed<H: Host> {
            addr: Va,
            kaddr: Option<usize>,
            dirty: bool,
            file: Option<H::FileHandle>,
            file_ofs: usize,
            file_read_bytes: usize,
        }

        let mut session = self.frames.locked();

        let removed: Vec<Removed<H>> = {
            let mut guard = self.inner.lock();
            let addrs = guard.mapping.take_mapping(mapid);
            let mut out = Vec::with_capacity(addrs.len());
            for addr in addrs {
                let Some(page) = guard.pages.remove(&addr.into_usize()) else {
                    continue;
                };
                let (kaddr, dirty) = if page.loaded {
                    let kaddr = guard.pagedir.get(addr);
                    let dirty = guard.pagedir.is_dirty(addr);
                    guard.pagedir.clear(addr);
                    (kaddr, dirty)
                } else {
                    (None, false)
                };
                out.push(Removed {
                    addr,
                    kaddr,
                    dirty,
                    file: page.file,
                    file_ofs: page.file_ofs,
                    file_read_bytes: page.file_read_bytes,
                });
            }
            guard.unlock();
            out
        };

        for r in removed {
            if let Some(kaddr) = r.kaddr {
                if r.dirty {
                    let file = r.file.expect("a mapped page always carries a file");
                    session
                        .with_bytes(kaddr, |bytes| file.write_at(&bytes[..r.file_read_bytes], r.file_ofs))
                        .expect("the frame being unmapped must still be resident")
                        .expect("mapped-page write-back failed during munmap");
                }
                session.free(kaddr);
            }
            let _ = r.addr;
        }
        session.unlock();
        Ok(())
    }

    /// Tears down every page of this process: writes back dirty mapped
    /// pages, frees resident frames, and releases swap slots still held by
    /// pages that were never faulted back in. Called once, synchronously,
    /// by the exiting thread.
    ///
    /// Same reasoning as [`Self::munmap`]: one [`FrameTableSession`] spans
    /// the entire teardown, so no frame this process just detached can be
    /// evicted before this call frees it.
    pub fn destroy(&self) {
        struct Removed<H: Host> {
            kaddr: Option<usize>,
            dirty: bool,
            mapped: bool,
            file: Option<H::FileHandle>,
            file_ofs: usize,
            file_read_bytes: usize,
            valid: bool,
            swap_idx: usize,
        }

        let mut session = self.frames.locked();

        let removed: Vec<Removed<H>> = {
            let mut guard = self.inner.lock();
            let keys: Vec<usize> = guard.pages.keys().copied().collect();
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let page = guard.pages.remove(&key).expect("key came from this map");
                let (kaddr, dirty) = if page.loaded {
                    let kaddr = guard.pagedir.get(page.addr);
                    let dirty = guard.pagedir.is_dirty(page.addr);
                    guard.pagedir.clear(page.addr);
                    (kaddr, dirty)
                } else {
                    (None, false)
                };
                out.push(Removed {
                    kaddr,
                    dirty,
                    mapped: page.mapid.is_some(),
                    file: page.file,
                    file_ofs: page.file_ofs,
                    file_read_bytes: page.file_read_bytes,
                    valid: page.valid,
                    swap_idx: page.swap_idx,
                });
            }
            guard.mapping = MappingRegistry::new();
            guard.unlock();
            out
        };

        for r in removed {
            if let Some(kaddr) = r.kaddr {
                if r.mapped && r.dirty {
                    if let Some(file) = r.file {
                        session
                            .with_bytes(kaddr, |bytes| file.write_at(&bytes[..r.file_read_bytes], r.file_ofs))
                            .expect("the frame being torn down must still be resident")
                            .expect("mapped-page write-back failed during teardown");
                    }
                }
                session.free(kaddr);
            } else if !r.valid {
                self.swap.destroy(r.swap_idx);
            }
        }
        session.unlock();
    }
}

impl<H: Host> FrameOwner for SupplementalPageTable<H> {
    fn is_accessed(&self, upage: Va) -> bool {
        let guard = self.inner.lock();
        let v = guard.pagedir.is_accessed(upage);
        guard.unlock();
        v
    }

    fn clear_accessed(&self, upage: Va) {
        let mut guard = self.inner.lock();
        guard.pagedir.set_accessed(upage, false);
        guard.unlock();
    }

    fn commit_eviction(&self, upage: Va, _kaddr: usize, bytes: &[u8]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let dirty = guard.pagedir.is_dirty(upage);
        let key = upage.into_usize();

        if dirty {
            let mapid = guard.pages.get(&key).and_then(|p| p.mapid);
            if mapid.is_some() {
                let page = guard.pages.get(&key).expect("victim must have an SPT entry");
                let file = page.file.clone().expect("a mapped page always carries a file");
                let (ofs, n) = (page.file_ofs, page.file_read_bytes);
                file.write_at(&bytes[..n], ofs)
                    .expect("mapped-page write-back failed during eviction");
                if let Some(p) = guard.pages.get_mut(&key) {
                    p.loaded = false;
                }
            } else {
                let mut page_bytes = [0u8; PAGE_SIZE];
                page_bytes.copy_from_slice(bytes);
                let slot = self.swap.out(&page_bytes);
                if let Some(p) = guard.pages.get_mut(&key) {
                    p.valid = false;
                    p.swap_idx = slot;
                    p.loaded = false;
                }
            }
        } else if let Some(p) = guard.pages.get_mut(&key) {
            // Clean: the disk or zero-fill source already agrees with the
            // frame's contents, so the page is reconstructible without
            // writing anything back. See the design note on clean-anonymous
            // eviction — this relies on anonymous pages starting zero-filled
            // and never being written without the hardware setting dirty.
            p.loaded = false;
        }

        guard.pagedir.clear(upage);
        guard.unlock();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::{
        capability::{FlatPageDirectory, Host},
        swap::SECTORS_PER_SLOT,
        test_support::{CappedFrameAllocator, MemDisk, MemFile},
    };

    struct TestHost;
    impl Host for TestHost {
        type FileHandle = MemFile;
        type PageDirectory = FlatPageDirectory;
        type FrameAllocator = CappedFrameAllocator;
        type SwapDevice = MemDisk;
        type SwapBitmap = crate::bitmap::WordBitmap;
    }

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    fn spt(frame_capacity: usize, swap_slots: usize) -> Arc<SupplementalPageTable<TestHost>> {
        let frames = Arc::new(FrameTable::new(CappedFrameAllocator::new(frame_capacity)));
        let swap = Arc::new(SwapArea::new(MemDisk::new(swap_slots * SECTORS_PER_SLOT), swap_slots));
        SupplementalPageTable::new(FlatPageDirectory::new(), frames, swap)
    }

    #[test]
    fn insert_fails_on_collision() {
        let spt = spt(2, 2);
        let addr = va(0x1000_0000);
        assert!(spt.insert_zero(addr));
        assert!(!spt.insert_zero(addr));
    }

    #[test]
    fn fault_on_unknown_address_fails() {
        let spt = spt(2, 2);
        assert!(!Arc::clone(&spt).fault(va(0x2000_0000)));
    }

    #[test]
    fn lazy_zero_fault_zero_fills_and_is_writable() {
        let spt = spt(2, 2);
        let addr = va(0x0804_8000);
        assert!(spt.insert_zero(addr));
        assert!(Arc::clone(&spt).fault(addr));
        spt.frame_bytes(addr, |bytes| {
            assert_eq!(bytes.len(), PAGE_SIZE);
            assert!(bytes.iter().all(|&b| b == 0));
        })
        .unwrap();
    }

    #[test]
    fn lazy_file_fault_reads_prefix_and_zero_fills_tail() {
        let spt = spt(2, 2);
        let contents: Vec<u8> = (1..=100u16).map(|v| v as u8).collect();
        let file = MemFile::new(contents.clone());
        let addr = va(0x1000_0000);
        assert!(spt.insert_file(addr, file, 0, 100, true, None));
        assert!(Arc::clone(&spt).fault(addr));
        spt.frame_bytes(addr, |bytes| {
            assert_eq!(&bytes[..100], &contents[..]);
            assert!(bytes[100..].iter().all(|&b| b == 0));
        })
        .unwrap();
    }

    #[test]
    fn swap_round_trip_preserves_bytes_and_releases_slot() {
        let spt = spt(2, 4);
        let a = va(0x2000_0000);
        let b = va(0x2000_1000);
        assert!(spt.insert_zero(a));
        assert!(spt.insert_zero(b));
        assert!(Arc::clone(&spt).fault(a));
        assert!(Arc::clone(&spt).fault(b));

        spt.frame_bytes_mut(a, |bytes| bytes.fill(0x55)).unwrap();
        spt.set_dirty(a, true);

        // Capacity is 2 and both frames are resident; one more insertion
        // must evict. `a` was inserted first, so the clock hand reaches it
        // first on both passes of the second-chance sweep.
        let c = va(0x2000_2000);
        assert!(spt.insert_zero(c));
        assert!(Arc::clone(&spt).fault(c));

        let evicted = spt.snapshot(a).unwrap();
        assert!(!evicted.loaded);
        assert!(!evicted.valid);
        let slot = evicted.swap_idx;
        assert!(spt.swap_slot_occupied(slot));

        assert!(Arc::clone(&spt).fault(a));
        spt.frame_bytes(a, |bytes| assert!(bytes.iter().all(|&b| b == 0x55)))
            .unwrap();
        assert!(!spt.swap_slot_occupied(slot));
    }

    #[test]
    fn mmap_splits_file_into_pages_then_munmap_writes_back() {
        let spt = spt(4, 2);
        let file = MemFile::zeroed(6000);
        let addr = va(0x4000_0000);

        let mapid = spt.mmap(file.clone(), addr).unwrap();
        assert_eq!(mapid, 0);
        assert_eq!(spt.peek_next_mapid(), 1);

        let p0 = spt.snapshot(addr).unwrap();
        assert_eq!(p0.file_read_bytes, PAGE_SIZE);
        assert_eq!(p0.mapid, Some(mapid));
        let p1 = spt.snapshot(addr + PAGE_SIZE).unwrap();
        assert_eq!(p1.file_read_bytes, 6000 - PAGE_SIZE);

        assert!(Arc::clone(&spt).fault(addr));
        assert!(Arc::clone(&spt).fault(addr + PAGE_SIZE));
        spt.frame_bytes_mut(addr, |bytes| bytes[..4].copy_from_slice(&[1, 2, 3, 4]))
            .unwrap();
        spt.set_dirty(addr, true);
        spt.frame_bytes_mut(addr + PAGE_SIZE, |bytes| bytes[..4].copy_from_slice(&[9, 9, 9, 9]))
            .unwrap();
        spt.set_dirty(addr + PAGE_SIZE, true);

        spt.munmap(mapid).unwrap();

        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [1, 2, 3, 4]);
        file.read_at(&mut buf, PAGE_SIZE).unwrap();
        assert_eq!(buf, [9, 9, 9, 9]);

        assert!(spt.snapshot(addr).is_none());
        assert!(spt.snapshot(addr + PAGE_SIZE).is_none());
    }

    #[test]
    fn second_munmap_of_same_mapid_is_a_no_op() {
        let spt = spt(4, 2);
        let file = MemFile::zeroed(PAGE_SIZE);
        let addr = va(0x4100_0000);
        let mapid = spt.mmap(file, addr).unwrap();
        spt.munmap(mapid).unwrap();
        spt.munmap(mapid).unwrap();
    }

    #[test]
    fn mmap_rollback_on_collision_restores_next_mapid_and_registry() {
        let spt = spt(4, 2);
        let addr = va(0x5000_0000);
        let middle = addr + PAGE_SIZE;
        assert!(spt.insert_zero(middle));

        let before = spt.peek_next_mapid();
        let file = MemFile::zeroed(3 * PAGE_SIZE);
        let result = spt.mmap(file, addr);
        assert!(result.is_err());
        assert_eq!(spt.peek_next_mapid(), before);
        assert!(spt.snapshot(addr).is_none());
        assert!(spt.snapshot(addr + 2 * PAGE_SIZE).is_none());
        assert!(spt.snapshot(middle).is_some());
    }

    #[test]
    fn destroy_writes_back_dirty_mapped_pages_and_frees_everything() {
        let file = MemFile::zeroed(PAGE_SIZE);
        let spt = spt(2, 2);
        let mapped = va(0x7000_0000);
        let anon = va(0x7000_1000);
        assert!(spt.insert_file(mapped, file.clone(), 0, PAGE_SIZE, true, None));
        assert!(spt.insert_zero(anon));
        assert!(Arc::clone(&spt).fault(mapped));
        assert!(Arc::clone(&spt).fault(anon));
        spt.frame_bytes_mut(mapped, |bytes| bytes[..4].copy_from_slice(&[5, 6, 7, 8]))
            .unwrap();
        spt.set_dirty(mapped, true);

        // Force eviction of `mapped` (first in insertion order) by faulting
        // a third page with the table already at capacity.
        let third = va(0x7000_2000);
        assert!(spt.insert_zero(third));
        assert!(Arc::clone(&spt).fault(third));

        let mut buf = [0u8; 4];
        file.read_at(&mut buf, 0).unwrap();
        assert_eq!(buf, [5, 6, 7, 8]);
        assert!(!spt.snapshot(mapped).unwrap().loaded);

        spt.destroy();
        assert!(spt.snapshot(mapped).is_none());
        assert!(spt.snapshot(anon).is_none());
        assert!(spt.snapshot(third).is_none());
    }

    #[test]
    fn destroy_releases_swap_slots_of_pages_never_faulted_back_in() {
        let spt = spt(1, 2);
        let a = va(0x8000_0000);
        let b = va(0x8000_1000);
        assert!(spt.insert_zero(a));
        assert!(Arc::clone(&spt).fault(a));
        spt.frame_bytes_mut(a, |bytes| bytes.fill(0x9)).unwrap();
        spt.set_dirty(a, true);

        // Capacity 1: faulting `b` in evicts `a` to swap (dirty, anonymous).
        assert!(spt.insert_zero(b));
        assert!(Arc::clone(&spt).fault(b));
        let slot = spt.snapshot(a).unwrap().swap_idx;
        assert!(spt.swap_slot_occupied(slot));

        spt.destroy();
        assert!(!spt.swap_slot_occupied(slot));
    }

    #[test]
    fn mmap_rejects_unaligned_and_null_addresses() {
        let spt = spt(2, 2);
        let file = MemFile::zeroed(PAGE_SIZE);
        assert!(matches!(
            spt.mmap(file.clone(), va(0x1001)),
            Err(KernelError::InvalidArgument)
        ));
    }
}
