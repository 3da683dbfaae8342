//! Virtual memory: demand paging, swap, and memory-mapped files.
//!
//! This crate is the demand-paging core of a KeOS-style teaching kernel: a
//! write-back [`buffer_cache`], a [`swap`] area, a second-chance
//! [`frame_table`], a per-process [`supplemental_page_table`], and the
//! [`mapping_registry`] that backs `mmap`/`munmap`.
//!
//! Unlike `keos-project1`..`keos-project5`, none of this is expressed against
//! `keos::task::Task` or a live page table directly. Every piece of hardware
//! state the core needs — a page directory, a physical frame, a disk sector,
//! a file, a free-bit bitmap — is abstracted behind the traits in
//! [`capability`], so the whole thing is exercised with in-process test
//! doubles via `cargo test` instead of only a hardware-booting grader. A real
//! kernel wires the traits to hardware once, through [`KeosHost`], and calls
//! the functions in this module at boot, on page fault, and on process exit.
//!
//! ## Module Outline
//! - [`capability`]: the external collaborators this core consumes.
//! - [`buffer_cache`]: C1, write-back sector cache.
//! - [`swap`]: C2, the swap area.
//! - [`frame_table`]: C3, physical frame tracking and eviction.
//! - [`supplemental_page_table`]: C4, per-process page backing state.
//! - [`mapping_registry`]: C5, the `mmap` bookkeeping ledger.
//! - [`bitmap`]: the word-packed bitmap backing the swap area's free list.

#![no_std]
#![deny(rustdoc::broken_intra_doc_links)]

extern crate alloc;
#[allow(unused_imports)]
#[macro_use]
extern crate keos;

pub mod bitmap;
pub mod buffer_cache;
pub mod capability;
pub mod frame_table;
pub mod mapping_registry;
pub mod supplemental_page_table;
pub mod swap;
#[cfg(test)]
mod test_support;

use alloc::sync::Arc;
use capability::{Host, KeosBlockDevice, KeosFrameAllocator, PageDirectory as PageDirectoryCapability};
use keos::{
    KernelError,
    addressing::Va,
    mm::{
        Page,
        page_table::{PdeFlags, Pml4e, Pml4eFlags, PdpeFlags, Pte, PteFlags},
    },
    sync::SpinLock,
};

pub use supplemental_page_table::SupplementalPageTable;

/// Sector index of the dedicated swap disk, following the convention (data
/// disk at index 0, swap at index 1, filesystem at index 2) already used by
/// [`keos-project5`](../keos_project5/index.html)'s grader for its own
/// filesystem disk.
const SWAP_DISK_INDEX: usize = 1;
/// Number of page-sized slots on the swap disk. `keos`'s disk images are
/// fixed-size at boot; a production build would read this from the disk's
/// reported sector count instead of a constant.
const SWAP_SLOT_COUNT: usize = 1024;

type Frames = frame_table::FrameTable<KeosFrameAllocator>;
type Swap = swap::SwapArea<KeosBlockDevice, bitmap::WordBitmap>;
type Cache = buffer_cache::BufferCache<KeosBlockDevice>;

static FRAME_TABLE: SpinLock<Option<Arc<Frames>>> = SpinLock::new(None);
static SWAP_AREA: SpinLock<Option<Arc<Swap>>> = SpinLock::new(None);
static BUFFER_CACHE: SpinLock<Option<Arc<Cache>>> = SpinLock::new(None);

fn global<T>(slot: &SpinLock<Option<Arc<T>>>) -> Arc<T> {
    let guard = slot.lock();
    let v = guard
        .as_ref()
        .cloned()
        .expect("virtual memory subsystem used before its *_init() call");
    guard.unlock();
    v
}

/// Brings up the frame table over `keos`'s physical allocator. Must be called
/// once at boot before any [`SupplementalPageTable`] is created.
pub fn vm_init() {
    let mut guard = FRAME_TABLE.lock();
    *guard = Some(Arc::new(Frames::new(KeosFrameAllocator)));
    guard.unlock();
    info!("vm: frame table online");
}

/// Brings up the swap area over the dedicated swap disk. Must be called once
/// at boot, after [`vm_init`].
pub fn swap_init() {
    let mut guard = SWAP_AREA.lock();
    *guard = Some(Arc::new(Swap::new(
        KeosBlockDevice::new(SWAP_DISK_INDEX),
        SWAP_SLOT_COUNT,
    )));
    guard.unlock();
    info!("vm: swap area online ({} slots)", SWAP_SLOT_COUNT);
}

/// Brings up the write-back buffer cache over `device`. Called once at boot
/// for each disk the kernel wants cached (typically the filesystem disk).
pub fn buffer_cache_init(device: KeosBlockDevice) {
    let mut guard = BUFFER_CACHE.lock();
    *guard = Some(Arc::new(Cache::new(device)));
    guard.unlock();
    info!("vm: buffer cache online");
}

/// Flushes every dirty buffer-cache line to disk. Called at shutdown.
pub fn buffer_cache_close() -> Result<(), KernelError> {
    global(&BUFFER_CACHE).close()
}

/// Resolves a page fault at `addr` against `spt`. Returns `false` if the
/// fault cannot be resolved (unmapped address, or a loader failure) — the
/// caller is expected to terminate the faulting process.
pub fn page_fault(spt: &Arc<SupplementalPageTable<KeosHost>>, addr: Va) -> bool {
    let ok = Arc::clone(spt).fault(addr);
    if !ok {
        warning!("vm: unresolved page fault at {:?}", addr);
    }
    ok
}

/// Maps `file` at `addr` in `spt`'s address space. Returns the new mapping's
/// id, or the error `MAP_FAILED` corresponds to.
pub fn mmap(
    spt: &Arc<SupplementalPageTable<KeosHost>>,
    file: keos::fs::RegularFile,
    addr: Va,
) -> Result<usize, KernelError> {
    spt.mmap(file, addr)
}

/// Unmaps the mapping named `mapid` in `spt`, writing back any dirty pages.
pub fn munmap(spt: &Arc<SupplementalPageTable<KeosHost>>, mapid: usize) -> Result<(), KernelError> {
    spt.munmap(mapid)
}

/// Tears down every page of `spt`: writes back dirty mapped pages, frees
/// resident frames, and releases any swap slots still held. Called once by
/// the exiting thread.
pub fn spt_destroy(spt: &Arc<SupplementalPageTable<KeosHost>>) {
    spt.destroy();
}

// ---------------------------------------------------------------------
// Hardware page directory
// ---------------------------------------------------------------------

struct PageTableIndices {
    pml4: usize,
    pdpt: usize,
    pd: usize,
    pt: usize,
}

impl PageTableIndices {
    fn from_va(va: Va) -> Self {
        let addr = va.into_usize();
        Self {
            pml4: (addr >> 39) & 0x1ff,
            pdpt: (addr >> 30) & 0x1ff,
            pd: (addr >> 21) & 0x1ff,
            pt: (addr >> 12) & 0x1ff,
        }
    }
}

/// A real, hardware-backed [`PageDirectory`](capability::PageDirectory):
/// one process's 4-level x86_64 page table, walked and populated on demand.
///
/// Intermediate tables (PDPT, PD, PT) are allocated lazily from `keos`'s
/// physical allocator the first time a mapping needs them and are never
/// freed individually — they are reclaimed all at once when the
/// [`PageDirectory`] itself is dropped, the same lifetime [`keos::mm::Page`]
/// gives any other physical page.
pub struct KeosPageDirectory {
    root: alloc::boxed::Box<[Pml4e; 512]>,
}

impl KeosPageDirectory {
    /// Creates a fresh, empty user address space.
    pub fn new() -> Self {
        Self {
            root: alloc::boxed::Box::new([Pml4e(0); 512]),
        }
    }

    fn walk_pte(&self, va: Va) -> Option<&Pte> {
        let idx = PageTableIndices::from_va(va);
        let pdpt = self.root[idx.pml4].into_pdp().ok()?;
        let pd = pdpt[idx.pdpt].into_pd().ok()?;
        let pt = pd[idx.pd].into_pt().ok()?;
        let pte = &pt[idx.pt];
        pte.pa().is_some().then_some(pte)
    }

    fn walk_pte_mut(&mut self, va: Va) -> Option<&mut Pte> {
        let idx = PageTableIndices::from_va(va);
        let pdpt = self.root[idx.pml4].into_pdp_mut().ok()?;
        let pd = pdpt[idx.pdpt].into_pd_mut().ok()?;
        let pt = pd[idx.pd].into_pt_mut().ok()?;
        let pte = &mut pt[idx.pt];
        pte.pa().is_some().then_some(pte)
    }

    /// Walks to the PTE slot for `va`, allocating any missing intermediate
    /// table along the way.
    fn ensure_pte_mut(&mut self, va: Va) -> &mut Pte {
        let idx = PageTableIndices::from_va(va);

        if self.root[idx.pml4].pa().is_none() {
            let table = Page::new();
            self.root[idx.pml4]
                .set_pa(table.into_raw())
                .expect("freshly allocated page is always 4K-aligned");
            self.root[idx.pml4].set_flags(Pml4eFlags::P | Pml4eFlags::RW | Pml4eFlags::US);
        }
        let pdpt = self.root[idx.pml4]
            .into_pdp_mut()
            .expect("just ensured this entry is present");

        if pdpt[idx.pdpt].pa().is_none() {
            let table = Page::new();
            pdpt[idx.pdpt]
                .set_pa(table.into_raw())
                .expect("freshly allocated page is always 4K-aligned");
            pdpt[idx.pdpt].set_flags(PdpeFlags::P | PdpeFlags::RW | PdpeFlags::US);
        }
        let pd = pdpt[idx.pdpt]
            .into_pd_mut()
            .expect("just ensured this entry is present");

        if pd[idx.pd].pa().is_none() {
            let table = Page::new();
            pd[idx.pd]
                .set_pa(table.into_raw())
                .expect("freshly allocated page is always 4K-aligned");
            pd[idx.pd].set_flags(PdeFlags::P | PdeFlags::RW | PdeFlags::US);
        }
        let pt = pd[idx.pd]
            .into_pt_mut()
            .expect("just ensured this entry is present");

        &mut pt[idx.pt]
    }
}

impl Default for KeosPageDirectory {
    fn default() -> Self {
        Self::new()
    }
}

impl PageDirectoryCapability for KeosPageDirectory {
    fn get(&self, upage: Va) -> Option<usize> {
        self.walk_pte(upage)
            .and_then(Pte::pa)
            .map(|pa| pa.into_kva().into_usize())
    }

    fn set(&mut self, upage: Va, kaddr: usize, writable: bool) -> bool {
        if self.walk_pte(upage).is_some() {
            return false;
        }
        let pa = keos::addressing::Kva::new(kaddr)
            .expect("kaddr must name a kernel-addressable frame")
            .into_pa();
        let mut flags = PteFlags::US | PteFlags::P;
        if writable {
            flags |= PteFlags::RW;
        }
        let pte = self.ensure_pte_mut(upage);
        pte.set_pa(pa)
            .expect("frame addresses are always 4K-aligned");
        unsafe {
            pte.set_flags(flags);
        }
        // `Page::from_pa` reconstructs an owning handle for a frame the
        // `FrameTable` already owns, purely so `StaleTLBEntry` has something
        // to hold until the `invlpg` fires. Forget the handle `invalidate`
        // hands back instead of letting it drop — dropping it would free a
        // frame that is very much still resident.
        let stale = keos::mm::page_table::StaleTLBEntry::new(upage, unsafe { Page::from_pa(pa) });
        core::mem::forget(stale.invalidate());
        true
    }

    fn clear(&mut self, upage: Va) {
        let Some(pte) = self.walk_pte_mut(upage) else {
            return;
        };
        if let Some(pa) = unsafe { pte.clear() } {
            // Same reasoning as `set`: the frame is freed later through
            // `FrameTable::free`, not here.
            let stale = keos::mm::page_table::StaleTLBEntry::new(upage, unsafe { Page::from_pa(pa) });
            core::mem::forget(stale.invalidate());
        }
    }

    fn is_accessed(&self, upage: Va) -> bool {
        self.walk_pte(upage)
            .map(|pte| pte.flags().contains(PteFlags::A))
            .unwrap_or(false)
    }

    fn set_accessed(&mut self, upage: Va, value: bool) {
        let Some(pte) = self.walk_pte_mut(upage) else {
            return;
        };
        let mut flags = pte.flags();
        if value {
            flags.insert(PteFlags::A);
        } else {
            flags.remove(PteFlags::A);
        }
        unsafe {
            pte.set_flags(flags);
        }
    }

    fn is_dirty(&self, upage: Va) -> bool {
        self.walk_pte(upage)
            .map(|pte| pte.flags().contains(PteFlags::D))
            .unwrap_or(false)
    }

    fn set_dirty(&mut self, upage: Va, value: bool) {
        let Some(pte) = self.walk_pte_mut(upage) else {
            return;
        };
        let mut flags = pte.flags();
        if value {
            flags.insert(PteFlags::D);
        } else {
            flags.remove(PteFlags::D);
        }
        unsafe {
            pte.set_flags(flags);
        }
    }
}

/// The real-hardware realization of [`capability::Host`]: every collaborator
/// wired to an actual `keos` subsystem rather than an in-process double.
pub struct KeosHost;

impl Host for KeosHost {
    type FileHandle = keos::fs::RegularFile;
    type PageDirectory = KeosPageDirectory;
    type FrameAllocator = KeosFrameAllocator;
    type SwapDevice = KeosBlockDevice;
    type SwapBitmap = bitmap::WordBitmap;
}

/// Creates a new, empty [`SupplementalPageTable`] for a process, sharing the
/// process-wide frame table and swap area brought up by [`vm_init`] and
/// [`swap_init`].
///
/// # Panics
/// Panics if called before [`vm_init`] and [`swap_init`].
pub fn new_address_space() -> Arc<SupplementalPageTable<KeosHost>> {
    SupplementalPageTable::new(KeosPageDirectory::new(), global(&FRAME_TABLE), global(&SWAP_AREA))
}
