//! External collaborators this core consumes rather than implements.
//!
//! The page-directory primitive, the physical frame allocator, the block
//! device, the file handle, and the bitmap are all capabilities a real
//! kernel supplies. Each is expressed here as a trait so that [`frame_table`],
//! [`supplemental_page_table`], [`buffer_cache`], and [`swap`] stay agnostic
//! to how the host actually realizes them.
//!
//! Where `keos` already ships a complete, matching implementation — the
//! physical allocator ([`keos::mm::ContigPages`]), the block device
//! ([`keos::fs::Disk`]), and the file handle ([`keos::fs::RegularFile`]) —
//! this module adapts it directly. The page-directory primitive and the
//! bitmap have no ready-made `keos` counterpart (a hardware page directory
//! only makes sense wired to a live CPU's `CR3`, and `keos` has no generic
//! bitmap type), so this module supplies its own software implementations of
//! those two instead.
//!
//! [`frame_table`]: crate::frame_table
//! [`supplemental_page_table`]: crate::supplemental_page_table
//! [`buffer_cache`]: crate::buffer_cache
//! [`swap`]: crate::swap

use alloc::collections::BTreeMap;
use keos::{KernelError, addressing::Va};

bitflags::bitflags! {
    /// Flags accepted by [`FrameAllocator::get_page`].
    pub struct PageFlags: u32 {
        /// The frame is destined for a user-mode mapping.
        const USER = 0b01;
        /// The frame must be zero-filled before it is handed out.
        const ZERO = 0b10;
    }
}

/// An owned, physical frame handle.
///
/// Dropping a [`Frame`] must release the underlying physical page; the frame
/// table never hands out a bare address without the owning handle attached.
pub trait Frame: Send {
    /// A stable integer naming this frame, usable as a map key and as the
    /// `kaddr` that the page-directory primitive installs.
    fn kaddr(&self) -> usize;
    /// Read-only view of the frame's `PAGE_SIZE` bytes.
    fn bytes(&self) -> &[u8];
    /// Mutable view of the frame's `PAGE_SIZE` bytes.
    fn bytes_mut(&mut self) -> &mut [u8];
}

/// The physical-page-allocator external collaborator.
pub trait FrameAllocator: Send + Sync {
    /// The owned frame handle this allocator produces.
    type Frame: Frame;
    /// Allocates one physical frame, or `None` on exhaustion.
    fn get_page(&self, flags: PageFlags) -> Option<Self::Frame>;
}

/// The page-directory (`pagedir_*`) external collaborator.
///
/// One instance names one process's hardware address space.
pub trait PageDirectory: Send {
    /// Looks up the kernel address currently mapped at `upage`, if any.
    fn get(&self, upage: Va) -> Option<usize>;
    /// Installs `upage -> kaddr` with the given writability.
    ///
    /// Returns `false` without side effects if a mapping already exists at
    /// `upage`.
    fn set(&mut self, upage: Va, kaddr: usize, writable: bool) -> bool;
    /// Removes any mapping at `upage`. A no-op if `upage` is unmapped.
    fn clear(&mut self, upage: Va);
    /// Reads the hardware accessed bit for `upage`.
    fn is_accessed(&self, upage: Va) -> bool;
    /// Sets the hardware accessed bit for `upage`.
    fn set_accessed(&mut self, upage: Va, value: bool);
    /// Reads the hardware dirty bit for `upage`.
    fn is_dirty(&self, upage: Va) -> bool;
    /// Sets the hardware dirty bit for `upage`.
    fn set_dirty(&mut self, upage: Va, value: bool);
}

/// The block-device external collaborator: sector-granular storage.
pub trait BlockDevice: Send + Sync {
    /// Reads one 512-byte sector into `buf`.
    fn read(&self, sector: usize, buf: &mut [u8; 512]) -> Result<(), KernelError>;
    /// Writes one 512-byte sector from `buf`.
    fn write(&self, sector: usize, buf: &[u8; 512]) -> Result<(), KernelError>;
}

/// The file-handle external collaborator.
pub trait FileHandle: Clone + Send + Sync {
    /// Current length of the file, in bytes.
    fn length(&self) -> usize;
    /// Reads up to `buf.len()` bytes starting at byte offset `ofs`. Returns
    /// the number of bytes actually read.
    fn read_at(&self, buf: &mut [u8], ofs: usize) -> Result<usize, KernelError>;
    /// Writes `buf` at byte offset `ofs`. Returns the number of bytes
    /// actually written.
    fn write_at(&self, buf: &[u8], ofs: usize) -> Result<usize, KernelError>;
    /// Duplicates this handle so a mapping can outlive the caller's own
    /// reference to the file.
    fn reopen(&self) -> Self;
}

/// The bitmap external collaborator used by [`swap`](crate::swap).
pub trait Bitmap: Send {
    /// Creates a bitmap of `n` bits, all clear.
    fn create(n: usize) -> Self;
    /// Scans `len` bits starting at `start` for the first run equal to
    /// `!value` of length one, flips it to `value`, and returns its index.
    /// Returns `None` if no such bit exists.
    fn scan_and_flip(&mut self, start: usize, len: usize, value: bool) -> Option<usize>;
    /// Sets the bit at `idx` to `value`.
    fn set(&mut self, idx: usize, value: bool);
    /// Reads the bit at `idx`.
    fn test(&self, idx: usize) -> bool;
    /// The number of bits this bitmap was created with.
    fn len(&self) -> usize;
}

/// Bundles one concrete realization of every external collaborator the core
/// needs, so [`frame_table`](crate::frame_table), [`swap`](crate::swap), and
/// [`supplemental_page_table`](crate::supplemental_page_table) can each take
/// a single type parameter `H: Host` instead of threading five independent
/// generic parameters through every struct. A host wires this up once (see
/// [`KeosHost`](crate::KeosHost) in the crate root) and every other module
/// just asks for `H::FileHandle`, `H::PageDirectory`, and so on.
pub trait Host: Send + Sync + 'static {
    /// The backing-file handle, reopened per mapping.
    type FileHandle: FileHandle;
    /// The hardware address space of one process.
    type PageDirectory: PageDirectory;
    /// The physical frame allocator.
    type FrameAllocator: FrameAllocator;
    /// The disk the swap area is carved out of.
    type SwapDevice: BlockDevice;
    /// The bitmap backing the swap area's free-slot tracking.
    type SwapBitmap: Bitmap;
}

// ---------------------------------------------------------------------
// keos-backed adapters
// ---------------------------------------------------------------------

/// [`Frame`] backed by a real [`keos::mm::Page`].
pub struct KeosFrame(keos::mm::Page);

impl Frame for KeosFrame {
    fn kaddr(&self) -> usize {
        self.0.kva().into_usize()
    }
    fn bytes(&self) -> &[u8] {
        self.0.inner()
    }
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.0.inner_mut()
    }
}

/// [`FrameAllocator`] backed by `keos`'s physical page allocator.
///
/// `keos::mm::Page::new` panics on exhaustion (it is meant to be called by
/// code that has no fallback); `keos::mm::ContigPages::new` is the fallible
/// primitive it is built on, so this adapter goes through that instead and
/// surfaces exhaustion as `None`, matching the frame table's "try a direct
/// allocation, evict on failure" contract.
#[derive(Default)]
pub struct KeosFrameAllocator;

impl FrameAllocator for KeosFrameAllocator {
    type Frame = KeosFrame;
    fn get_page(&self, flags: PageFlags) -> Option<Self::Frame> {
        let page = keos::mm::ContigPages::new(keos::addressing::PAGE_SIZE)?
            .split()
            .pop()
            .expect("a single-page ContigPages splits into exactly one Page");
        let mut frame = KeosFrame(page);
        if flags.contains(PageFlags::ZERO) {
            frame.bytes_mut().fill(0);
        }
        Some(frame)
    }
}

/// [`BlockDevice`] backed by a real [`keos::fs::Disk`].
pub struct KeosBlockDevice(keos::fs::Disk);

impl KeosBlockDevice {
    /// Wraps the disk at `index` as a [`BlockDevice`].
    pub fn new(index: usize) -> Self {
        Self(keos::fs::Disk::new(index))
    }
}

impl BlockDevice for KeosBlockDevice {
    fn read(&self, sector: usize, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        self.0.read(keos::fs::Sector(sector), buf)
    }
    fn write(&self, sector: usize, buf: &[u8; 512]) -> Result<(), KernelError> {
        self.0.write(keos::fs::Sector(sector), buf)
    }
}

impl FileHandle for keos::fs::RegularFile {
    fn length(&self) -> usize {
        self.size()
    }
    fn read_at(&self, buf: &mut [u8], ofs: usize) -> Result<usize, KernelError> {
        self.read(ofs, buf)
    }
    fn write_at(&self, buf: &[u8], ofs: usize) -> Result<usize, KernelError> {
        self.write(ofs, buf)
    }
    fn reopen(&self) -> Self {
        self.clone()
    }
}

// ---------------------------------------------------------------------
// Software page directory
// ---------------------------------------------------------------------

#[derive(Default)]
struct Pte {
    kaddr: usize,
    writable: bool,
    accessed: bool,
    dirty: bool,
}

/// A software-emulated page directory.
///
/// A real kernel backs [`PageDirectory`] with the CPU's own page tables
/// (accessed/dirty bits set by the hardware walker on every access); this
/// crate has no CPU to drive, so it tracks the same bits explicitly. Callers
/// that fault a page in are expected to call [`Self::set_accessed`] /
/// [`Self::set_dirty`] themselves to simulate the hardware setting them on
/// first touch, the same way the unit tests in [`frame_table`](crate::frame_table)
/// and [`supplemental_page_table`](crate::supplemental_page_table) do.
#[derive(Default)]
pub struct FlatPageDirectory {
    entries: BTreeMap<usize, Pte>,
}

impl FlatPageDirectory {
    /// Creates an empty page directory.
    pub fn new() -> Self {
        Self::default()
    }

    fn entry(&self, upage: Va) -> Option<&Pte> {
        self.entries.get(&upage.into_usize())
    }
    fn entry_mut(&mut self, upage: Va) -> Option<&mut Pte> {
        self.entries.get_mut(&upage.into_usize())
    }
}

impl PageDirectory for FlatPageDirectory {
    fn get(&self, upage: Va) -> Option<usize> {
        self.entry(upage).map(|e| e.kaddr)
    }
    fn set(&mut self, upage: Va, kaddr: usize, writable: bool) -> bool {
        if self.entries.contains_key(&upage.into_usize()) {
            return false;
        }
        self.entries.insert(
            upage.into_usize(),
            Pte {
                kaddr,
                writable,
                accessed: false,
                dirty: false,
            },
        );
        true
    }
    fn clear(&mut self, upage: Va) {
        self.entries.remove(&upage.into_usize());
    }
    fn is_accessed(&self, upage: Va) -> bool {
        self.entry(upage).map(|e| e.accessed).unwrap_or(false)
    }
    fn set_accessed(&mut self, upage: Va, value: bool) {
        if let Some(e) = self.entry_mut(upage) {
            e.accessed = value;
        }
    }
    fn is_dirty(&self, upage: Va) -> bool {
        self.entry(upage).map(|e| e.dirty).unwrap_or(false)
    }
    fn set_dirty(&mut self, upage: Va, value: bool) {
        if let Some(e) = self.entry_mut(upage) {
            e.dirty = value;
        }
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;

    #[test]
    fn fresh_mapping_has_clear_bits() {
        let mut pd = FlatPageDirectory::new();
        let va = Va::new(0x1000).unwrap();
        assert!(pd.set(va, 0xdead_b000, true));
        assert_eq!(pd.get(va), Some(0xdead_b000));
        assert!(!pd.is_accessed(va));
        assert!(!pd.is_dirty(va));
    }

    #[test]
    fn second_set_at_same_address_fails() {
        let mut pd = FlatPageDirectory::new();
        let va = Va::new(0x2000).unwrap();
        assert!(pd.set(va, 1, true));
        assert!(!pd.set(va, 2, true));
        assert_eq!(pd.get(va), Some(1));
    }

    #[test]
    fn clear_forgets_bits() {
        let mut pd = FlatPageDirectory::new();
        let va = Va::new(0x3000).unwrap();
        pd.set(va, 1, true);
        pd.set_accessed(va, true);
        pd.set_dirty(va, true);
        pd.clear(va);
        assert_eq!(pd.get(va), None);
        assert!(pd.set(va, 2, true));
        assert!(!pd.is_accessed(va));
    }
}
