//! C2: the swap area — a bitmap of page-sized slots on a dedicated disk.
//!
//! A slot is [`SECTORS_PER_SLOT`] contiguous sectors. `out` claims the first
//! free slot and writes a page's contents to it; `in_` reads a slot back and
//! releases it; `destroy` releases a slot whose owning page is being torn
//! down without ever being faulted back in. One [`keos::sync::SpinLock`]
//! serializes bitmap mutation and the I/O against the swap disk, matching
//! the single `swap_lock` of the source this is grounded on.

use crate::{
    bitmap::WordBitmap,
    buffer_cache::SECTOR_SIZE,
    capability::{Bitmap, BlockDevice},
};
use keos::{addressing::PAGE_SIZE, sync::SpinLock};

/// Sectors that make up one swap slot.
pub const SECTORS_PER_SLOT: usize = PAGE_SIZE / SECTOR_SIZE;

struct Inner<D, B> {
    device: D,
    bitmap: B,
}

/// The swap area: `slot_count` page-sized slots over a [`BlockDevice`].
pub struct SwapArea<D, B = WordBitmap> {
    inner: SpinLock<Inner<D, B>>,
}

impl<D: BlockDevice, B: Bitmap> SwapArea<D, B> {
    /// Creates a swap area with `slot_count` slots, all initially free.
    ///
    /// This is always called at boot (see [`vm_init`](crate::vm_init)): no
    /// slot survives a reboot, so the bitmap starts all-zero regardless of
    /// what the swap disk physically contains.
    pub fn new(device: D, slot_count: usize) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                device,
                bitmap: B::create(slot_count),
            }),
        }
    }

    /// Writes one page's worth of bytes to a freshly claimed slot, returning
    /// its index.
    ///
    /// # Panics
    /// Panics if the swap area is exhausted. Swap exhaustion is a fatal
    /// condition for this teaching OS: it never grows the swap device
    /// dynamically, so there is no recoverable path once every slot is
    /// taken.
    pub fn out(&self, bytes: &[u8; PAGE_SIZE]) -> usize {
        let mut guard = self.inner.lock();
        let len = guard.bitmap.len();
        let slot = guard
            .bitmap
            .scan_and_flip(0, len, true)
            .unwrap_or_else(|| panic!("swap exhausted"));
        for i in 0..SECTORS_PER_SLOT {
            let mut sector = [0u8; SECTOR_SIZE];
            sector.copy_from_slice(&bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE]);
            guard
                .device
                .write(slot * SECTORS_PER_SLOT + i, &sector)
                .expect("swap disk write failed");
        }
        guard.unlock();
        slot
    }

    /// Reads a slot's contents back into `bytes` and releases the slot.
    ///
    /// # Panics
    /// Panics (via `assert!`) if `slot` is not currently marked occupied —
    /// that is a caller bug, not a recoverable condition.
    pub fn in_(&self, slot: usize, bytes: &mut [u8; PAGE_SIZE]) {
        let mut guard = self.inner.lock();
        assert!(guard.bitmap.test(slot), "swap_in of an unallocated slot");
        for i in 0..SECTORS_PER_SLOT {
            let mut sector = [0u8; SECTOR_SIZE];
            guard
                .device
                .read(slot * SECTORS_PER_SLOT + i, &mut sector)
                .expect("swap disk read failed");
            bytes[i * SECTOR_SIZE..(i + 1) * SECTOR_SIZE].copy_from_slice(&sector);
        }
        guard.bitmap.set(slot, false);
        guard.unlock();
    }

    /// Releases `slot` without reading it back, for pages being torn down
    /// while still swapped out.
    pub fn destroy(&self, slot: usize) {
        let mut guard = self.inner.lock();
        guard.bitmap.set(slot, false);
        guard.unlock();
    }

    /// Returns whether `slot` is currently occupied. Used by tests and by
    /// the property that every `!valid` page's `swap_idx` names a set bit.
    pub fn is_occupied(&self, slot: usize) -> bool {
        let guard = self.inner.lock();
        let occupied = guard.bitmap.test(slot);
        guard.unlock();
        occupied
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::test_support::MemDisk;

    fn area(slots: usize) -> SwapArea<MemDisk> {
        SwapArea::new(MemDisk::new(slots * SECTORS_PER_SLOT), slots)
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let area = area(4);
        let mut page = [0x55u8; PAGE_SIZE];
        let slot = area.out(&page);
        assert!(area.is_occupied(slot));
        page.fill(0);
        area.in_(slot, &mut page);
        assert_eq!(page, [0x55u8; PAGE_SIZE]);
        assert!(!area.is_occupied(slot));
    }

    #[test]
    fn out_claims_first_free_slot() {
        let area = area(4);
        let a = area.out(&[1u8; PAGE_SIZE]);
        let b = area.out(&[2u8; PAGE_SIZE]);
        assert_eq!(a, 0);
        assert_eq!(b, 1);
        area.destroy(a);
        let c = area.out(&[3u8; PAGE_SIZE]);
        assert_eq!(c, 0, "destroyed slot is reused before a fresh one");
    }

    #[test]
    #[should_panic(expected = "swap exhausted")]
    fn out_past_capacity_panics() {
        let area = area(1);
        area.out(&[0u8; PAGE_SIZE]);
        area.out(&[0u8; PAGE_SIZE]);
    }

    #[test]
    #[should_panic(expected = "swap_in of an unallocated slot")]
    fn in_of_free_slot_asserts() {
        let area = area(2);
        let mut page = [0u8; PAGE_SIZE];
        area.in_(0, &mut page);
    }
}
