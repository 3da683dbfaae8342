//! C1: a write-back buffer cache over fixed-size disk sectors.
//!
//! Sixty-four slots, a linear lookup, and a clock hand sweeping for a
//! victim on miss — the same shape as a textbook buffer cache. All mutation
//! is serialized by one [`keos::sync::SpinLock`], matching the rest of this
//! crate's locking idiom.

use crate::capability::BlockDevice;
use keos::{KernelError, sync::SpinLock};

/// Number of bytes in one disk sector.
pub const SECTOR_SIZE: usize = 512;
/// Number of resident cache lines.
pub const CACHE_SIZE: usize = 64;

struct Line {
    used: bool,
    sector: usize,
    buffer: [u8; SECTOR_SIZE],
    dirty: bool,
    access: bool,
}

impl Line {
    const EMPTY: Line = Line {
        used: false,
        sector: 0,
        buffer: [0; SECTOR_SIZE],
        dirty: false,
        access: false,
    };
}

struct Inner<D> {
    lines: [Line; CACHE_SIZE],
    clock_hand: usize,
    device: D,
}

impl<D: BlockDevice> Inner<D> {
    fn lookup(&self, sector: usize) -> Option<usize> {
        self.lines
            .iter()
            .position(|l| l.used && l.sector == sector)
    }

    fn write_back(&mut self, idx: usize) -> Result<(), KernelError> {
        let line = &mut self.lines[idx];
        debug_assert!(line.used);
        if line.dirty {
            self.device.write(line.sector, &line.buffer)?;
            line.dirty = false;
        }
        Ok(())
    }

    /// Finds the cache line backing `sector`, installing it (evicting and
    /// refilling from disk) if it is not already resident.
    fn resident_line(&mut self, sector: usize) -> Result<usize, KernelError> {
        if let Some(idx) = self.lookup(sector) {
            return Ok(idx);
        }

        // Clock replacement: walk from the hand, giving every accessed line
        // a second chance, until an unused or unaccessed-and-clean-or-dirty
        // line is found.
        let victim = loop {
            let idx = self.clock_hand;
            self.clock_hand = (self.clock_hand + 1) % CACHE_SIZE;
            if !self.lines[idx].used {
                break idx;
            }
            if self.lines[idx].access {
                self.lines[idx].access = false;
                continue;
            }
            break idx;
        };

        if self.lines[victim].used {
            self.write_back(victim)?;
        }

        // Refill from disk before handing the slot back. The write path
        // relies on this even though it immediately overwrites the buffer —
        // see the open design note on the buffer-cache write path.
        let line = &mut self.lines[victim];
        line.used = true;
        line.sector = sector;
        line.dirty = false;
        self.device.read(sector, &mut line.buffer)?;
        Ok(victim)
    }
}

/// The buffer cache. Generic over the [`BlockDevice`] it caches sectors of.
pub struct BufferCache<D> {
    inner: SpinLock<Inner<D>>,
}

impl<D: BlockDevice> BufferCache<D> {
    /// Creates an empty cache over `device`.
    pub fn new(device: D) -> Self {
        Self {
            inner: SpinLock::new(Inner {
                lines: [Line::EMPTY; CACHE_SIZE],
                clock_hand: 0,
                device,
            }),
        }
    }

    /// Reads `sector` into `dst`, going to disk on a cache miss.
    pub fn read(&self, sector: usize, dst: &mut [u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let idx = guard.resident_line(sector)?;
        guard.lines[idx].access = true;
        dst.copy_from_slice(&guard.lines[idx].buffer);
        guard.unlock();
        Ok(())
    }

    /// Writes `src` into `sector`'s cache line, going to disk on a cache
    /// miss to refill the line first (read-before-write-allocate).
    pub fn write(&self, sector: usize, src: &[u8; SECTOR_SIZE]) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        let idx = guard.resident_line(sector)?;
        let line = &mut guard.lines[idx];
        line.buffer.copy_from_slice(src);
        line.access = true;
        line.dirty = true;
        guard.unlock();
        Ok(())
    }

    /// Flushes every dirty line to disk and marks it clean.
    pub fn close(&self) -> Result<(), KernelError> {
        let mut guard = self.inner.lock();
        for idx in 0..CACHE_SIZE {
            if guard.lines[idx].used {
                guard.write_back(idx)?;
            }
        }
        guard.unlock();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::test_support::MemDisk;

    #[test]
    fn write_then_read_same_sector_hits_cache() {
        let cache = BufferCache::new(MemDisk::new(128));
        cache.write(5, &[0xAA; SECTOR_SIZE]).unwrap();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(5, &mut buf).unwrap();
        assert_eq!(buf, [0xAA; SECTOR_SIZE]);
    }

    #[test]
    fn eviction_writes_back_dirty_line() {
        let disk = MemDisk::new(128);
        let cache = BufferCache::new(disk.clone());
        cache.write(5, &[0xAA; SECTOR_SIZE]).unwrap();
        // Touch 64 other sectors so the clock sweeps all the way around and
        // must evict sector 5's still-dirty line.
        for s in 10..10 + CACHE_SIZE {
            let mut buf = [0u8; SECTOR_SIZE];
            cache.read(s, &mut buf).unwrap();
        }
        let mut on_disk = [0u8; SECTOR_SIZE];
        disk.read(5, &mut on_disk).unwrap();
        assert_eq!(on_disk, [0xAA; SECTOR_SIZE]);
    }

    #[test]
    fn close_flushes_every_dirty_line() {
        let disk = MemDisk::new(128);
        let cache = BufferCache::new(disk.clone());
        for s in 0..10 {
            cache.write(s, &[s as u8; SECTOR_SIZE]).unwrap();
        }
        cache.close().unwrap();
        for s in 0..10 {
            let mut buf = [0u8; SECTOR_SIZE];
            disk.read(s, &mut buf).unwrap();
            assert_eq!(buf, [s as u8; SECTOR_SIZE]);
        }
    }

    #[test]
    fn clean_eviction_does_not_touch_disk_copy() {
        let disk = MemDisk::new(128);
        // Pre-seed disk sector 7 so a clean read-only cache of it can be
        // evicted without a write-back, and the disk copy must be unchanged.
        disk.write(7, &[0x11; SECTOR_SIZE]).unwrap();
        let cache = BufferCache::new(disk.clone());
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(7, &mut buf).unwrap();
        for s in 100..100 + CACHE_SIZE {
            cache.read(s, &mut buf).unwrap();
        }
        disk.read(7, &mut buf).unwrap();
        assert_eq!(buf, [0x11; SECTOR_SIZE]);
    }
}
