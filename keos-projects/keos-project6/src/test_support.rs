//! Test doubles shared by every module's `#[cfg(test)]` block.
//!
//! This module only exists under `cfg(test)` (see the `mod test_support`
//! declaration in `lib.rs`), so it is free to lean on `std` directly instead
//! of threading everything through `alloc`.

use crate::capability::{Bitmap as BitmapCapability, BlockDevice, Frame, FrameAllocator, FileHandle, PageFlags};
use keos::{KernelError, addressing::PAGE_SIZE};
use std::{
    boxed::Box,
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    vec,
    vec::Vec,
};

/// An in-memory [`BlockDevice`], shared across clones like a real fd would
/// be shared across `dup`.
#[derive(Clone)]
pub struct MemDisk(Arc<Mutex<Vec<[u8; 512]>>>);

impl MemDisk {
    /// Creates a disk of `sectors` all-zero 512-byte sectors.
    pub fn new(sectors: usize) -> Self {
        Self(Arc::new(Mutex::new(vec![[0u8; 512]; sectors])))
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: usize, buf: &mut [u8; 512]) -> Result<(), KernelError> {
        let disk = self.0.lock().unwrap();
        buf.copy_from_slice(&disk[sector]);
        Ok(())
    }
    fn write(&self, sector: usize, buf: &[u8; 512]) -> Result<(), KernelError> {
        let mut disk = self.0.lock().unwrap();
        disk[sector] = *buf;
        Ok(())
    }
}

/// An in-memory [`FileHandle`] backed by a growable byte buffer, standing in
/// for `keos::fs::RegularFile` in tests.
#[derive(Clone)]
pub struct MemFile(Arc<Mutex<Vec<u8>>>);

impl MemFile {
    /// Wraps `contents` as a file.
    pub fn new(contents: Vec<u8>) -> Self {
        Self(Arc::new(Mutex::new(contents)))
    }

    /// A file of `len` zero bytes.
    pub fn zeroed(len: usize) -> Self {
        Self::new(vec![0u8; len])
    }
}

impl FileHandle for MemFile {
    fn length(&self) -> usize {
        self.0.lock().unwrap().len()
    }
    fn read_at(&self, buf: &mut [u8], ofs: usize) -> Result<usize, KernelError> {
        let data = self.0.lock().unwrap();
        if ofs >= data.len() {
            return Ok(0);
        }
        let n = buf.len().min(data.len() - ofs);
        buf[..n].copy_from_slice(&data[ofs..ofs + n]);
        Ok(n)
    }
    fn write_at(&self, buf: &[u8], ofs: usize) -> Result<usize, KernelError> {
        let mut data = self.0.lock().unwrap();
        if data.len() < ofs + buf.len() {
            data.resize(ofs + buf.len(), 0);
        }
        data[ofs..ofs + buf.len()].copy_from_slice(buf);
        Ok(buf.len())
    }
    fn reopen(&self) -> Self {
        self.clone()
    }
}

/// An owned frame produced by [`CappedFrameAllocator`]. Returns its slot to
/// the allocator's pool on drop, so tests can observe exhaustion and
/// recovery deterministically.
pub struct CappedFrame {
    kaddr: usize,
    bytes: Box<[u8; PAGE_SIZE]>,
    remaining: Arc<AtomicUsize>,
}

impl Frame for CappedFrame {
    fn kaddr(&self) -> usize {
        self.kaddr
    }
    fn bytes(&self) -> &[u8] {
        self.bytes.as_slice()
    }
    fn bytes_mut(&mut self) -> &mut [u8] {
        self.bytes.as_mut_slice()
    }
}

impl Drop for CappedFrame {
    fn drop(&mut self) {
        self.remaining.fetch_add(1, Ordering::SeqCst);
    }
}

/// A [`FrameAllocator`] with a fixed number of frames, so tests can drive
/// the frame table into eviction deterministically instead of relying on
/// the host's actual physical memory size.
pub struct CappedFrameAllocator {
    remaining: Arc<AtomicUsize>,
    next_kaddr: AtomicUsize,
}

impl CappedFrameAllocator {
    /// Creates an allocator that can hand out `capacity` frames before
    /// returning `None`.
    pub fn new(capacity: usize) -> Self {
        Self {
            remaining: Arc::new(AtomicUsize::new(capacity)),
            next_kaddr: AtomicUsize::new(0x1000_0000),
        }
    }
}

impl FrameAllocator for CappedFrameAllocator {
    type Frame = CappedFrame;
    fn get_page(&self, flags: PageFlags) -> Option<CappedFrame> {
        loop {
            let cur = self.remaining.load(Ordering::SeqCst);
            if cur == 0 {
                return None;
            }
            if self
                .remaining
                .compare_exchange(cur, cur - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
        }
        let kaddr = self.next_kaddr.fetch_add(PAGE_SIZE, Ordering::SeqCst);
        let bytes = Box::new([0u8; PAGE_SIZE]);
        let mut frame = CappedFrame {
            kaddr,
            bytes,
            remaining: self.remaining.clone(),
        };
        if flags.contains(PageFlags::ZERO) {
            frame.bytes_mut().fill(0);
        }
        Some(frame)
    }
}

/// A [`Bitmap`](crate::capability::Bitmap) test double identical in
/// behavior to [`crate::bitmap::WordBitmap`], kept separate so bitmap tests
/// and swap-area tests don't share a fate if one implementation changes.
pub struct VecBitmap(Vec<bool>);

impl BitmapCapability for VecBitmap {
    fn create(n: usize) -> Self {
        Self(vec![false; n])
    }
    fn scan_and_flip(&mut self, start: usize, len: usize, value: bool) -> Option<usize> {
        for idx in start..(start + len).min(self.0.len()) {
            if self.0[idx] != value {
                self.0[idx] = value;
                return Some(idx);
            }
        }
        None
    }
    fn set(&mut self, idx: usize, value: bool) {
        self.0[idx] = value;
    }
    fn test(&self, idx: usize) -> bool {
        self.0[idx]
    }
    fn len(&self) -> usize {
        self.0.len()
    }
}
