//! C3: the frame table and the second-chance eviction loop.
//!
//! One [`keos::sync::SpinLock`] (`frame_lock` in the design doc) guards an
//! insertion-ordered list of resident frames. Allocation tries the physical
//! allocator directly and falls back to eviction on exhaustion; eviction
//! sweeps the list from a persistent hand, giving every accessed frame a
//! second chance, and commits on the first frame it finds clean.
//!
//! The frame table does not know what a [`supplemental_page_table`] or a
//! `mapid` is — it only knows it must ask *someone* whether a victim's
//! hardware accessed bit is set, and to ask that same someone to dispossess
//! the victim before the frame is reused. That someone is the
//! [`FrameOwner`] the caller hands to [`FrameTable::alloc`] alongside the
//! `upage` the new frame will back.
//!
//! [`supplemental_page_table`]: crate::supplemental_page_table

use crate::capability::{Frame, FrameAllocator, PageFlags};
use alloc::{collections::VecDeque, sync::Arc};
use keos::{KernelError, addressing::Va};

/// The per-process callback bundle the frame table needs to dispossess a
/// victim during eviction.
///
/// This is the seam between C3 and C4: [`supplemental_page_table::SupplementalPageTable`]
/// implements this trait so that eviction can flip `loaded`/`valid` on the
/// victim's SPT entry, write it back to file or swap, and clear the
/// hardware mapping, all without the frame table needing to know the SPT's
/// concrete type.
///
/// [`supplemental_page_table::SupplementalPageTable`]: crate::supplemental_page_table::SupplementalPageTable
pub trait FrameOwner: Send + Sync {
    /// Reads the hardware accessed bit for `upage` in this owner's address
    /// space.
    fn is_accessed(&self, upage: Va) -> bool;
    /// Clears the hardware accessed bit for `upage` — the "second chance".
    fn clear_accessed(&self, upage: Va);
    /// Commits eviction of the frame backing `upage`, which was mapped at
    /// `kaddr` and held `bytes` at the moment of eviction: writes the page
    /// back to file or swap as required, demotes the owner's SPT entry, and
    /// clears the hardware mapping. Called with the frame table's lock
    /// held, so `bytes` is handed over rather than re-read through `kaddr`
    /// — by the time this returns the frame itself has already been freed.
    fn commit_eviction(&self, upage: Va, kaddr: usize, bytes: &[u8]) -> Result<(), KernelError>;
}

struct Entry<F> {
    owner: Arc<dyn FrameOwner>,
    upage: Va,
    frame: F,
}

struct Inner<A: FrameAllocator> {
    allocator: A,
    entries: VecDeque<Entry<A::Frame>>,
    hand: usize,
}

impl<A: FrameAllocator> Inner<A> {
    /// Runs the second-chance sweep, committing the first victim found
    /// clean and returning a fresh allocation in its place.
    ///
    /// Loops indefinitely over the list (wrapping at the end), clearing the
    /// accessed bit of everything it passes over. Every frame can be passed
    /// at most twice before it is evicted — once to clear its accessed bit,
    /// once more to find it clear — so the sweep always terminates within
    /// `2 * entries.len()` steps.
    fn evict(&mut self, flags: PageFlags) -> Option<A::Frame> {
        loop {
            if self.entries.is_empty() {
                return None;
            }
            if self.hand >= self.entries.len() {
                self.hand = 0;
            }
            let idx = self.hand;
            if self.entries[idx].owner.is_accessed(self.entries[idx].upage) {
                self.entries[idx]
                    .owner
                    .clear_accessed(self.entries[idx].upage);
                self.hand = (idx + 1) % self.entries.len();
                continue;
            }
            let victim = self.entries.remove(idx).expect("idx is in bounds");
            let kaddr = victim.frame.kaddr();
            victim
                .owner
                .commit_eviction(victim.upage, kaddr, victim.frame.bytes())
                .expect("eviction commit must not fail: disk I/O is assumed reliable");
            drop(victim.frame);
            return self.allocator.get_page(flags);
        }
    }
}

/// The frame table: every resident user-mode physical frame, in insertion
/// order.
pub struct FrameTable<A: FrameAllocator> {
    inner: keos::sync::SpinLock<Inner<A>>,
}

impl<A: FrameAllocator> FrameTable<A> {
    /// Creates an empty frame table over `allocator`.
    pub fn new(allocator: A) -> Self {
        Self {
            inner: keos::sync::SpinLock::new(Inner {
                allocator,
                entries: VecDeque::new(),
                hand: 0,
            }),
        }
    }

    /// Opens a session holding `frame_lock` for the duration of a multi-step
    /// operation — e.g. `alloc` followed by installing the hardware mapping,
    /// or reading a victim's bytes back before `free`-ing it. Everything
    /// done through the returned [`FrameTableSession`] runs atomically with
    /// respect to eviction, which is exactly what callers that bridge
    /// `alloc`/`with_bytes`/`free` across a pagedir update need: eviction can
    /// only run between sessions, never in the middle of one.
    pub fn locked(&self) -> FrameTableSession<'_, A> {
        FrameTableSession {
            guard: self.inner.lock(),
        }
    }

    /// Obtains a frame for `upage` owned by `owner`, evicting a victim if
    /// the allocator is exhausted, and releases `frame_lock` immediately.
    ///
    /// This one-shot form is for call sites that don't need the allocation
    /// to stay atomic with a following step — e.g. the tests in this module.
    /// Real install sequences should use [`FrameTable::locked`] instead, so
    /// the alloc and the pagedir update it's paired with run under one
    /// unbroken hold of the lock.
    pub fn alloc(&self, owner: Arc<dyn FrameOwner>, upage: Va, flags: PageFlags) -> Option<usize> {
        let mut session = self.locked();
        let kaddr = session.alloc(owner, upage, flags);
        session.unlock();
        kaddr
    }

    /// Releases the frame at `kaddr`. A no-op if no such frame is resident.
    pub fn free(&self, kaddr: usize) {
        let mut session = self.locked();
        session.free(kaddr);
        session.unlock();
    }

    /// Runs `f` over the `PAGE_SIZE` bytes of the resident frame at
    /// `kaddr`, returning `None` if no such frame exists.
    ///
    /// This is the only way a caller outside this module reaches a frame's
    /// contents — [`FrameTable::alloc`] only ever returns the bare `kaddr`,
    /// since the table itself stays the sole owner of the [`Frame`] handle
    /// for as long as the frame is resident.
    pub fn with_bytes<R>(&self, kaddr: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let session = self.locked();
        let r = session.with_bytes(kaddr, f);
        session.unlock();
        r
    }

    /// Mutable counterpart of [`FrameTable::with_bytes`].
    pub fn with_bytes_mut<R>(&self, kaddr: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let mut session = self.locked();
        let r = session.with_bytes_mut(kaddr, f);
        session.unlock();
        r
    }

    /// The number of frames currently resident. Exposed for tests and for
    /// callers that want to print memory-pressure diagnostics.
    pub fn frame_count(&self) -> usize {
        let guard = self.inner.lock();
        let n = guard.entries.len();
        guard.unlock();
        n
    }
}

/// A held `frame_lock`, spanning every step of one multi-step operation.
///
/// Obtained from [`FrameTable::locked`]. Each method here is the same
/// operation [`FrameTable`] offers directly, just without releasing the
/// lock in between — so a caller that needs to `alloc` a frame and then
/// install it in a pagedir before anyone else can evict it, or that needs to
/// read a frame's bytes back and `free` it as a single step, holds one
/// session across the whole sequence instead of two independent locks with a
/// gap between them.
///
/// Must be ended with [`FrameTableSession::unlock`]; mirrors
/// [`keos::sync::SpinLockGuard`]'s explicit-unlock discipline, which this
/// session's guard is built on.
pub struct FrameTableSession<'a, A: FrameAllocator> {
    guard: keos::sync::SpinLockGuard<'a, Inner<A>>,
}

impl<'a, A: FrameAllocator> FrameTableSession<'a, A> {
    /// Obtains a frame for `upage` owned by `owner`, evicting a victim if
    /// the allocator is exhausted. The lock stays held after this returns —
    /// the caller installs the hardware mapping (or rolls back with
    /// [`Self::free`] on failure) before calling [`Self::unlock`].
    pub fn alloc(&mut self, owner: Arc<dyn FrameOwner>, upage: Va, flags: PageFlags) -> Option<usize> {
        let frame = match self.guard.allocator.get_page(flags) {
            Some(frame) => frame,
            None => self.guard.evict(flags)?,
        };
        let kaddr = frame.kaddr();
        self.guard.entries.push_back(Entry {
            owner,
            upage,
            frame,
        });
        Some(kaddr)
    }

    /// Releases the frame at `kaddr`. A no-op if no such frame is resident.
    pub fn free(&mut self, kaddr: usize) {
        if let Some(idx) = self.guard.entries.iter().position(|e| e.frame.kaddr() == kaddr) {
            self.guard.entries.remove(idx);
        }
    }

    /// Runs `f` over the `PAGE_SIZE` bytes of the resident frame at `kaddr`,
    /// returning `None` if no such frame exists.
    pub fn with_bytes<R>(&self, kaddr: usize, f: impl FnOnce(&[u8]) -> R) -> Option<R> {
        let entry = self.guard.entries.iter().find(|e| e.frame.kaddr() == kaddr)?;
        Some(f(entry.frame.bytes()))
    }

    /// Mutable counterpart of [`Self::with_bytes`].
    pub fn with_bytes_mut<R>(&mut self, kaddr: usize, f: impl FnOnce(&mut [u8]) -> R) -> Option<R> {
        let entry = self.guard.entries.iter_mut().find(|e| e.frame.kaddr() == kaddr)?;
        Some(f(entry.frame.bytes_mut()))
    }

    /// Ends the session, releasing `frame_lock`. Must be called exactly
    /// once — dropping the session without calling this panics, the same as
    /// dropping a [`keos::sync::SpinLockGuard`] without `.unlock()`.
    pub fn unlock(self) {
        self.guard.unlock();
    }
}

#[cfg(test)]
mod tests {
    extern crate std;
    use super::*;
    use crate::{capability::PageFlags, test_support::CappedFrameAllocator};
    use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// A bare-bones [`FrameOwner`] that records whether it was asked to
    /// evict, and whether its accessed bit is set.
    struct TestOwner {
        accessed: AtomicBool,
        evicted_kaddr: AtomicUsize,
        evict_calls: AtomicUsize,
        fail_eviction: bool,
    }

    impl TestOwner {
        fn new(accessed: bool) -> Arc<Self> {
            Arc::new(Self {
                accessed: AtomicBool::new(accessed),
                evicted_kaddr: AtomicUsize::new(0),
                evict_calls: AtomicUsize::new(0),
                fail_eviction: false,
            })
        }
    }

    impl FrameOwner for TestOwner {
        fn is_accessed(&self, _upage: Va) -> bool {
            self.accessed.load(Ordering::SeqCst)
        }
        fn clear_accessed(&self, _upage: Va) {
            self.accessed.store(false, Ordering::SeqCst);
        }
        fn commit_eviction(&self, _upage: Va, kaddr: usize, _bytes: &[u8]) -> Result<(), KernelError> {
            self.evict_calls.fetch_add(1, Ordering::SeqCst);
            self.evicted_kaddr.store(kaddr, Ordering::SeqCst);
            if self.fail_eviction {
                Err(KernelError::IOError)
            } else {
                Ok(())
            }
        }
    }

    fn va(addr: usize) -> Va {
        Va::new(addr).unwrap()
    }

    #[test]
    fn alloc_below_capacity_never_evicts() {
        let table = FrameTable::new(CappedFrameAllocator::new(4));
        let owner = TestOwner::new(false);
        let a = table.alloc(owner.clone(), va(0x1000), PageFlags::USER).unwrap();
        let b = table.alloc(owner, va(0x2000), PageFlags::USER).unwrap();
        assert_ne!(a, b);
        assert_eq!(table.frame_count(), 2);
    }

    #[test]
    fn free_is_a_no_op_for_unknown_kaddr() {
        let table = FrameTable::new(CappedFrameAllocator::new(4));
        table.free(0xdead_beef);
        assert_eq!(table.frame_count(), 0);
    }

    #[test]
    fn eviction_skips_accessed_frames_then_takes_clear_one() {
        let table = FrameTable::new(CappedFrameAllocator::new(2));
        let accessed_owner = TestOwner::new(true);
        let clear_owner = TestOwner::new(false);
        let a = table
            .alloc(accessed_owner.clone(), va(0x1000), PageFlags::USER)
            .unwrap();
        let _b = table
            .alloc(clear_owner.clone(), va(0x2000), PageFlags::USER)
            .unwrap();

        // Capacity is full; the next alloc must evict exactly one victim.
        let _c = table
            .alloc(TestOwner::new(false), va(0x3000), PageFlags::USER)
            .unwrap();

        // The accessed-bit owner got a second chance (accessed cleared, not
        // evicted); the clear owner was the victim.
        assert!(!accessed_owner.accessed.load(Ordering::SeqCst));
        assert_eq!(accessed_owner.evict_calls.load(Ordering::SeqCst), 0);
        assert_eq!(clear_owner.evict_calls.load(Ordering::SeqCst), 1);
        assert_eq!(table.frame_count(), 2);
        let _ = a;
    }

    #[test]
    fn sweep_terminates_when_everything_is_accessed() {
        // Every frame starts accessed; the table must still make progress:
        // one full pass clears every bit, the second pass commits the first
        // one again.
        let table = FrameTable::new(CappedFrameAllocator::new(2));
        let owners: std::vec::Vec<_> = (0..2).map(|_| TestOwner::new(true)).collect();
        for (i, owner) in owners.iter().enumerate() {
            table
                .alloc(owner.clone(), va(0x1000 * (i + 1)), PageFlags::USER)
                .unwrap();
        }
        let _new = table
            .alloc(TestOwner::new(false), va(0x9000), PageFlags::USER)
            .unwrap();
        let total_evictions: usize = owners
            .iter()
            .map(|o| o.evict_calls.load(Ordering::SeqCst))
            .sum();
        assert_eq!(total_evictions, 1);
        assert_eq!(table.frame_count(), 2);
    }

    #[test]
    fn exhaustion_with_empty_table_returns_none() {
        let table: FrameTable<CappedFrameAllocator> = FrameTable::new(CappedFrameAllocator::new(0));
        assert!(
            table
                .alloc(TestOwner::new(false), va(0x1000), PageFlags::USER)
                .is_none()
        );
    }

    #[test]
    fn session_alloc_and_free_stay_under_one_lock_hold() {
        let table = FrameTable::new(CappedFrameAllocator::new(2));
        let owner = TestOwner::new(false);
        let mut session = table.locked();
        let kaddr = session.alloc(owner, va(0x1000), PageFlags::USER).unwrap();
        assert_eq!(session.with_bytes(kaddr, |b| b.len()), Some(4096));
        session.free(kaddr);
        session.unlock();
        assert_eq!(table.frame_count(), 0);
    }

    #[test]
    fn sweep_order_matches_insertion_order() {
        // Regression guard for the "frames appear in insertion order, which
        // defines the sweep order" invariant.
        let table = FrameTable::new(CappedFrameAllocator::new(3));
        struct Recorder {
            order: StdMutex<std::vec::Vec<usize>>,
            accessed: AtomicBool,
        }
        impl FrameOwner for Recorder {
            fn is_accessed(&self, _upage: Va) -> bool {
                self.accessed.load(Ordering::SeqCst)
            }
            fn clear_accessed(&self, _upage: Va) {}
            fn commit_eviction(&self, _upage: Va, kaddr: usize, _bytes: &[u8]) -> Result<(), KernelError> {
                self.order.lock().unwrap().push(kaddr);
                Ok(())
            }
        }
        let recorder = Arc::new(Recorder {
            order: StdMutex::new(std::vec::Vec::new()),
            accessed: AtomicBool::new(false),
        });
        let first = table
            .alloc(recorder.clone(), va(0x1000), PageFlags::USER)
            .unwrap();
        table
            .alloc(recorder.clone(), va(0x2000), PageFlags::USER)
            .unwrap();
        table
            .alloc(recorder.clone(), va(0x3000), PageFlags::USER)
            .unwrap();
        table
            .alloc(recorder.clone(), va(0x4000), PageFlags::USER)
            .unwrap();
        assert_eq!(recorder.order.lock().unwrap()[0], first);
    }
}
