//! # Single-producer single-consumer byte queue
//!
//! Fixed-capacity ring used to move bytes from the parallel-port strobe
//! interrupt into the cooperative task. The producer role belongs to
//! exactly one interrupt handler, the consumer role to exactly one task;
//! under that discipline all operations are lock-free and constant-time.
//!
//! The queue never blocks and never allocates. A push against a full
//! ring drops the byte and latches the overflow flag; the consumer
//! learns about the loss through [ByteQueue::overflowed], not by
//! recovering the data.
use core::cell::UnsafeCell;

use portable_atomic::{AtomicBool, AtomicUsize, Ordering};

/// SPSC byte ring with compile-time capacity.
///
/// `N` must be a power of two so the index wrap is a single mask
/// operation.
///
/// Concurrency contract: [Self::try_push] may only be called from the
/// producer context (interrupt), every other mutating operation only
/// from the consumer context (task). `head` is written by the producer
/// alone, `tail` by the consumer alone; the shared `count` uses
/// acquire/release ordering so the opposite side always observes slot
/// contents consistent with the count it read.
pub struct ByteQueue<const N: usize> {
    buf: [UnsafeCell<u8>; N],
    /// Producer write index.
    head: AtomicUsize,
    /// Consumer read index.
    tail: AtomicUsize,
    count: AtomicUsize,
    overflow: AtomicBool,
}

// Safety: interior mutability is confined to disjoint slots. The
// producer only writes a slot while `count < N` proves the consumer is
// not reading it, and the release store on `count` publishes the write
// before the consumer can observe the new length.
unsafe impl<const N: usize> Sync for ByteQueue<N> {}

impl<const N: usize> Default for ByteQueue<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ByteQueue<N> {
    pub const fn new() -> Self {
        const { assert!(N.is_power_of_two(), "queue capacity must be a power of two") }
        Self {
            buf: [const { UnsafeCell::new(0) }; N],
            head: AtomicUsize::new(0),
            tail: AtomicUsize::new(0),
            count: AtomicUsize::new(0),
            overflow: AtomicBool::new(false),
        }
    }

    /// Appends a byte. Producer-only; safe to call from interrupt
    /// context.
    ///
    /// Returns false and latches the overflow flag if the ring is full.
    pub fn try_push(&self, byte: u8) -> bool {
        if self.count.load(Ordering::Acquire) >= N {
            self.overflow.store(true, Ordering::Relaxed);
            return false;
        }
        let head = self.head.load(Ordering::Relaxed);
        // Safety: count < N, so the consumer cannot be reading this slot.
        unsafe { *self.buf[head].get() = byte };
        self.head.store((head + 1) & (N - 1), Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Release);
        true
    }

    /// Removes and returns the oldest byte. Consumer-only.
    pub fn try_pop(&self) -> Option<u8> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        // Safety: count > 0, so the producer cannot be writing this slot.
        let byte = unsafe { *self.buf[tail].get() };
        self.tail.store((tail + 1) & (N - 1), Ordering::Relaxed);
        self.count.fetch_sub(1, Ordering::Release);
        Some(byte)
    }

    /// Returns the oldest byte without removing it. Consumer-only.
    pub fn peek(&self) -> Option<u8> {
        if self.count.load(Ordering::Acquire) == 0 {
            return None;
        }
        let tail = self.tail.load(Ordering::Relaxed);
        Some(unsafe { *self.buf[tail].get() })
    }

    /// Pops up to `max` bytes into `dst`. Consumer-only.
    ///
    /// Returns the number of bytes written to `dst`.
    pub fn drain(&self, dst: &mut [u8], max: usize) -> usize {
        let limit = max.min(dst.len());
        let mut popped = 0;
        while popped < limit {
            match self.try_pop() {
                Some(byte) => {
                    dst[popped] = byte;
                    popped += 1;
                }
                None => break,
            }
        }
        popped
    }

    /// Discards all queued bytes. Consumer-only.
    pub fn clear(&self) {
        while self.try_pop().is_some() {}
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len() >= N
    }

    #[inline]
    pub const fn capacity(&self) -> usize {
        N
    }

    /// Fill level in percent, 0 to 100.
    #[inline]
    pub fn utilization_pct(&self) -> u8 {
        (self.len() * 100 / N) as u8
    }

    /// True if a push was ever dropped since the last
    /// [Self::clear_overflow].
    #[inline]
    pub fn overflowed(&self) -> bool {
        self.overflow.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn clear_overflow(&self) {
        self.overflow.store(false, Ordering::Relaxed);
    }
}
