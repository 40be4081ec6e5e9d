//! # IEEE-1284 Standard Parallel Port receiver
//!
//! Ingress path for the byte-parallel print data. The receiver is split
//! into two halves which communicate exclusively through a
//! [ByteQueue] and a set of atomic statistics:
//!
//!  1. [StrobeIsr] owns the port pins and performs the per-byte
//!     handshake. It is meant to be moved into a statically addressable
//!     cell (for example a `critical_section::Mutex<RefCell<Option<..>>>`)
//!     before the strobe interrupt is unmasked, and its
//!     [StrobeIsr::on_strobe] is called from the user-provided interrupt
//!     handler on every falling `nSTROBE` edge.
//!  2. [ParallelReceiver] is the task-side handle polled by the run
//!     loop. All of its operations are lock-free except
//!     [ParallelReceiver::stats], which takes a short critical section
//!     to obtain a consistent multi-word snapshot.
//!
//! Only the host-to-peripheral data phase of IEEE-1284 compatibility
//! mode is implemented. The handshake per byte:
//!
//! ```text
//!   IDLE --nSTROBE falling--> drive BUSY high --> settle --> read D0..D7
//!        <-- BUSY low <-- nACK high <-- 20 us <-- nACK low <-- enqueue
//! ```
//!
//! The handshake always completes, even when the queue is full or the
//! receiver is disabled, so the peer never stalls waiting for `nACK`.
//! A byte that does not fit is dropped and counted; the wire protocol
//! has no retransmission facility.
use embedded_hal::delay::DelayNs;
use fugit::MillisDurationU32;
use portable_atomic::{AtomicBool, AtomicU16, AtomicU32, Ordering};

use crate::queue::ByteQueue;

/// Default capacity of the receive queue in bytes.
pub const DEFAULT_RX_QUEUE_DEPTH: usize = 512;

/// Settle time between asserting BUSY and latching the data lines.
///
/// The data pins are specified stable while `nSTROBE` is low; the short
/// settle keeps the read inside the 5 us entry budget on slow ports.
pub const DATA_SETTLE_US: u32 = 2;

/// Width of the active-low `nACK` acknowledge pulse.
pub const ACK_PULSE_US: u32 = 20;

//==================================================================================================
// Hardware seam
//==================================================================================================

/// Levels of the peer-driven control lines which SPP mode monitors but
/// never acts upon.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct PeerLines {
    /// `nAUTOFEED`, true when the line is electrically high.
    pub autofeed: bool,
    /// `nINIT`, true when the line is electrically high.
    pub initialize: bool,
    /// `nSELECT_IN`, true when the line is electrically high.
    pub select_in: bool,
}

/// Pin-level access to the Centronics connector.
///
/// Implemented by the board support code on top of its GPIO HAL. All
/// `set_*` levels are electrical: `set_busy(true)` drives BUSY high,
/// `set_ack(true)` drives `nACK` low (asserted).
pub trait ParallelPort {
    /// Samples D0..D7. Valid while `nSTROBE` is low.
    fn read_data(&mut self) -> u8;

    /// Drives D0..D7 as outputs. Used by the loopback self-test only;
    /// the peripheral must be absent.
    fn drive_data(&mut self, value: u8);

    /// Returns D0..D7 to inputs after a loopback test.
    fn release_data(&mut self);

    /// Drives the BUSY line, `asserted` meaning electrically high.
    fn set_busy(&mut self, asserted: bool);

    /// Reads the BUSY line back from the pad.
    fn busy_level(&mut self) -> bool;

    /// Drives `nACK`, `asserted` meaning electrically low.
    fn set_ack(&mut self, asserted: bool);

    /// Reads `nACK` back from the pad, true when high.
    fn ack_level(&mut self) -> bool;

    /// Drives the static status outputs: `nERROR` high, `SELECT` high,
    /// `PAPER_OUT` low.
    fn set_online_levels(&mut self);

    /// Samples the monitored peer lines.
    fn peer_lines(&mut self) -> PeerLines;
}

/// Microsecond timestamp source for interrupt duration accounting.
///
/// Wrapping is fine; only short differences are formed.
pub trait MicrosTimestamp {
    fn now_us(&mut self) -> u32;
}

//==================================================================================================
// Statistics
//==================================================================================================

/// Snapshot of the receiver counters.
///
/// Returned by [ParallelReceiver::stats]. `isr_max_us` and
/// `isr_ewma_us` account the handshake work only, excluding the fixed
/// settle and acknowledge intervals.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ReceiverStats {
    pub bytes_total: u32,
    pub overflows: u32,
    pub interrupts_total: u32,
    pub isr_max_us: u16,
    pub isr_ewma_us: u16,
}

#[derive(Debug)]
struct AtomicStats {
    bytes_total: AtomicU32,
    overflows: AtomicU32,
    interrupts_total: AtomicU32,
    isr_max_us: AtomicU16,
    isr_ewma_us: AtomicU16,
}

impl AtomicStats {
    const fn new() -> Self {
        Self {
            bytes_total: AtomicU32::new(0),
            overflows: AtomicU32::new(0),
            interrupts_total: AtomicU32::new(0),
            isr_max_us: AtomicU16::new(0),
            isr_ewma_us: AtomicU16::new(0),
        }
    }

    fn record_work_us(&self, work_us: u32) {
        let work = work_us.min(u16::MAX as u32) as u16;
        self.isr_max_us.fetch_max(work, Ordering::Relaxed);
        // Exponentially weighted moving average with alpha = 1/8.
        let ewma = self.isr_ewma_us.load(Ordering::Relaxed) as u32;
        let next = (ewma * 7 + work as u32).div_ceil(8);
        self.isr_ewma_us
            .store(next.min(u16::MAX as u32) as u16, Ordering::Relaxed);
    }
}

//==================================================================================================
// Shared state
//==================================================================================================

/// State crossed by the strobe interrupt: the byte queue, the counters
/// and the enable flag. Nothing else is shared between the two halves.
///
/// Lives in a `static` owned by the composition root:
///
/// ```ignore
/// static RX_SHARED: ReceiverShared = ReceiverShared::new();
/// let (receiver, isr) = RX_SHARED.split(port, delay, timestamp);
/// ```
pub struct ReceiverShared<const N: usize = DEFAULT_RX_QUEUE_DEPTH> {
    queue: ByteQueue<N>,
    stats: AtomicStats,
    enabled: AtomicBool,
}

impl<const N: usize> Default for ReceiverShared<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> ReceiverShared<N> {
    pub const fn new() -> Self {
        Self {
            queue: ByteQueue::new(),
            stats: AtomicStats::new(),
            enabled: AtomicBool::new(false),
        }
    }

    /// Splits the receiver into its task half and its interrupt half.
    ///
    /// `port` is initialized to the idle bus state (BUSY low, `nACK`
    /// high, status lines online). The returned [StrobeIsr] must be
    /// parked in its static cell before the strobe interrupt is
    /// unmasked.
    pub fn split<P: ParallelPort, D: DelayNs, T: MicrosTimestamp>(
        &self,
        mut port: P,
        delay: D,
        timestamp: T,
    ) -> (ParallelReceiver<'_, N>, StrobeIsr<'_, P, D, T, N>) {
        port.set_online_levels();
        port.set_busy(false);
        port.set_ack(false);
        (
            ParallelReceiver { shared: self },
            StrobeIsr {
                shared: self,
                port,
                delay,
                timestamp,
            },
        )
    }
}

//==================================================================================================
// Interrupt half
//==================================================================================================

/// Interrupt half of the receiver. Owns the port pins.
pub struct StrobeIsr<'a, P: ParallelPort, D: DelayNs, T: MicrosTimestamp, const N: usize> {
    shared: &'a ReceiverShared<N>,
    port: P,
    delay: D,
    timestamp: T,
}

impl<'a, P: ParallelPort, D: DelayNs, T: MicrosTimestamp, const N: usize> StrobeIsr<'a, P, D, T, N> {
    /// Per-byte service routine. Call on every falling `nSTROBE` edge.
    ///
    /// Always drives the complete BUSY/`nACK` handshake so the peer can
    /// proceed, regardless of queue state or the enable flag. The work
    /// outside the two fixed delay intervals is a handful of pin
    /// accesses and atomic increments and fits the 2 us budget on the
    /// reference hardware.
    pub fn on_strobe(&mut self) {
        let entry = self.timestamp.now_us();
        let stats = &self.shared.stats;
        stats.interrupts_total.fetch_add(1, Ordering::Relaxed);

        self.port.set_busy(true);
        self.delay.delay_us(DATA_SETTLE_US);
        let byte = self.port.read_data();

        if self.shared.enabled.load(Ordering::Relaxed) {
            if self.shared.queue.try_push(byte) {
                stats.bytes_total.fetch_add(1, Ordering::Relaxed);
            } else {
                stats.overflows.fetch_add(1, Ordering::Relaxed);
            }
        }

        self.port.set_ack(true);
        self.delay.delay_us(ACK_PULSE_US);
        self.port.set_ack(false);
        self.port.set_busy(false);

        let elapsed = self.timestamp.now_us().wrapping_sub(entry);
        stats.record_work_us(elapsed.saturating_sub(DATA_SETTLE_US + ACK_PULSE_US));
    }

    /// Exercises the output drivers and reads them back through the
    /// pads; the data pins are checked as a drive-then-read loopback.
    ///
    /// Only meaningful while the peripheral is absent and the strobe
    /// interrupt is still masked (boot diagnostics).
    pub fn self_test_signals(&mut self) -> bool {
        let mut pass = true;
        self.port.set_online_levels();

        self.port.set_busy(true);
        pass &= self.port.busy_level();
        self.port.set_busy(false);
        pass &= !self.port.busy_level();

        self.port.set_ack(true);
        pass &= !self.port.ack_level();
        self.port.set_ack(false);
        pass &= self.port.ack_level();

        for pattern in [0x00u8, 0xFF, 0x55, 0xAA] {
            self.port.drive_data(pattern);
            pass &= self.port.read_data() == pattern;
        }
        self.port.release_data();
        pass
    }

    /// Samples the monitored peer control lines.
    pub fn peer_lines(&mut self) -> PeerLines {
        self.port.peer_lines()
    }
}

//==================================================================================================
// Task half
//==================================================================================================

/// Task-side handle polled by the run loop.
pub struct ParallelReceiver<'a, const N: usize = DEFAULT_RX_QUEUE_DEPTH> {
    shared: &'a ReceiverShared<N>,
}

impl<'a, const N: usize> ParallelReceiver<'a, N> {
    #[inline]
    pub fn enable(&mut self, enabled: bool) {
        self.shared.enabled.store(enabled, Ordering::Relaxed);
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        self.shared.enabled.load(Ordering::Relaxed)
    }

    /// Number of bytes currently queued.
    #[inline]
    pub fn available(&self) -> usize {
        self.shared.queue.len()
    }

    /// Pops up to `max` received bytes into `dst`, in arrival order.
    pub fn read(&mut self, dst: &mut [u8], max: usize) -> usize {
        self.shared.queue.drain(dst, max)
    }

    /// Oldest queued byte without consuming it.
    #[inline]
    pub fn peek(&self) -> Option<u8> {
        self.shared.queue.peek()
    }

    /// Discards all queued bytes.
    pub fn clear(&mut self) {
        self.shared.queue.clear();
    }

    #[inline]
    pub fn had_overflow(&self) -> bool {
        self.shared.queue.overflowed()
    }

    #[inline]
    pub fn clear_overflow(&mut self) {
        self.shared.queue.clear_overflow();
    }

    /// Queue fill level in percent.
    #[inline]
    pub fn utilization_pct(&self) -> u8 {
        self.shared.queue.utilization_pct()
    }

    /// Consistent snapshot of the receiver counters.
    ///
    /// The multi-word read happens inside a critical section; on the
    /// target this masks the strobe interrupt for a few loads, short
    /// enough that a concurrent byte is delayed on BUSY, never lost.
    pub fn stats(&self) -> ReceiverStats {
        critical_section::with(|_| {
            let stats = &self.shared.stats;
            ReceiverStats {
                bytes_total: stats.bytes_total.load(Ordering::Relaxed),
                overflows: stats.overflows.load(Ordering::Relaxed),
                interrupts_total: stats.interrupts_total.load(Ordering::Relaxed),
                isr_max_us: stats.isr_max_us.load(Ordering::Relaxed),
                isr_ewma_us: stats.isr_ewma_us.load(Ordering::Relaxed),
            }
        })
    }

    /// Counts strobe interrupts across `duration` while the caller
    /// sleeps. Diagnostic for checking that the peer is pulsing.
    pub fn test_capture(&self, delay: &mut impl DelayNs, duration: MillisDurationU32) -> u32 {
        let before = self.shared.stats.interrupts_total.load(Ordering::Relaxed);
        delay.delay_ms(duration.ticks());
        self.shared
            .stats
            .interrupts_total
            .load(Ordering::Relaxed)
            .wrapping_sub(before)
    }
}
