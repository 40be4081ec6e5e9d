//! # Cooperative run loop
//!
//! The single task driving everything outside the strobe interrupt.
//! Each [RunLoop::poll] performs one tick:
//!
//!  1. advance the storage router (and through it every backend),
//!     counting consecutive failures toward the error indication;
//!  2. drain the parallel receiver into a small stack chunk and
//!     persist it under a generated capture name;
//!  3. every 5 s, publish a status snapshot;
//!  4. every 5 s, surface a latched receive-queue overflow once;
//!  5. every 10 s, sample free memory against the low-water mark;
//!  6. return, so the caller can yield one tick.
//!
//! The loop never panics; every failure becomes an [Observer]
//! notification, and a run of persistent failures (or critical
//! memory exhaustion) latches the error indication, see
//! [RunLoop::error_latched].
//!
//! The wall clock, the free-memory probe and the observer itself are
//! external collaborators behind the [Clock], [MemoryMonitor] and
//! [Observer] traits.
use fugit::MillisDurationU32;

use crate::Error;
use crate::parallel::ParallelReceiver;
use crate::storage::router::StorageRouter;
use crate::storage::{FileName, StorageBackend, StorageKind};

/// Largest capture chunk drained per tick; one file is written per
/// chunk.
pub const CAPTURE_CHUNK: usize = 64;

/// Monotonic millisecond tick source. Wrapping is fine.
pub trait Clock {
    fn now_ms(&mut self) -> u32;
}

/// Free data memory probe.
pub trait MemoryMonitor {
    fn free_bytes(&mut self) -> usize;
}

/// Periodic status published through [Observer::on_status_tick].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct StatusSnapshot {
    pub bytes_total: u32,
    pub overflows: u32,
    pub queue_utilization_pct: u8,
    pub free_bytes: usize,
    pub selected: StorageKind,
}

/// Sink for everything the run loop wants a human (or a log) to see.
/// The concrete observer, display, LED or logger, lives outside the
/// core.
pub trait Observer {
    fn on_file_captured(&mut self, name: &str, bytes: usize);
    fn on_error(&mut self, kind: Error, detail: &str);
    fn on_status_tick(&mut self, snapshot: &StatusSnapshot);
}

#[derive(Debug, Clone, Copy)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct RunLoopConfig {
    pub status_period: MillisDurationU32,
    pub overflow_check_period: MillisDurationU32,
    pub memory_check_period: MillisDurationU32,
    /// Free-byte level below which the low-memory error latches.
    pub low_memory_watermark: usize,
    /// Consecutive failed update ticks before the error indication
    /// latches.
    pub error_threshold: u8,
    /// Prefix and extension for generated capture names.
    pub capture_prefix: &'static str,
    pub capture_ext: &'static str,
}

impl Default for RunLoopConfig {
    fn default() -> Self {
        Self {
            status_period: MillisDurationU32::from_ticks(5000),
            overflow_check_period: MillisDurationU32::from_ticks(5000),
            memory_check_period: MillisDurationU32::from_ticks(10_000),
            low_memory_watermark: 512,
            error_threshold: 8,
            capture_prefix: "data",
            capture_ext: "",
        }
    }
}

pub struct RunLoop<'q, Sd, Nor, Hex, Obs, Clk, Mem, const QN: usize>
where
    Sd: StorageBackend,
    Nor: StorageBackend,
    Hex: StorageBackend,
    Obs: Observer,
    Clk: Clock,
    Mem: MemoryMonitor,
{
    router: StorageRouter<Sd, Nor, Hex>,
    receiver: ParallelReceiver<'q, QN>,
    observer: Obs,
    clock: Clk,
    memory: Mem,
    config: RunLoopConfig,
    last_status: u32,
    last_overflow_check: u32,
    last_memory_check: u32,
    consecutive_errors: u8,
    error_latched: bool,
    started: bool,
}

impl<'q, Sd, Nor, Hex, Obs, Clk, Mem, const QN: usize> RunLoop<'q, Sd, Nor, Hex, Obs, Clk, Mem, QN>
where
    Sd: StorageBackend,
    Nor: StorageBackend,
    Hex: StorageBackend,
    Obs: Observer,
    Clk: Clock,
    Mem: MemoryMonitor,
{
    pub fn new(
        router: StorageRouter<Sd, Nor, Hex>,
        receiver: ParallelReceiver<'q, QN>,
        observer: Obs,
        clock: Clk,
        memory: Mem,
        config: RunLoopConfig,
    ) -> Self {
        Self {
            router,
            receiver,
            observer,
            clock,
            memory,
            config,
            last_status: 0,
            last_overflow_check: 0,
            last_memory_check: 0,
            consecutive_errors: 0,
            error_latched: false,
            started: false,
        }
    }

    /// One cooperative tick. The caller sleeps between polls.
    pub fn poll(&mut self) {
        let now = self.clock.now_ms();
        if !self.started {
            self.started = true;
            self.last_status = now;
            self.last_overflow_check = now;
            self.last_memory_check = now;
        }

        self.advance_components();
        self.drain_capture();

        if now.wrapping_sub(self.last_status) >= self.config.status_period.ticks() {
            self.last_status = now;
            self.publish_status();
        }

        if now.wrapping_sub(self.last_overflow_check) >= self.config.overflow_check_period.ticks()
        {
            self.last_overflow_check = now;
            if self.receiver.had_overflow() {
                self.receiver.clear_overflow();
                self.observer.on_error(Error::IoError, "receive queue overflow");
            }
        }

        if now.wrapping_sub(self.last_memory_check) >= self.config.memory_check_period.ticks() {
            self.last_memory_check = now;
            if self.memory.free_bytes() < self.config.low_memory_watermark {
                self.error_latched = true;
                self.observer.on_error(Error::NoSpace, "free memory low");
            }
        }
    }

    fn advance_components(&mut self) {
        match self.router.update() {
            Ok(()) => self.consecutive_errors = 0,
            Err(kind) => {
                self.consecutive_errors = self.consecutive_errors.saturating_add(1);
                self.observer.on_error(kind, "storage update");
                if self.consecutive_errors >= self.config.error_threshold && !self.error_latched {
                    self.error_latched = true;
                    self.observer.on_error(kind, "persistent storage errors");
                }
            }
        }
    }

    /// Drains at most one chunk per tick and persists it as its own
    /// capture file. A failed write is reported, not retried; the
    /// wire protocol has no replay.
    fn drain_capture(&mut self) {
        if self.receiver.available() == 0 {
            return;
        }
        let mut chunk = [0u8; CAPTURE_CHUNK];
        let count = self.receiver.read(&mut chunk, CAPTURE_CHUNK);
        if count == 0 {
            return;
        }
        let mut name = FileName::new();
        match self.router.write_auto(
            self.config.capture_prefix,
            self.config.capture_ext,
            &chunk[..count],
            Some(&mut name),
        ) {
            Ok(written) => self.observer.on_file_captured(name.as_str(), written),
            Err(kind) => self.observer.on_error(kind, "capture write"),
        }
    }

    fn publish_status(&mut self) {
        let stats = self.receiver.stats();
        let snapshot = StatusSnapshot {
            bytes_total: stats.bytes_total,
            overflows: stats.overflows,
            queue_utilization_pct: self.receiver.utilization_pct(),
            free_bytes: self.memory.free_bytes(),
            selected: self.router.selected(),
        };
        self.observer.on_status_tick(&snapshot);
    }

    /// True once persistent errors or memory exhaustion demoted the
    /// system into its error-indication mode.
    pub fn error_latched(&self) -> bool {
        self.error_latched
    }

    /// Operator surface: the commands (select, list, copy, stats,
    /// space) go straight to the router.
    pub fn router_mut(&mut self) -> &mut StorageRouter<Sd, Nor, Hex> {
        &mut self.router
    }

    pub fn receiver_mut(&mut self) -> &mut ParallelReceiver<'q, QN> {
        &mut self.receiver
    }

    pub fn observer(&self) -> &Obs {
        &self.observer
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parallel::ReceiverShared;
    use crate::parallel::testutil::{MockIsr, pair, strobe};
    use crate::storage::testutil::MockBackend;
    use std::rc::Rc;
    use std::cell::Cell;
    use std::string::{String, ToString};
    use std::vec::Vec;

    #[derive(Debug, PartialEq)]
    enum Event {
        Captured(String, usize),
        Error(Error, String),
        Status(StatusSnapshot),
    }

    #[derive(Default)]
    struct Recorder {
        events: Vec<Event>,
    }

    impl Observer for Recorder {
        fn on_file_captured(&mut self, name: &str, bytes: usize) {
            self.events.push(Event::Captured(name.to_string(), bytes));
        }

        fn on_error(&mut self, kind: Error, detail: &str) {
            self.events.push(Event::Error(kind, detail.to_string()));
        }

        fn on_status_tick(&mut self, snapshot: &StatusSnapshot) {
            self.events.push(Event::Status(*snapshot));
        }
    }

    #[derive(Clone)]
    struct SharedClock(Rc<Cell<u32>>);

    impl Clock for SharedClock {
        fn now_ms(&mut self) -> u32 {
            self.0.get()
        }
    }

    #[derive(Clone)]
    struct SharedMemory(Rc<Cell<usize>>);

    impl MemoryMonitor for SharedMemory {
        fn free_bytes(&mut self) -> usize {
            self.0.get()
        }
    }

    type TestLoop<'q, const QN: usize> = RunLoop<
        'q,
        MockBackend,
        MockBackend,
        MockBackend,
        Recorder,
        SharedClock,
        SharedMemory,
        QN,
    >;

    struct Fixture {
        clock: Rc<Cell<u32>>,
        memory: Rc<Cell<usize>>,
    }

    fn fixture<const QN: usize>(
        shared: &ReceiverShared<QN>,
        nor_ready: bool,
        config: RunLoopConfig,
    ) -> (TestLoop<'_, QN>, MockIsr<'_, QN>, Fixture) {
        let (mut receiver, isr) = pair(shared, 1);
        receiver.enable(true);
        let router = StorageRouter::new(
            MockBackend::new(false),
            MockBackend::new(nor_ready),
            MockBackend::new(false),
        );
        let clock = Rc::new(Cell::new(0));
        let memory = Rc::new(Cell::new(4096));
        let run_loop = RunLoop::new(
            router,
            receiver,
            Recorder::default(),
            SharedClock(clock.clone()),
            SharedMemory(memory.clone()),
            config,
        );
        (run_loop, isr, Fixture { clock, memory })
    }

    #[test]
    fn captured_bytes_become_a_named_file() {
        let shared = ReceiverShared::<256>::new();
        let (mut run_loop, mut isr, _env) = fixture(&shared, true, RunLoopConfig::default());
        for byte in [0x48u8, 0x69, 0x0A] {
            strobe(&mut isr, byte);
        }
        run_loop.poll();

        assert_eq!(run_loop.router_mut().selected(), StorageKind::Nor);
        let mut dst = [0u8; 8];
        assert_eq!(run_loop.router_mut().read("data_0001", &mut dst), Ok(3));
        assert_eq!(&dst[..3], &[0x48, 0x69, 0x0A]);
        assert_eq!(
            run_loop.observer().events,
            [Event::Captured("data_0001".to_string(), 3)]
        );
    }

    #[test]
    fn bursts_are_bounded_by_the_capture_chunk() {
        let shared = ReceiverShared::<256>::new();
        let (mut run_loop, mut isr, _env) = fixture(&shared, true, RunLoopConfig::default());
        for byte in 0..100u8 {
            strobe(&mut isr, byte);
        }
        run_loop.poll();
        run_loop.poll();

        let router = run_loop.router_mut();
        let mut dst = [0u8; 128];
        assert_eq!(router.read("data_0001", &mut dst), Ok(CAPTURE_CHUNK));
        let expected: [u8; CAPTURE_CHUNK] = core::array::from_fn(|index| index as u8);
        assert_eq!(&dst[..CAPTURE_CHUNK], &expected);
        assert_eq!(router.read("data_0002", &mut dst), Ok(100 - CAPTURE_CHUNK));
        assert_eq!(dst[0], CAPTURE_CHUNK as u8);
    }

    #[test]
    fn capture_failure_is_reported_not_retried() {
        let shared = ReceiverShared::<64>::new();
        let (mut run_loop, mut isr, _env) = fixture(&shared, true, RunLoopConfig::default());
        strobe(&mut isr, 0x42);
        run_loop.router_mut().nor_mut().fail_writes = true;
        run_loop.poll();
        assert_eq!(
            run_loop.observer().events,
            [Event::Error(Error::IoError, "capture write".to_string())]
        );
        // The byte was consumed; nothing is re-queued.
        assert_eq!(run_loop.receiver_mut().available(), 0);
    }

    #[test]
    fn status_ticks_every_period() {
        let shared = ReceiverShared::<64>::new();
        let (mut run_loop, _isr, env) = fixture(&shared, true, RunLoopConfig::default());
        run_loop.poll();
        env.clock.set(4999);
        run_loop.poll();
        assert!(run_loop.observer().events.is_empty());

        env.clock.set(5000);
        run_loop.poll();
        let statuses: Vec<&Event> = run_loop
            .observer()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Status(_)))
            .collect();
        assert_eq!(statuses.len(), 1);
        if let Event::Status(snapshot) = statuses[0] {
            assert_eq!(snapshot.selected, StorageKind::Nor);
            assert_eq!(snapshot.free_bytes, 4096);
            assert_eq!(snapshot.queue_utilization_pct, 0);
        }

        env.clock.set(9000);
        run_loop.poll();
        env.clock.set(10_000);
        run_loop.poll();
        let statuses = run_loop
            .observer()
            .events
            .iter()
            .filter(|event| matches!(event, Event::Status(_)))
            .count();
        assert_eq!(statuses, 2);
    }

    #[test]
    fn overflow_is_surfaced_once_per_window() {
        let shared = ReceiverShared::<16>::new();
        let (mut run_loop, mut isr, env) = fixture(&shared, true, RunLoopConfig::default());
        for byte in 0..20u8 {
            strobe(&mut isr, byte);
        }
        run_loop.poll();
        env.clock.set(5000);
        run_loop.poll();
        let overflow_reports = run_loop
            .observer()
            .events
            .iter()
            .filter(|event| {
                matches!(event, Event::Error(Error::IoError, detail) if detail == "receive queue overflow")
            })
            .count();
        assert_eq!(overflow_reports, 1);
        assert!(!run_loop.receiver_mut().had_overflow());

        env.clock.set(10_000);
        run_loop.poll();
        let overflow_reports = run_loop
            .observer()
            .events
            .iter()
            .filter(|event| {
                matches!(event, Event::Error(Error::IoError, detail) if detail == "receive queue overflow")
            })
            .count();
        assert_eq!(overflow_reports, 1);
    }

    #[test]
    fn persistent_update_errors_latch_the_indication() {
        let shared = ReceiverShared::<16>::new();
        let config = RunLoopConfig {
            error_threshold: 3,
            ..RunLoopConfig::default()
        };
        let (mut run_loop, _isr, _env) = fixture(&shared, true, config);
        run_loop.router_mut().nor_mut().update_result = Err(Error::IoError);

        run_loop.poll();
        run_loop.poll();
        assert!(!run_loop.error_latched());
        run_loop.poll();
        assert!(run_loop.error_latched());
        let persistent = run_loop
            .observer()
            .events
            .iter()
            .filter(|event| {
                matches!(event, Event::Error(_, detail) if detail == "persistent storage errors")
            })
            .count();
        assert_eq!(persistent, 1);
    }

    #[test]
    fn recovery_resets_the_error_run() {
        let shared = ReceiverShared::<16>::new();
        let config = RunLoopConfig {
            error_threshold: 3,
            ..RunLoopConfig::default()
        };
        let (mut run_loop, _isr, _env) = fixture(&shared, true, config);
        run_loop.router_mut().nor_mut().update_result = Err(Error::IoError);
        run_loop.poll();
        run_loop.poll();
        run_loop.router_mut().nor_mut().update_result = Ok(());
        run_loop.poll();
        run_loop.router_mut().nor_mut().update_result = Err(Error::IoError);
        run_loop.poll();
        run_loop.poll();
        assert!(!run_loop.error_latched());
    }

    #[test]
    fn low_memory_latches_fatally() {
        let shared = ReceiverShared::<16>::new();
        let (mut run_loop, _isr, env) = fixture(&shared, true, RunLoopConfig::default());
        run_loop.poll();
        env.memory.set(100);
        env.clock.set(9_999);
        run_loop.poll();
        assert!(!run_loop.error_latched());
        env.clock.set(10_000);
        run_loop.poll();
        assert!(run_loop.error_latched());
        assert!(run_loop.observer().events.iter().any(|event| {
            matches!(event, Event::Error(Error::NoSpace, detail) if detail == "free memory low")
        }));
    }
}
