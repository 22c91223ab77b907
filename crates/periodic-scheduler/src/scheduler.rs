//! Periodic Scheduler Implementation

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use metrics::counter;
use parking_lot::{Condvar, Mutex};
use passthru_protocol::limits::{
    MAX_PERIODIC_INTERVAL_MS, MAX_PERIODIC_MSGS, MIN_PERIODIC_INTERVAL_MS,
};
use tracing::{debug, info, warn};

use crate::SchedulerError;

/// Result of one firing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    /// Message handed to the write path
    Sent,
    /// Write path was busy past the allowed wait; the tick is missed
    Busy,
    /// Write path rejected the message
    Failed,
}

/// Receiver of periodic firings
///
/// Implemented by the channel engine; `fire` must go through the same write
/// path external writes use.
pub trait PeriodicSink<M>: Send + Sync {
    fn fire(&self, id: u32, msg: &M) -> FireOutcome;
}

/// Configuration for the periodic scheduler
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Maximum concurrent registrations
    pub max_entries: usize,
    /// Shortest accepted interval
    pub min_interval: Duration,
    /// Longest accepted interval
    pub max_interval: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_entries: MAX_PERIODIC_MSGS,
            min_interval: Duration::from_millis(MIN_PERIODIC_INTERVAL_MS),
            max_interval: Duration::from_millis(MAX_PERIODIC_INTERVAL_MS),
        }
    }
}

/// Firing counters of one registration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeriodicStats {
    /// Write attempts made
    pub fired: u64,
    /// Ticks skipped because the write path was busy or the timer fell behind
    pub missed: u64,
}

#[derive(Default)]
struct Counters {
    fired: AtomicU64,
    missed: AtomicU64,
}

impl Counters {
    fn miss(&self, ticks: u64) {
        self.missed.fetch_add(ticks, Ordering::Relaxed);
        counter!("passthru_periodic_missed_total").increment(ticks);
    }

    fn snapshot(&self) -> PeriodicStats {
        PeriodicStats {
            fired: self.fired.load(Ordering::Relaxed),
            missed: self.missed.load(Ordering::Relaxed),
        }
    }
}

/// Cancellation signal shared with a timer thread
struct Cancel {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl Cancel {
    fn new() -> Self {
        Self {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        }
    }

    fn signal(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }

    /// Sleep until `deadline`; false if cancelled first
    fn sleep_until(&self, deadline: Instant) -> bool {
        let mut stopped = self.stopped.lock();
        while !*stopped {
            if self.wake.wait_until(&mut stopped, deadline).timed_out() {
                break;
            }
        }
        !*stopped
    }
}

struct Registration {
    id: u32,
    interval: Duration,
    counters: Arc<Counters>,
    cancel: Arc<Cancel>,
    handle: Option<JoinHandle<()>>,
}

impl Registration {
    /// Signal the timer and wait for it to exit
    fn shutdown(mut self) {
        self.cancel.signal();
        if let Some(handle) = self.handle.take() {
            // A sink may stop its own registration from the timer thread
            if handle.thread().id() == thread::current().id() {
                return;
            }
            if handle.join().is_err() {
                warn!(id = self.id, "Periodic timer thread panicked");
            }
        }
    }
}

struct Table {
    entries: Vec<Registration>,
    next_id: u32,
}

/// Timer-driven re-transmission of registered messages
///
/// Each registration runs on its own thread with deadline based ticks
/// (`start + n * interval`). `stop` returns only after the timer thread has
/// exited, so no firing is observed afterwards.
pub struct PeriodicScheduler<M> {
    table: Mutex<Table>,
    config: SchedulerConfig,
    _marker: std::marker::PhantomData<fn(M)>,
}

impl<M: Send + 'static> PeriodicScheduler<M> {
    pub fn new(config: SchedulerConfig) -> Self {
        Self {
            table: Mutex::new(Table {
                entries: Vec::new(),
                next_id: 1,
            }),
            config,
            _marker: std::marker::PhantomData,
        }
    }

    /// Register a message and start its timer
    pub fn start(
        &self,
        msg: M,
        interval: Duration,
        sink: Weak<dyn PeriodicSink<M>>,
    ) -> Result<u32, SchedulerError> {
        if interval < self.config.min_interval || interval > self.config.max_interval {
            return Err(SchedulerError::InvalidInterval(interval.as_millis() as u64));
        }

        let mut table = self.table.lock();
        if table.entries.len() >= self.config.max_entries {
            return Err(SchedulerError::LimitExceeded(self.config.max_entries));
        }

        let id = table.next_id;
        let counters = Arc::new(Counters::default());
        let cancel = Arc::new(Cancel::new());

        let thread_counters = Arc::clone(&counters);
        let thread_cancel = Arc::clone(&cancel);
        let handle = thread::Builder::new()
            .name(format!("periodic-{}", id))
            .spawn(move || run_timer(id, msg, interval, sink, thread_counters, thread_cancel))
            .map_err(|e| SchedulerError::Spawn(e.to_string()))?;

        table.next_id = table.next_id.wrapping_add(1).max(1);
        table.entries.push(Registration {
            id,
            interval,
            counters,
            cancel,
            handle: Some(handle),
        });
        info!(id, interval_ms = interval.as_millis() as u64, "Periodic message started");
        Ok(id)
    }

    /// Stop one registration and wait for its timer to exit
    pub fn stop(&self, id: u32) -> Result<PeriodicStats, SchedulerError> {
        let registration = {
            let mut table = self.table.lock();
            let pos = table
                .entries
                .iter()
                .position(|r| r.id == id)
                .ok_or(SchedulerError::NotFound(id))?;
            table.entries.remove(pos)
        };

        let counters = Arc::clone(&registration.counters);
        registration.shutdown();
        let stats = counters.snapshot();
        info!(id, fired = stats.fired, missed = stats.missed, "Periodic message stopped");
        Ok(stats)
    }

    /// Stop every registration, returning how many were stopped
    pub fn stop_all(&self) -> usize {
        let registrations = std::mem::take(&mut self.table.lock().entries);
        let count = registrations.len();
        for registration in registrations {
            registration.shutdown();
        }
        if count > 0 {
            debug!(count, "All periodic messages stopped");
        }
        count
    }

    /// Firing counters of a live registration
    pub fn stats(&self, id: u32) -> Option<PeriodicStats> {
        self.table
            .lock()
            .entries
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.counters.snapshot())
    }

    /// Interval of a live registration
    pub fn interval(&self, id: u32) -> Option<Duration> {
        self.table
            .lock()
            .entries
            .iter()
            .find(|r| r.id == id)
            .map(|r| r.interval)
    }

    pub fn len(&self) -> usize {
        self.table.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.lock().entries.is_empty()
    }
}

impl<M> Drop for PeriodicScheduler<M> {
    fn drop(&mut self) {
        for registration in std::mem::take(&mut self.table.get_mut().entries) {
            registration.shutdown();
        }
    }
}

fn run_timer<M>(
    id: u32,
    msg: M,
    interval: Duration,
    sink: Weak<dyn PeriodicSink<M>>,
    counters: Arc<Counters>,
    cancel: Arc<Cancel>,
) {
    let mut deadline = Instant::now() + interval;
    loop {
        if !cancel.sleep_until(deadline) {
            return;
        }
        let Some(sink) = sink.upgrade() else {
            debug!(id, "Periodic sink dropped, timer exiting");
            return;
        };

        match sink.fire(id, &msg) {
            FireOutcome::Sent => {
                counters.fired.fetch_add(1, Ordering::Relaxed);
            }
            FireOutcome::Failed => {
                counters.fired.fetch_add(1, Ordering::Relaxed);
                debug!(id, "Periodic write failed");
            }
            FireOutcome::Busy => {
                counters.miss(1);
                warn!(id, "Periodic tick missed, write path busy");
            }
        }
        drop(sink);

        deadline += interval;
        let now = Instant::now();
        if deadline <= now {
            let (next, behind) = skip_overrun(deadline, now, interval);
            counters.miss(behind);
            deadline = next;
            warn!(id, skipped = behind, "Periodic timer overran");
        }
    }
}

/// Next deadline after `now` on the `deadline + n * interval` grid, and the
/// number of ticks skipped to reach it
fn skip_overrun(deadline: Instant, now: Instant, interval: Duration) -> (Instant, u64) {
    let behind = now.saturating_duration_since(deadline).as_nanos() / interval.as_nanos().max(1) + 1;
    let behind = u64::try_from(behind).unwrap_or(u64::MAX);
    let next = u32::try_from(behind)
        .ok()
        .and_then(|ticks| interval.checked_mul(ticks))
        .and_then(|skip| deadline.checked_add(skip))
        .unwrap_or(now + interval);
    (next, behind)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    struct CountingSink {
        fired: AtomicUsize,
    }

    impl CountingSink {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fired: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.fired.load(Ordering::SeqCst)
        }
    }

    impl PeriodicSink<u8> for CountingSink {
        fn fire(&self, _id: u32, _msg: &u8) -> FireOutcome {
            self.fired.fetch_add(1, Ordering::SeqCst);
            FireOutcome::Sent
        }
    }

    struct BusySink;

    impl PeriodicSink<u8> for BusySink {
        fn fire(&self, _id: u32, _msg: &u8) -> FireOutcome {
            FireOutcome::Busy
        }
    }

    fn weak(sink: &Arc<CountingSink>) -> Weak<dyn PeriodicSink<u8>> {
        let sink: Arc<dyn PeriodicSink<u8>> = sink.clone();
        Arc::downgrade(&sink)
    }

    #[test]
    fn test_fires_on_interval_and_stops() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
        let sink = CountingSink::new();
        let id = scheduler
            .start(0x01, Duration::from_millis(100), weak(&sink))
            .unwrap();

        thread::sleep(Duration::from_millis(1050));
        let stats = scheduler.stop(id).unwrap();
        let at_stop = sink.count();
        assert!(at_stop >= 9, "only {} firings", at_stop);
        assert_eq!(stats.fired as usize, at_stop);

        thread::sleep(Duration::from_millis(300));
        assert_eq!(sink.count(), at_stop);
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_interval_bounds() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
        let sink = CountingSink::new();
        assert_eq!(
            scheduler.start(0, Duration::from_millis(4), weak(&sink)),
            Err(SchedulerError::InvalidInterval(4))
        );
        assert_eq!(
            scheduler.start(0, Duration::from_millis(65536), weak(&sink)),
            Err(SchedulerError::InvalidInterval(65536))
        );
        assert!(scheduler.is_empty());
    }

    #[test]
    fn test_table_limit() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig {
            max_entries: 2,
            ..Default::default()
        });
        let sink = CountingSink::new();
        scheduler.start(0, Duration::from_millis(500), weak(&sink)).unwrap();
        scheduler.start(1, Duration::from_millis(500), weak(&sink)).unwrap();
        assert_eq!(
            scheduler.start(2, Duration::from_millis(500), weak(&sink)),
            Err(SchedulerError::LimitExceeded(2))
        );
        assert_eq!(scheduler.stop_all(), 2);
    }

    #[test]
    fn test_stop_unknown_id() {
        let scheduler = PeriodicScheduler::<u8>::new(SchedulerConfig::default());
        assert_eq!(scheduler.stop(42).err(), Some(SchedulerError::NotFound(42)));
    }

    #[test]
    fn test_ids_not_reused() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
        let sink = CountingSink::new();
        let first = scheduler.start(0, Duration::from_millis(500), weak(&sink)).unwrap();
        scheduler.stop(first).unwrap();
        let second = scheduler.start(0, Duration::from_millis(500), weak(&sink)).unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_busy_sink_counts_missed_ticks() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
        let sink: Arc<dyn PeriodicSink<u8>> = Arc::new(BusySink);
        let id = scheduler
            .start(0, Duration::from_millis(20), Arc::downgrade(&sink))
            .unwrap();

        thread::sleep(Duration::from_millis(150));
        let stats = scheduler.stats(id).unwrap();
        assert!(stats.missed >= 3);
        assert_eq!(stats.fired, 0);
        scheduler.stop(id).unwrap();
    }

    #[test]
    fn test_overrun_skips_to_next_grid_point() {
        let interval = Duration::from_millis(10);
        let deadline = Instant::now();
        let (next, behind) = skip_overrun(deadline, deadline + Duration::from_millis(35), interval);
        assert_eq!(behind, 4);
        assert_eq!(next, deadline + Duration::from_millis(40));

        let (next, behind) = skip_overrun(deadline, deadline, interval);
        assert_eq!(behind, 1);
        assert_eq!(next, deadline + interval);
    }

    #[test]
    fn test_long_overrun_does_not_truncate() {
        let interval = Duration::from_millis(5);
        let deadline = Instant::now();
        // more ticks than fit in a u32
        let now = deadline + interval * u32::MAX + interval * 10;
        let (next, behind) = skip_overrun(deadline, now, interval);
        assert_eq!(behind, u32::MAX as u64 + 11);
        assert!(next > now);
    }

    #[test]
    fn test_dropped_sink_ends_timer() {
        let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
        let sink = CountingSink::new();
        let id = scheduler.start(0, Duration::from_millis(10), weak(&sink)).unwrap();
        drop(sink);
        thread::sleep(Duration::from_millis(50));
        // Timer already exited; stop still succeeds and joins immediately
        assert!(scheduler.stop(id).is_ok());
    }

    #[test]
    fn test_drop_stops_timers() {
        let sink = CountingSink::new();
        {
            let scheduler = PeriodicScheduler::new(SchedulerConfig::default());
            scheduler.start(0, Duration::from_millis(10), weak(&sink)).unwrap();
            thread::sleep(Duration::from_millis(50));
        }
        let after_drop = sink.count();
        thread::sleep(Duration::from_millis(50));
        assert_eq!(sink.count(), after_drop);
    }
}
