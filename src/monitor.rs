use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

/// Cumulative count of bytes appended to the destination.
///
/// Only the transfer path holds this (it is not `Clone`); everything else
/// gets a [`ByteCounterReader`].
#[derive(Debug, Default)]
pub struct ByteCounter {
    bytes: Arc<AtomicU64>,
}

impl ByteCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn add(&self, n: u64) {
        self.bytes.fetch_add(n, Ordering::SeqCst);
    }

    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn reader(&self) -> ByteCounterReader {
        ByteCounterReader { bytes: self.bytes.clone() }
    }
}

/// Read-only view of a [`ByteCounter`].
#[derive(Debug, Clone)]
pub struct ByteCounterReader {
    bytes: Arc<AtomicU64>,
}

impl ByteCounterReader {
    pub fn get(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }
}

/// Background timer that calls `on_stall` when the byte count stops moving.
///
/// Every `timeout` the monitor samples the count; if it has not changed since
/// the previous sample, `on_stall` runs once and the monitor stops. Dropping
/// the monitor stops it.
#[derive(Debug)]
pub struct StallMonitor {
    handle: Option<JoinHandle<()>>,
}

impl StallMonitor {
    /// Spawn the monitor on the current tokio runtime.
    pub fn start<F, S>(bytes_written: F, timeout: Duration, on_stall: S) -> Self
    where
        F: Fn() -> u64 + Send + 'static,
        S: FnOnce() + Send + 'static,
    {
        let handle = tokio::spawn(async move {
            let mut last = bytes_written();
            let mut ticker = tokio::time::interval_at(Instant::now() + timeout, timeout);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let current = bytes_written();
                if current == last {
                    on_stall();
                    return;
                }
                last = current;
            }
        });
        Self { handle: Some(handle) }
    }

    /// Stop polling. Safe to call repeatedly, and after the monitor fired.
    pub fn stop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

impl Drop for StallMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn stall_counter() -> (Arc<AtomicU32>, impl FnOnce() + Send + 'static) {
        let fired = Arc::new(AtomicU32::new(0));
        let hook = fired.clone();
        (fired, move || {
            hook.fetch_add(1, Ordering::SeqCst);
        })
    }

    #[tokio::test(start_paused = true)]
    async fn fires_once_without_progress() {
        let counter = ByteCounter::new();
        let reader = counter.reader();
        let (fired, on_stall) = stall_counter();
        let _monitor = StallMonitor::start(move || reader.get(), Duration::from_secs(5), on_stall);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn steady_progress_keeps_it_quiet() {
        let counter = ByteCounter::new();
        let reader = counter.reader();
        let (fired, on_stall) = stall_counter();
        let _monitor = StallMonitor::start(move || reader.get(), Duration::from_secs(5), on_stall);

        for _ in 0..20 {
            tokio::time::sleep(Duration::from_secs(1)).await;
            counter.add(1);
        }
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        // Slow but steady never trips it; silence does.
        tokio::time::sleep(Duration::from_secs(11)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_is_idempotent_and_prevents_firing() {
        let counter = ByteCounter::new();
        let reader = counter.reader();
        let (fired, on_stall) = stall_counter();
        let mut monitor = StallMonitor::start(move || reader.get(), Duration::from_secs(5), on_stall);

        monitor.stop();
        monitor.stop();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_stops_it() {
        let counter = ByteCounter::new();
        let reader = counter.reader();
        let (fired, on_stall) = stall_counter();
        drop(StallMonitor::start(move || reader.get(), Duration::from_secs(5), on_stall));

        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn reader_sees_writes() {
        let counter = ByteCounter::new();
        let reader = counter.reader();
        counter.add(8192);
        counter.add(10);
        assert_eq!(reader.get(), 8202);
        assert_eq!(counter.get(), 8202);
    }
}
