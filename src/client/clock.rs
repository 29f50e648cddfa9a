#![forbid(unsafe_code)]

// Clock offset estimation from ping/pong round trips

use crate::schedule::ScheduledTask;
use crate::time::Clock;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex as StdMutex, RwLock as StdRwLock};
use std::time::Duration;
use tracing::{debug, trace};

pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_millis(2000);
pub const DEFAULT_MAX_SAMPLES: usize = 5;

/// Median of `samples`; even counts average the two middle values. Empty gives 0.
pub fn median(samples: &[f64]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let mut sorted = samples.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let mid = sorted.len() / 2;
    if sorted.len() % 2 == 0 {
        (sorted[mid - 1] + sorted[mid]) / 2.0
    } else {
        sorted[mid]
    }
}

struct SampleWindow {
    samples: VecDeque<f64>,
    capacity: usize,
    offset: f64,
}

/// Estimates `server_clock - local_clock` in milliseconds.
///
/// Each probe yields `sample = Ts + RTT/2 - receive_time`; the estimate is the
/// median of the most recent samples, so a single slow round trip cannot drag
/// it far. Cloning shares the same window.
#[derive(Clone)]
pub struct ClockSync {
    window: Arc<StdRwLock<SampleWindow>>,
    probe_task: Arc<StdMutex<Option<ScheduledTask>>>,
    local: Arc<dyn Clock>,
}

impl ClockSync {
    pub fn new(local: Arc<dyn Clock>) -> Self {
        Self::with_capacity(local, DEFAULT_MAX_SAMPLES)
    }

    pub fn with_capacity(local: Arc<dyn Clock>, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            window: Arc::new(StdRwLock::new(SampleWindow {
                samples: VecDeque::with_capacity(capacity),
                capacity,
                offset: 0.0,
            })),
            probe_task: Arc::new(StdMutex::new(None)),
            local,
        }
    }

    pub fn local_now(&self) -> f64 {
        self.local.now_millis() as f64
    }

    /// Probes immediately, then every `interval`. `send_probe` receives the
    /// local send time and must not block. Restarting replaces the old timer.
    pub fn start<F>(&self, interval: Duration, send_probe: F)
    where
        F: Fn(f64) + Send + 'static,
    {
        let local = self.local.clone();
        let task = ScheduledTask::every(interval, true, move || {
            send_probe(local.now_millis() as f64);
            async {}
        });
        let mut slot = self.probe_task.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(old) = slot.replace(task) {
            old.cancel();
        }
    }

    /// Stops probing. Safe to call when never started or already stopped.
    pub fn stop(&self) {
        let task = self.probe_task.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(task) = task {
            task.cancel();
            debug!("Clock sync probing stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.probe_task
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .is_some_and(|t| !t.is_finished())
    }

    /// Handles a pong received now.
    pub fn process_pong(&self, client_time: f64, server_time: i64) -> f64 {
        self.process_pong_at(client_time, server_time as f64, self.local_now())
    }

    /// Folds one round trip into the window and returns its sample.
    pub fn process_pong_at(&self, client_send: f64, server_time: f64, client_receive: f64) -> f64 {
        let rtt = (client_receive - client_send).max(0.0);
        let sample = server_time + rtt / 2.0 - client_receive;
        self.push_sample(sample);
        trace!("Clock sample {:.1} ms (rtt {:.1} ms)", sample, rtt);
        sample
    }

    fn push_sample(&self, sample: f64) {
        let mut window = self.window.write().unwrap_or_else(|e| e.into_inner());
        if window.samples.len() == window.capacity {
            window.samples.pop_front();
        }
        window.samples.push_back(sample);
        let ordered: Vec<f64> = window.samples.iter().copied().collect();
        window.offset = median(&ordered);
    }

    /// Current offset estimate (ms). Zero until the first pong.
    pub fn offset(&self) -> f64 {
        self.window.read().unwrap_or_else(|e| e.into_inner()).offset
    }

    pub fn sample_count(&self) -> usize {
        self.window.read().unwrap_or_else(|e| e.into_inner()).samples.len()
    }

    /// Local time translated to the server's clock (ms).
    pub fn server_now(&self) -> f64 {
        self.local_now() + self.offset()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::ManualClock;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn clock_sync() -> ClockSync {
        ClockSync::new(Arc::new(ManualClock::new(0)))
    }

    #[test]
    fn test_median() {
        assert_eq!(median(&[]), 0.0);
        assert_eq!(median(&[7.0]), 7.0);
        assert_eq!(median(&[10.0, 20.0, 30.0, 40.0, 1000.0]), 30.0);
        assert_eq!(median(&[40.0, 10.0, 30.0, 20.0]), 25.0);
    }

    #[test]
    fn test_median_resists_outliers() {
        let sync = clock_sync();
        for sample in [10.0, 20.0, 30.0, 40.0, 1000.0] {
            sync.push_sample(sample);
        }
        assert_eq!(sync.offset(), 30.0);
    }

    #[test]
    fn test_sample_formula() {
        let sync = clock_sync();
        // Sent at 1000, server stamped 6050, received at 1100: rtt 100, one-way 50
        let sample = sync.process_pong_at(1_000.0, 6_050.0, 1_100.0);
        assert_eq!(sample, 5_000.0);
        assert_eq!(sync.offset(), 5_000.0);
    }

    #[test]
    fn test_window_drops_oldest() {
        let sync = clock_sync();
        for sample in [1_000.0, 1_000.0, 1_000.0, 1.0, 2.0, 3.0, 4.0, 5.0] {
            sync.push_sample(sample);
        }
        assert_eq!(sync.sample_count(), DEFAULT_MAX_SAMPLES);
        assert_eq!(sync.offset(), 3.0);
    }

    #[test]
    fn test_server_now_applies_offset() {
        let local = ManualClock::new(10_000);
        let sync = ClockSync::new(Arc::new(local.clone()));
        sync.process_pong_at(9_900.0, 12_000.0, 10_000.0);
        assert_eq!(sync.offset(), 2_050.0);
        local.advance(500);
        assert_eq!(sync.server_now(), 12_550.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_probing_starts_immediately_and_repeats() {
        let sync = clock_sync();
        let probes = Arc::new(AtomicUsize::new(0));
        let counter = probes.clone();
        sync.start(DEFAULT_PROBE_INTERVAL, move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 1);
        tokio::time::sleep(Duration::from_millis(4_000)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert!(sync.is_running());

        sync.stop();
        sync.stop();
        tokio::time::sleep(Duration::from_millis(10_000)).await;
        assert_eq!(probes.load(Ordering::SeqCst), 3);
        assert!(!sync.is_running());
    }

    #[test]
    fn test_stop_before_start() {
        clock_sync().stop();
    }
}
