#![forbid(unsafe_code)]

// Server metrics: atomic counters plus a fixed-bucket latency histogram,
// rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Upper bounds in microseconds, paired with their `le` label.
const BUCKETS: [(u64, &str); 8] = [
    (100, "0.0001"),
    (500, "0.0005"),
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (1_000_000, "1"),
];

struct LatencyHistogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl LatencyHistogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    fn observe(&self, duration: Duration) {
        let us = duration.as_micros() as u64;
        self.count.fetch_add(1, Relaxed);
        self.sum_us.fetch_add(us, Relaxed);
        for (slot, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                slot.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (slot, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", slot.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Counter {
    ConnectionsTotal,
    MessagesReceived,
    MessagesSent,
    Errors,
    RateLimited,
    RoomsCreated,
    RoomsDeleted,
    Joins,
    Leaves,
    PlaybackCommands,
    HostTransfers,
}

impl Counter {
    const ALL: [Counter; 11] = [
        Counter::ConnectionsTotal,
        Counter::MessagesReceived,
        Counter::MessagesSent,
        Counter::Errors,
        Counter::RateLimited,
        Counter::RoomsCreated,
        Counter::RoomsDeleted,
        Counter::Joins,
        Counter::Leaves,
        Counter::PlaybackCommands,
        Counter::HostTransfers,
    ];

    fn name_and_help(self) -> (&'static str, &'static str) {
        match self {
            Counter::ConnectionsTotal => ("syncwatch_connections_total", "Total WebSocket connections"),
            Counter::MessagesReceived => ("syncwatch_messages_received_total", "Commands received from clients"),
            Counter::MessagesSent => ("syncwatch_messages_sent_total", "Messages queued to clients"),
            Counter::Errors => ("syncwatch_errors_total", "Commands rejected with an error reply"),
            Counter::RateLimited => ("syncwatch_rate_limited_total", "Commands dropped by the rate limiter"),
            Counter::RoomsCreated => ("syncwatch_rooms_created_total", "Rooms created"),
            Counter::RoomsDeleted => ("syncwatch_rooms_deleted_total", "Rooms deleted"),
            Counter::Joins => ("syncwatch_joins_total", "Participants added to rooms"),
            Counter::Leaves => ("syncwatch_leaves_total", "Participants removed from rooms"),
            Counter::PlaybackCommands => ("syncwatch_playback_commands_total", "Accepted host playback commands"),
            Counter::HostTransfers => ("syncwatch_host_transfers_total", "Host changes, explicit or on disconnect"),
        }
    }
}

/// Shared, cheaply cloneable metrics handle.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

struct Inner {
    counters: [AtomicU64; Counter::ALL.len()],
    connections_active: AtomicU64,
    command_handling: LatencyHistogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: std::array::from_fn(|_| AtomicU64::new(0)),
                connections_active: AtomicU64::new(0),
                command_handling: LatencyHistogram::new(),
            }),
        }
    }

    pub fn inc(&self, counter: Counter) {
        self.inner.counters[counter as usize].fetch_add(1, Relaxed);
    }

    pub fn add(&self, counter: Counter, n: u64) {
        self.inner.counters[counter as usize].fetch_add(n, Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.inner.counters[counter as usize].load(Relaxed)
    }

    /// Counts a connection as active until the guard drops.
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn connections_active(&self) -> u64 {
        self.inner.connections_active.load(Relaxed)
    }

    pub fn observe_command_handling(&self, duration: Duration) {
        self.inner.command_handling.observe(duration);
    }

    /// Room and participant gauges come from the registry at scrape time.
    pub fn render_prometheus(&self, rooms_active: usize, participants_active: usize) -> String {
        let mut out = String::with_capacity(4096);

        for counter in Counter::ALL {
            let (name, help) = counter.name_and_help();
            render_single(&mut out, name, help, "counter", self.get(counter));
        }

        render_single(&mut out, "syncwatch_connections_active", "Open WebSocket connections", "gauge", self.connections_active());
        render_single(&mut out, "syncwatch_rooms_active", "Rooms in memory", "gauge", rooms_active as u64);
        render_single(&mut out, "syncwatch_participants_active", "Participants across all rooms", "gauge", participants_active as u64);

        self.inner.command_handling.render(
            "syncwatch_command_handling_seconds",
            "Time from command receipt to reply/broadcast",
            &mut out,
        );

        out
    }
}

pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_single(out: &mut String, name: &str, help: &str, kind: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} {kind}");
    let _ = writeln!(out, "{name} {value}");
}
