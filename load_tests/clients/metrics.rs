use std::sync::atomic::{AtomicU64, AtomicBool, Ordering};
use std::time::Instant;
use std::collections::HashMap;
use serde::{Deserialize, Serialize};
use syncwatch::client::{Correction, CorrectionAction};

/// Metrics collected during one simulated participant session
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientMetrics {
    pub client_id: String,
    pub room_id: String,
    pub is_host: bool,
    pub connection_successful: bool,
    pub connection_time_ms: u64,
    pub messages_received: u64,
    pub sync_checks: u64,
    pub nudges: u64,
    pub hard_seeks: u64,
    pub drift: DriftStats,
    pub clock_offset_ms: f64,
    pub errors: Vec<String>,
    pub session_duration_ms: u64,
    pub signaling_latencies: SignalingLatencyReport,
}

/// Signaling latency report per operation
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SignalingLatencyReport {
    pub operations: HashMap<String, LatencyStats>,
}

/// Latency statistics for a single operation type
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LatencyStats {
    pub count: usize,
    pub min_ms: u64,
    pub max_ms: u64,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub p99_ms: u64,
}

/// Absolute drift, measured by each sync check
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriftStats {
    pub samples: usize,
    pub avg_ms: u64,
    pub p50_ms: u64,
    pub p95_ms: u64,
    pub max_ms: u64,
    /// Share of checks that needed no correction
    pub in_sync_ratio: f64,
}

/// Real-time metrics collector (thread-safe)
pub struct MetricsCollector {
    client_id: String,
    room_id: std::sync::Mutex<String>,
    is_host: AtomicBool,
    start_time: Instant,
    connection_successful: AtomicBool,
    connection_time_ms: AtomicU64,
    messages_received: AtomicU64,
    in_sync_checks: AtomicU64,
    nudges: AtomicU64,
    hard_seeks: AtomicU64,
    // f64 bits
    clock_offset: AtomicU64,
    drift_samples: std::sync::Mutex<Vec<u64>>,
    errors: std::sync::Mutex<Vec<String>>,
    signaling_latencies: std::sync::Mutex<HashMap<String, Vec<u64>>>,
}

impl MetricsCollector {
    pub fn new(client_id: String) -> Self {
        Self {
            client_id,
            room_id: std::sync::Mutex::new(String::new()),
            is_host: AtomicBool::new(false),
            start_time: Instant::now(),
            connection_successful: AtomicBool::new(false),
            connection_time_ms: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            in_sync_checks: AtomicU64::new(0),
            nudges: AtomicU64::new(0),
            hard_seeks: AtomicU64::new(0),
            clock_offset: AtomicU64::new(0f64.to_bits()),
            drift_samples: std::sync::Mutex::new(Vec::new()),
            errors: std::sync::Mutex::new(Vec::new()),
            signaling_latencies: std::sync::Mutex::new(HashMap::new()),
        }
    }

    pub fn set_room_id(&self, room_id: &str) {
        if let Ok(mut r) = self.room_id.lock() {
            *r = room_id.to_string();
        }
    }

    pub fn mark_host(&self) {
        self.is_host.store(true, Ordering::SeqCst);
    }

    pub fn mark_connection_successful(&self) {
        self.connection_successful.store(true, Ordering::SeqCst);
        let elapsed = self.start_time.elapsed().as_millis() as u64;
        self.connection_time_ms.store(elapsed, Ordering::SeqCst);
    }

    pub fn record_message(&self) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_correction(&self, correction: &Correction) {
        if let Ok(mut samples) = self.drift_samples.lock() {
            samples.push(correction.drift_ms.abs().round() as u64);
        }
        let counter = match correction.action {
            CorrectionAction::None => &self.in_sync_checks,
            CorrectionAction::SpeedUp { .. } | CorrectionAction::SlowDown { .. } => &self.nudges,
            CorrectionAction::HardSeek { .. } => &self.hard_seeks,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_clock_offset(&self, offset_ms: f64) {
        self.clock_offset.store(offset_ms.to_bits(), Ordering::Relaxed);
    }

    pub fn record_error(&self, error: String) {
        if let Ok(mut errors) = self.errors.lock() {
            errors.push(error);
        }
    }

    /// Record a signaling round-trip latency for a named operation
    pub fn record_signaling_latency(&self, operation: &str, ms: u64) {
        if let Ok(mut latencies) = self.signaling_latencies.lock() {
            latencies.entry(operation.to_string()).or_default().push(ms);
        }
    }

    /// Generate final metrics report (sync, safe to call from an OS thread)
    pub fn generate_report(&self) -> ClientMetrics {
        let errors = self.errors.lock().map(|e| e.clone()).unwrap_or_default();
        let room_id = self.room_id.lock().map(|r| r.clone()).unwrap_or_default();
        let in_sync = self.in_sync_checks.load(Ordering::Relaxed);
        let nudges = self.nudges.load(Ordering::Relaxed);
        let hard_seeks = self.hard_seeks.load(Ordering::Relaxed);

        ClientMetrics {
            client_id: self.client_id.clone(),
            room_id,
            is_host: self.is_host.load(Ordering::SeqCst),
            connection_successful: self.connection_successful.load(Ordering::SeqCst),
            connection_time_ms: self.connection_time_ms.load(Ordering::SeqCst),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            sync_checks: in_sync + nudges + hard_seeks,
            nudges,
            hard_seeks,
            drift: self.compute_drift(in_sync),
            clock_offset_ms: f64::from_bits(self.clock_offset.load(Ordering::Relaxed)),
            errors,
            session_duration_ms: self.start_time.elapsed().as_millis() as u64,
            signaling_latencies: self.compute_latency_report(),
        }
    }

    fn compute_drift(&self, in_sync: u64) -> DriftStats {
        let mut samples = self.drift_samples.lock().map(|s| s.clone()).unwrap_or_default();
        drift_stats(&mut samples, in_sync)
    }

    fn compute_latency_report(&self) -> SignalingLatencyReport {
        let latencies = self.signaling_latencies.lock()
            .map(|l| l.clone())
            .unwrap_or_default();

        let mut operations = HashMap::new();
        for (op, mut samples) in latencies {
            if let Some(stats) = latency_stats(&mut samples) {
                operations.insert(op, stats);
            }
        }
        SignalingLatencyReport { operations }
    }
}

fn drift_stats(samples: &mut [u64], in_sync: u64) -> DriftStats {
    if samples.is_empty() {
        return DriftStats::default();
    }
    samples.sort_unstable();
    let count = samples.len();
    DriftStats {
        samples: count,
        avg_ms: samples.iter().sum::<u64>() / count as u64,
        p50_ms: percentile(samples, 0.50),
        p95_ms: percentile(samples, 0.95),
        max_ms: samples[count - 1],
        in_sync_ratio: in_sync as f64 / count as f64,
    }
}

fn latency_stats(samples: &mut [u64]) -> Option<LatencyStats> {
    if samples.is_empty() {
        return None;
    }
    samples.sort_unstable();
    let count = samples.len();
    Some(LatencyStats {
        count,
        min_ms: samples[0],
        max_ms: samples[count - 1],
        avg_ms: samples.iter().sum::<u64>() / count as u64,
        p50_ms: percentile(samples, 0.50),
        p95_ms: percentile(samples, 0.95),
        p99_ms: percentile(samples, 0.99),
    })
}

/// Per-room summary statistics
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoomSummary {
    pub room_id: String,
    pub total_clients: usize,
    pub successful_connections: usize,
    pub nudges: u64,
    pub hard_seeks: u64,
    pub worst_p95_drift_ms: u64,
    pub total_errors: usize,
}

/// Aggregated signaling latency across all clients
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedLatencies {
    pub operations: HashMap<String, LatencyStats>,
}

/// Aggregates metrics from multiple clients
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TestSummary {
    pub total_clients: usize,
    pub successful_connections: usize,
    pub failed_connections: usize,
    pub average_connection_time_ms: u64,
    pub p50_connection_time_ms: u64,
    pub p95_connection_time_ms: u64,
    pub p99_connection_time_ms: u64,
    pub total_messages_received: u64,
    pub total_sync_checks: u64,
    pub total_nudges: u64,
    pub total_hard_seeks: u64,
    /// Per-guest p50 drift, aggregated
    pub drift: DriftStats,
    pub average_session_duration_ms: u64,
    pub total_errors: usize,
    pub signaling_latencies: AggregatedLatencies,
    pub rooms: Vec<RoomSummary>,
}

impl TestSummary {
    pub fn from_metrics(metrics: &[ClientMetrics]) -> Self {
        if metrics.is_empty() {
            return Self::default();
        }

        let total_clients = metrics.len();
        let successful_connections = metrics.iter().filter(|m| m.connection_successful).count();
        let failed_connections = total_clients - successful_connections;

        let mut connection_times: Vec<u64> = metrics
            .iter()
            .filter(|m| m.connection_successful)
            .map(|m| m.connection_time_ms)
            .collect();
        connection_times.sort_unstable();

        let avg_connection_time = if !connection_times.is_empty() {
            connection_times.iter().sum::<u64>() / connection_times.len() as u64
        } else {
            0
        };

        // Hosts never correct, so only guests contribute drift
        let guests: Vec<&ClientMetrics> = metrics.iter().filter(|m| !m.is_host && m.drift.samples > 0).collect();
        let mut guest_drift: Vec<u64> = guests.iter().map(|m| m.drift.p50_ms).collect();
        let in_sync_guests = guests.iter().filter(|m| m.drift.in_sync_ratio >= 0.5).count() as u64;

        Self {
            total_clients,
            successful_connections,
            failed_connections,
            average_connection_time_ms: avg_connection_time,
            p50_connection_time_ms: percentile(&connection_times, 0.50),
            p95_connection_time_ms: percentile(&connection_times, 0.95),
            p99_connection_time_ms: percentile(&connection_times, 0.99),
            total_messages_received: metrics.iter().map(|m| m.messages_received).sum(),
            total_sync_checks: metrics.iter().map(|m| m.sync_checks).sum(),
            total_nudges: metrics.iter().map(|m| m.nudges).sum(),
            total_hard_seeks: metrics.iter().map(|m| m.hard_seeks).sum(),
            drift: drift_stats(&mut guest_drift, in_sync_guests),
            average_session_duration_ms: metrics.iter().map(|m| m.session_duration_ms).sum::<u64>() / total_clients as u64,
            total_errors: metrics.iter().map(|m| m.errors.len()).sum(),
            signaling_latencies: Self::aggregate_latencies(metrics),
            rooms: Self::compute_room_summaries(metrics),
        }
    }

    fn compute_room_summaries(metrics: &[ClientMetrics]) -> Vec<RoomSummary> {
        let mut room_map: HashMap<String, Vec<&ClientMetrics>> = HashMap::new();
        for m in metrics {
            room_map.entry(m.room_id.clone()).or_default().push(m);
        }

        let mut rooms: Vec<RoomSummary> = room_map.into_iter().map(|(room_id, clients)| {
            RoomSummary {
                room_id,
                total_clients: clients.len(),
                successful_connections: clients.iter().filter(|c| c.connection_successful).count(),
                nudges: clients.iter().map(|c| c.nudges).sum(),
                hard_seeks: clients.iter().map(|c| c.hard_seeks).sum(),
                worst_p95_drift_ms: clients.iter().map(|c| c.drift.p95_ms).max().unwrap_or(0),
                total_errors: clients.iter().map(|c| c.errors.len()).sum(),
            }
        }).collect();

        rooms.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        rooms
    }

    fn aggregate_latencies(metrics: &[ClientMetrics]) -> AggregatedLatencies {
        let mut all_samples: HashMap<String, Vec<u64>> = HashMap::new();
        for m in metrics {
            for (op, stats) in &m.signaling_latencies.operations {
                // Only per-client stats survive; p50 stands in for each client
                all_samples.entry(op.clone()).or_default().push(stats.p50_ms);
            }
        }

        let mut operations = HashMap::new();
        for (op, mut samples) in all_samples {
            if let Some(stats) = latency_stats(&mut samples) {
                operations.insert(op, stats);
            }
        }
        AggregatedLatencies { operations }
    }

    pub fn print_summary(&self) {
        println!("\n=== Load Test Summary ===");
        println!("Total Clients: {}", self.total_clients);
        println!("Successful Connections: {}", self.successful_connections);
        println!("Failed Connections: {}", self.failed_connections);
        println!("\nConnection Time:");
        println!("  Average: {} ms", self.average_connection_time_ms);
        println!("  P50: {} ms", self.p50_connection_time_ms);
        println!("  P95: {} ms", self.p95_connection_time_ms);
        println!("  P99: {} ms", self.p99_connection_time_ms);
        println!("\nSync Statistics:");
        println!("  Messages Received: {}", self.total_messages_received);
        println!("  Sync Checks: {}", self.total_sync_checks);
        println!("  Rate Nudges: {}", self.total_nudges);
        println!("  Hard Seeks: {}", self.total_hard_seeks);
        println!("  Guest Drift (p50 per guest): avg={}ms p50={}ms p95={}ms max={}ms (n={})",
            self.drift.avg_ms, self.drift.p50_ms, self.drift.p95_ms, self.drift.max_ms, self.drift.samples);
        println!("  Guests mostly in sync: {:.1}%", self.drift.in_sync_ratio * 100.0);

        if !self.signaling_latencies.operations.is_empty() {
            println!("\nSignaling Latencies (aggregated across clients):");
            let mut ops: Vec<_> = self.signaling_latencies.operations.iter().collect();
            ops.sort_by_key(|(k, _)| (*k).clone());
            for (op, stats) in &ops {
                println!("  {}: avg={}ms p50={}ms p95={}ms p99={}ms (n={})",
                    op, stats.avg_ms, stats.p50_ms, stats.p95_ms, stats.p99_ms, stats.count);
            }
        }

        if self.rooms.len() > 1 {
            println!("\nPer-Room Breakdown ({} rooms):", self.rooms.len());
            for room in &self.rooms {
                println!("  {}: {} clients, {} nudges, {} seeks, worst p95 drift {}ms",
                    room.room_id, room.total_clients, room.nudges, room.hard_seeks, room.worst_p95_drift_ms);
            }
        }

        println!("\nSession:");
        println!("  Average Duration: {} ms ({:.2} s)", self.average_session_duration_ms, self.average_session_duration_ms as f64 / 1000.0);
        println!("  Total Errors: {}", self.total_errors);
        println!("========================\n");
    }
}

fn percentile(sorted_data: &[u64], p: f64) -> u64 {
    if sorted_data.is_empty() {
        return 0;
    }
    let idx = (p * (sorted_data.len() - 1) as f64).round() as usize;
    sorted_data[idx.min(sorted_data.len() - 1)]
}
