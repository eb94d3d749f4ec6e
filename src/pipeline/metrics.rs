// src/pipeline/metrics.rs
//
// Engine observability. Counts per subsystem, exported as a summary at
// shutdown or on demand.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

#[derive(Debug)]
pub struct EngineMetrics {
    pub track_points: AtomicU64,
    pub out_of_order_dropped: AtomicU64,
    pub candidates: AtomicU64,
    pub events_opened: AtomicU64,
    pub events_extended: AtomicU64,
    pub events_closed: AtomicU64,
    pub severity_upgrades: AtomicU64,
    pub alerts_enqueued: AtomicU64,
    pub alerts_delivered: AtomicU64,
    pub alerts_failed: AtomicU64,
    pub alerts_shed: AtomicU64,
    pub store_writes: AtomicU64,
    pub store_retries: AtomicU64,
    pub store_dropped: AtomicU64,
    pub started_at: Instant,
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            track_points: AtomicU64::new(0),
            out_of_order_dropped: AtomicU64::new(0),
            candidates: AtomicU64::new(0),
            events_opened: AtomicU64::new(0),
            events_extended: AtomicU64::new(0),
            events_closed: AtomicU64::new(0),
            severity_upgrades: AtomicU64::new(0),
            alerts_enqueued: AtomicU64::new(0),
            alerts_delivered: AtomicU64::new(0),
            alerts_failed: AtomicU64::new(0),
            alerts_shed: AtomicU64::new(0),
            store_writes: AtomicU64::new(0),
            store_retries: AtomicU64::new(0),
            store_dropped: AtomicU64::new(0),
            started_at: Instant::now(),
        }
    }

    pub fn inc(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn points_per_sec(&self) -> f64 {
        let points = self.track_points.load(Ordering::Relaxed);
        let elapsed = self.started_at.elapsed().as_secs_f64();
        if elapsed > 0.01 {
            points as f64 / elapsed
        } else {
            0.0
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        MetricsSummary {
            track_points: self.track_points.load(Ordering::Relaxed),
            points_per_sec: self.points_per_sec(),
            out_of_order_dropped: self.out_of_order_dropped.load(Ordering::Relaxed),
            candidates: self.candidates.load(Ordering::Relaxed),
            events_opened: self.events_opened.load(Ordering::Relaxed),
            events_extended: self.events_extended.load(Ordering::Relaxed),
            events_closed: self.events_closed.load(Ordering::Relaxed),
            severity_upgrades: self.severity_upgrades.load(Ordering::Relaxed),
            alerts_enqueued: self.alerts_enqueued.load(Ordering::Relaxed),
            alerts_delivered: self.alerts_delivered.load(Ordering::Relaxed),
            alerts_failed: self.alerts_failed.load(Ordering::Relaxed),
            alerts_shed: self.alerts_shed.load(Ordering::Relaxed),
            store_writes: self.store_writes.load(Ordering::Relaxed),
            store_retries: self.store_retries.load(Ordering::Relaxed),
            store_dropped: self.store_dropped.load(Ordering::Relaxed),
            elapsed_secs: self.started_at.elapsed().as_secs_f64(),
        }
    }
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct MetricsSummary {
    pub track_points: u64,
    pub points_per_sec: f64,
    pub out_of_order_dropped: u64,
    pub candidates: u64,
    pub events_opened: u64,
    pub events_extended: u64,
    pub events_closed: u64,
    pub severity_upgrades: u64,
    pub alerts_enqueued: u64,
    pub alerts_delivered: u64,
    pub alerts_failed: u64,
    pub alerts_shed: u64,
    pub store_writes: u64,
    pub store_retries: u64,
    pub store_dropped: u64,
    pub elapsed_secs: f64,
}
