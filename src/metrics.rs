//! Prometheus metrics for monitoring heimdall.
//!
//! Covers the local availability cache, the upstream tiers and their
//! breaker, the write-back tracker and torrent metadata federation.

use prometheus::{
    Counter, CounterVec, Gauge, HistogramOpts, HistogramVec, Opts, Registry,
};
use std::sync::Arc;
use tracing::error;

/// All metrics for the heimdall service
pub struct Metrics {
    pub registry: Registry,

    // Local cache metrics
    pub local_lookups_total: CounterVec,
    pub local_records_total: Gauge,
    pub backfill_records_total: CounterVec,

    // Upstream tier metrics
    pub upstream_requests_total: CounterVec,
    pub upstream_request_duration_seconds: HistogramVec,
    pub breaker_trips_total: Counter,
    pub breaker_open: Gauge,

    // Write-back metrics
    pub track_total: CounterVec,

    // Torrent federation metrics
    pub torrent_sync_total: CounterVec,
    pub loop_detections_total: Counter,
    pub pull_local_only: Gauge,

    // Background work
    pub background_tasks_in_flight: Gauge,

    // System metrics
    pub uptime_seconds: Gauge,
    pub boot_type: CounterVec,
}

impl Metrics {
    /// Create a new metrics registry with all metrics
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        // Local cache metrics
        let local_lookups_total = CounterVec::new(
            Opts::new(
                "heimdall_local_lookups_total",
                "Hashes looked up in the local availability cache by result",
            ),
            &["result"],
        )?;
        registry.register(Box::new(local_lookups_total.clone()))?;

        let local_records_total = Gauge::with_opts(Opts::new(
            "heimdall_local_records_total",
            "Availability records held in memory",
        ))?;
        registry.register(Box::new(local_records_total.clone()))?;

        let backfill_records_total = CounterVec::new(
            Opts::new(
                "heimdall_backfill_records_total",
                "Availability records written back from an upstream tier",
            ),
            &["tier"],
        )?;
        registry.register(Box::new(backfill_records_total.clone()))?;

        // Upstream tier metrics
        let upstream_requests_total = CounterVec::new(
            Opts::new(
                "heimdall_upstream_requests_total",
                "Upstream tier calls by outcome",
            ),
            &["tier", "action", "status"],
        )?;
        registry.register(Box::new(upstream_requests_total.clone()))?;

        let upstream_request_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "heimdall_upstream_request_duration_seconds",
                "Upstream tier call duration",
            )
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
            &["tier", "action"],
        )?;
        registry.register(Box::new(upstream_request_duration_seconds.clone()))?;

        let breaker_trips_total = Counter::with_opts(Opts::new(
            "heimdall_breaker_trips_total",
            "Times a slow peer opened the circuit breaker",
        ))?;
        registry.register(Box::new(breaker_trips_total.clone()))?;

        let breaker_open = Gauge::with_opts(Opts::new(
            "heimdall_breaker_open",
            "Whether the peer circuit breaker is open (1) or closed (0)",
        ))?;
        registry.register(Box::new(breaker_open.clone()))?;

        // Write-back metrics
        let track_total = CounterVec::new(
            Opts::new(
                "heimdall_track_total",
                "Tracked observations by target and outcome",
            ),
            &["target", "status"],
        )?;
        registry.register(Box::new(track_total.clone()))?;

        // Torrent federation metrics
        let torrent_sync_total = CounterVec::new(
            Opts::new(
                "heimdall_torrent_sync_total",
                "Torrent metadata pulls and pushes by outcome",
            ),
            &["direction", "status"],
        )?;
        registry.register(Box::new(torrent_sync_total.clone()))?;

        let loop_detections_total = Counter::with_opts(Opts::new(
            "heimdall_loop_detections_total",
            "Self-referential pull loops detected",
        ))?;
        registry.register(Box::new(loop_detections_total.clone()))?;

        let pull_local_only = Gauge::with_opts(Opts::new(
            "heimdall_pull_local_only",
            "Whether torrent pulls are restricted to the peer's local data",
        ))?;
        registry.register(Box::new(pull_local_only.clone()))?;

        let background_tasks_in_flight = Gauge::with_opts(Opts::new(
            "heimdall_background_tasks_in_flight",
            "Detached background tasks currently running",
        ))?;
        registry.register(Box::new(background_tasks_in_flight.clone()))?;

        // System metrics
        let uptime_seconds = Gauge::with_opts(Opts::new(
            "heimdall_uptime_seconds",
            "Service uptime",
        ))?;
        registry.register(Box::new(uptime_seconds.clone()))?;

        let boot_type = CounterVec::new(
            Opts::new("heimdall_boot_type", "How the availability cache was initialized"),
            &["type"],
        )?;
        registry.register(Box::new(boot_type.clone()))?;

        Ok(Self {
            registry,
            local_lookups_total,
            local_records_total,
            backfill_records_total,
            upstream_requests_total,
            upstream_request_duration_seconds,
            breaker_trips_total,
            breaker_open,
            track_total,
            torrent_sync_total,
            loop_detections_total,
            pull_local_only,
            background_tasks_in_flight,
            uptime_seconds,
            boot_type,
        })
    }

    /// Record how many hashes were fresh, stale or absent locally
    pub fn record_local_lookup(&self, fresh: usize, stale: usize, absent: usize) {
        for (result, count) in [("fresh", fresh), ("stale", stale), ("absent", absent)] {
            if count > 0 {
                self.local_lookups_total
                    .with_label_values(&[result])
                    .inc_by(count as f64);
            }
        }
    }

    /// Record an upstream tier call
    pub fn record_upstream_request(&self, tier: &str, action: &str, status: &str, duration_secs: f64) {
        self.upstream_requests_total
            .with_label_values(&[tier, action, status])
            .inc();
        self.upstream_request_duration_seconds
            .with_label_values(&[tier, action])
            .observe(duration_secs);
    }

    /// Record a call the breaker did not let through
    pub fn record_upstream_skipped(&self, tier: &str, action: &str) {
        self.upstream_requests_total
            .with_label_values(&[tier, action, "skipped"])
            .inc();
    }

    pub fn record_breaker_trip(&self) {
        self.breaker_trips_total.inc();
    }

    pub fn record_backfill(&self, tier: &str, records: usize) {
        self.backfill_records_total
            .with_label_values(&[tier])
            .inc_by(records as f64);
    }

    pub fn record_track(&self, target: &str, status: &str) {
        self.track_total.with_label_values(&[target, status]).inc();
    }

    pub fn record_torrent_sync(&self, direction: &str, status: &str) {
        self.torrent_sync_total
            .with_label_values(&[direction, status])
            .inc();
    }

    pub fn record_loop_detection(&self) {
        self.loop_detections_total.inc();
        self.pull_local_only.set(1.0);
    }

    /// Render metrics in Prometheus text format
    pub fn render(&self) -> String {
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();

        match encoder.encode_to_string(&metric_families) {
            Ok(s) => s,
            Err(e) => {
                error!(error = %e, "Failed to encode metrics");
                String::new()
            }
        }
    }
}

/// Shared metrics instance
pub type SharedMetrics = Arc<Metrics>;

/// Create a shared metrics instance
pub fn create_metrics() -> SharedMetrics {
    Arc::new(Metrics::new().expect("Failed to create metrics"))
}
