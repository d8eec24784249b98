use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

/// Global metrics registry (singleton).
static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Get or initialize the global metrics instance.
pub fn global() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Application-wide metrics counters.
pub struct Metrics {
    // ── Control socket ──────────────────────────────────────────────
    pub connections_accepted: AtomicU64,
    pub requests_total: AtomicU64,
    pub requests_failed: AtomicU64,
    pub requests_rate_limited: AtomicU64,

    // ── Instance lifecycle ──────────────────────────────────────────
    pub instances_created: AtomicU64,
    pub instances_started: AtomicU64,
    pub instances_stopped: AtomicU64,
    pub instances_reset: AtomicU64,
    pub instances_extended: AtomicU64,
    pub instances_destroyed: AtomicU64,
    pub instances_expired: AtomicU64,

    // ── VPN ──────────────────────────────────────────────────────────
    pub vpn_peers_created: AtomicU64,
    pub vpn_peers_removed: AtomicU64,

    // ── Uploads ──────────────────────────────────────────────────────
    pub upload_sessions_started: AtomicU64,
    pub upload_chunks_received: AtomicU64,
    pub upload_sessions_completed: AtomicU64,
    pub upload_sessions_reaped: AtomicU64,

    // ── Supervisor ───────────────────────────────────────────────────
    pub supervisor_sweeps_total: AtomicU64,
    pub supervisor_sweep_errors: AtomicU64,
    pub nodes_marked_offline: AtomicU64,
}

impl Metrics {
    fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            requests_total: AtomicU64::new(0),
            requests_failed: AtomicU64::new(0),
            requests_rate_limited: AtomicU64::new(0),
            instances_created: AtomicU64::new(0),
            instances_started: AtomicU64::new(0),
            instances_stopped: AtomicU64::new(0),
            instances_reset: AtomicU64::new(0),
            instances_extended: AtomicU64::new(0),
            instances_destroyed: AtomicU64::new(0),
            instances_expired: AtomicU64::new(0),
            vpn_peers_created: AtomicU64::new(0),
            vpn_peers_removed: AtomicU64::new(0),
            upload_sessions_started: AtomicU64::new(0),
            upload_chunks_received: AtomicU64::new(0),
            upload_sessions_completed: AtomicU64::new(0),
            upload_sessions_reaped: AtomicU64::new(0),
            supervisor_sweeps_total: AtomicU64::new(0),
            supervisor_sweep_errors: AtomicU64::new(0),
            nodes_marked_offline: AtomicU64::new(0),
        }
    }

    /// Collect a snapshot of all metrics for serialization.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            requests_total: self.requests_total.load(Ordering::Relaxed),
            requests_failed: self.requests_failed.load(Ordering::Relaxed),
            requests_rate_limited: self.requests_rate_limited.load(Ordering::Relaxed),
            instances_created: self.instances_created.load(Ordering::Relaxed),
            instances_started: self.instances_started.load(Ordering::Relaxed),
            instances_stopped: self.instances_stopped.load(Ordering::Relaxed),
            instances_reset: self.instances_reset.load(Ordering::Relaxed),
            instances_extended: self.instances_extended.load(Ordering::Relaxed),
            instances_destroyed: self.instances_destroyed.load(Ordering::Relaxed),
            instances_expired: self.instances_expired.load(Ordering::Relaxed),
            vpn_peers_created: self.vpn_peers_created.load(Ordering::Relaxed),
            vpn_peers_removed: self.vpn_peers_removed.load(Ordering::Relaxed),
            upload_sessions_started: self.upload_sessions_started.load(Ordering::Relaxed),
            upload_chunks_received: self.upload_chunks_received.load(Ordering::Relaxed),
            upload_sessions_completed: self.upload_sessions_completed.load(Ordering::Relaxed),
            upload_sessions_reaped: self.upload_sessions_reaped.load(Ordering::Relaxed),
            supervisor_sweeps_total: self.supervisor_sweeps_total.load(Ordering::Relaxed),
            supervisor_sweep_errors: self.supervisor_sweep_errors.load(Ordering::Relaxed),
            nodes_marked_offline: self.nodes_marked_offline.load(Ordering::Relaxed),
        }
    }

    /// Format metrics in Prometheus exposition format.
    pub fn prometheus_exposition(&self) -> String {
        let s = self.snapshot();
        let mut out = String::with_capacity(2048);

        write_metric(
            &mut out,
            "anvild_connections_accepted_total",
            s.connections_accepted,
            "Control socket connections accepted",
        );
        write_metric(
            &mut out,
            "anvild_requests_total",
            s.requests_total,
            "Total control socket requests received",
        );
        write_metric(
            &mut out,
            "anvild_requests_failed_total",
            s.requests_failed,
            "Requests that returned an error response",
        );
        write_metric(
            &mut out,
            "anvild_requests_rate_limited_total",
            s.requests_rate_limited,
            "Requests rejected by a rate limiter",
        );
        write_metric(
            &mut out,
            "anvild_instances_created_total",
            s.instances_created,
            "Instances created",
        );
        write_metric(
            &mut out,
            "anvild_instances_started_total",
            s.instances_started,
            "Instances started",
        );
        write_metric(
            &mut out,
            "anvild_instances_stopped_total",
            s.instances_stopped,
            "Instances stopped",
        );
        write_metric(
            &mut out,
            "anvild_instances_reset_total",
            s.instances_reset,
            "Instances reset",
        );
        write_metric(
            &mut out,
            "anvild_instances_extended_total",
            s.instances_extended,
            "Instance expiry extensions granted",
        );
        write_metric(
            &mut out,
            "anvild_instances_destroyed_total",
            s.instances_destroyed,
            "Instances destroyed",
        );
        write_metric(
            &mut out,
            "anvild_instances_expired_total",
            s.instances_expired,
            "Instances reaped by the expiry sweep",
        );
        write_metric(
            &mut out,
            "anvild_vpn_peers_created_total",
            s.vpn_peers_created,
            "WireGuard peers provisioned",
        );
        write_metric(
            &mut out,
            "anvild_vpn_peers_removed_total",
            s.vpn_peers_removed,
            "WireGuard peers removed",
        );
        write_metric(
            &mut out,
            "anvild_upload_sessions_started_total",
            s.upload_sessions_started,
            "Upload sessions initialized",
        );
        write_metric(
            &mut out,
            "anvild_upload_chunks_received_total",
            s.upload_chunks_received,
            "Upload chunks received",
        );
        write_metric(
            &mut out,
            "anvild_upload_sessions_completed_total",
            s.upload_sessions_completed,
            "Upload sessions finalized",
        );
        write_metric(
            &mut out,
            "anvild_upload_sessions_reaped_total",
            s.upload_sessions_reaped,
            "Stale upload sessions reaped by the janitor",
        );
        write_metric(
            &mut out,
            "anvild_supervisor_sweeps_total",
            s.supervisor_sweeps_total,
            "Supervisor reconciler loop ticks",
        );
        write_metric(
            &mut out,
            "anvild_supervisor_sweep_errors_total",
            s.supervisor_sweep_errors,
            "Supervisor reconciler loop ticks that logged an error",
        );
        write_metric(
            &mut out,
            "anvild_nodes_marked_offline_total",
            s.nodes_marked_offline,
            "Nodes marked offline by the heartbeat sweep",
        );

        out
    }
}

fn write_metric(out: &mut String, name: &str, value: u64, help: &str) {
    use std::fmt::Write;
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
}

/// Serializable snapshot of all metrics.
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub requests_total: u64,
    pub requests_failed: u64,
    pub requests_rate_limited: u64,
    pub instances_created: u64,
    pub instances_started: u64,
    pub instances_stopped: u64,
    pub instances_reset: u64,
    pub instances_extended: u64,
    pub instances_destroyed: u64,
    pub instances_expired: u64,
    pub vpn_peers_created: u64,
    pub vpn_peers_removed: u64,
    pub upload_sessions_started: u64,
    pub upload_chunks_received: u64,
    pub upload_sessions_completed: u64,
    pub upload_sessions_reaped: u64,
    pub supervisor_sweeps_total: u64,
    pub supervisor_sweep_errors: u64,
    pub nodes_marked_offline: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_increment() {
        let m = Metrics::new();
        m.requests_total.fetch_add(1, Ordering::Relaxed);
        m.requests_total.fetch_add(1, Ordering::Relaxed);
        assert_eq!(m.requests_total.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_metrics_snapshot() {
        let m = Metrics::new();
        m.instances_created.fetch_add(5, Ordering::Relaxed);
        m.supervisor_sweeps_total.fetch_add(3, Ordering::Relaxed);

        let snap = m.snapshot();
        assert_eq!(snap.instances_created, 5);
        assert_eq!(snap.supervisor_sweeps_total, 3);
        assert_eq!(snap.requests_total, 0);
    }

    #[test]
    fn test_metrics_snapshot_roundtrip() {
        let m = Metrics::new();
        m.requests_total.fetch_add(10, Ordering::Relaxed);

        let snap = m.snapshot();
        let json = serde_json::to_string(&snap).unwrap();
        assert!(json.contains("\"requests_total\":10"));
    }

    #[test]
    fn test_prometheus_exposition_format() {
        let m = Metrics::new();
        m.requests_total.fetch_add(42, Ordering::Relaxed);
        m.connections_accepted.fetch_add(7, Ordering::Relaxed);

        let prom = m.prometheus_exposition();
        assert!(prom.contains("# HELP anvild_requests_total"));
        assert!(prom.contains("# TYPE anvild_requests_total counter"));
        assert!(prom.contains("anvild_requests_total 42"));
        assert!(prom.contains("anvild_connections_accepted_total 7"));
    }
}
