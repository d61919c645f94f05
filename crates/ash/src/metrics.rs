//! Pool statistics and Prometheus text rendering.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters for resume outcomes. Shared between the session
/// manager (which records hits) and the stats surface.
#[derive(Debug, Default)]
pub struct ResumeCounters {
    warm: AtomicU64,
    cold: AtomicU64,
    cold_local: AtomicU64,
    cold_cloud: AtomicU64,
    cold_fresh: AtomicU64,
}

impl ResumeCounters {
    pub fn record_warm(&self) {
        self.warm.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_cold(&self, source: crate::workspace::RestoreSource) {
        use crate::workspace::RestoreSource;
        self.cold.fetch_add(1, Ordering::Relaxed);
        match source {
            // A live dir on disk counts as a local restore for the stats.
            RestoreSource::Live | RestoreSource::Local => {
                self.cold_local.fetch_add(1, Ordering::Relaxed)
            }
            RestoreSource::Cloud => self.cold_cloud.fetch_add(1, Ordering::Relaxed),
            RestoreSource::Fresh => self.cold_fresh.fetch_add(1, Ordering::Relaxed),
        };
    }

    pub fn snapshot(&self) -> (u64, u64, u64, u64, u64) {
        (
            self.warm.load(Ordering::Relaxed),
            self.cold.load(Ordering::Relaxed),
            self.cold_local.load(Ordering::Relaxed),
            self.cold_cloud.load(Ordering::Relaxed),
            self.cold_fresh.load(Ordering::Relaxed),
        )
    }
}

/// Pool statistics emitted on /health and /metrics.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total: i64,
    pub cold: i64,
    pub warming: i64,
    pub warm: i64,
    pub waiting: i64,
    pub running: i64,
    pub max_capacity: i64,
    pub resume_warm_hits: u64,
    pub resume_cold_hits: u64,
    pub resume_cold_local_hits: u64,
    pub resume_cold_cloud_hits: u64,
    pub resume_cold_fresh_hits: u64,
}

/// Render pool stats in the Prometheus exposition format.
pub fn render_prometheus(stats: &PoolStats) -> String {
    let mut out = String::new();

    out.push_str("# HELP ash_sandboxes Sandboxes by lifecycle state.\n");
    out.push_str("# TYPE ash_sandboxes gauge\n");
    for (state, value) in [
        ("cold", stats.cold),
        ("warming", stats.warming),
        ("warm", stats.warm),
        ("waiting", stats.waiting),
        ("running", stats.running),
    ] {
        out.push_str(&format!("ash_sandboxes{{state=\"{state}\"}} {value}\n"));
    }

    out.push_str("# HELP ash_sandboxes_total Total sandbox rows.\n");
    out.push_str("# TYPE ash_sandboxes_total gauge\n");
    out.push_str(&format!("ash_sandboxes_total {}\n", stats.total));

    out.push_str("# HELP ash_sandbox_capacity Configured sandbox capacity.\n");
    out.push_str("# TYPE ash_sandbox_capacity gauge\n");
    out.push_str(&format!("ash_sandbox_capacity {}\n", stats.max_capacity));

    out.push_str("# HELP ash_resume_hits Session resumes by path.\n");
    out.push_str("# TYPE ash_resume_hits counter\n");
    for (path, value) in [
        ("warm", stats.resume_warm_hits),
        ("cold", stats.resume_cold_hits),
        ("cold_local", stats.resume_cold_local_hits),
        ("cold_cloud", stats.resume_cold_cloud_hits),
        ("cold_fresh", stats.resume_cold_fresh_hits),
    ] {
        out.push_str(&format!("ash_resume_hits{{path=\"{path}\"}} {value}\n"));
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::workspace::RestoreSource;

    fn sample() -> PoolStats {
        PoolStats {
            total: 5,
            cold: 1,
            warming: 1,
            warm: 1,
            waiting: 1,
            running: 1,
            max_capacity: 10,
            resume_warm_hits: 3,
            resume_cold_hits: 2,
            resume_cold_local_hits: 1,
            resume_cold_cloud_hits: 1,
            resume_cold_fresh_hits: 0,
        }
    }

    #[test]
    fn test_prometheus_rendering() {
        let text = render_prometheus(&sample());
        assert!(text.contains("ash_sandboxes{state=\"running\"} 1\n"));
        assert!(text.contains("ash_sandboxes_total 5\n"));
        assert!(text.contains("ash_sandbox_capacity 10\n"));
        assert!(text.contains("ash_resume_hits{path=\"cold_cloud\"} 1\n"));
        // Exposition format requires a trailing newline on the last sample.
        assert!(text.ends_with('\n'));
    }

    #[test]
    fn test_health_json_field_names() {
        let json = serde_json::to_value(sample()).unwrap();
        assert_eq!(json["maxCapacity"], 10);
        assert_eq!(json["resumeWarmHits"], 3);
        assert_eq!(json["resumeColdFreshHits"], 0);
    }

    #[test]
    fn test_resume_counters() {
        let counters = ResumeCounters::default();
        counters.record_warm();
        counters.record_cold(RestoreSource::Local);
        counters.record_cold(RestoreSource::Cloud);
        counters.record_cold(RestoreSource::Fresh);
        assert_eq!(counters.snapshot(), (1, 3, 1, 1, 1));
    }
}
