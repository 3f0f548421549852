use crate::fleet::FleetStore;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Serialize, Deserialize)]
pub struct CoordinatorHealth {
    pub uptime_seconds: u64,
    pub connected_endpoints: usize,
    pub streams_opened: u64,
    pub streams_active: u64,
    pub reports_handled: u64,
    pub hourly_rate: i64,
    pub memory_usage_mb: f32,
}

/// Process-wide counters, cheap to clone into every stream task.
#[derive(Clone)]
pub struct HealthTracker {
    start_time: Instant,
    streams_opened: Arc<AtomicU64>,
    streams_active: Arc<AtomicU64>,
    reports_handled: Arc<AtomicU64>,
}

impl Default for HealthTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthTracker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            streams_opened: Arc::new(AtomicU64::new(0)),
            streams_active: Arc::new(AtomicU64::new(0)),
            reports_handled: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn stream_opened(&self) {
        self.streams_opened.fetch_add(1, Ordering::Relaxed);
        self.streams_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn stream_closed(&self) {
        // saturate so a double close never wraps
        let _ = self
            .streams_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
    }

    pub fn report_handled(&self) {
        self.reports_handled.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_health(&self, fleet: &FleetStore) -> CoordinatorHealth {
        CoordinatorHealth {
            uptime_seconds: self.start_time.elapsed().as_secs(),
            connected_endpoints: fleet.connected_count(),
            streams_opened: self.streams_opened.load(Ordering::Relaxed),
            streams_active: self.streams_active.load(Ordering::Relaxed),
            reports_handled: self.reports_handled.load(Ordering::Relaxed),
            hourly_rate: fleet.hourly_rate(),
            memory_usage_mb: get_memory_usage_mb(),
        }
    }
}

fn get_memory_usage_mb() -> f32 {
    #[cfg(target_os = "linux")]
    {
        let pid = std::process::id();
        if let Ok(status) = std::fs::read_to_string(format!("/proc/{}/status", pid)) {
            let rss_kb = status
                .lines()
                .find(|line| line.starts_with("VmRSS:"))
                .and_then(|line| line.split_whitespace().nth(1))
                .and_then(|kb| kb.parse::<u64>().ok());
            if let Some(kb) = rss_kb {
                return kb as f32 / 1024.0;
            }
        }
    }

    0.0
}
