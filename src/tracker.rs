use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use hdrhistogram::Histogram;
use serde::Serialize;

/// Default maximum number of recent call events to keep.
const DEFAULT_MAX_RECENT: usize = 500;

/// A single tool call event recorded by the tracker.
#[derive(Debug, Clone)]
struct CallEvent {
    tool_name: String,
    backend_id: String,
    timestamp: Instant,
    duration: Duration,
    success: bool,
}

/// Serializable summary of a call event for the admin stats endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CallEventSummary {
    pub tool_name: String,
    pub backend_id: String,
    pub duration_ms: u64,
    pub success: bool,
    /// Seconds ago relative to the snapshot time.
    pub seconds_ago: f64,
}

/// Latency statistics for a backend.
#[derive(Debug, Clone, Serialize)]
pub struct LatencyStats {
    pub p50_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub avg_ms: f64,
    pub sample_count: u64,
}

/// Thread-safe tracker recording tool invocations routed through the
/// gateway: a bounded ring of recent calls, per-tool counters, and
/// per-backend HDR histograms for latency percentiles.
pub struct CallTracker {
    /// Bounded FIFO of recent call events. Mutex held only for the push.
    recent: Mutex<VecDeque<CallEvent>>,
    /// Per-tool invocation counts.
    usage_counts: DashMap<String, u64>,
    /// Per-backend latency histograms. Inner Mutex because
    /// `Histogram::record` is `&mut self`.
    latency: DashMap<String, Mutex<Histogram<u64>>>,
    max_recent: usize,
}

impl CallTracker {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_RECENT)
    }

    pub fn with_capacity(max_recent: usize) -> Self {
        Self {
            recent: Mutex::new(VecDeque::with_capacity(max_recent)),
            usage_counts: DashMap::new(),
            latency: DashMap::new(),
            max_recent,
        }
    }

    /// Record a completed tool call.
    pub fn record(&self, tool_name: &str, backend_id: &str, duration: Duration, success: bool) {
        let event = CallEvent {
            tool_name: tool_name.to_string(),
            backend_id: backend_id.to_string(),
            timestamp: Instant::now(),
            duration,
            success,
        };

        {
            let mut recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
            if recent.len() >= self.max_recent {
                recent.pop_front();
            }
            recent.push_back(event);
        }

        self.usage_counts
            .entry(tool_name.to_string())
            .and_modify(|c| *c += 1)
            .or_insert(1);

        let duration_us = duration.as_micros() as u64;
        self.latency
            .entry(backend_id.to_string())
            .or_insert_with(|| {
                // 1µs to 10 minutes with 3 significant digits
                Mutex::new(
                    Histogram::<u64>::new_with_bounds(1, 600_000_000, 3)
                        .expect("valid histogram bounds"),
                )
            })
            .value()
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .record(duration_us.max(1))
            .ok(); // ignore out-of-range (>10min)
    }

    #[allow(dead_code)]
    pub fn usage_count(&self, tool_name: &str) -> u64 {
        self.usage_counts
            .get(tool_name)
            .map(|r| *r.value())
            .unwrap_or(0)
    }

    pub fn usage_snapshot(&self) -> std::collections::HashMap<String, u64> {
        self.usage_counts
            .iter()
            .map(|r| (r.key().clone(), *r.value()))
            .collect()
    }

    pub fn latency_stats(&self, backend_id: &str) -> Option<LatencyStats> {
        let entry = self.latency.get(backend_id)?;
        let hist = entry.value().lock().unwrap_or_else(|e| e.into_inner());
        if hist.is_empty() {
            return None;
        }
        Some(LatencyStats {
            p50_ms: hist.value_at_quantile(0.50) as f64 / 1000.0,
            p95_ms: hist.value_at_quantile(0.95) as f64 / 1000.0,
            p99_ms: hist.value_at_quantile(0.99) as f64 / 1000.0,
            avg_ms: hist.mean() / 1000.0,
            sample_count: hist.len(),
        })
    }

    pub fn recent_calls(&self, limit: usize) -> Vec<CallEventSummary> {
        let now = Instant::now();
        let recent = self.recent.lock().unwrap_or_else(|e| e.into_inner());
        recent
            .iter()
            .rev() // most recent first
            .take(limit)
            .map(|e| CallEventSummary {
                tool_name: e.tool_name.clone(),
                backend_id: e.backend_id.clone(),
                duration_ms: e.duration.as_millis() as u64,
                success: e.success,
                seconds_ago: now.duration_since(e.timestamp).as_secs_f64(),
            })
            .collect()
    }

    pub fn backends_with_latency(&self) -> Vec<String> {
        self.latency.iter().map(|entry| entry.key().clone()).collect()
    }
}

impl Default for CallTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_recent() {
        let tracker = CallTracker::new();

        tracker.record("tool_a", "backend1", Duration::from_millis(10), true);
        tracker.record("tool_b", "backend1", Duration::from_millis(20), false);
        tracker.record("tool_c", "backend2", Duration::from_millis(30), true);

        let recent = tracker.recent_calls(10);
        assert_eq!(recent.len(), 3);
        // Most recent first
        assert_eq!(recent[0].tool_name, "tool_c");
        assert_eq!(recent[1].tool_name, "tool_b");
        assert_eq!(recent[2].tool_name, "tool_a");
        assert!(!recent[1].success);
        assert_eq!(recent[2].duration_ms, 10);
    }

    #[test]
    fn test_bounded_ring_buffer() {
        let tracker = CallTracker::with_capacity(5);

        for i in 0..10 {
            tracker.record(
                &format!("tool_{i}"),
                "backend",
                Duration::from_millis(1),
                true,
            );
        }

        let recent = tracker.recent_calls(100);
        assert_eq!(recent.len(), 5);
        // Should have tools 5-9 (oldest 0-4 evicted)
        assert_eq!(recent[0].tool_name, "tool_9");
        assert_eq!(recent[4].tool_name, "tool_5");
    }

    #[test]
    fn test_usage_counts() {
        let tracker = CallTracker::new();

        tracker.record("tool_a", "b1", Duration::from_millis(1), true);
        tracker.record("tool_a", "b1", Duration::from_millis(1), true);
        tracker.record("tool_a", "b1", Duration::from_millis(1), false);
        tracker.record("tool_b", "b1", Duration::from_millis(1), true);

        assert_eq!(tracker.usage_count("tool_a"), 3);
        assert_eq!(tracker.usage_count("tool_b"), 1);
        assert_eq!(tracker.usage_count("tool_c"), 0);

        let snap = tracker.usage_snapshot();
        assert_eq!(snap.get("tool_a"), Some(&3));
    }

    #[test]
    fn test_latency_recording() {
        let tracker = CallTracker::new();

        for i in 1..=100 {
            tracker.record("tool", "backend", Duration::from_millis(i), true);
        }

        let stats = tracker.latency_stats("backend").unwrap();
        assert_eq!(stats.sample_count, 100);
        // p50 around 50ms, p95 around 95ms (±histogram quantization)
        assert!(
            stats.p50_ms > 40.0 && stats.p50_ms < 60.0,
            "p50={}",
            stats.p50_ms
        );
        assert!(
            stats.p95_ms > 85.0 && stats.p95_ms < 105.0,
            "p95={}",
            stats.p95_ms
        );
        assert!(tracker.latency_stats("unknown").is_none());
    }

    #[tokio::test]
    async fn test_concurrent_recording() {
        use std::sync::Arc;

        let tracker = Arc::new(CallTracker::new());
        let mut handles = Vec::new();

        for task_id in 0..10 {
            let t = Arc::clone(&tracker);
            handles.push(tokio::spawn(async move {
                for i in 0..50 {
                    t.record(
                        &format!("tool_{task_id}_{i}"),
                        &format!("backend_{task_id}"),
                        Duration::from_micros(100 + i),
                        true,
                    );
                }
            }));
        }

        for h in handles {
            h.await.unwrap();
        }

        let total_usage: u64 = tracker.usage_snapshot().values().sum();
        assert_eq!(total_usage, 500);
        assert_eq!(tracker.backends_with_latency().len(), 10);
        assert_eq!(tracker.recent_calls(1000).len(), 500);
    }
}
