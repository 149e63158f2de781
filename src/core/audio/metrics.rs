//! Per-session audio transmission counters.

use serde::Serialize;
use std::time::{Duration, Instant};

/// Counters mutated by the uplink buffer and the owning session.
#[derive(Debug, Clone)]
pub struct AudioMetrics {
    pub total_bytes_sent: u64,
    pub total_batches_sent: u64,
    pub max_batch_size: usize,
    pub last_send_duration: Duration,
    pub dropped_chunks: u64,
    /// Rolling average interval between completed responses (ms)
    pub avg_latency_ms: f64,
    pub total_responses: u64,
    last_response_at: Option<Instant>,
    session_start: Instant,
}

impl Default for AudioMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl AudioMetrics {
    pub fn new() -> Self {
        Self {
            total_bytes_sent: 0,
            total_batches_sent: 0,
            max_batch_size: 0,
            last_send_duration: Duration::ZERO,
            dropped_chunks: 0,
            avg_latency_ms: 0.0,
            total_responses: 0,
            last_response_at: None,
            session_start: Instant::now(),
        }
    }

    /// Record a batch that was handed to the upstream socket.
    pub fn record_batch(&mut self, size: usize, duration: Duration) {
        self.total_bytes_sent += size as u64;
        self.total_batches_sent += 1;
        self.max_batch_size = self.max_batch_size.max(size);
        self.last_send_duration = duration;
    }

    pub fn record_dropped(&mut self, chunks: usize) {
        self.dropped_chunks += chunks as u64;
    }

    /// Record a completed response.
    pub fn record_response(&mut self) {
        self.record_response_at(Instant::now());
    }

    /// Record a completed response observed at `now`.
    ///
    /// The first response only sets the reference point; later responses
    /// fold the interval since the previous one into the running average.
    pub fn record_response_at(&mut self, now: Instant) {
        self.total_responses += 1;

        if let Some(previous) = self.last_response_at {
            let latency = now.saturating_duration_since(previous).as_secs_f64() * 1000.0;
            let n = self.total_responses as f64;
            self.avg_latency_ms = (self.avg_latency_ms * (n - 1.0) + latency) / n;
        }

        self.last_response_at = Some(now);
    }

    /// Summary for the disposal log line, or `None` if nothing was sent.
    pub fn summary(&self) -> Option<AudioStats> {
        if self.total_batches_sent == 0 {
            return None;
        }

        Some(AudioStats {
            total_sent_mb: self.total_bytes_sent as f64 / 1024.0 / 1024.0,
            batches: self.total_batches_sent,
            avg_batch_size: self.total_bytes_sent / self.total_batches_sent,
            max_batch_size: self.max_batch_size,
            last_send_ms: self.last_send_duration.as_secs_f64() * 1000.0,
            session_duration_secs: self.session_start.elapsed().as_secs_f64(),
            total_responses: self.total_responses,
            avg_latency_ms: self.avg_latency_ms,
            dropped_chunks: (self.dropped_chunks > 0).then_some(self.dropped_chunks),
        })
    }
}

/// Aggregated statistics emitted once per session.
#[derive(Debug, Clone, Serialize)]
pub struct AudioStats {
    pub total_sent_mb: f64,
    pub batches: u64,
    pub avg_batch_size: u64,
    pub max_batch_size: usize,
    pub last_send_ms: f64,
    pub session_duration_secs: f64,
    pub total_responses: u64,
    pub avg_latency_ms: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dropped_chunks: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch_tracks_max() {
        let mut metrics = AudioMetrics::new();
        metrics.record_batch(100, Duration::from_millis(1));
        metrics.record_batch(300, Duration::from_millis(2));
        metrics.record_batch(200, Duration::from_millis(3));

        assert_eq!(metrics.total_bytes_sent, 600);
        assert_eq!(metrics.total_batches_sent, 3);
        assert_eq!(metrics.max_batch_size, 300);
        assert_eq!(metrics.last_send_duration, Duration::from_millis(3));
    }

    #[test]
    fn test_response_latency_average() {
        let mut metrics = AudioMetrics::new();
        let start = Instant::now();

        metrics.record_response_at(start);
        assert_eq!(metrics.total_responses, 1);
        assert_eq!(metrics.avg_latency_ms, 0.0);

        metrics.record_response_at(start + Duration::from_millis(300));
        metrics.record_response_at(start + Duration::from_millis(900));

        // (0 + 300 + 600) / 3
        assert_eq!(metrics.total_responses, 3);
        assert!((metrics.avg_latency_ms - 300.0).abs() < 1e-6);
    }

    #[test]
    fn test_summary_requires_a_batch() {
        let mut metrics = AudioMetrics::new();
        assert!(metrics.summary().is_none());

        metrics.record_batch(2048, Duration::from_millis(1));
        metrics.record_batch(1024, Duration::from_millis(1));
        let stats = metrics.summary().unwrap();
        assert_eq!(stats.batches, 2);
        assert_eq!(stats.avg_batch_size, 1536);
        assert!(stats.dropped_chunks.is_none());

        metrics.record_dropped(4);
        assert_eq!(metrics.summary().unwrap().dropped_chunks, Some(4));
    }
}
