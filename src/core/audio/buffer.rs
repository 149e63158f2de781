//! Batching and backpressure for uplink audio.
//!
//! The buffer is a plain state machine: it never spawns timers itself.
//! Instead it records a flush deadline which the owning session waits on in
//! its `select!` loop. Because a single task owns the buffer, a flush can
//! never run concurrently with another flush, and clearing the deadline
//! before any flush work starts is enough to cancel a pending timer.

use bytes::{Bytes, BytesMut};
use std::collections::VecDeque;
use std::time::{Duration, Instant as StdInstant};
use tokio::time::Instant;
use tracing::{debug, error, warn};

use super::metrics::AudioMetrics;
use crate::errors::RelayResult;

/// Default delay before a partially filled batch is flushed.
pub const DEFAULT_BATCH_INTERVAL: Duration = Duration::from_millis(200);

/// Default buffered size above which a push flushes immediately (64 KiB).
pub const DEFAULT_MAX_BUFFER_SIZE: usize = 64 * 1024;

/// Default number of chunks kept when the upstream is backed up.
pub const DEFAULT_MAX_QUEUE_CHUNKS: usize = 10;

/// Default upstream buffered amount at which throttling starts (1 MB).
pub const DEFAULT_BACKPRESSURE_HIGH_WATER: usize = 1_000_000;

/// Default upstream buffered amount at which severity saturates (2 MB).
pub const DEFAULT_BACKPRESSURE_SATURATION: usize = 2_000_000;

const BACKPRESSURE_BASE_DELAY_MS: u64 = 100;
const BACKPRESSURE_MAX_EXTRA_DELAY_MS: f64 = 400.0;

const LARGE_BATCH_LOG_BYTES: usize = 32 * 1024;
const SLOW_SEND_LOG: Duration = Duration::from_millis(50);
const VERY_SLOW_SEND: Duration = Duration::from_millis(100);

/// Batching and backpressure thresholds.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBatchConfig {
    /// Delay before a partially filled batch is flushed
    pub batch_interval: Duration,
    /// Buffered bytes above which a push flushes immediately
    pub max_buffer_size: usize,
    /// Chunks kept under backpressure before severity scaling
    pub max_queue_chunks: usize,
    /// Upstream buffered amount that triggers throttling
    pub backpressure_high_water: usize,
    /// Upstream buffered amount at which severity reaches 1.0
    pub backpressure_saturation: usize,
}

impl Default for AudioBatchConfig {
    fn default() -> Self {
        Self {
            batch_interval: DEFAULT_BATCH_INTERVAL,
            max_buffer_size: DEFAULT_MAX_BUFFER_SIZE,
            max_queue_chunks: DEFAULT_MAX_QUEUE_CHUNKS,
            backpressure_high_water: DEFAULT_BACKPRESSURE_HIGH_WATER,
            backpressure_saturation: DEFAULT_BACKPRESSURE_SATURATION,
        }
    }
}

impl AudioBatchConfig {
    /// Severity in `[0, 1]` for a given upstream buffered amount.
    pub fn severity(&self, buffered_amount: usize) -> f64 {
        let saturation = self.backpressure_saturation.max(1) as f64;
        (buffered_amount as f64 / saturation).min(1.0)
    }

    /// Queue length allowed at a given severity. Never below one chunk.
    pub fn effective_queue_len(&self, severity: f64) -> usize {
        let scaled = (self.max_queue_chunks as f64 * (1.0 - severity)).floor() as usize;
        scaled.max(1)
    }

    /// Retry delay at a given severity: 100 ms plus up to 400 ms.
    pub fn backoff_delay(&self, severity: f64) -> Duration {
        let extra = (severity * BACKPRESSURE_MAX_EXTRA_DELAY_MS).floor() as u64;
        Duration::from_millis(BACKPRESSURE_BASE_DELAY_MS + extra)
    }
}

/// Destination for flushed audio batches.
///
/// Implemented by the upstream connection handle; tests supply their own.
pub trait AudioSink {
    /// Whether the link can accept data.
    fn is_open(&self) -> bool;

    /// Bytes queued on the link but not yet written to the network.
    fn buffered_amount(&self) -> usize;

    /// Transmit one contiguous audio block.
    fn send_audio(&self, audio: &[u8]) -> RelayResult<()>;
}

/// What a flush attempt did.
#[derive(Debug, Clone, PartialEq)]
pub enum FlushOutcome {
    /// Nothing was queued
    Empty,
    /// Upstream was closed; the queue was discarded
    Discarded { chunks: usize },
    /// Upstream is backed up; oldest chunks were dropped and a retry scheduled
    Throttled { dropped: usize, retry_in: Duration },
    /// A batch of `bytes` was transmitted
    Sent { bytes: usize },
    /// Transmission failed; the batch was discarded
    Failed { bytes: usize },
}

/// Accumulates client audio chunks and forwards them upstream in batches.
#[derive(Debug)]
pub struct AudioUplinkBuffer {
    config: AudioBatchConfig,
    queue: VecDeque<Bytes>,
    buffered_bytes: usize,
    flush_deadline: Option<Instant>,
    metrics: AudioMetrics,
}

impl AudioUplinkBuffer {
    pub fn new(config: AudioBatchConfig) -> Self {
        Self {
            config,
            queue: VecDeque::new(),
            buffered_bytes: 0,
            flush_deadline: None,
            metrics: AudioMetrics::new(),
        }
    }

    pub fn config(&self) -> &AudioBatchConfig {
        &self.config
    }

    /// Number of queued chunks.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Running byte total of the queued chunks.
    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes
    }

    /// When the pending flush should run, if one is scheduled.
    pub fn flush_deadline(&self) -> Option<Instant> {
        self.flush_deadline
    }

    pub fn metrics(&self) -> &AudioMetrics {
        &self.metrics
    }

    pub fn metrics_mut(&mut self) -> &mut AudioMetrics {
        &mut self.metrics
    }

    /// Cancel the pending flush. Returns whether one was pending.
    pub fn cancel_pending_flush(&mut self) -> bool {
        self.flush_deadline.take().is_some()
    }

    /// Queue a chunk.
    ///
    /// Crossing `max_buffer_size` cancels any pending timer and flushes
    /// before returning. Otherwise a flush is scheduled one batch interval
    /// out unless one is already pending.
    pub fn push<S: AudioSink + ?Sized>(&mut self, chunk: Bytes, sink: &S) -> Option<FlushOutcome> {
        self.buffered_bytes += chunk.len();
        self.queue.push_back(chunk);

        if self.buffered_bytes > self.config.max_buffer_size {
            self.cancel_pending_flush();
            return Some(self.flush(sink));
        }

        if self.flush_deadline.is_none() {
            self.flush_deadline = Some(Instant::now() + self.config.batch_interval);
        }
        None
    }

    /// Send everything queued as one block, subject to backpressure.
    pub fn flush<S: AudioSink + ?Sized>(&mut self, sink: &S) -> FlushOutcome {
        self.flush_deadline = None;

        if self.queue.is_empty() {
            return FlushOutcome::Empty;
        }

        if !sink.is_open() {
            let chunks = self.queue.len();
            self.metrics.record_dropped(chunks);
            self.clear();
            debug!(chunks, "Upstream not open, discarding queued audio");
            return FlushOutcome::Discarded { chunks };
        }

        let buffered_amount = sink.buffered_amount();
        if buffered_amount > self.config.backpressure_high_water {
            return self.throttle(buffered_amount);
        }

        let total = self.buffered_bytes;
        let combined = self.combine();
        self.clear();

        let started = StdInstant::now();
        if let Err(e) = sink.send_audio(&combined) {
            error!("Error while flushing audio buffer: {}", e);
            return FlushOutcome::Failed { bytes: total };
        }
        let elapsed = started.elapsed();

        self.metrics.record_batch(total, elapsed);
        if total > LARGE_BATCH_LOG_BYTES || elapsed > SLOW_SEND_LOG {
            debug!(
                "Sent batched audio: {} bytes in {:.1}ms{}",
                total,
                elapsed.as_secs_f64() * 1000.0,
                if elapsed > VERY_SLOW_SEND { " (slow)" } else { "" }
            );
        }

        FlushOutcome::Sent { bytes: total }
    }

    /// Drop everything without sending.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.buffered_bytes = 0;
    }

    fn throttle(&mut self, buffered_amount: usize) -> FlushOutcome {
        let severity = self.config.severity(buffered_amount);
        let allowed = self.config.effective_queue_len(severity);

        let mut dropped = 0;
        if self.queue.len() > allowed {
            dropped = self.queue.len() - allowed;
            for _ in 0..dropped {
                if let Some(chunk) = self.queue.pop_front() {
                    self.buffered_bytes -= chunk.len();
                }
            }
            self.metrics.record_dropped(dropped);

            warn!(
                buffered_mb = buffered_amount as f64 / 1024.0 / 1024.0,
                dropped, "Upstream backpressure detected, dropping oldest audio chunks"
            );
        }

        let retry_in = self.config.backoff_delay(severity);
        self.flush_deadline = Some(Instant::now() + retry_in);
        FlushOutcome::Throttled { dropped, retry_in }
    }

    fn combine(&self) -> Bytes {
        let mut combined = BytesMut::with_capacity(self.buffered_bytes);
        for chunk in &self.queue {
            combined.extend_from_slice(chunk);
        }
        combined.freeze()
    }
}
