//! Uplink audio handling.
//!
//! Captured client audio arrives as many small binary frames. The
//! [`AudioUplinkBuffer`] batches those frames into larger
//! `input_audio_buffer.append` events and throttles them when the upstream
//! socket is backed up.
//!
//! # Audio Format
//!
//! The relay never inspects samples. Chunks are concatenated byte-wise in
//! arrival order, so whatever the client captures (PCM 16-bit, 24kHz, mono
//! by default) reaches the upstream unchanged.

mod buffer;
mod metrics;

pub use buffer::{
    AudioBatchConfig, AudioSink, AudioUplinkBuffer, DEFAULT_BACKPRESSURE_HIGH_WATER,
    DEFAULT_BACKPRESSURE_SATURATION, DEFAULT_BATCH_INTERVAL, DEFAULT_MAX_BUFFER_SIZE,
    DEFAULT_MAX_QUEUE_CHUNKS, FlushOutcome,
};
pub use metrics::{AudioMetrics, AudioStats};
