//! Shared state of the development backend.

use std::time::Duration;

/// Knobs for the scripted replies, shared by every connection.
#[derive(Clone, Debug)]
pub struct AppState {
    /// Delay between outbound frames, so interrupts can land mid-reply.
    pub frame_interval: Duration,
    /// Number of PCM blocks streamed for an `audio:` prompt.
    pub audio_chunks: u32,
    pub sample_rate: u32,
    /// Samples per PCM block.
    pub samples_per_chunk: usize,
}

impl Default for AppState {
    fn default() -> Self {
        Self {
            frame_interval: Duration::from_millis(5),
            audio_chunks: 60,
            sample_rate: 24_000,
            samples_per_chunk: 240,
        }
    }
}
