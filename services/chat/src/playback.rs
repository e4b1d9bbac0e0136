//! Audio handling for the terminal client, which has no output device: PCM
//! blocks are only logged, and finished turns can be saved as WAV files.

use base64::Engine;
use chatrelay_core::AudioSummary;
use chatrelay_realtime::{AudioSink, PlaybackChunk};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info};

const WAV_DATA_URL_PREFIX: &str = "data:audio/wav;base64,";

/// Logs every block it is asked to play.
#[derive(Debug, Default)]
pub struct LoggingSink {
    samples: AtomicU64,
}

impl LoggingSink {
    pub fn samples_played(&self) -> u64 {
        self.samples.load(Ordering::Relaxed)
    }
}

impl AudioSink for LoggingSink {
    fn play(&self, chunk: PlaybackChunk) {
        self.samples
            .fetch_add(chunk.content.len() as u64, Ordering::Relaxed);
        debug!(
            samples = chunk.content.len(),
            sample_rate = chunk.sample_rate,
            "audio block"
        );
    }

    fn audio_complete(&self, summary: &AudioSummary) {
        info!(
            chunks = summary.chunks,
            duration_ms = ?summary.duration_ms,
            "audio response complete"
        );
    }
}

/// Decodes a `data:audio/wav;base64,` URL.
pub fn decode_wav_data_url(url: &str) -> Option<Vec<u8>> {
    let encoded = url.strip_prefix(WAV_DATA_URL_PREFIX)?;
    base64::engine::general_purpose::STANDARD.decode(encoded).ok()
}

/// Writes a WAV file into `dir`, named after `turn_id`.
pub fn save_wav(dir: &Path, turn_id: &str, wav: &[u8]) -> std::io::Result<PathBuf> {
    std::fs::create_dir_all(dir)?;
    let path = dir.join(format!("{turn_id}.wav"));
    std::fs::write(&path, wav)?;
    Ok(path)
}
