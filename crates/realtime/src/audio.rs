//! PCM audio handling: low-latency playback dispatch plus per-turn buffering
//! for WAV reconstruction.

use base64::Engine;
use chatrelay_core::{AudioSummary, PcmAudioData};
use std::sync::Arc;
use tracing::{debug, error, warn};

pub const WAV_HEADER_LEN: usize = 44;
pub const WAV_MEDIA_TYPE: &str = "audio/wav";
const MAX_CHANNELS: u16 = 8;

/// Format of a PCM stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioFormat {
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

impl AudioFormat {
    /// Whether decoded 16-bit samples can honour this declared format.
    pub fn is_supported(&self) -> bool {
        self.bit_depth == 16 && (1..=MAX_CHANNELS).contains(&self.channels) && self.sample_rate > 0
    }
}

/// Decoded PCM handed to the playback sink.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackChunk {
    pub content: Vec<i16>,
    pub sample_rate: u32,
    pub channels: u16,
    pub bit_depth: u16,
}

/// Low-latency destination for decoded PCM.
#[cfg_attr(test, mockall::automock)]
pub trait AudioSink: Send + Sync {
    /// Called for every audio chunk as soon as it is decoded.
    fn play(&self, chunk: PlaybackChunk);

    /// Called when a completion event declares the turn's audio summary.
    fn audio_complete(&self, _summary: &AudioSummary) {}
}

/// Decodes a base64 string of 16-bit little-endian PCM.
/// Invalid input is logged and yields no samples.
pub fn decode_i16(base64_fragment: &str) -> Vec<i16> {
    match base64::engine::general_purpose::STANDARD.decode(base64_fragment) {
        Ok(pcm16_bytes) => pcm16_bytes
            .chunks_exact(2)
            .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
            .collect(),
        Err(e) => {
            error!(error = %e, "failed to decode base64 PCM fragment");
            Vec::new()
        }
    }
}

/// Encodes 16-bit samples as base64 little-endian PCM.
pub fn encode_i16(pcm16: &[i16]) -> String {
    let pcm16_bytes: Vec<u8> = pcm16
        .iter()
        .flat_map(|&sample| sample.to_le_bytes())
        .collect();
    base64::engine::general_purpose::STANDARD.encode(&pcm16_bytes)
}

/// Builds a canonical 44-byte-header RIFF/WAVE file around raw PCM samples.
pub fn encode_wav(samples: &[i16], format: AudioFormat) -> Vec<u8> {
    let data_len = u32::try_from(samples.len() * 2).unwrap_or(u32::MAX);
    let block_align = u32::from(format.channels).saturating_mul(u32::from(format.bit_depth)) / 8;
    let byte_rate = format.sample_rate.saturating_mul(block_align);
    let block_align = u16::try_from(block_align).unwrap_or(u16::MAX);

    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + samples.len() * 2);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&data_len.saturating_add(36).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes());
    wav.extend_from_slice(&format.channels.to_le_bytes());
    wav.extend_from_slice(&format.sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&format.bit_depth.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_len.to_le_bytes());
    for sample in samples {
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

/// `data:` URL for a WAV file, suitable for a `file` chunk.
pub fn wav_data_url(wav: &[u8]) -> String {
    format!(
        "data:{WAV_MEDIA_TYPE};base64,{}",
        base64::engine::general_purpose::STANDARD.encode(wav)
    )
}

/// PCM collected during one turn.
#[derive(Debug, Default)]
pub struct TurnAudioBuffer {
    format: Option<AudioFormat>,
    blocks: Vec<Vec<i16>>,
    chunks_received: u32,
}

impl TurnAudioBuffer {
    /// Appends a block; the first block of the turn fixes the format.
    pub fn push(&mut self, samples: Vec<i16>, format: AudioFormat) {
        self.format.get_or_insert(format);
        self.chunks_received += 1;
        self.blocks.push(samples);
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    pub fn format(&self) -> Option<AudioFormat> {
        self.format
    }

    pub fn chunks_received(&self) -> u32 {
        self.chunks_received
    }

    pub fn sample_count(&self) -> usize {
        self.blocks.iter().map(Vec::len).sum()
    }

    /// Drains the buffer into a WAV file. `None` when nothing was buffered.
    pub fn take_wav(&mut self) -> Option<Vec<u8>> {
        let format = self.format?;
        if self.blocks.is_empty() {
            return None;
        }
        let samples: Vec<i16> = std::mem::take(&mut self.blocks).concat();
        Some(encode_wav(&samples, format))
    }

    pub fn reset(&mut self) {
        self.format = None;
        self.blocks.clear();
        self.chunks_received = 0;
    }
}

/// Routes inbound PCM chunks to the sink and the turn buffer.
pub struct AudioPipeline {
    sink: Option<Arc<dyn AudioSink>>,
    buffer: TurnAudioBuffer,
}

impl AudioPipeline {
    pub fn new(sink: Option<Arc<dyn AudioSink>>) -> Self {
        Self {
            sink,
            buffer: TurnAudioBuffer::default(),
        }
    }

    pub fn buffer(&self) -> &TurnAudioBuffer {
        &self.buffer
    }

    /// Handles one PCM chunk. Without a sink, or when the declared format is
    /// not 16-bit PCM, the chunk is dropped.
    pub fn handle_chunk(&mut self, audio: PcmAudioData) {
        let Some(sink) = &self.sink else {
            debug!("no audio sink configured; dropping PCM chunk");
            return;
        };

        let format = AudioFormat {
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            bit_depth: audio.bit_depth,
        };
        if !format.is_supported() {
            warn!(?format, "unsupported PCM format; dropping chunk");
            return;
        }
        let samples = decode_i16(&audio.chunk);
        sink.play(PlaybackChunk {
            content: samples.clone(),
            sample_rate: format.sample_rate,
            channels: format.channels,
            bit_depth: format.bit_depth,
        });
        self.buffer.push(samples, format);
    }

    /// Builds the turn's WAV when the completion declares audio, and notifies
    /// the sink.
    pub fn complete(&mut self, summary: &AudioSummary) -> Option<Vec<u8>> {
        if let Some(sink) = &self.sink {
            sink.audio_complete(summary);
        }
        let received = self.buffer.chunks_received();
        let wav = self.buffer.take_wav();
        debug!(
            declared = summary.chunks,
            received,
            synthesized = wav.is_some(),
            "turn audio complete"
        );
        wav
    }

    /// Clears all per-turn state.
    pub fn end_turn(&mut self) {
        self.buffer.reset();
    }
}
