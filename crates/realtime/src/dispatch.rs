//! Classifies decoded events: intercepted (audio, pong) or forwarded to the
//! current turn, possibly with side effects.

use crate::audio::{AudioPipeline, AudioSink, WAV_MEDIA_TYPE, wav_data_url};
use chatrelay_core::chunk::{Extra, PCM_AUDIO_DATA};
use chatrelay_core::{FinishMetadata, PcmAudioData, StreamChunk, UiChunk};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Callback invoked with each measured keep-alive round trip.
pub type LatencyCallback = Arc<dyn Fn(Duration) + Send + Sync>;

/// Correlates keep-alive probes with their responses.
#[derive(Default)]
pub struct LatencyProbe {
    last_sent: Option<i64>,
    callback: Option<LatencyCallback>,
}

impl LatencyProbe {
    pub fn new(callback: Option<LatencyCallback>) -> Self {
        Self {
            last_sent: None,
            callback,
        }
    }

    pub fn mark_sent(&mut self, timestamp: i64) {
        self.last_sent = Some(timestamp);
    }

    /// Matches a pong against the outstanding probe. Stale or duplicate
    /// responses are ignored.
    pub fn on_pong(&mut self, timestamp: i64, now: i64) -> Option<Duration> {
        if self.last_sent != Some(timestamp) {
            debug!(timestamp, outstanding = ?self.last_sent, "discarding stale pong");
            return None;
        }
        self.last_sent = None;
        let rtt = Duration::from_millis(now.saturating_sub(timestamp).max(0) as u64);
        if let Some(callback) = &self.callback {
            callback(rtt);
        }
        Some(rtt)
    }
}

/// Routes each decoded event.
pub struct EventDispatcher {
    audio: AudioPipeline,
    latency: LatencyProbe,
}

impl EventDispatcher {
    pub fn new(sink: Option<Arc<dyn AudioSink>>, on_latency: Option<LatencyCallback>) -> Self {
        Self {
            audio: AudioPipeline::new(sink),
            latency: LatencyProbe::new(on_latency),
        }
    }

    pub fn audio(&self) -> &AudioPipeline {
        &self.audio
    }

    pub fn latency_mut(&mut self) -> &mut LatencyProbe {
        &mut self.latency
    }

    /// Handles a pong keep-alive response.
    pub fn pong(&mut self, timestamp: i64) -> Option<Duration> {
        let rtt = self
            .latency
            .on_pong(timestamp, chrono::Utc::now().timestamp_millis());
        if let Some(rtt) = rtt {
            debug!(rtt_ms = rtt.as_millis() as u64, "keep-alive round trip");
        }
        rtt
    }

    /// Returns the chunks to forward to the current turn, in order. An empty
    /// result means the event was intercepted.
    pub fn dispatch(&mut self, chunk: StreamChunk) -> Vec<StreamChunk> {
        match chunk {
            StreamChunk::Data(data) if data.name == PCM_AUDIO_DATA => {
                match serde_json::from_value::<PcmAudioData>(data.data) {
                    Ok(audio) => self.audio.handle_chunk(audio),
                    Err(e) => warn!(error = %e, "dropping malformed PCM audio chunk"),
                }
                Vec::new()
            }
            StreamChunk::Ui(UiChunk::Finish {
                message_metadata,
                extra,
            }) => self.finish(message_metadata, extra),
            StreamChunk::Ui(chunk) => vec![StreamChunk::Ui(chunk)],
            StreamChunk::Data(data) => vec![StreamChunk::Data(data)],
            StreamChunk::Unknown(value) => {
                debug!(kind = ?value.get("type"), "forwarding unrecognized event");
                vec![StreamChunk::Unknown(value)]
            }
        }
    }

    /// Resets per-turn state after the turn-complete sentinel.
    pub fn end_turn(&mut self) {
        self.audio.end_turn();
    }

    fn finish(&mut self, metadata: Option<FinishMetadata>, extra: Extra) -> Vec<StreamChunk> {
        let mut out = Vec::with_capacity(2);
        if let Some(meta) = &metadata {
            log_completion(meta);
            if let Some(summary) = &meta.audio {
                if let Some(wav) = self.audio.complete(summary) {
                    out.push(StreamChunk::Ui(UiChunk::File {
                        url: wav_data_url(&wav),
                        media_type: WAV_MEDIA_TYPE.to_owned(),
                        extra: Extra::new(),
                    }));
                }
            }
        }
        out.push(StreamChunk::Ui(UiChunk::Finish {
            message_metadata: metadata,
            extra,
        }));
        out
    }
}

fn log_completion(meta: &FinishMetadata) {
    let usage = meta.usage.clone().unwrap_or_default();
    info!(
        model = meta.model.as_deref().unwrap_or("unknown"),
        input_tokens = ?usage.input_tokens,
        output_tokens = ?usage.output_tokens,
        total_tokens = ?usage.total_tokens,
        citations = meta.citations.as_ref().map_or(0, Vec::len),
        cache = meta.cache.is_some(),
        audio_chunks = ?meta.audio.as_ref().map(|a| a.chunks),
        "turn finished"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockAudioSink, encode_i16};
    use chatrelay_core::AudioSummary;
    use serde_json::json;
    use std::sync::Mutex;

    fn pcm_chunk(samples: &[i16]) -> StreamChunk {
        StreamChunk::pcm_audio(&PcmAudioData {
            chunk: encode_i16(samples),
            sample_rate: 24_000,
            channels: 1,
            bit_depth: 16,
        })
        .unwrap()
    }

    fn finish_with_audio(chunks: u32) -> StreamChunk {
        StreamChunk::Ui(UiChunk::Finish {
            message_metadata: Some(FinishMetadata {
                audio: Some(AudioSummary {
                    chunks,
                    sample_rate: Some(24_000),
                    channels: Some(1),
                    bit_depth: Some(16),
                    ..Default::default()
                }),
                ..Default::default()
            }),
            extra: Extra::new(),
        })
    }

    fn quiet_sink() -> Arc<dyn AudioSink> {
        let mut sink = MockAudioSink::new();
        sink.expect_play().return_const(());
        sink.expect_audio_complete().return_const(());
        Arc::new(sink)
    }

    #[test]
    fn text_chunks_pass_through() {
        let mut dispatcher = EventDispatcher::new(None, None);
        let chunk = StreamChunk::Ui(UiChunk::text_delta("t", "hi"));
        assert_eq!(dispatcher.dispatch(chunk.clone()), vec![chunk]);
    }

    #[test]
    fn unknown_events_are_not_dropped() {
        let mut dispatcher = EventDispatcher::new(None, None);
        let chunk = StreamChunk::Unknown(json!({"type": "message-metadata", "x": 1}));
        assert_eq!(dispatcher.dispatch(chunk.clone()), vec![chunk]);
    }

    #[test]
    fn pcm_audio_is_intercepted_with_or_without_sink() {
        let mut without = EventDispatcher::new(None, None);
        assert!(without.dispatch(pcm_chunk(&[1, 2])).is_empty());

        let mut with = EventDispatcher::new(Some(quiet_sink()), None);
        assert!(with.dispatch(pcm_chunk(&[1, 2])).is_empty());
        assert_eq!(with.audio().buffer().chunks_received(), 1);
    }

    #[test]
    fn sixty_chunk_stream_yields_one_wav_before_finish() {
        let mut dispatcher = EventDispatcher::new(Some(quiet_sink()), None);
        for i in 0..60 {
            assert!(dispatcher.dispatch(pcm_chunk(&[i as i16; 240])).is_empty());
        }

        let out = dispatcher.dispatch(finish_with_audio(60));
        assert_eq!(out.len(), 2);
        let StreamChunk::Ui(UiChunk::File { url, media_type, .. }) = &out[0] else {
            panic!("expected file chunk first, got {:?}", out[0]);
        };
        assert_eq!(media_type, "audio/wav");
        assert!(matches!(out[1], StreamChunk::Ui(UiChunk::Finish { .. })));

        use base64::Engine;
        let encoded = url.trim_start_matches("data:audio/wav;base64,");
        let wav = base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .unwrap();
        assert_eq!(u16::from_le_bytes([wav[22], wav[23]]), 1);
        assert_eq!(u32::from_le_bytes(wav[24..28].try_into().unwrap()), 24_000);
        assert_eq!(u16::from_le_bytes([wav[34], wav[35]]), 16);
        assert_eq!(wav.len(), 44 + 60 * 240 * 2);
    }

    #[test]
    fn finish_keeps_its_unmodelled_fields_after_the_wav() {
        let mut dispatcher = EventDispatcher::new(Some(quiet_sink()), None);
        dispatcher.dispatch(pcm_chunk(&[1, 2, 3]));
        let raw = json!({
            "type": "finish",
            "finishReason": "stop",
            "messageMetadata": {
                "audio": {"chunks": 1, "sampleRate": 24000},
                "usage": {"inputTokens": 1, "reasoningTokens": 7}
            }
        });

        let out = dispatcher.dispatch(StreamChunk::from_value(raw.clone()).unwrap());
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].kind(), "file");
        assert_eq!(out[1].to_value().unwrap(), raw);
    }

    #[test]
    fn finish_without_buffered_audio_has_no_file() {
        let mut dispatcher = EventDispatcher::new(Some(quiet_sink()), None);
        let out = dispatcher.dispatch(finish_with_audio(3));
        assert_eq!(out.len(), 1);
    }

    #[test]
    fn finish_without_audio_summary_keeps_buffer_for_turn_end() {
        let mut dispatcher = EventDispatcher::new(Some(quiet_sink()), None);
        dispatcher.dispatch(pcm_chunk(&[5]));
        let out = dispatcher.dispatch(StreamChunk::Ui(UiChunk::Finish {
            message_metadata: None,
            extra: Extra::new(),
        }));
        assert_eq!(out.len(), 1);
        dispatcher.end_turn();
        assert!(dispatcher.audio().buffer().is_empty());
    }

    #[test]
    fn matching_pong_reports_latency_once() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut probe = LatencyProbe::new(Some(Arc::new(move |rtt| {
            sink.lock().unwrap().push(rtt);
        })));

        probe.mark_sent(1_000);
        assert_eq!(probe.on_pong(999, 1_050), None);
        assert_eq!(probe.on_pong(1_000, 1_042), Some(Duration::from_millis(42)));
        assert_eq!(probe.on_pong(1_000, 1_100), None);
        assert_eq!(*seen.lock().unwrap(), vec![Duration::from_millis(42)]);
    }
}
