//! Scripted replies of the development backend.
//!
//! - a user message starting with `tool:` asks for approval of a tool call;
//! - `audio:` streams PCM audio before finishing;
//! - anything else is echoed back.
//!
//! When the last message is an assistant turn with answered approvals, the
//! pending tool calls are run (or reported as denied) and the turn continues.

use crate::state::AppState;
use chatrelay_core::chunk::{Extra, Usage};
use chatrelay_core::{
    AudioSummary, FinishMetadata, PcmAudioData, Role, StreamChunk, ToolPart, ToolState, UiChunk,
    UiMessage,
};
use chatrelay_realtime::audio::encode_i16;
use chatrelay_realtime::frame::{encode_done, encode_event};
use serde_json::json;
use uuid::Uuid;

pub const MODEL_NAME: &str = "mock-backend";
const TOOL_PREFIX: &str = "tool:";
const AUDIO_PREFIX: &str = "audio:";
const TONE_HZ: f32 = 440.0;

type Frames = Result<Vec<String>, serde_json::Error>;

/// Frames of one turn, ended by the turn-complete sentinel.
#[derive(Default)]
struct Reply {
    frames: Vec<String>,
}

impl Reply {
    fn push(&mut self, chunk: impl Into<StreamChunk>) -> Result<(), serde_json::Error> {
        self.frames.push(encode_event(&chunk.into())?);
        Ok(())
    }

    fn text(&mut self, id: &str, text: &str) -> Result<(), serde_json::Error> {
        self.push(UiChunk::TextStart {
            id: id.into(),
            extra: Extra::new(),
        })?;
        for word in text.split_inclusive(' ') {
            self.push(UiChunk::text_delta(id, word))?;
        }
        self.push(UiChunk::TextEnd {
            id: id.into(),
            extra: Extra::new(),
        })
    }

    fn done(mut self) -> Vec<String> {
        self.frames.push(encode_done());
        self.frames
    }
}

fn short_id() -> String {
    Uuid::new_v4().simple().to_string()[..12].to_string()
}

fn start(message_id: &str) -> UiChunk {
    UiChunk::Start {
        message_id: Some(message_id.to_owned()),
        message_metadata: None,
        extra: Extra::new(),
    }
}

fn finish(reason: &str, usage: Usage, audio: Option<AudioSummary>) -> UiChunk {
    let mut extra = Extra::new();
    extra.insert("finishReason".into(), reason.into());
    UiChunk::Finish {
        message_metadata: Some(FinishMetadata {
            usage: Some(usage),
            audio,
            model: Some(MODEL_NAME.to_owned()),
            ..Default::default()
        }),
        extra,
    }
}

fn usage_for(prompt: &str, answer: &str) -> Usage {
    let input = prompt.split_whitespace().count() as u64;
    let output = answer.split_whitespace().count() as u64;
    Usage {
        input_tokens: Some(input),
        output_tokens: Some(output),
        total_tokens: Some(input + output),
        ..Default::default()
    }
}

/// Builds the reply to a `message` event.
pub fn respond(messages: &[UiMessage], state: &AppState) -> Frames {
    let Some(last) = messages.last() else {
        return error_reply("conversation is empty");
    };
    match last.role {
        Role::User => {
            let text = last.text();
            if let Some(rest) = text.strip_prefix(TOOL_PREFIX) {
                request_tool(rest.trim())
            } else if let Some(rest) = text.strip_prefix(AUDIO_PREFIX) {
                speak(rest.trim(), state)
            } else {
                echo(&text)
            }
        }
        Role::Assistant => continue_after_approval(last),
        Role::System => error_reply("last message must come from the user or the assistant"),
    }
}

/// The reply to an `interrupt` event.
pub fn aborted() -> Frames {
    let mut reply = Reply::default();
    reply.push(UiChunk::abort())?;
    Ok(reply.done())
}

fn error_reply(error_text: &str) -> Frames {
    let mut reply = Reply::default();
    reply.push(UiChunk::Error {
        error_text: error_text.into(),
        extra: Extra::new(),
    })?;
    Ok(reply.done())
}

fn echo(text: &str) -> Frames {
    let mut reply = Reply::default();
    reply.push(start(&short_id()))?;
    reply.text("t1", text)?;
    reply.push(finish("stop", usage_for(text, text), None))?;
    Ok(reply.done())
}

fn request_tool(query: &str) -> Frames {
    let tool_name = query.split_whitespace().next().unwrap_or("lookup");
    let tool_call_id = format!("call_{}", short_id());
    let mut reply = Reply::default();
    reply.push(start(&short_id()))?;
    reply.push(UiChunk::StartStep {
        extra: Extra::new(),
    })?;
    reply.push(UiChunk::ToolInputStart {
        tool_call_id: tool_call_id.clone(),
        tool_name: tool_name.into(),
        provider_executed: None,
        dynamic: None,
        extra: Extra::new(),
    })?;
    reply.push(UiChunk::ToolInputAvailable {
        tool_call_id: tool_call_id.clone(),
        tool_name: tool_name.into(),
        input: json!({ "query": query }),
        provider_executed: None,
        dynamic: None,
        extra: Extra::new(),
    })?;
    reply.push(UiChunk::ToolApprovalRequest {
        approval_id: format!("approval_{}", short_id()),
        tool_call_id,
        extra: Extra::new(),
    })?;
    reply.push(UiChunk::FinishStep {
        extra: Extra::new(),
    })?;
    reply.push(finish("tool-calls", usage_for(query, ""), None))?;
    Ok(reply.done())
}

fn speak(text: &str, state: &AppState) -> Frames {
    let mut reply = Reply::default();
    reply.push(start(&short_id()))?;
    reply.text("t1", text)?;

    let per_chunk = state.samples_per_chunk;
    for index in 0..state.audio_chunks as usize {
        let samples: Vec<i16> = (0..per_chunk)
            .map(|n| {
                let t = (index * per_chunk + n) as f32 / state.sample_rate as f32;
                ((2.0 * std::f32::consts::PI * TONE_HZ * t).sin() * 8_000.0) as i16
            })
            .collect();
        reply.push(StreamChunk::pcm_audio(&PcmAudioData {
            chunk: encode_i16(&samples),
            sample_rate: state.sample_rate,
            channels: 1,
            bit_depth: 16,
        })?)?;
    }

    let total_samples = state.audio_chunks as u64 * per_chunk as u64;
    let summary = AudioSummary {
        chunks: state.audio_chunks,
        sample_rate: Some(state.sample_rate),
        channels: Some(1),
        bit_depth: Some(16),
        duration_ms: Some(total_samples * 1000 / u64::from(state.sample_rate.max(1))),
        ..Default::default()
    };
    reply.push(finish("stop", usage_for(text, text), Some(summary)))?;
    Ok(reply.done())
}

fn continue_after_approval(turn: &UiMessage) -> Frames {
    let answered: Vec<&ToolPart> = turn
        .tool_parts()
        .filter(|tool| tool.state == ToolState::ApprovalResponded)
        .collect();
    if answered.is_empty() {
        return error_reply("no answered tool approvals to act on");
    }

    let mut reply = Reply::default();
    reply.push(start(&turn.id))?;
    let mut summary = Vec::with_capacity(answered.len());
    for tool in answered {
        let approval = tool.approval.as_ref();
        if approval.and_then(|a| a.approved) == Some(true) {
            reply.push(UiChunk::ToolOutputAvailable {
                tool_call_id: tool.tool_call_id.clone(),
                output: json!({
                    "tool": tool.tool_name,
                    "input": tool.input,
                    "result": "ok",
                }),
                provider_executed: None,
                extra: Extra::new(),
            })?;
            summary.push(format!("Ran {}.", tool.tool_name));
        } else {
            let reason = approval
                .and_then(|a| a.reason.as_deref())
                .map(|r| format!(": {r}"))
                .unwrap_or_default();
            summary.push(format!("Skipped {} (denied{reason}).", tool.tool_name));
        }
    }
    let text = summary.join(" ");
    reply.text("t2", &text)?;
    reply.push(finish("stop", usage_for("", &text), None))?;
    Ok(reply.done())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::Approval;
    use chatrelay_realtime::frame::{Frame, parse_message};

    fn decode(frames: &[String]) -> Vec<Frame> {
        frames
            .iter()
            .flat_map(|frame| parse_message(frame))
            .map(Result::unwrap)
            .collect()
    }

    fn chunks(frames: &[String]) -> Vec<StreamChunk> {
        decode(frames)
            .into_iter()
            .filter_map(|frame| match frame {
                Frame::Event(chunk) => Some(chunk),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn echo_ends_with_done() {
        let frames = respond(&[UiMessage::user_text("u1", "hello there")], &AppState::default())
            .unwrap();
        assert_eq!(decode(&frames).last(), Some(&Frame::Done));

        let text: String = chunks(&frames)
            .into_iter()
            .filter_map(|chunk| match chunk {
                StreamChunk::Ui(UiChunk::TextDelta { delta, .. }) => Some(delta),
                _ => None,
            })
            .collect();
        assert_eq!(text, "hello there");
    }

    #[test]
    fn tool_prompt_requests_approval() {
        let frames = respond(&[UiMessage::user_text("u1", "tool: weather Oslo")], &AppState::default())
            .unwrap();
        let chunks = chunks(&frames);
        assert!(chunks.iter().any(|chunk| matches!(
            chunk,
            StreamChunk::Ui(UiChunk::ToolInputAvailable { tool_name, .. }) if tool_name == "weather"
        )));
        assert!(chunks.iter().any(|chunk| matches!(
            chunk,
            StreamChunk::Ui(UiChunk::ToolApprovalRequest { .. })
        )));
    }

    #[test]
    fn audio_prompt_streams_pcm_then_summary() {
        let state = AppState {
            audio_chunks: 3,
            ..AppState::default()
        };
        let frames = respond(&[UiMessage::user_text("u1", "audio: hi")], &state).unwrap();
        let chunks = chunks(&frames);
        let pcm = chunks
            .iter()
            .filter(|chunk| chunk.kind() == "data-pcm-audio")
            .count();
        assert_eq!(pcm, 3);
        let Some(StreamChunk::Ui(UiChunk::Finish { message_metadata: Some(meta), .. })) = chunks.last()
        else {
            panic!("expected finish last");
        };
        let audio = meta.audio.as_ref().unwrap();
        assert_eq!(audio.chunks, 3);
        assert_eq!(audio.duration_ms, Some(30));
    }

    #[test]
    fn answered_approvals_continue_the_same_turn() {
        let mut approved = ToolPart::new("weather", "call_1", ToolState::ApprovalResponded);
        approved.approval = Some(Approval {
            id: "ap_1".into(),
            approved: Some(true),
            reason: None,
        });
        let mut denied = ToolPart::new("email", "call_2", ToolState::ApprovalResponded);
        denied.approval = Some(Approval {
            id: "ap_2".into(),
            approved: Some(false),
            reason: Some("not now".into()),
        });
        let mut turn = UiMessage::assistant("a1");
        turn.parts.push(chatrelay_core::MessagePart::Tool(approved));
        turn.parts.push(chatrelay_core::MessagePart::Tool(denied));

        let chunks = chunks(&respond(&[turn], &AppState::default()).unwrap());
        assert!(matches!(
            &chunks[0],
            StreamChunk::Ui(UiChunk::Start { message_id: Some(id), .. }) if id == "a1"
        ));
        let outputs: Vec<_> = chunks
            .iter()
            .filter_map(|chunk| match chunk {
                StreamChunk::Ui(UiChunk::ToolOutputAvailable { tool_call_id, .. }) => {
                    Some(tool_call_id.as_str())
                }
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec!["call_1"]);
    }

    #[test]
    fn interrupt_reply_is_abort_then_done() {
        let frames = decode(&aborted().unwrap());
        assert_eq!(
            frames,
            vec![Frame::Event(StreamChunk::Ui(UiChunk::abort())), Frame::Done]
        );
    }
}
