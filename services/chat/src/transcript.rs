//! Folds streamed chunks into the conversation the client resends each turn.

use chatrelay_core::{
    Approval, MessagePart, Role, StreamChunk, ToolPart, ToolState, UiChunk, UiMessage,
};
use std::collections::HashMap;
use tracing::{debug, warn};

/// The conversation plus the bookkeeping needed to apply deltas.
#[derive(Debug, Default)]
pub struct Transcript {
    messages: Vec<UiMessage>,
    open_text: HashMap<String, usize>,
    open_reasoning: HashMap<String, usize>,
}

impl Transcript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> &[UiMessage] {
        &self.messages
    }

    pub fn last(&self) -> Option<&UiMessage> {
        self.messages.last()
    }

    pub fn push_user(&mut self, text: impl Into<String>) -> &UiMessage {
        self.close_open_parts();
        self.messages
            .push(UiMessage::user_text(uuid::Uuid::new_v4().to_string(), text));
        &self.messages[self.messages.len() - 1]
    }

    /// Applies one chunk of the current assistant turn.
    pub fn apply(&mut self, chunk: &StreamChunk) {
        let chunk = match chunk {
            StreamChunk::Ui(chunk) => chunk,
            StreamChunk::Data(data) => {
                debug!(name = %data.name, "ignoring data part");
                return;
            }
            StreamChunk::Unknown(_) => return,
        };

        match chunk {
            UiChunk::Start { message_id, .. } => self.start(message_id.as_deref()),
            UiChunk::StartStep { .. } => self.assistant_mut().parts.push(MessagePart::StepStart),
            UiChunk::FinishStep { .. } | UiChunk::Abort { .. } | UiChunk::Error { .. } => {}
            UiChunk::TextStart { id, .. } => {
                let index = self.push_part(MessagePart::Text { text: String::new() });
                self.open_text.insert(id.clone(), index);
            }
            UiChunk::TextDelta { id, delta, .. } => self.append_text(id, delta, false),
            UiChunk::TextEnd { id, .. } => {
                self.open_text.remove(id);
            }
            UiChunk::ReasoningStart { id, .. } => {
                let index = self.push_part(MessagePart::Reasoning { text: String::new() });
                self.open_reasoning.insert(id.clone(), index);
            }
            UiChunk::ReasoningDelta { id, delta, .. } => self.append_text(id, delta, true),
            UiChunk::ReasoningEnd { id, .. } => {
                self.open_reasoning.remove(id);
            }
            UiChunk::ToolInputStart {
                tool_call_id,
                tool_name,
                provider_executed,
                dynamic,
                ..
            } => {
                if let Some(tool) = self.tool_mut(tool_call_id, tool_name) {
                    tool.state = ToolState::InputStreaming;
                    tool.provider_executed = *provider_executed;
                    tool.dynamic = dynamic.unwrap_or(false);
                }
            }
            UiChunk::ToolInputDelta { .. } => {}
            UiChunk::ToolInputAvailable {
                tool_call_id,
                tool_name,
                input,
                provider_executed,
                dynamic,
                ..
            } => {
                if let Some(tool) = self.tool_mut(tool_call_id, tool_name) {
                    tool.state = ToolState::InputAvailable;
                    tool.input = Some(input.clone());
                    tool.provider_executed = provider_executed.or(tool.provider_executed);
                    tool.dynamic = dynamic.unwrap_or(tool.dynamic);
                }
            }
            UiChunk::ToolApprovalRequest {
                approval_id,
                tool_call_id,
                ..
            } => match self.find_tool_mut(tool_call_id) {
                Some(tool) => {
                    tool.state = ToolState::ApprovalRequested;
                    tool.approval = Some(Approval {
                        id: approval_id.clone(),
                        approved: None,
                        reason: None,
                    });
                }
                None => warn!(%tool_call_id, "approval requested for unknown tool call"),
            },
            UiChunk::ToolOutputAvailable {
                tool_call_id,
                output,
                provider_executed,
                ..
            } => match self.find_tool_mut(tool_call_id) {
                Some(tool) => {
                    tool.state = ToolState::OutputAvailable;
                    tool.output = Some(output.clone());
                    tool.provider_executed = provider_executed.or(tool.provider_executed);
                }
                None => warn!(%tool_call_id, "output for unknown tool call"),
            },
            UiChunk::ToolOutputError {
                tool_call_id,
                error_text,
                provider_executed,
                ..
            } => match self.find_tool_mut(tool_call_id) {
                Some(tool) => {
                    tool.state = ToolState::OutputError;
                    tool.error_text = Some(error_text.clone());
                    tool.provider_executed = provider_executed.or(tool.provider_executed);
                }
                None => warn!(%tool_call_id, "error for unknown tool call"),
            },
            UiChunk::File { url, media_type, .. } => {
                self.push_part(MessagePart::File {
                    media_type: media_type.clone(),
                    url: url.clone(),
                });
            }
            UiChunk::Finish { message_metadata, .. } => {
                if let Some(meta) = message_metadata {
                    self.assistant_mut().metadata = serde_json::to_value(meta).ok();
                }
                self.close_open_parts();
            }
        }
    }

    /// Records a human decision on a pending approval. Returns `false` when no
    /// tool call is waiting on `approval_id`.
    pub fn respond_approval(
        &mut self,
        approval_id: &str,
        approved: bool,
        reason: Option<String>,
    ) -> bool {
        let pending = self
            .messages
            .iter_mut()
            .rev()
            .flat_map(|message| message.parts.iter_mut())
            .find_map(|part| match part {
                MessagePart::Tool(tool)
                    if tool.state == ToolState::ApprovalRequested
                        && tool.approval.as_ref().is_some_and(|a| a.id == approval_id) =>
                {
                    Some(tool)
                }
                _ => None,
            });

        let Some(tool) = pending else {
            return false;
        };
        tool.state = ToolState::ApprovalResponded;
        tool.approval = Some(Approval {
            id: approval_id.to_string(),
            approved: Some(approved),
            reason,
        });
        true
    }

    /// Tool calls still waiting for a human decision, as `(approval id, tool)`.
    pub fn pending_approvals(&self) -> Vec<(String, &ToolPart)> {
        self.messages
            .iter()
            .flat_map(|message| message.tool_parts())
            .filter(|tool| tool.state == ToolState::ApprovalRequested)
            .filter_map(|tool| tool.approval.as_ref().map(|a| (a.id.clone(), tool)))
            .collect()
    }

    /// A `start` with the id of the last assistant message continues it.
    fn start(&mut self, message_id: Option<&str>) {
        self.close_open_parts();
        let continues = self.messages.last().is_some_and(|last| {
            last.role == Role::Assistant && message_id.is_none_or(|id| id == last.id)
        });
        if !continues {
            let id = message_id.map_or_else(|| uuid::Uuid::new_v4().to_string(), str::to_owned);
            self.messages.push(UiMessage::assistant(id));
        }
    }

    fn assistant_mut(&mut self) -> &mut UiMessage {
        let needs_new = self
            .messages
            .last()
            .is_none_or(|last| last.role != Role::Assistant);
        if needs_new {
            self.close_open_parts();
            self.messages
                .push(UiMessage::assistant(uuid::Uuid::new_v4().to_string()));
        }
        let last = self.messages.len() - 1;
        &mut self.messages[last]
    }

    fn push_part(&mut self, part: MessagePart) -> usize {
        let message = self.assistant_mut();
        message.parts.push(part);
        message.parts.len() - 1
    }

    fn append_text(&mut self, id: &str, delta: &str, reasoning: bool) {
        let open = if reasoning {
            &self.open_reasoning
        } else {
            &self.open_text
        };
        let index = match open.get(id).copied() {
            Some(index) => index,
            None => {
                let part = if reasoning {
                    MessagePart::Reasoning { text: String::new() }
                } else {
                    MessagePart::Text { text: String::new() }
                };
                let index = self.push_part(part);
                let open = if reasoning {
                    &mut self.open_reasoning
                } else {
                    &mut self.open_text
                };
                open.insert(id.to_owned(), index);
                index
            }
        };

        match self.assistant_mut().parts.get_mut(index) {
            Some(MessagePart::Text { text } | MessagePart::Reasoning { text }) => {
                text.push_str(delta)
            }
            _ => warn!(%id, "delta for a part that is not text"),
        }
    }

    /// Finds the tool part for `tool_call_id`, creating it when the call is new.
    fn tool_mut(&mut self, tool_call_id: &str, tool_name: &str) -> Option<&mut ToolPart> {
        let message = self.assistant_mut();
        if message.tool_part_mut(tool_call_id).is_none() {
            message.parts.push(MessagePart::Tool(ToolPart::new(
                tool_name,
                tool_call_id,
                ToolState::InputStreaming,
            )));
        }
        message.tool_part_mut(tool_call_id)
    }

    fn find_tool_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolPart> {
        self.messages
            .iter_mut()
            .rev()
            .find_map(|message| message.tool_part_mut(tool_call_id))
    }

    fn close_open_parts(&mut self) {
        self.open_text.clear();
        self.open_reasoning.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chatrelay_core::ResubmitGuard;
    use chatrelay_core::chunk::Extra;
    use serde_json::json;

    fn ui(chunk: UiChunk) -> StreamChunk {
        StreamChunk::Ui(chunk)
    }

    fn approval_turn(transcript: &mut Transcript) {
        for chunk in [
            UiChunk::Start {
                message_id: Some("a1".into()),
                message_metadata: None,
                extra: Extra::new(),
            },
            UiChunk::ToolInputAvailable {
                tool_call_id: "call_1".into(),
                tool_name: "weather".into(),
                input: json!({"city": "Oslo"}),
                provider_executed: None,
                dynamic: None,
                extra: Extra::new(),
            },
            UiChunk::ToolApprovalRequest {
                approval_id: "ap_1".into(),
                tool_call_id: "call_1".into(),
                extra: Extra::new(),
            },
            UiChunk::Finish {
                message_metadata: None,
                extra: Extra::new(),
            },
        ] {
            transcript.apply(&ui(chunk));
        }
    }

    #[test]
    fn text_deltas_accumulate_into_one_part() {
        let mut transcript = Transcript::new();
        transcript.push_user("hi");
        transcript.apply(&ui(UiChunk::Start {
            message_id: Some("a1".into()),
            message_metadata: None,
            extra: Extra::new(),
        }));
        transcript.apply(&ui(UiChunk::TextStart {
            id: "t".into(),
            extra: Extra::new(),
        }));
        for delta in ["Hel", "lo"] {
            transcript.apply(&ui(UiChunk::text_delta("t", delta)));
        }
        transcript.apply(&ui(UiChunk::TextEnd {
            id: "t".into(),
            extra: Extra::new(),
        }));

        let last = transcript.last().unwrap();
        assert_eq!(last.id, "a1");
        assert_eq!(last.role, Role::Assistant);
        assert_eq!(last.parts.len(), 1);
        assert_eq!(last.text(), "Hello");
    }

    #[test]
    fn delta_without_start_creates_the_assistant_message() {
        let mut transcript = Transcript::new();
        transcript.push_user("hi");
        transcript.apply(&ui(UiChunk::text_delta("t", "ok")));
        assert_eq!(transcript.messages().len(), 2);
        assert_eq!(transcript.last().unwrap().text(), "ok");
    }

    #[test]
    fn approval_request_then_response_triggers_one_resend() {
        let mut transcript = Transcript::new();
        let mut guard = ResubmitGuard::new();
        transcript.push_user("tool: weather");
        approval_turn(&mut transcript);

        assert_eq!(transcript.pending_approvals().len(), 1);
        assert!(!guard.should_resubmit(transcript.messages()));

        assert!(!transcript.respond_approval("nope", true, None));
        assert!(transcript.respond_approval("ap_1", true, None));
        assert!(transcript.pending_approvals().is_empty());
        assert!(guard.should_resubmit(transcript.messages()));
        assert!(!guard.should_resubmit(transcript.messages()));
    }

    #[test]
    fn continuation_appends_to_the_same_assistant_message() {
        let mut transcript = Transcript::new();
        transcript.push_user("tool: weather");
        approval_turn(&mut transcript);
        transcript.respond_approval("ap_1", true, None);

        transcript.apply(&ui(UiChunk::Start {
            message_id: Some("a1".into()),
            message_metadata: None,
            extra: Extra::new(),
        }));
        transcript.apply(&ui(UiChunk::ToolOutputAvailable {
            tool_call_id: "call_1".into(),
            output: json!({"temp": 3}),
            provider_executed: None,
            extra: Extra::new(),
        }));
        transcript.apply(&ui(UiChunk::text_delta("t2", "It is 3 degrees.")));

        assert_eq!(transcript.messages().len(), 2);
        let last = transcript.last().unwrap();
        let tool = last.tool_parts().next().unwrap();
        assert_eq!(tool.state, ToolState::OutputAvailable);
        assert_eq!(tool.tool_name, "weather");
        assert_eq!(tool.output, Some(json!({"temp": 3})));
        assert!(last.has_text());
    }

    #[test]
    fn finish_metadata_is_kept_on_the_message() {
        let mut transcript = Transcript::new();
        transcript.apply(&StreamChunk::from_value(json!({
            "type": "finish",
            "messageMetadata": {"model": "m", "usage": {"totalTokens": 12}}
        }))
        .unwrap());
        let metadata = transcript.last().unwrap().metadata.clone().unwrap();
        assert_eq!(metadata["model"], "m");
        assert_eq!(metadata["usage"]["totalTokens"], 12);
    }

    #[test]
    fn wav_file_chunk_becomes_a_file_part() {
        let mut transcript = Transcript::new();
        transcript.apply(&ui(UiChunk::File {
            url: "data:audio/wav;base64,AAAA".into(),
            media_type: "audio/wav".into(),
            extra: Extra::new(),
        }));
        assert!(matches!(
            transcript.last().unwrap().parts.as_slice(),
            [MessagePart::File { media_type, .. }] if media_type == "audio/wav"
        ));
    }
}
