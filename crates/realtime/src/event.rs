//! Outbound client events.

use chatrelay_core::UiMessage;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioAction {
    Start,
    Stop,
}

/// Events the client sends on the connection, framed with [`crate::frame`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// The full conversation for a new turn.
    Message { messages: Vec<UiMessage> },
    Interrupt {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
    AudioControl { action: AudioAction },
    #[serde(rename_all = "camelCase")]
    AudioChunk {
        audio: String,
        sample_rate: u32,
        channels: u16,
        bit_depth: u16,
    },
    /// Result of a tool executed on the client.
    #[serde(rename_all = "camelCase")]
    ToolResult { tool_call_id: String, output: Value },
}

impl ClientEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Message { .. } => "message",
            Self::Interrupt { .. } => "interrupt",
            Self::AudioControl { .. } => "audio-control",
            Self::AudioChunk { .. } => "audio-chunk",
            Self::ToolResult { .. } => "tool-result",
        }
    }
}
