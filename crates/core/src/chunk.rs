//! Protocol chunks streamed from the backend to the UI layer.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Name of the custom data part carrying raw PCM audio.
pub const PCM_AUDIO_DATA: &str = "pcm-audio";

const DATA_TYPE_PREFIX: &str = "data-";

/// Fields a chunk carries beyond the ones modelled here. They are kept so a
/// forwarded chunk serializes back to what the backend sent.
pub type Extra = Map<String, Value>;

/// Chunk kinds with a fixed shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum UiChunk {
    #[serde(rename_all = "camelCase")]
    Start {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_id: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<Value>,
        #[serde(flatten)]
        extra: Extra,
    },
    StartStep {
        #[serde(flatten)]
        extra: Extra,
    },
    FinishStep {
        #[serde(flatten)]
        extra: Extra,
    },
    TextStart {
        id: String,
        #[serde(flatten)]
        extra: Extra,
    },
    TextDelta {
        id: String,
        delta: String,
        #[serde(flatten)]
        extra: Extra,
    },
    TextEnd {
        id: String,
        #[serde(flatten)]
        extra: Extra,
    },
    ReasoningStart {
        id: String,
        #[serde(flatten)]
        extra: Extra,
    },
    ReasoningDelta {
        id: String,
        delta: String,
        #[serde(flatten)]
        extra: Extra,
    },
    ReasoningEnd {
        id: String,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputStart {
        tool_call_id: String,
        tool_name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputDelta {
        tool_call_id: String,
        input_text_delta: String,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolInputAvailable {
        tool_call_id: String,
        tool_name: String,
        input: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        dynamic: Option<bool>,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolApprovalRequest {
        approval_id: String,
        tool_call_id: String,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputAvailable {
        tool_call_id: String,
        output: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    ToolOutputError {
        tool_call_id: String,
        error_text: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        provider_executed: Option<bool>,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    File {
        url: String,
        media_type: String,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    Finish {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message_metadata: Option<FinishMetadata>,
        #[serde(flatten)]
        extra: Extra,
    },
    #[serde(rename_all = "camelCase")]
    Error {
        error_text: String,
        #[serde(flatten)]
        extra: Extra,
    },
    Abort {
        #[serde(flatten)]
        extra: Extra,
    },
}

impl UiChunk {
    pub fn abort() -> Self {
        Self::Abort {
            extra: Extra::new(),
        }
    }

    pub fn text_delta(id: impl Into<String>, delta: impl Into<String>) -> Self {
        Self::TextDelta {
            id: id.into(),
            delta: delta.into(),
            extra: Extra::new(),
        }
    }
}

/// Metadata attached to a `finish` chunk.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinishMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio: Option<AudioSummary>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub citations: Option<Vec<Value>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(flatten)]
    pub extra: Extra,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Usage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_tokens: Option<u64>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// Summary of the audio the backend streamed during a turn.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioSummary {
    #[serde(default)]
    pub chunks: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bit_depth: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(flatten)]
    pub extra: Extra,
}

/// A custom `data-<name>` part.
#[derive(Debug, Clone, PartialEq)]
pub struct DataChunk {
    /// Name without the `data-` prefix.
    pub name: String,
    pub id: Option<String>,
    pub data: Value,
    pub transient: Option<bool>,
    pub extra: Extra,
}

/// Payload of a `data-pcm-audio` part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PcmAudioData {
    /// Base64 encoded 16-bit little-endian PCM.
    pub chunk: String,
    pub sample_rate: u32,
    #[serde(default = "default_channels")]
    pub channels: u16,
    #[serde(default = "default_bit_depth")]
    pub bit_depth: u16,
}

fn default_channels() -> u16 {
    1
}

fn default_bit_depth() -> u16 {
    16
}

/// Every event the backend may stream during a turn.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    Ui(UiChunk),
    Data(DataChunk),
    /// A kind this crate does not recognize, forwarded untouched.
    Unknown(Value),
}

const KNOWN_KINDS: &[&str] = &[
    "start",
    "start-step",
    "finish-step",
    "text-start",
    "text-delta",
    "text-end",
    "reasoning-start",
    "reasoning-delta",
    "reasoning-end",
    "tool-input-start",
    "tool-input-delta",
    "tool-input-available",
    "tool-approval-request",
    "tool-output-available",
    "tool-output-error",
    "file",
    "finish",
    "error",
    "abort",
];

impl StreamChunk {
    /// Classifies a decoded JSON object.
    ///
    /// Unknown kinds are kept as [`StreamChunk::Unknown`]; a known kind with a
    /// malformed shape is an error.
    pub fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(kind) => kind.to_owned(),
            None => return Err(serde_json::Error::custom("event is missing `type`")),
        };

        if let Some(name) = kind.strip_prefix(DATA_TYPE_PREFIX) {
            let Value::Object(mut object) = value else {
                return Err(serde_json::Error::custom("data part is not an object"));
            };
            object.remove("type");
            let id = match object.remove("id") {
                Some(Value::String(id)) => Some(id),
                Some(other) => {
                    object.insert("id".into(), other);
                    None
                }
                None => None,
            };
            let transient = match object.remove("transient") {
                Some(Value::Bool(transient)) => Some(transient),
                Some(other) => {
                    object.insert("transient".into(), other);
                    None
                }
                None => None,
            };
            return Ok(Self::Data(DataChunk {
                name: name.to_owned(),
                id,
                data: object.remove("data").unwrap_or(Value::Null),
                transient,
                extra: object,
            }));
        }

        if KNOWN_KINDS.contains(&kind.as_str()) {
            return serde_json::from_value(value).map(Self::Ui);
        }

        Ok(Self::Unknown(value))
    }

    pub fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            Self::Ui(chunk) => serde_json::to_value(chunk),
            Self::Data(data) => {
                let mut object = data.extra.clone();
                object.insert("type".into(), format!("{DATA_TYPE_PREFIX}{}", data.name).into());
                if let Some(id) = &data.id {
                    object.insert("id".into(), id.clone().into());
                }
                object.insert("data".into(), data.data.clone());
                if let Some(transient) = data.transient {
                    object.insert("transient".into(), transient.into());
                }
                Ok(Value::Object(object))
            }
            Self::Unknown(value) => Ok(value.clone()),
        }
    }

    /// The wire `type` tag of this chunk.
    pub fn kind(&self) -> String {
        match self {
            Self::Data(data) => format!("{DATA_TYPE_PREFIX}{}", data.name),
            other => other
                .to_value()
                .ok()
                .and_then(|v| v.get("type").and_then(Value::as_str).map(str::to_owned))
                .unwrap_or_default(),
        }
    }

    /// Builds a `data-pcm-audio` chunk.
    pub fn pcm_audio(audio: &PcmAudioData) -> Result<Self, serde_json::Error> {
        Ok(Self::Data(DataChunk {
            name: PCM_AUDIO_DATA.to_owned(),
            id: None,
            data: serde_json::to_value(audio)?,
            transient: Some(true),
            extra: Extra::new(),
        }))
    }
}

impl From<UiChunk> for StreamChunk {
    fn from(chunk: UiChunk) -> Self {
        Self::Ui(chunk)
    }
}

impl Serialize for StreamChunk {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for StreamChunk {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}
