//! Conversation state as seen by the UI layer.
//!
//! Messages carry an ordered list of typed parts. Tool invocations are encoded
//! on the wire as parts whose `type` is `tool-<name>` (or `dynamic-tool` with an
//! explicit `toolName`), so parts are (de)serialized by hand through
//! `serde_json::Value` rather than with a derived tagged enum.

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

/// Author of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One message of the conversation, with its parts in render order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UiMessage {
    pub id: String,
    pub role: Role,
    #[serde(default)]
    pub parts: Vec<MessagePart>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

impl UiMessage {
    /// Creates a user message holding a single text part.
    pub fn user_text(id: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::User,
            parts: vec![MessagePart::Text { text: text.into() }],
            metadata: None,
        }
    }

    /// Creates an empty assistant message, to be filled from streamed chunks.
    pub fn assistant(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            role: Role::Assistant,
            parts: Vec::new(),
            metadata: None,
        }
    }

    /// Iterates over the tool invocations of this message.
    pub fn tool_parts(&self) -> impl Iterator<Item = &ToolPart> {
        self.parts.iter().filter_map(|part| match part {
            MessagePart::Tool(tool) => Some(tool),
            _ => None,
        })
    }

    pub fn tool_part_mut(&mut self, tool_call_id: &str) -> Option<&mut ToolPart> {
        self.parts.iter_mut().find_map(|part| match part {
            MessagePart::Tool(tool) if tool.tool_call_id == tool_call_id => Some(tool),
            _ => None,
        })
    }

    /// True when the message contains rendered, non-empty text.
    pub fn has_text(&self) -> bool {
        self.parts
            .iter()
            .any(|part| matches!(part, MessagePart::Text { text } if !text.is_empty()))
    }

    /// Concatenated text of all text parts.
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect()
    }
}

/// A typed part of a [`UiMessage`].
#[derive(Debug, Clone, PartialEq)]
pub enum MessagePart {
    Text { text: String },
    Reasoning { text: String },
    Tool(ToolPart),
    File { media_type: String, url: String },
    StepStart,
    /// Any part kind this crate does not model; kept verbatim.
    Other(Value),
}

/// Lifecycle of a tool invocation inside a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ToolState {
    InputStreaming,
    InputAvailable,
    ApprovalRequested,
    ApprovalResponded,
    OutputAvailable,
    OutputError,
    OutputDenied,
}

/// A human decision attached to a tool call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    /// `None` while the request is still waiting for a decision.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approved: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// A tool invocation part.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolPart {
    /// Tool name; derived from the `tool-<name>` type tag for static tools.
    #[serde(default, skip_serializing)]
    pub tool_name: String,
    #[serde(default, skip_serializing)]
    pub dynamic: bool,
    pub tool_call_id: String,
    pub state: ToolState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    /// `Some(Value::Null)` is an explicit `null` output, distinct from absent.
    #[serde(
        default,
        deserialize_with = "present_value",
        skip_serializing_if = "Option::is_none"
    )]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_executed: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub approval: Option<Approval>,
}

impl ToolPart {
    pub fn new(tool_name: impl Into<String>, tool_call_id: impl Into<String>, state: ToolState) -> Self {
        Self {
            tool_name: tool_name.into(),
            dynamic: false,
            tool_call_id: tool_call_id.into(),
            state,
            input: None,
            output: None,
            error_text: None,
            provider_executed: None,
            approval: None,
        }
    }

    /// A human has approved or denied this call.
    pub fn approval_resolved(&self) -> bool {
        self.approval.as_ref().is_some_and(|a| a.approved.is_some())
    }

    pub fn is_provider_executed(&self) -> bool {
        self.provider_executed == Some(true)
    }
}

fn present_value<'de, D>(deserializer: D) -> Result<Option<Value>, D::Error>
where
    D: Deserializer<'de>,
{
    Value::deserialize(deserializer).map(Some)
}

const TOOL_TYPE_PREFIX: &str = "tool-";
const DYNAMIC_TOOL_TYPE: &str = "dynamic-tool";

impl MessagePart {
    fn from_value(value: Value) -> Result<Self, serde_json::Error> {
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or_else(|| serde_json::Error::custom("message part is missing `type`"))?
            .to_owned();

        let string_field = |name: &str| -> Result<String, serde_json::Error> {
            value
                .get(name)
                .and_then(Value::as_str)
                .map(str::to_owned)
                .ok_or_else(|| serde_json::Error::custom(format!("`{kind}` part is missing `{name}`")))
        };

        match kind.as_str() {
            "text" => Ok(Self::Text { text: string_field("text")? }),
            "reasoning" => Ok(Self::Reasoning { text: string_field("text")? }),
            "file" => Ok(Self::File {
                media_type: string_field("mediaType")?,
                url: string_field("url")?,
            }),
            "step-start" => Ok(Self::StepStart),
            DYNAMIC_TOOL_TYPE => {
                let mut tool: ToolPart = serde_json::from_value(value.clone())?;
                tool.tool_name = string_field("toolName")?;
                tool.dynamic = true;
                Ok(Self::Tool(tool))
            }
            other => match other.strip_prefix(TOOL_TYPE_PREFIX) {
                Some(name) => {
                    let name = name.to_owned();
                    let mut tool: ToolPart = serde_json::from_value(value)?;
                    tool.tool_name = name;
                    Ok(Self::Tool(tool))
                }
                None => Ok(Self::Other(value)),
            },
        }
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        let mut object = Map::new();
        match self {
            Self::Text { text } => {
                object.insert("type".into(), "text".into());
                object.insert("text".into(), text.clone().into());
            }
            Self::Reasoning { text } => {
                object.insert("type".into(), "reasoning".into());
                object.insert("text".into(), text.clone().into());
            }
            Self::File { media_type, url } => {
                object.insert("type".into(), "file".into());
                object.insert("mediaType".into(), media_type.clone().into());
                object.insert("url".into(), url.clone().into());
            }
            Self::StepStart => {
                object.insert("type".into(), "step-start".into());
            }
            Self::Tool(tool) => {
                if let Value::Object(fields) = serde_json::to_value(tool)? {
                    object = fields;
                }
                if tool.dynamic {
                    object.insert("type".into(), DYNAMIC_TOOL_TYPE.into());
                    object.insert("toolName".into(), tool.tool_name.clone().into());
                } else {
                    object.insert(
                        "type".into(),
                        format!("{TOOL_TYPE_PREFIX}{}", tool.tool_name).into(),
                    );
                }
            }
            Self::Other(value) => return Ok(value.clone()),
        }
        Ok(Value::Object(object))
    }
}

impl Serialize for MessagePart {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.to_value()
            .map_err(serde::ser::Error::custom)?
            .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for MessagePart {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = Value::deserialize(deserializer)?;
        Self::from_value(value).map_err(D::Error::custom)
    }
}
