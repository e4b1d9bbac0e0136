//! Shared types for the chat relay: the UI conversation model, the protocol
//! chunks streamed by the backend, and the auto-resubmit decision engine.

pub mod chunk;
pub mod message;
pub mod resubmit;

pub use chunk::{AudioSummary, DataChunk, FinishMetadata, PcmAudioData, StreamChunk, UiChunk};
pub use message::{Approval, MessagePart, Role, ToolPart, ToolState, UiMessage};
pub use resubmit::{ApprovalStateKey, ResubmitGuard, Verdict};
