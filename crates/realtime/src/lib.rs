//! Client side of a bidirectional chat relay over one persistent WebSocket.
//!
//! The relay turns a conversation into a per-turn stream of UI chunks, plays
//! backend audio through an [`AudioSink`], and keeps the connection alive
//! between turns.

pub mod audio;
pub mod client;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod frame;

pub use audio::{AudioFormat, AudioSink, PlaybackChunk};
pub use client::{ChunkStream, ConnectionState, RelayClient, TurnSink};
pub use config::RelayConfig;
pub use error::{FrameError, RelayError, Result, SinkClosed};
pub use event::{AudioAction, ClientEvent};
pub use frame::{Frame, KeepAlive};
