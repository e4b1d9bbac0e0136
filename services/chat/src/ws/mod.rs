//! Development backend speaking the relay wire protocol.
//!
//! - `protocol`: decodes client frames and keep-alive messages.
//! - `script`: builds the scripted reply frames for each turn.
//! - `session`: one WebSocket connection, from upgrade to close.

pub mod protocol;
pub mod script;
pub mod session;

pub use session::ws_handler;
