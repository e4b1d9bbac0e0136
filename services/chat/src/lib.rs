//! Terminal chat client and development backend for the chat relay.
//!
//! The `chat` binary drives a [`conversation::ChatSession`] from stdin; the
//! `mock-backend` binary serves [`router::create_router`] so the client can be
//! exercised without a real agent backend.

pub mod config;
pub mod conversation;
pub mod playback;
pub mod router;
pub mod state;
pub mod transcript;
pub mod ws;
