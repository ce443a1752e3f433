//! token-relay: chat backend relaying LLM token streams to browser widgets.
//!
//! An inbound `{model?, messages: [{role, text}]}` payload is translated to
//! the configured provider's vocabulary, then either answered in one JSON
//! body or relayed chunk by chunk as Server-Sent Events, with ordering,
//! single-frame backpressure and cancellation handled by the relay.

pub mod backend;
pub mod config;
pub mod server;
pub mod translate;
