//! HTTP server relaying generated text to chat widgets.
//!
//! - [`api`]: Route handlers and application state
//! - [`relay`]: The streaming relay state machine
//! - [`sink`]: Client connection abstraction and its axum implementation
//! - [`encoder`]: Wire framing for relay output
//! - [`metrics`]: Prometheus counters

pub mod api;
pub mod encoder;
pub mod metrics;
pub mod relay;
pub mod sink;
