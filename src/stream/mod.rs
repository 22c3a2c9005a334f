//! Realtime stream modules.
//!
//! - `client`: websocket connection lifecycle and the start handle.
//! - `dispatcher`: per-event-type handler registry and concurrent fan-out.
//! - `proto`: wire envelope and typed event payloads.

/// Websocket connection and stream handle.
pub mod client;
/// Event handler registry and fan-out.
pub mod dispatcher;
/// Stream protocol messages.
pub mod proto;
