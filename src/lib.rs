//! Rust client for the FishFish domain and URL reputation service.
//!
//! The crate is organized by transport surface:
//! - `api`: HTTP client, token exchange, and the authenticated REST front.
//! - `session`: session credentials and coalesced renewal.
//! - `stream`: realtime websocket client, event decoding, and dispatch.
//! - `retry`: shared retry and timeout utilities.
//!
//! The crate emits `tracing` events and never installs a subscriber.

/// HTTP client, request/response mapping, and API errors.
pub mod api;
/// Retry and timeout helpers.
pub mod retry;
/// Session credential lifecycle.
pub mod session;
/// Realtime stream client, protocol types, and event dispatch.
pub mod stream;
