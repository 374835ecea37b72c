//! RouterOS API client, the production [`crate::shaping::ShapingTarget`].
//!
//! Speaks the word-based API protocol over plain TCP. Requires the post-6.43
//! plaintext login; the old challenge-response scheme is not supported.

pub mod wire;

mod client;

pub use client::RouterOsClient;

/// Default RouterOS API port (non-TLS).
pub const API_PORT: u16 = 8728;
