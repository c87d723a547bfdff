//! High-level client that wraps the sans-IO session with a websocket driver.
//!
//! This module is the canonical reference for runtime behavior: the connect →
//! authenticate → act lifecycle, the reconnect loop, keepalive enforcement and
//! event delivery.
pub mod client;

pub use client::{ClientError, RemootioClient};
