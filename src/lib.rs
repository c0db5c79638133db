//! Relay for a live emoji event stream.
//!
//! One upstream server-sent event stream is turned into several derived
//! views (raw frames, per-second counts, running totals, top-N) and pushed
//! to subscribers over server-sent events.

pub mod config;
pub mod export;
pub mod pipeline;
pub mod server;
pub mod source;
