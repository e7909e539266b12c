//! HTTP server relaying model output as plain text.
//!
//! - [`api`]: Routes, shared state and request validation
//! - [`streaming`]: Chunk-to-body streaming

pub mod api;
pub mod streaming;
