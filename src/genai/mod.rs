//! Client side of the hosted generation API.
//!
//! - [`client`]: [`client::GenerativeModel`] trait and the Vertex AI implementation
//! - [`auth`]: Bearer-token sources
//! - [`sse`]: Server-sent-events decoder
//! - [`types`]: Gemini wire types

pub mod auth;
pub mod client;
pub mod sse;
pub mod types;
