//! genai-relay: minimal streaming relay in front of Vertex AI Gemini.
//!
//! Accepts `POST /generate` with `{"query": "..."}`, forwards the query with a
//! fixed system instruction and generation settings, and streams the model's
//! text back as plain text while it is being generated.

pub mod config;
pub mod error;
pub mod genai;
pub mod server;
