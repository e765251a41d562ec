//! OpenAI-compatible wire types for the gateway surface.
//!
//! This crate intentionally does **not** depend on axum or any HTTP client.
//! It holds the request/response/chunk shapes plus SSE framing; IO layers
//! serialize at the boundary.

pub mod chat;
pub mod error;
pub mod images;
pub mod models;
pub mod sse;
