//! Harness - provider invocation and reliability infrastructure for the
//! cheval sidecar.
//!
//! This crate sits between the HTTP surface and the remote chat-completion
//! providers. It coordinates:
//! - Provider metadata (supported types, auth headers, URL resolution)
//! - Request translation to the OpenAI-compatible wire format and
//!   normalization of provider responses back into the canonical schema
//! - Classified retry with exponential backoff and jitter
//! - A per-provider connection-pool map
//! - The file-persisted per-provider circuit breaker
//! - The W3C Server-Sent Events decoder for streaming providers
//! - Cost enrichment and best-effort usage recording

pub mod circuit_breaker;
pub mod pool;
pub mod registry;
pub mod retry;
pub mod sse;
pub mod usage;
pub mod wire;
