//! Bridge layer exposing the cheval pipeline over HTTP.
//!
//! This crate is the transport surface of the sidecar:
//! - [`auth`] - Phase-3 HMAC verification middleware with nonce admission
//! - [`nonce`] - the bounded LRU nonce cache behind replay protection
//! - [`api_error`] - the error envelopes returned at the HTTP boundary
//! - [`http_api`] - Axum router, shared state, and the four endpoints

pub mod api_error;
pub mod auth;
pub mod http_api;
pub mod nonce;
