//! Core library for cheval - foundational types and policy-free plumbing
//! shared by the sidecar, the harness, and the one-shot CLI.
//!
//! This crate provides:
//! - The canonical request/result schemas that isolate providers from callers
//! - The `ChevalError` taxonomy with its wire envelope and exit-code mapping
//! - Config interpolation, deep merge, and redaction
//! - Integer micro-USD pricing math and the append-only cost ledger
//! - Phase-3 HMAC canonicalization and dual-secret verification
//! - Logging initialisation shared by the binaries

pub mod config;
pub mod error;
pub mod hmac;
pub mod ledger;
pub mod logging;
pub mod pricing;
pub mod types;

pub use error::{ChevalError, ErrorCode};
