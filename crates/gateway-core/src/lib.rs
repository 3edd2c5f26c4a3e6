//! Core primitives for the MCP policy gateway.
//!
//! Kept free of runtime dependencies so the same rules can be shared by the
//! gateway binary, admin tooling and tests:
//!
//! - [`permission`]: permission-string constants and wildcard matching
//! - [`credential`]: API-key structure (`<prefix>_<env>_<secret>`) parsing

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod credential;
pub mod permission;

pub use credential::{ApiKeyParts, CredentialError, KeyEnvironment};
pub use permission::{grants, grants_any};
