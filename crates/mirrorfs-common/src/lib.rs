//! MirrorFS Common - Shared types and utilities
//!
//! This crate provides the identifiers, target state model, error taxonomy
//! and configuration used across all MirrorFS components.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, ErrorCode, RemoteError, Result};
pub use types::*;
