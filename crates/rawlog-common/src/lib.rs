//! rawlog Common - Shared types and utilities
//!
//! This crate provides the error definitions, configuration and handle
//! types used by the rawlog storage engine and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::{EngineConfig, NameMarkers};
pub use error::{Error, Result};
pub use types::{LogHandle, LogType};
