//! MetaFed Common - Shared types and utilities
//!
//! This crate provides the error taxonomy, configuration surface, and
//! path utilities used across all MetaFed components.

pub mod config;
pub mod error;
pub mod path;

pub use config::Config;
pub use error::{Error, Result};
