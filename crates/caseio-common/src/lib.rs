//! caseio Common - Shared types and utilities
//!
//! This crate provides the types, error definitions and configuration
//! shared by the communication and storage layers of caseio.

pub mod config;
pub mod error;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use types::*;
