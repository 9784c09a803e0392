//! # SGDEA Core
//!
//! Shared building blocks for the records-management background jobs:
//! configuration, the error type, typed entity records and the repository
//! and delivery traits the job crates are written against.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::SgdeaConfig;
pub use error::{Result, SgdeaError};
