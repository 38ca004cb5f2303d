//! # Ritmo Core
//!
//! Shared vocabulary for the follow-up cadence engine: quote and event
//! types, the error type, TOML configuration, and the narrow traits through
//! which the engine talks to the surrounding application.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::RitmoConfig;
pub use error::{Result, RitmoError};
