//! `AROT` Core Library
//!
//! Shared functionality for `AROT` components:
//! - Configuration resolution and hierarchy
//! - Engine (sing-box) configuration document generation
//! - Tunnel mode selection
//! - Common error types

pub mod config;
pub mod engine_config;
pub mod error;
pub mod mode;
pub mod tracing_init;

pub use config::Config;
pub use engine_config::{EngineConfigBuilder, EngineDocument};
pub use error::{Error, Result};
pub use mode::TunnelMode;
