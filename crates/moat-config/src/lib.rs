//! Configuration parsing for moat
//!
//! This crate handles parsing of:
//! - Global configuration (`~/.config/moat/config.toml`)
//! - Per-agent run configuration (`moat.toml` in the workspace)

mod agent;
mod error;
mod global;

pub use agent::*;
pub use error::*;
pub use global::*;
