//! tabscore common library
//!
//! This crate contains shared code used across tabscore components.

pub mod config;
pub mod error;
pub mod metrics;

// Re-export commonly used types
pub use config::ScoringConfig;
pub use error::{Result, ScoringError};
pub use metrics::{LatencyTimer, MetricsRegistry, METRICS};
