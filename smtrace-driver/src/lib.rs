//! # smtrace-driver
//!
//! Runs smtrace analyses from files.
//!
//! This crate provides:
//! - YAML and environment configuration
//! - JSON lines readers for traces and kernel logs
//! - The load / replay / finalize / extract pipeline

pub mod analysis;
pub mod config;
pub mod error;
pub mod source;

pub use analysis::{analyze, run, AdaptiveSummary, Analysis};
pub use config::{AnalysisConfig, Config, ConfigError, InputConfig, OutputConfig, OutputFormat};
pub use error::DriverError;
