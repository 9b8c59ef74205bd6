// src/config/mod.rs

//! Job file loading and validation for corefarm.
//!
//! Responsibilities:
//! - Define the TOML-backed data model (`model.rs`).
//! - Load a job file from disk (`loader.rs`).
//! - Validate settings and DAG correctness (`validate.rs`).

pub mod loader;
pub mod model;
pub mod validate;

pub use loader::{load_and_validate, load_from_path};
pub use model::{
    AutoRecoverConfig, ConfigFile, ConfigSection, RawConfigFile, RawConfigSection, TaskConfig,
    TaskKindConfig, parse_duration,
};
