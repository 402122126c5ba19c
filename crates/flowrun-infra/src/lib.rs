//! Infrastructure layer for flowrun.
//!
//! Contains implementations of the ports defined in `flowrun-core`:
//! filesystem-backed run, definition and task stores, plus a subprocess
//! agent executor. Also loads `config.toml` from the data directory.

pub mod agent;
pub mod config;
pub mod filesystem;
