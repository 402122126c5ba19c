//! Shared domain types for flowrun.
//!
//! This crate contains the domain types used across the flowrun workflow
//! engine: workflow definitions, runs and run IDs, run events, engine
//! configuration, and the store error types.
//!
//! Zero infrastructure dependencies -- only serde (JSON and YAML), uuid,
//! chrono and thiserror.

pub mod config;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
