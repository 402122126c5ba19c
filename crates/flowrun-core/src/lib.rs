//! Business logic and port definitions for flowrun.
//!
//! This crate defines the "ports" (run store, definition source, task source,
//! agent executor) that the infrastructure layer implements, plus the run
//! engine itself. It depends only on `flowrun-types` -- never on
//! `flowrun-infra` or any filesystem/process crate.

pub mod event;
pub mod repository;
pub mod service;
pub mod workflow;
