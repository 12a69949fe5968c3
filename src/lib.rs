//! Provision, launch, health-gate and query a local Lexe sidecar.
//!
//! The [`sidecar`] module holds the supervisor and its components. The
//! [`config`] module resolves a [`sidecar::SupervisorConfig`] from flags,
//! environment and an optional TOML file at the program boundary; [`cli`] is
//! the thin command-line front end built on top.

pub mod cli;
pub mod config;
pub mod error;
pub mod sidecar;

pub use error::ConfigError;
pub use sidecar::{Supervisor, SupervisorConfig, SupervisorError};
