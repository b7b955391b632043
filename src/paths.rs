//! Centralized path resolution for hearth
//!
//! hearth is per-project: the socket, plan file and scratch directory all
//! resolve relative to the working directory unless overridden by HEARTH_*
//! env vars (see config.rs).

use std::path::PathBuf;
use crate::config::Config;

/// Get the supervisor socket path (.hearth.sock in the project root).
pub fn socket_path() -> PathBuf {
    Config::get().socket_path
}

/// Get the plan file path (hearth.json in the project root).
pub fn plan_path() -> PathBuf {
    Config::get().plan_path
}
