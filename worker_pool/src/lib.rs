// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

#![deny(warnings)]
// Enable all clippy lints except for many of the pedantic ones. It's a shame this needs to be copied and pasted across crates, but there doesn't appear to be a way to include inner attributes from a common source.
#![deny(
    clippy::all,
    clippy::default_trait_access,
    clippy::expl_impl_clone_on_copy,
    clippy::if_not_else,
    clippy::needless_continue,
    clippy::unseparated_literal_suffix,
    clippy::used_underscore_binding
)]
// It is often more clear to show that nothing is being moved.
#![allow(clippy::match_ref_pats)]
// Subjective style.
#![allow(
    clippy::len_without_is_empty,
    clippy::redundant_field_names,
    clippy::too_many_arguments
)]
// Default isn't as big a deal as people seem to think it is.
#![allow(clippy::new_without_default, clippy::new_ret_no_self)]

mod driver;
mod pool;
#[cfg(test)]
mod pool_tests;
mod worker;

pub use driver::{ContainerDriver, MANAGED_LABEL_KEY, MANAGED_LABEL_VALUE};
pub use pool::{PoolStatus, Provision, WorkerPool};
pub use worker::{
    DockerProvisioner, ExecutePayload, Worker, WorkerExecuteResult, WorkerHandle, WorkerStatus,
};

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Immutable pool configuration, fixed at init.
#[derive(Clone, Debug)]
pub struct PoolConfig {
    pub worker_image: String,
    pub internal_network: String,
    pub gateway_internal_ip: String,
    pub min_idle_workers: usize,
    pub max_total_workers: usize,
    pub worker_idle_timeout: Duration,
    pub recycling_interval: Duration,
    /// Per-execution bound, handed to each worker's kernel session. The
    /// gateway's own proxy timeout is derived from the same value with a
    /// margin, so the worker's verdict always arrives first.
    pub execution_timeout: Duration,
    pub worker_cpu: f64,
    pub worker_ram_mb: u64,
    pub worker_disk_mb: u64,
    pub vdisks_base_dir: PathBuf,
    pub worker_mounts_dir: PathBuf,
}

#[derive(Debug)]
pub enum PoolError {
    /// The pool is full, or waiting for a creation slot timed out.
    Capacity(String),
    /// Creating a worker failed after all retries.
    Provision(String),
    ShuttingDown,
    /// The user has no active worker.
    NoSession,
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PoolError::Capacity(msg) => write!(f, "{msg}"),
            PoolError::Provision(msg) => write!(f, "{msg}"),
            PoolError::ShuttingDown => write!(f, "Service is shutting down"),
            PoolError::NoSession => write!(f, "No active session found for user"),
        }
    }
}

impl std::error::Error for PoolError {}
