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

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use gateway::routes::AppState;
use gateway::{auth, config, routes, Config};
use tokio::sync::Semaphore;
use worker_pool::{ContainerDriver, DockerProvisioner, WorkerPool};

const BIND_ADDR: &str = "0.0.0.0:8000";

fn fatal(message: String) -> ! {
    log::error!("FATAL: {message}");
    std::process::exit(1);
}

#[tokio::main]
async fn main() {
    env_logger::init();
    let config = Config::from_env();
    log::info!("Gateway starting with config: {config:?}");

    let auth_token = match auth::load_or_create_token(Path::new(config::TOKEN_FILE)) {
        Ok(token) => Arc::new(token),
        Err(e) => fatal(e),
    };

    let driver = match ContainerDriver::connect() {
        Ok(driver) => driver,
        Err(e) => fatal(e),
    };

    let worker_client = reqwest::Client::new();
    let transfer_client = match reqwest::Client::builder()
        .redirect(reqwest::redirect::Policy::none())
        .connect_timeout(Duration::from_secs(10))
        .build()
    {
        Ok(client) => client,
        Err(e) => fatal(format!("Failed to build transfer HTTP client: {e}")),
    };

    let pool_config = config.pool_config();
    let creation_semaphore = Arc::new(Semaphore::new(pool_config.max_total_workers));
    let provisioner = DockerProvisioner::new(
        Arc::new(pool_config.clone()),
        driver,
        worker_client.clone(),
        creation_semaphore,
    );
    let pool = WorkerPool::new(pool_config, Arc::new(provisioner));

    if let Err(e) = pool.init().await {
        fatal(format!("Worker pool initialization failed: {e}"));
    }

    let recycler = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.run_recycler().await })
    };

    let state = AppState {
        pool: pool.clone(),
        config: Arc::new(config),
        auth_token,
        worker_client,
        transfer_client,
    };
    let app = routes::router(state);

    let listener = match tokio::net::TcpListener::bind(BIND_ADDR).await {
        Ok(listener) => listener,
        Err(e) => fatal(format!("Could not bind {BIND_ADDR}: {e}")),
    };
    log::info!("Gateway listening on {BIND_ADDR}");

    let serve_result = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await;
    if let Err(e) = serve_result {
        log::error!("Server error: {e}");
    }

    log::info!("Shutting down. Cleaning up all worker containers...");
    pool.shutdown().await;
    recycler.abort();
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {e}");
    }
}
