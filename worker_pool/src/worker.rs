// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_derive::Deserialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;
use vdisk::VirtualDisk;

use crate::driver::ContainerDriver;
use crate::pool::Provision;
use crate::{PoolConfig, PoolError};

const MAX_CREATION_RETRIES: usize = 3;
const CREATION_RETRY_DELAY: Duration = Duration::from_secs(1);
const SEMAPHORE_ACQUIRE_TIMEOUT: Duration = Duration::from_secs(60);
const HEALTH_CHECK_TIMEOUT: Duration = Duration::from_secs(30);
const HEALTH_CHECK_POLL: Duration = Duration::from_millis(500);
const HEALTH_REQUEST_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum WorkerStatus {
    Creating,
    Idle,
    Busy,
    Error,
}

///
/// One live sandbox container together with the resources bound to it. Owned
/// exclusively by the pool; the rest of the gateway only ever sees
/// `WorkerHandle` views. The creation-semaphore permit lives here, so a
/// permit is released exactly when its worker is destroyed.
///
pub struct Worker {
    pub container_id: String,
    pub container_name: String,
    pub internal_url: String,
    pub status: WorkerStatus,
    pub user_uuid: Option<Uuid>,
    pub last_active: Instant,
    pub(crate) disk: Option<VirtualDisk>,
    pub(crate) mount_point: PathBuf,
    _permit: OwnedSemaphorePermit,
}

impl Worker {
    /// Assemble a worker from already-provisioned parts. Tests use this with
    /// synthetic parts; `DockerProvisioner` with real ones.
    pub fn assemble(
        container_id: String,
        container_name: String,
        internal_url: String,
        disk: Option<VirtualDisk>,
        mount_point: PathBuf,
        permit: OwnedSemaphorePermit,
    ) -> Worker {
        Worker {
            container_id,
            container_name,
            internal_url,
            status: WorkerStatus::Idle,
            user_uuid: None,
            last_active: Instant::now(),
            disk,
            mount_point,
            _permit: permit,
        }
    }

    pub fn bind_to_user(&mut self, user_uuid: Uuid) {
        self.status = WorkerStatus::Busy;
        self.user_uuid = Some(user_uuid);
        self.touch();
    }

    pub fn touch(&mut self) {
        self.last_active = Instant::now();
    }

    pub fn is_timed_out(&self, timeout: Duration) -> bool {
        self.last_active.elapsed() > timeout
    }

    pub fn handle(&self) -> WorkerHandle {
        WorkerHandle {
            container_id: self.container_id.clone(),
            container_name: self.container_name.clone(),
            internal_url: self.internal_url.clone(),
            mount_point: self.mount_point.clone(),
        }
    }
}

///
/// A cheap, immutable view of a worker handed out by the pool. Holding a
/// handle confers no ownership: the pool may destroy the worker underneath
/// it, at which point requests through the handle fail and the caller goes
/// back to the pool.
///
#[derive(Clone, Debug)]
pub struct WorkerHandle {
    pub container_id: String,
    pub container_name: String,
    pub internal_url: String,
    pub mount_point: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
pub struct ExecutePayload {
    pub result_text: Option<String>,
    pub result_base64: Option<String>,
}

/// The worker's verbatim answer to one execute proxy call.
#[derive(Debug)]
pub struct WorkerExecuteResult {
    pub status: u16,
    pub payload: Option<ExecutePayload>,
    pub text: String,
}

impl WorkerHandle {
    ///
    /// Proxy one code submission to the worker. Transport-level failures are
    /// errors; HTTP-level failures come back as a `WorkerExecuteResult` for
    /// the gateway to map.
    ///
    pub async fn execute(
        &self,
        client: &reqwest::Client,
        code: &str,
        timeout: Duration,
    ) -> Result<WorkerExecuteResult, String> {
        log::debug!("Executing code on worker {}", self.container_name);
        let response = client
            .post(format!("{}/api/v1/kernel/execute", self.internal_url))
            .json(&serde_json::json!({ "code": code }))
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| format!("Failed to reach worker {}: {e}", self.container_name))?;

        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| format!("Failed to read worker response: {e}"))?;
        let payload = if status == 200 {
            serde_json::from_str(&text).ok()
        } else {
            None
        };
        Ok(WorkerExecuteResult {
            status,
            payload,
            text,
        })
    }

    /// Poll the worker's kernel health endpoint until it answers 200 or the
    /// deadline passes.
    pub async fn health_check(&self, client: &reqwest::Client, deadline: Duration) -> bool {
        health_check(client, &self.internal_url, &self.container_name, deadline).await
    }
}

async fn health_check(
    client: &reqwest::Client,
    internal_url: &str,
    container_name: &str,
    deadline: Duration,
) -> bool {
    let url = format!("{internal_url}/api/v1/kernel/health");
    let give_up_at = Instant::now() + deadline;
    while Instant::now() < give_up_at {
        let response = client.get(&url).timeout(HEALTH_REQUEST_TIMEOUT).send().await;
        if let Ok(response) = response {
            if response.status().as_u16() == 200 {
                log::debug!("Worker {container_name} passed health check.");
                return true;
            }
        }
        tokio::time::sleep(HEALTH_CHECK_POLL).await;
    }
    log::error!("Worker {container_name} failed health check after {deadline:?}.");
    false
}

///
/// The production provisioner: virtual disk + container + health gate, with
/// the full rollback chain on every failure path.
///
pub struct DockerProvisioner {
    config: Arc<PoolConfig>,
    driver: ContainerDriver,
    client: reqwest::Client,
    creation_semaphore: Arc<Semaphore>,
}

impl DockerProvisioner {
    pub fn new(
        config: Arc<PoolConfig>,
        driver: ContainerDriver,
        client: reqwest::Client,
        creation_semaphore: Arc<Semaphore>,
    ) -> DockerProvisioner {
        DockerProvisioner {
            config,
            driver,
            client,
            creation_semaphore,
        }
    }

    async fn acquire_slot(&self) -> Result<OwnedSemaphorePermit, PoolError> {
        match tokio::time::timeout(
            SEMAPHORE_ACQUIRE_TIMEOUT,
            Arc::clone(&self.creation_semaphore).acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(PoolError::ShuttingDown),
            Err(_) => Err(PoolError::Capacity(format!(
                "Timed out after {SEMAPHORE_ACQUIRE_TIMEOUT:?} waiting for a worker slot"
            ))),
        }
    }

    ///
    /// One creation attempt. On any failure the container (if it got created)
    /// is force-deleted, the disk chain is torn down by its own `destroy`,
    /// and the permit drops with this frame, so the rollback is identical for
    /// errors and for cancellation.
    ///
    async fn try_create(&self, permit: OwnedSemaphorePermit) -> Result<Worker, String> {
        let suffix = &Uuid::new_v4().simple().to_string()[..12];
        let container_name = format!("code-worker-{suffix}");
        let mut disk = VirtualDisk::new(
            &container_name,
            &self.config.vdisks_base_dir,
            &self.config.worker_mounts_dir,
            self.config.worker_disk_mb,
        );
        let mut created_container: Option<String> = None;

        match self
            .provision(&container_name, &mut disk, &mut created_container)
            .await
        {
            Ok((container_id, mount_point)) => {
                log::info!("Worker {container_name} created and healthy.");
                Ok(Worker::assemble(
                    container_id,
                    container_name.clone(),
                    format!("http://{container_name}:8000"),
                    Some(disk),
                    mount_point,
                    permit,
                ))
            }
            Err(e) => {
                if let Some(container_id) = created_container {
                    if let Err(re) = self.driver.remove(&container_id).await {
                        log::error!("Rollback (container): {re}");
                    }
                }
                disk.destroy().await;
                Err(e)
            }
        }
    }

    /// The ordered creation steps. Order matters: the disk chain must be
    /// complete before the container can map the loop device, and the
    /// gateway-side mount comes last so a health-check failure doesn't leave
    /// a mount behind.
    async fn provision(
        &self,
        container_name: &str,
        disk: &mut VirtualDisk,
        created_container: &mut Option<String>,
    ) -> Result<(String, PathBuf), String> {
        disk.create().await.map_err(|e| e.to_string())?;
        let loop_device = disk.attach_loop().await.map_err(|e| e.to_string())?;
        disk.format().await.map_err(|e| e.to_string())?;

        log::info!("Creating worker container: {container_name}");
        let container_id = self
            .driver
            .create_worker_container(container_name, &self.config, &loop_device)
            .await?;
        *created_container = Some(container_id.clone());
        self.driver.start(&container_id).await?;

        let internal_url = format!("http://{container_name}:8000");
        if !health_check(
            &self.client,
            &internal_url,
            container_name,
            HEALTH_CHECK_TIMEOUT,
        )
        .await
        {
            return Err("Worker failed health check after creation.".to_owned());
        }

        let mount_point = disk.mount_to_host().await.map_err(|e| e.to_string())?;
        Ok((container_id, mount_point))
    }
}

#[async_trait]
impl Provision for DockerProvisioner {
    async fn prepare(&self) -> Result<(), PoolError> {
        tokio::fs::create_dir_all(&self.config.vdisks_base_dir)
            .await
            .map_err(|e| PoolError::Provision(format!("Failed to create vdisks dir: {e}")))?;
        tokio::fs::create_dir_all(&self.config.worker_mounts_dir)
            .await
            .map_err(|e| PoolError::Provision(format!("Failed to create mounts dir: {e}")))?;

        let vdisks_dir = self.config.vdisks_base_dir.to_string_lossy();
        let host_path = self
            .driver
            .discover_volume_host_path(&vdisks_dir)
            .await
            .map_err(PoolError::Provision)?;
        log::info!("Worker image files are backed by host path {host_path}");

        self.driver.remove_stale_containers().await;
        VirtualDisk::cleanup_stale(&self.config.vdisks_base_dir, &self.config.worker_mounts_dir)
            .await;
        Ok(())
    }

    async fn create(&self) -> Result<Worker, PoolError> {
        let mut last_error = String::new();
        for attempt in 1..=MAX_CREATION_RETRIES {
            let permit = self.acquire_slot().await?;
            match self.try_create(permit).await {
                Ok(worker) => return Ok(worker),
                Err(e) => {
                    log::error!("Failed to create worker on attempt {attempt}: {e}");
                    last_error = e;
                    if attempt < MAX_CREATION_RETRIES {
                        log::warn!(
                            "Retrying worker creation ({attempt}/{MAX_CREATION_RETRIES})..."
                        );
                        tokio::time::sleep(CREATION_RETRY_DELAY).await;
                    }
                }
            }
        }
        Err(PoolError::Provision(format!(
            "Failed to create worker after {MAX_CREATION_RETRIES} attempts: {last_error}"
        )))
    }

    async fn destroy(&self, mut worker: Worker) {
        log::warn!("Destroying worker: {}", worker.container_name);
        if let Some(disk) = worker.disk.as_mut() {
            disk.destroy().await;
        }
        if let Err(e) = self.driver.remove(&worker.container_id).await {
            log::error!("Error deleting container {}: {e}", worker.container_name);
        }
        // The permit drops with the worker here, freeing its slot.
    }
}
