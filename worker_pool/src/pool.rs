// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::{watch, Mutex, Semaphore};
use uuid::Uuid;

use crate::worker::{Worker, WorkerHandle};
use crate::{PoolConfig, PoolError};

///
/// The seam between scheduling and provisioning. The production
/// implementation builds real disks and containers; tests inject a fake that
/// mints workers instantly, so the scheduler's behavior can be pinned down
/// without a container runtime.
///
#[async_trait]
pub trait Provision: Send + Sync + 'static {
    /// One-time startup work: stale-resource recovery and environment
    /// discovery.
    async fn prepare(&self) -> Result<(), PoolError>;
    /// Create one healthy worker, holding a creation-semaphore permit.
    async fn create(&self) -> Result<Worker, PoolError>;
    /// Tear one worker down. Never fails; the permit drops with the worker.
    async fn destroy(&self, worker: Worker);
}

#[derive(Default)]
struct PoolState {
    workers: HashMap<String, Worker>,
    user_to_worker: HashMap<Uuid, String>,
    idle: HashSet<String>,
    is_replenishing: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct PoolStatus {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub is_initializing: bool,
}

///
/// The scheduler: maps users to pre-warmed sandbox workers with session
/// affinity and at-most-one assignment.
///
/// All collection state lives behind one async mutex, and nothing slow ever
/// happens under it: worker creation, destruction, and all I/O run outside
/// the critical section. The hard cap on live workers is the creation
/// semaphore owned by the provisioner, whose permits travel inside each
/// `Worker`.
///
#[derive(Clone)]
pub struct WorkerPool {
    config: Arc<PoolConfig>,
    provisioner: Arc<dyn Provision>,
    state: Arc<Mutex<PoolState>>,
    file_op_semaphore: Arc<Semaphore>,
    // One-shot shutdown signal: flipped to true exactly once, never cleared.
    shutdown_tx: Arc<watch::Sender<bool>>,
    shutdown_rx: watch::Receiver<bool>,
    is_initializing: Arc<AtomicBool>,
}

impl WorkerPool {
    pub fn new(config: PoolConfig, provisioner: Arc<dyn Provision>) -> WorkerPool {
        // 3 transfer slots per possible worker, shared pool-wide so one greedy
        // batch cannot starve unrelated users.
        let file_op_slots = config.max_total_workers * 3;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        WorkerPool {
            config: Arc::new(config),
            provisioner,
            state: Arc::default(),
            file_op_semaphore: Arc::new(Semaphore::new(file_op_slots)),
            shutdown_tx: Arc::new(shutdown_tx),
            shutdown_rx,
            is_initializing: Arc::new(AtomicBool::new(true)),
        }
    }

    fn is_shutting_down(&self) -> bool {
        *self.shutdown_rx.borrow()
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// The pool-wide bound on concurrent file transfers, shared with every
    /// per-worker `SandboxFs`.
    pub fn file_op_semaphore(&self) -> Arc<Semaphore> {
        Arc::clone(&self.file_op_semaphore)
    }

    ///
    /// Recover stale resources, then pre-warm the idle pool. Must complete
    /// before the gateway starts serving.
    ///
    pub async fn init(&self) -> Result<(), PoolError> {
        log::info!("Initializing worker pool...");
        self.provisioner.prepare().await?;
        self.replenish_now().await;
        self.is_initializing.store(false, Ordering::SeqCst);
        log::info!(
            "Worker pool initialized. Idle workers: {}",
            self.idle_count().await
        );
        Ok(())
    }

    ///
    /// Get a worker for a user: their existing one (session affinity), any
    /// idle one, or a freshly created one. Whatever branch is taken, a
    /// background replenish keeps the idle pool warm for the next caller.
    ///
    pub async fn acquire(&self, user_uuid: Uuid) -> Result<WorkerHandle, PoolError> {
        if self.is_shutting_down() {
            return Err(PoolError::ShuttingDown);
        }
        self.spawn_replenish();

        {
            let mut state = self.state.lock().await;
            if let Some(handle) = Self::bind_under_lock(&mut state, user_uuid) {
                return Ok(handle);
            }
        }

        log::info!("No idle workers. Creating a new one synchronously for user request.");
        // The creation itself runs on a detached task: if this request is
        // cancelled mid-provision, the finished worker still lands in the
        // idle set instead of being stranded half-built.
        let pool = self.clone();
        let created = tokio::spawn(async move {
            let worker = pool.provisioner.create().await?;
            if pool.is_shutting_down() {
                pool.provisioner.destroy(worker).await;
                return Err(PoolError::ShuttingDown);
            }
            let worker_id = worker.container_id.clone();
            let mut state = pool.state.lock().await;
            state.idle.insert(worker_id.clone());
            state.workers.insert(worker_id.clone(), worker);
            Ok(worker_id)
        });
        let created_id = created
            .await
            .map_err(|e| PoolError::Provision(format!("Worker creation task failed: {e}")))??;

        let mut state = self.state.lock().await;
        // Prefer the worker we just created, but a racing request may have
        // bound it already; any idle worker (or an existing binding for this
        // user) is just as good.
        if let Some(handle) = Self::bind_specific_under_lock(&mut state, user_uuid, &created_id) {
            return Ok(handle);
        }
        Self::bind_under_lock(&mut state, user_uuid).ok_or_else(|| {
            PoolError::Capacity("Worker was claimed before the request could bind it".to_owned())
        })
    }

    /// Affinity lookup, then idle pop, under the caller's lock.
    fn bind_under_lock(state: &mut PoolState, user_uuid: Uuid) -> Option<WorkerHandle> {
        if let Some(worker_id) = state.user_to_worker.get(&user_uuid).cloned() {
            let worker = state
                .workers
                .get_mut(&worker_id)
                .expect("user map entries always name live workers");
            worker.touch();
            log::info!(
                "Reusing existing worker {} for user {user_uuid}",
                worker.container_name
            );
            return Some(worker.handle());
        }
        let worker_id = state.idle.iter().next().cloned()?;
        Some(Self::bind_idle_under_lock(state, user_uuid, worker_id))
    }

    fn bind_specific_under_lock(
        state: &mut PoolState,
        user_uuid: Uuid,
        worker_id: &str,
    ) -> Option<WorkerHandle> {
        if state.user_to_worker.contains_key(&user_uuid) || !state.idle.contains(worker_id) {
            return None;
        }
        Some(Self::bind_idle_under_lock(
            state,
            user_uuid,
            worker_id.to_owned(),
        ))
    }

    fn bind_idle_under_lock(
        state: &mut PoolState,
        user_uuid: Uuid,
        worker_id: String,
    ) -> WorkerHandle {
        state.idle.remove(&worker_id);
        let worker = state
            .workers
            .get_mut(&worker_id)
            .expect("idle set entries always name live workers");
        worker.bind_to_user(user_uuid);
        state.user_to_worker.insert(user_uuid, worker_id);
        log::info!(
            "Assigned worker {} to user {user_uuid}",
            worker.container_name
        );
        worker.handle()
    }

    /// The user's current worker, if any. Counts as activity.
    pub async fn existing_handle(&self, user_uuid: Uuid) -> Option<WorkerHandle> {
        let mut state = self.state.lock().await;
        let worker_id = state.user_to_worker.get(&user_uuid).cloned()?;
        let worker = state
            .workers
            .get_mut(&worker_id)
            .expect("user map entries always name live workers");
        worker.touch();
        Some(worker.handle())
    }

    ///
    /// End a user's session: the worker is removed from all maps first, then
    /// destroyed outside the lock, then replaced by replenishment. Sessions
    /// never survive their worker.
    ///
    pub async fn release_user(&self, user_uuid: Uuid) -> Result<(), PoolError> {
        let worker = {
            let mut state = self.state.lock().await;
            let worker_id = state
                .user_to_worker
                .remove(&user_uuid)
                .ok_or(PoolError::NoSession)?;
            state.idle.remove(&worker_id);
            state
                .workers
                .remove(&worker_id)
                .expect("user map entries always name live workers")
        };
        log::info!(
            "Releasing worker {} from user {user_uuid}",
            worker.container_name
        );
        self.provisioner.destroy(worker).await;
        self.spawn_replenish();
        Ok(())
    }

    fn spawn_replenish(&self) {
        let pool = self.clone();
        tokio::spawn(async move { pool.replenish_now().await });
    }

    ///
    /// Top the idle pool back up to the configured minimum. Guarded by a
    /// flag (double-checked under the lock) so concurrent triggers collapse
    /// into one pass; creation happens outside the lock, concurrently.
    ///
    pub async fn replenish_now(&self) {
        if self.is_shutting_down() {
            return;
        }
        let needed = {
            let mut state = self.state.lock().await;
            if state.is_replenishing {
                return;
            }
            let needed = self
                .config
                .min_idle_workers
                .saturating_sub(state.idle.len());
            if needed == 0 {
                return;
            }
            state.is_replenishing = true;
            needed
        };
        log::info!("Replenishing idle pool. Need to create {needed} worker(s).");

        let results = join_all((0..needed).map(|_| self.provisioner.create())).await;

        let mut orphans: Vec<Worker> = Vec::new();
        {
            let mut state = self.state.lock().await;
            for result in results {
                match result {
                    Ok(worker) => {
                        if self.is_shutting_down() {
                            // Shutdown won the race; this worker missed its
                            // snapshot and must be torn down here.
                            orphans.push(worker);
                        } else {
                            state.idle.insert(worker.container_id.clone());
                            state.workers.insert(worker.container_id.clone(), worker);
                        }
                    }
                    Err(e) => log::error!("Failed to create worker during replenishment: {e}"),
                }
            }
            state.is_replenishing = false;
        }
        join_all(orphans.into_iter().map(|w| self.provisioner.destroy(w))).await;
    }

    ///
    /// One recycling pass: destroy every worker (idle or bound) whose
    /// last activity is older than the idle timeout.
    ///
    pub async fn recycle_timed_out(&self) {
        let expired: Vec<Worker> = {
            let mut state = self.state.lock().await;
            let expired_ids: Vec<String> = state
                .workers
                .iter()
                .filter(|(_, worker)| worker.is_timed_out(self.config.worker_idle_timeout))
                .map(|(worker_id, _)| worker_id.clone())
                .collect();
            expired_ids
                .into_iter()
                .filter_map(|worker_id| {
                    let worker = state.workers.remove(&worker_id)?;
                    if let Some(user_uuid) = worker.user_uuid {
                        state.user_to_worker.remove(&user_uuid);
                    }
                    state.idle.remove(&worker_id);
                    Some(worker)
                })
                .collect()
        };
        if expired.is_empty() {
            return;
        }
        for worker in &expired {
            log::warn!("Worker {} timed out.", worker.container_name);
        }
        join_all(
            expired
                .into_iter()
                .map(|worker| self.provisioner.destroy(worker)),
        )
        .await;
        self.spawn_replenish();
    }

    /// Background recycler loop; returns when the pool shuts down.
    pub async fn run_recycler(&self) {
        loop {
            let mut shutdown_rx = self.shutdown_rx.clone();
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|stop| *stop).await; } => {
                    log::info!("Idle worker recycling task stopped.");
                    return;
                }
                _ = tokio::time::sleep(self.config.recycling_interval) => {
                    self.recycle_timed_out().await;
                }
            }
        }
    }

    ///
    /// Stop admitting work and destroy every worker. New acquires fail
    /// immediately once the signal is flipped.
    ///
    pub async fn shutdown(&self) {
        log::info!("Shutting down worker pool...");
        let _ = self.shutdown_tx.send(true);
        let workers: Vec<Worker> = {
            let mut state = self.state.lock().await;
            state.user_to_worker.clear();
            state.idle.clear();
            state.workers.drain().map(|(_, worker)| worker).collect()
        };
        join_all(
            workers
                .into_iter()
                .map(|worker| self.provisioner.destroy(worker)),
        )
        .await;
        log::info!("Worker pool shutdown complete.");
    }

    pub async fn status(&self) -> PoolStatus {
        let state = self.state.lock().await;
        PoolStatus {
            total_workers: state.workers.len(),
            busy_workers: state.user_to_worker.len(),
            is_initializing: self.is_initializing.load(Ordering::SeqCst),
        }
    }

    pub async fn idle_count(&self) -> usize {
        self.state.lock().await.idle.len()
    }
}
