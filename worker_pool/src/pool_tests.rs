// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use uuid::Uuid;

use crate::pool::Provision;
use crate::worker::Worker;
use crate::{PoolConfig, PoolError, WorkerPool};

///
/// Mints workers instantly, under the same semaphore discipline as the real
/// provisioner but with a short acquire timeout so capacity tests don't wait
/// a minute.
///
struct FakeProvisioner {
    semaphore: Arc<Semaphore>,
    acquire_timeout: Duration,
    counter: AtomicUsize,
    fail_creates: AtomicBool,
    destroyed: Mutex<Vec<String>>,
}

impl FakeProvisioner {
    fn new(max_total: usize) -> FakeProvisioner {
        FakeProvisioner {
            semaphore: Arc::new(Semaphore::new(max_total)),
            acquire_timeout: Duration::from_millis(100),
            counter: AtomicUsize::new(0),
            fail_creates: AtomicBool::new(false),
            destroyed: Mutex::new(Vec::new()),
        }
    }

    fn destroyed(&self) -> Vec<String> {
        self.destroyed.lock().clone()
    }
}

#[async_trait]
impl Provision for FakeProvisioner {
    async fn prepare(&self) -> Result<(), PoolError> {
        Ok(())
    }

    async fn create(&self) -> Result<Worker, PoolError> {
        let permit = tokio::time::timeout(
            self.acquire_timeout,
            Arc::clone(&self.semaphore).acquire_owned(),
        )
        .await
        .map_err(|_| PoolError::Capacity("Timed out waiting for a worker slot".to_owned()))?
        .expect("Semaphore should not have been closed.");

        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(PoolError::Provision("fake provision failure".to_owned()));
        }

        let n = self.counter.fetch_add(1, Ordering::SeqCst);
        let name = format!("fake-worker-{n}");
        Ok(Worker::assemble(
            name.clone(),
            name.clone(),
            format!("http://{name}:8000"),
            None,
            PathBuf::from(format!("/worker_mounts/{name}")),
            permit,
        ))
    }

    async fn destroy(&self, worker: Worker) {
        self.destroyed.lock().push(worker.container_id.clone());
    }
}

fn config(min_idle: usize, max_total: usize) -> PoolConfig {
    PoolConfig {
        worker_image: "code-interpreter-worker:latest".to_owned(),
        internal_network: "workers_isolated_net".to_owned(),
        gateway_internal_ip: "172.28.0.2".to_owned(),
        min_idle_workers: min_idle,
        max_total_workers: max_total,
        worker_idle_timeout: Duration::from_secs(3600),
        recycling_interval: Duration::from_secs(300),
        execution_timeout: Duration::from_secs(120),
        worker_cpu: 1.0,
        worker_ram_mb: 1024,
        worker_disk_mb: 500,
        vdisks_base_dir: PathBuf::from("/virtual_disks"),
        worker_mounts_dir: PathBuf::from("/worker_mounts"),
    }
}

fn pool_with(min_idle: usize, max_total: usize) -> (WorkerPool, Arc<FakeProvisioner>) {
    let provisioner = Arc::new(FakeProvisioner::new(max_total));
    let pool = WorkerPool::new(config(min_idle, max_total), provisioner.clone());
    (pool, provisioner)
}

#[tokio::test]
async fn init_prewarms_to_min_idle() {
    let (pool, _) = pool_with(3, 10);
    pool.init().await.unwrap();
    assert_eq!(pool.idle_count().await, 3);
    let status = pool.status().await;
    assert_eq!(status.total_workers, 3);
    assert_eq!(status.busy_workers, 0);
    assert!(!status.is_initializing);
}

#[tokio::test]
async fn acquire_has_session_affinity() {
    let (pool, _) = pool_with(0, 10);
    pool.init().await.unwrap();
    let user = Uuid::new_v4();

    let first = pool.acquire(user).await.unwrap();
    let second = pool.acquire(user).await.unwrap();
    assert_eq!(first.container_id, second.container_id);
    assert_eq!(pool.status().await.total_workers, 1);
}

#[tokio::test]
async fn acquire_pops_idle_before_creating() {
    let (pool, _) = pool_with(2, 10);
    pool.init().await.unwrap();

    let handle = pool.acquire(Uuid::new_v4()).await.unwrap();
    let state = pool.status().await;
    // One of the two pre-warmed workers was bound; none were created for the
    // request itself.
    assert!(handle.container_name.starts_with("fake-worker-"));
    assert_eq!(state.total_workers, 2);
    assert_eq!(state.busy_workers, 1);
}

#[tokio::test]
async fn release_destroys_and_next_acquire_gets_a_fresh_worker() {
    let (pool, provisioner) = pool_with(0, 10);
    pool.init().await.unwrap();
    let user = Uuid::new_v4();

    let first = pool.acquire(user).await.unwrap();
    pool.release_user(user).await.unwrap();
    assert_eq!(provisioner.destroyed(), vec![first.container_id.clone()]);

    let second = pool.acquire(user).await.unwrap();
    assert_ne!(first.container_id, second.container_id);
}

#[tokio::test]
async fn release_of_unknown_user_is_no_session() {
    let (pool, _) = pool_with(0, 10);
    pool.init().await.unwrap();
    assert!(matches!(
        pool.release_user(Uuid::new_v4()).await,
        Err(PoolError::NoSession)
    ));
}

#[tokio::test]
async fn existing_handle_does_not_create() {
    let (pool, _) = pool_with(0, 10);
    pool.init().await.unwrap();
    let user = Uuid::new_v4();
    assert!(pool.existing_handle(user).await.is_none());

    pool.acquire(user).await.unwrap();
    assert!(pool.existing_handle(user).await.is_some());
}

#[tokio::test]
async fn max_total_bounds_simultaneous_workers() {
    let (pool, _) = pool_with(0, 2);
    pool.init().await.unwrap();

    let u1 = Uuid::new_v4();
    let u2 = Uuid::new_v4();
    pool.acquire(u1).await.unwrap();
    pool.acquire(u2).await.unwrap();

    // The pool is full: the third unique user times out on the creation
    // semaphore and surfaces a capacity error.
    let err = pool.acquire(Uuid::new_v4()).await.expect_err("expected capacity error");
    assert!(matches!(err, PoolError::Capacity(_)));
    assert_eq!(pool.status().await.total_workers, 2);

    // Releasing a worker frees its permit and the next user gets through.
    pool.release_user(u1).await.unwrap();
    pool.acquire(Uuid::new_v4()).await.unwrap();
    assert_eq!(pool.status().await.total_workers, 2);
}

#[tokio::test]
async fn replenish_tops_idle_back_up() {
    let (pool, _) = pool_with(2, 10);
    pool.init().await.unwrap();

    pool.acquire(Uuid::new_v4()).await.unwrap();
    assert_eq!(pool.idle_count().await, 1);

    pool.replenish_now().await;
    assert_eq!(pool.idle_count().await, 2);
    assert_eq!(pool.status().await.total_workers, 3);
}

#[tokio::test]
async fn replenish_failures_are_tolerated() {
    let (pool, provisioner) = pool_with(2, 10);
    provisioner.fail_creates.store(true, Ordering::SeqCst);
    pool.init().await.unwrap();
    assert_eq!(pool.idle_count().await, 0);

    // The guard flag must be cleared so a later pass can succeed.
    provisioner.fail_creates.store(false, Ordering::SeqCst);
    pool.replenish_now().await;
    assert_eq!(pool.idle_count().await, 2);
}

#[tokio::test]
async fn recycler_destroys_timed_out_workers_and_their_sessions() {
    let (pool, provisioner) = {
        let provisioner = Arc::new(FakeProvisioner::new(10));
        let mut config = config(0, 10);
        config.worker_idle_timeout = Duration::from_millis(0);
        (
            WorkerPool::new(config, provisioner.clone()),
            provisioner,
        )
    };
    pool.init().await.unwrap();
    let user = Uuid::new_v4();
    let handle = pool.acquire(user).await.unwrap();

    pool.recycle_timed_out().await;

    assert_eq!(provisioner.destroyed(), vec![handle.container_id]);
    let status = pool.status().await;
    assert_eq!(status.total_workers, 0);
    assert_eq!(status.busy_workers, 0);
    // The session died with the worker.
    assert!(pool.existing_handle(user).await.is_none());
}

#[tokio::test]
async fn fresh_workers_are_not_recycled() {
    let (pool, provisioner) = pool_with(1, 10);
    pool.init().await.unwrap();
    pool.recycle_timed_out().await;
    assert!(provisioner.destroyed().is_empty());
    assert_eq!(pool.status().await.total_workers, 1);
}

#[tokio::test]
async fn shutdown_destroys_everything_and_refuses_new_work() {
    let (pool, provisioner) = pool_with(2, 10);
    pool.init().await.unwrap();
    let user = Uuid::new_v4();
    pool.acquire(user).await.unwrap();

    pool.shutdown().await;

    assert_eq!(provisioner.destroyed().len(), 2);
    assert_eq!(pool.status().await.total_workers, 0);
    assert!(matches!(
        pool.acquire(Uuid::new_v4()).await,
        Err(PoolError::ShuttingDown)
    ));
}

#[tokio::test]
async fn idle_set_and_user_map_stay_disjoint() {
    let (pool, _) = pool_with(2, 10);
    pool.init().await.unwrap();
    let user = Uuid::new_v4();
    pool.acquire(user).await.unwrap();

    let status = pool.status().await;
    assert_eq!(status.busy_workers + pool.idle_count().await, status.total_workers);
}
