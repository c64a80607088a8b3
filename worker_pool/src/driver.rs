// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use bollard::container::{
    Config, CreateContainerOptions, ListContainersOptions, RemoveContainerOptions,
};
use bollard::errors::Error as DockerError;
use bollard::secret::MountPointTypeEnum;
use bollard::service::{DeviceMapping, HostConfig};
use bollard::Docker;
use futures::future::join_all;
use maplit::hashmap;

use crate::PoolConfig;

/// Every container this gateway manages carries this label; stale discovery
/// lists by it and nothing else.
pub const MANAGED_LABEL_KEY: &str = "managed-by";
pub const MANAGED_LABEL_VALUE: &str = "code-interpreter-gateway";

/// The loop device's name inside the worker.
const DEVICE_PATH_IN_CONTAINER: &str = "/dev/vdisk";

///
/// Thin wrapper over the host container runtime. All policy (resource limits,
/// capabilities, device mapping, labels) for worker containers lives here.
///
#[derive(Clone)]
pub struct ContainerDriver {
    docker: Docker,
}

impl ContainerDriver {
    pub fn connect() -> Result<ContainerDriver, String> {
        let docker = Docker::connect_with_local_defaults()
            .map_err(|e| format!("Failed to connect to local Docker: {e}"))?;
        Ok(ContainerDriver { docker })
    }

    ///
    /// Create a worker container: read-only rootfs with small writable tmpfs
    /// mounts, the worker's loop device exposed as `/dev/vdisk`, the
    /// capabilities the in-container mount needs, resource limits, and the
    /// managed label used for stale discovery.
    ///
    pub async fn create_worker_container(
        &self,
        name: &str,
        config: &PoolConfig,
        loop_device: &str,
    ) -> Result<String, String> {
        let host_config = HostConfig {
            readonly_rootfs: Some(true),
            network_mode: Some(config.internal_network.clone()),
            memory: Some((config.worker_ram_mb * 1024 * 1024) as i64),
            nano_cpus: Some((config.worker_cpu * 1_000_000_000.0) as i64),
            cap_add: Some(vec![
                "SYS_ADMIN".to_owned(),
                "NET_ADMIN".to_owned(),
                "NET_RAW".to_owned(),
            ]),
            security_opt: Some(vec!["apparmor:unconfined".to_owned()]),
            devices: Some(vec![DeviceMapping {
                path_on_host: Some(loop_device.to_owned()),
                path_in_container: Some(DEVICE_PATH_IN_CONTAINER.to_owned()),
                cgroup_permissions: Some("rwm".to_owned()),
            }]),
            tmpfs: Some(hashmap! {
                "/tmp".to_owned() => "size=100m,exec".to_owned(),
                "/run".to_owned() => "size=50m".to_owned(),
            }),
            ..HostConfig::default()
        };

        let container_config = Config {
            image: Some(config.worker_image.clone()),
            env: Some(vec![
                format!("GATEWAY_INTERNAL_IP={}", config.gateway_internal_ip),
                format!("EXECUTION_TIMEOUT={}", config.execution_timeout.as_secs()),
            ]),
            labels: Some(hashmap! {
                MANAGED_LABEL_KEY.to_owned() => MANAGED_LABEL_VALUE.to_owned(),
            }),
            host_config: Some(host_config),
            ..Config::default()
        };

        log::trace!("creating worker container `{name}`: {container_config:?}");
        let created = self
            .docker
            .create_container(
                Some(CreateContainerOptions {
                    name,
                    platform: None,
                }),
                container_config,
            )
            .await
            .map_err(|e| format!("Failed to create worker container `{name}`: {e}"))?;
        Ok(created.id)
    }

    pub async fn start(&self, container_id: &str) -> Result<(), String> {
        self.docker
            .start_container::<String>(container_id, None)
            .await
            .map_err(|e| format!("Failed to start container `{container_id}`: {e}"))
    }

    /// Force-delete a container. A container that is already gone is fine.
    pub async fn remove(&self, container_id: &str) -> Result<(), String> {
        match self
            .docker
            .remove_container(
                container_id,
                Some(RemoveContainerOptions {
                    force: true,
                    ..RemoveContainerOptions::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(DockerError::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(format!("Failed to remove container `{container_id}`: {e}")),
        }
    }

    /// Delete every container carrying the managed label, whatever its state.
    pub async fn remove_stale_containers(&self) {
        let stale = match self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: true,
                filters: hashmap! {
                    "label".to_owned() =>
                        vec![format!("{MANAGED_LABEL_KEY}={MANAGED_LABEL_VALUE}")],
                },
                ..ListContainersOptions::default()
            }))
            .await
        {
            Ok(stale) => stale,
            Err(e) => {
                log::error!("Error listing stale containers: {e}");
                return;
            }
        };
        if stale.is_empty() {
            return;
        }
        log::warn!("Found {} stale worker containers. Cleaning up...", stale.len());
        let removals = stale.into_iter().filter_map(|summary| summary.id).map(|id| {
            let driver = self.clone();
            async move {
                if let Err(e) = driver.remove(&id).await {
                    log::error!("Stale container cleanup: {e}");
                }
            }
        });
        join_all(removals).await;
    }

    ///
    /// Discover the host-side path of the volume mounted at `destination` in
    /// our own container. Workers must be handed image files that live on the
    /// same backing store, and only the volume's host mountpoint identifies
    /// it from outside.
    ///
    pub async fn discover_volume_host_path(&self, destination: &str) -> Result<String, String> {
        let own_id = std::env::var("HOSTNAME")
            .map_err(|_| "HOSTNAME is not set; cannot inspect the gateway container".to_owned())?;
        let inspected = self
            .docker
            .inspect_container(&own_id, None)
            .await
            .map_err(|e| format!("Failed to inspect gateway container `{own_id}`: {e}"))?;

        let mounts = inspected.mounts.unwrap_or_default();
        let volume_name = mounts
            .iter()
            .find(|m| m.destination.as_deref() == Some(destination))
            .filter(|m| m.typ == Some(MountPointTypeEnum::VOLUME))
            .and_then(|m| m.name.clone())
            .ok_or_else(|| {
                format!("Could not find the named volume mount for {destination}")
            })?;

        let volume = self
            .docker
            .inspect_volume(&volume_name)
            .await
            .map_err(|e| format!("Failed to inspect volume `{volume_name}`: {e}"))?;
        log::info!(
            "Discovered host path for volume '{volume_name}': {}",
            volume.mountpoint
        );
        Ok(volume.mountpoint)
    }
}
