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

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;

static LOOP_DEVICE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/dev/loop\d+$").unwrap());

// `losetup -a` lines look like:
//   /dev/loop3: [64769]:131 (/virtual_disks/code-worker-ab12cd34ef56.img)
static LOSETUP_LISTING_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(/dev/loop\d+):.*\((.+)\)\s*$").unwrap());

#[derive(Debug)]
pub enum DiskError {
    /// A subprocess (`truncate`/`losetup`/`mkfs.ext4`/`mount`) failed.
    Subprocess(subproc::CommandFailure),
    /// An external tool returned something that violates our contract.
    Invariant(String),
    /// An operation was invoked out of lifecycle order.
    Precondition(String),
    /// A mount point failed the symlink check.
    Security(String),
    Io(String),
}

impl fmt::Display for DiskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiskError::Subprocess(failure) => write!(f, "{failure}"),
            DiskError::Invariant(msg) => write!(f, "Invariant violated: {msg}"),
            DiskError::Precondition(msg) => write!(f, "{msg}"),
            DiskError::Security(msg) => write!(f, "Refusing for security reasons: {msg}"),
            DiskError::Io(msg) => write!(f, "{msg}"),
        }
    }
}

impl std::error::Error for DiskError {}

impl From<subproc::CommandFailure> for DiskError {
    fn from(failure: subproc::CommandFailure) -> Self {
        DiskError::Subprocess(failure)
    }
}

///
/// The per-worker writable filesystem: a sparse image file attached to a loop
/// device, formatted ext4, and mounted both into the worker container (as
/// `/dev/vdisk`) and onto the gateway host for zero-copy file transfer.
///
/// The lifecycle is strictly create → attach_loop → format → mount_to_host →
/// destroy, and `destroy` is the single cleanup path: it is idempotent, safe
/// to call with the disk in any intermediate state, and never fails.
///
pub struct VirtualDisk {
    container_name: String,
    vdisks_base_dir: PathBuf,
    worker_mounts_dir: PathBuf,
    size_mb: u64,
    loop_device: Option<String>,
    host_mount_point: Option<PathBuf>,
}

impl VirtualDisk {
    pub fn new(
        container_name: &str,
        vdisks_base_dir: &Path,
        worker_mounts_dir: &Path,
        size_mb: u64,
    ) -> VirtualDisk {
        VirtualDisk {
            container_name: container_name.to_owned(),
            vdisks_base_dir: vdisks_base_dir.to_owned(),
            worker_mounts_dir: worker_mounts_dir.to_owned(),
            size_mb,
            loop_device: None,
            host_mount_point: None,
        }
    }

    /// Full path of the backing image file.
    pub fn image_path(&self) -> PathBuf {
        self.vdisks_base_dir
            .join(format!("{}.img", self.container_name))
    }

    /// Full path of the gateway-side mount point directory.
    pub fn mount_point_path(&self) -> PathBuf {
        self.worker_mounts_dir.join(&self.container_name)
    }

    pub fn loop_device(&self) -> Option<&str> {
        self.loop_device.as_deref()
    }

    pub fn host_mount_point(&self) -> Option<&Path> {
        self.host_mount_point.as_deref()
    }

    /// Allocate the sparse image file. Blocks are only materialized as the
    /// worker writes, so an idle pool stays cheap.
    pub async fn create(&self) -> Result<(), DiskError> {
        let image = self.image_path();
        log::info!("Creating virtual disk: {}", image.display());
        let image_str = path_str(&image)?;
        subproc::run(&["truncate", "-s", &format!("{}M", self.size_mb), image_str]).await?;
        Ok(())
    }

    /// Attach the image to a free loop device and record it.
    pub async fn attach_loop(&mut self) -> Result<String, DiskError> {
        let image = self.image_path();
        log::info!("Associating {} with a loop device...", image.display());
        let output = subproc::run(&["losetup", "--find", "--show", path_str(&image)?]).await?;
        let device = output.stdout_str().trim().to_owned();
        if !LOOP_DEVICE_RE.is_match(&device) {
            return Err(DiskError::Invariant(format!(
                "losetup returned an unexpected device path: {device:?}"
            )));
        }
        log::debug!(
            "Associated disk for {} with {}",
            self.container_name,
            device
        );
        self.loop_device = Some(device.clone());
        Ok(device)
    }

    /// Create an ext4 filesystem on the attached loop device.
    pub async fn format(&self) -> Result<(), DiskError> {
        let device = self.loop_device.as_deref().ok_or_else(|| {
            DiskError::Precondition("Cannot format: loop device not attached".to_owned())
        })?;
        log::info!("Formatting loop device {device}...");
        subproc::run(&["mkfs.ext4", "-F", device]).await?;
        Ok(())
    }

    /// Mount the loop device onto the gateway filesystem so uploads and
    /// exports can go through the kernel page cache instead of the container
    /// API.
    pub async fn mount_to_host(&mut self) -> Result<PathBuf, DiskError> {
        let device = self.loop_device.as_deref().ok_or_else(|| {
            DiskError::Precondition("Cannot mount: loop device not attached".to_owned())
        })?;
        let mount_point = self.mount_point_path();
        tokio::fs::create_dir_all(&mount_point)
            .await
            .map_err(|e| {
                DiskError::Io(format!(
                    "Failed to create mount point {}: {e}",
                    mount_point.display()
                ))
            })?;

        // A symlinked mount point would let a compromised gateway process be
        // redirected outside the mounts dir.
        let metadata = tokio::fs::symlink_metadata(&mount_point).await.map_err(|e| {
            DiskError::Io(format!(
                "Failed to stat mount point {}: {e}",
                mount_point.display()
            ))
        })?;
        if metadata.file_type().is_symlink() {
            return Err(DiskError::Security(format!(
                "mount point is a symlink: {}",
                mount_point.display()
            )));
        }

        subproc::run(&[
            "mount",
            "-o",
            "nosymfollow",
            device,
            path_str(&mount_point)?,
        ])
        .await?;
        log::info!("Mounted {} to {}", device, mount_point.display());
        self.host_mount_point = Some(mount_point.clone());
        Ok(mount_point)
    }

    /// Unified cleanup. Unmounts if mounted, detaches the loop device if
    /// attached, and deletes the image file. Every step is best-effort: a
    /// failure is logged and the remaining steps still run, so this is safe
    /// to call from any state, any number of times.
    pub async fn destroy(&mut self) {
        log::warn!("Destroying virtual disk for: {}", self.container_name);

        if let Some(mount_point) = self.host_mount_point.take() {
            if let Err(e) = subproc::run_unchecked(&["umount", &path_lossy(&mount_point)]).await {
                log::warn!("Unmount failed for {}: {e}", mount_point.display());
            }
            if let Err(e) = tokio::fs::remove_dir(&mount_point).await {
                log::warn!(
                    "Failed to remove mount point {}: {e}",
                    mount_point.display()
                );
            }
        }

        if let Some(device) = self.loop_device.take() {
            log::info!("Detaching loop device {device} for {}", self.container_name);
            if let Err(e) = subproc::run_unchecked(&["losetup", "-d", &device]).await {
                log::warn!("Detach failed for {device}: {e}");
            }
        }

        let image = self.image_path();
        match tokio::fs::remove_file(&image).await {
            Ok(()) => log::info!("Removed virtual disk file: {}", image.display()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => (),
            Err(e) => log::warn!("Failed to remove {}: {e}", image.display()),
        }
    }

    ///
    /// Recover from an unclean shutdown: unmount every directory under the
    /// mounts dir, detach every loop device whose backing file lives under the
    /// vdisks dir, then delete every `*.img` left behind. This is the only
    /// code that enumerates loop devices.
    ///
    pub async fn cleanup_stale(vdisks_base_dir: &Path, worker_mounts_dir: &Path) {
        log::info!("Cleaning up stale virtual disk resources...");

        if let Ok(mut entries) = tokio::fs::read_dir(worker_mounts_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let dir = entry.path();
                if !entry.file_type().await.map(|t| t.is_dir()).unwrap_or(false) {
                    continue;
                }
                log::warn!("Found stale mount point: {}. Cleaning up...", dir.display());
                if let Err(e) = subproc::run_unchecked(&["umount", &path_lossy(&dir)]).await {
                    log::warn!("Umount failed for {}: {e}", dir.display());
                }
                if let Err(e) = tokio::fs::remove_dir(&dir).await {
                    log::warn!("Failed to remove stale mount point {}: {e}", dir.display());
                }
            }
        }

        match subproc::run_unchecked(&["losetup", "-a"]).await {
            Ok(output) => {
                for device in
                    parse_losetup_listing(&output.stdout_str(), &path_lossy(vdisks_base_dir))
                {
                    log::warn!("Found orphaned loop device: {device}. Detaching...");
                    if let Err(e) = subproc::run_unchecked(&["losetup", "-d", &device]).await {
                        log::warn!("Failed to detach loop device {device}: {e}");
                    }
                }
            }
            Err(e) => log::warn!("Failed to list loop devices: {e}"),
        }

        if let Ok(mut entries) = tokio::fs::read_dir(vdisks_base_dir).await {
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.extension().map(|e| e == "img").unwrap_or(false) {
                    log::warn!("Found stale virtual disk file: {}. Removing...", path.display());
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        log::warn!("Failed to remove stale disk file {}: {e}", path.display());
                    }
                }
            }
        }
    }
}

/// Extract the loop devices in a `losetup -a` listing whose backing file lives
/// under `base_dir`. Lines that don't match the expected shape are skipped.
fn parse_losetup_listing(listing: &str, base_dir: &str) -> Vec<String> {
    let prefix = format!("{}/", base_dir.trim_end_matches('/'));
    listing
        .lines()
        .filter_map(|line| {
            let captures = LOSETUP_LISTING_RE.captures(line.trim_end())?;
            let backing_file = captures.get(2)?.as_str();
            // A deleted backing file is listed with a " (deleted)" suffix;
            // it still counts as ours.
            let backing_file = backing_file.trim_end_matches(" (deleted)");
            if backing_file.starts_with(&prefix) {
                Some(captures.get(1)?.as_str().to_owned())
            } else {
                None
            }
        })
        .collect()
}

fn path_str(path: &Path) -> Result<&str, DiskError> {
    path.to_str().ok_or_else(|| {
        DiskError::Io(format!(
            "Path contains non UTF-8 characters: {}",
            path.display()
        ))
    })
}

fn path_lossy(path: &Path) -> String {
    path.to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::{parse_losetup_listing, VirtualDisk, LOOP_DEVICE_RE};

    fn disk(name: &str) -> VirtualDisk {
        VirtualDisk::new(
            name,
            Path::new("/virtual_disks"),
            Path::new("/worker_mounts"),
            500,
        )
    }

    #[test]
    fn image_and_mount_paths() {
        let d = disk("code-worker-0a1b2c3d4e5f");
        assert_eq!(
            d.image_path(),
            Path::new("/virtual_disks/code-worker-0a1b2c3d4e5f.img")
        );
        assert_eq!(
            d.mount_point_path(),
            Path::new("/worker_mounts/code-worker-0a1b2c3d4e5f")
        );
    }

    #[test]
    fn loop_device_validation() {
        assert!(LOOP_DEVICE_RE.is_match("/dev/loop0"));
        assert!(LOOP_DEVICE_RE.is_match("/dev/loop117"));
        assert!(!LOOP_DEVICE_RE.is_match("/dev/loop"));
        assert!(!LOOP_DEVICE_RE.is_match("/dev/loop0p1"));
        assert!(!LOOP_DEVICE_RE.is_match("/dev/sda1"));
        assert!(!LOOP_DEVICE_RE.is_match("  /dev/loop3"));
        assert!(!LOOP_DEVICE_RE.is_match("/dev/loop3\nrm -rf /"));
    }

    #[test]
    fn losetup_listing_filters_by_backing_dir() {
        let listing = "\
/dev/loop0: [64769]:131 (/virtual_disks/code-worker-aaa.img)
/dev/loop1: [64769]:132 (/somewhere/else/other.img)
/dev/loop2: [64769]:133 (/virtual_disks/code-worker-bbb.img (deleted))
garbage line that should be ignored
/dev/loop9: [64769]:134 (/virtual_disks_other/evil.img)
";
        let devices = parse_losetup_listing(listing, "/virtual_disks");
        assert_eq!(devices, vec!["/dev/loop0", "/dev/loop2"]);
    }

    #[test]
    fn losetup_listing_empty_input() {
        assert!(parse_losetup_listing("", "/virtual_disks").is_empty());
    }

    #[tokio::test]
    async fn destroy_is_idempotent_without_resources() {
        // A disk that was never created has nothing to unmount or detach;
        // destroy must still complete quietly, twice.
        let tmp = tempfile::tempdir().unwrap();
        let mut d = VirtualDisk::new("code-worker-test", tmp.path(), tmp.path(), 16);
        d.destroy().await;
        d.destroy().await;
        assert!(d.loop_device().is_none());
        assert!(d.host_mount_point().is_none());
    }
}
