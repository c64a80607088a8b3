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

mod ssrf;

pub use ssrf::guard_url;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use futures::future::join_all;
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio_util::io::ReaderStream;

/// The conventional writable root inside every worker container.
pub const SANDBOX_ROOT: &str = "/sandbox";

const FILE_TRANSFER_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Clone, Copy, Debug, Eq, PartialEq, PartialOrd, Ord)]
pub enum FsErrorKind {
    Download,
    Upload,
    Io,
    NotFound,
    Security,
    Path,
    // Highest precedence last: a batch's worst failure decides its HTTP
    // mapping, and an oversize file must win over a flaky download.
    TooLarge,
}

impl FsErrorKind {
    pub fn name(&self) -> &'static str {
        match self {
            FsErrorKind::Path => "PathError",
            FsErrorKind::TooLarge => "FileTooLargeError",
            FsErrorKind::Download => "FileDownloadError",
            FsErrorKind::Upload => "FileUploadError",
            FsErrorKind::NotFound => "FileNotFoundError",
            FsErrorKind::Security => "SecurityError",
            FsErrorKind::Io => "IoError",
        }
    }
}

#[derive(Debug)]
pub enum FsError {
    /// The requested path is not a strict descendant of `/sandbox`.
    Path(String),
    TooLarge { size: u64, limit: u64 },
    Download(String),
    Upload(String),
    NotFound(String),
    /// SSRF guard refusal. Deliberately does not echo the URL.
    Security(String),
    Io(String),
    /// Aggregate of a fan-out. Carries counts and the worst failure kind, but
    /// never the paths or URLs of the items involved.
    Batch {
        operation: &'static str,
        failed: usize,
        total: usize,
        first_error: &'static str,
        worst: FsErrorKind,
    },
}

impl FsError {
    pub fn kind(&self) -> FsErrorKind {
        match self {
            FsError::Path(_) => FsErrorKind::Path,
            FsError::TooLarge { .. } => FsErrorKind::TooLarge,
            FsError::Download(_) => FsErrorKind::Download,
            FsError::Upload(_) => FsErrorKind::Upload,
            FsError::NotFound(_) => FsErrorKind::NotFound,
            FsError::Security(_) => FsErrorKind::Security,
            FsError::Io(_) => FsErrorKind::Io,
            FsError::Batch { worst, .. } => *worst,
        }
    }
}

impl fmt::Display for FsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FsError::Path(msg) => write!(f, "{msg}"),
            FsError::TooLarge { size, limit } => {
                write!(f, "File of {size} bytes exceeds the {limit} byte limit")
            }
            FsError::Download(msg) => write!(f, "Download failed: {msg}"),
            FsError::Upload(msg) => write!(f, "Upload failed: {msg}"),
            FsError::NotFound(msg) => write!(f, "{msg}"),
            FsError::Security(msg) => write!(f, "{msg}"),
            FsError::Io(msg) => write!(f, "{msg}"),
            FsError::Batch {
                operation,
                failed,
                total,
                first_error,
                ..
            } => write!(
                f,
                "{operation} failed for {failed}/{total} file(s): {first_error}"
            ),
        }
    }
}

impl std::error::Error for FsError {}

/// A file to pull into the sandbox from a presigned URL.
#[derive(Clone, Debug)]
pub struct UploadItem {
    pub path: String,
    pub name: String,
    pub download_url: String,
}

/// A file to push out of the sandbox to a presigned URL.
#[derive(Clone, Debug)]
pub struct ExportItem {
    pub path: String,
    pub name: String,
    pub upload_url: String,
}

/// A bare (directory, filename) reference inside the sandbox.
#[derive(Clone, Debug)]
pub struct FileRef {
    pub path: String,
    pub name: String,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct UploadedFile {
    pub full_path: String,
    pub size: u64,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ExportedFile {
    pub path: String,
    pub name: String,
    pub size: u64,
}

///
/// A validated sandbox location: the normalized `/sandbox/...` path together
/// with its translation onto the gateway-side mount point of the worker that
/// owns it.
///
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SandboxPath {
    pub sandbox_path: String,
    pub local_path: PathBuf,
}

impl SandboxPath {
    ///
    /// Validate `(directory, filename)` and translate it to the gateway-local
    /// path by substituting `mount_point` for the `/sandbox` prefix.
    ///
    /// The filename may not contain path separators. The normalized path must
    /// be a strict descendant of `/sandbox`; `..` segments are resolved before
    /// the check so they cannot smuggle the path out. A directory whose last
    /// segment already equals the filename is treated as the parent directory,
    /// which forgives the common caller mistake of passing the full file path.
    ///
    pub fn compute(mount_point: &Path, directory: &str, filename: &str) -> Result<SandboxPath, FsError> {
        if filename.is_empty() || filename.contains('/') || filename.contains('\\') {
            return Err(FsError::Path(format!("Invalid filename: {filename:?}")));
        }

        let mut segments: Vec<&str> = Vec::new();
        if !directory.starts_with('/') {
            return Err(FsError::Path(
                "Sandbox paths must be absolute".to_owned(),
            ));
        }
        for segment in directory.split('/') {
            match segment {
                "" | "." => (),
                ".." => {
                    if segments.pop().is_none() {
                        return Err(FsError::Path("Path escapes sandbox boundary".to_owned()));
                    }
                }
                s => segments.push(s),
            }
        }

        if segments.last() == Some(&filename) {
            segments.pop();
        }

        if segments.first() != Some(&SANDBOX_ROOT.trim_start_matches('/')) {
            return Err(FsError::Path("Path escapes sandbox boundary".to_owned()));
        }

        segments.push(filename);
        let sandbox_path = format!("/{}", segments.join("/"));
        let relative = segments[1..].join("/");
        Ok(SandboxPath {
            sandbox_path,
            local_path: mount_point.join(relative),
        })
    }
}

///
/// Gateway-side file I/O into one worker's sandbox. Because the worker's
/// writable filesystem is also mounted on the gateway host, transfers never
/// go through the container API: the gateway reads and writes the files
/// directly through its own mount point.
///
/// Batch operations are bounded by a semaphore shared across the whole pool so
/// that one greedy batch cannot starve unrelated users.
///
#[derive(Clone)]
pub struct SandboxFs {
    mount_point: PathBuf,
    client: reqwest::Client,
    file_op_semaphore: Arc<Semaphore>,
    ssrf_protection: bool,
}

impl SandboxFs {
    pub fn new(
        mount_point: PathBuf,
        client: reqwest::Client,
        file_op_semaphore: Arc<Semaphore>,
        ssrf_protection: bool,
    ) -> SandboxFs {
        SandboxFs {
            mount_point,
            client,
            file_op_semaphore,
            ssrf_protection,
        }
    }

    pub fn compute_path(&self, directory: &str, filename: &str) -> Result<SandboxPath, FsError> {
        SandboxPath::compute(&self.mount_point, directory, filename)
    }

    ///
    /// Download one presigned URL into the sandbox: SSRF-guard the URL, stream
    /// the body into a temp file while enforcing the size limit, then rename
    /// into place so the worker never observes a half-written file.
    ///
    pub async fn upload_file(
        &self,
        item: &UploadItem,
        max_size_bytes: u64,
    ) -> Result<UploadedFile, FsError> {
        if self.ssrf_protection {
            ssrf::guard_url(&item.download_url).await?;
        }

        let target = self.compute_path(&item.path, &item.name)?;
        if let Some(parent) = target.local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FsError::Io(format!("Failed to create sandbox directory: {e}")))?;
        }

        let tmp_path = PathBuf::from(format!(
            "{}.{}.tmp",
            target.local_path.display(),
            &uuid::Uuid::new_v4().simple().to_string()[..12]
        ));

        let result = self
            .download_to(&item.download_url, &tmp_path, max_size_bytes)
            .await;
        let size = match result {
            Ok(size) => size,
            Err(e) => {
                match tokio::fs::remove_file(&tmp_path).await {
                    Ok(()) => log::debug!("Cleaned up temp file: {}", tmp_path.display()),
                    Err(re) if re.kind() == std::io::ErrorKind::NotFound => (),
                    Err(re) => {
                        log::error!("Failed to clean up temp file {}: {re}", tmp_path.display())
                    }
                }
                return Err(e);
            }
        };

        tokio::fs::rename(&tmp_path, &target.local_path)
            .await
            .map_err(|e| FsError::Io(format!("Failed to finalize upload: {e}")))?;

        log::debug!("Uploaded file ({size} bytes)");
        Ok(UploadedFile {
            full_path: target.sandbox_path,
            size,
        })
    }

    async fn download_to(
        &self,
        url: &str,
        tmp_path: &Path,
        max_size_bytes: u64,
    ) -> Result<u64, FsError> {
        // Redirects are disabled on this client, so a 3xx lands here as a
        // plain response; treating every non-2xx as a failure also closes the
        // redirect-to-internal-address hole.
        let response = self
            .client
            .get(url)
            .timeout(FILE_TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| FsError::Download(redacted_reqwest_error(e)))?;
        if !response.status().is_success() {
            return Err(FsError::Download(format!(
                "remote returned HTTP {}",
                response.status().as_u16()
            )));
        }

        if let Some(content_length) = response.content_length() {
            if content_length > max_size_bytes {
                return Err(FsError::TooLarge {
                    size: content_length,
                    limit: max_size_bytes,
                });
            }
        }

        let mut file = tokio::fs::File::create(tmp_path)
            .await
            .map_err(|e| FsError::Io(format!("Failed to create temp file: {e}")))?;
        let mut stream = response.bytes_stream();
        let mut total: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| FsError::Download(redacted_reqwest_error(e)))?;
            total += chunk.len() as u64;
            if total > max_size_bytes {
                return Err(FsError::TooLarge {
                    size: total,
                    limit: max_size_bytes,
                });
            }
            file.write_all(&chunk)
                .await
                .map_err(|e| FsError::Io(format!("Failed to write upload: {e}")))?;
        }
        file.flush()
            .await
            .map_err(|e| FsError::Io(format!("Failed to flush upload: {e}")))?;
        Ok(total)
    }

    ///
    /// Stream one sandbox file to a presigned URL. The file is never buffered
    /// wholly in memory.
    ///
    pub async fn export_file(&self, item: &ExportItem) -> Result<ExportedFile, FsError> {
        let source = self.compute_path(&item.path, &item.name)?;

        let metadata = tokio::fs::metadata(&source.local_path).await.map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                FsError::NotFound(format!("No such sandbox file: {}", source.sandbox_path))
            } else {
                FsError::Io(format!("Failed to stat sandbox file: {e}"))
            }
        })?;
        let size = metadata.len();

        let file = tokio::fs::File::open(&source.local_path)
            .await
            .map_err(|e| FsError::Io(format!("Failed to open sandbox file: {e}")))?;

        let response = self
            .client
            .put(&item.upload_url)
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .header(reqwest::header::CONTENT_LENGTH, size)
            .body(reqwest::Body::wrap_stream(ReaderStream::new(file)))
            .timeout(FILE_TRANSFER_TIMEOUT)
            .send()
            .await
            .map_err(|e| FsError::Upload(redacted_reqwest_error(e)))?;
        if !response.status().is_success() {
            return Err(FsError::Upload(format!(
                "remote returned HTTP {}",
                response.status().as_u16()
            )));
        }

        log::debug!("Exported file ({size} bytes)");
        Ok(ExportedFile {
            path: item.path.clone(),
            name: item.name.clone(),
            size,
        })
    }

    /// Remove one sandbox file. Removing a file that is already gone is fine.
    pub async fn delete_file(&self, item: &FileRef) -> Result<(), FsError> {
        let target = self.compute_path(&item.path, &item.name)?;
        match tokio::fs::remove_file(&target.local_path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(FsError::Io(format!("Failed to delete sandbox file: {e}"))),
        }
    }

    pub async fn upload_files(
        &self,
        items: &[UploadItem],
        max_size_bytes: u64,
    ) -> Result<Vec<UploadedFile>, FsError> {
        log::debug!("Uploading {} file(s)", items.len());
        let results = join_all(items.iter().map(|item| async move {
            let _permit = self
                .file_op_semaphore
                .acquire()
                .await
                .expect("Semaphore should not have been closed.");
            self.upload_file(item, max_size_bytes).await
        }))
        .await;
        aggregate_results("Upload", results)
    }

    pub async fn export_files(&self, items: &[ExportItem]) -> Result<Vec<ExportedFile>, FsError> {
        log::debug!("Exporting {} file(s)", items.len());
        let results = join_all(items.iter().map(|item| async move {
            let _permit = self
                .file_op_semaphore
                .acquire()
                .await
                .expect("Semaphore should not have been closed.");
            self.export_file(item).await
        }))
        .await;
        aggregate_results("Export", results)
    }

    pub async fn delete_files(&self, items: &[FileRef]) -> Result<(), FsError> {
        log::debug!("Deleting {} file(s)", items.len());
        let results = join_all(items.iter().map(|item| async move {
            let _permit = self
                .file_op_semaphore
                .acquire()
                .await
                .expect("Semaphore should not have been closed.");
            self.delete_file(item).await
        }))
        .await;
        aggregate_results("Delete", results).map(|_: Vec<()>| ())
    }
}

///
/// Collapse a fan-out into either all successes or a single aggregate error.
/// Individual failures are logged with detail here; the aggregate carries only
/// counts and kind names so paths and URLs never reach a response body.
///
fn aggregate_results<T>(
    operation: &'static str,
    results: Vec<Result<T, FsError>>,
) -> Result<Vec<T>, FsError> {
    let total = results.len();
    let mut successes = Vec::with_capacity(total);
    let mut failures: Vec<FsError> = Vec::new();
    for result in results {
        match result {
            Ok(value) => successes.push(value),
            Err(e) => failures.push(e),
        }
    }
    if failures.is_empty() {
        return Ok(successes);
    }
    for failure in &failures {
        log::error!("{operation} item failed: {failure}");
    }
    let worst = failures
        .iter()
        .map(|f| f.kind())
        .max()
        .expect("failures is non-empty");
    Err(FsError::Batch {
        operation,
        failed: failures.len(),
        total,
        first_error: failures[0].kind().name(),
        worst,
    })
}

/// reqwest errors render their URL; strip it so presigned URLs (which embed
/// signatures) cannot leak through an error response.
fn redacted_reqwest_error(err: reqwest::Error) -> String {
    let err = err.without_url();
    let mut message = err.to_string();
    let mut source = std::error::Error::source(&err);
    while let Some(cause) = source {
        message = format!("{message}: {cause}");
        source = cause.source();
    }
    message
}
