// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::sync::LazyLock;

use regex::Regex;
use serde_derive::{Deserialize, Serialize};
use uuid::Uuid;

/// 200 MiB: large enough that user code can embed file payloads inline.
pub const MAX_CODE_BYTES: usize = 209_715_200;
pub const MAX_FILES_PER_REQUEST: usize = 100;

static SANDBOX_PATH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^/sandbox(/[\w\-]+(\.[\w\-]+)*)*/?$").unwrap());
static FILE_NAME_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^[\w\-.]+$").unwrap());

#[derive(Debug, Deserialize)]
pub struct UserParam {
    pub user_uuid: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct ExecuteRequest {
    pub code: String,
}

#[derive(Debug, Serialize)]
pub struct ExecuteResponse {
    pub result_text: Option<String>,
    pub result_base64: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileUploadItem {
    pub path: String,
    pub name: String,
    pub download_url: String,
}

#[derive(Debug, Deserialize)]
pub struct FileUploadRequest {
    pub files: Vec<FileUploadItem>,
}

#[derive(Debug, Serialize)]
pub struct UploadResultItem {
    pub full_path: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct FileUploadResponse {
    pub success: bool,
    pub results: Vec<UploadResultItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileExportItem {
    pub path: String,
    pub name: String,
    pub upload_url: String,
}

#[derive(Debug, Deserialize)]
pub struct FileExportRequest {
    pub files: Vec<FileExportItem>,
}

#[derive(Debug, Serialize)]
pub struct ExportResultItem {
    pub path: String,
    pub name: String,
    pub size: u64,
}

#[derive(Debug, Serialize)]
pub struct FileExportResponse {
    pub success: bool,
    pub results: Vec<ExportResultItem>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct FileRefItem {
    pub path: String,
    pub name: String,
}

#[derive(Debug, Deserialize)]
pub struct FileDeleteRequest {
    pub files: Vec<FileRefItem>,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub total_workers: usize,
    pub busy_workers: usize,
    pub is_initializing: bool,
}

/// Schema-level validation; violations map to 422.
pub fn validate_execute(request: &ExecuteRequest) -> Result<(), String> {
    if request.code.len() > MAX_CODE_BYTES {
        return Err(format!(
            "`code` exceeds the maximum size of {MAX_CODE_BYTES} bytes"
        ));
    }
    Ok(())
}

pub fn validate_file_count(count: usize) -> Result<(), String> {
    if count == 0 {
        return Err("`files` must contain at least one item".to_owned());
    }
    if count > MAX_FILES_PER_REQUEST {
        return Err(format!(
            "`files` may contain at most {MAX_FILES_PER_REQUEST} items"
        ));
    }
    Ok(())
}

pub fn validate_file_ref(path: &str, name: &str) -> Result<(), String> {
    if !SANDBOX_PATH_RE.is_match(path) {
        return Err(format!("`path` is not a valid sandbox path: {path:?}"));
    }
    // The name pattern allows dots, so a literal parent-dir reference has to
    // be refused separately.
    if !FILE_NAME_RE.is_match(name) || name.contains("..") {
        return Err(format!("`name` is not a valid file name: {name:?}"));
    }
    Ok(())
}

pub fn validate_uploads(request: &FileUploadRequest) -> Result<(), String> {
    validate_file_count(request.files.len())?;
    for item in &request.files {
        validate_file_ref(&item.path, &item.name)?;
    }
    Ok(())
}

pub fn validate_exports(request: &FileExportRequest) -> Result<(), String> {
    validate_file_count(request.files.len())?;
    for item in &request.files {
        validate_file_ref(&item.path, &item.name)?;
    }
    Ok(())
}

pub fn validate_deletes(request: &FileDeleteRequest) -> Result<(), String> {
    validate_file_count(request.files.len())?;
    for item in &request.files {
        validate_file_ref(&item.path, &item.name)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{
        validate_execute, validate_file_count, validate_file_ref, ExecuteRequest, MAX_CODE_BYTES,
        MAX_FILES_PER_REQUEST,
    };

    #[test]
    fn code_size_boundary() {
        let at_limit = ExecuteRequest {
            code: "a".repeat(MAX_CODE_BYTES),
        };
        assert!(validate_execute(&at_limit).is_ok());
        let over = ExecuteRequest {
            code: "a".repeat(MAX_CODE_BYTES + 1),
        };
        assert!(validate_execute(&over).is_err());
    }

    #[test]
    fn file_count_boundaries() {
        assert!(validate_file_count(0).is_err());
        assert!(validate_file_count(1).is_ok());
        assert!(validate_file_count(MAX_FILES_PER_REQUEST).is_ok());
        assert!(validate_file_count(MAX_FILES_PER_REQUEST + 1).is_err());
    }

    #[test]
    fn valid_paths_and_names() {
        for (path, name) in [
            ("/sandbox", "a.txt"),
            ("/sandbox/", "a.txt"),
            ("/sandbox/data", "input.csv"),
            ("/sandbox/data/sub-dir", "archive.tar.gz"),
            ("/sandbox/v1.2", "file_name-ok.bin"),
        ] {
            assert!(validate_file_ref(path, name).is_ok(), "{path} {name}");
        }
    }

    #[test]
    fn traversal_and_separator_rejections() {
        for (path, name) in [
            ("/sandbox/../etc", "passwd"),
            ("/etc", "passwd"),
            ("/sandbox", "../../etc/passwd"),
            ("/sandbox", "a/b.txt"),
            ("/sandbox", "a\\b.txt"),
            ("/sandbox", ".."),
            ("/sandbox//double", "a.txt"),
            ("sandbox", "a.txt"),
            ("/sandboxx", "a.txt"),
            ("/sandbox/spa ce", "a.txt"),
            ("/sandbox", "spa ce.txt"),
            ("/sandbox", ""),
        ] {
            assert!(validate_file_ref(path, name).is_err(), "{path} {name}");
        }
    }
}
