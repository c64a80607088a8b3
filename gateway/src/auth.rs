// Copyright 2025 Code Interpreter Gateway contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).

use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::Path;

use rand::distr::Alphanumeric;
use rand::Rng;
use sha2::{Digest, Sha256};

// 43 characters is the length of a urlsafe encoding of 32 random bytes.
const GENERATED_TOKEN_LEN: usize = 43;

///
/// Resolve the process-lifetime auth token: the `AUTH_TOKEN` environment
/// variable wins, else a previously persisted token file, else a fresh random
/// token written to the file with owner-only permissions.
///
pub fn load_or_create_token(token_file: &Path) -> Result<String, String> {
    if let Ok(token) = std::env::var("AUTH_TOKEN") {
        if !token.is_empty() {
            return Ok(token);
        }
    }

    if token_file.exists() {
        return std::fs::read_to_string(token_file)
            .map(|token| token.trim().to_owned())
            .map_err(|e| format!("Failed to read token file: {e}"));
    }

    let token: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(GENERATED_TOKEN_LEN)
        .map(char::from)
        .collect();
    let mut file = std::fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .mode(0o600)
        .open(token_file)
        .map_err(|e| format!("Failed to create token file: {e}"))?;
    file.write_all(token.as_bytes())
        .map_err(|e| format!("Failed to write token file: {e}"))?;
    Ok(token)
}

///
/// Constant-time token comparison: both sides are hashed, and the digests are
/// folded rather than short-circuit compared, so the check's timing carries
/// no information about the expected token.
///
pub fn tokens_match(provided: &str, expected: &str) -> bool {
    let provided = Sha256::digest(provided.as_bytes());
    let expected = Sha256::digest(expected.as_bytes());
    provided
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b))
        == 0
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use super::{load_or_create_token, tokens_match};

    #[test]
    fn equal_tokens_match() {
        assert!(tokens_match("sekrit", "sekrit"));
    }

    #[test]
    fn unequal_tokens_do_not_match() {
        assert!(!tokens_match("sekrit", "sekrit2"));
        assert!(!tokens_match("", "sekrit"));
        assert!(!tokens_match("sekrit", ""));
    }

    #[test]
    fn generated_token_round_trips_with_owner_only_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let token_file = dir.path().join("auth_token.txt");

        let generated = load_or_create_token(&token_file).unwrap();
        assert_eq!(generated.len(), 43);

        let mode = std::fs::metadata(&token_file).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        // A second call reads the persisted token back.
        let reloaded = load_or_create_token(&token_file).unwrap();
        assert_eq!(generated, reloaded);
    }
}
