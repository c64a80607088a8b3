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
use std::process::Stdio;

use tokio::process::Command;

/// Captured output of a finished command.
#[derive(Debug)]
pub struct Output {
    pub status_code: i32,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl Output {
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).into_owned()
    }
}

/// A command that could not be spawned, or exited non-zero under `run`.
#[derive(Debug)]
pub struct CommandFailure {
    pub argv: Vec<String>,
    pub status_code: Option<i32>,
    pub stderr: String,
}

impl fmt::Display for CommandFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.status_code {
            Some(code) => write!(
                f,
                "Command `{}` failed with exit code {}: {}",
                self.argv.join(" "),
                code,
                self.stderr.trim_end()
            ),
            None => write!(
                f,
                "Failed to spawn command `{}`: {}",
                self.argv.join(" "),
                self.stderr.trim_end()
            ),
        }
    }
}

impl std::error::Error for CommandFailure {}

impl CommandFailure {
    fn spawn_error(argv: &[&str], err: std::io::Error) -> CommandFailure {
        CommandFailure {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            status_code: None,
            stderr: err.to_string(),
        }
    }
}

/// Run a command to completion, capturing stdout and stderr.
///
/// No shell is involved: argv is passed positionally to the kernel. A non-zero
/// exit status is an error carrying the decoded stderr.
pub async fn run(argv: &[&str]) -> Result<Output, CommandFailure> {
    let output = run_unchecked(argv).await?;
    if output.status_code != 0 {
        return Err(CommandFailure {
            argv: argv.iter().map(|a| a.to_string()).collect(),
            status_code: Some(output.status_code),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    Ok(output)
}

/// As `run`, but a non-zero exit status is returned to the caller rather than
/// converted into an error. Only spawn failures error.
pub async fn run_unchecked(argv: &[&str]) -> Result<Output, CommandFailure> {
    log::debug!("running: {argv:?}");
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| CommandFailure::spawn_error(argv, std::io::Error::other("empty argv")))?;
    let output = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| CommandFailure::spawn_error(argv, e))?;

    Ok(Output {
        // A missing code means the child died to a signal; fold that into a
        // generic failure code so callers only deal with integers.
        status_code: output.status.code().unwrap_or(-1),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::{run, run_unchecked};

    #[tokio::test]
    async fn captures_stdout() {
        let output = run(&["echo", "xyzzy"]).await.unwrap();
        assert_eq!(output.status_code, 0);
        assert_eq!(output.stdout_str(), "xyzzy\n");
    }

    #[tokio::test]
    async fn nonzero_exit_is_an_error() {
        let err = run(&["sh", "-c", "echo oops >&2; exit 3"])
            .await
            .expect_err("expected failure");
        assert_eq!(err.status_code, Some(3));
        assert!(err.stderr.contains("oops"));
        assert!(err.to_string().contains("exit code 3"));
    }

    #[tokio::test]
    async fn unchecked_reports_exit_code() {
        let output = run_unchecked(&["sh", "-c", "exit 7"]).await.unwrap();
        assert_eq!(output.status_code, 7);
    }

    #[tokio::test]
    async fn missing_binary_is_a_spawn_error() {
        let err = run(&["/definitely/not/a/binary"])
            .await
            .expect_err("expected failure");
        assert_eq!(err.status_code, None);
    }
}
