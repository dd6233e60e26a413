//! Transfers through the `s3am` helper.
//!
//! `s3am download` handles SSE-C decryption itself, with either a per-file
//! key derived from a master key or the key file used as is. Its exit status
//! only says that something went wrong; the last line of stderr is what gets
//! classified.

use std::path::Path;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::core::fetch::{Credentials, KeyMode, RemoteObject, TransferFailure, Transport};

/// Transport that spawns the `s3am` binary
#[derive(Debug, Clone)]
pub struct S3amTransport {
    /// Path to the helper binary (default: "s3am")
    binary_path: String,
}

impl Default for S3amTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl S3amTransport {
    pub fn new() -> Self {
        Self::with_binary_path("s3am")
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
        }
    }

    /// Arguments of one download invocation
    fn download_args(object: &RemoteObject, credentials: Option<&Credentials>, dest: &Path) -> Vec<String> {
        let mut args = vec![
            "download".to_string(),
            "--download-exists".to_string(),
            "resume".to_string(),
        ];
        if let Some(creds) = credentials {
            args.push("--sse-key-file".to_string());
            args.push(creds.key_file.display().to_string());
            if creds.mode == KeyMode::Master {
                args.push("--sse-key-is-master".to_string());
            }
        }
        args.push(object.s3_url());
        args.push(format!("file://{}", dest.display()));
        args
    }
}

/// Map the helper's final stderr line onto a transfer failure.
///
/// Only the last `": "`-separated segment is inspected, and only by prefix,
/// so digits elsewhere in a transient error's text do not classify it.
pub fn classify_stderr(stderr: &str) -> TransferFailure {
    let last = stderr
        .lines()
        .rev()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .unwrap_or("s3am failed without output")
        .to_string();
    let detail = last.rsplit(": ").next().unwrap_or_default().trim_start();

    if detail.starts_with("403") {
        TransferFailure::Status {
            status: 403,
            message: last,
        }
    } else if detail.starts_with("400") {
        TransferFailure::Status {
            status: 400,
            message: last,
        }
    } else if detail.starts_with("404") || detail.starts_with("NoSuchKey") {
        TransferFailure::Missing(last)
    } else if last.starts_with("AttributeError") && detail.starts_with("'NoneType'") {
        TransferFailure::Missing(last)
    } else {
        TransferFailure::Other(last)
    }
}

#[async_trait]
impl Transport for S3amTransport {
    fn name(&self) -> &str {
        "s3am"
    }

    async fn preflight(&self, _credentials: Option<&Credentials>) -> Result<(), TransferFailure> {
        let status = Command::new(&self.binary_path)
            .arg("--help")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await;
        match status {
            Ok(_) => Ok(()),
            Err(e) => Err(TransferFailure::ToolMissing(format!(
                "'{}' could not be started ({}); install s3am to fetch remote objects",
                self.binary_path, e
            ))),
        }
    }

    async fn download(
        &self,
        object: &RemoteObject,
        credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<(), TransferFailure> {
        let args = Self::download_args(object, credentials, dest);
        debug!(binary = %self.binary_path, ?args, "Spawning s3am");

        let output = Command::new(&self.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| TransferFailure::ToolMissing(format!("failed to run '{}': {}", self.binary_path, e)))?;

        if output.status.success() {
            return Ok(());
        }
        Err(classify_stderr(&String::from_utf8_lossy(&output.stderr)))
    }
}
