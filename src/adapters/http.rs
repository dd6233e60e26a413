//! Anonymous HTTPS transfers.
//!
//! Fetches public objects over path-style HTTPS with `reqwest`. This
//! transport cannot decrypt SSE-C objects, so any transfer that comes with
//! credentials is refused during preflight.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::core::fetch::{Credentials, RemoteObject, TransferFailure, Transport};

/// Default per-request timeout
const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Transport backed by an HTTP client
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    pub fn new() -> Self {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());
        Self { client }
    }

    pub fn with_client(client: Client) -> Self {
        Self { client }
    }
}

fn request_failure(err: reqwest::Error) -> TransferFailure {
    if err.is_connect() || err.is_timeout() || err.is_request() || err.is_body() {
        TransferFailure::Connection(err.to_string())
    } else {
        TransferFailure::Other(err.to_string())
    }
}

fn write_failure(dest: &Path, err: std::io::Error) -> TransferFailure {
    TransferFailure::Other(format!("writing {}: {}", dest.display(), err))
}

#[async_trait]
impl Transport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    async fn preflight(&self, credentials: Option<&Credentials>) -> Result<(), TransferFailure> {
        match credentials {
            Some(_) => Err(TransferFailure::ToolMissing(
                "the http transport cannot decrypt objects; configure the s3am transport".into(),
            )),
            None => Ok(()),
        }
    }

    async fn download(
        &self,
        object: &RemoteObject,
        _credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<(), TransferFailure> {
        let url = object.https_url();
        debug!(%url, "GET");

        let mut response = self.client.get(&url).send().await.map_err(request_failure)?;
        let status = response.status();
        if !status.is_success() {
            let message = status.canonical_reason().unwrap_or("unexpected status").to_string();
            return Err(TransferFailure::Status {
                status: status.as_u16(),
                message,
            });
        }

        let mut file = File::create(dest).await.map_err(|e| write_failure(dest, e))?;
        while let Some(chunk) = response.chunk().await.map_err(request_failure)? {
            file.write_all(&chunk).await.map_err(|e| write_failure(dest, e))?;
        }
        file.flush().await.map_err(|e| write_failure(dest, e))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_preflight_refuses_credentials() {
        let transport = HttpTransport::new();
        assert_eq!(transport.name(), "http");
        assert!(transport.preflight(None).await.is_ok());

        let creds = Credentials::new("/keys/k", false);
        let result = transport.preflight(Some(&creds)).await;
        assert!(matches!(result, Err(TransferFailure::ToolMissing(_))));
    }
}
