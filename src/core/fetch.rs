//! Remote artifact fetching.
//!
//! `RemoteFetcher` resolves a location reference (a local path, an
//! `s3://bucket/key` URL or an `https://s3.../bucket/key` URL) into an
//! artifact handle. Remote transfers go through a [`Transport`]; every
//! transport failure is classified before deciding whether to retry:
//!
//! | failure                         | outcome                       |
//! |---------------------------------|-------------------------------|
//! | helper tool missing             | `ToolingMissing`, no retry    |
//! | 401 / 403                       | `Authorization`, no retry     |
//! | 400                             | `BadRequest`, no retry        |
//! | 404 / object absent             | `NotFound`, no retry          |
//! | key required, none supplied     | `Credential`, no retry        |
//! | 5xx, timeouts, connection drops | transient, retried            |
//! | anything unrecognised           | transient, retried and logged |
//!
//! Bytes are only written to the artifact store after a transfer succeeds,
//! so an exhausted or rejected fetch never leaves a partial blob behind.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Url;
use thiserror::Error;
use tokio::fs;
use tracing::{debug, info, instrument, warn};

use super::context::RetryPolicy;
use super::store::{ArtifactStore, StoreError};
use crate::domain::ArtifactHandle;

/// Errors surfaced by [`RemoteFetcher`]
#[derive(Debug, Error)]
pub enum FetchError {
    #[error("invalid location reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    #[error("credential error for '{location}': {reason}")]
    Credential { location: String, reason: String },

    #[error("access denied (403 Forbidden) while fetching '{location}'; were the correct credentials used?")]
    Authorization { location: String },

    #[error("bad request (400) while fetching '{location}': {hint}")]
    BadRequest {
        location: String,
        hint: BadRequestHint,
    },

    #[error("'{location}' does not exist")]
    NotFound { location: String },

    #[error("gave up fetching '{location}' after {attempts} attempts: {last_error}")]
    TransferExhausted {
        location: String,
        attempts: u32,
        last_error: String,
    },

    #[error("transfer tooling missing: {0}")]
    ToolingMissing(String),

    #[error("I/O error while fetching '{location}': {source}")]
    Io {
        location: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Diagnostic attached to a 400 response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadRequestHint {
    /// No key was supplied; the object is probably encrypted
    EncryptedWithoutKey,
    /// A key was supplied; the object is probably not encrypted
    UnencryptedWithKey,
}

impl fmt::Display for BadRequestHint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BadRequestHint::EncryptedWithoutKey => {
                write!(f, "is this an encrypted object fetched without a key?")
            }
            BadRequestHint::UnencryptedWithKey => {
                write!(f, "is this an unencrypted object fetched with a key?")
            }
        }
    }
}

/// A parsed location reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocationRef {
    /// A file on the local filesystem
    Local(PathBuf),
    /// An object in a remote bucket
    Remote(RemoteObject),
}

/// Bucket/key address of a remote object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteObject {
    pub bucket: String,
    pub key: String,
    /// Host to use for HTTPS access
    pub host: String,
}

impl RemoteObject {
    /// Canonical `s3://bucket/key` form
    pub fn s3_url(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.key)
    }

    /// Path-style HTTPS URL
    pub fn https_url(&self) -> String {
        format!("https://{}/{}/{}", self.host, self.bucket, self.key)
    }

    /// Last path component of the key
    pub fn file_name(&self) -> &str {
        self.key.rsplit('/').next().unwrap_or(&self.key)
    }
}

const DEFAULT_S3_HOST: &str = "s3.amazonaws.com";

impl LocationRef {
    /// Parse a reference string
    pub fn parse(reference: &str) -> Result<Self, FetchError> {
        let invalid = |reason: &str| FetchError::InvalidReference {
            reference: reference.to_string(),
            reason: reason.to_string(),
        };

        let trimmed = reference.trim();
        if trimmed.is_empty() {
            return Err(invalid("empty reference"));
        }

        if !trimmed.contains("://") {
            let path = PathBuf::from(trimmed);
            if !path.is_file() {
                return Err(invalid("not a URL and no such local file"));
            }
            return Ok(LocationRef::Local(path));
        }

        let url = Url::parse(trimmed).map_err(|e| invalid(&e.to_string()))?;
        let (host, bucket, key) = match url.scheme() {
            "s3" => {
                let bucket = url.host_str().ok_or_else(|| invalid("missing bucket"))?;
                let key = url.path().trim_start_matches('/');
                (DEFAULT_S3_HOST.to_string(), bucket.to_string(), key.to_string())
            }
            "https" => {
                let host = url.host_str().unwrap_or_default();
                if !host.starts_with("s3") {
                    return Err(invalid("https references must point at an s3 host"));
                }
                let path = url.path().trim_start_matches('/');
                let (bucket, key) = path.split_once('/').unwrap_or((path, ""));
                (host.to_string(), bucket.to_string(), key.to_string())
            }
            other => return Err(invalid(&format!("unsupported scheme '{}'", other))),
        };

        if bucket.is_empty() || key.is_empty() || key.ends_with('/') {
            return Err(invalid("expected <bucket>/<key>"));
        }

        Ok(LocationRef::Remote(RemoteObject { bucket, key, host }))
    }

    /// Whether this reference names a remote object
    pub fn is_remote(&self) -> bool {
        matches!(self, LocationRef::Remote(_))
    }
}

/// How the encryption key file is applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyMode {
    /// The key file is the object's own key
    PerFile,
    /// The key file is a master key; each object's key is derived from it
    Master,
}

/// Decryption credentials for a transfer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub key_file: PathBuf,
    pub mode: KeyMode,
}

impl Credentials {
    pub fn new(key_file: impl Into<PathBuf>, key_is_master: bool) -> Self {
        Self {
            key_file: key_file.into(),
            mode: if key_is_master {
                KeyMode::Master
            } else {
                KeyMode::PerFile
            },
        }
    }
}

/// Raw failure reported by a transport, before classification
#[derive(Debug, Clone, Error)]
pub enum TransferFailure {
    #[error("required tool unavailable: {0}")]
    ToolMissing(String),

    #[error("service responded {status}: {message}")]
    Status { status: u16, message: String },

    #[error("object does not exist: {0}")]
    Missing(String),

    #[error("decryption key required: {0}")]
    KeyRequired(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("{0}")]
    Other(String),
}

/// Moves one remote object to a local file
#[async_trait]
pub trait Transport: Send + Sync {
    /// Human-readable transport name
    fn name(&self) -> &str;

    /// Verify the environment can perform transfers at all
    async fn preflight(&self, credentials: Option<&Credentials>) -> Result<(), TransferFailure>;

    /// Download `object` into `dest`
    async fn download(
        &self,
        object: &RemoteObject,
        credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<(), TransferFailure>;
}

/// Transport for runs that only read local files
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineTransport;

#[async_trait]
impl Transport for OfflineTransport {
    fn name(&self) -> &str {
        "offline"
    }

    async fn preflight(&self, _credentials: Option<&Credentials>) -> Result<(), TransferFailure> {
        Err(TransferFailure::ToolMissing(
            "no remote transport configured (offline mode)".into(),
        ))
    }

    async fn download(
        &self,
        object: &RemoteObject,
        _credentials: Option<&Credentials>,
        _dest: &Path,
    ) -> Result<(), TransferFailure> {
        Err(TransferFailure::ToolMissing(format!(
            "cannot download {} in offline mode",
            object.s3_url()
        )))
    }
}

/// Outcome of classifying a transfer failure
#[derive(Debug)]
pub enum Classification {
    /// Surface immediately
    Permanent(FetchError),
    /// Retry; `known` is false for failures no rule recognised
    Transient { reason: String, known: bool },
}

/// Map a raw transport failure onto the fetch error taxonomy
pub fn classify(location: &str, failure: TransferFailure, has_credentials: bool) -> Classification {
    let location = location.to_string();
    match failure {
        TransferFailure::ToolMissing(tool) => Classification::Permanent(FetchError::ToolingMissing(tool)),
        TransferFailure::Status { status: 401 | 403, .. } => {
            Classification::Permanent(FetchError::Authorization { location })
        }
        TransferFailure::Status { status: 400, .. } => Classification::Permanent(FetchError::BadRequest {
            location,
            hint: if has_credentials {
                BadRequestHint::UnencryptedWithKey
            } else {
                BadRequestHint::EncryptedWithoutKey
            },
        }),
        TransferFailure::Status { status: 404, .. } | TransferFailure::Missing(_) => {
            Classification::Permanent(FetchError::NotFound { location })
        }
        TransferFailure::KeyRequired(reason) if !has_credentials => {
            Classification::Permanent(FetchError::Credential { location, reason })
        }
        TransferFailure::KeyRequired(_) => Classification::Permanent(FetchError::BadRequest {
            location,
            hint: BadRequestHint::UnencryptedWithKey,
        }),
        failure @ TransferFailure::Status {
            status: 408 | 429 | 500..=599,
            ..
        } => Classification::Transient {
            reason: failure.to_string(),
            known: true,
        },
        failure @ TransferFailure::Connection(_) => Classification::Transient {
            reason: failure.to_string(),
            known: true,
        },
        failure => Classification::Transient {
            reason: failure.to_string(),
            known: false,
        },
    }
}

/// Resolves location references into stored artifacts
#[derive(Clone)]
pub struct RemoteFetcher {
    store: Arc<dyn ArtifactStore>,
    transport: Arc<dyn Transport>,
    retry_policy: RetryPolicy,
}

impl RemoteFetcher {
    pub fn new(
        store: Arc<dyn ArtifactStore>,
        transport: Arc<dyn Transport>,
        retry_policy: RetryPolicy,
    ) -> Self {
        Self {
            store,
            transport,
            retry_policy,
        }
    }

    /// Fetch a reference and persist it in the artifact store
    #[instrument(skip(self, credentials), fields(transport = %self.transport.name()))]
    pub async fn fetch(
        &self,
        reference: &str,
        credentials: Option<&Credentials>,
    ) -> Result<ArtifactHandle, FetchError> {
        let handle = match LocationRef::parse(reference)? {
            LocationRef::Local(path) => self.store.put_file(&path).await?,
            LocationRef::Remote(object) => {
                let work_dir = tempfile::tempdir().map_err(|source| FetchError::Io {
                    location: reference.to_string(),
                    source,
                })?;
                let local = self
                    .download(&object, credentials, work_dir.path())
                    .await?;
                self.store.put_file(&local).await?
            }
        };

        info!(reference, handle = %handle.short(), "artifact fetched");
        Ok(handle)
    }

    /// Fetch a reference without persisting it; returns a local path.
    ///
    /// Local references are returned as-is; remote ones are downloaded into
    /// `work_dir`, which the caller owns.
    #[instrument(skip(self, credentials, work_dir), fields(transport = %self.transport.name()))]
    pub async fn fetch_to_path(
        &self,
        reference: &str,
        credentials: Option<&Credentials>,
        work_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        match LocationRef::parse(reference)? {
            LocationRef::Local(path) => Ok(path),
            LocationRef::Remote(object) => self.download(&object, credentials, work_dir).await,
        }
    }

    async fn download(
        &self,
        object: &RemoteObject,
        credentials: Option<&Credentials>,
        work_dir: &Path,
    ) -> Result<PathBuf, FetchError> {
        let location = object.s3_url();

        if let Some(creds) = credentials {
            if !creds.key_file.is_file() {
                return Err(FetchError::Credential {
                    location,
                    reason: format!("key file {} not found", creds.key_file.display()),
                });
            }
        }

        // Missing tooling is an environment defect; do not enter the retry loop
        if let Err(failure) = self.transport.preflight(credentials).await {
            return Err(match classify(&location, failure, credentials.is_some()) {
                Classification::Permanent(e) => e,
                Classification::Transient { reason, .. } => FetchError::ToolingMissing(reason),
            });
        }

        let dest = work_dir.join(object.file_name());
        let mut attempt = 0u32;

        loop {
            attempt += 1;
            debug!(%location, attempt, "starting transfer");

            let failure = match self.transport.download(object, credentials, &dest).await {
                Ok(()) if dest.is_file() => return Ok(dest),
                Ok(()) => TransferFailure::Other("transport reported success but wrote no file".into()),
                Err(failure) => failure,
            };
            let _ = fs::remove_file(&dest).await;

            match classify(&location, failure, credentials.is_some()) {
                Classification::Permanent(err) => {
                    warn!(%location, attempt, error = %err, "transfer failed permanently");
                    return Err(err);
                }
                Classification::Transient { reason, known } => {
                    if known {
                        warn!(%location, attempt, error = %reason, "transient transfer failure");
                    } else {
                        warn!(%location, attempt, error = %reason, "unclassified transfer failure; treating as transient");
                    }

                    if !self.retry_policy.should_retry(attempt) {
                        return Err(FetchError::TransferExhausted {
                            location,
                            attempts: attempt,
                            last_error: reason,
                        });
                    }

                    let delay = self.retry_policy.delay_for_attempt(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }
}
