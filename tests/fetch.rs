//! Remote Fetch Integration Tests
//!
//! Retry bounds, error classification and store side effects, driven by a
//! scripted transport.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use strata::core::fetch::OfflineTransport;
use strata::core::{
    ArtifactStore, BadRequestHint, Credentials, FetchError, FsArtifactStore, RemoteFetcher, RemoteObject,
    RetryPolicy, TransferFailure, Transport,
};
use strata::ArtifactHandle;
use tempfile::TempDir;

const PAYLOAD: &[u8] = b"@read1\nACGT\n+\nIIII\n";
const REFERENCE: &str = "s3://bucket/case-1/reads.fq";

/// Plays back a fixed list of outcomes, then succeeds
struct ScriptedTransport {
    script: Mutex<VecDeque<TransferFailure>>,
    attempts: AtomicU32,
    /// Write half a file before failing, like an interrupted transfer
    leave_partial: bool,
}

impl ScriptedTransport {
    fn new(failures: Vec<TransferFailure>) -> Self {
        Self {
            script: Mutex::new(failures.into()),
            attempts: AtomicU32::new(0),
            leave_partial: true,
        }
    }

    fn transient(times: usize) -> Self {
        Self::new(vec![TransferFailure::Connection("connection reset by peer".into()); times])
    }

    fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn preflight(&self, _credentials: Option<&Credentials>) -> Result<(), TransferFailure> {
        Ok(())
    }

    async fn download(
        &self,
        _object: &RemoteObject,
        _credentials: Option<&Credentials>,
        dest: &Path,
    ) -> Result<(), TransferFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().unwrap().pop_front();
        match next {
            Some(failure) => {
                if self.leave_partial {
                    tokio::fs::write(dest, &PAYLOAD[..4]).await.unwrap();
                }
                Err(failure)
            }
            None => {
                tokio::fs::write(dest, PAYLOAD).await.unwrap();
                Ok(())
            }
        }
    }
}

async fn setup(transport: Arc<ScriptedTransport>) -> (TempDir, Arc<FsArtifactStore>, RemoteFetcher) {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsArtifactStore::open(temp.path().join("store")).await.unwrap());
    let fetcher = RemoteFetcher::new(store.clone(), transport, RetryPolicy::default());
    (temp, store, fetcher)
}

#[tokio::test]
async fn test_transient_failures_below_bound_succeed_once() {
    for failures in 0..4 {
        let transport = Arc::new(ScriptedTransport::transient(failures));
        let (_temp, store, fetcher) = setup(transport.clone()).await;

        let handle = fetcher.fetch(REFERENCE, None).await.unwrap();

        assert_eq!(transport.attempts(), failures as u32 + 1);
        assert_eq!(handle, ArtifactHandle::for_bytes(PAYLOAD));
        assert_eq!(store.len().await.unwrap(), 1, "exactly one blob after {} failures", failures);
        assert_eq!(store.get(&handle).await.unwrap(), PAYLOAD);
    }
}

#[tokio::test]
async fn test_transient_failures_at_bound_exhaust_without_blob() {
    let transport = Arc::new(ScriptedTransport::transient(4));
    let (_temp, store, fetcher) = setup(transport.clone()).await;

    let err = fetcher.fetch(REFERENCE, None).await.unwrap_err();

    match err {
        FetchError::TransferExhausted { attempts, location, .. } => {
            assert_eq!(attempts, 4);
            assert_eq!(location, REFERENCE);
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(transport.attempts(), 4);
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_unclassified_failures_are_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![
        TransferFailure::Other("something odd happened".into()),
        TransferFailure::Status {
            status: 503,
            message: "Slow Down".into(),
        },
    ]));
    let (_temp, store, fetcher) = setup(transport.clone()).await;

    fetcher.fetch(REFERENCE, None).await.unwrap();
    assert_eq!(transport.attempts(), 3);
    assert_eq!(store.len().await.unwrap(), 1);
}

#[tokio::test]
async fn test_forbidden_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![TransferFailure::Status {
        status: 403,
        message: "Forbidden".into(),
    }]));
    let (_temp, store, fetcher) = setup(transport.clone()).await;

    let err = fetcher.fetch(REFERENCE, None).await.unwrap_err();
    assert!(matches!(err, FetchError::Authorization { .. }));
    assert_eq!(transport.attempts(), 1);
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_missing_object_is_not_retried() {
    let transport = Arc::new(ScriptedTransport::new(vec![TransferFailure::Missing("NoSuchKey".into())]));
    let (_temp, _store, fetcher) = setup(transport.clone()).await;

    let err = fetcher.fetch(REFERENCE, None).await.unwrap_err();
    assert!(matches!(err, FetchError::NotFound { .. }));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn test_bad_request_hint_depends_on_credentials() {
    let temp = TempDir::new().unwrap();
    let key = temp.path().join("master.key");
    std::fs::write(&key, [7u8; 32]).unwrap();
    let creds = Credentials::new(&key, true);

    let bad_request = || TransferFailure::Status {
        status: 400,
        message: "Bad Request".into(),
    };

    let transport = Arc::new(ScriptedTransport::new(vec![bad_request()]));
    let (_t1, _s1, fetcher) = setup(transport.clone()).await;
    let without_key = fetcher.fetch(REFERENCE, None).await.unwrap_err();
    assert!(matches!(
        without_key,
        FetchError::BadRequest {
            hint: BadRequestHint::EncryptedWithoutKey,
            ..
        }
    ));

    let transport = Arc::new(ScriptedTransport::new(vec![bad_request()]));
    let (_t2, _s2, fetcher) = setup(transport.clone()).await;
    let with_key = fetcher.fetch(REFERENCE, Some(&creds)).await.unwrap_err();
    assert!(matches!(
        with_key,
        FetchError::BadRequest {
            hint: BadRequestHint::UnencryptedWithKey,
            ..
        }
    ));
    assert_eq!(transport.attempts(), 1);
}

#[tokio::test]
async fn test_key_required_without_credentials() {
    let transport = Arc::new(ScriptedTransport::new(vec![TransferFailure::KeyRequired(
        "object is SSE-C encrypted".into(),
    )]));
    let (_temp, _store, fetcher) = setup(transport.clone()).await;

    let err = fetcher.fetch(REFERENCE, None).await.unwrap_err();
    assert!(matches!(err, FetchError::Credential { .. }));
}

#[tokio::test]
async fn test_missing_key_file_fails_before_transfer() {
    let transport = Arc::new(ScriptedTransport::transient(0));
    let (temp, _store, fetcher) = setup(transport.clone()).await;
    let creds = Credentials::new(temp.path().join("absent.key"), false);

    let err = fetcher.fetch(REFERENCE, Some(&creds)).await.unwrap_err();
    assert!(matches!(err, FetchError::Credential { .. }));
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_tooling_missing_fails_fast() {
    let temp = TempDir::new().unwrap();
    let store = Arc::new(FsArtifactStore::open(temp.path()).await.unwrap());
    let fetcher = RemoteFetcher::new(store.clone(), Arc::new(OfflineTransport), RetryPolicy::default());

    let err = fetcher.fetch(REFERENCE, None).await.unwrap_err();
    assert!(matches!(err, FetchError::ToolingMissing(_)));
    assert_eq!(store.len().await.unwrap(), 0);
}

#[tokio::test]
async fn test_invalid_references() {
    let transport = Arc::new(ScriptedTransport::transient(0));
    let (temp, _store, fetcher) = setup(transport.clone()).await;

    for reference in ["ftp://bucket/key", "https://example.com/bucket/key"] {
        let err = fetcher.fetch(reference, None).await.unwrap_err();
        assert!(matches!(err, FetchError::InvalidReference { .. }), "{reference}");
    }

    let missing = temp.path().join("nope.fq");
    let err = fetcher.fetch(missing.to_str().unwrap(), None).await.unwrap_err();
    assert!(matches!(err, FetchError::InvalidReference { .. }));
    assert_eq!(transport.attempts(), 0);
}

#[tokio::test]
async fn test_local_file_and_transient_path() {
    let transport = Arc::new(ScriptedTransport::transient(1));
    let (temp, store, fetcher) = setup(transport.clone()).await;

    let local = temp.path().join("local.fq");
    std::fs::write(&local, PAYLOAD).unwrap();
    let handle = fetcher.fetch(local.to_str().unwrap(), None).await.unwrap();
    assert_eq!(handle, ArtifactHandle::for_bytes(PAYLOAD));

    // opting out of persistence leaves the store alone
    let work = TempDir::new().unwrap();
    let path = fetcher.fetch_to_path(REFERENCE, None, work.path()).await.unwrap();
    assert_eq!(std::fs::read(&path).unwrap(), PAYLOAD);
    assert!(path.starts_with(work.path()));
    assert_eq!(transport.attempts(), 2);
    assert_eq!(store.len().await.unwrap(), 1);
}
