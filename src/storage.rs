//! Object storage backends for published batches.
//!
//! Publishing writes one object per consolidated batch. The [`ObjectStorage`]
//! trait hides where that object lands:
//!
//! - [`LocalStorage`] writes under a directory on the local filesystem.
//! - [`GcsStorage`] uploads to a Google Cloud Storage bucket through the JSON
//!   API's media upload endpoint, authenticating each upload with a token
//!   from a [`TokenSource`].
//! - [`InMemoryStorage`] keeps objects in a map, for tests and dry runs.
//!
//! Backends are selected with [`StorageConfig`] and built once at start-up.
use std::collections::BTreeMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use gcp_auth::TokenProvider;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;
use tracing::debug;

use crate::error::{ConfigError, PublishError};

/// Destination for published objects.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Write `body` under `key`, replacing any existing object. Returns a
    /// human-readable location of the written object.
    async fn write(&self, key: &str, body: Bytes, content_type: &str)
        -> Result<String, PublishError>;
}

/// Backend selection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StorageConfig {
    /// Write objects as files below `root`.
    Local { root: PathBuf },
    /// Upload to a GCS bucket.
    Gcs {
        bucket: String,
        #[serde(default = "default_gcs_endpoint")]
        endpoint: String,
        /// Fixed bearer token for emulators. When absent, a fresh token is
        /// obtained from Application Default Credentials for each upload.
        #[serde(default)]
        access_token: Option<String>,
        #[serde(default = "default_upload_timeout_secs")]
        timeout_secs: u64,
    },
    /// Keep objects in process memory.
    Memory,
}

impl Default for StorageConfig {
    fn default() -> Self {
        StorageConfig::Local {
            root: PathBuf::from("./data"),
        }
    }
}

impl StorageConfig {
    pub fn local(root: impl Into<PathBuf>) -> Self {
        StorageConfig::Local { root: root.into() }
    }

    pub fn gcs(bucket: impl Into<String>) -> Self {
        StorageConfig::Gcs {
            bucket: bucket.into(),
            endpoint: default_gcs_endpoint(),
            access_token: None,
            timeout_secs: default_upload_timeout_secs(),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            StorageConfig::Local { root } if root.as_os_str().is_empty() => {
                Err(ConfigError::invalid("storage.root", "must not be empty"))
            }
            StorageConfig::Gcs { bucket, .. } if bucket.trim().is_empty() => {
                Err(ConfigError::invalid("storage.bucket", "must not be empty"))
            }
            StorageConfig::Gcs { timeout_secs: 0, .. } => Err(ConfigError::invalid(
                "storage.timeout_secs",
                "must be at least 1",
            )),
            _ => Ok(()),
        }
    }

    pub fn build(&self) -> Result<Arc<dyn ObjectStorage>, ConfigError> {
        self.validate()?;
        Ok(match self {
            StorageConfig::Local { root } => Arc::new(LocalStorage::new(root)),
            StorageConfig::Gcs {
                bucket,
                endpoint,
                access_token,
                timeout_secs,
            } => {
                let tokens: Arc<dyn TokenSource> = match access_token {
                    Some(token) => Arc::new(StaticToken::new(token.clone())),
                    None => Arc::new(ApplicationDefaultCredentials::new()),
                };
                Arc::new(GcsStorage::new(
                    bucket,
                    endpoint,
                    tokens,
                    Duration::from_secs(*timeout_secs),
                )?)
            }
            StorageConfig::Memory => Arc::new(InMemoryStorage::new()),
        })
    }
}

/// Files under a root directory. Keys map to relative paths.
#[derive(Debug, Clone)]
pub struct LocalStorage {
    root: PathBuf,
}

impl LocalStorage {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, key: &str) -> Result<PathBuf, PublishError> {
        let relative = Path::new(key);
        let safe = !key.is_empty()
            && relative
                .components()
                .all(|c| matches!(c, Component::Normal(_)));
        if !safe {
            return Err(storage_err(key, "key must be a relative path without '..'"));
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStorage for LocalStorage {
    async fn write(
        &self,
        key: &str,
        body: Bytes,
        _content_type: &str,
    ) -> Result<String, PublishError> {
        let path = self.resolve(key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| storage_err(key, e))?;
        }

        // Write next to the target and rename so readers never see a partial file.
        let tmp = path.with_extension("partial");
        tokio::fs::write(&tmp, &body)
            .await
            .map_err(|e| storage_err(key, e))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| storage_err(key, e))?;

        debug!(path = %path.display(), bytes = body.len(), "local_object_written");
        Ok(path.display().to_string())
    }
}

/// OAuth2 scope requested for uploads.
pub const GCS_WRITE_SCOPE: &str = "https://www.googleapis.com/auth/devstorage.read_write";

/// Supplies the bearer token for each GCS upload.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn bearer_token(&self) -> Result<String, PublishError>;
}

/// A fixed token. Only suitable for emulators, since real access tokens
/// expire after an hour.
#[derive(Debug, Clone)]
pub struct StaticToken(String);

impl StaticToken {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }
}

#[async_trait]
impl TokenSource for StaticToken {
    async fn bearer_token(&self) -> Result<String, PublishError> {
        Ok(self.0.clone())
    }
}

/// Application Default Credentials through `gcp_auth`.
///
/// Credentials are discovered on the first upload (service account file named
/// by `GOOGLE_APPLICATION_CREDENTIALS`, the metadata server, or the gcloud
/// CLI). A token is requested for every upload; the provider caches it and
/// refreshes it before expiry.
#[derive(Default)]
pub struct ApplicationDefaultCredentials {
    provider: OnceCell<Arc<dyn TokenProvider>>,
}

impl ApplicationDefaultCredentials {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenSource for ApplicationDefaultCredentials {
    async fn bearer_token(&self) -> Result<String, PublishError> {
        let provider = self
            .provider
            .get_or_try_init(gcp_auth::provider)
            .await
            .map_err(|e| {
                PublishError::Auth(format!("failed to initialize GCP authentication: {e}"))
            })?;
        let token = provider
            .token(&[GCS_WRITE_SCOPE])
            .await
            .map_err(|e| PublishError::Auth(format!("failed to get GCS token: {e}")))?;
        Ok(token.as_str().to_string())
    }
}

/// Google Cloud Storage, via `POST /upload/storage/v1/b/{bucket}/o?uploadType=media`.
pub struct GcsStorage {
    client: reqwest::Client,
    bucket: String,
    endpoint: String,
    tokens: Arc<dyn TokenSource>,
}

impl GcsStorage {
    pub fn new(
        bucket: &str,
        endpoint: &str,
        tokens: Arc<dyn TokenSource>,
        timeout: Duration,
    ) -> Result<Self, ConfigError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ConfigError::Client(e.to_string()))?;
        Ok(Self {
            client,
            bucket: bucket.to_string(),
            endpoint: endpoint.trim_end_matches('/').to_string(),
            tokens,
        })
    }

    fn upload_url(&self) -> String {
        format!(
            "{}/upload/storage/v1/b/{}/o",
            self.endpoint, self.bucket
        )
    }
}

#[async_trait]
impl ObjectStorage for GcsStorage {
    async fn write(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, PublishError> {
        let token = self.tokens.bearer_token().await?;
        let response = self
            .client
            .post(self.upload_url())
            .query(&[("uploadType", "media"), ("name", key)])
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .bearer_auth(token)
            .body(body)
            .send()
            .await
            .map_err(|e| storage_err(key, e))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(storage_err(key, format!("HTTP {status}: {detail}")));
        }

        Ok(format!("gs://{}/{}", self.bucket, key))
    }
}

/// Objects held in a map. Cloning shares the same map.
#[derive(Debug, Clone, Default)]
pub struct InMemoryStorage {
    objects: Arc<RwLock<BTreeMap<String, StoredObject>>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    pub body: Bytes,
    pub content_type: String,
}

impl InMemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<StoredObject> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(key)
            .cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .keys()
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.objects
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl ObjectStorage for InMemoryStorage {
    async fn write(
        &self,
        key: &str,
        body: Bytes,
        content_type: &str,
    ) -> Result<String, PublishError> {
        self.objects
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(
                key.to_string(),
                StoredObject {
                    body,
                    content_type: content_type.to_string(),
                },
            );
        Ok(format!("memory://{key}"))
    }
}

fn storage_err(key: &str, message: impl ToString) -> PublishError {
    PublishError::Storage {
        key: key.to_string(),
        message: message.to_string(),
    }
}

fn default_gcs_endpoint() -> String {
    "https://storage.googleapis.com".to_string()
}

fn default_upload_timeout_secs() -> u64 {
    60
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn local_storage_creates_partition_dirs() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        let location = storage
            .write("staging/2024/01/05/x.csv", Bytes::from_static(b"a,b\n"), "text/csv")
            .await
            .expect("write");

        let path = dir.path().join("staging/2024/01/05/x.csv");
        assert_eq!(location, path.display().to_string());
        assert_eq!(std::fs::read(&path).expect("read"), b"a,b\n");
        assert!(!path.with_extension("partial").exists());
    }

    #[tokio::test]
    async fn local_storage_rejects_escaping_keys() {
        let dir = tempfile::tempdir().expect("tempdir");
        let storage = LocalStorage::new(dir.path());
        for key in ["../x.csv", "/etc/x.csv", ""] {
            let err = storage
                .write(key, Bytes::new(), "text/csv")
                .await
                .unwrap_err();
            assert!(matches!(err, PublishError::Storage { .. }), "{key}");
        }
    }

    #[tokio::test]
    async fn memory_storage_overwrites() {
        let storage = InMemoryStorage::new();
        storage.write("k", Bytes::from_static(b"1"), "text/csv").await.expect("put");
        storage.write("k", Bytes::from_static(b"2"), "text/csv").await.expect("put");
        assert_eq!(storage.len(), 1);
        assert_eq!(storage.get("k").expect("present").body, Bytes::from_static(b"2"));
    }

    #[test]
    fn config_deserializes_tagged_kinds() {
        let gcs: StorageConfig =
            serde_json::from_str(r#"{"kind":"gcs","bucket":"positions"}"#).expect("gcs");
        assert_eq!(gcs, StorageConfig::gcs("positions"));

        let memory: StorageConfig = serde_json::from_str(r#"{"kind":"memory"}"#).expect("memory");
        assert_eq!(memory, StorageConfig::Memory);
    }

    #[test]
    fn config_validation() {
        assert!(StorageConfig::gcs(" ").validate().is_err());
        assert!(StorageConfig::local("").validate().is_err());
        assert!(StorageConfig::default().build().is_ok());
    }

    #[test]
    fn gcs_upload_url() {
        let storage = GcsStorage::new(
            "positions",
            "http://localhost:4443/",
            Arc::new(StaticToken::new("emulator")),
            Duration::from_secs(5),
        )
        .expect("client");
        assert_eq!(
            storage.upload_url(),
            "http://localhost:4443/upload/storage/v1/b/positions/o"
        );
    }

    /// Hands out `token-1`, `token-2`, ... so each upload is distinguishable.
    #[derive(Default)]
    struct RotatingTokens {
        issued: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl TokenSource for RotatingTokens {
        async fn bearer_token(&self) -> Result<String, PublishError> {
            let n = self.issued.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
            Ok(format!("token-{n}"))
        }
    }

    struct NoCredentials;

    #[async_trait]
    impl TokenSource for NoCredentials {
        async fn bearer_token(&self) -> Result<String, PublishError> {
            Err(PublishError::Auth("no credentials found".into()))
        }
    }

    /// Accepts `count` uploads on a loopback port and returns their request heads.
    async fn capture_uploads(count: usize) -> (String, tokio::task::JoinHandle<Vec<String>>) {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let endpoint = format!("http://{}", listener.local_addr().expect("addr"));
        let server = tokio::spawn(async move {
            let mut heads = Vec::new();
            for _ in 0..count {
                let (mut socket, _) = listener.accept().await.expect("accept");
                let mut buf = Vec::new();
                let mut chunk = [0u8; 1024];
                let head_end = loop {
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        break pos + 4;
                    }
                    let n = socket.read(&mut chunk).await.expect("read");
                    assert!(n > 0, "connection closed before headers");
                    buf.extend_from_slice(&chunk[..n]);
                };
                let head = String::from_utf8_lossy(&buf[..head_end]).to_ascii_lowercase();
                let body_len = head
                    .lines()
                    .find_map(|line| line.strip_prefix("content-length:"))
                    .and_then(|v| v.trim().parse::<usize>().ok())
                    .unwrap_or(0);
                while buf.len() < head_end + body_len {
                    let n = socket.read(&mut chunk).await.expect("read body");
                    if n == 0 {
                        break;
                    }
                    buf.extend_from_slice(&chunk[..n]);
                }
                socket
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}")
                    .await
                    .expect("respond");
                heads.push(head);
            }
            heads
        });
        (endpoint, server)
    }

    #[tokio::test]
    async fn gcs_requests_a_token_for_every_upload() {
        let (endpoint, server) = capture_uploads(2).await;
        let storage = GcsStorage::new(
            "positions",
            &endpoint,
            Arc::new(RotatingTokens::default()),
            Duration::from_secs(5),
        )
        .expect("client");

        for key in ["staging/a.csv", "staging/b.csv"] {
            let location = storage
                .write(key, Bytes::from_static(b"a,b\n"), "text/csv")
                .await
                .expect("upload");
            assert_eq!(location, format!("gs://positions/{key}"));
        }

        let heads = server.await.expect("server");
        assert!(heads[0].contains("authorization: bearer token-1"), "{}", heads[0]);
        assert!(heads[1].contains("authorization: bearer token-2"), "{}", heads[1]);
        assert!(heads[0].starts_with("post /upload/storage/v1/b/positions/o?uploadtype=media&name=staging%2fa.csv"));
    }

    #[tokio::test]
    async fn gcs_credential_failure_sends_nothing() {
        let storage = GcsStorage::new(
            "positions",
            "http://127.0.0.1:9",
            Arc::new(NoCredentials),
            Duration::from_secs(5),
        )
        .expect("client");

        let err = storage
            .write("staging/a.csv", Bytes::from_static(b"a,b\n"), "text/csv")
            .await
            .unwrap_err();
        assert_eq!(err, PublishError::Auth("no credentials found".into()));
    }

    #[test]
    fn access_token_overrides_default_credentials() {
        let cfg: StorageConfig = serde_json::from_str(
            r#"{"kind":"gcs","bucket":"positions","endpoint":"http://localhost:4443","access_token":"emulator"}"#,
        )
        .expect("gcs");
        assert!(matches!(
            &cfg,
            StorageConfig::Gcs { access_token: Some(t), .. } if t == "emulator"
        ));
        assert!(cfg.build().is_ok());
        assert!(StorageConfig::gcs("positions").build().is_ok());
    }
}
