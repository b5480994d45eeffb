use brook_rpc::retry;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use object_store::aws::AmazonS3Builder;
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path;
use object_store::{ObjectStore, PutPayload};
use regex::{Captures, Regex};
use std::borrow::Cow;
use std::fmt::{Debug, Formatter};
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Object storage addressed by URL. Checkpoints and aggregates are written through it, so the
/// same code runs against a local directory, S3 or an in-process store.
#[derive(Clone)]
pub struct StorageProvider {
    config: BackendConfig,
    object_store: Arc<dyn ObjectStore>,
    canonical_url: String,
}

impl Debug for StorageProvider {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "StorageProvider<{}>", self.canonical_url)
    }
}

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("the provided URL is not a valid object store")]
    InvalidUrl,

    #[error("could not instantiate storage from path: {0}")]
    PathError(String),

    #[error("object store error: {0:?}")]
    ObjectStore(#[from] object_store::Error),
}

impl StorageError {
    /// Whether retrying the same operation could succeed; missing objects and malformed
    /// requests will fail the same way every time.
    pub fn is_retryable(&self) -> bool {
        match self {
            StorageError::InvalidUrl | StorageError::PathError(_) => false,
            StorageError::ObjectStore(e) => is_transient(e),
        }
    }
}

fn is_transient(e: &object_store::Error) -> bool {
    !matches!(
        e,
        object_store::Error::NotFound { .. }
            | object_store::Error::InvalidPath { .. }
            | object_store::Error::NotSupported { .. }
            | object_store::Error::NotImplemented
            | object_store::Error::UnknownConfigurationKey { .. }
    )
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Backend {
    S3,
    Local,
    Memory,
}

// tried in order; the first match decides the backend
const URL_PATTERNS: &[(Backend, &str)] = &[
    // s3::http://localhost:9000/bucket/prefix
    (
        Backend::S3,
        r"^[sS]3::(?P<protocol>https?)://(?P<endpoint>[^:/]+)(:(?P<port>\d+))?/(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    // s3://bucket/prefix
    (
        Backend::S3,
        r"^[sS]3[aA]?://(?P<bucket>[a-z0-9\-\.]+)(/(?P<key>.+))?$",
    ),
    // file:///var/lib/brook, file:/var/lib/brook or /var/lib/brook
    (Backend::Local, r"^(file:(//)?)?(?P<path>/.*)$"),
    // memory://prefix
    (Backend::Memory, r"^memory://(?P<key>.*)$"),
];

fn url_patterns() -> &'static [(Backend, Regex)] {
    static PATTERNS: OnceLock<Vec<(Backend, Regex)>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        URL_PATTERNS
            .iter()
            .map(|(backend, pattern)| (*backend, Regex::new(pattern).unwrap()))
            .collect()
    })
}

macro_rules! storage_retry {
    ($e: expr) => {
        retry!(
            $e,
            10,
            Duration::from_millis(100),
            Duration::from_secs(10),
            |e| warn!(message = "storage operation failed, retrying", error = %e),
            is_transient
        )
    };
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Config {
    endpoint: Option<String>,
    bucket: String,
    key: Option<Path>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackendConfig {
    S3(S3Config),
    Local { path: String },
    Memory { key: Option<Path> },
}

fn optional_key(matches: &Captures) -> Option<Path> {
    matches
        .name("key")
        .map(|m| m.as_str().trim_end_matches('/'))
        .filter(|k| !k.is_empty())
        .map(Path::from)
}

impl BackendConfig {
    pub fn parse_url(url: &str) -> Result<Self, StorageError> {
        let (backend, matches) = url_patterns()
            .iter()
            .find_map(|(backend, r)| r.captures(url).map(|m| (*backend, m)))
            .ok_or(StorageError::InvalidUrl)?;

        Ok(match backend {
            Backend::S3 => {
                let endpoint = matches.name("endpoint").map(|host| {
                    let protocol = matches.name("protocol").map_or("https", |p| p.as_str());
                    match matches.name("port") {
                        Some(port) => format!("{}://{}:{}", protocol, host.as_str(), port.as_str()),
                        None => format!("{}://{}", protocol, host.as_str()),
                    }
                });

                BackendConfig::S3(S3Config {
                    endpoint: endpoint.or_else(|| std::env::var("AWS_ENDPOINT").ok()),
                    bucket: matches["bucket"].to_string(),
                    key: optional_key(&matches),
                })
            }
            Backend::Local => BackendConfig::Local {
                path: matches["path"].to_string(),
            },
            Backend::Memory => BackendConfig::Memory {
                key: optional_key(&matches),
            },
        })
    }

    fn key(&self) -> Option<&Path> {
        match self {
            BackendConfig::S3(s3) => s3.key.as_ref(),
            BackendConfig::Local { .. } => None,
            BackendConfig::Memory { key } => key.as_ref(),
        }
    }
}

impl StorageProvider {
    pub async fn for_url(url: &str) -> Result<Self, StorageError> {
        let config = BackendConfig::parse_url(url)?;

        let (object_store, canonical_url): (Arc<dyn ObjectStore>, String) = match &config {
            BackendConfig::S3(s3) => {
                let mut builder = AmazonS3Builder::from_env().with_bucket_name(&s3.bucket);
                if let Some(endpoint) = &s3.endpoint {
                    builder = builder
                        .with_endpoint(endpoint)
                        .with_virtual_hosted_style_request(false)
                        .with_allow_http(true);
                }

                let url = match &s3.endpoint {
                    Some(endpoint) => format!("s3::{}/{}", endpoint, s3.bucket),
                    None => format!("s3://{}", s3.bucket),
                };
                (Arc::new(builder.build()?), url)
            }
            BackendConfig::Local { path } => {
                tokio::fs::create_dir_all(path).await.map_err(|e| {
                    StorageError::PathError(format!("failed to create directory {}: {}", path, e))
                })?;
                (
                    Arc::new(LocalFileSystem::new_with_prefix(path)?),
                    format!("file://{}", path),
                )
            }
            BackendConfig::Memory { .. } => (Arc::new(InMemory::new()), "memory://".to_string()),
        };

        let canonical_url = match config.key() {
            Some(key) => format!("{}/{}", canonical_url.trim_end_matches('/'), key),
            None => canonical_url,
        };

        debug!(message = "constructed storage provider", url = %canonical_url);

        Ok(Self {
            config,
            object_store,
            canonical_url,
        })
    }

    /// Wraps an already constructed object store, rooted at its top level.
    pub fn for_object_store(object_store: Arc<dyn ObjectStore>) -> Self {
        Self {
            config: BackendConfig::Memory { key: None },
            object_store,
            canonical_url: "memory://".to_string(),
        }
    }

    pub fn canonical_url(&self) -> &str {
        &self.canonical_url
    }

    /// Lists the objects under `prefix`, returning their paths relative to this provider.
    pub async fn list(&self, prefix: Option<&Path>) -> Result<Vec<Path>, StorageError> {
        let key_parts = self.config.key().map_or(0, |key| key.parts().count());

        let qualified = match (prefix, self.config.key()) {
            (Some(p), _) => Some(self.qualify_path(p).into_owned()),
            (None, key) => key.cloned(),
        };

        self.object_store
            .list(qualified.as_ref())
            .map(|meta| meta.map(|m| m.location.parts().skip(key_parts).collect::<Path>()))
            .try_collect()
            .await
            .map_err(Into::into)
    }

    pub async fn get(&self, path: impl Into<Path>) -> Result<Bytes, StorageError> {
        let path = path.into();
        Ok(self
            .object_store
            .get(&self.qualify_path(&path))
            .await?
            .bytes()
            .await?)
    }

    pub async fn get_if_present(
        &self,
        path: impl Into<Path>,
    ) -> Result<Option<Bytes>, StorageError> {
        match self.get(path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(StorageError::ObjectStore(object_store::Error::NotFound { .. })) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Writes an object, retrying transient failures. Object stores make the write visible
    /// atomically: readers see either the previous object or the complete new one.
    pub async fn put(&self, path: impl Into<Path>, bytes: Vec<u8>) -> Result<(), StorageError> {
        let bytes = PutPayload::from(Bytes::from(bytes));
        let path = path.into();
        let path = self.qualify_path(&path);
        storage_retry!(self.object_store.put(&path, bytes.clone()).await)?;

        Ok(())
    }

    /// Writes an object with a single attempt, leaving retries to the caller.
    pub async fn try_put(&self, path: impl Into<Path>, bytes: Vec<u8>) -> Result<(), StorageError> {
        let path = path.into();
        self.object_store
            .put(&self.qualify_path(&path), PutPayload::from(Bytes::from(bytes)))
            .await?;

        Ok(())
    }

    pub async fn delete_if_present(&self, path: impl Into<Path>) -> Result<(), StorageError> {
        let path = path.into();
        match self.object_store.delete(&self.qualify_path(&path)).await {
            Ok(_) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn qualify_path<'a>(&self, path: &'a Path) -> Cow<'a, Path> {
        match self.config.key() {
            Some(prefix) => Cow::Owned(prefix.parts().chain(path.parts()).collect()),
            None => Cow::Borrowed(path),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_s3_urls() {
        assert_eq!(
            BackendConfig::parse_url("s3://mybucket/checkpoints").unwrap(),
            BackendConfig::S3(S3Config {
                endpoint: std::env::var("AWS_ENDPOINT").ok(),
                bucket: "mybucket".to_string(),
                key: Some("checkpoints".into()),
            })
        );

        assert_eq!(
            BackendConfig::parse_url("s3::http://localhost:9000/brook/aggregates/").unwrap(),
            BackendConfig::S3(S3Config {
                endpoint: Some("http://localhost:9000".to_string()),
                bucket: "brook".to_string(),
                key: Some("aggregates".into()),
            })
        );
    }

    #[test]
    fn test_local_and_memory_urls() {
        for url in ["file:///my/path/directory", "file:/my/path/directory", "/my/path/directory"] {
            assert_eq!(
                BackendConfig::parse_url(url).unwrap(),
                BackendConfig::Local {
                    path: "/my/path/directory".to_string(),
                }
            );
        }

        assert_eq!(
            BackendConfig::parse_url("memory://").unwrap(),
            BackendConfig::Memory { key: None }
        );
        assert!(matches!(
            BackendConfig::parse_url("memory"),
            Err(StorageError::InvalidUrl)
        ));
        assert!(matches!(
            BackendConfig::parse_url("relative/path"),
            Err(StorageError::InvalidUrl)
        ));
    }

    #[tokio::test]
    async fn test_local_fs() {
        let dir = tempfile::tempdir().unwrap();
        let storage = StorageProvider::for_url(dir.path().to_str().unwrap())
            .await
            .unwrap();

        let key = Path::parse("nested/object-1").unwrap();
        storage.put(key.clone(), b"hello".to_vec()).await.unwrap();
        storage
            .try_put("nested/object-2", b"world".to_vec())
            .await
            .unwrap();

        assert_eq!(storage.get(key.clone()).await.unwrap(), &b"hello"[..]);

        let mut listed = storage
            .list(Some(&Path::from("nested")))
            .await
            .unwrap();
        listed.sort();
        assert_eq!(
            listed,
            vec![Path::from("nested/object-1"), Path::from("nested/object-2")]
        );

        storage.delete_if_present(key.clone()).await.unwrap();
        storage.delete_if_present(key.clone()).await.unwrap();
        assert!(storage.get_if_present(key).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_memory_prefix() {
        let storage = StorageProvider::for_url("memory://brook/checkpoints")
            .await
            .unwrap();
        assert_eq!(storage.canonical_url(), "memory://brook/checkpoints");

        storage.put("a", b"1".to_vec()).await.unwrap();
        storage.put("b", b"2".to_vec()).await.unwrap();

        let mut listed = storage.list(None).await.unwrap();
        listed.sort();
        assert_eq!(listed, vec![Path::from("a"), Path::from("b")]);
        assert_eq!(
            storage.qualify_path(&Path::from("a")).as_ref(),
            &Path::from("brook/checkpoints/a")
        );
    }

    #[test]
    fn test_retryable() {
        assert!(!StorageError::InvalidUrl.is_retryable());
        assert!(StorageError::ObjectStore(object_store::Error::Generic {
            store: "test",
            source: "connection reset".into()
        })
        .is_retryable());
        assert!(!StorageError::ObjectStore(object_store::Error::NotFound {
            path: "x".to_string(),
            source: "missing".into()
        })
        .is_retryable());
    }
}
