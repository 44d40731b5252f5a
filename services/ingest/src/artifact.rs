//! Storage for published segment and playlist artifacts.
//!
//! Keys are relative paths of the form `{camera_id}/{file}`. Deleting a key
//! that does not exist is not an error, so eviction and release can run more
//! than once for the same artifact.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use thiserror::Error;
use tracing::debug;

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("Artifact I/O failed for {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: io::Error,
    },

    #[error("Artifact backend error: {0}")]
    Backend(String),
}

#[async_trait]
pub trait ArtifactStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), ArtifactError>;

    async fn delete(&self, key: &str) -> Result<(), ArtifactError>;
}

/// Reject keys that could escape the store root
fn check_key(key: &str) -> Result<(), ArtifactError> {
    let path = Path::new(key);
    let safe = !key.is_empty()
        && path
            .components()
            .all(|component| matches!(component, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(ArtifactError::Backend(format!("invalid artifact key: {key:?}")))
    }
}

/// Artifacts written below a local directory
pub struct FsArtifactStore {
    root: PathBuf,
}

impl FsArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn path_for(&self, key: &str) -> Result<PathBuf, ArtifactError> {
        check_key(key)?;
        Ok(self.root.join(key))
    }
}

#[async_trait]
impl ArtifactStore for FsArtifactStore {
    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        let io_err = |source| ArtifactError::Io {
            key: key.to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        // Write then rename so readers never see a partial playlist.
        let tmp = path.with_extension("tmp");
        tokio::fs::write(&tmp, &body).await.map_err(io_err)?;
        tokio::fs::rename(&tmp, &path).await.map_err(io_err)?;

        debug!(key, size_bytes = body.len(), "Artifact written");
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        let path = self.path_for(key)?;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(source) => Err(ArtifactError::Io {
                key: key.to_string(),
                source,
            }),
        }
    }
}

/// Artifacts kept in memory
#[derive(Default)]
pub struct MemoryArtifactStore {
    objects: RwLock<BTreeMap<String, (Bytes, String)>>,
}

impl MemoryArtifactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<Bytes> {
        self.objects.read().get(key).map(|(body, _)| body.clone())
    }

    /// Stored artifact as text, for playlists
    pub fn get_text(&self, key: &str) -> Option<String> {
        self.get(key)
            .map(|body| String::from_utf8_lossy(&body).into_owned())
    }

    pub fn content_type(&self, key: &str) -> Option<String> {
        self.objects.read().get(key).map(|(_, ct)| ct.clone())
    }

    /// All keys, sorted
    pub fn keys(&self) -> Vec<String> {
        self.objects.read().keys().cloned().collect()
    }
}

#[async_trait]
impl ArtifactStore for MemoryArtifactStore {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), ArtifactError> {
        check_key(key)?;
        self.objects
            .write()
            .insert(key.to_string(), (body, content_type.to_string()));
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
        self.objects.write().remove(key);
        Ok(())
    }
}

#[cfg(feature = "s3")]
pub use s3::S3ArtifactStore;

#[cfg(feature = "s3")]
mod s3 {
    use super::{check_key, ArtifactError, ArtifactStore};
    use crate::config::S3Config;
    use async_trait::async_trait;
    use aws_config::BehaviorVersion;
    use aws_sdk_s3::config::Builder as S3ConfigBuilder;
    use aws_sdk_s3::primitives::ByteStream;
    use aws_sdk_s3::Client as S3Client;
    use bytes::Bytes;
    use tracing::{debug, info, instrument};

    /// Artifacts uploaded to an S3 bucket (or a compatible store such as MinIO)
    pub struct S3ArtifactStore {
        client: S3Client,
        bucket: String,
        prefix: Option<String>,
    }

    impl S3ArtifactStore {
        pub async fn new(config: &S3Config) -> Self {
            let aws_config = aws_config::defaults(BehaviorVersion::latest())
                .region(aws_config::Region::new(config.region.clone()))
                .load()
                .await;

            let mut s3_config_builder = S3ConfigBuilder::from(&aws_config);

            // Configure custom endpoint for MinIO/LocalStack
            if let Some(ref endpoint_url) = config.endpoint_url {
                s3_config_builder = s3_config_builder.endpoint_url(endpoint_url);
            }

            // Force path-style access for MinIO compatibility
            if config.force_path_style {
                s3_config_builder = s3_config_builder.force_path_style(true);
            }

            let client = S3Client::from_conf(s3_config_builder.build());

            info!(
                bucket = %config.bucket,
                region = %config.region,
                "S3 artifact store initialized"
            );

            Self {
                client,
                bucket: config.bucket.clone(),
                prefix: config.prefix.clone(),
            }
        }

        fn object_key(&self, key: &str) -> Result<String, ArtifactError> {
            check_key(key)?;
            Ok(match self.prefix.as_deref().map(|p| p.trim_matches('/')) {
                Some(prefix) if !prefix.is_empty() => format!("{prefix}/{key}"),
                _ => key.to_string(),
            })
        }
    }

    #[async_trait]
    impl ArtifactStore for S3ArtifactStore {
        #[instrument(skip(self, body), fields(bucket = %self.bucket))]
        async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<(), ArtifactError> {
            let object_key = self.object_key(key)?;
            let size = body.len();

            self.client
                .put_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .body(ByteStream::from(body))
                .content_type(content_type)
                .send()
                .await
                .map_err(|e| ArtifactError::Backend(format!("put {object_key}: {e}")))?;

            debug!(key = %object_key, size_bytes = size, "Artifact uploaded");
            Ok(())
        }

        #[instrument(skip(self), fields(bucket = %self.bucket))]
        async fn delete(&self, key: &str) -> Result<(), ArtifactError> {
            let object_key = self.object_key(key)?;

            // S3 reports success for keys that do not exist.
            self.client
                .delete_object()
                .bucket(&self.bucket)
                .key(&object_key)
                .send()
                .await
                .map_err(|e| ArtifactError::Backend(format!("delete {object_key}: {e}")))?;

            Ok(())
        }
    }
}
