//! Configuration sources for the compatibility document.
//!
//! A source only delivers raw bytes. An absent document is `Ok(None)`, which
//! the refresher turns into an empty mapping so reconciliation keeps going.

use crate::error::SourceError;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

/// Name of the ConfigMap holding the compatibility document.
pub const DEFAULT_CONFIGMAP_NAME: &str = "machine-pd-compatibility";

/// Namespace of the ConfigMap holding the compatibility document.
pub const DEFAULT_CONFIGMAP_NAMESPACE: &str = "gce-pd-csi-driver";

/// Data key of the compatibility document inside the ConfigMap.
pub const DEFAULT_DATA_KEY: &str = "machine-pd-compatibility.json";

/// Path of the document when the ConfigMap is mounted as a volume.
pub const DEFAULT_MOUNT_PATH: &str = "/etc/machine-pd-compatibility/machine-pd-compatibility.json";

/// Abstract source of the raw compatibility document.
#[async_trait]
pub trait ConfigSource: Send + Sync + 'static {
    /// Fetch the current document, `None` when it does not exist.
    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError>;

    /// Human readable location, used in logs.
    fn location(&self) -> String;
}

/// In-memory source for testing and embedding.
#[derive(Default)]
pub struct MemoryConfigSource {
    document: RwLock<Option<Vec<u8>>>,
}

impl MemoryConfigSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: impl Into<Vec<u8>>) -> Self {
        Self {
            document: RwLock::new(Some(document.into())),
        }
    }

    pub fn set_document(&self, document: impl Into<Vec<u8>>) {
        *self.document.write() = Some(document.into());
    }

    pub fn clear(&self) {
        *self.document.write() = None;
    }
}

#[async_trait]
impl ConfigSource for MemoryConfigSource {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError> {
        Ok(self.document.read().clone())
    }

    fn location(&self) -> String {
        "memory".to_string()
    }
}

/// How a [`FileConfigSource`] interprets its file.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FileFormat {
    /// The file is the compatibility document itself (mounted ConfigMap key).
    Document,
    /// The file is a ConfigMap manifest in JSON; the document is `data[key]`.
    ConfigMap { key: String },
}

#[derive(Deserialize)]
struct ConfigMapManifest {
    #[serde(default)]
    data: BTreeMap<String, String>,
}

/// File based source.
#[derive(Clone, Debug)]
pub struct FileConfigSource {
    path: PathBuf,
    format: FileFormat,
}

impl FileConfigSource {
    /// Read the document directly from `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: FileFormat::Document,
        }
    }

    /// Read the document from `data[key]` of a ConfigMap manifest at `path`.
    pub fn config_map(path: impl Into<PathBuf>, key: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            format: FileFormat::ConfigMap { key: key.into() },
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn format(&self) -> &FileFormat {
        &self.format
    }
}

impl Default for FileConfigSource {
    fn default() -> Self {
        Self::new(DEFAULT_MOUNT_PATH)
    }
}

#[async_trait]
impl ConfigSource for FileConfigSource {
    async fn fetch(&self) -> Result<Option<Vec<u8>>, SourceError> {
        let raw = match tokio::fs::read(&self.path).await {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                tracing::debug!(location = %self.location(), "compatibility document absent");
                return Ok(None);
            }
            Err(err) => {
                return Err(SourceError::Io {
                    location: self.location(),
                    reason: err.to_string(),
                })
            }
        };

        match &self.format {
            FileFormat::Document => Ok(Some(raw)),
            FileFormat::ConfigMap { key } => {
                let manifest: ConfigMapManifest =
                    serde_json::from_slice(&raw).map_err(|err| SourceError::Manifest {
                        location: self.location(),
                        reason: err.to_string(),
                    })?;
                match manifest.data.get(key) {
                    Some(document) => Ok(Some(document.clone().into_bytes())),
                    None => {
                        tracing::warn!(location = %self.location(), key = %key, "ConfigMap has no compatibility data key");
                        Ok(None)
                    }
                }
            }
        }
    }

    fn location(&self) -> String {
        match &self.format {
            FileFormat::Document => self.path.display().to_string(),
            FileFormat::ConfigMap { key } => format!("{}#{}", self.path.display(), key),
        }
    }
}
