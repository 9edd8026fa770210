//! JSON-file-backed state provider.
//!
//! Each target gets one file under the root directory, holding every kind's
//! entries. Writes go to a temporary file which is then renamed into place.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write;
use std::path::{Path, PathBuf};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::planner::Change;
use crate::resource::{ResourceKey, ResourceKind};

use super::entries::{self, Entries};
use super::{ObservedState, ProviderResult, StateProvider};

/// Format version of target files.
const FILE_VERSION: u32 = 1;

/// Contents of one target file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct TargetFile {
    version: u32,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    resources: BTreeMap<ResourceKind, Entries>,
}

impl Default for TargetFile {
    fn default() -> Self {
        Self {
            version: FILE_VERSION,
            updated_at: Utc::now(),
            resources: BTreeMap::new(),
        }
    }
}

/// Provider persisting live state as JSON files, one per target.
#[derive(Debug)]
pub struct FileProvider {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl FileProvider {
    /// Creates a provider rooted at `root`. The directory is created on the
    /// first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path of the file holding `target`.
    ///
    /// ASCII letters, digits, `.` and `-` are kept; every other byte is
    /// written as `_xx` hex, so distinct targets never share a file.
    #[must_use]
    pub fn target_path(&self, target: &str) -> PathBuf {
        let mut name = String::with_capacity(target.len());
        for byte in target.bytes() {
            if byte.is_ascii_alphanumeric() || matches!(byte, b'.' | b'-') {
                name.push(char::from(byte));
            } else {
                let _ = write!(name, "_{byte:02x}");
            }
        }
        self.root.join(format!("{name}.json"))
    }

    async fn load(&self, kind: ResourceKind, target: &str) -> ProviderResult<TargetFile> {
        let path = self.target_path(target);
        if !path.exists() {
            return Ok(TargetFile::default());
        }

        let content = fs::read_to_string(&path).await.map_err(|e| {
            ProviderError::unavailable(
                kind.subsystem(),
                format!("Failed to read {}: {e}", path.display()),
            )
        })?;

        serde_json::from_str(&content).map_err(|e| {
            ProviderError::unavailable(
                kind.subsystem(),
                format!("Failed to parse {}: {e}", path.display()),
            )
        })
    }

    async fn save(&self, kind: ResourceKind, target: &str, file: &TargetFile) -> ProviderResult<()> {
        let io_err = |e: std::io::Error| ProviderError::unavailable(kind.subsystem(), e.to_string());

        if !self.root.exists() {
            debug!("Creating provider directory: {}", self.root.display());
            fs::create_dir_all(&self.root).await.map_err(io_err)?;
        }

        let content = serde_json::to_string_pretty(file)
            .map_err(|e| ProviderError::unavailable(kind.subsystem(), e.to_string()))?;

        let path = self.target_path(target);
        let temp_path = path.with_extension("tmp");

        let mut handle = fs::File::create(&temp_path).await.map_err(io_err)?;
        handle.write_all(content.as_bytes()).await.map_err(io_err)?;
        handle.sync_all().await.map_err(io_err)?;
        fs::rename(&temp_path, &path).await.map_err(io_err)?;

        Ok(())
    }
}

#[async_trait]
impl StateProvider for FileProvider {
    async fn fetch(&self, key: &ResourceKey) -> ProviderResult<ObservedState> {
        let file = self.load(key.kind, &key.target).await?;
        let attributes = file
            .resources
            .get(&key.kind)
            .and_then(|entries| entries::lookup(entries, &key.identity));

        Ok(match attributes {
            Some(attributes) => ObservedState::present(key.clone(), attributes),
            None => ObservedState::absent(key.clone()),
        })
    }

    async fn apply(&self, change: &Change) -> ProviderResult<()> {
        let key = &change.key;
        // Read-modify-write of a whole target file.
        let _guard = self.write_lock.lock().await;

        let mut file = self.load(key.kind, &key.target).await?;
        let entries = file.resources.entry(key.kind).or_default();
        entries::apply_change(entries, change)?;
        if entries.is_empty() {
            file.resources.remove(&key.kind);
        }

        file.version = FILE_VERSION;
        file.updated_at = Utc::now();
        self.save(key.kind, &key.target, &file).await?;

        info!("{} {key} written to {}", change.kind, self.target_path(&key.target).display());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
