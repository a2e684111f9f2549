//! Persistence layer for document trees and status records.
//!
//! Trees are stored as JSON (human-readable) or bincode (compact binary);
//! status records are always JSON. [`FileStore`] keeps the two kinds apart:
//!
//! ```text
//! <data_dir>/trees/<document_id>.json | .bin     committed tree
//! <data_dir>/status/<document_id>.json           lifecycle status
//! ```
//!
//! Ids may contain `.`, so a shared directory would let the tree of
//! `a.status` overwrite the status of `a`.
//!
//! Files are written to a temporary name and renamed into place, so a reader
//! never observes a half-written tree.

use crate::error::{KnowledgeBaseError, Result};
use crate::manager::{DocumentStatus, DocumentStore};
use crate::tree::DocumentTree;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const TREES_DIR: &str = "trees";
const STATUS_DIR: &str = "status";

/// Save format for trees.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveFormat {
    /// JSON format (human-readable, larger).
    #[default]
    Json,
    /// Bincode format (binary, compact).
    Bincode,
}

impl SaveFormat {
    /// Determine format from file extension.
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("bin") | Some("bincode") => SaveFormat::Bincode,
            _ => SaveFormat::Json,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            SaveFormat::Json => "json",
            SaveFormat::Bincode => "bin",
        }
    }

    fn other(self) -> Self {
        match self {
            SaveFormat::Json => SaveFormat::Bincode,
            SaveFormat::Bincode => SaveFormat::Json,
        }
    }
}

/// Serialize a tree in the given format.
pub fn encode_tree(tree: &DocumentTree, format: SaveFormat) -> Result<Vec<u8>> {
    match format {
        SaveFormat::Json => Ok(serde_json::to_string_pretty(tree)?.into_bytes()),
        SaveFormat::Bincode => bincode::encode_to_vec(tree, bincode::config::standard())
            .map_err(|e| KnowledgeBaseError::Serialization(e.to_string())),
    }
}

/// Deserialize a tree in the given format.
pub fn decode_tree(data: &[u8], format: SaveFormat) -> Result<DocumentTree> {
    match format {
        SaveFormat::Json => Ok(serde_json::from_slice(data)?),
        SaveFormat::Bincode => {
            let (tree, _): (DocumentTree, usize) =
                bincode::decode_from_slice(data, bincode::config::standard())
                    .map_err(|e| KnowledgeBaseError::Serialization(e.to_string()))?;
            Ok(tree)
        }
    }
}

fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| KnowledgeBaseError::io(parent, e))?;
        }
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, data).map_err(|e| KnowledgeBaseError::io(&tmp, e))?;
    fs::rename(&tmp, path).map_err(|e| KnowledgeBaseError::io(path, e))
}

/// Save a DocumentTree to a file, picking the format from its extension.
pub fn save_tree(tree: &DocumentTree, path: &Path) -> Result<()> {
    save_tree_with_format(tree, path, SaveFormat::from_path(path))
}

/// Save a DocumentTree with specific format.
pub fn save_tree_with_format(tree: &DocumentTree, path: &Path, format: SaveFormat) -> Result<()> {
    write_atomic(path, &encode_tree(tree, format)?)
}

/// Load a DocumentTree from a file, picking the format from its extension.
pub fn load_tree(path: &Path) -> Result<DocumentTree> {
    load_tree_with_format(path, SaveFormat::from_path(path))
}

/// Load a DocumentTree with specific format.
pub fn load_tree_with_format(path: &Path, format: SaveFormat) -> Result<DocumentTree> {
    let data = fs::read(path).map_err(|e| KnowledgeBaseError::io(path, e))?;
    decode_tree(&data, format)
}

/// Get the size of a tree file in bytes.
pub fn tree_size(path: &Path) -> Result<u64> {
    let metadata = fs::metadata(path).map_err(|e| KnowledgeBaseError::io(path, e))?;
    Ok(metadata.len())
}

/// Directory-backed [`DocumentStore`].
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
    format: SaveFormat,
}

impl FileStore {
    pub fn new(dir: impl Into<PathBuf>, format: SaveFormat) -> Self {
        Self {
            dir: dir.into(),
            format,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the tree file for `document_id` in `format`.
    pub fn tree_path(&self, document_id: &str, format: SaveFormat) -> PathBuf {
        self.dir
            .join(TREES_DIR)
            .join(format!("{}.{}", document_id, format.extension()))
    }

    /// Path of the status record for `document_id`.
    pub fn status_path(&self, document_id: &str) -> PathBuf {
        self.dir.join(STATUS_DIR).join(format!("{}.json", document_id))
    }
}

async fn remove_if_present(path: &Path) -> Result<bool> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(KnowledgeBaseError::io(path, e)),
    }
}

/// Total size of the regular files directly inside `dir`; missing counts as empty.
async fn dir_bytes(dir: &Path) -> Result<u64> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(KnowledgeBaseError::io(dir, e)),
    };
    let mut total = 0;
    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| KnowledgeBaseError::io(dir, e))?
    {
        let metadata = entry
            .metadata()
            .await
            .map_err(|e| KnowledgeBaseError::io(entry.path(), e))?;
        if metadata.is_file() {
            total += metadata.len();
        }
    }
    Ok(total)
}

/// Document ids become file names; keep them to a safe alphabet.
fn check_id(document_id: &str) -> Result<()> {
    let valid = !document_id.is_empty()
        && !document_id.starts_with('.')
        && document_id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(KnowledgeBaseError::Config(format!(
            "document id '{}' may only contain letters, digits, '-', '_' and '.'",
            document_id
        )))
    }
}

async fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match tokio::fs::read(path).await {
        Ok(data) => Ok(Some(data)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(KnowledgeBaseError::io(path, e)),
    }
}

async fn write_atomic_async(path: PathBuf, data: Vec<u8>) -> Result<()> {
    tokio::task::spawn_blocking(move || write_atomic(&path, &data))
        .await
        .map_err(|e| KnowledgeBaseError::Serialization(format!("write task failed: {}", e)))?
}

#[async_trait]
impl DocumentStore for FileStore {
    async fn save_tree(&self, document_id: &str, tree: &DocumentTree) -> Result<()> {
        check_id(document_id)?;
        let path = self.tree_path(document_id, self.format);
        let data = encode_tree(tree, self.format)?;
        debug!(document_id, path = %path.display(), bytes = data.len(), "saving tree");
        write_atomic_async(path, data).await?;

        // Drop a stale copy in the other format so loads stay unambiguous.
        let stale = self.tree_path(document_id, self.format.other());
        if let Err(e) = remove_if_present(&stale).await {
            warn!(path = %stale.display(), error = %e, "could not remove stale tree file");
        }
        Ok(())
    }

    async fn load_tree(&self, document_id: &str) -> Result<Option<DocumentTree>> {
        check_id(document_id)?;
        for format in [self.format, self.format.other()] {
            let path = self.tree_path(document_id, format);
            if let Some(data) = read_optional(&path).await? {
                return decode_tree(&data, format).map(Some);
            }
        }
        Ok(None)
    }

    async fn set_status(&self, status: &DocumentStatus) -> Result<()> {
        check_id(&status.document_id)?;
        let data = serde_json::to_vec_pretty(status)?;
        write_atomic_async(self.status_path(&status.document_id), data).await
    }

    async fn delete(&self, document_id: &str) -> Result<bool> {
        check_id(document_id)?;
        let mut removed = false;
        for path in [
            self.tree_path(document_id, SaveFormat::Json),
            self.tree_path(document_id, SaveFormat::Bincode),
            self.status_path(document_id),
        ] {
            removed |= remove_if_present(&path).await?;
        }
        debug!(document_id, removed, "deleted stored files");
        Ok(removed)
    }

    async fn storage_bytes(&self) -> Result<u64> {
        Ok(dir_bytes(&self.dir.join(TREES_DIR)).await? + dir_bytes(&self.dir.join(STATUS_DIR)).await?)
    }

    async fn list(&self) -> Result<Vec<DocumentStatus>> {
        let status_dir = self.dir.join(STATUS_DIR);
        let mut entries = match tokio::fs::read_dir(&status_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(KnowledgeBaseError::io(&status_dir, e)),
        };

        let mut statuses = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| KnowledgeBaseError::io(&status_dir, e))?
        {
            let path = entry.path();
            let is_status = path.extension().and_then(|e| e.to_str()) == Some("json");
            if !is_status {
                continue;
            }
            let Some(data) = read_optional(&path).await? else {
                continue;
            };
            match serde_json::from_slice::<DocumentStatus>(&data) {
                Ok(status) => statuses.push(status),
                Err(e) => warn!(path = %path.display(), error = %e, "skipping unreadable status file"),
            }
        }

        statuses.sort_by(|a, b| a.document_id.cmp(&b.document_id));
        Ok(statuses)
    }
}
