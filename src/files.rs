//! Knowledge files: uploaded blobs plus the registry list that decides
//! which files take part in retrieval.
//!
//! Two stores are involved. A [`FileRegistry`] holds the raw uploaded
//! bytes, and [`KnowledgeFiles`] keeps the `{files: [...]}` list document
//! in keyed storage. The list is read and written as a whole on every
//! mutation.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{RagError, RagResult};
use crate::index::KnowledgeIndex;
use crate::kv::{get_json, put_json, KeyValueStore};
use crate::models::{KnowledgeFileList, KnowledgeFileRecord};

/// Keyed-storage key of the knowledge file list.
pub const KNOWLEDGE_FILE_LIST_KEY: &str = "knowledge_file_list";

/// Handle returned by a successful upload.
#[derive(Debug, Clone, PartialEq)]
pub struct UploadedFile {
    pub id: String,
    pub filename: String,
}

/// Blob storage for uploaded documents.
#[async_trait]
pub trait FileRegistry: Send + Sync {
    async fn upload(&self, name: &str, bytes: &[u8]) -> RagResult<UploadedFile>;

    /// Remove the blob. Deleting an unknown id is not an error.
    async fn delete(&self, id: &str) -> RagResult<()>;

    async fn get_content(&self, id: &str) -> RagResult<Vec<u8>>;
}

/// Stores each upload as `<root>/<uuid>/<filename>`.
pub struct LocalFileRegistry {
    root: PathBuf,
}

impl LocalFileRegistry {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    async fn blob_path(&self, id: &str) -> RagResult<PathBuf> {
        let dir = self.dir_for(id)?;
        let mut entries = tokio::fs::read_dir(&dir)
            .await
            .map_err(|e| RagError::Storage(format!("file {} not found: {}", id, e)))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file() {
                return Ok(entry.path());
            }
        }
        Err(RagError::Storage(format!("file {} has no content", id)))
    }

    fn dir_for(&self, id: &str) -> RagResult<PathBuf> {
        // Ids are generated uuids; anything else could escape the root.
        if id.is_empty() || !id.chars().all(|c| c.is_ascii_hexdigit() || c == '-') {
            return Err(RagError::Storage(format!("invalid file id: {}", id)));
        }
        Ok(self.root.join(id))
    }
}

/// The final path component of `name`, rejecting names that have none.
fn sanitize_filename(name: &str) -> RagResult<String> {
    Path::new(name)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .filter(|n| !n.trim().is_empty())
        .ok_or_else(|| RagError::Storage(format!("invalid file name: {:?}", name)))
}

#[async_trait]
impl FileRegistry for LocalFileRegistry {
    async fn upload(&self, name: &str, bytes: &[u8]) -> RagResult<UploadedFile> {
        let filename = sanitize_filename(name)?;
        let id = uuid::Uuid::new_v4().to_string();
        let dir = self.root.join(&id);
        tokio::fs::create_dir_all(&dir).await?;
        tokio::fs::write(dir.join(&filename), bytes).await?;
        debug!(file_id = %id, filename = %filename, size = bytes.len(), "stored upload");
        Ok(UploadedFile { id, filename })
    }

    async fn delete(&self, id: &str) -> RagResult<()> {
        let dir = self.dir_for(id)?;
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn get_content(&self, id: &str) -> RagResult<Vec<u8>> {
        let path = self.blob_path(id).await?;
        Ok(tokio::fs::read(path).await?)
    }
}

// ============ File list ============

/// The knowledge file list kept in keyed storage.
///
/// Clones share one lock, held across every read-modify-write of the
/// list. Build a single instance per store and clone it.
#[derive(Clone)]
pub struct KnowledgeFiles {
    kv: Arc<dyn KeyValueStore>,
    write_lock: Arc<Mutex<()>>,
}

impl KnowledgeFiles {
    pub fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self {
            kv,
            write_lock: Arc::new(Mutex::new(())),
        }
    }

    pub async fn list(&self) -> RagResult<KnowledgeFileList> {
        Ok(get_json(self.kv.as_ref(), KNOWLEDGE_FILE_LIST_KEY)
            .await?
            .unwrap_or_default())
    }

    async fn save(&self, list: &KnowledgeFileList) -> RagResult<()> {
        put_json(self.kv.as_ref(), KNOWLEDGE_FILE_LIST_KEY, list).await
    }

    pub async fn get(&self, id: &str) -> RagResult<Option<KnowledgeFileRecord>> {
        Ok(self.list().await?.files.into_iter().find(|f| f.id == id))
    }

    /// Append `record`, replacing an existing entry with the same id.
    pub async fn add(&self, record: KnowledgeFileRecord) -> RagResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.list().await?;
        list.files.retain(|f| f.id != record.id);
        list.files.push(record);
        self.save(&list).await
    }

    /// Returns `false` when no file has this id.
    pub async fn set_enabled(&self, id: &str, enabled: bool) -> RagResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.list().await?;
        let Some(file) = list.files.iter_mut().find(|f| f.id == id) else {
            return Ok(false);
        };
        file.enabled = enabled;
        self.save(&list).await?;
        Ok(true)
    }

    /// Returns `false` when no file has this id.
    pub async fn remove(&self, id: &str) -> RagResult<bool> {
        let _guard = self.write_lock.lock().await;
        let mut list = self.list().await?;
        let before = list.files.len();
        list.files.retain(|f| f.id != id);
        if list.files.len() == before {
            return Ok(false);
        }
        self.save(&list).await?;
        Ok(true)
    }

    /// Ids of the files whose chunks take part in retrieval.
    pub async fn enabled_ids(&self) -> RagResult<HashSet<String>> {
        Ok(self
            .list()
            .await?
            .files
            .into_iter()
            .filter(|f| f.enabled)
            .map(|f| f.id)
            .collect())
    }
}

/// Blob registry, file list and index, kept consistent on deletion.
#[derive(Clone)]
pub struct KnowledgeBase {
    pub registry: Arc<dyn FileRegistry>,
    pub files: KnowledgeFiles,
    pub index: Arc<KnowledgeIndex>,
}

impl KnowledgeBase {
    pub fn new(registry: Arc<dyn FileRegistry>, files: KnowledgeFiles, index: Arc<KnowledgeIndex>) -> Self {
        Self {
            registry,
            files,
            index,
        }
    }

    /// Remove a file everywhere: blob, list entry, and indexed chunks.
    ///
    /// Returns `false` when the id is not in the file list. The blob and
    /// chunks are removed either way.
    pub async fn delete_file(&self, id: &str) -> RagResult<bool> {
        if let Err(e) = self.registry.delete(id).await {
            warn!(file_id = id, error = %e, "failed to delete file blob");
        }
        let listed = self.files.remove(id).await?;
        let chunks = self.index.remove_file(id).await?;
        info!(file_id = id, listed, chunks, "deleted knowledge file");
        Ok(listed)
    }
}
