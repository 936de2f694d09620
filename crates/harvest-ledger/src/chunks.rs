//! Chunk ledgers that survive restarts.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use harvest_core::chunk::{Chunk, ChunkId, ChunkStatus};
use harvest_core::error::AppError;
use harvest_core::traits::ChunkLedger;
use serde::{Deserialize, Serialize};

/// One row of a chunk ledger, as shown by `harvest chunks`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkEntry {
    pub id: String,
    pub start: u64,
    pub end: u64,
    pub status: ChunkStatus,
    pub updated_at: DateTime<Utc>,
}

impl ChunkEntry {
    pub fn new(chunk: &Chunk, status: ChunkStatus) -> Self {
        Self {
            id: chunk.id().to_string(),
            start: chunk.start,
            end: chunk.end,
            status,
            updated_at: Utc::now(),
        }
    }

    pub fn chunk(&self) -> Chunk {
        Chunk::new(self.start, self.end)
    }
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LedgerFile {
    chunks: Vec<ChunkEntry>,
}

/// JSON file chunk ledger, rewritten atomically (temp file + rename, then a
/// sync of the directory) on every status change. Batches from
/// [`ChunkLedger::mark_all_done`] are a single rewrite.
#[derive(Clone)]
pub struct FileChunkLedger {
    path: PathBuf,
    entries: Arc<Mutex<BTreeMap<u64, ChunkEntry>>>,
}

impl FileChunkLedger {
    /// Load the ledger at `path`. A missing file is an empty ledger; nothing
    /// is written until the first status change.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref().to_path_buf();
        let entries = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let file: LedgerFile = serde_json::from_slice(&bytes).map_err(|e| {
                    AppError::LedgerError(format!("{} is not a chunk ledger: {e}", path.display()))
                })?;
                file.chunks.into_iter().map(|e| (e.start, e)).collect()
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), chunks = entries.len(), "Opened chunk ledger");
        Ok(Self {
            path,
            entries: Arc::new(Mutex::new(entries)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// All known chunks ordered by start index.
    pub fn entries(&self) -> Vec<ChunkEntry> {
        lock(&self.entries).values().cloned().collect()
    }

    fn persist(path: &Path, entries: &BTreeMap<u64, ChunkEntry>) -> Result<(), AppError> {
        let file = LedgerFile {
            chunks: entries.values().cloned().collect(),
        };
        let bytes = serde_json::to_vec_pretty(&file)?;

        let mut tmp = path.as_os_str().to_owned();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);
        {
            use std::io::Write;
            let mut out = std::fs::File::create(&tmp)?;
            out.write_all(&bytes)?;
            out.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        sync_parent(path)
    }

    /// Insert `updates` and persist once. Memory is restored if the write fails.
    async fn apply(&self, updates: Vec<ChunkEntry>) -> Result<(), AppError> {
        let path = self.path.clone();
        let entries = Arc::clone(&self.entries);

        tokio::task::spawn_blocking(move || {
            let mut entries = lock(&entries);
            let previous: Vec<(u64, Option<ChunkEntry>)> = updates
                .into_iter()
                .map(|entry| (entry.start, entries.insert(entry.start, entry)))
                .collect();
            if let Err(e) = Self::persist(&path, &entries) {
                for (start, prev) in previous.into_iter().rev() {
                    match prev {
                        Some(prev) => entries.insert(start, prev),
                        None => entries.remove(&start),
                    };
                }
                return Err(e);
            }
            Ok(())
        })
        .await
        .map_err(|e| AppError::LedgerError(format!("chunk ledger task failed: {e}")))?
    }
}

/// Make a rename durable by syncing the directory that holds it.
#[cfg(unix)]
fn sync_parent(path: &Path) -> Result<(), AppError> {
    let dir = match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    };
    std::fs::File::open(dir)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent(_path: &Path) -> Result<(), AppError> {
    Ok(())
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl ChunkLedger for FileChunkLedger {
    async fn status(&self, id: ChunkId) -> Result<Option<ChunkStatus>, AppError> {
        Ok(lock(&self.entries).get(&id.start()).map(|e| e.status))
    }

    async fn set_status(&self, chunk: &Chunk, status: ChunkStatus) -> Result<(), AppError> {
        self.apply(vec![ChunkEntry::new(chunk, status)]).await
    }

    async fn mark_all_done(&self, chunks: &[Chunk]) -> Result<(), AppError> {
        let updates = chunks
            .iter()
            .map(|chunk| ChunkEntry::new(chunk, ChunkStatus::Done))
            .collect();
        self.apply(updates).await
    }
}
