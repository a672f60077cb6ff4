//! Append-only journal for a persisted knowledge base.
//!
//! On disk a knowledge base is a JSON snapshot plus a log of every mutation
//! made since that snapshot, one JSON record per line:
//!
//! ```text
//! lore.json      {"version":1,"generation":4,"documents":[...]}
//! lore.json.log  {"generation":4}
//!                {"op":"add","document":{...}}
//!                {"op":"delete","id":"..."}
//! ```
//!
//! An add or delete appends one record, so a mutation costs one small write
//! whatever the size of the corpus. Compaction folds the log into a new
//! snapshot: the live log is renamed to `lore.json.log.old`, the next record
//! starts a log of the next generation, and the snapshot is rewritten off the
//! async runtime. Recovery replays every log whose generation is at least the
//! snapshot's, so a crash at any point of a compaction loses nothing.
//!
//! A record cut short by a crash is dropped on replay. A malformed record
//! anywhere else refuses to open the knowledge base.

use super::store::{self, DocumentStore, Result, StoreError};
use super::types::Document;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

/// One logged mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum JournalRecord {
    Add { document: Document },
    Delete { id: String },
}

/// First line of every log file.
#[derive(Debug, Serialize, Deserialize)]
struct LogHeader {
    generation: u64,
}

/// A parsed log file.
struct LogFile {
    generation: u64,
    records: Vec<JournalRecord>,
}

/// Snapshot plus mutation log for one knowledge base.
#[derive(Debug)]
pub struct Journal {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    rotated_path: PathBuf,
    generation: u64,
    records: usize,
    compact_after: usize,
}

/// A rotated log waiting to be folded into a snapshot.
///
/// Returned by [`Journal::rotate`]; [`Compaction::finish`] does the slow part
/// and needs no access to the journal.
#[derive(Debug)]
pub struct Compaction {
    snapshot_path: PathBuf,
    rotated_path: PathBuf,
    generation: u64,
    documents: Vec<Document>,
}

impl Journal {
    /// Opens the journal at `snapshot_path` and rebuilds the store it describes.
    ///
    /// Vectors must have `dimensions` components. An automatic compaction is
    /// due once the live log holds `compact_after` records; 0 never compacts
    /// automatically.
    ///
    /// Missing files mean an empty knowledge base. Nothing is created until
    /// the first append, except when an interrupted compaction is found: the
    /// leftover logs are then folded into a fresh snapshot before returning.
    pub fn open(
        snapshot_path: impl Into<PathBuf>,
        dimensions: usize,
        compact_after: usize,
    ) -> Result<(Self, DocumentStore)> {
        let snapshot_path = snapshot_path.into();
        let log_path = sibling(&snapshot_path, ".log");
        let rotated_path = sibling(&snapshot_path, ".log.old");

        let (mut store, base_generation) = if snapshot_path.exists() {
            DocumentStore::load_snapshot(&snapshot_path, dimensions)?
        } else {
            (DocumentStore::new(), 0)
        };

        let rotated = read_log(&rotated_path)?;
        let live = read_log(&log_path)?;
        let interrupted = rotated_path.exists();

        let mut generation = base_generation;
        let mut replayed = 0;
        for log in [rotated.as_ref(), live.as_ref()].into_iter().flatten() {
            if log.generation < base_generation {
                debug!(
                    target: "lore_core::knowledge",
                    generation = log.generation,
                    base_generation,
                    "Skipping log already folded into the snapshot"
                );
                continue;
            }
            for record in &log.records {
                replay(&mut store, record, dimensions)?;
            }
            replayed += log.records.len();
            generation = generation.max(log.generation);
        }

        let stale_live = live.as_ref().is_some_and(|log| log.generation < generation);
        let records = match &live {
            Some(log) if !stale_live => log.records.len(),
            _ => 0,
        };

        let mut journal = Self {
            snapshot_path,
            log_path,
            rotated_path,
            generation,
            records,
            compact_after,
        };

        if interrupted || stale_live {
            journal.fold_on_open(&store)?;
        }

        info!(
            target: "lore_core::knowledge",
            path = %journal.snapshot_path.display(),
            generation = journal.generation,
            documents = store.count(),
            replayed,
            "Opened knowledge journal"
        );
        Ok((journal, store))
    }

    /// Appends `record` to the live log and syncs it to disk.
    ///
    /// On failure the log is truncated back to its previous length, so a
    /// failed append leaves no partial record behind.
    pub async fn append(&mut self, record: &JournalRecord) -> Result<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Some(parent) = self.log_path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await?;
        let len = file.metadata().await?.len();

        let mut bytes = Vec::with_capacity(line.len() + 32);
        if len == 0 {
            serde_json::to_writer(&mut bytes, &LogHeader { generation: self.generation })?;
            bytes.push(b'\n');
        }
        bytes.extend_from_slice(&line);

        if let Err(err) = write_synced(&mut file, &bytes).await {
            if let Err(truncate) = file.set_len(len).await {
                warn!(
                    target: "lore_core::knowledge",
                    path = %self.log_path.display(),
                    error = %truncate,
                    "Could not truncate log after a failed append"
                );
            }
            return Err(err.into());
        }

        self.records += 1;
        Ok(())
    }

    /// Whether the live log has grown past the compaction threshold.
    pub fn compaction_due(&self) -> bool {
        self.compact_after > 0 && self.records >= self.compact_after
    }

    /// Current generation: the one the next appended record belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Records in the live log.
    pub fn pending_records(&self) -> usize {
        self.records
    }

    /// Starts a compaction of `store`, which must reflect every record
    /// appended so far.
    ///
    /// Only renames the live log and copies the documents; the snapshot is
    /// written by [`Compaction::finish`]. Returns `None` while a previous
    /// compaction's rotated log is still on disk.
    pub async fn rotate(&mut self, store: &DocumentStore) -> Result<Option<Compaction>> {
        if tokio::fs::try_exists(&self.rotated_path).await? {
            warn!(
                target: "lore_core::knowledge",
                path = %self.rotated_path.display(),
                "Previous compaction did not finish, skipping"
            );
            return Ok(None);
        }

        if tokio::fs::try_exists(&self.log_path).await? {
            tokio::fs::rename(&self.log_path, &self.rotated_path).await?;
        }
        self.generation += 1;
        self.records = 0;

        Ok(Some(Compaction {
            snapshot_path: self.snapshot_path.clone(),
            rotated_path: self.rotated_path.clone(),
            generation: self.generation,
            documents: store.iter().cloned().collect(),
        }))
    }

    /// Folds leftover logs into a fresh snapshot while opening.
    fn fold_on_open(&mut self, store: &DocumentStore) -> Result<()> {
        self.generation += 1;
        store.save_snapshot(&self.snapshot_path, self.generation)?;
        remove_if_exists(&self.log_path)?;
        remove_if_exists(&self.rotated_path)?;
        self.records = 0;

        info!(
            target: "lore_core::knowledge",
            generation = self.generation,
            "Recovered interrupted compaction"
        );
        Ok(())
    }
}

impl Compaction {
    /// Generation of the snapshot this compaction writes.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Writes the snapshot and drops the rotated log.
    ///
    /// Runs on the blocking pool so a large snapshot never stalls the async
    /// runtime.
    pub async fn finish(self) -> Result<()> {
        tokio::task::spawn_blocking(move || self.write())
            .await
            .map_err(|err| StoreError::Io(std::io::Error::new(ErrorKind::Other, err)))?
    }

    fn write(self) -> Result<()> {
        store::write_snapshot(&self.snapshot_path, self.generation, &self.documents)?;
        remove_if_exists(&self.rotated_path)?;

        debug!(
            target: "lore_core::knowledge",
            generation = self.generation,
            documents = self.documents.len(),
            "Compaction written"
        );
        Ok(())
    }
}

fn replay(store: &mut DocumentStore, record: &JournalRecord, dimensions: usize) -> Result<()> {
    match record {
        JournalRecord::Add { document } => {
            store::check_document(document, dimensions)?;
            store.restore(document.clone())
        }
        JournalRecord::Delete { id } => {
            if !store.delete(id) {
                warn!(target: "lore_core::knowledge", document_id = %id, "Logged delete of unknown document");
            }
            Ok(())
        }
    }
}

/// Reads a log file; `None` when it doesn't exist or is empty.
fn read_log(path: &Path) -> Result<Option<LogFile>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err.into()),
    };

    let complete = content.ends_with('\n');
    let mut lines = content.lines();
    let Some(header) = lines.next() else {
        return Ok(None);
    };
    let header: LogHeader = match serde_json::from_str(header) {
        Ok(header) => header,
        // The header itself was cut short: no record was ever acknowledged.
        Err(_) if !complete && content.lines().count() == 1 => return Ok(None),
        Err(err) => {
            return Err(StoreError::Corrupt(format!("{}: bad log header: {}", path.display(), err)));
        }
    };

    let lines: Vec<&str> = lines.collect();
    let mut records = Vec::with_capacity(lines.len());
    for (i, line) in lines.iter().enumerate() {
        match serde_json::from_str(line) {
            Ok(record) => records.push(record),
            Err(_) if !complete && i + 1 == lines.len() => {
                warn!(
                    target: "lore_core::knowledge",
                    path = %path.display(),
                    "Dropping torn record at end of log"
                );
            }
            Err(err) => {
                return Err(StoreError::Corrupt(format!(
                    "{}: bad record {}: {}",
                    path.display(),
                    i + 1,
                    err
                )));
            }
        }
    }

    Ok(Some(LogFile {
        generation: header.generation,
        records,
    }))
}

async fn write_synced(file: &mut tokio::fs::File, bytes: &[u8]) -> std::io::Result<()> {
    file.write_all(bytes).await?;
    file.sync_data().await
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(suffix);
    PathBuf::from(name)
}
