//! Journal storage backends
//!
//! A store only deals in whole records. Appends may be buffered; nothing is
//! visible to `read_after` or counted as durable until `flush` returns.

use super::JournalRecord;
use crate::{ActorError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, warn};

/// Record-level storage under a [`Journal`](super::Journal)
#[async_trait]
pub trait JournalStore: Send + Sync + 'static {
    /// Append records in order; may buffer
    async fn append(&self, records: &[JournalRecord]) -> Result<()>;

    /// Make everything appended so far durable
    async fn flush(&self) -> Result<()>;

    /// Durable records with a sequence greater than `after`
    async fn read_after(&self, after: u64) -> Result<Vec<JournalRecord>>;

    /// Highest sequence ever appended, including truncated records
    async fn last_sequence(&self) -> Result<u64>;

    /// Highest sequence that has reached stable storage. Stores that write
    /// through report `last_sequence`.
    async fn durable_sequence(&self) -> Result<u64> {
        self.last_sequence().await
    }

    /// Sequence covered by the last truncation
    async fn checkpoint_sequence(&self) -> Result<u64>;

    /// Drop durable records with a sequence at or below `sequence`
    async fn truncate_through(&self, sequence: u64) -> Result<()>;
}

#[derive(Debug, Default)]
struct MemoryState {
    durable: Vec<JournalRecord>,
    buffered: Vec<JournalRecord>,
    checkpoint: u64,
}

/// In-process store; durability lasts as long as the value does
#[derive(Debug, Default)]
pub struct MemoryJournalStore {
    state: Mutex<MemoryState>,
}

impl MemoryJournalStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Discard unflushed records, as a process crash would
    pub fn crash(&self) -> usize {
        let mut state = self.state.lock();
        let lost = state.buffered.len();
        state.buffered.clear();
        lost
    }

    pub fn durable_len(&self) -> usize {
        self.state.lock().durable.len()
    }
}

#[async_trait]
impl JournalStore for MemoryJournalStore {
    async fn append(&self, records: &[JournalRecord]) -> Result<()> {
        self.state.lock().buffered.extend_from_slice(records);
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock();
        let buffered = std::mem::take(&mut state.buffered);
        state.durable.extend(buffered);
        Ok(())
    }

    async fn read_after(&self, after: u64) -> Result<Vec<JournalRecord>> {
        let state = self.state.lock();
        Ok(state
            .durable
            .iter()
            .filter(|r| r.sequence > after)
            .cloned()
            .collect())
    }

    async fn last_sequence(&self) -> Result<u64> {
        let state = self.state.lock();
        let last = state
            .buffered
            .last()
            .or_else(|| state.durable.last())
            .map(|r| r.sequence)
            .unwrap_or(0);
        Ok(last.max(state.checkpoint))
    }

    async fn durable_sequence(&self) -> Result<u64> {
        let state = self.state.lock();
        let last = state.durable.last().map(|r| r.sequence).unwrap_or(0);
        Ok(last.max(state.checkpoint))
    }

    async fn checkpoint_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().checkpoint)
    }

    async fn truncate_through(&self, sequence: u64) -> Result<()> {
        let mut state = self.state.lock();
        state.durable.retain(|r| r.sequence > sequence);
        state.checkpoint = state.checkpoint.max(sequence);
        Ok(())
    }
}

/// One line of a journal file
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum StoreEntry {
    Record(JournalRecord),
    Checkpoint { sequence: u64 },
}

struct FileState {
    writer: BufWriter<File>,
    last_sequence: u64,
    /// Last sequence synced to disk
    durable_sequence: u64,
    checkpoint: u64,
}

/// Newline-delimited JSON journal file
///
/// Truncation rewrites the file through a sibling temp file and a rename, so
/// a crash mid-checkpoint leaves either the old or the new file.
pub struct FileJournalStore {
    path: PathBuf,
    state: tokio::sync::Mutex<FileState>,
}

impl std::fmt::Debug for FileJournalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileJournalStore")
            .field("path", &self.path)
            .finish()
    }
}

impl FileJournalStore {
    /// Open or create a journal file, recovering its watermarks
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let (entries, torn) = scan(&path).await?;
        if torn {
            rewrite(&path, &entries).await?;
        }

        let mut last_sequence = 0;
        let mut checkpoint = 0;
        for entry in &entries {
            match entry {
                StoreEntry::Record(record) => last_sequence = last_sequence.max(record.sequence),
                StoreEntry::Checkpoint { sequence } => checkpoint = checkpoint.max(*sequence),
            }
        }

        let writer = open_append(&path).await?;
        debug!(
            path = %path.display(),
            entries = entries.len(),
            last_sequence = last_sequence,
            "Journal file opened"
        );

        Ok(Self {
            path,
            state: tokio::sync::Mutex::new(FileState {
                writer,
                last_sequence: last_sequence.max(checkpoint),
                durable_sequence: last_sequence.max(checkpoint),
                checkpoint,
            }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl JournalStore for FileJournalStore {
    async fn append(&self, records: &[JournalRecord]) -> Result<()> {
        let mut state = self.state.lock().await;
        for record in records {
            let line = encode(&StoreEntry::Record(record.clone()))?;
            state
                .writer
                .write_all(line.as_bytes())
                .await
                .map_err(|e| ActorError::journal_with_source("journal append failed", e))?;
            state.last_sequence = state.last_sequence.max(record.sequence);
        }
        Ok(())
    }

    async fn flush(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        sync(&mut state.writer).await?;
        state.durable_sequence = state.last_sequence;
        Ok(())
    }

    async fn read_after(&self, after: u64) -> Result<Vec<JournalRecord>> {
        let state = self.state.lock().await;
        let floor = after.max(state.checkpoint);
        let entries = read_entries(&self.path).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| match entry {
                StoreEntry::Record(record) if record.sequence > floor => Some(record),
                _ => None,
            })
            .collect())
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().await.last_sequence)
    }

    async fn durable_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().await.durable_sequence)
    }

    async fn checkpoint_sequence(&self) -> Result<u64> {
        Ok(self.state.lock().await.checkpoint)
    }

    async fn truncate_through(&self, sequence: u64) -> Result<()> {
        let mut state = self.state.lock().await;
        sync(&mut state.writer).await?;
        state.durable_sequence = state.last_sequence;

        let checkpoint = state.checkpoint.max(sequence);
        let mut kept = vec![StoreEntry::Checkpoint {
            sequence: checkpoint,
        }];
        kept.extend(
            read_entries(&self.path)
                .await?
                .into_iter()
                .filter(|entry| matches!(entry, StoreEntry::Record(r) if r.sequence > checkpoint)),
        );
        rewrite(&self.path, &kept).await?;

        state.writer = open_append(&self.path).await?;
        state.checkpoint = checkpoint;
        debug!(
            path = %self.path.display(),
            checkpoint = checkpoint,
            kept = kept.len() - 1,
            "Journal file truncated"
        );
        Ok(())
    }
}

fn encode(entry: &StoreEntry) -> Result<String> {
    let mut line = serde_json::to_string(entry)?;
    line.push('\n');
    Ok(line)
}

async fn write_line(writer: &mut BufWriter<File>, line: &str) -> Result<()> {
    writer
        .write_all(line.as_bytes())
        .await
        .map_err(|e| ActorError::journal_with_source("journal write failed", e))
}

async fn sync(writer: &mut BufWriter<File>) -> Result<()> {
    writer
        .flush()
        .await
        .map_err(|e| ActorError::journal_with_source("journal flush failed", e))?;
    writer
        .get_ref()
        .sync_data()
        .await
        .map_err(|e| ActorError::journal_with_source("journal sync failed", e))
}

async fn open_append(path: &Path) -> Result<BufWriter<File>> {
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| ActorError::io(format!("Failed to open {}", path.display()), e))?;
    Ok(BufWriter::new(file))
}

/// Replace the file with `entries` through a temp file and a rename
async fn rewrite(path: &Path, entries: &[StoreEntry]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    let file = File::create(&tmp)
        .await
        .map_err(|e| ActorError::journal_with_source("journal rewrite failed", e))?;
    let mut writer = BufWriter::new(file);
    for entry in entries {
        write_line(&mut writer, &encode(entry)?).await?;
    }
    sync(&mut writer).await?;
    drop(writer);

    tokio::fs::rename(&tmp, path)
        .await
        .map_err(|e| ActorError::journal_with_source("journal rename failed", e))
}

async fn read_entries(path: &Path) -> Result<Vec<StoreEntry>> {
    scan(path).await.map(|(entries, _)| entries)
}

/// Parse every entry; the flag reports a torn final line
async fn scan(path: &Path) -> Result<(Vec<StoreEntry>, bool)> {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
        Err(e) => {
            return Err(ActorError::io(
                format!("Failed to read {}", path.display()),
                e,
            ))
        }
    };

    let lines: Vec<&str> = content.lines().filter(|l| !l.trim().is_empty()).collect();
    let mut entries = Vec::with_capacity(lines.len());
    let mut torn = false;
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_str::<StoreEntry>(line) {
            Ok(entry) => entries.push(entry),
            // A torn final line is an append that never got flushed.
            Err(e) if index + 1 == lines.len() => {
                warn!(path = %path.display(), error = %e, "Ignoring torn journal tail");
                torn = true;
            }
            Err(e) => {
                return Err(ActorError::journal_with_source(
                    format!("corrupt journal {} at line {}", path.display(), index + 1),
                    e,
                ))
            }
        }
    }
    Ok((entries, torn))
}
