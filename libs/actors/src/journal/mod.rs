//! Journal
//!
//! Append-only, per-actor log of modify calls. Records are sequence numbered
//! without gaps; `sequence_replay()` is the last sequence known to be durable
//! and is what peers compare during reconciliation.
//!
//! The append path is single-writer per actor (the mailbox guarantees it).
//! Flush and checkpoint may also be driven by a maintenance task, so both go
//! through the same lock: a checkpoint boundary is always taken on a flushed
//! prefix and a flush never lands half inside a checkpoint.

pub mod replay;
pub mod store;

pub use replay::{CatchUp, ReplayPlan, ReplaySide};
pub use store::{FileJournalStore, JournalStore, MemoryJournalStore};

use crate::config::JournalConfig;
use crate::messages::current_timestamp_ns;
use crate::{ActorError, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Which call shape produced a record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Send,
    Query,
}

/// One journaled modify call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub address: String,
    pub method: String,
    pub args: Vec<Value>,
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub kind: RecordKind,
}

#[derive(Debug)]
struct JournalState {
    /// Last sequence handed to an appended record
    last_sequence: u64,
    /// Boundary captured by an in-progress checkpoint
    save_boundary: Option<u64>,
    /// Records appended since the last completed checkpoint
    since_save: u64,
    last_save: Instant,
}

/// Durable log of modify calls for one actor
pub struct Journal {
    name: String,
    store: Arc<dyn JournalStore>,
    config: JournalConfig,
    state: Mutex<JournalState>,
    replay_sequence: AtomicU64,
    checkpoint_sequence: AtomicU64,
    saving: AtomicBool,
}

impl std::fmt::Debug for Journal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Journal")
            .field("name", &self.name)
            .field("replay_sequence", &self.sequence_replay())
            .field("checkpoint_sequence", &self.checkpoint_sequence())
            .field("saving", &self.is_saving())
            .finish()
    }
}

impl Journal {
    /// Open a journal over a store, recovering the sequence watermark
    pub async fn open(
        name: impl Into<String>,
        store: Arc<dyn JournalStore>,
        config: JournalConfig,
    ) -> Result<Arc<Self>> {
        let name = name.into();
        let last_sequence = store.last_sequence().await?;
        let durable_sequence = store.durable_sequence().await?;
        let checkpoint = store.checkpoint_sequence().await?;

        info!(
            journal = %name,
            last_sequence = last_sequence,
            durable_sequence = durable_sequence,
            checkpoint_sequence = checkpoint,
            "Journal opened"
        );

        Ok(Arc::new(Self {
            name,
            store,
            config,
            state: Mutex::new(JournalState {
                last_sequence,
                save_boundary: None,
                since_save: last_sequence.saturating_sub(checkpoint),
                last_save: Instant::now(),
            }),
            replay_sequence: AtomicU64::new(durable_sequence),
            checkpoint_sequence: AtomicU64::new(checkpoint),
            saving: AtomicBool::new(false),
        }))
    }

    /// Journal over a fresh in-memory store
    pub async fn in_memory(name: impl Into<String>, config: JournalConfig) -> Result<Arc<Self>> {
        Self::open(name, Arc::new(MemoryJournalStore::new()), config).await
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn store(&self) -> &Arc<dyn JournalStore> {
        &self.store
    }

    /// Journal a fire-and-forget modify call
    pub async fn write_send(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> Result<JournalRecord> {
        self.write(address, method, args, RecordKind::Send).await
    }

    /// Journal a request/response modify call. The reply continuation itself
    /// is never recorded; replay has nobody to answer.
    pub async fn write_query(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
    ) -> Result<JournalRecord> {
        self.write(address, method, args, RecordKind::Query).await
    }

    async fn write(
        &self,
        address: &str,
        method: &str,
        args: &[Value],
        kind: RecordKind,
    ) -> Result<JournalRecord> {
        let mut state = self.state.lock().await;
        let sequence = state.last_sequence + 1;
        let record = JournalRecord {
            address: address.to_string(),
            method: method.to_string(),
            args: args.to_vec(),
            sequence,
            timestamp_ns: current_timestamp_ns(),
            kind,
        };

        self.store.append(std::slice::from_ref(&record)).await?;
        state.last_sequence = sequence;
        state.since_save += 1;
        Ok(record)
    }

    /// Append a record that already carries a sequence number, as received
    /// from the journal this one replicates.
    ///
    /// Returns `Ok(false)` for a record at or below the current sequence.
    /// A record that would leave a gap is rejected.
    pub async fn append_replicated(&self, record: &JournalRecord) -> Result<bool> {
        let mut state = self.state.lock().await;
        if record.sequence <= state.last_sequence {
            return Ok(false);
        }
        if record.sequence != state.last_sequence + 1 {
            return Err(ActorError::journal(format!(
                "{}: replicated record {} would leave a gap after {}",
                self.name, record.sequence, state.last_sequence
            )));
        }

        self.store.append(std::slice::from_ref(record)).await?;
        state.last_sequence = record.sequence;
        state.since_save += 1;
        Ok(true)
    }

    /// Make every appended record durable and advance the replay watermark
    pub async fn flush(&self) -> Result<()> {
        let state = self.state.lock().await;
        self.store.flush().await?;
        let previous = self.replay_sequence.swap(state.last_sequence, Ordering::AcqRel);
        if previous != state.last_sequence {
            debug!(
                journal = %self.name,
                sequence = state.last_sequence,
                "Journal flushed"
            );
        }
        Ok(())
    }

    /// Last durably recorded sequence. Comparison only.
    pub fn sequence_replay(&self) -> u64 {
        self.replay_sequence.load(Ordering::Acquire)
    }

    /// Sequence covered by the last completed checkpoint
    pub fn checkpoint_sequence(&self) -> u64 {
        self.checkpoint_sequence.load(Ordering::Acquire)
    }

    pub fn is_saving(&self) -> bool {
        self.saving.load(Ordering::Acquire)
    }

    /// Durable records with a sequence greater than `after`, in order
    pub async fn records_after(&self, after: u64) -> Result<Vec<JournalRecord>> {
        let mut records = self.store.read_after(after).await?;
        records.sort_by_key(|r| r.sequence);
        Ok(records)
    }

    /// Begin a checkpoint. Returns false if one is already in progress.
    ///
    /// The boundary is the last appended sequence after a flush; records
    /// appended while the save runs belong to the next checkpoint.
    pub async fn save_start(&self) -> Result<bool> {
        self.save_start_through(u64::MAX).await
    }

    /// Begin a checkpoint whose boundary stops at `limit`. A replica follows
    /// the checkpoint of the journal it mirrors this way and keeps any
    /// records that journal has not seen yet.
    pub async fn save_start_through(&self, limit: u64) -> Result<bool> {
        if self.saving.swap(true, Ordering::AcqRel) {
            debug!(journal = %self.name, "Checkpoint already in progress");
            return Ok(false);
        }

        let mut state = self.state.lock().await;
        if let Err(e) = self.store.flush().await {
            self.saving.store(false, Ordering::Release);
            return Err(e);
        }
        self.replay_sequence.store(state.last_sequence, Ordering::Release);
        let boundary = state.last_sequence.min(limit);
        state.save_boundary = Some(boundary);

        debug!(
            journal = %self.name,
            boundary = boundary,
            "Checkpoint started"
        );
        Ok(true)
    }

    /// Finish a checkpoint. A complete save discards records through the
    /// boundary; an incomplete one leaves the tail intact for retry.
    pub async fn save_end(&self, complete: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let Some(boundary) = state.save_boundary.take() else {
            warn!(journal = %self.name, "save_end without save_start");
            return Ok(());
        };

        let result = if complete {
            match self.store.truncate_through(boundary).await {
                Ok(()) => {
                    self.checkpoint_sequence.store(boundary, Ordering::Release);
                    state.since_save = state.last_sequence - boundary;
                    state.last_save = Instant::now();
                    info!(journal = %self.name, boundary = boundary, "Checkpoint complete");
                    Ok(())
                }
                Err(e) => Err(e),
            }
        } else {
            warn!(
                journal = %self.name,
                boundary = boundary,
                "Checkpoint incomplete, keeping journal tail"
            );
            Ok(())
        };

        self.saving.store(false, Ordering::Release);
        result
    }

    /// Whether enough has been journaled since the last checkpoint to ask
    /// for another one
    pub async fn is_save_request(&self) -> bool {
        if self.is_saving() {
            return false;
        }
        let state = self.state.lock().await;
        if state.since_save == 0 {
            return false;
        }

        if let Some(every) = self.config.save_every_records {
            if state.since_save >= every {
                return true;
            }
        }
        if let Some(interval) = self.config.save_interval() {
            if state.last_save.elapsed() >= interval {
                return true;
            }
        }
        false
    }

    /// Last sequence handed out, flushed or not
    pub async fn last_sequence(&self) -> u64 {
        self.state.lock().await.last_sequence
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;

    async fn journal(config: JournalConfig) -> Arc<Journal> {
        Journal::in_memory("test", config).await.unwrap()
    }

    #[tokio::test]
    async fn test_sequences_are_gapless() {
        let journal = journal(JournalConfig::default()).await;
        let first = journal.write_send("c", "increment", &[json!(1)]).await.unwrap();
        assert_eq!(first.sequence, 1);
        let second = journal.write_query("c", "increment", &[json!(2)]).await.unwrap();
        assert_eq!(second.sequence, 2);
        let third = journal.write_send("c", "increment", &[json!(3)]).await.unwrap();
        assert_eq!(third.sequence, 3);

        // Nothing is durable until flushed.
        assert_eq!(journal.sequence_replay(), 0);
        assert!(journal.records_after(0).await.unwrap().is_empty());

        journal.flush().await.unwrap();
        assert_eq!(journal.sequence_replay(), 3);

        let records = journal.records_after(0).await.unwrap();
        let sequences: Vec<u64> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(sequences, vec![1, 2, 3]);
        assert_eq!(records[1].kind, RecordKind::Query);
        assert_eq!(records[2].args, vec![json!(3)]);
    }

    #[tokio::test]
    async fn test_bounded_save_keeps_records_past_limit() {
        let journal = journal(JournalConfig::default()).await;
        for _ in 0..3 {
            journal.write_send("c", "m", &[]).await.unwrap();
        }

        assert!(journal.save_start_through(2).await.unwrap());
        journal.save_end(true).await.unwrap();

        assert_eq!(journal.checkpoint_sequence(), 2);
        let tail = journal.records_after(0).await.unwrap();
        assert_eq!(tail.iter().map(|r| r.sequence).collect::<Vec<_>>(), vec![3]);
    }

    #[tokio::test]
    async fn test_save_start_is_exclusive() {
        let journal = journal(JournalConfig::default()).await;
        journal.write_send("c", "m", &[]).await.unwrap();

        assert!(journal.save_start().await.unwrap());
        assert!(!journal.save_start().await.unwrap());
        assert!(journal.is_saving());

        journal.save_end(true).await.unwrap();
        assert!(!journal.is_saving());
        assert_eq!(journal.checkpoint_sequence(), 1);
        assert!(journal.save_start().await.unwrap());
        journal.save_end(true).await.unwrap();
    }

    #[tokio::test]
    async fn test_records_during_save_belong_to_next_checkpoint() {
        let journal = journal(JournalConfig::default()).await;
        journal.write_send("c", "m", &[json!(1)]).await.unwrap();
        journal.write_send("c", "m", &[json!(2)]).await.unwrap();

        assert!(journal.save_start().await.unwrap());
        journal.write_send("c", "m", &[json!(3)]).await.unwrap();
        journal.flush().await.unwrap();
        journal.save_end(true).await.unwrap();

        let remaining = journal.records_after(0).await.unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].sequence, 3);
        assert_eq!(journal.checkpoint_sequence(), 2);
    }

    #[tokio::test]
    async fn test_incomplete_save_keeps_tail() {
        let journal = journal(JournalConfig::default()).await;
        journal.write_send("c", "m", &[]).await.unwrap();
        journal.write_send("c", "m", &[]).await.unwrap();

        assert!(journal.save_start().await.unwrap());
        journal.save_end(false).await.unwrap();

        assert_eq!(journal.records_after(0).await.unwrap().len(), 2);
        assert_eq!(journal.checkpoint_sequence(), 0);
        // Retry is allowed.
        assert!(journal.save_start().await.unwrap());
        journal.save_end(true).await.unwrap();
        assert!(journal.records_after(0).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_request_by_count() {
        let journal = journal(JournalConfig {
            save_every_records: Some(2),
            save_interval_ms: None,
        })
        .await;

        assert!(!journal.is_save_request().await);
        journal.write_send("c", "m", &[]).await.unwrap();
        assert!(!journal.is_save_request().await);
        journal.write_send("c", "m", &[]).await.unwrap();
        assert!(journal.is_save_request().await);

        assert!(journal.save_start().await.unwrap());
        assert!(!journal.is_save_request().await);
        journal.save_end(true).await.unwrap();
        assert!(!journal.is_save_request().await);
    }

    #[tokio::test]
    async fn test_save_request_by_interval() {
        let journal = journal(JournalConfig {
            save_every_records: None,
            save_interval_ms: Some(10),
        })
        .await;

        journal.write_send("c", "m", &[]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(journal.is_save_request().await);
    }

    #[tokio::test]
    async fn test_append_replicated_rejects_gaps() {
        let leader = journal(JournalConfig::default()).await;
        let follower = journal(JournalConfig::default()).await;
        for i in 0..3 {
            leader.write_send("c", "m", &[json!(i)]).await.unwrap();
        }
        leader.flush().await.unwrap();
        let records = leader.records_after(0).await.unwrap();

        assert!(follower.append_replicated(&records[0]).await.unwrap());
        assert!(!follower.append_replicated(&records[0]).await.unwrap());
        assert!(follower.append_replicated(&records[1]).await.is_ok());

        let mut skipped = records[2].clone();
        skipped.sequence = 5;
        assert!(follower.append_replicated(&skipped).await.is_err());
    }

    #[tokio::test]
    async fn test_reopen_recovers_sequence() {
        let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
        let journal = Journal::open("c", Arc::clone(&store), JournalConfig::default())
            .await
            .unwrap();
        journal.write_send("c", "m", &[]).await.unwrap();
        journal.write_send("c", "m", &[]).await.unwrap();
        journal.flush().await.unwrap();
        drop(journal);

        let reopened = Journal::open("c", store, JournalConfig::default()).await.unwrap();
        assert_eq!(reopened.sequence_replay(), 2);
        assert_eq!(reopened.write_send("c", "m", &[]).await.unwrap().sequence, 3);
    }

    #[tokio::test]
    async fn test_reopen_watermark_ignores_unflushed_records() {
        let store: Arc<dyn JournalStore> = Arc::new(MemoryJournalStore::new());
        let journal = Journal::open("c", Arc::clone(&store), JournalConfig::default())
            .await
            .unwrap();
        journal.write_send("c", "m", &[]).await.unwrap();
        journal.flush().await.unwrap();
        journal.write_send("c", "m", &[]).await.unwrap();
        drop(journal);

        let reopened = Journal::open("c", store, JournalConfig::default()).await.unwrap();
        assert_eq!(reopened.sequence_replay(), 1);
        assert_eq!(reopened.last_sequence().await, 2);

        reopened.flush().await.unwrap();
        assert_eq!(reopened.sequence_replay(), 2);
    }
}
