//! Replay planning and peer reconciliation
//!
//! Records are applied on top of the actor's last checkpoint. With a peer
//! journal the side that lags replays first, then the leading side supplies
//! only the records beyond the lagging sequence; the lagging journal is
//! caught up so both watermarks end equal.

use super::{Journal, JournalRecord};
use crate::{ActorError, Result};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Which journal of a pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplaySide {
    Local,
    Peer,
}

/// Records the lagging journal is missing
#[derive(Debug, Clone)]
pub struct CatchUp {
    pub lagging: ReplaySide,
    pub records: Vec<JournalRecord>,
}

/// Ordered records to drive through dispatch, plus any catch-up work
#[derive(Debug, Clone)]
pub struct ReplayPlan {
    pub records: Vec<JournalRecord>,
    pub catch_up: Option<CatchUp>,
    /// Sequence both journals hold once the plan is applied
    pub target_sequence: u64,
}

impl ReplayPlan {
    /// Replay of the local journal alone
    pub async fn local(journal: &Journal) -> Result<Self> {
        let base = journal.checkpoint_sequence();
        let records = journal.records_after(base).await?;
        ensure_contiguous(&records, base)?;
        Ok(Self {
            target_sequence: journal.sequence_replay(),
            records,
            catch_up: None,
        })
    }

    /// Merge the local and peer journals into one replay order
    pub async fn reconcile(local: &Journal, peer: &Journal) -> Result<Self> {
        let base = local.checkpoint_sequence();
        let s_local = local.sequence_replay();
        let s_peer = peer.sequence_replay();

        let plan = match s_local.cmp(&s_peer) {
            Ordering::Less => {
                let mut records = local.records_after(base).await?;
                let tail = peer.records_after(s_local).await?;
                records.extend(tail.iter().cloned());
                Self {
                    records,
                    catch_up: Some(CatchUp {
                        lagging: ReplaySide::Local,
                        records: tail,
                    }),
                    target_sequence: s_peer,
                }
            }
            Ordering::Greater => {
                let mut records = peer.records_after(base).await?;
                let tail = local.records_after(s_peer).await?;
                records.extend(tail.iter().cloned());
                Self {
                    records,
                    catch_up: Some(CatchUp {
                        lagging: ReplaySide::Peer,
                        records: tail,
                    }),
                    target_sequence: s_local,
                }
            }
            Ordering::Equal => {
                // Nothing on the peer lies beyond the local sequence, so the
                // peer pass is empty and local replays in full.
                let mut records = peer.records_after(s_local).await?;
                records.extend(local.records_after(base).await?);
                Self {
                    records,
                    catch_up: None,
                    target_sequence: s_local,
                }
            }
        };

        ensure_contiguous(&plan.records, base)?;
        debug!(
            local = %local.name(),
            peer = %peer.name(),
            s_local = s_local,
            s_peer = s_peer,
            records = plan.records.len(),
            "Replay plan built"
        );
        Ok(plan)
    }

    /// Bring the lagging journal up to the target and flush it
    pub async fn apply_catch_up(&self, local: &Journal, peer: &Journal) -> Result<usize> {
        let Some(catch_up) = &self.catch_up else {
            return Ok(0);
        };
        let lagging = match catch_up.lagging {
            ReplaySide::Local => local,
            ReplaySide::Peer => peer,
        };

        let mut appended = 0;
        for record in &catch_up.records {
            if lagging.append_replicated(record).await? {
                appended += 1;
            }
        }
        lagging.flush().await?;

        info!(
            journal = %lagging.name(),
            appended = appended,
            sequence = lagging.sequence_replay(),
            "Journal caught up with peer"
        );
        Ok(appended)
    }
}

/// Replay must apply every record after the checkpoint exactly once
fn ensure_contiguous(records: &[JournalRecord], base: u64) -> Result<()> {
    let mut expected = base + 1;
    for record in records {
        if record.sequence != expected {
            return Err(ActorError::journal(format!(
                "replay expected sequence {} but found {}",
                expected, record.sequence
            )));
        }
        expected += 1;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::JournalConfig;
    use serde_json::json;
    use std::sync::Arc;

    async fn journal_with(name: &str, values: &[i64]) -> Arc<Journal> {
        let journal = Journal::in_memory(name, JournalConfig::default())
            .await
            .unwrap();
        for v in values {
            journal.write_send("counter", "increment", &[json!(v)]).await.unwrap();
        }
        journal.flush().await.unwrap();
        journal
    }

    fn args(plan: &ReplayPlan) -> Vec<i64> {
        plan.records
            .iter()
            .map(|r| r.args[0].as_i64().unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_local_lags_peer() {
        let local = journal_with("local", &[1, 2]).await;
        let peer = journal_with("peer", &[1, 2, 3, 4]).await;

        let plan = ReplayPlan::reconcile(&local, &peer).await.unwrap();
        assert_eq!(args(&plan), vec![1, 2, 3, 4]);
        assert_eq!(plan.target_sequence, 4);

        let catch_up = plan.catch_up.as_ref().unwrap();
        assert_eq!(catch_up.lagging, ReplaySide::Local);
        assert_eq!(catch_up.records.len(), 2);

        assert_eq!(plan.apply_catch_up(&local, &peer).await.unwrap(), 2);
        assert_eq!(local.sequence_replay(), 4);
        assert_eq!(peer.sequence_replay(), 4);
    }

    #[tokio::test]
    async fn test_peer_lags_local() {
        let local = journal_with("local", &[1, 2, 3]).await;
        let peer = journal_with("peer", &[1]).await;

        let plan = ReplayPlan::reconcile(&local, &peer).await.unwrap();
        assert_eq!(args(&plan), vec![1, 2, 3]);
        assert_eq!(plan.catch_up.as_ref().unwrap().lagging, ReplaySide::Peer);

        plan.apply_catch_up(&local, &peer).await.unwrap();
        assert_eq!(peer.sequence_replay(), 3);
        assert_eq!(peer.records_after(0).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_equal_sequences_replay_once() {
        let local = journal_with("local", &[5, 6]).await;
        let peer = journal_with("peer", &[5, 6]).await;

        let plan = ReplayPlan::reconcile(&local, &peer).await.unwrap();
        assert_eq!(args(&plan), vec![5, 6]);
        assert!(plan.catch_up.is_none());
        assert_eq!(plan.apply_catch_up(&local, &peer).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_replay_starts_after_checkpoint() {
        let local = journal_with("local", &[1, 2, 3]).await;
        assert!(local.save_start().await.unwrap());
        local.save_end(true).await.unwrap();
        local.write_send("counter", "increment", &[json!(4)]).await.unwrap();
        local.flush().await.unwrap();

        let plan = ReplayPlan::local(&local).await.unwrap();
        assert_eq!(args(&plan), vec![4]);
    }

    #[tokio::test]
    async fn test_gap_is_reported() {
        let local = journal_with("local", &[1]).await;
        let peer = journal_with("peer", &[1, 2, 3]).await;
        // Peer checkpointed past what the local side holds.
        assert!(peer.save_start().await.unwrap());
        peer.save_end(true).await.unwrap();
        peer.write_send("counter", "increment", &[json!(4)]).await.unwrap();
        peer.flush().await.unwrap();

        let err = ReplayPlan::reconcile(&local, &peer).await.unwrap_err();
        assert_eq!(err.category(), "journal");
    }
}
