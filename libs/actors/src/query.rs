//! Query Correlation Registry
//!
//! Maps outstanding query and stream ids to their pending continuations. The
//! registry is shared by every mailbox of one runtime and is touched
//! concurrently: a reply can be produced on a different worker than the one
//! that issued the call.
//!
//! An entry lives from registration until exactly one terminal event
//! (complete, fail, cancel, or the synthesized timeout) removes it. Removal
//! happens before delivery, so a second terminal for the same id finds
//! nothing and is a no-op; a late reply after a timeout is discarded.

use crate::{ActorError, Result};
use dashmap::DashMap;
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::task::AbortHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// One event on a stream's channel
#[derive(Debug, Clone)]
pub enum StreamEvent {
    /// A batch of values stamped with its production order
    Batch { sequence: u64, values: Vec<Value> },
    /// Terminal success; `batches` is how many batches were emitted
    Complete { batches: u64 },
    /// Terminal failure
    Failed(ActorError),
}

enum Continuation {
    Query(oneshot::Sender<Result<Value>>),
    Stream(mpsc::UnboundedSender<StreamEvent>),
}

struct QueryEntry {
    origin: String,
    created_at: Instant,
    continuation: Continuation,
    cancel: CancellationToken,
    timer: Option<AbortHandle>,
}

impl QueryEntry {
    fn disarm(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }
}

/// Observable view of a pending entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryEntryInfo {
    pub id: u64,
    pub origin: String,
    pub age: Duration,
    pub cancelled: bool,
}

/// Correlation table for one runtime instance
pub struct QueryRegistry {
    entries: DashMap<u64, QueryEntry>,
    next_id: AtomicU64,
}

impl fmt::Debug for QueryRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryRegistry")
            .field("pending", &self.entries.len())
            .field("next_id", &self.next_id.load(Ordering::Relaxed))
            .finish()
    }
}

impl QueryRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            entries: DashMap::new(),
            next_id: AtomicU64::new(1),
        })
    }

    fn allocate_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Create a query entry; the entry exists before the message is enqueued
    pub fn register_query(
        self: &Arc<Self>,
        origin: impl Into<String>,
        timeout: Option<Duration>,
    ) -> (QueryReply, PendingQuery) {
        let id = self.allocate_id();
        let (tx, rx) = oneshot::channel();

        self.entries.insert(
            id,
            QueryEntry {
                origin: origin.into(),
                created_at: Instant::now(),
                continuation: Continuation::Query(tx),
                cancel: CancellationToken::new(),
                timer: None,
            },
        );
        if let Some(timeout) = timeout {
            self.arm_timeout(id, timeout);
        }

        trace!(query_id = id, "Registered query");
        let reply = QueryReply {
            id,
            registry: Arc::clone(self),
            resolved: false,
        };
        (reply, PendingQuery { id, rx })
    }

    /// Create a stream entry
    pub fn register_stream(
        self: &Arc<Self>,
        origin: impl Into<String>,
        timeout: Option<Duration>,
    ) -> (StreamReply, ResultStream) {
        let id = self.allocate_id();
        let (tx, rx) = mpsc::unbounded_channel();
        let token = CancellationToken::new();

        self.entries.insert(
            id,
            QueryEntry {
                origin: origin.into(),
                created_at: Instant::now(),
                continuation: Continuation::Stream(tx),
                cancel: token.clone(),
                timer: None,
            },
        );
        if let Some(timeout) = timeout {
            self.arm_timeout(id, timeout);
        }

        trace!(query_id = id, "Registered stream");
        let reply = StreamReply {
            id,
            registry: Arc::clone(self),
            token: token.clone(),
            next_sequence: Arc::new(AtomicU64::new(0)),
            resolved: false,
        };
        let stream = ResultStream {
            id,
            registry: Arc::downgrade(self),
            rx,
            token,
            next_sequence: 0,
            buffered: BTreeMap::new(),
            total_batches: None,
            failure: None,
            finished: false,
        };
        (reply, stream)
    }

    fn arm_timeout(self: &Arc<Self>, id: u64, timeout: Duration) {
        let registry = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(registry) = registry.upgrade() {
                let timeout_ms = timeout.as_millis() as u64;
                if registry.fail(id, ActorError::timeout(format!("call {}", id), timeout_ms)) {
                    debug!(query_id = id, timeout_ms = timeout_ms, "Query timed out");
                }
            }
        })
        .abort_handle();

        match self.entries.get_mut(&id) {
            Some(mut entry) => entry.timer = Some(handle),
            None => handle.abort(),
        }
    }

    fn take(&self, id: u64) -> Option<QueryEntry> {
        let (_, mut entry) = self.entries.remove(&id)?;
        entry.disarm();
        Some(entry)
    }

    /// Terminal success. Returns false if the id is no longer registered.
    pub fn complete(&self, id: u64, value: Value) -> bool {
        let Some(entry) = self.take(id) else {
            debug!(query_id = id, "Discarding late reply for unknown id");
            return false;
        };

        match entry.continuation {
            Continuation::Query(tx) => {
                let _ = tx.send(Ok(value));
            }
            Continuation::Stream(tx) => {
                let _ = tx.send(StreamEvent::Complete { batches: 0 });
            }
        }
        true
    }

    /// Terminal failure. Returns false if the id is no longer registered.
    pub fn fail(&self, id: u64, err: ActorError) -> bool {
        let Some(entry) = self.take(id) else {
            debug!(query_id = id, error = %err, "Discarding late failure for unknown id");
            return false;
        };

        match entry.continuation {
            Continuation::Query(tx) => {
                let _ = tx.send(Err(err));
            }
            Continuation::Stream(tx) => {
                entry.cancel.cancel();
                let _ = tx.send(StreamEvent::Failed(err));
            }
        }
        true
    }

    /// Caller-side cancellation. Advisory for streams: a production step that
    /// already started may still finish, but its output is discarded.
    pub fn cancel(&self, id: u64) -> bool {
        let Some(entry) = self.take(id) else {
            return false;
        };

        entry.cancel.cancel();
        match entry.continuation {
            Continuation::Query(tx) => {
                let _ = tx.send(Err(ActorError::cancelled(id)));
            }
            Continuation::Stream(tx) => {
                let _ = tx.send(StreamEvent::Failed(ActorError::cancelled(id)));
            }
        }
        debug!(query_id = id, "Call cancelled");
        true
    }

    /// Deliver one stream batch without removing the entry
    pub(crate) fn emit(&self, id: u64, sequence: u64, values: Vec<Value>) -> bool {
        let Some(entry) = self.entries.get(&id) else {
            return false;
        };

        match &entry.continuation {
            Continuation::Stream(tx) => tx.send(StreamEvent::Batch { sequence, values }).is_ok(),
            Continuation::Query(_) => false,
        }
    }

    /// Terminal success for a stream that produced `batches` batches
    pub(crate) fn complete_stream(&self, id: u64, batches: u64) -> bool {
        let Some(entry) = self.take(id) else {
            debug!(query_id = id, "Discarding completion for unknown stream");
            return false;
        };

        match entry.continuation {
            Continuation::Stream(tx) => {
                let _ = tx.send(StreamEvent::Complete { batches });
            }
            Continuation::Query(tx) => {
                let _ = tx.send(Ok(Value::Null));
            }
        }
        true
    }

    pub fn contains(&self, id: u64) -> bool {
        self.entries.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn info(&self, id: u64) -> Option<QueryEntryInfo> {
        self.entries.get(&id).map(|entry| QueryEntryInfo {
            id,
            origin: entry.origin.clone(),
            age: entry.created_at.elapsed(),
            cancelled: entry.cancel.is_cancelled(),
        })
    }
}

/// Single-resolution continuation for a query.
///
/// Consumed by `ok`/`fail`. Dropping it unresolved fails the caller, so the
/// caller always observes exactly one terminal event.
pub struct QueryReply {
    id: u64,
    registry: Arc<QueryRegistry>,
    resolved: bool,
}

impl fmt::Debug for QueryReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryReply").field("id", &self.id).finish()
    }
}

impl QueryReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn ok(mut self, value: Value) -> bool {
        self.resolved = true;
        self.registry.complete(self.id, value)
    }

    pub fn fail(mut self, err: ActorError) -> bool {
        self.resolved = true;
        self.registry.fail(self.id, err)
    }

    pub fn resolve(self, result: Result<Value>) -> bool {
        match result {
            Ok(value) => self.ok(value),
            Err(err) => self.fail(err),
        }
    }
}

impl Drop for QueryReply {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.fail(
                self.id,
                ActorError::illegal_state(format!("query {} dropped without a reply", self.id)),
            );
        }
    }
}

/// Caller side of a query
#[derive(Debug)]
pub struct PendingQuery {
    id: u64,
    rx: oneshot::Receiver<Result<Value>>,
}

impl PendingQuery {
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Future for PendingQuery {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            Poll::Ready(Err(_)) => Poll::Ready(Err(ActorError::illegal_state(format!(
                "reply channel for query {} closed",
                self.id
            )))),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Producer-side continuation for a stream call
pub struct StreamReply {
    id: u64,
    registry: Arc<QueryRegistry>,
    token: CancellationToken,
    next_sequence: Arc<AtomicU64>,
    resolved: bool,
}

impl fmt::Debug for StreamReply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamReply")
            .field("id", &self.id)
            .field("cancelled", &self.token.is_cancelled())
            .finish()
    }
}

impl StreamReply {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Handle the actor uses to emit batches
    pub fn sink(&self) -> StreamSink {
        StreamSink {
            id: self.id,
            registry: Arc::clone(&self.registry),
            token: self.token.clone(),
            next_sequence: Arc::clone(&self.next_sequence),
        }
    }

    pub fn complete(mut self) -> bool {
        self.resolved = true;
        let batches = self.next_sequence.load(Ordering::Acquire);
        self.registry.complete_stream(self.id, batches)
    }

    pub fn fail(mut self, err: ActorError) -> bool {
        self.resolved = true;
        self.registry.fail(self.id, err)
    }

    pub fn resolve(self, result: Result<()>) -> bool {
        match result {
            Ok(()) => self.complete(),
            Err(err) => self.fail(err),
        }
    }
}

impl Drop for StreamReply {
    fn drop(&mut self) {
        if !self.resolved {
            self.registry.fail(
                self.id,
                ActorError::illegal_state(format!("stream {} dropped without completion", self.id)),
            );
        }
    }
}

/// Emits sequenced batches for one stream call
#[derive(Clone)]
pub struct StreamSink {
    id: u64,
    registry: Arc<QueryRegistry>,
    token: CancellationToken,
    next_sequence: Arc<AtomicU64>,
}

impl fmt::Debug for StreamSink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamSink")
            .field("id", &self.id)
            .field("next_sequence", &self.next_sequence.load(Ordering::Relaxed))
            .finish()
    }
}

impl StreamSink {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Checked between batches; production should stop once set
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Emit one batch. Returns false once the caller is gone or cancelled.
    pub fn emit(&self, values: Vec<Value>) -> bool {
        if self.token.is_cancelled() {
            return false;
        }
        let sequence = self.next_sequence.fetch_add(1, Ordering::AcqRel);
        self.registry.emit(self.id, sequence, values)
    }

    pub fn emit_one(&self, value: Value) -> bool {
        self.emit(vec![value])
    }
}

/// Caller side of a stream: reassembles batches in sequence order
pub struct ResultStream {
    id: u64,
    registry: Weak<QueryRegistry>,
    rx: mpsc::UnboundedReceiver<StreamEvent>,
    token: CancellationToken,
    next_sequence: u64,
    buffered: BTreeMap<u64, Vec<Value>>,
    total_batches: Option<u64>,
    failure: Option<ActorError>,
    finished: bool,
}

impl fmt::Debug for ResultStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultStream")
            .field("id", &self.id)
            .field("next_sequence", &self.next_sequence)
            .field("finished", &self.finished)
            .finish()
    }
}

impl ResultStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Next batch in sequence order; `None` after successful completion
    pub async fn next(&mut self) -> Option<Result<Vec<Value>>> {
        loop {
            if let Some(values) = self.buffered.remove(&self.next_sequence) {
                self.next_sequence += 1;
                return Some(Ok(values));
            }
            if let Some(total) = self.total_batches {
                if self.next_sequence >= total {
                    self.finished = true;
                    return None;
                }
            }
            if let Some(err) = self.failure.take() {
                self.finished = true;
                return Some(Err(err));
            }
            if self.finished {
                return None;
            }

            match self.rx.recv().await {
                Some(StreamEvent::Batch { sequence, values }) => {
                    if sequence >= self.next_sequence {
                        self.buffered.insert(sequence, values);
                    }
                }
                Some(StreamEvent::Complete { batches }) => {
                    self.total_batches = Some(batches);
                }
                Some(StreamEvent::Failed(err)) => {
                    self.failure = Some(err);
                }
                None => {
                    let complete = matches!(
                        self.total_batches,
                        Some(total) if self.next_sequence >= total
                            || self.buffered.contains_key(&self.next_sequence)
                    );
                    if !complete && self.failure.is_none() {
                        self.total_batches = None;
                        self.failure = Some(ActorError::illegal_state(format!(
                            "stream {} closed before all batches arrived",
                            self.id
                        )));
                    }
                }
            }
        }
    }

    /// Drain the stream into one vector of values
    pub async fn collect_all(mut self) -> Result<Vec<Value>> {
        let mut all = Vec::new();
        while let Some(batch) = self.next().await {
            all.extend(batch?);
        }
        Ok(all)
    }

    /// Cancel the call; the producer sees the flag before its next batch
    pub fn cancel(&mut self) -> bool {
        self.finished = true;
        self.token.cancel();
        match self.registry.upgrade() {
            Some(registry) => registry.cancel(self.id),
            None => false,
        }
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        if !self.finished {
            self.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_ids_increase() {
        let registry = QueryRegistry::new();
        let (r1, p1) = registry.register_query("a", None);
        let (r2, p2) = registry.register_query("a", None);
        assert!(p2.id() > p1.id());
        assert_eq!(registry.len(), 2);
        r1.ok(json!(1));
        r2.ok(json!(2));
        assert_eq!(p1.await.unwrap(), json!(1));
        assert_eq!(p2.await.unwrap(), json!(2));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_second_terminal_is_noop() {
        let registry = QueryRegistry::new();
        let (reply, pending) = registry.register_query("a", None);
        let id = reply.id();

        assert!(registry.complete(id, json!("first")));
        assert!(!registry.complete(id, json!("second")));
        assert!(!registry.fail(id, ActorError::deleted("a")));

        assert_eq!(pending.await.unwrap(), json!("first"));
        // The reply object resolving afterwards is also discarded.
        assert!(!reply.ok(json!("third")));
    }

    #[tokio::test]
    async fn test_timeout_synthesizes_failure_and_removes_entry() {
        let registry = QueryRegistry::new();
        let (reply, pending) = registry.register_query("a", Some(Duration::from_millis(20)));
        let id = pending.id();

        let err = pending.await.unwrap_err();
        assert!(err.is_timeout());
        assert!(!registry.contains(id));

        // Legitimate reply arriving late is discarded.
        assert!(!reply.ok(json!(42)));
    }

    #[tokio::test]
    async fn test_dropped_reply_fails_caller() {
        let registry = QueryRegistry::new();
        let (reply, pending) = registry.register_query("a", None);
        drop(reply);
        assert!(matches!(pending.await, Err(ActorError::IllegalState { .. })));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_info_reports_origin_and_cancel_flag() {
        let registry = QueryRegistry::new();
        let (reply, _stream) = registry.register_stream("caller-7", None);
        let info = registry.info(reply.id()).unwrap();
        assert_eq!(info.origin, "caller-7");
        assert!(!info.cancelled);
        reply.complete();
    }

    #[tokio::test]
    async fn test_stream_reassembles_out_of_order_batches() {
        let registry = QueryRegistry::new();
        let (reply, mut stream) = registry.register_stream("a", None);
        let id = reply.id();

        assert!(registry.emit(id, 1, vec![json!("b")]));
        assert!(registry.emit(id, 0, vec![json!("a")]));
        assert!(registry.emit(id, 2, vec![json!("c")]));
        assert!(registry.complete_stream(id, 3));
        drop(reply);

        assert_eq!(stream.next().await.unwrap().unwrap(), vec![json!("a")]);
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![json!("b")]);
        assert_eq!(stream.next().await.unwrap().unwrap(), vec![json!("c")]);
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_stream_sink_sequences_and_completion() {
        let registry = QueryRegistry::new();
        let (reply, stream) = registry.register_stream("a", None);
        let sink = reply.sink();

        assert!(sink.emit(vec![json!(1), json!(2)]));
        assert!(sink.emit_one(json!(3)));
        assert!(reply.complete());

        assert_eq!(stream.collect_all().await.unwrap(), vec![json!(1), json!(2), json!(3)]);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_stream_cancel_is_observed_by_sink() {
        let registry = QueryRegistry::new();
        let (reply, mut stream) = registry.register_stream("a", None);
        let sink = reply.sink();

        assert!(sink.emit_one(json!(1)));
        assert!(stream.cancel());
        assert!(sink.is_cancelled());
        assert!(!sink.emit_one(json!(2)));
        assert!(!registry.contains(reply.id()));

        // Completing after cancellation is a no-op.
        assert!(!reply.complete());
    }

    #[tokio::test]
    async fn test_stream_failure_after_batches() {
        let registry = QueryRegistry::new();
        let (reply, mut stream) = registry.register_stream("a", None);
        let sink = reply.sink();
        sink.emit_one(json!("x"));
        reply.fail(ActorError::dispatch("a", "scan", "disk"));

        assert_eq!(stream.next().await.unwrap().unwrap(), vec![json!("x")]);
        assert!(matches!(stream.next().await, Some(Err(ActorError::Dispatch { .. }))));
        assert!(stream.next().await.is_none());
    }
}
