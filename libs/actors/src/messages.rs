//! Actor Messages
//!
//! The unit of delivery for a mailbox. A message names its target address and
//! method, carries JSON arguments and propagation headers, and holds exactly
//! one continuation determined by its shape:
//! - `Send`: fire-and-forget, failures are logged
//! - `Query`: single-resolution reply through the query registry
//! - `Stream`: sequenced batches plus one terminal event
//! - `Replay`: a journal record driven back through normal dispatch
//! - `Control`: lifecycle requests (checkpoint, reconcile, shutdown)

use crate::journal::JournalRecord;
use crate::query::{QueryReply, StreamReply};
use crate::system::ShutdownMode;
use crate::{ActorError, Result};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{error, warn};

/// Hop headers beyond this count usually mean two actors call each other forever
const HOP_CYCLE_WARNING: usize = 100;

/// Immutable mailbox address, unique within one registry
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address(Arc<str>);

impl Address {
    pub fn new(address: impl AsRef<str>) -> Self {
        Self(Arc::from(address.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Address {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Address {
    fn from(value: String) -> Self {
        Self(Arc::from(value))
    }
}

/// Trace and propagation context carried with a message
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    entries: BTreeMap<String, String>,
}

impl Headers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Append a `service.N`/`method.N` pair for this delivery hop
    pub fn add_hop(&mut self, address: &Address, method: &str) {
        let size = self.entries.len();
        if size > HOP_CYCLE_WARNING {
            warn!(
                address = %address,
                method = method,
                header_count = size,
                "Possible call cycle: hop headers keep growing"
            );
        }
        let index = size / 2 + 1;
        self.insert(format!("service.{}", index), address.as_str());
        self.insert(format!("method.{}", index), method);
    }
}

/// Where a message came from, as seen by the stub transition function
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    /// Ordinary caller traffic
    Live,
    /// Journal driver during replay
    Replay,
    /// Runtime lifecycle request
    Control,
}

/// Lifecycle requests delivered through the mailbox
#[derive(Debug)]
pub enum Control {
    /// Run a checkpoint; replies whether a save was performed
    Checkpoint(oneshot::Sender<Result<bool>>),
    /// Reconcile with the peer journal; replies with the converged sequence
    Reconcile(oneshot::Sender<Result<u64>>),
    /// Stop the actor once this message is reached
    Shutdown(ShutdownMode, oneshot::Sender<()>),
}

impl Control {
    pub fn name(&self) -> &'static str {
        match self {
            Control::Checkpoint(_) => "checkpoint",
            Control::Reconcile(_) => "reconcile",
            Control::Shutdown(..) => "shutdown",
        }
    }
}

/// Message shape and its continuation
#[derive(Debug)]
pub enum MessageKind {
    Send,
    Query(QueryReply),
    Stream(StreamReply),
    Replay(JournalRecord),
    Control(Control),
}

/// A single delivery to one actor
#[derive(Debug)]
pub struct Message {
    pub target: Address,
    pub method: String,
    pub args: Vec<Value>,
    pub headers: Headers,
    pub kind: MessageKind,
    /// Submission timestamp (nanoseconds)
    pub timestamp_ns: u64,
}

impl Message {
    pub fn new(
        target: Address,
        method: impl Into<String>,
        args: Vec<Value>,
        kind: MessageKind,
    ) -> Self {
        Self {
            target,
            method: method.into(),
            args,
            headers: Headers::new(),
            kind,
            timestamp_ns: current_timestamp_ns(),
        }
    }

    pub fn send(target: Address, method: impl Into<String>, args: Vec<Value>) -> Self {
        Self::new(target, method, args, MessageKind::Send)
    }

    pub fn query(
        target: Address,
        method: impl Into<String>,
        args: Vec<Value>,
        reply: QueryReply,
    ) -> Self {
        Self::new(target, method, args, MessageKind::Query(reply))
    }

    pub fn stream(
        target: Address,
        method: impl Into<String>,
        args: Vec<Value>,
        reply: StreamReply,
    ) -> Self {
        Self::new(target, method, args, MessageKind::Stream(reply))
    }

    /// Rebuild the call a journal record describes
    pub fn replay(target: Address, record: JournalRecord) -> Self {
        let method = record.method.clone();
        let args = record.args.clone();
        let timestamp_ns = record.timestamp_ns;
        Self {
            timestamp_ns,
            ..Self::new(target, method, args, MessageKind::Replay(record))
        }
    }

    pub fn control(target: Address, control: Control) -> Self {
        let method = control.name();
        Self::new(target, method, Vec::new(), MessageKind::Control(control))
    }

    pub fn with_headers(mut self, headers: Headers) -> Self {
        self.headers = headers;
        self
    }

    pub fn origin(&self) -> MessageOrigin {
        match self.kind {
            MessageKind::Send | MessageKind::Query(_) | MessageKind::Stream(_) => {
                MessageOrigin::Live
            }
            MessageKind::Replay(_) => MessageOrigin::Replay,
            MessageKind::Control(_) => MessageOrigin::Control,
        }
    }

    /// Query/stream correlation id, if this message has one
    pub fn correlation_id(&self) -> Option<u64> {
        match &self.kind {
            MessageKind::Query(reply) => Some(reply.id()),
            MessageKind::Stream(reply) => Some(reply.id()),
            _ => None,
        }
    }

    /// Cancellation token of a stream call
    pub fn cancellation(&self) -> Option<&CancellationToken> {
        match &self.kind {
            MessageKind::Stream(reply) => Some(reply.token()),
            _ => None,
        }
    }

    /// Deliver a terminal failure to whatever continuation this message holds
    pub fn fail(self, err: ActorError) {
        match self.kind {
            MessageKind::Send => {
                error!(
                    address = %self.target,
                    method = %self.method,
                    error = %err,
                    error_category = err.category(),
                    "Send failed"
                );
            }
            MessageKind::Query(reply) => {
                reply.fail(err);
            }
            MessageKind::Stream(reply) => {
                reply.fail(err);
            }
            MessageKind::Replay(record) => {
                error!(
                    address = %self.target,
                    method = %self.method,
                    sequence = record.sequence,
                    error = %err,
                    "Replay record failed"
                );
            }
            MessageKind::Control(control) => match control {
                Control::Checkpoint(tx) => {
                    let _ = tx.send(Err(err));
                }
                Control::Reconcile(tx) => {
                    let _ = tx.send(Err(err));
                }
                Control::Shutdown(_, tx) => {
                    let _ = tx.send(());
                }
            },
        }
    }
}

/// Wall-clock nanoseconds since the Unix epoch, zero if the clock is before it
pub fn current_timestamp_ns() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::QueryRegistry;
    use serde_json::json;

    #[test]
    fn test_address_display_and_eq() {
        let a = Address::from("counter");
        let b = Address::new(String::from("counter"));
        assert_eq!(a, b);
        assert_eq!(a.to_string(), "counter");
    }

    #[test]
    fn test_hop_headers_are_indexed() {
        let mut headers = Headers::new().with("trace.id", "abc");
        let addr = Address::from("counter");

        headers.add_hop(&addr, "increment");
        assert_eq!(headers.get("service.1"), Some("counter"));
        assert_eq!(headers.get("method.1"), Some("increment"));

        headers.add_hop(&addr, "get");
        assert_eq!(headers.get("service.2"), Some("counter"));
        assert_eq!(headers.get("method.2"), Some("get"));
        assert_eq!(headers.get("trace.id"), Some("abc"));
    }

    #[test]
    fn test_origin_classification() {
        let send = Message::send("a".into(), "m", vec![json!(1)]);
        assert_eq!(send.origin(), MessageOrigin::Live);
        assert!(send.correlation_id().is_none());

        let (tx, _rx) = oneshot::channel();
        let control = Message::control("a".into(), Control::Checkpoint(tx));
        assert_eq!(control.origin(), MessageOrigin::Control);
        assert_eq!(control.method, "checkpoint");
    }

    #[tokio::test]
    async fn test_fail_routes_to_query_continuation() {
        let registry = QueryRegistry::new();
        let (reply, pending) = registry.register_query("caller", None);
        let id = pending.id();

        let msg = Message::query("a".into(), "get", vec![], reply);
        assert_eq!(msg.correlation_id(), Some(id));

        msg.fail(ActorError::deleted("a"));
        let err = pending.await.unwrap_err();
        assert!(matches!(err, ActorError::Deleted { .. }));
        assert!(!registry.contains(id));
    }
}
