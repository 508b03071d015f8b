//! Actor Registry
//!
//! Address-keyed service directory and the caller-side [`ActorRef`] handle.

use crate::config::RuntimeConfig;
use crate::mailbox::{MailboxHandle, MailboxMetrics};
use crate::messages::{Address, Control, Headers, Message};
use crate::query::{PendingQuery, QueryRegistry, ResultStream};
use crate::stub::StubStateKind;
use crate::system::ShutdownMode;
use crate::{ActorError, Result};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, RwLock};
use tracing::{debug, info, warn};

/// Origin recorded for calls issued from outside any actor
const EXTERNAL_ORIGIN: &str = "external";

/// Cloneable handle for calling one actor
#[derive(Clone)]
pub struct ActorRef {
    mailbox: Arc<dyn MailboxHandle>,
    queries: Arc<QueryRegistry>,
    send_timeout: Duration,
    query_timeout: Option<Duration>,
}

impl fmt::Debug for ActorRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorRef")
            .field("address", self.mailbox.address())
            .field("state", &self.mailbox.state())
            .field("size", &self.mailbox.size())
            .finish()
    }
}

impl ActorRef {
    pub fn new(
        mailbox: Arc<dyn MailboxHandle>,
        queries: Arc<QueryRegistry>,
        config: &RuntimeConfig,
    ) -> Self {
        Self {
            mailbox,
            queries,
            send_timeout: config.mailbox.send_timeout(),
            query_timeout: config.query.default_timeout(),
        }
    }

    pub fn address(&self) -> &Address {
        self.mailbox.address()
    }

    pub fn default_query_timeout(&self) -> Option<Duration> {
        self.query_timeout
    }

    /// Fire-and-forget call. Fails only if the message was not admitted.
    pub async fn send(&self, method: &str, args: Vec<Value>) -> Result<()> {
        self.send_with_headers(method, args, Headers::new()).await
    }

    pub async fn send_with_headers(
        &self,
        method: &str,
        args: Vec<Value>,
        headers: Headers,
    ) -> Result<()> {
        let msg = Message::send(self.address().clone(), method, args).with_headers(headers);
        if self.mailbox.offer(msg, self.send_timeout).await {
            Ok(())
        } else {
            Err(ActorError::queue_full(
                self.address().as_str(),
                self.mailbox.capacity(),
            ))
        }
    }

    /// Call and wait for the reply, bounded by the configured default timeout
    pub async fn query(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.query_handle(method, args, self.query_timeout).await.await
    }

    pub async fn query_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.query_handle(method, args, Some(timeout)).await.await
    }

    /// Enqueue a query and hand back its pending reply without waiting.
    ///
    /// The correlation entry exists before the message is enqueued. If the
    /// message is not admitted the reply resolves with the reason.
    pub async fn query_handle(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Option<Duration>,
    ) -> PendingQuery {
        self.query_from(EXTERNAL_ORIGIN, method, args, Headers::new(), timeout)
            .await
    }

    pub(crate) async fn query_from(
        &self,
        origin: &str,
        method: &str,
        args: Vec<Value>,
        headers: Headers,
        timeout: Option<Duration>,
    ) -> PendingQuery {
        let (reply, pending) = self.queries.register_query(origin, timeout);
        let msg = Message::query(self.address().clone(), method, args, reply).with_headers(headers);
        self.mailbox.offer(msg, self.send_timeout).await;
        pending
    }

    /// Start a stream call; batches arrive in order on the returned stream
    pub async fn stream(&self, method: &str, args: Vec<Value>) -> ResultStream {
        let (reply, stream) = self
            .queries
            .register_stream(EXTERNAL_ORIGIN, self.query_timeout);
        let msg = Message::stream(self.address().clone(), method, args, reply);
        self.mailbox.offer(msg, self.send_timeout).await;
        stream
    }

    pub async fn offer(&self, message: Message, timeout: Duration) -> bool {
        self.mailbox.offer(message, timeout).await
    }

    pub async fn offer_and_wake(&self, message: Message, timeout: Duration) -> bool {
        self.mailbox.offer_and_wake(message, timeout).await
    }

    /// Ask the actor to checkpoint; true if a save ran
    pub async fn checkpoint(&self) -> Result<bool> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::control(self.address().clone(), Control::Checkpoint(tx));
        self.control(msg, rx).await
    }

    /// Catch this actor up with its peer journal; returns the shared sequence
    pub async fn reconcile(&self) -> Result<u64> {
        let (tx, rx) = oneshot::channel();
        let msg = Message::control(self.address().clone(), Control::Reconcile(tx));
        self.control(msg, rx).await
    }

    async fn control<T>(&self, msg: Message, rx: oneshot::Receiver<Result<T>>) -> Result<T> {
        let operation = msg.method.clone();
        if !self.mailbox.offer_and_wake(msg, self.send_timeout).await {
            return Err(ActorError::queue_full(
                self.address().as_str(),
                self.mailbox.capacity(),
            ));
        }
        rx.await.map_err(|_| {
            ActorError::illegal_state(format!(
                "{} dropped the {} request",
                self.address(),
                operation
            ))
        })?
    }

    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        self.mailbox.shutdown(mode).await
    }

    pub fn size(&self) -> usize {
        self.mailbox.size()
    }

    pub fn is_empty(&self) -> bool {
        self.mailbox.is_empty()
    }

    pub fn state(&self) -> StubStateKind {
        self.mailbox.state()
    }

    pub fn is_closed(&self) -> bool {
        self.mailbox.is_closed()
    }

    pub fn metrics(&self) -> Arc<MailboxMetrics> {
        self.mailbox.metrics()
    }
}

/// Service directory, unique by address
#[derive(Debug, Default)]
pub struct Registry {
    services: RwLock<HashMap<Address, ActorRef>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn service(&self, address: &Address) -> Option<ActorRef> {
        self.services.read().await.get(address).cloned()
    }

    pub async fn contains(&self, address: &Address) -> bool {
        self.services.read().await.contains_key(address)
    }

    pub async fn bind(&self, address: Address, actor: ActorRef) -> Result<()> {
        let mut services = self.services.write().await;
        if services.contains_key(&address) {
            return Err(ActorError::already_bound(address.as_str()));
        }
        debug!(address = %address, "Binding service");
        services.insert(address, actor);
        Ok(())
    }

    pub async fn unbind(&self, address: &Address) -> Result<ActorRef> {
        debug!(address = %address, "Unbinding service");
        self.services
            .write()
            .await
            .remove(address)
            .ok_or_else(|| ActorError::not_found(address.as_str()))
    }

    /// Bound addresses, sorted
    pub async fn addresses(&self) -> Vec<Address> {
        let mut addresses: Vec<_> = self.services.read().await.keys().cloned().collect();
        addresses.sort();
        addresses
    }

    pub async fn len(&self) -> usize {
        self.services.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.services.read().await.is_empty()
    }

    /// Shut every bound actor down concurrently and clear the directory
    pub async fn shutdown(&self, mode: ShutdownMode) {
        let services: Vec<(Address, ActorRef)> = self.services.write().await.drain().collect();
        info!(services = services.len(), mode = ?mode, "Shutting down services");

        let stops = services.iter().map(|(_, actor)| actor.shutdown(mode));
        let results = futures::future::join_all(stops).await;
        for ((address, _), result) in services.iter().zip(results) {
            if let Err(e) = result {
                warn!(address = %address, error = %e, "Error stopping actor");
            }
        }
    }
}
