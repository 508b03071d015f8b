//! Actor System Core
//!
//! Explicit runtime context: the service registry, the query correlation
//! registry and the runtime configuration. Nothing here is global; every
//! spawned actor holds a clone of the system it belongs to, so nested calls
//! from inside a method go through the same registries.

use crate::config::RuntimeConfig;
use crate::journal::Journal;
use crate::mailbox::{Mailbox, MailboxHandle, MailboxMetrics, OverflowHandler, RejectOnOverflow};
use crate::messages::{Address, Headers};
use crate::method::MethodTable;
use crate::query::{QueryRegistry, StreamSink};
use crate::registry::{ActorRef, Registry};
use crate::stub::{Journals, Stub};
use crate::{ActorError, Result};
use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info};
use uuid::Uuid;

/// How a stopping actor treats messages still in its queue
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Run everything queued ahead of the shutdown request
    Graceful,
    /// Fail everything queued with `Closed`
    Immediate,
}

/// User-supplied actor implementation.
///
/// Methods run one at a time inside the actor's mailbox, so `&mut self` is
/// never contended. A method that awaits a nested query keeps its mailbox
/// busy until the reply arrives; querying yourself waits for the timeout.
#[async_trait]
pub trait ActorBehavior: Send + 'static {
    /// Method table consulted for every call and replayed record
    fn methods(&self) -> MethodTable;

    /// Whether `on_load` must finish before any call runs
    fn requires_load(&self) -> bool {
        false
    }

    async fn on_load(&mut self) -> Result<()> {
        Ok(())
    }

    /// Handle a send, query, or replayed record
    async fn call(&mut self, ctx: &mut CallContext, method: &str, args: Vec<Value>)
        -> Result<Value>;

    /// Handle a stream call, emitting batches into `sink`
    async fn stream(
        &mut self,
        ctx: &mut CallContext,
        method: &str,
        _args: Vec<Value>,
        _sink: &StreamSink,
    ) -> Result<()> {
        Err(ActorError::method_not_found(ctx.address().as_str(), method))
    }

    /// Persist a snapshot; journal records up to the checkpoint are then discarded
    async fn on_save(&mut self) -> Result<()> {
        Ok(())
    }

    async fn on_shutdown(&mut self, _mode: ShutdownMode) -> Result<()> {
        Ok(())
    }
}

/// Per-call view handed to [`ActorBehavior::call`]
pub struct CallContext {
    address: Address,
    headers: Headers,
    system: ActorSystem,
    delete_requested: bool,
}

impl fmt::Debug for CallContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallContext")
            .field("address", &self.address)
            .field("headers", &self.headers)
            .field("delete_requested", &self.delete_requested)
            .finish()
    }
}

impl CallContext {
    pub fn new(address: Address, headers: Headers, system: ActorSystem) -> Self {
        Self {
            address,
            headers,
            system,
            delete_requested: false,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn system(&self) -> &ActorSystem {
        &self.system
    }

    /// Mark the actor deleted once this call returns
    pub fn delete(&mut self) {
        self.delete_requested = true;
    }

    pub fn is_delete_requested(&self) -> bool {
        self.delete_requested
    }

    /// Query another actor, carrying this call's headers downstream
    pub async fn query(
        &self,
        address: &Address,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        let target = self.lookup(address).await?;
        let timeout = target.default_query_timeout();
        target
            .query_from(self.address.as_str(), method, args, self.headers.clone(), timeout)
            .await
            .await
    }

    /// Fire-and-forget to another actor, carrying this call's headers
    pub async fn send(&self, address: &Address, method: &str, args: Vec<Value>) -> Result<()> {
        let target = self.lookup(address).await?;
        target.send_with_headers(method, args, self.headers.clone()).await
    }

    async fn lookup(&self, address: &Address) -> Result<ActorRef> {
        self.system
            .service(address)
            .await
            .ok_or_else(|| ActorError::not_found(address.as_str()))
    }
}

/// Per-actor overrides for [`ActorSystem::spawn_with`]
#[derive(Clone, Default)]
pub struct SpawnOptions {
    pub journal: Option<Arc<Journal>>,
    pub peer_journal: Option<Arc<Journal>>,
    pub overflow: Option<Arc<dyn OverflowHandler>>,
    pub capacity: Option<usize>,
}

impl fmt::Debug for SpawnOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SpawnOptions")
            .field("journal", &self.journal.as_ref().map(|j| j.name().to_string()))
            .field(
                "peer_journal",
                &self.peer_journal.as_ref().map(|j| j.name().to_string()),
            )
            .field("overflow", &self.overflow.is_some())
            .field("capacity", &self.capacity)
            .finish()
    }
}

impl SpawnOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn journal(mut self, journal: Arc<Journal>) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn peer_journal(mut self, journal: Arc<Journal>) -> Self {
        self.peer_journal = Some(journal);
        self
    }

    pub fn overflow(mut self, handler: Arc<dyn OverflowHandler>) -> Self {
        self.overflow = Some(handler);
        self
    }

    pub fn capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }
}

/// Runtime context shared by every actor it spawns
#[derive(Clone)]
pub struct ActorSystem {
    registry: Arc<Registry>,
    queries: Arc<QueryRegistry>,
    config: Arc<RuntimeConfig>,
    system_id: Arc<str>,
}

impl fmt::Debug for ActorSystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActorSystem")
            .field("system_id", &self.system_id)
            .field("pending_queries", &self.queries.len())
            .finish()
    }
}

impl ActorSystem {
    pub fn new(config: RuntimeConfig) -> Result<Self> {
        config.validate()?;
        let system_id = format!("system-{}", Uuid::new_v4());
        info!(system_id = %system_id, "Creating actor system");

        Ok(Self {
            registry: Arc::new(Registry::new()),
            queries: QueryRegistry::new(),
            config: Arc::new(config),
            system_id: Arc::from(system_id),
        })
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn system_id(&self) -> &str {
        &self.system_id
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn queries(&self) -> &Arc<QueryRegistry> {
        &self.queries
    }

    pub async fn service(&self, address: &Address) -> Option<ActorRef> {
        self.registry.service(address).await
    }

    /// Spawn an actor without journals, using the configured mailbox defaults
    pub async fn spawn<A>(&self, address: impl Into<Address>, actor: A) -> Result<ActorRef>
    where
        A: ActorBehavior,
    {
        self.spawn_with(address, actor, SpawnOptions::default()).await
    }

    /// Spawn an actor and bind it under `address`.
    ///
    /// Activation (load, then journal replay) is queued as the first work of
    /// the new mailbox; calls made before it completes stay queued, not lost.
    pub async fn spawn_with<A>(
        &self,
        address: impl Into<Address>,
        actor: A,
        options: SpawnOptions,
    ) -> Result<ActorRef>
    where
        A: ActorBehavior,
    {
        let address = address.into();
        let started = Instant::now();

        if self.registry.contains(&address).await {
            return Err(ActorError::already_bound(address.as_str()));
        }
        if options.peer_journal.is_some() && options.journal.is_none() {
            return Err(ActorError::configuration(
                format!("{} has a peer journal but no local journal", address),
                Some("peer_journal"),
            ));
        }

        let mut mailbox_config = self.config.mailbox.clone();
        if let Some(capacity) = options.capacity {
            if capacity == 0 {
                return Err(ActorError::configuration(
                    "mailbox capacity must be positive",
                    Some("capacity"),
                ));
            }
            mailbox_config.capacity = capacity;
        }

        debug!(
            address = %address,
            system_id = %self.system_id,
            actor_type = std::any::type_name::<A>(),
            capacity = mailbox_config.capacity,
            journaled = options.journal.is_some(),
            "Spawning actor"
        );

        let journals = Journals {
            local: options.journal,
            peer: options.peer_journal,
        };
        let metrics: Arc<MailboxMetrics> = Arc::default();
        let stub = Stub::new(address.clone(), actor, journals, self.clone(), Arc::clone(&metrics));
        let overflow = options
            .overflow
            .unwrap_or_else(|| Arc::new(RejectOnOverflow) as Arc<dyn OverflowHandler>);
        let mailbox = Mailbox::new(stub, mailbox_config, overflow, metrics);

        let actor_ref = ActorRef::new(
            Arc::clone(&mailbox) as Arc<dyn MailboxHandle>,
            Arc::clone(&self.queries),
            &self.config,
        );
        self.registry.bind(address.clone(), actor_ref.clone()).await?;
        mailbox.start();

        info!(
            address = %address,
            system_id = %self.system_id,
            spawn_duration_ms = started.elapsed().as_millis(),
            "Actor spawned"
        );
        Ok(actor_ref)
    }

    /// Stop every bound actor and clear the registry
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        info!(system_id = %self.system_id, mode = ?mode, "Shutting down actor system");
        self.registry.shutdown(mode).await;
        info!(
            system_id = %self.system_id,
            pending_queries = self.queries.len(),
            "Actor system shutdown complete"
        );
        Ok(())
    }
}
