//! Actor Runtime Concurrency Core
//!
//! Single-threaded-per-actor execution over a shared tokio worker pool. Every
//! actor owns a bounded mailbox; at most one drain task runs an actor at a
//! time, so actor methods never race with each other. State-changing calls
//! are journaled and replayed through normal dispatch after a restart.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────┐  offer   ┌──────────────────────────────────────────┐
//! │  ActorRef  │─────────►│ Mailbox (bounded queue, schedule flag)   │
//! └─────┬──────┘          │   drain task ─► Stub ─► ActorBehavior    │
//!       │ register        │                  │                       │
//!       ▼                 │                  ▼ modify calls          │
//! ┌──────────────┐ reply  │              Journal ──► JournalStore    │
//! │QueryRegistry │◄───────│                  │  (peer replication)   │
//! └──────────────┘        └──────────────────┴───────────────────────┘
//! ```
//!
//! # Lifecycle
//!
//! Spawning binds the address and queues activation: `on_load`, then replay
//! of journal records after the last checkpoint (merged with a peer journal
//! when one is configured). Calls that arrive meanwhile wait in the bounded
//! queue and run in arrival order once the actor is active.
//!
//! # Examples
//!
//! ```rust,no_run
//! use async_trait::async_trait;
//! use messaging_actors::{
//!     ActorBehavior, ActorError, ActorSystem, CallContext, MethodTable, Result, RuntimeConfig,
//! };
//! use serde_json::{json, Value};
//!
//! struct Counter {
//!     value: i64,
//! }
//!
//! #[async_trait]
//! impl ActorBehavior for Counter {
//!     fn methods(&self) -> MethodTable {
//!         MethodTable::builder().modify("increment", 1).query("get", 0).build()
//!     }
//!
//!     async fn call(&mut self, ctx: &mut CallContext, method: &str, args: Vec<Value>) -> Result<Value> {
//!         match method {
//!             "increment" => {
//!                 self.value += args[0].as_i64().unwrap_or(0);
//!                 Ok(json!(self.value))
//!             }
//!             "get" => Ok(json!(self.value)),
//!             other => Err(ActorError::method_not_found(ctx.address().as_str(), other)),
//!         }
//!     }
//! }
//!
//! # async fn run() -> Result<()> {
//! let system = ActorSystem::new(RuntimeConfig::default())?;
//! let counter = system.spawn("counter", Counter { value: 0 }).await?;
//! counter.send("increment", vec![json!(2)]).await?;
//! assert_eq!(counter.query("get", vec![]).await?, json!(2));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod journal;
pub mod mailbox;
pub mod messages;
pub mod method;
pub mod query;
pub mod registry;
pub mod stub;
pub mod system;

pub use config::{JournalConfig, MailboxConfig, QueryConfig, RuntimeConfig};
pub use error::{ActorError, Result};
pub use journal::{
    FileJournalStore, Journal, JournalRecord, JournalStore, MemoryJournalStore, RecordKind,
    ReplayPlan,
};
pub use mailbox::{
    Mailbox, MailboxHandle, MailboxMetrics, MailboxStats, OverflowContext, OverflowHandler,
    OverflowPolicy, RejectOnOverflow,
};
pub use messages::{Address, Control, Headers, Message, MessageKind, MessageOrigin};
pub use method::{MethodDescriptor, MethodTable, ReturnArity};
pub use query::{
    PendingQuery, QueryRegistry, QueryReply, ResultStream, StreamEvent, StreamReply, StreamSink,
};
pub use registry::{ActorRef, Registry};
pub use stub::{StubState, StubStateKind};
pub use system::{ActorBehavior, ActorSystem, CallContext, ShutdownMode, SpawnOptions};
