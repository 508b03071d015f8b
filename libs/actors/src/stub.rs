//! Actor Stub State Machine
//!
//! The stub owns one actor's behavior and decides, from its lifecycle state
//! and the origin of a message, whether the message executes now, waits in
//! the parked queue, or is rejected. It also owns the journal-write decision
//! for modify calls and the deferred acknowledgement of journaled queries.
//!
//! A stub is only ever driven by its mailbox's drain task, so nothing here is
//! shared: the mailbox lock is what makes `&mut self` sound across awaits.

use crate::journal::{Journal, RecordKind, ReplayPlan};
use crate::mailbox::MailboxMetrics;
use crate::messages::{Address, Control, Message, MessageKind, MessageOrigin};
use crate::method::MethodTable;
use crate::query::QueryReply;
use crate::system::{ActorBehavior, ActorSystem, CallContext, ShutdownMode};
use crate::{ActorError, Result};
use futures::FutureExt;
use serde_json::Value;
use std::any::Any;
use std::collections::VecDeque;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of one actor
#[derive(Debug, Clone)]
pub enum StubState {
    Uninitialized,
    Loading,
    Active,
    /// Active, but owes a checkpoint for journaled changes
    Modified,
    Saving,
    Deleted,
    Replaying,
    /// Load or replay failed; every message is rejected with the cause
    Failed(ActorError),
}

/// Copyable mirror of [`StubState`] for observers outside the drain task
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StubStateKind {
    Uninitialized = 0,
    Loading = 1,
    Active = 2,
    Modified = 3,
    Saving = 4,
    Deleted = 5,
    Replaying = 6,
    Failed = 7,
}

impl StubStateKind {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => StubStateKind::Loading,
            2 => StubStateKind::Active,
            3 => StubStateKind::Modified,
            4 => StubStateKind::Saving,
            5 => StubStateKind::Deleted,
            6 => StubStateKind::Replaying,
            7 => StubStateKind::Failed,
            _ => StubStateKind::Uninitialized,
        }
    }
}

impl fmt::Display for StubStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StubStateKind::Uninitialized => "uninitialized",
            StubStateKind::Loading => "loading",
            StubStateKind::Active => "active",
            StubStateKind::Modified => "modified",
            StubStateKind::Saving => "saving",
            StubStateKind::Deleted => "deleted",
            StubStateKind::Replaying => "replaying",
            StubStateKind::Failed => "failed",
        };
        f.write_str(name)
    }
}

impl StubState {
    pub fn kind(&self) -> StubStateKind {
        match self {
            StubState::Uninitialized => StubStateKind::Uninitialized,
            StubState::Loading => StubStateKind::Loading,
            StubState::Active => StubStateKind::Active,
            StubState::Modified => StubStateKind::Modified,
            StubState::Saving => StubStateKind::Saving,
            StubState::Deleted => StubStateKind::Deleted,
            StubState::Replaying => StubStateKind::Replaying,
            StubState::Failed(_) => StubStateKind::Failed,
        }
    }
}

/// Shared read-only view of a stub's state
#[derive(Debug, Clone, Default)]
pub struct StateCell(Arc<AtomicU8>);

impl StateCell {
    pub fn get(&self) -> StubStateKind {
        StubStateKind::from_u8(self.0.load(Ordering::Acquire))
    }

    fn set(&self, kind: StubStateKind) {
        self.0.store(kind as u8, Ordering::Release);
    }
}

/// What the transition table decides for one message
#[derive(Debug)]
pub enum Action {
    Execute,
    Park,
    Reject(ActorError),
}

/// The routing table: lifecycle state × message origin → action.
///
/// Shutdown requests are handled before this table is consulted; they stop
/// the actor from any state.
pub fn transition(state: &StubState, origin: MessageOrigin, address: &Address) -> Action {
    match (state, origin) {
        (StubState::Uninitialized | StubState::Loading, _) => Action::Park,
        (StubState::Replaying, MessageOrigin::Replay) => Action::Execute,
        (StubState::Replaying, MessageOrigin::Live | MessageOrigin::Control) => Action::Park,
        (
            StubState::Active | StubState::Modified | StubState::Saving,
            MessageOrigin::Live | MessageOrigin::Control,
        ) => Action::Execute,
        (StubState::Active | StubState::Modified | StubState::Saving, MessageOrigin::Replay) => {
            Action::Reject(ActorError::illegal_state(format!(
                "replay record for {} outside replay",
                address
            )))
        }
        (StubState::Deleted, _) => Action::Reject(ActorError::deleted(address.as_str())),
        (StubState::Failed(err), _) => Action::Reject(err.clone()),
    }
}

/// Whether the drain loop keeps going after a message
#[derive(Debug)]
pub enum Flow {
    Continue,
    Stop {
        mode: ShutdownMode,
        ack: oneshot::Sender<()>,
    },
    /// Shutdown arrived before the actor finished loading
    Interrupted,
}

/// Journal wiring for one actor
#[derive(Debug, Clone, Default)]
pub struct Journals {
    pub local: Option<Arc<Journal>>,
    pub peer: Option<Arc<Journal>>,
}

/// One actor, its lifecycle state and its durability bookkeeping
pub struct Stub<A: ActorBehavior> {
    address: Address,
    actor: A,
    methods: MethodTable,
    state: StubState,
    cell: StateCell,
    parked: VecDeque<Message>,
    journals: Journals,
    /// Records appended since the last flush
    unflushed: bool,
    /// Query replies held until the journal flush that covers them
    deferred: Vec<(QueryReply, Value)>,
    activated: bool,
    batch_started: Instant,
    batch_messages: usize,
    trace_headers: bool,
    system: ActorSystem,
    metrics: Arc<MailboxMetrics>,
}

impl<A: ActorBehavior> fmt::Debug for Stub<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stub")
            .field("address", &self.address)
            .field("state", &self.state.kind())
            .field("parked", &self.parked.len())
            .field("deferred", &self.deferred.len())
            .finish()
    }
}

impl<A: ActorBehavior> Stub<A> {
    pub fn new(
        address: Address,
        actor: A,
        journals: Journals,
        system: ActorSystem,
        metrics: Arc<MailboxMetrics>,
    ) -> Self {
        let methods = actor.methods();
        let trace_headers = system.config().mailbox.trace_headers;
        Self {
            address,
            actor,
            methods,
            state: StubState::Uninitialized,
            cell: StateCell::default(),
            parked: VecDeque::new(),
            journals,
            unflushed: false,
            deferred: Vec::new(),
            activated: false,
            batch_started: Instant::now(),
            batch_messages: 0,
            trace_headers,
            system,
            metrics,
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn state(&self) -> &StubState {
        &self.state
    }

    /// Observer handle that tracks every state change
    pub fn state_cell(&self) -> StateCell {
        self.cell.clone()
    }

    pub fn is_activated(&self) -> bool {
        self.activated
    }

    pub fn parked_len(&self) -> usize {
        self.parked.len()
    }

    pub fn actor(&self) -> &A {
        &self.actor
    }

    fn set_state(&mut self, state: StubState) {
        if self.state.kind() != state.kind() {
            debug!(
                address = %self.address,
                from = %self.state.kind(),
                to = %state.kind(),
                "Stub state change"
            );
        }
        self.cell.set(state.kind());
        self.state = state;
    }

    /// First activity of a mailbox: load, replay, then release parked traffic.
    ///
    /// Nothing is taken off the queue until activation finishes, so callers
    /// keep seeing backpressure while the actor loads. `stopping` aborts a
    /// load that is still pending.
    pub async fn activate(&mut self, stopping: &CancellationToken) -> Flow {
        self.activated = true;
        let started = Instant::now();

        if self.actor.requires_load() {
            self.set_state(StubState::Loading);

            let loaded = tokio::select! {
                biased;
                _ = stopping.cancelled() => {
                    warn!(
                        address = %self.address,
                        load_duration_ms = started.elapsed().as_millis(),
                        "Shutdown requested while loading"
                    );
                    return Flow::Interrupted;
                }
                result = AssertUnwindSafe(self.actor.on_load()).catch_unwind() => result,
            };

            let loaded = match loaded {
                Ok(result) => result,
                Err(panic) => Err(ActorError::load(
                    self.address.as_str(),
                    panic_message(panic.as_ref()),
                )),
            };
            if let Err(e) = loaded {
                let err = match e {
                    ActorError::Load { .. } => e,
                    other => ActorError::load(self.address.as_str(), other.to_string()),
                };
                error!(
                    address = %self.address,
                    error = %err,
                    parked = self.parked.len(),
                    load_duration_ms = started.elapsed().as_millis(),
                    "Actor load failed"
                );
                self.fail_parked(&err);
                self.set_state(StubState::Failed(err));
                return Flow::Continue;
            }
        }

        let replayed = match self.replay_at_start().await {
            Ok(replayed) => replayed,
            Err(err) => {
                error!(
                    address = %self.address,
                    error = %err,
                    error_category = err.category(),
                    "Journal replay failed"
                );
                self.fail_parked(&err);
                self.set_state(StubState::Failed(err));
                return Flow::Continue;
            }
        };

        self.set_state(if replayed > 0 {
            StubState::Modified
        } else {
            StubState::Active
        });
        info!(
            address = %self.address,
            replayed = replayed,
            parked = self.parked.len(),
            activation_ms = started.elapsed().as_millis(),
            "Actor active"
        );

        while let Some(msg) = self.parked.pop_front() {
            if let Flow::Stop { mode, ack } = self.route(msg).await {
                return Flow::Stop { mode, ack };
            }
        }
        Flow::Continue
    }

    async fn replay_at_start(&mut self) -> Result<usize> {
        let Some(local) = self.journals.local.clone() else {
            return Ok(0);
        };
        self.set_state(StubState::Replaying);

        let plan = match &self.journals.peer {
            Some(peer) => ReplayPlan::reconcile(&local, peer).await?,
            None => ReplayPlan::local(&local).await?,
        };
        let applied = local.checkpoint_sequence();
        let replayed = self.drive(&plan, applied).await;

        if let Some(peer) = self.journals.peer.clone() {
            plan.apply_catch_up(&local, &peer).await?;
        }
        Ok(replayed)
    }

    /// Drive records beyond `applied` through normal dispatch, in order
    async fn drive(&mut self, plan: &ReplayPlan, applied: u64) -> usize {
        let mut replayed = 0;
        for record in plan.records.iter().filter(|r| r.sequence > applied) {
            let msg = Message::replay(self.address.clone(), record.clone());
            match transition(&self.state, msg.origin(), &self.address) {
                Action::Execute => self.dispatch(msg).await,
                Action::Park => self.parked.push_back(msg),
                Action::Reject(err) => msg.fail(err),
            }
            replayed += 1;
        }
        debug!(
            address = %self.address,
            replayed = replayed,
            target_sequence = plan.target_sequence,
            "Replay finished"
        );
        replayed
    }

    fn fail_parked(&mut self, err: &ActorError) {
        for msg in self.parked.drain(..) {
            msg.fail(err.clone());
        }
    }

    /// Route one message through the transition table
    pub async fn route(&mut self, mut msg: Message) -> Flow {
        if is_shutdown(&msg) {
            let MessageKind::Control(Control::Shutdown(mode, ack)) = msg.kind else {
                return Flow::Continue;
            };
            return self.stop(mode, ack).await;
        }

        if self.trace_headers && msg.origin() == MessageOrigin::Live {
            msg.headers.add_hop(&self.address, &msg.method);
        }

        match transition(&self.state, msg.origin(), &self.address) {
            Action::Execute => self.execute(msg).await,
            Action::Park => {
                self.metrics.record_parked();
                self.parked.push_back(msg);
            }
            Action::Reject(err) => {
                self.metrics.record_rejected();
                msg.fail(err);
            }
        }
        Flow::Continue
    }

    async fn execute(&mut self, msg: Message) {
        self.batch_messages += 1;
        match msg.kind {
            MessageKind::Control(control) => self.control(control).await,
            kind => {
                self.dispatch(Message { kind, ..msg }).await;
            }
        }
    }

    /// Invoke the actor for a call or replayed record
    async fn dispatch(&mut self, msg: Message) {
        let started = Instant::now();
        let descriptor = match self.methods.resolve(
            self.address.as_str(),
            &msg.method,
            msg.args.len(),
            &msg.kind,
        ) {
            Ok(descriptor) => descriptor.clone(),
            Err(err) => {
                self.metrics.record_failure();
                msg.fail(err);
                return;
            }
        };
        // Modify calls are journaled before the actor runs them.
        let record_kind = match &msg.kind {
            MessageKind::Send if descriptor.modify => Some(RecordKind::Send),
            MessageKind::Query(_) if descriptor.modify => Some(RecordKind::Query),
            _ => None,
        };
        let journaled = match record_kind {
            Some(record_kind) => match self.commit(&msg.method, &msg.args, record_kind).await {
                Ok(journaled) => journaled,
                Err(e) => {
                    self.metrics.record_failure();
                    msg.fail(e);
                    self.metrics.record_message_handled(started.elapsed());
                    return;
                }
            },
            None => false,
        };

        let Message {
            method,
            args,
            headers,
            kind,
            ..
        } = msg;

        let mut ctx = CallContext::new(self.address.clone(), headers, self.system.clone());
        match kind {
            MessageKind::Stream(reply) => {
                let sink = reply.sink();
                let result = AssertUnwindSafe(self.actor.stream(&mut ctx, &method, args, &sink))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(self.panic_error(&method, panic)));
                if let Err(e) = &result {
                    self.metrics.record_failure();
                    debug!(address = %self.address, method = %method, error = %e, "Stream failed");
                }
                reply.resolve(result);
            }
            MessageKind::Replay(record) => {
                let result = AssertUnwindSafe(self.actor.call(&mut ctx, &method, args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(self.panic_error(&method, panic)));
                self.metrics.record_replayed();
                if let Err(e) = result {
                    error!(
                        address = %self.address,
                        method = %method,
                        sequence = record.sequence,
                        error = %e,
                        "Replayed call failed"
                    );
                }
            }
            MessageKind::Send | MessageKind::Query(_) => {
                let result = AssertUnwindSafe(self.actor.call(&mut ctx, &method, args))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| Err(self.panic_error(&method, panic)));

                match (kind, result) {
                    (MessageKind::Query(reply), Ok(value)) if journaled => {
                        self.deferred.push((reply, value));
                    }
                    (MessageKind::Query(reply), Ok(value)) => {
                        reply.ok(value);
                    }
                    (MessageKind::Query(reply), Err(e)) => {
                        self.metrics.record_failure();
                        reply.fail(e);
                    }
                    (_, Ok(_)) => {}
                    (_, Err(e)) => {
                        self.metrics.record_failure();
                        error!(
                            address = %self.address,
                            method = %method,
                            error = %e,
                            error_category = e.category(),
                            "Send failed"
                        );
                    }
                }
            }
            MessageKind::Control(control) => {
                debug!(address = %self.address, control = control.name(), "Control in dispatch");
            }
        }

        self.metrics.record_message_handled(started.elapsed());
        if ctx.is_delete_requested() {
            self.delete().await;
        }
    }

    /// Journal a modify call ahead of running it and mark the actor dirty.
    ///
    /// Returns whether a record was written. A failed append fails the
    /// triggering message before the actor sees it; a failed peer append
    /// only degrades replication. The record stays even if the call then
    /// fails, and replay runs it again with the same outcome.
    async fn commit(&mut self, method: &str, args: &[Value], kind: RecordKind) -> Result<bool> {
        let Some(local) = self.journals.local.clone() else {
            self.mark_modified();
            return Ok(false);
        };

        let record = match kind {
            RecordKind::Send => local.write_send(self.address.as_str(), method, args).await,
            RecordKind::Query => local.write_query(self.address.as_str(), method, args).await,
        }
        .map_err(|e| {
            error!(
                address = %self.address,
                method = %method,
                error = %e,
                "Journal append failed"
            );
            e
        })?;
        self.unflushed = true;
        self.mark_modified();

        if let Some(peer) = &self.journals.peer {
            if let Err(e) = peer.append_replicated(&record).await {
                warn!(
                    address = %self.address,
                    peer = %peer.name(),
                    sequence = record.sequence,
                    error = %e,
                    "Peer replication failed"
                );
            }
        }
        Ok(true)
    }

    fn mark_modified(&mut self) {
        if matches!(self.state, StubState::Active) {
            self.set_state(StubState::Modified);
        }
    }

    async fn control(&mut self, control: Control) {
        match control {
            Control::Checkpoint(tx) => {
                let result = self.checkpoint().await;
                let _ = tx.send(result);
            }
            Control::Reconcile(tx) => {
                let result = self.reconcile().await;
                let _ = tx.send(result);
            }
            Control::Shutdown(mode, ack) => {
                // route() intercepts shutdown; reaching here means a direct call.
                debug!(address = %self.address, mode = ?mode, "Shutdown via control path");
                let _ = ack.send(());
            }
        }
    }

    pub fn before_batch(&mut self) {
        self.batch_started = Instant::now();
        self.batch_messages = 0;
    }

    /// Close a batch: flush journals, release deferred replies, and take a
    /// checkpoint if the journal asks for one.
    pub async fn after_batch(&mut self) {
        self.metrics.record_batch();
        if self.batch_messages > 0 {
            debug!(
                address = %self.address,
                messages = self.batch_messages,
                deferred = self.deferred.len(),
                batch_duration_us = self.batch_started.elapsed().as_micros(),
                "Batch drained"
            );
        }

        let flushed = self.flush_journals().await;
        let deferred = std::mem::take(&mut self.deferred);
        match flushed {
            Ok(()) => {
                for (reply, value) in deferred {
                    reply.ok(value);
                }
            }
            Err(err) => {
                for (reply, _) in deferred {
                    self.metrics.record_failure();
                    reply.fail(err.clone());
                }
            }
        }

        let Some(local) = self.journals.local.clone() else {
            return;
        };
        if matches!(self.state, StubState::Modified) && local.is_save_request().await {
            if let Err(e) = self.checkpoint().await {
                warn!(
                    address = %self.address,
                    error = %e,
                    "Requested checkpoint failed"
                );
            }
        }
    }

    async fn flush_journals(&mut self) -> Result<()> {
        if !self.unflushed {
            return Ok(());
        }
        let Some(local) = self.journals.local.clone() else {
            self.unflushed = false;
            return Ok(());
        };

        local.flush().await.map_err(|e| {
            error!(address = %self.address, error = %e, "Journal flush failed");
            e
        })?;
        self.unflushed = false;
        self.metrics.record_flush();

        if let Some(peer) = &self.journals.peer {
            if let Err(e) = peer.flush().await {
                warn!(
                    address = %self.address,
                    peer = %peer.name(),
                    error = %e,
                    "Peer journal flush failed"
                );
            }
        }
        Ok(())
    }

    /// Snapshot the actor and discard journal records it covers.
    ///
    /// Returns false if a checkpoint was already in progress.
    pub async fn checkpoint(&mut self) -> Result<bool> {
        match self.state {
            StubState::Active | StubState::Modified | StubState::Deleted => {}
            _ => {
                return Err(ActorError::illegal_state(format!(
                    "cannot checkpoint {} while {}",
                    self.address,
                    self.state.kind()
                )))
            }
        }

        let journal = self.journals.local.clone();
        let mut peer = None;
        if let Some(journal) = &journal {
            if !journal.save_start().await? {
                return Ok(false);
            }
            peer = self.peer_save_start(journal.sequence_replay()).await;
            self.unflushed = false;
        }

        let deleted = matches!(self.state, StubState::Deleted);
        if !deleted {
            self.set_state(StubState::Saving);
        }

        let saved = AssertUnwindSafe(self.actor.on_save())
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(self.panic_error("on_save", panic)));
        let ended = match &journal {
            Some(journal) => journal.save_end(saved.is_ok()).await,
            None => Ok(()),
        };
        if let Some(peer) = peer {
            if let Err(e) = peer.save_end(saved.is_ok()).await {
                warn!(
                    address = %self.address,
                    peer = %peer.name(),
                    error = %e,
                    "Peer checkpoint failed"
                );
            }
        }

        let ok = saved.is_ok() && ended.is_ok();
        self.metrics.record_checkpoint(ok);
        if !deleted {
            self.set_state(if ok {
                StubState::Active
            } else {
                StubState::Modified
            });
        }

        saved?;
        ended?;
        debug!(address = %self.address, "Checkpoint taken");
        Ok(true)
    }

    /// Open the peer's side of a checkpoint, bounded by the local boundary.
    ///
    /// Returns the peer if it is now saving. A peer already saving is only
    /// flushed.
    async fn peer_save_start(&mut self, boundary: u64) -> Option<Arc<Journal>> {
        let peer = self.journals.peer.clone()?;
        match peer.save_start_through(boundary).await {
            Ok(true) => Some(peer),
            Ok(false) => {
                if let Err(e) = peer.flush().await {
                    warn!(
                        address = %self.address,
                        peer = %peer.name(),
                        error = %e,
                        "Peer journal flush failed"
                    );
                }
                None
            }
            Err(e) => {
                warn!(
                    address = %self.address,
                    peer = %peer.name(),
                    error = %e,
                    "Peer checkpoint could not start"
                );
                None
            }
        }
    }

    /// Catch up with the peer journal while running.
    ///
    /// Records the peer holds beyond the local sequence are replayed into
    /// this actor; records only this side holds are copied to the peer.
    /// Returns the sequence both journals hold afterwards.
    pub async fn reconcile(&mut self) -> Result<u64> {
        let (Some(local), Some(peer)) = (self.journals.local.clone(), self.journals.peer.clone())
        else {
            return Err(ActorError::illegal_state(format!(
                "{} has no peer journal to reconcile with",
                self.address
            )));
        };
        if !matches!(self.state, StubState::Active | StubState::Modified) {
            return Err(ActorError::illegal_state(format!(
                "cannot reconcile {} while {}",
                self.address,
                self.state.kind()
            )));
        }

        self.flush_journals().await?;
        let applied = local.sequence_replay();
        let plan = ReplayPlan::reconcile(&local, &peer).await?;

        let previous = self.state.clone();
        self.set_state(StubState::Replaying);
        let replayed = self.drive(&plan, applied).await;
        let caught_up = plan.apply_catch_up(&local, &peer).await;
        self.set_state(if replayed > 0 {
            StubState::Modified
        } else {
            previous
        });
        caught_up?;

        info!(
            address = %self.address,
            replayed = replayed,
            sequence = plan.target_sequence,
            "Reconciled with peer journal"
        );
        Ok(plan.target_sequence)
    }

    async fn delete(&mut self) {
        info!(address = %self.address, "Actor deleted");
        self.set_state(StubState::Deleted);
        if let Err(e) = self.flush_journals().await {
            warn!(address = %self.address, error = %e, "Flush before delete failed");
        }
        match self.checkpoint().await {
            Ok(_) => {}
            Err(e) => warn!(address = %self.address, error = %e, "Final checkpoint failed"),
        }
    }

    async fn stop(&mut self, mode: ShutdownMode, ack: oneshot::Sender<()>) -> Flow {
        info!(
            address = %self.address,
            mode = ?mode,
            state = %self.state.kind(),
            "Actor stopping"
        );

        if let Err(e) = self.flush_journals().await {
            warn!(address = %self.address, error = %e, "Flush at shutdown failed");
        }

        let runs_hook = matches!(
            self.state,
            StubState::Active | StubState::Modified | StubState::Saving | StubState::Deleted
        );
        if runs_hook {
            let stopped = AssertUnwindSafe(self.actor.on_shutdown(mode))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(self.panic_error("on_shutdown", panic)));
            if let Err(e) = stopped {
                warn!(address = %self.address, error = %e, "Shutdown hook failed");
            }
        }

        let closed = ActorError::closed(self.address.as_str());
        self.fail_parked(&closed);
        Flow::Stop { mode, ack }
    }

    /// Fail every parked message; used when the mailbox closes
    pub fn close(&mut self) {
        let closed = ActorError::closed(self.address.as_str());
        self.fail_parked(&closed);
        for (reply, _) in self.deferred.drain(..) {
            reply.fail(closed.clone());
        }
    }

    fn panic_error(&self, method: &str, panic: Box<dyn Any + Send>) -> ActorError {
        let message = panic_message(panic.as_ref());
        error!(
            address = %self.address,
            method = %method,
            panic = %message,
            "Actor panicked"
        );
        ActorError::dispatch(self.address.as_str(), method, format!("panicked: {}", message))
    }
}

fn is_shutdown(msg: &Message) -> bool {
    matches!(msg.kind, MessageKind::Control(Control::Shutdown(..)))
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
