//! Actor Mailbox
//!
//! Per-actor FIFO queue and its drain loop. Messages go into a bounded tokio
//! channel; a scheduling flag makes sure at most one drain task exists per
//! mailbox, and the worker lock around the stub enforces the same thing for
//! anything that slips past the flag.
//!
//! # Drain scheduling
//!
//! ```text
//!   offer ──► channel ──► wake: IDLE ─CAS─► SCHEDULED ─► spawn drain task
//!                                               │
//!            offer_and_wake while SCHEDULED ─► RESCHEDULE (one more pass)
//!
//!   drain task: lock worker ─► before_batch ─► ≤ batch_limit messages
//!               ─► after_batch ─► unlock ─► SCHEDULED→IDLE, re-check queue
//! ```
//!
//! The drain task never recurses: more work after a batch is handled by the
//! same task after a yield.

use crate::config::MailboxConfig;
use crate::messages::{Address, Control, Message, MessageKind};
use crate::stub::{Flow, StateCell, Stub, StubStateKind};
use crate::system::{ActorBehavior, ShutdownMode};
use crate::{ActorError, Result};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc::error::{SendTimeoutError, TrySendError};
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const IDLE: u8 = 0;
const SCHEDULED: u8 = 1;
const RESCHEDULE: u8 = 2;

/// What to do with a message that does not fit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OverflowPolicy {
    /// Wait for space, bounded by the mailbox send timeout
    Block,
    /// Discard; queries fail with `QueueFull`
    Drop,
    /// Refuse; the offer returns false and queries fail with `QueueFull`
    Reject,
}

/// Mailbox facts handed to an overflow handler
#[derive(Debug, Clone)]
pub struct OverflowContext {
    pub address: Address,
    pub capacity: usize,
    pub size: usize,
    pub timeout: Duration,
}

/// Admission control for full mailboxes
pub trait OverflowHandler: Send + Sync + 'static {
    fn on_overflow(&self, message: &Message, context: &OverflowContext) -> OverflowPolicy;
}

/// Default handler: log and reject
#[derive(Debug, Default, Clone, Copy)]
pub struct RejectOnOverflow;

impl OverflowHandler for RejectOnOverflow {
    fn on_overflow(&self, message: &Message, context: &OverflowContext) -> OverflowPolicy {
        warn!(
            address = %context.address,
            method = %message.method,
            capacity = context.capacity,
            size = context.size,
            timeout_ms = context.timeout.as_millis(),
            "Mailbox full, rejecting message"
        );
        OverflowPolicy::Reject
    }
}

/// Per-mailbox counters
#[derive(Debug, Default)]
pub struct MailboxMetrics {
    pub messages_processed: AtomicU64,
    pub dispatch_failures: AtomicU64,
    pub rejected_messages: AtomicU64,
    pub parked_messages: AtomicU64,
    pub replayed_records: AtomicU64,
    pub overflow_events: AtomicU64,
    pub batches: AtomicU64,
    pub journal_flushes: AtomicU64,
    pub checkpoints: AtomicU64,
    pub checkpoint_failures: AtomicU64,
    pub total_processing_time_ns: AtomicU64,
}

impl MailboxMetrics {
    pub fn record_message_handled(&self, duration: Duration) {
        self.messages_processed.fetch_add(1, Ordering::Relaxed);
        self.total_processing_time_ns
            .fetch_add(duration.as_nanos() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.dispatch_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rejected(&self) {
        self.rejected_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_parked(&self) {
        self.parked_messages.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_replayed(&self) {
        self.replayed_records.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an offer that found the queue full
    pub fn record_overflow(&self) {
        self.overflow_events.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch(&self) {
        self.batches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flush(&self) {
        self.journal_flushes.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_checkpoint(&self, success: bool) {
        self.checkpoints.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.checkpoint_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn avg_processing_time_ns(&self) -> f64 {
        let count = self.messages_processed.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        let total = self.total_processing_time_ns.load(Ordering::Relaxed);
        total as f64 / count as f64
    }

    pub fn snapshot(&self) -> MailboxStats {
        MailboxStats {
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            dispatch_failures: self.dispatch_failures.load(Ordering::Relaxed),
            rejected_messages: self.rejected_messages.load(Ordering::Relaxed),
            parked_messages: self.parked_messages.load(Ordering::Relaxed),
            replayed_records: self.replayed_records.load(Ordering::Relaxed),
            overflow_events: self.overflow_events.load(Ordering::Relaxed),
            batches: self.batches.load(Ordering::Relaxed),
            journal_flushes: self.journal_flushes.load(Ordering::Relaxed),
            checkpoints: self.checkpoints.load(Ordering::Relaxed),
            checkpoint_failures: self.checkpoint_failures.load(Ordering::Relaxed),
            avg_processing_time_ns: self.avg_processing_time_ns(),
        }
    }
}

/// Point-in-time copy of [`MailboxMetrics`]
#[derive(Debug, Clone, PartialEq)]
pub struct MailboxStats {
    pub messages_processed: u64,
    pub dispatch_failures: u64,
    pub rejected_messages: u64,
    pub parked_messages: u64,
    pub replayed_records: u64,
    pub overflow_events: u64,
    pub batches: u64,
    pub journal_flushes: u64,
    pub checkpoints: u64,
    pub checkpoint_failures: u64,
    pub avg_processing_time_ns: f64,
}

/// Type-erased view of a mailbox, used by [`ActorRef`](crate::ActorRef)
#[async_trait]
pub trait MailboxHandle: Send + Sync + 'static {
    fn address(&self) -> &Address;

    /// Enqueue; false if the message could not be admitted
    async fn offer(&self, message: Message, timeout: Duration) -> bool;

    /// Enqueue and always schedule a drain pass
    async fn offer_and_wake(&self, message: Message, timeout: Duration) -> bool;

    /// Queued messages. Observational only.
    fn size(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.size() == 0
    }

    fn capacity(&self) -> usize;

    fn state(&self) -> StubStateKind;

    fn is_closed(&self) -> bool;

    fn metrics(&self) -> Arc<MailboxMetrics>;

    async fn shutdown(&self, mode: ShutdownMode) -> Result<()>;
}

struct Worker<A: ActorBehavior> {
    stub: Stub<A>,
    receiver: mpsc::Receiver<Message>,
    stopped: bool,
}

/// Queue plus drain loop for one actor
pub struct Mailbox<A: ActorBehavior> {
    address: Address,
    sender: mpsc::Sender<Message>,
    worker: Mutex<Worker<A>>,
    schedule: AtomicU8,
    closed: AtomicBool,
    immediate: AtomicBool,
    /// Cancelled by shutdown; interrupts a pending load
    stopping: CancellationToken,
    state: StateCell,
    overflow: Arc<dyn OverflowHandler>,
    config: MailboxConfig,
    metrics: Arc<MailboxMetrics>,
    me: Weak<Self>,
}

impl<A: ActorBehavior> std::fmt::Debug for Mailbox<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailbox")
            .field("address", &self.address)
            .field("size", &self.size())
            .field("state", &self.state.get())
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl<A: ActorBehavior> Mailbox<A> {
    /// Build a mailbox around a stub. Nothing runs until [`start`](Self::start).
    pub fn new(
        stub: Stub<A>,
        config: MailboxConfig,
        overflow: Arc<dyn OverflowHandler>,
        metrics: Arc<MailboxMetrics>,
    ) -> Arc<Self> {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        let address = stub.address().clone();
        let state = stub.state_cell();

        Arc::new_cyclic(|me| Self {
            address,
            sender,
            worker: Mutex::new(Worker {
                stub,
                receiver,
                stopped: false,
            }),
            schedule: AtomicU8::new(IDLE),
            closed: AtomicBool::new(false),
            immediate: AtomicBool::new(false),
            stopping: CancellationToken::new(),
            state,
            overflow,
            config,
            metrics,
            me: me.clone(),
        })
    }

    /// Schedule activation as the first activity of the mailbox
    pub fn start(&self) {
        self.wake(true);
    }

    async fn enqueue(&self, msg: Message, timeout: Duration, force: bool) -> bool {
        if msg.target != self.address {
            warn!(
                address = %self.address,
                target = %msg.target,
                method = %msg.method,
                "Message offered to the wrong mailbox"
            );
            let reason = format!("message for {} offered to {}", msg.target, self.address);
            msg.fail(ActorError::illegal_state(reason));
            return false;
        }
        if self.closed.load(Ordering::Acquire) {
            msg.fail(ActorError::closed(self.address.as_str()));
            return true;
        }
        if self.state.get() == StubStateKind::Deleted {
            msg.fail(ActorError::deleted(self.address.as_str()));
            return true;
        }

        let timeout = timeout.min(self.config.send_timeout());
        let rejected = if timeout.is_zero() {
            match self.sender.try_send(msg) {
                Ok(()) => None,
                Err(TrySendError::Full(msg)) => Some(msg),
                Err(TrySendError::Closed(msg)) => {
                    msg.fail(ActorError::closed(self.address.as_str()));
                    return true;
                }
            }
        } else {
            match self.sender.send_timeout(msg, timeout).await {
                Ok(()) => None,
                Err(SendTimeoutError::Timeout(msg)) => Some(msg),
                Err(SendTimeoutError::Closed(msg)) => {
                    msg.fail(ActorError::closed(self.address.as_str()));
                    return true;
                }
            }
        };

        match rejected {
            None => {
                self.wake(force);
                true
            }
            Some(msg) => self.overflow(msg, timeout, force).await,
        }
    }

    async fn overflow(&self, msg: Message, timeout: Duration, force: bool) -> bool {
        self.metrics.record_overflow();
        let context = OverflowContext {
            address: self.address.clone(),
            capacity: self.capacity(),
            size: self.size(),
            timeout,
        };

        match self.overflow.on_overflow(&msg, &context) {
            OverflowPolicy::Block => {
                match self
                    .sender
                    .send_timeout(msg, self.config.send_timeout())
                    .await
                {
                    Ok(()) => {
                        self.wake(force);
                        true
                    }
                    Err(SendTimeoutError::Timeout(msg)) => {
                        msg.fail(ActorError::queue_full(self.address.as_str(), context.capacity));
                        false
                    }
                    Err(SendTimeoutError::Closed(msg)) => {
                        msg.fail(ActorError::closed(self.address.as_str()));
                        true
                    }
                }
            }
            OverflowPolicy::Drop => {
                debug!(address = %self.address, method = %msg.method, "Dropping overflow message");
                match msg.kind {
                    MessageKind::Send => {}
                    _ => msg.fail(ActorError::queue_full(self.address.as_str(), context.capacity)),
                }
                true
            }
            OverflowPolicy::Reject => {
                msg.fail(ActorError::queue_full(self.address.as_str(), context.capacity));
                false
            }
        }
    }

    fn wake(&self, force: bool) {
        loop {
            match self.schedule.load(Ordering::Acquire) {
                IDLE => {
                    if self
                        .schedule
                        .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        self.spawn_drain();
                        return;
                    }
                }
                SCHEDULED if force => {
                    if self
                        .schedule
                        .compare_exchange(SCHEDULED, RESCHEDULE, Ordering::AcqRel, Ordering::Acquire)
                        .is_ok()
                    {
                        return;
                    }
                }
                _ => return,
            }
        }
    }

    fn spawn_drain(&self) {
        let Some(mailbox) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            mailbox.drain().await;
        });
    }

    fn has_pending(&self) -> bool {
        self.sender.capacity() < self.sender.max_capacity()
    }

    async fn drain(self: Arc<Self>) {
        loop {
            {
                let mut worker = self.worker.lock().await;
                self.run_batch(&mut worker).await;
            }

            match self
                .schedule
                .compare_exchange(SCHEDULED, IDLE, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    let more = self.has_pending()
                        && self
                            .schedule
                            .compare_exchange(IDLE, SCHEDULED, Ordering::AcqRel, Ordering::Acquire)
                            .is_ok();
                    if !more {
                        return;
                    }
                }
                Err(_) => self.schedule.store(SCHEDULED, Ordering::Release),
            }
            tokio::task::yield_now().await;
        }
    }

    async fn run_batch(&self, worker: &mut Worker<A>) {
        let Worker {
            stub,
            receiver,
            stopped,
        } = worker;

        if *stopped {
            while let Ok(msg) = receiver.try_recv() {
                msg.fail(ActorError::closed(self.address.as_str()));
            }
            return;
        }

        stub.before_batch();
        let mut flow = Flow::Continue;
        if !stub.is_activated() {
            flow = stub.activate(&self.stopping).await;
        }

        let mut handled = 0;
        while matches!(flow, Flow::Continue) && handled < self.config.batch_limit {
            let Ok(msg) = receiver.try_recv() else {
                break;
            };
            handled += 1;

            if self.immediate.load(Ordering::Acquire) && !is_shutdown(&msg) {
                msg.fail(ActorError::closed(self.address.as_str()));
                continue;
            }
            flow = stub.route(msg).await;
        }
        stub.after_batch().await;

        let (mode, ack) = match flow {
            Flow::Continue => return,
            Flow::Stop { mode, ack } => (Some(mode), Some(ack)),
            Flow::Interrupted => (None, None),
        };

        *stopped = true;
        self.closed.store(true, Ordering::Release);
        receiver.close();
        let mut discarded = 0;
        // Queued shutdown requests are acknowledged by `fail`.
        while let Ok(msg) = receiver.try_recv() {
            discarded += 1;
            msg.fail(ActorError::closed(self.address.as_str()));
        }
        stub.close();
        info!(
            address = %self.address,
            mode = ?mode,
            discarded = discarded,
            interrupted = ack.is_none(),
            "Mailbox closed"
        );
        if let Some(ack) = ack {
            let _ = ack.send(());
        }
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn size(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn metrics(&self) -> Arc<MailboxMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Stop the actor. Graceful lets queued messages run first; immediate
    /// fails them with `Closed`. New offers fail with `Closed` either way.
    /// An actor still loading is stopped without running its queue.
    pub async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if mode == ShutdownMode::Immediate {
            self.immediate.store(true, Ordering::Release);
        }
        self.stopping.cancel();

        let wait = self.config.shutdown_timeout();
        let (ack, done) = oneshot::channel();
        let msg = Message::control(self.address.clone(), Control::Shutdown(mode, ack));

        // A full queue during load drains once the interrupted load closes it.
        match tokio::time::timeout(wait, self.sender.send(msg)).await {
            Ok(Ok(())) => self.wake(true),
            Ok(Err(_)) => return Ok(()),
            Err(_) => {
                warn!(address = %self.address, "Shutdown request could not be queued in time");
                return Err(ActorError::timeout(
                    format!("shutdown {}", self.address),
                    wait.as_millis() as u64,
                ));
            }
        }

        match tokio::time::timeout(wait, done).await {
            Ok(_) => Ok(()),
            Err(_) => {
                warn!(
                    address = %self.address,
                    mode = ?mode,
                    timeout_ms = wait.as_millis(),
                    "Actor did not stop in time"
                );
                Err(ActorError::timeout(
                    format!("shutdown {}", self.address),
                    wait.as_millis() as u64,
                ))
            }
        }
    }
}

fn is_shutdown(msg: &Message) -> bool {
    matches!(msg.kind, MessageKind::Control(Control::Shutdown(..)))
}

#[async_trait]
impl<A: ActorBehavior> MailboxHandle for Mailbox<A> {
    fn address(&self) -> &Address {
        &self.address
    }

    async fn offer(&self, message: Message, timeout: Duration) -> bool {
        self.enqueue(message, timeout, false).await
    }

    async fn offer_and_wake(&self, message: Message, timeout: Duration) -> bool {
        self.enqueue(message, timeout, true).await
    }

    fn size(&self) -> usize {
        Mailbox::size(self)
    }

    fn capacity(&self) -> usize {
        Mailbox::capacity(self)
    }

    fn state(&self) -> StubStateKind {
        self.state.get()
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn metrics(&self) -> Arc<MailboxMetrics> {
        Mailbox::metrics(self)
    }

    async fn shutdown(&self, mode: ShutdownMode) -> Result<()> {
        Mailbox::shutdown(self, mode).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_snapshot() {
        let metrics = MailboxMetrics::default();
        assert_eq!(metrics.avg_processing_time_ns(), 0.0);

        metrics.record_message_handled(Duration::from_nanos(100));
        metrics.record_message_handled(Duration::from_nanos(300));
        metrics.record_checkpoint(true);
        metrics.record_checkpoint(false);
        metrics.record_overflow();

        let stats = metrics.snapshot();
        assert_eq!(stats.messages_processed, 2);
        assert_eq!(stats.avg_processing_time_ns, 200.0);
        assert_eq!(stats.checkpoints, 2);
        assert_eq!(stats.checkpoint_failures, 1);
        assert_eq!(stats.overflow_events, 1);
    }

    #[test]
    fn test_reject_handler_rejects() {
        let msg = Message::send("a".into(), "m", vec![]);
        let context = OverflowContext {
            address: "a".into(),
            capacity: 1,
            size: 1,
            timeout: Duration::ZERO,
        };
        assert_eq!(
            RejectOnOverflow.on_overflow(&msg, &context),
            OverflowPolicy::Reject
        );
    }
}
