//! Shared fixtures for the scenario tests

#![allow(dead_code)]

use async_trait::async_trait;
use messaging_actors::{
    ActorBehavior, ActorError, ActorSystem, CallContext, JournalRecord, JournalStore,
    MethodTable, Result, RuntimeConfig, ShutdownMode, StreamSink,
};
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_env_filter("messaging_actors=debug")
        .try_init();
}

pub fn system() -> ActorSystem {
    init_tracing();
    ActorSystem::new(RuntimeConfig::default()).unwrap()
}

pub fn system_with(config: RuntimeConfig) -> ActorSystem {
    init_tracing();
    ActorSystem::new(config).unwrap()
}

/// How `on_load` behaves
#[derive(Clone)]
pub enum Load {
    Ready,
    Wait(Arc<Notify>),
    Never,
    Fail(&'static str),
}

/// Lets a test hold the actor inside a call
#[derive(Default)]
pub struct Gate {
    pub entered: Notify,
    pub release: Notify,
}

/// Observations shared with the test body
#[derive(Default)]
pub struct Recorder {
    pub seen: Mutex<Vec<i64>>,
    pub in_flight: AtomicUsize,
    pub overlapped: AtomicBool,
    pub saved: Mutex<Option<i64>>,
    pub shutdown: Mutex<Option<ShutdownMode>>,
}

/// Counter actor used across the scenarios
pub struct Counter {
    pub value: i64,
    pub load: Load,
    pub gate: Arc<Gate>,
    pub recorder: Arc<Recorder>,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: 0,
            load: Load::Ready,
            gate: Arc::default(),
            recorder: Arc::default(),
        }
    }

    pub fn with_load(mut self, load: Load) -> Self {
        self.load = load;
        self
    }

    pub fn with_recorder(mut self, recorder: Arc<Recorder>) -> Self {
        self.recorder = recorder;
        self
    }

    pub fn with_gate(mut self, gate: Arc<Gate>) -> Self {
        self.gate = gate;
        self
    }
}

fn int(args: &[Value], index: usize) -> i64 {
    args.get(index).and_then(Value::as_i64).unwrap_or(0)
}

#[async_trait]
impl ActorBehavior for Counter {
    fn methods(&self) -> MethodTable {
        MethodTable::builder()
            .modify("increment", 1)
            .modify_send("add", 1)
            .modify_send("record", 1)
            .modify_send("remove", 0)
            .query("get", 0)
            .query("fail", 0)
            .query("explode", 0)
            .send("block", 0)
            .stream("range", 2)
            .build()
    }

    fn requires_load(&self) -> bool {
        true
    }

    async fn on_load(&mut self) -> Result<()> {
        match &self.load {
            Load::Ready => {}
            Load::Wait(ready) => ready.notified().await,
            Load::Never => std::future::pending::<()>().await,
            Load::Fail(reason) => return Err(ActorError::load("counter", *reason)),
        }
        if let Some(saved) = *self.recorder.saved.lock() {
            self.value = saved;
        }
        Ok(())
    }

    async fn call(&mut self, ctx: &mut CallContext, method: &str, args: Vec<Value>) -> Result<Value> {
        if self.recorder.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
            self.recorder.overlapped.store(true, Ordering::SeqCst);
        }
        tokio::task::yield_now().await;

        let result = match method {
            "increment" => {
                self.value += int(&args, 0);
                Ok(json!(self.value))
            }
            "add" => {
                self.value += int(&args, 0);
                Ok(Value::Null)
            }
            "record" => {
                self.recorder.seen.lock().push(int(&args, 0));
                Ok(Value::Null)
            }
            "remove" => {
                ctx.delete();
                Ok(Value::Null)
            }
            "get" => Ok(json!(self.value)),
            "fail" => Err(ActorError::dispatch(ctx.address().as_str(), method, "asked to fail")),
            "explode" => panic!("counter exploded"),
            "block" => {
                self.gate.entered.notify_one();
                self.gate.release.notified().await;
                Ok(Value::Null)
            }
            other => Err(ActorError::method_not_found(ctx.address().as_str(), other)),
        };

        self.recorder.in_flight.fetch_sub(1, Ordering::SeqCst);
        result
    }

    async fn stream(
        &mut self,
        _ctx: &mut CallContext,
        _method: &str,
        args: Vec<Value>,
        sink: &StreamSink,
    ) -> Result<()> {
        for i in int(&args, 0)..int(&args, 1) {
            if sink.is_cancelled() {
                break;
            }
            sink.emit_one(json!(i));
            tokio::task::yield_now().await;
        }
        Ok(())
    }

    async fn on_save(&mut self) -> Result<()> {
        *self.recorder.saved.lock() = Some(self.value);
        Ok(())
    }

    async fn on_shutdown(&mut self, mode: ShutdownMode) -> Result<()> {
        *self.recorder.shutdown.lock() = Some(mode);
        Ok(())
    }
}

/// Store whose appends always fail
#[derive(Debug, Default)]
pub struct BrokenStore;

#[async_trait]
impl JournalStore for BrokenStore {
    async fn append(&self, _records: &[JournalRecord]) -> Result<()> {
        Err(ActorError::journal("disk full"))
    }

    async fn flush(&self) -> Result<()> {
        Ok(())
    }

    async fn read_after(&self, _after: u64) -> Result<Vec<JournalRecord>> {
        Ok(Vec::new())
    }

    async fn last_sequence(&self) -> Result<u64> {
        Ok(0)
    }

    async fn checkpoint_sequence(&self) -> Result<u64> {
        Ok(0)
    }

    async fn truncate_through(&self, _sequence: u64) -> Result<()> {
        Ok(())
    }
}
