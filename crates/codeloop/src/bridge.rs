//! The bridge between sandboxed code and the scheduler.
//!
//! A bridge call suspends code inside the worker until the scheduler
//! resolves it: nested completion, one-shot sub-call, or user tool. The
//! store tracks each outstanding call as a single-shot future keyed by an
//! engine-side request id; nothing may leak past completion end.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::ids::{BridgeRequestId, CallId};

/// How a bridge call concluded. The error side is a plain message because it
/// surfaces inside the sandbox as a thrown exception.
pub type BridgeOutcome = Result<serde_json::Value, String>;

/// The sandbox host's one edge back into the engine. Implemented by the
/// scheduler so the host never sees runtime state.
#[async_trait]
pub trait BridgeHandler: Send + Sync {
    async fn handle(
        &self,
        caller: &CallId,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> BridgeOutcome;
}

#[derive(Default)]
pub struct BridgeStore {
    next_id: AtomicU64,
    pending: Mutex<HashMap<BridgeRequestId, oneshot::Sender<BridgeOutcome>>>,
}

impl BridgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a fresh outstanding call; the receiver fires exactly once.
    pub fn register(&self) -> (BridgeRequestId, oneshot::Receiver<BridgeOutcome>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .expect("bridge store lock poisoned")
            .insert(id, tx);
        (id, rx)
    }

    /// Fulfil an outstanding call. Returns `false` when the id is unknown
    /// (already resolved, or swept by `fail_all`).
    pub fn resolve(&self, id: BridgeRequestId, outcome: BridgeOutcome) -> bool {
        let sender = self
            .pending
            .lock()
            .expect("bridge store lock poisoned")
            .remove(&id);
        match sender {
            Some(tx) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    /// Forget an outstanding call without resolving it (the waiter is gone).
    pub fn discard(&self, id: BridgeRequestId) {
        self.pending
            .lock()
            .expect("bridge store lock poisoned")
            .remove(&id);
    }

    /// Fail every outstanding call. The completion-end safety net.
    pub fn fail_all(&self, message: &str) -> usize {
        let drained: Vec<_> = {
            let mut pending = self.pending.lock().expect("bridge store lock poisoned");
            pending.drain().collect()
        };
        let count = drained.len();
        for (_, tx) in drained {
            let _ = tx.send(Err(message.to_string()));
        }
        count
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().expect("bridge store lock poisoned").len()
    }
}

/// The production [`BridgeHandler`]: registers a future, enqueues a
/// `HandleBridgeCall`, and waits. The sandbox host holds this and nothing
/// else of the engine.
pub struct QueueBridgeHandler {
    queue: crate::commands::CommandQueue,
    store: Arc<BridgeStore>,
}

impl QueueBridgeHandler {
    pub fn new(queue: crate::commands::CommandQueue, store: Arc<BridgeStore>) -> Self {
        Self { queue, store }
    }
}

#[async_trait]
impl BridgeHandler for QueueBridgeHandler {
    async fn handle(
        &self,
        caller: &CallId,
        method: &str,
        args: Vec<serde_json::Value>,
    ) -> BridgeOutcome {
        let (id, rx) = self.store.register();
        let command = crate::commands::Command::HandleBridgeCall {
            call_id: caller.clone(),
            bridge_request_id: id,
            method: method.to_string(),
            args,
        };
        if self.queue.enqueue(command).await.is_err() {
            self.store.discard(id);
            return Err("scheduler is shut down".to_string());
        }
        rx.await
            .unwrap_or_else(|_| Err("bridge future dropped before resolution".to_string()))
    }
}
