//! Per-completion runtime assembly.
//!
//! A fresh runtime is created for every completion and torn down when the
//! scheduler loop exits. It owns everything the handlers share: the work
//! queue, the event bus, budget counters, the call-state map, and the
//! outstanding bridge futures.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::{Semaphore, oneshot};

use crate::bridge::{BridgeStore, QueueBridgeHandler};
use crate::budget::Budget;
use crate::call::CallStates;
use crate::commands::{CommandQueue, CommandReceiver};
use crate::config::Config;
use crate::error::EngineError;
use crate::events::EventBus;
use crate::ids::{CallId, CompletionId};
use crate::model::LanguageModel;
use crate::prompts::PromptSet;
use crate::sandbox::SandboxFactory;
use crate::submit::Answer;

/// The completion's final outcome.
pub type CompletionResult = Result<Answer, EngineError>;

pub struct CompletionRuntime {
    pub completion_id: CompletionId,
    pub root_call_id: CallId,
    pub config: Arc<Config>,
    pub queue: CommandQueue,
    pub events: EventBus,
    pub budget: Arc<Budget>,
    pub llm_permits: Arc<Semaphore>,
    pub call_states: CallStates,
    pub bridge: Arc<BridgeStore>,
    pub bridge_handler: Arc<QueueBridgeHandler>,
    pub model: Arc<dyn LanguageModel>,
    pub sandbox_factory: Arc<dyn SandboxFactory>,
    pub prompts: Arc<PromptSet>,
    result_tx: Mutex<Option<oneshot::Sender<CompletionResult>>>,
}

impl CompletionRuntime {
    pub fn new(
        config: Arc<Config>,
        model: Arc<dyn LanguageModel>,
        sandbox_factory: Arc<dyn SandboxFactory>,
        prompts: Arc<PromptSet>,
    ) -> (Arc<Self>, CommandReceiver, oneshot::Receiver<CompletionResult>) {
        let completion_id = CompletionId::generate();
        let events = EventBus::new(config.event_buffer_capacity);
        let (queue, receiver) =
            CommandQueue::bounded(config.command_queue_capacity, completion_id.clone(), events.clone());
        let bridge = Arc::new(BridgeStore::new());
        let bridge_handler = Arc::new(QueueBridgeHandler::new(queue.clone(), bridge.clone()));
        let (result_tx, result_rx) = oneshot::channel();

        let runtime = Arc::new(Self {
            completion_id,
            root_call_id: CallId::generate(),
            budget: Arc::new(Budget::new(&config)),
            llm_permits: Arc::new(Semaphore::new(config.concurrency.max(1))),
            call_states: Arc::new(Mutex::new(HashMap::new())),
            bridge,
            bridge_handler,
            model,
            sandbox_factory,
            prompts,
            queue,
            events,
            config,
            result_tx: Mutex::new(Some(result_tx)),
        });
        (runtime, receiver, result_rx)
    }

    /// Resolve the completion's result future. First caller wins; later
    /// resolutions are ignored so teardown cannot mask the original exit
    /// reason.
    pub fn resolve_result(&self, result: CompletionResult) {
        if let Some(tx) = self
            .result_tx
            .lock()
            .expect("result lock poisoned")
            .take()
        {
            let _ = tx.send(result);
        }
    }

    pub fn result_pending(&self) -> bool {
        self.result_tx
            .lock()
            .expect("result lock poisoned")
            .is_some()
    }
}
