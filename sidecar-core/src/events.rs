//! Load-error notification.
//!
//! Errors are never delivered to the listener from the loader's worker
//! thread. They are posted to an `EventHandler` (the application's event
//! queue) and the listener runs wherever that queue is drained.

use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::loader::LoadError;

/// A task posted to an event queue
pub type EventTask = Box<dyn FnOnce() + Send>;

/// Queue that runs posted tasks on its owner's thread
pub trait EventHandler: Send + Sync {
    fn post(&self, task: EventTask);
}

/// Listener of single-sample source events
pub trait EventListener: Send + Sync {
    /// Called once per failed load attempt, including attempts that will be retried
    fn on_load_error(&self, source_id: i32, error: &LoadError);
}

/// Event queue drained explicitly with `run_pending`
#[derive(Default)]
pub struct QueuedEventHandler {
    tasks: Mutex<VecDeque<EventTask>>,
}

impl QueuedEventHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run every task posted so far. Returns how many ran.
    pub fn run_pending(&self) -> usize {
        let tasks: Vec<EventTask> = self.tasks.lock().drain(..).collect();
        let count = tasks.len();
        for task in tasks {
            task();
        }
        count
    }

    pub fn pending(&self) -> usize {
        self.tasks.lock().len()
    }
}

impl EventHandler for QueuedEventHandler {
    fn post(&self, task: EventTask) {
        self.tasks.lock().push_back(task);
    }
}

impl EventHandler for tokio::runtime::Handle {
    fn post(&self, task: EventTask) {
        self.spawn(async move { task() });
    }
}

/// Posts events to an optional listener through its handler
#[derive(Clone, Default)]
pub struct EventDispatcher {
    target: Option<(Arc<dyn EventHandler>, Arc<dyn EventListener>)>,
    source_id: i32,
}

impl EventDispatcher {
    pub fn new(handler: Arc<dyn EventHandler>, listener: Arc<dyn EventListener>, source_id: i32) -> Self {
        Self {
            target: Some((handler, listener)),
            source_id,
        }
    }

    /// Dispatcher that only logs
    pub fn silent(source_id: i32) -> Self {
        Self {
            target: None,
            source_id,
        }
    }

    pub fn source_id(&self) -> i32 {
        self.source_id
    }

    pub fn load_error(&self, error: &LoadError) {
        tracing::warn!("source {}: load error: {}", self.source_id, error);

        if let Some((handler, listener)) = &self.target {
            let listener = listener.clone();
            let error = error.clone();
            let source_id = self.source_id;
            handler.post(Box::new(move || listener.on_load_error(source_id, &error)));
        }
    }
}
