//! # Retrying Load Runner
//!
//! Executes one `Loadable` at a time on a named worker thread, retrying
//! failed attempts with a growing delay until the callback says stop.
//!
//! ```text
//! ┌──────────────┐ start_loading ┌─────────────┐  load()  ┌──────────┐
//! │ Period       │──────────────►│ ThreadLoader│─────────►│ Loadable │
//! │ (callback)   │◄──────────────│ worker      │◄─────────│          │
//! └──────────────┘  completed /  └─────────────┘  Err/Ok  └──────────┘
//!                   canceled / error → RetryAction
//! ```
//!
//! Error accounting: every failed attempt bumps the error count. Once the
//! count exceeds the caller's minimum retry count the task stops and the
//! failure that crossed the ceiling becomes sticky: `maybe_throw_error`
//! returns it on every call until the loader is released.
//! `RetryAction::DontRetryFatal` stops the task the same way on the first
//! failure.

use std::marker::PhantomData;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::data_source::DataSourceError;

#[derive(Debug, Clone, Error)]
pub enum LoadError {
    #[error("{0}")]
    Source(Arc<DataSourceError>),
    #[error("Unexpected load failure: {0}")]
    Unexpected(String),
}

impl From<DataSourceError> for LoadError {
    fn from(e: DataSourceError) -> Self {
        LoadError::Source(Arc::new(e))
    }
}

impl LoadError {
    /// The underlying accessor failure, if this error came from one
    pub fn source_error(&self) -> Option<&DataSourceError> {
        match self {
            LoadError::Source(e) => Some(e),
            LoadError::Unexpected(_) => None,
        }
    }
}

// ============================================================================
// Contract
// ============================================================================

/// A unit of work the runner can execute (and re-execute on retry)
pub trait Loadable: Send + 'static {
    /// Request cancellation of an in-progress `load`
    fn cancel_load(&self);

    fn is_load_canceled(&self) -> bool;

    /// Perform the work. Called again from scratch on every retry.
    fn load(&mut self) -> Result<(), DataSourceError>;
}

/// What the runner should do after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryAction {
    Retry,
    RetryResetErrorCount,
    DontRetry,
    DontRetryFatal,
}

/// Receives the outcome of a load
pub trait LoaderCallback<T>: Send + Sync {
    fn on_load_completed(&self, loadable: T, load_duration: Duration);

    /// `released` is true when the cancellation came from `Loader::release`
    fn on_load_canceled(&self, loadable: T, load_duration: Duration, released: bool);

    fn on_load_error(&self, loadable: &T, load_duration: Duration, error: &LoadError) -> RetryAction;
}

/// Runs at most one loadable at a time
pub trait Loader<T: Loadable>: Send {
    /// Submit a loadable. Panics if a load is already in flight.
    fn start_loading(&mut self, loadable: T, callback: Arc<dyn LoaderCallback<T>>, min_retry_count: u32);

    fn is_loading(&self) -> bool;

    /// Fails with the pending error once the retry ceiling is exceeded,
    /// or with a fatal error
    fn maybe_throw_error(&self) -> Result<(), LoadError>;

    /// Abandon any in-flight load. The loader cannot be used afterwards.
    fn release(&mut self);
}

/// Creates runners for periods as they are prepared
pub trait LoaderFactory<T: Loadable>: Send + Sync {
    fn create_loader(&self, name: &str) -> Box<dyn Loader<T>>;
}

// ============================================================================
// Configuration
// ============================================================================

/// Retry timing for `ThreadLoader`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoaderConfig {
    /// Delay added per consecutive failure (milliseconds)
    pub retry_delay_step_ms: u64,
    /// Upper bound on the delay between attempts (milliseconds)
    pub max_retry_delay_ms: u64,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            retry_delay_step_ms: 1_000,
            max_retry_delay_ms: 5_000,
        }
    }
}

impl LoaderConfig {
    /// Delay before the attempt following the `error_count`-th failure
    pub fn retry_delay(&self, error_count: u32) -> Duration {
        let step = u64::from(error_count.saturating_sub(1)).saturating_mul(self.retry_delay_step_ms);
        Duration::from_millis(step.min(self.max_retry_delay_ms))
    }
}

// ============================================================================
// Error Accounting
// ============================================================================

/// Error bookkeeping shared by the runners
#[derive(Debug, Default)]
pub(crate) struct RetryState {
    pub error_count: u32,
    pub min_retry_count: u32,
    /// First error that stopped the task; never overwritten
    pub fatal_error: Option<LoadError>,
}

impl RetryState {
    pub fn begin(&mut self, min_retry_count: u32) {
        self.error_count = 0;
        self.min_retry_count = min_retry_count;
    }

    /// Record a failed attempt. Returns true if the task should run again.
    pub fn record_failure(&mut self, action: RetryAction, error: LoadError) -> bool {
        match action {
            RetryAction::DontRetryFatal => {
                self.fatal_error.get_or_insert(error);
                false
            }
            RetryAction::DontRetry => false,
            RetryAction::Retry | RetryAction::RetryResetErrorCount => {
                self.error_count = match action {
                    RetryAction::RetryResetErrorCount => 1,
                    _ => self.error_count + 1,
                };
                if self.error_count > self.min_retry_count {
                    self.fatal_error.get_or_insert(error);
                    return false;
                }
                true
            }
        }
    }

    /// The sticky error, if the task was stopped by one
    pub fn check(&self) -> Result<(), LoadError> {
        match &self.fatal_error {
            Some(error) => Err(error.clone()),
            None => Ok(()),
        }
    }
}

pub(crate) fn run_guarded<T: Loadable>(loadable: &mut T) -> Result<(), LoadError> {
    match panic::catch_unwind(AssertUnwindSafe(|| loadable.load())) {
        Ok(result) => result.map_err(LoadError::from),
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "panic in load task".to_string());
            Err(LoadError::Unexpected(message))
        }
    }
}

// ============================================================================
// Thread Loader
// ============================================================================

#[derive(Default)]
struct TaskState {
    loading: bool,
    canceled: bool,
    released: bool,
    retry: RetryState,
}

struct LoaderShared {
    state: Mutex<TaskState>,
    wake: Condvar,
}

/// Runs each load on its own named worker thread
pub struct ThreadLoader<T: Loadable> {
    name: String,
    config: LoaderConfig,
    shared: Arc<LoaderShared>,
    worker: Option<JoinHandle<()>>,
    _marker: PhantomData<fn(T)>,
}

impl<T: Loadable> ThreadLoader<T> {
    pub fn new(name: &str, config: LoaderConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            shared: Arc::new(LoaderShared {
                state: Mutex::new(TaskState::default()),
                wake: Condvar::new(),
            }),
            worker: None,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl<T: Loadable> Loader<T> for ThreadLoader<T> {
    fn start_loading(&mut self, loadable: T, callback: Arc<dyn LoaderCallback<T>>, min_retry_count: u32) {
        {
            let mut state = self.shared.state.lock();
            assert!(!state.released, "start_loading on a released loader");
            assert!(!state.loading, "start_loading while a load is in flight");
            state.loading = true;
            state.canceled = false;
            state.retry.begin(min_retry_count);
        }

        // The previous worker has already delivered its callback.
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        let shared = self.shared.clone();
        let config = self.config.clone();
        let spawned = thread::Builder::new()
            .name(self.name.clone())
            .spawn(move || run_task(loadable, callback, shared, config));

        match spawned {
            Ok(handle) => self.worker = Some(handle),
            Err(e) => {
                tracing::error!("{}: failed to spawn worker: {}", self.name, e);
                let mut state = self.shared.state.lock();
                state.loading = false;
                state.retry.fatal_error = Some(LoadError::Unexpected(format!("spawn failed: {}", e)));
            }
        }
    }

    fn is_loading(&self) -> bool {
        self.shared.state.lock().loading
    }

    fn maybe_throw_error(&self) -> Result<(), LoadError> {
        self.shared.state.lock().retry.check()
    }

    fn release(&mut self) {
        let mut state = self.shared.state.lock();
        state.canceled = true;
        state.released = true;
        self.shared.wake.notify_all();
        drop(state);

        // An in-flight blocking read is abandoned, not joined.
        self.worker = None;
        tracing::debug!("{}: released", self.name);
    }
}

impl<T: Loadable> Drop for ThreadLoader<T> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        state.canceled = true;
        state.released = true;
        self.shared.wake.notify_all();
    }
}

fn run_task<T: Loadable>(
    mut loadable: T,
    callback: Arc<dyn LoaderCallback<T>>,
    shared: Arc<LoaderShared>,
    config: LoaderConfig,
) {
    let started = Instant::now();

    loop {
        {
            let state = shared.state.lock();
            if state.canceled {
                let released = state.released;
                drop(state);
                loadable.cancel_load();
                finish_canceled(loadable, &callback, &shared, started, released);
                return;
            }
        }

        let result = run_guarded(&mut loadable);

        let (canceled, released) = {
            let state = shared.state.lock();
            (state.canceled, state.released)
        };
        if canceled || loadable.is_load_canceled() {
            finish_canceled(loadable, &callback, &shared, started, released);
            return;
        }

        let error = match result {
            Ok(()) => {
                callback.on_load_completed(loadable, started.elapsed());
                shared.state.lock().loading = false;
                return;
            }
            Err(error) => error,
        };

        let action = callback.on_load_error(&loadable, started.elapsed(), &error);
        let mut state = shared.state.lock();
        if !state.retry.record_failure(action, error) {
            if state.retry.fatal_error.is_some() {
                tracing::warn!(
                    "{}: giving up after {} failed attempt(s)",
                    thread::current().name().unwrap_or("loader"),
                    state.retry.error_count
                );
            }
            state.loading = false;
            return;
        }

        let deadline = Instant::now() + config.retry_delay(state.retry.error_count);
        tracing::debug!(
            "{}: retrying (attempt {}) after {:?}",
            thread::current().name().unwrap_or("loader"),
            state.retry.error_count + 1,
            config.retry_delay(state.retry.error_count)
        );
        while !state.canceled {
            if shared.wake.wait_until(&mut state, deadline).timed_out() {
                break;
            }
        }
    }
}

fn finish_canceled<T: Loadable>(
    loadable: T,
    callback: &Arc<dyn LoaderCallback<T>>,
    shared: &LoaderShared,
    started: Instant,
    released: bool,
) {
    callback.on_load_canceled(loadable, started.elapsed(), released);
    shared.state.lock().loading = false;
}

/// Factory producing `ThreadLoader`s with a shared retry config
#[derive(Debug, Clone, Default)]
pub struct ThreadLoaderFactory {
    pub config: LoaderConfig,
}

impl ThreadLoaderFactory {
    pub fn new(config: LoaderConfig) -> Self {
        Self { config }
    }
}

impl<T: Loadable> LoaderFactory<T> for ThreadLoaderFactory {
    fn create_loader(&self, name: &str) -> Box<dyn Loader<T>> {
        Box::new(ThreadLoader::new(name, self.config.clone()))
    }
}
