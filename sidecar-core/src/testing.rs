//! Deterministic doubles for tests.
//!
//! - `ManualLoader`: a load runner driven step by step from the test thread,
//!   with the same retry and error accounting as `ThreadLoader`
//! - `FlakyDataSourceFactory`: accessors that refuse to open a set number of
//!   times before serving their bytes

use std::io;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;

use crate::data_source::{ByteArrayDataSource, DataSource, DataSourceError, DataSourceFactory, DataSpec, ReadOutcome};
use crate::loader::{run_guarded, LoadError, Loadable, Loader, LoaderCallback, LoaderFactory, RetryAction, RetryState};

// ============================================================================
// Manual Loader
// ============================================================================

/// What a single `ManualLoader::run_next` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// Nothing was pending
    Idle,
    Completed,
    /// The attempt failed; the callback answered with this action
    Failed(RetryAction),
}

struct Pending<T> {
    loadable: T,
    callback: Arc<dyn LoaderCallback<T>>,
    started: Instant,
}

struct ManualState<T> {
    pending: Option<Pending<T>>,
    running: bool,
    released: bool,
    submissions: usize,
    retry: RetryState,
}

/// Load runner that only makes progress when the test calls `run_next`
///
/// Clones share state, so a test can keep a handle while the period owns
/// another.
pub struct ManualLoader<T> {
    inner: Arc<Mutex<ManualState<T>>>,
}

impl<T> Clone for ManualLoader<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Loadable> Default for ManualLoader<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Loadable> ManualLoader<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ManualState {
                pending: None,
                running: false,
                released: false,
                submissions: 0,
                retry: RetryState::default(),
            })),
        }
    }

    /// Number of `start_loading` calls so far
    pub fn submissions(&self) -> usize {
        self.inner.lock().submissions
    }

    pub fn has_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }

    pub fn is_released(&self) -> bool {
        self.inner.lock().released
    }

    pub fn error_count(&self) -> u32 {
        self.inner.lock().retry.error_count
    }

    /// Run one attempt of the pending loadable on this thread
    pub fn run_next(&self) -> RunOutcome {
        let pending = {
            let mut state = self.inner.lock();
            let pending = state.pending.take();
            if pending.is_some() {
                state.running = true;
            }
            pending
        };
        let Some(mut pending) = pending else {
            return RunOutcome::Idle;
        };

        match run_guarded(&mut pending.loadable) {
            Ok(()) => {
                pending
                    .callback
                    .on_load_completed(pending.loadable, pending.started.elapsed());
                self.inner.lock().running = false;
                RunOutcome::Completed
            }
            Err(error) => {
                let action = pending
                    .callback
                    .on_load_error(&pending.loadable, pending.started.elapsed(), &error);
                let mut state = self.inner.lock();
                state.running = false;
                if state.retry.record_failure(action, error) && !state.released {
                    state.pending = Some(pending);
                }
                RunOutcome::Failed(action)
            }
        }
    }

    /// Run attempts until one completes or the loader stops retrying
    pub fn run_until_idle(&self, max_attempts: usize) -> RunOutcome {
        let mut outcome = RunOutcome::Idle;
        for _ in 0..max_attempts {
            match self.run_next() {
                RunOutcome::Idle => break,
                other => outcome = other,
            }
        }
        outcome
    }
}

impl<T: Loadable> Loader<T> for ManualLoader<T> {
    fn start_loading(&mut self, loadable: T, callback: Arc<dyn LoaderCallback<T>>, min_retry_count: u32) {
        let mut state = self.inner.lock();
        assert!(!state.released, "start_loading on a released loader");
        assert!(
            state.pending.is_none() && !state.running,
            "start_loading while a load is in flight"
        );
        state.retry.begin(min_retry_count);
        state.submissions += 1;
        state.pending = Some(Pending {
            loadable,
            callback,
            started: Instant::now(),
        });
    }

    fn is_loading(&self) -> bool {
        let state = self.inner.lock();
        state.pending.is_some() || state.running
    }

    fn maybe_throw_error(&self) -> Result<(), LoadError> {
        self.inner.lock().retry.check()
    }

    fn release(&mut self) {
        let pending = {
            let mut state = self.inner.lock();
            state.released = true;
            state.pending.take()
        };
        if let Some(pending) = pending {
            pending.loadable.cancel_load();
            pending
                .callback
                .on_load_canceled(pending.loadable, pending.started.elapsed(), true);
        }
    }
}

/// Hands out `ManualLoader`s and remembers them for the test
pub struct ManualLoaderFactory<T> {
    loaders: Arc<Mutex<Vec<ManualLoader<T>>>>,
}

impl<T> Clone for ManualLoaderFactory<T> {
    fn clone(&self) -> Self {
        Self {
            loaders: self.loaders.clone(),
        }
    }
}

impl<T: Loadable> Default for ManualLoaderFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Loadable> ManualLoaderFactory<T> {
    pub fn new() -> Self {
        Self {
            loaders: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Most recently created loader. Panics if none was created.
    pub fn loader(&self) -> ManualLoader<T> {
        match self.loaders.lock().last() {
            Some(loader) => loader.clone(),
            None => panic!("no loader created yet"),
        }
    }

    pub fn created(&self) -> usize {
        self.loaders.lock().len()
    }
}

impl<T: Loadable> LoaderFactory<T> for ManualLoaderFactory<T> {
    fn create_loader(&self, _name: &str) -> Box<dyn Loader<T>> {
        let loader = ManualLoader::new();
        self.loaders.lock().push(loader.clone());
        Box::new(loader)
    }
}

// ============================================================================
// Flaky Data Source
// ============================================================================

/// Accessor factory whose sources fail to open until the failure budget is spent
#[derive(Clone)]
pub struct FlakyDataSourceFactory {
    data: Bytes,
    failures_left: Arc<AtomicU32>,
    opens: Arc<AtomicU32>,
}

impl FlakyDataSourceFactory {
    pub fn new(data: impl Into<Bytes>, failures: u32) -> Self {
        Self {
            data: data.into(),
            failures_left: Arc::new(AtomicU32::new(failures)),
            opens: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Total open attempts across all created sources
    pub fn opens(&self) -> u32 {
        self.opens.load(Ordering::SeqCst)
    }
}

impl DataSourceFactory for FlakyDataSourceFactory {
    fn create_data_source(&self) -> Box<dyn DataSource> {
        Box::new(FlakyDataSource {
            inner: ByteArrayDataSource::new(self.data.clone()),
            factory: self.clone(),
        })
    }
}

struct FlakyDataSource {
    inner: ByteArrayDataSource,
    factory: FlakyDataSourceFactory,
}

impl DataSource for FlakyDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError> {
        self.factory.opens.fetch_add(1, Ordering::SeqCst);
        let failed = self
            .factory
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failed {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused").into());
        }
        self.inner.open(spec)
    }

    fn read(&mut self, buffer: &mut [u8], offset: usize, length: usize) -> Result<ReadOutcome, DataSourceError> {
        self.inner.read(buffer, offset, length)
    }

    fn close(&mut self) -> Result<(), DataSourceError> {
        self.inner.close()
    }

    fn uri(&self) -> Option<&url::Url> {
        self.inner.uri()
    }
}
