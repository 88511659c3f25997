//! Whole-resource fetch into a growable in-memory buffer.
//!
//! `SourceLoadable` is the unit of work handed to the load runner: one call
//! to `load` reads the entire resource at its locator into a
//! `GrowableLoadBuffer`, starting over from byte zero on every attempt.

use crate::data_source::{DataSource, DataSourceError, DataSpec, ReadOutcome};
use crate::loader::Loadable;

/// Initial allocation for sample data
pub const INITIAL_SAMPLE_SIZE: usize = 1;

// ============================================================================
// Loaded Sample
// ============================================================================

/// Result of a completed fetch
///
/// `data.len()` is the allocated capacity; only the first `size` bytes are
/// sample data.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadedSample {
    data: Vec<u8>,
    size: usize,
}

impl LoadedSample {
    /// Wrap `data` whose first `size` bytes are the sample. Panics if `size` exceeds `data`.
    pub fn new(data: Vec<u8>, size: usize) -> Self {
        assert!(size <= data.len(), "sample size exceeds buffer");
        Self { data, size }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// The sample bytes
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }
}

// ============================================================================
// Growable Load Buffer
// ============================================================================

/// Byte buffer that doubles its capacity whenever a read fills it
#[derive(Debug)]
pub struct GrowableLoadBuffer {
    data: Vec<u8>,
    size: usize,
}

impl Default for GrowableLoadBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl GrowableLoadBuffer {
    pub fn new() -> Self {
        Self::with_capacity(INITIAL_SAMPLE_SIZE)
    }

    /// Panics on zero capacity (doubling would never grow it).
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0, "initial capacity must be positive");
        Self {
            data: vec![0; capacity],
            size: 0,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size]
    }

    /// Read the whole resource described by `spec` from `source`
    ///
    /// Always starts from byte zero; data from an earlier attempt is
    /// overwritten. The source is closed on every exit path.
    pub fn fetch(&mut self, source: &mut dyn DataSource, spec: &DataSpec) -> Result<(), DataSourceError> {
        self.size = 0;

        let mut input = OpenedSource::open(source, spec)?;
        loop {
            if self.size == self.data.len() {
                let doubled = self.data.len() * 2;
                self.data.resize(doubled, 0);
            }
            let free = self.data.len() - self.size;
            match input.read(&mut self.data, self.size, free)? {
                ReadOutcome::Read(n) => self.size += n,
                ReadOutcome::EndOfInput => break,
            }
        }
        input.close()
    }

    pub fn into_sample(self) -> LoadedSample {
        LoadedSample {
            data: self.data,
            size: self.size,
        }
    }
}

/// Closes the wrapped source when dropped
struct OpenedSource<'a> {
    source: Option<&'a mut dyn DataSource>,
}

impl<'a> OpenedSource<'a> {
    fn open(source: &'a mut dyn DataSource, spec: &DataSpec) -> Result<Self, DataSourceError> {
        // Close even if open itself failed halfway.
        let mut guard = Self { source: Some(source) };
        if let Some(source) = guard.source.as_mut() {
            source.open(spec)?;
        }
        Ok(guard)
    }

    fn read(&mut self, buffer: &mut [u8], offset: usize, length: usize) -> Result<ReadOutcome, DataSourceError> {
        match self.source.as_mut() {
            Some(source) => source.read(buffer, offset, length),
            None => Err(DataSourceError::NotOpened),
        }
    }

    fn close(mut self) -> Result<(), DataSourceError> {
        match self.source.take() {
            Some(source) => source.close(),
            None => Ok(()),
        }
    }
}

impl Drop for OpenedSource<'_> {
    fn drop(&mut self) {
        if let Some(source) = self.source.take() {
            if let Err(e) = source.close() {
                tracing::debug!("close after failed fetch: {}", e);
            }
        }
    }
}

// ============================================================================
// Source Loadable
// ============================================================================

/// Fetches one locator into memory; submitted to the load runner
pub struct SourceLoadable {
    spec: DataSpec,
    data_source: Box<dyn DataSource>,
    buffer: GrowableLoadBuffer,
}

impl SourceLoadable {
    pub fn new(spec: DataSpec, data_source: Box<dyn DataSource>) -> Self {
        Self {
            spec,
            data_source,
            buffer: GrowableLoadBuffer::new(),
        }
    }

    pub fn spec(&self) -> &DataSpec {
        &self.spec
    }

    pub fn size(&self) -> usize {
        self.buffer.size()
    }

    pub fn into_sample(self) -> LoadedSample {
        self.buffer.into_sample()
    }
}

impl Loadable for SourceLoadable {
    fn cancel_load(&self) {
        // The fetch is never interrupted; the runner drops the result instead.
    }

    fn is_load_canceled(&self) -> bool {
        false
    }

    fn load(&mut self) -> Result<(), DataSourceError> {
        tracing::debug!("fetching {}", self.spec.uri);
        self.buffer.fetch(self.data_source.as_mut(), &self.spec)?;
        tracing::debug!("fetched {} bytes from {}", self.buffer.size(), self.spec.uri);
        Ok(())
    }
}
