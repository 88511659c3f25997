//! Byte-Stream Accessors
//!
//! The open/read/close contract the sample loader pulls bytes through, plus
//! the accessors the player ships with:
//! - `file://` locators via `std::fs`
//! - `http(s)://` locators via `ureq`
//! - in-memory bytes (tests, embedded resources)

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum DataSourceError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("HTTP {status} fetching {url}")]
    Http { status: u16, url: String },
    #[error("Transport error: {0}")]
    Transport(String),
    #[error("Unsupported locator scheme: {0}")]
    UnsupportedScheme(String),
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),
    #[error("Data source is not open")]
    NotOpened,
}

// ============================================================================
// Contract
// ============================================================================

/// Describes the region of a resource to open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataSpec {
    pub uri: Url,
    /// Byte offset to start reading from
    pub position: u64,
    /// Number of bytes to read, or `None` to read to the end
    pub length: Option<u64>,
}

impl DataSpec {
    /// Whole resource at `uri`
    pub fn new(uri: Url) -> Self {
        Self {
            uri,
            position: 0,
            length: None,
        }
    }
}

/// Result of a single `DataSource::read`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadOutcome {
    /// Number of bytes written into the buffer (always > 0)
    Read(usize),
    /// The resource is exhausted
    EndOfInput,
}

/// Open/read/close access to a resource identified by a locator
pub trait DataSource: Send {
    /// Open the resource. Returns the resolved length if known.
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError>;

    /// Read up to `length` bytes into `buffer[offset..offset + length]`
    fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, DataSourceError>;

    /// Close the resource. Safe to call when not open.
    fn close(&mut self) -> Result<(), DataSourceError>;

    /// Locator of the currently open resource
    fn uri(&self) -> Option<&Url>;
}

/// Creates a fresh accessor per fetch attempt
pub trait DataSourceFactory: Send + Sync {
    fn create_data_source(&self) -> Box<dyn DataSource>;
}

fn read_into(
    reader: &mut dyn Read,
    buffer: &mut [u8],
    offset: usize,
    length: usize,
) -> Result<ReadOutcome, DataSourceError> {
    if length == 0 {
        return Ok(ReadOutcome::Read(0));
    }
    loop {
        match reader.read(&mut buffer[offset..offset + length]) {
            Ok(0) => return Ok(ReadOutcome::EndOfInput),
            Ok(n) => return Ok(ReadOutcome::Read(n)),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
}

// ============================================================================
// File Accessor
// ============================================================================

/// Reads `file://` locators from the local filesystem
#[derive(Default)]
pub struct FileDataSource {
    file: Option<io::Take<File>>,
    uri: Option<Url>,
}

impl FileDataSource {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DataSource for FileDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError> {
        let path = spec
            .uri
            .to_file_path()
            .map_err(|_| DataSourceError::InvalidLocator(spec.uri.to_string()))?;

        let mut file = File::open(&path)?;
        let total = file.metadata()?.len();
        file.seek(SeekFrom::Start(spec.position))?;

        let remaining = total.saturating_sub(spec.position);
        let length = spec.length.map_or(remaining, |l| l.min(remaining));

        self.file = Some(file.take(length));
        self.uri = Some(spec.uri.clone());
        Ok(Some(length))
    }

    fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, DataSourceError> {
        let file = self.file.as_mut().ok_or(DataSourceError::NotOpened)?;
        read_into(file, buffer, offset, length)
    }

    fn close(&mut self) -> Result<(), DataSourceError> {
        self.file = None;
        self.uri = None;
        Ok(())
    }

    fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }
}

// ============================================================================
// HTTP Accessor
// ============================================================================

/// Reads `http://` and `https://` locators with a blocking `ureq` request
pub struct HttpDataSource {
    agent: ureq::Agent,
    user_agent: String,
    reader: Option<Box<dyn Read + Send + Sync>>,
    uri: Option<Url>,
}

impl HttpDataSource {
    pub fn new(user_agent: &str, connect_timeout: Duration, read_timeout: Duration) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(connect_timeout)
            .timeout_read(read_timeout)
            .build();
        Self {
            agent,
            user_agent: user_agent.to_string(),
            reader: None,
            uri: None,
        }
    }
}

impl DataSource for HttpDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError> {
        // An empty range needs no request.
        if spec.length == Some(0) {
            self.reader = Some(Box::new(io::empty()));
            self.uri = Some(spec.uri.clone());
            return Ok(Some(0));
        }

        let mut request = self
            .agent
            .get(spec.uri.as_str())
            .set("User-Agent", &self.user_agent);

        if spec.position > 0 || spec.length.is_some() {
            let range = match spec.length {
                Some(length) => format!("bytes={}-{}", spec.position, spec.position.saturating_add(length - 1)),
                None => format!("bytes={}-", spec.position),
            };
            request = request.set("Range", &range);
        }

        let response = request.call().map_err(|e| match e {
            ureq::Error::Status(status, _) => DataSourceError::Http {
                status,
                url: spec.uri.to_string(),
            },
            ureq::Error::Transport(t) => DataSourceError::Transport(t.to_string()),
        })?;

        let length = response
            .header("Content-Length")
            .and_then(|v| v.parse::<u64>().ok());

        tracing::debug!("HTTP open {} (length={:?})", spec.uri, length);

        self.reader = Some(response.into_reader());
        self.uri = Some(spec.uri.clone());
        Ok(length)
    }

    fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, DataSourceError> {
        let reader = self.reader.as_mut().ok_or(DataSourceError::NotOpened)?;
        read_into(reader.as_mut(), buffer, offset, length)
    }

    fn close(&mut self) -> Result<(), DataSourceError> {
        self.reader = None;
        self.uri = None;
        Ok(())
    }

    fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }
}

// ============================================================================
// In-Memory Accessor
// ============================================================================

/// Serves a fixed byte array, optionally in small chunks
#[derive(Clone)]
pub struct ByteArrayDataSource {
    data: Bytes,
    max_chunk: usize,
    position: usize,
    end: usize,
    uri: Option<Url>,
}

impl ByteArrayDataSource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            max_chunk: usize::MAX,
            position: 0,
            end: 0,
            uri: None,
        }
    }

    /// Cap every read at `max_chunk` bytes. Panics on zero.
    pub fn with_max_chunk(mut self, max_chunk: usize) -> Self {
        assert!(max_chunk > 0, "chunk size must be positive");
        self.max_chunk = max_chunk;
        self
    }
}

impl DataSource for ByteArrayDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError> {
        let start = usize::try_from(spec.position)
            .map_err(|_| DataSourceError::InvalidLocator(spec.uri.to_string()))?;
        if start > self.data.len() {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "position beyond end of data").into());
        }
        let available = self.data.len() - start;
        let length = spec
            .length
            .map_or(available, |l| usize::try_from(l).unwrap_or(usize::MAX).min(available));

        self.position = start;
        self.end = start + length;
        self.uri = Some(spec.uri.clone());
        Ok(Some(length as u64))
    }

    fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, DataSourceError> {
        if self.uri.is_none() {
            return Err(DataSourceError::NotOpened);
        }
        if self.position == self.end {
            return Ok(ReadOutcome::EndOfInput);
        }
        let n = length.min(self.max_chunk).min(self.end - self.position);
        buffer[offset..offset + n].copy_from_slice(&self.data[self.position..self.position + n]);
        self.position += n;
        Ok(ReadOutcome::Read(n))
    }

    fn close(&mut self) -> Result<(), DataSourceError> {
        self.uri = None;
        Ok(())
    }

    fn uri(&self) -> Option<&Url> {
        self.uri.as_ref()
    }
}

/// Hands out clones of one in-memory accessor
pub struct ByteArrayDataSourceFactory {
    source: ByteArrayDataSource,
}

impl ByteArrayDataSourceFactory {
    pub fn new(source: ByteArrayDataSource) -> Self {
        Self { source }
    }
}

impl DataSourceFactory for ByteArrayDataSourceFactory {
    fn create_data_source(&self) -> Box<dyn DataSource> {
        Box::new(self.source.clone())
    }
}

// ============================================================================
// Scheme Dispatch
// ============================================================================

/// Routes each locator to the file or HTTP accessor by scheme
pub struct DefaultDataSource {
    user_agent: String,
    connect_timeout: Duration,
    read_timeout: Duration,
    inner: Option<Box<dyn DataSource>>,
}

impl DataSource for DefaultDataSource {
    fn open(&mut self, spec: &DataSpec) -> Result<Option<u64>, DataSourceError> {
        let mut inner: Box<dyn DataSource> = match spec.uri.scheme() {
            "file" => Box::new(FileDataSource::new()),
            "http" | "https" => Box::new(HttpDataSource::new(
                &self.user_agent,
                self.connect_timeout,
                self.read_timeout,
            )),
            other => return Err(DataSourceError::UnsupportedScheme(other.to_string())),
        };
        let length = inner.open(spec)?;
        self.inner = Some(inner);
        Ok(length)
    }

    fn read(
        &mut self,
        buffer: &mut [u8],
        offset: usize,
        length: usize,
    ) -> Result<ReadOutcome, DataSourceError> {
        match self.inner.as_mut() {
            Some(inner) => inner.read(buffer, offset, length),
            None => Err(DataSourceError::NotOpened),
        }
    }

    fn close(&mut self) -> Result<(), DataSourceError> {
        match self.inner.take() {
            Some(mut inner) => inner.close(),
            None => Ok(()),
        }
    }

    fn uri(&self) -> Option<&Url> {
        self.inner.as_ref().and_then(|inner| inner.uri())
    }
}

/// Factory for `DefaultDataSource`
#[derive(Debug, Clone)]
pub struct DefaultDataSourceFactory {
    pub user_agent: String,
    pub connect_timeout: Duration,
    pub read_timeout: Duration,
}

impl Default for DefaultDataSourceFactory {
    fn default() -> Self {
        Self {
            user_agent: format!("sidecar/{}", crate::VERSION),
            connect_timeout: Duration::from_secs(8),
            read_timeout: Duration::from_secs(8),
        }
    }
}

impl DataSourceFactory for DefaultDataSourceFactory {
    fn create_data_source(&self) -> Box<dyn DataSource> {
        Box::new(DefaultDataSource {
            user_agent: self.user_agent.clone(),
            connect_timeout: self.connect_timeout,
            read_timeout: self.read_timeout,
            inner: None,
        })
    }
}

impl<F: DataSourceFactory + ?Sized> DataSourceFactory for Arc<F> {
    fn create_data_source(&self) -> Box<dyn DataSource> {
        (**self).create_data_source()
    }
}

/// Parse a locator string; bare paths become `file://` URLs
pub fn parse_locator(locator: &str) -> Result<Url, DataSourceError> {
    match Url::parse(locator) {
        Ok(url) if url.scheme().len() > 1 => Ok(url),
        _ => {
            let path = std::path::Path::new(locator);
            let absolute = if path.is_absolute() {
                path.to_path_buf()
            } else {
                std::env::current_dir()?.join(path)
            };
            Url::from_file_path(&absolute)
                .map_err(|_| DataSourceError::InvalidLocator(locator.to_string()))
        }
    }
}
