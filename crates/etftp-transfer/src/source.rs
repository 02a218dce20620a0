//! Where the server gets the bytes for a requested identifier.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;

/// Recently fetched payloads kept by default.
pub const DEFAULT_CACHE_CAPACITY: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    Unavailable(String),
}

/// Resolves a request identifier (a filename or URL) to a payload.
/// Called from session threads, so implementations must be shareable.
pub trait PayloadSource: Send + Sync {
    fn fetch(&self, identifier: &str) -> Result<Vec<u8>, SourceError>;
}

impl<F> PayloadSource for F
where
    F: Fn(&str) -> Result<Vec<u8>, SourceError> + Send + Sync,
{
    fn fetch(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        self(identifier)
    }
}

/// Fixed set of named payloads.
#[derive(Debug, Clone, Default)]
pub struct MemorySource {
    files: HashMap<String, Arc<Vec<u8>>>,
}

impl MemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_file(mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
        self.insert(name, data);
        self
    }

    pub fn insert(&mut self, name: impl Into<String>, data: impl Into<Vec<u8>>) {
        self.files.insert(name.into(), Arc::new(data.into()));
    }
}

impl PayloadSource for MemorySource {
    fn fetch(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        self.files
            .get(identifier)
            .map(|data| data.as_ref().clone())
            .ok_or_else(|| SourceError::NotFound(format!("{identifier} not found")))
    }
}

/// Keeps the most recent successful fetches. Empty payloads count as not
/// found and are never cached.
pub struct CachedSource<S> {
    inner: S,
    capacity: usize,
    entries: Mutex<VecDeque<(String, Arc<Vec<u8>>)>>,
}

impl<S: PayloadSource> CachedSource<S> {
    pub fn new(inner: S, capacity: usize) -> Self {
        CachedSource {
            inner,
            capacity,
            entries: Mutex::new(VecDeque::with_capacity(capacity)),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lookup(&self, identifier: &str) -> Option<Arc<Vec<u8>>> {
        let mut entries = self.entries.lock();
        let index = entries.iter().position(|(name, _)| name == identifier)?;
        // Move to the back so it is evicted last.
        let entry = entries.remove(index)?;
        let data = entry.1.clone();
        entries.push_back(entry);
        Some(data)
    }
}

impl<S: PayloadSource> PayloadSource for CachedSource<S> {
    fn fetch(&self, identifier: &str) -> Result<Vec<u8>, SourceError> {
        if let Some(data) = self.lookup(identifier) {
            tracing::debug!(identifier, bytes = data.len(), "payload cache hit");
            return Ok(data.as_ref().clone());
        }

        // Fetch outside the lock; concurrent misses for the same name both go
        // to the inner source.
        let data = self.inner.fetch(identifier)?;
        if data.is_empty() {
            return Err(SourceError::NotFound(format!("{identifier} is empty")));
        }
        if self.capacity == 0 {
            return Ok(data);
        }

        let shared = Arc::new(data);
        let mut entries = self.entries.lock();
        entries.retain(|(name, _)| name != identifier);
        while entries.len() >= self.capacity {
            entries.pop_front();
        }
        entries.push_back((identifier.to_string(), shared.clone()));
        drop(entries);

        Ok(shared.as_ref().clone())
    }
}
