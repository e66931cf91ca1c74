//! In-process named buckets.
//!
//! Address type `Memory`, properties `bucket` (required) and `name`
//! (optional, restricts a source to one object). Used by the one-shot CLI
//! transfer and by tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use ferry_core::address::BUCKET;
use ferry_core::{DataAddress, StreamFailure, StreamResult};

use crate::error::PipelineError;
use crate::part::DataPart;
use crate::sink::{DataSink, DataSinkFactory};
use crate::source::{required, DataSource, DataSourceFactory, PartsSource};

pub const MEMORY_TYPE: &str = "Memory";

/// Property selecting a single object of a bucket.
pub const NAME: &str = "name";

type Buckets = HashMap<String, BTreeMap<String, Vec<u8>>>;

/// Shared handle to the buckets. Clones see the same data.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    buckets: Arc<Mutex<Buckets>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Buckets> {
        self.buckets.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn put(&self, bucket: &str, name: &str, bytes: impl Into<Vec<u8>>) {
        self.lock()
            .entry(bucket.to_string())
            .or_default()
            .insert(name.to_string(), bytes.into());
    }

    pub fn get(&self, bucket: &str, name: &str) -> Option<Vec<u8>> {
        self.lock().get(bucket)?.get(name).cloned()
    }

    /// Every object of `bucket`, ordered by name.
    pub fn objects(&self, bucket: &str) -> Option<BTreeMap<String, Vec<u8>>> {
        self.lock().get(bucket).cloned()
    }
}

// ── Source ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemorySourceFactory {
    store: MemoryStore,
}

impl MemorySourceFactory {
    pub fn new(store: MemoryStore) -> Self {
        MemorySourceFactory { store }
    }
}

#[async_trait]
impl DataSourceFactory for MemorySourceFactory {
    fn supported_type(&self) -> &str {
        MEMORY_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        required(address, BUCKET).map(|_| ())
    }

    async fn create_source(&self, address: &DataAddress) -> StreamResult<Box<dyn DataSource>> {
        let bucket = address
            .required_property(BUCKET)
            .map_err(StreamFailure::fatal)?;
        let objects = self
            .store
            .objects(bucket)
            .ok_or_else(|| StreamFailure::not_found(format!("bucket '{bucket}' does not exist")))?;

        let parts: Vec<DataPart> = match address.property(NAME) {
            Some(name) => {
                let bytes = objects.get(name).cloned().ok_or_else(|| {
                    StreamFailure::not_found(format!("object '{name}' not found in '{bucket}'"))
                })?;
                vec![DataPart::from_bytes(name, bytes)]
            }
            None => objects
                .into_iter()
                .map(|(name, bytes)| DataPart::from_bytes(name, bytes))
                .collect(),
        };
        Ok(Box::new(PartsSource::new(parts)))
    }
}

// ── Sink ──────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct MemorySinkFactory {
    store: MemoryStore,
}

impl MemorySinkFactory {
    pub fn new(store: MemoryStore) -> Self {
        MemorySinkFactory { store }
    }
}

#[async_trait]
impl DataSinkFactory for MemorySinkFactory {
    fn supported_type(&self) -> &str {
        MEMORY_TYPE
    }

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError> {
        required(address, BUCKET).map(|_| ())
    }

    async fn create_sink(&self, address: &DataAddress) -> StreamResult<Arc<dyn DataSink>> {
        let bucket = address
            .required_property(BUCKET)
            .map_err(StreamFailure::fatal)?;
        Ok(Arc::new(MemorySink {
            store: self.store.clone(),
            bucket: bucket.to_string(),
        }))
    }
}

struct MemorySink {
    store: MemoryStore,
    bucket: String,
}

#[async_trait]
impl DataSink for MemorySink {
    async fn write_part(&self, mut part: DataPart) -> StreamResult<u64> {
        let name = part.name.clone();
        let bytes = part
            .read_all()
            .await
            .map_err(|e| StreamFailure::from_io(&format!("reading part '{name}'"), &e))?;
        let len = bytes.len() as u64;
        self.store.put(&self.bucket, &name, bytes);
        Ok(len)
    }
}
