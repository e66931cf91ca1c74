use std::collections::VecDeque;

use async_trait::async_trait;
use ferry_core::{DataAddress, StreamResult};

use crate::error::PipelineError;
use crate::part::DataPart;

/// A lazy, finite sequence of [`DataPart`]s.
///
/// Parts are produced one at a time so large sources are never held in
/// memory as a whole. `Ok(None)` ends the sequence.
#[async_trait]
pub trait DataSource: Send {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>>;
}

/// Creates [`DataSource`]s for one address type.
#[async_trait]
pub trait DataSourceFactory: Send + Sync {
    /// Address type this factory handles (e.g. `"File"`).
    fn supported_type(&self) -> &str;

    /// Fail fast on an address the factory could never read.
    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError>;

    async fn create_source(&self, address: &DataAddress) -> StreamResult<Box<dyn DataSource>>;
}

/// A source over parts that are already materialized.
#[derive(Debug, Default)]
pub struct PartsSource {
    parts: VecDeque<DataPart>,
}

impl PartsSource {
    pub fn new(parts: impl IntoIterator<Item = DataPart>) -> Self {
        PartsSource {
            parts: parts.into_iter().collect(),
        }
    }
}

#[async_trait]
impl DataSource for PartsSource {
    async fn next_part(&mut self) -> StreamResult<Option<DataPart>> {
        Ok(self.parts.pop_front())
    }
}

/// Shorthand used by factories to turn a missing property into a
/// validation error.
pub(crate) fn required<'a>(address: &'a DataAddress, key: &str) -> Result<&'a str, PipelineError> {
    address
        .required_property(key)
        .map_err(PipelineError::InvalidAddress)
}
