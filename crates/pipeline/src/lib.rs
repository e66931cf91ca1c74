//! ferry-pipeline: moving bytes from a source to a sink.
//!
//! A transfer reads a finite sequence of named [`DataPart`]s from a
//! [`DataSource`] and writes each of them to a [`DataSink`]. Sources and sinks
//! are created by factories keyed by address type and registered with a
//! [`PipelineService`], which runs transfers on a bounded pool and can cancel
//! them by flow id.
//!
//! The scheduler does not talk to the pipeline directly: it resolves a
//! [`TransferService`] from a [`TransferServiceRegistry`]. `PipelineService`
//! is the built-in implementation.

pub mod error;
pub mod file;
pub mod http;
pub mod memory;
pub mod part;
pub mod pipeline;
pub mod sink;
pub mod source;
pub mod transfer;

pub use error::PipelineError;
pub use part::DataPart;
pub use pipeline::PipelineService;
pub use sink::{DataSink, DataSinkFactory};
pub use source::{DataSource, DataSourceFactory};
pub use transfer::{
    FirstMatch, TransferService, TransferServiceRegistry, TransferServiceSelectionStrategy,
    TransferSummary,
};
