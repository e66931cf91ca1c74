use std::sync::Arc;

use async_trait::async_trait;
use ferry_core::{DataAddress, StreamFailure, StreamResult};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::PipelineError;
use crate::part::DataPart;
use crate::source::DataSource;
use crate::transfer::TransferSummary;

/// Writes [`DataPart`]s to a destination.
///
/// `write_part` may be called concurrently for different parts of the same
/// transfer; implementations must tolerate that.
#[async_trait]
pub trait DataSink: Send + Sync {
    /// Write one part, returning the number of bytes written.
    async fn write_part(&self, part: DataPart) -> StreamResult<u64>;

    /// Called once after every part was written.
    async fn complete(&self) -> StreamResult<()> {
        Ok(())
    }
}

/// Creates [`DataSink`]s for one address type.
#[async_trait]
pub trait DataSinkFactory: Send + Sync {
    fn supported_type(&self) -> &str;

    fn validate(&self, address: &DataAddress) -> Result<(), PipelineError>;

    async fn create_sink(&self, address: &DataAddress) -> StreamResult<Arc<dyn DataSink>>;
}

/// Drain `source` into `sink`, keeping at most `parallelism` writes in
/// flight.
///
/// The first failing read or write aborts the remaining writes. Cancelling
/// `cancel` aborts everything and yields a `CANCELLED` failure.
pub async fn transfer_parts(
    source: &mut dyn DataSource,
    sink: Arc<dyn DataSink>,
    parallelism: usize,
    cancel: &CancellationToken,
) -> StreamResult<TransferSummary> {
    let permits = Arc::new(Semaphore::new(parallelism.max(1)));
    let mut writes: JoinSet<StreamResult<u64>> = JoinSet::new();
    let mut summary = TransferSummary::default();

    loop {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            next = source.next_part() => next?,
        };
        let Some(part) = next else { break };

        let permit = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            permit = permits.clone().acquire_owned() => permit
                .map_err(|_| StreamFailure::fatal("sink write pool closed"))?,
        };
        debug!(part = %part.name, "writing part");
        let sink = sink.clone();
        writes.spawn(async move {
            let _permit = permit;
            sink.write_part(part).await
        });

        while let Some(done) = writes.try_join_next() {
            summary.record(joined(done)?);
        }
    }

    loop {
        let done = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled()),
            done = writes.join_next() => done,
        };
        match done {
            Some(done) => summary.record(joined(done)?),
            None => break,
        }
    }

    sink.complete().await?;
    Ok(summary)
}

fn joined(
    result: Result<StreamResult<u64>, tokio::task::JoinError>,
) -> StreamResult<u64> {
    result.map_err(|e| StreamFailure::fatal(format!("sink write task failed: {e}")))?
}

fn cancelled() -> StreamFailure {
    StreamFailure::cancelled("transfer cancelled")
}
