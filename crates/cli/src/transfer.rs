//! `ferry transfer` -- one local PUSH transfer through the full state machine.

use std::path::Path;
use std::time::Duration;

use ferry_core::address::PATH;
use ferry_core::{
    DataAddress, DataFlow, DataFlowStartMessage, DataFlowState, FerryConfig, FlowType,
    TransferType,
};
use ferry_manager::provision::staging::STAGING_FLAG;
use ferry_pipeline::file::FILE_TYPE;

use crate::runtime;

/// Poll interval cap while waiting for retries to come due.
const MAX_IDLE: Duration = Duration::from_millis(200);

fn file_address(path: &Path) -> DataAddress {
    DataAddress::new(FILE_TYPE).with_property(PATH, path.to_string_lossy())
}

fn is_settled(flow: &DataFlow) -> bool {
    match flow.state {
        DataFlowState::Completed | DataFlowState::Terminated => !flow.has_provisioned_resources(),
        DataFlowState::Deprovisioned => true,
        _ => false,
    }
}

/// Copy `source` (a file or a directory of files) into the `destination`
/// directory and return the settled flow.
pub(crate) async fn run_transfer(
    config: &FerryConfig,
    source: &Path,
    destination: &Path,
    staging: bool,
) -> Result<DataFlow, String> {
    let mut destination = file_address(destination);
    if staging {
        destination = destination.with_property(STAGING_FLAG, "true");
    }
    let message = DataFlowStartMessage {
        flow_id: None,
        process_id: ferry_core::new_id(),
        agreement_id: None,
        asset_id: None,
        transfer_type: TransferType::new(FILE_TYPE, FlowType::Push),
        source: file_address(source),
        destination: Some(destination),
        callback_address: None,
        properties: Default::default(),
        trace_context: Default::default(),
    };

    let runtime = runtime::build(config)?;
    let manager = runtime.manager;
    let flow = manager
        .start_flow(message)
        .await
        .map_err(|e| e.to_string())?;

    let idle = config.state_machine.iteration_wait().min(MAX_IDLE);
    let settled = loop {
        let dispatched = manager.tick().await.map_err(|e| e.to_string())?;
        manager.drain().await;
        let current = manager.status(&flow.id).await.map_err(|e| e.to_string())?;
        if is_settled(&current) {
            break current;
        }
        if dispatched == 0 {
            tokio::time::sleep(idle).await;
        }
    };
    manager.shutdown().await.map_err(|e| e.to_string())?;
    Ok(settled)
}
