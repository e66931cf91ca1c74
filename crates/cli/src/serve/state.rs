//! Application state shared across request handlers.

use std::sync::Arc;

use ferry_manager::DataFlowManager;
use ferry_pipeline::PipelineService;

pub(crate) struct AppState {
    pub(crate) manager: DataFlowManager,
    /// Opens sources for the public PULL endpoint.
    pub(crate) pipeline: Arc<PipelineService>,
    /// Compiled JSON Schema for `POST /v1/dataflows` bodies.
    pub(crate) start_schema: jsonschema::Validator,
}
