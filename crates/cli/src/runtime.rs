//! Wiring of a data plane runtime from a [`FerryConfig`].

use std::sync::Arc;
use std::time::Duration;

use ferry_core::{FerryConfig, SystemClock};
use ferry_manager::auth::keys;
use ferry_manager::provision::staging::{StagingDirectoryGenerator, StagingDirectoryProvisioner};
use ferry_manager::{
    AuthorizationService, DataFlowManager, Endpoint, HttpControlPlaneClient, ManagerSettings,
    PublicEndpointGenerator,
};
use ferry_pipeline::http::HTTP_DATA_TYPE;
use ferry_pipeline::memory::MemoryStore;
use ferry_pipeline::PipelineService;
use ferry_storage::InMemoryDataFlowStore;
use tracing::{info, warn};

/// Everything a running data plane needs: the scheduler plus the pipeline
/// the public endpoint reads from.
pub(crate) struct Runtime {
    pub(crate) manager: DataFlowManager,
    pub(crate) pipeline: Arc<PipelineService>,
}

pub(crate) fn build(config: &FerryConfig) -> Result<Runtime, String> {
    let store = Arc::new(InMemoryDataFlowStore::with_lease_config(config.lease));
    let pipeline = Arc::new(PipelineService::with_defaults(
        config.transfer.threads,
        config.transfer.sink_parallelism,
        MemoryStore::new(),
    ));

    let signing_key = match &config.public.signing_key_path {
        Some(path) => keys::read_signing_key(path).map_err(|e| e.to_string())?,
        None => {
            warn!("no signing key configured, tokens will not survive a restart");
            keys::generate_signing_key()
        }
    };
    info!(
        fingerprint = %keys::key_fingerprint(&signing_key.verifying_key()),
        "token signing key loaded"
    );

    let mut endpoints = PublicEndpointGenerator::new();
    let base_url = config.public.base_url.clone();
    endpoints.add_generator_function(HTTP_DATA_TYPE, move |_source| {
        Endpoint::new(base_url.clone(), HTTP_DATA_TYPE)
    });
    let authorization = AuthorizationService::new(
        signing_key,
        endpoints,
        store.clone(),
        Arc::new(SystemClock),
        Duration::from_secs(config.public.token_ttl_secs),
    );

    let client = HttpControlPlaneClient::new(
        config.retry.backoff(),
        config.retry.send_retry_limit.saturating_add(1),
    );

    let mut builder = DataFlowManager::builder(ManagerSettings::from_config(config), store)
        .transfer_service(pipeline.clone())
        .authorization(Arc::new(authorization))
        .client(Arc::new(client));
    if let Some(root) = &config.provisioning.staging_root {
        info!(root = %root.display(), "staging directories enabled");
        builder = builder
            .consumer_generator(Arc::new(StagingDirectoryGenerator))
            .provisioner(Arc::new(StagingDirectoryProvisioner::new(root.clone())));
    }

    Ok(Runtime {
        manager: builder.build(),
        pipeline,
    })
}
