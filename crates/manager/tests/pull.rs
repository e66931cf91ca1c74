mod common;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use common::*;
use ed25519_dalek::SigningKey;
use ferry_core::address::{AUTHORIZATION, ENDPOINT};
use ferry_core::{DataFlowStartMessage, DataFlowState, FlowType, TransferType};
use ferry_manager::auth::keys::generate_signing_key;
use ferry_manager::auth::FLOW_ID;
use ferry_manager::{
    AuthorizationError, AuthorizationService, DataFlowManager, Endpoint, PublicEndpointGenerator,
    TransferProcessEvent,
};

const HTTP_DATA: &str = "HttpData";

fn pull_message(id: &str) -> DataFlowStartMessage {
    DataFlowStartMessage {
        flow_id: Some(id.to_string()),
        process_id: format!("process-{id}"),
        agreement_id: None,
        asset_id: None,
        transfer_type: TransferType::new(HTTP_DATA, FlowType::Pull),
        source: memory("in"),
        destination: None,
        callback_address: None,
        properties: BTreeMap::new(),
        trace_context: BTreeMap::new(),
    }
}

fn pull_manager(cluster: &Cluster, client: Arc<RecordingClient>) -> DataFlowManager {
    pull_manager_with_key(cluster, "runtime-a", generate_signing_key(), client)
}

fn pull_manager_with_key(
    cluster: &Cluster,
    runtime_id: &str,
    key: SigningKey,
    client: Arc<RecordingClient>,
) -> DataFlowManager {
    let mut endpoints = PublicEndpointGenerator::new();
    endpoints.add_generator_function(HTTP_DATA, |_source| {
        Endpoint::new("http://localhost:8186/public", HTTP_DATA)
    });
    let authorization = AuthorizationService::new(
        key,
        endpoints,
        cluster.store.clone(),
        cluster.clock.clone(),
        Duration::from_secs(600),
    );
    cluster
        .builder(runtime_id, client)
        .authorization(Arc::new(authorization))
        .build()
}

#[tokio::test]
async fn pull_flow_issues_a_token_until_completed() {
    let cluster = Cluster::new();
    let client = RecordingClient::new();
    let manager = pull_manager(&cluster, client.clone());

    manager.start_flow(pull_message("f1")).await.unwrap();
    let started = settle(&manager, "f1", DataFlowState::Started).await;
    assert!(started.lease.is_none(), "PULL flows are not held while started");
    assert_eq!(client.events_for("f1"), vec![TransferProcessEvent::Started]);

    let edr = client.last_data_address("f1").unwrap();
    assert_eq!(Some(&edr), started.endpoint_data_reference.as_ref());
    assert_eq!(edr.address_type, HTTP_DATA);
    assert_eq!(edr.property(ENDPOINT), Some("http://localhost:8186/public"));
    assert_eq!(edr.property(FLOW_ID), Some("f1"));

    let auth = manager.authorization().unwrap();
    let token = edr.property(AUTHORIZATION).unwrap();
    let access = auth.authorize(token).await.unwrap();
    assert_eq!(access.flow_id, "f1");
    assert_eq!(access.source, memory("in"));

    // Nothing for the scheduler to do while the consumer pulls.
    assert_eq!(manager.tick().await.unwrap(), 0);

    let done = manager.complete("f1").await.unwrap();
    assert_eq!(done.state, DataFlowState::Completed);
    assert!(matches!(
        auth.authorize(token).await,
        Err(AuthorizationError::Revoked { .. })
    ));
    assert_eq!(
        client.events_for("f1"),
        vec![TransferProcessEvent::Started, TransferProcessEvent::Completed]
    );
}

#[tokio::test]
async fn suspend_revokes_and_resume_reissues() {
    let cluster = Cluster::new();
    let client = RecordingClient::new();
    let manager = pull_manager(&cluster, client.clone());

    manager.start_flow(pull_message("f1")).await.unwrap();
    settle(&manager, "f1", DataFlowState::Started).await;
    let first = client.last_data_address("f1").unwrap();
    let first_token = first.property(AUTHORIZATION).unwrap().to_string();

    let suspended = manager
        .suspend("f1", Some("consumer paused".to_string()))
        .await
        .unwrap();
    assert_eq!(suspended.state, DataFlowState::Suspended);
    assert!(suspended.endpoint_data_reference.is_none());
    let auth = manager.authorization().unwrap();
    assert!(matches!(
        auth.authorize(&first_token).await,
        Err(AuthorizationError::Revoked { .. })
    ));

    let resumed = manager.start_flow(pull_message("f1")).await.unwrap();
    assert_eq!(resumed.state, DataFlowState::Started);
    let second = resumed.endpoint_data_reference.unwrap();
    let second_token = second.property(AUTHORIZATION).unwrap();
    assert_ne!(second_token, first_token);
    assert!(auth.authorize(second_token).await.is_ok());

    cluster.advance(600_000);
    assert!(matches!(
        auth.authorize(second_token).await,
        Err(AuthorizationError::Expired { .. })
    ));
}

#[tokio::test]
async fn pull_without_authorization_is_a_configuration_error() {
    let cluster = Cluster::new();
    let client = RecordingClient::new();
    let manager = cluster.manager("runtime-a", client.clone());

    manager.start_flow(pull_message("f1")).await.unwrap();
    let flow = settle(&manager, "f1", DataFlowState::Terminated).await;
    assert!(flow.error_detail.unwrap().contains("configuration error"));
    assert_eq!(client.events_for("f1"), vec![TransferProcessEvent::Failed]);
}

#[tokio::test]
async fn token_issued_by_one_runtime_is_served_by_another() {
    let cluster = Cluster::new();
    let key = generate_signing_key();
    let client = RecordingClient::new();
    let a = pull_manager_with_key(&cluster, "runtime-a", key.clone(), client.clone());
    let b = pull_manager_with_key(&cluster, "runtime-b", key, RecordingClient::new());

    a.start_flow(pull_message("f1")).await.unwrap();
    let started = settle(&a, "f1", DataFlowState::Started).await;
    let token = started
        .endpoint_data_reference
        .as_ref()
        .and_then(|edr| edr.property(AUTHORIZATION))
        .unwrap()
        .to_string();

    let auth_b = b.authorization().unwrap();
    assert!(auth_b.tokens().is_empty());
    let access = auth_b.authorize(&token).await.unwrap();
    assert_eq!(access.flow_id, "f1");
    assert_eq!(access.source, memory("in"));

    // Completion on A ends access through B as well.
    a.complete("f1").await.unwrap();
    assert!(matches!(
        auth_b.authorize(&token).await,
        Err(AuthorizationError::Revoked { .. })
    ));
}

#[tokio::test]
async fn expired_tokens_are_purged_by_the_scheduler() {
    let cluster = Cluster::new();
    let client = RecordingClient::new();
    let manager = pull_manager(&cluster, client.clone());

    manager.start_flow(pull_message("f1")).await.unwrap();
    settle(&manager, "f1", DataFlowState::Started).await;
    let auth = manager.authorization().unwrap();
    assert_eq!(auth.tokens().len(), 1);

    manager.tick().await.unwrap();
    assert_eq!(auth.tokens().len(), 1);

    cluster.advance(600_001);
    manager.tick().await.unwrap();
    assert!(auth.tokens().is_empty());
}
