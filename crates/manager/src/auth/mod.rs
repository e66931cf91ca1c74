//! Endpoint data references and bearer-token authorization for PULL flows.

pub mod keys;
pub mod token;

use std::sync::Arc;
use std::time::Duration;

use ed25519_dalek::SigningKey;
use ferry_core::address::{AUTHORIZATION, ENDPOINT};
use ferry_core::{Clock, DataAddress, DataFlow, DataFlowState, FlowError};
use ferry_storage::{DataFlowStore, StorageError};
use tracing::debug;

use crate::endpoint::PublicEndpointGenerator;

pub use token::{AccessTokenEntry, AccessTokenStore, TokenClaims};

/// Property carrying the flow id on an endpoint data reference.
pub const FLOW_ID: &str = "flowId";

#[derive(Debug, thiserror::Error)]
pub enum AuthorizationError {
    #[error("malformed token: {0}")]
    Malformed(String),

    #[error("token signature is invalid")]
    InvalidSignature,

    #[error("token was not issued by this data plane")]
    Unknown,

    #[error("token {token_id} expired")]
    Expired { token_id: String },

    #[error("token revoked: {reason}")]
    Revoked { reason: String },

    #[error("key error: {0}")]
    Key(String),

    #[error(transparent)]
    Store(#[from] StorageError),
}

/// What a valid token grants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizedAccess {
    pub flow_id: String,
    pub source: DataAddress,
}

/// Mints and checks the tokens embedded in endpoint data references.
///
/// A token is honoured by every runtime that shares the signing key and the
/// flow store: the flow record decides whether it is still live. The local
/// [`AccessTokenStore`] only remembers why this runtime revoked a token.
pub struct AuthorizationService {
    signing_key: SigningKey,
    endpoints: PublicEndpointGenerator,
    store: Arc<dyn DataFlowStore>,
    tokens: AccessTokenStore,
    clock: Arc<dyn Clock>,
    token_ttl: Duration,
}

impl AuthorizationService {
    pub fn new(
        signing_key: SigningKey,
        endpoints: PublicEndpointGenerator,
        store: Arc<dyn DataFlowStore>,
        clock: Arc<dyn Clock>,
        token_ttl: Duration,
    ) -> Self {
        AuthorizationService {
            signing_key,
            endpoints,
            store,
            tokens: AccessTokenStore::new(),
            clock,
            token_ttl,
        }
    }

    pub fn endpoints(&self) -> &PublicEndpointGenerator {
        &self.endpoints
    }

    pub fn tokens(&self) -> &AccessTokenStore {
        &self.tokens
    }

    /// Build the address handed to the consumer: an endpoint plus a fresh
    /// token bound to `flow`.
    pub fn create_endpoint_data_reference(&self, flow: &DataFlow) -> Result<DataAddress, FlowError> {
        let endpoint = self
            .endpoints
            .generate_for(&flow.transfer_type.destination_type, &flow.source)?;

        let now = self.clock.now_millis();
        let claims = TokenClaims {
            token_id: ferry_core::new_id(),
            flow_id: flow.id.clone(),
            process_id: flow.process_id.clone(),
            issued_at: now,
            expires_at: now.saturating_add(self.token_ttl.as_millis() as i64),
        };
        let token = token::sign(&claims, &self.signing_key)
            .map_err(|e| FlowError::Configuration(e.to_string()))?;
        self.tokens.insert(
            &token,
            AccessTokenEntry {
                token_id: claims.token_id.clone(),
                flow_id: flow.id.clone(),
                expires_at: claims.expires_at,
                revoked: None,
            },
        );
        debug!(flow_id = %flow.id, token_id = %claims.token_id, "issued access token");

        Ok(DataAddress::new(endpoint.endpoint_type)
            .with_property(ENDPOINT, endpoint.endpoint)
            .with_property(AUTHORIZATION, token)
            .with_property(FLOW_ID, flow.id.clone()))
    }

    /// Check signature, local revocation and expiry, then the flow record:
    /// the flow must be STARTED and its endpoint data reference must still
    /// carry this token.
    pub async fn authorize(&self, token: &str) -> Result<AuthorizedAccess, AuthorizationError> {
        let claims = token::verify(token, &self.signing_key.verifying_key())?;
        if let Some(reason) = self.tokens.get(token).and_then(|entry| entry.revoked) {
            return Err(AuthorizationError::Revoked { reason });
        }
        if self.clock.now_millis() >= claims.expires_at {
            return Err(AuthorizationError::Expired {
                token_id: claims.token_id,
            });
        }

        let flow = self
            .store
            .find_by_id(&claims.flow_id)
            .await?
            .ok_or(AuthorizationError::Unknown)?;
        if flow.state != DataFlowState::Started {
            return Err(AuthorizationError::Revoked {
                reason: format!("flow is {}", flow.state),
            });
        }
        let current = flow
            .endpoint_data_reference
            .as_ref()
            .and_then(|edr| edr.property(AUTHORIZATION));
        if current != Some(token) {
            return Err(AuthorizationError::Revoked {
                reason: "superseded by a newer token".to_string(),
            });
        }
        Ok(AuthorizedAccess {
            flow_id: flow.id,
            source: flow.source,
        })
    }

    /// Forget tokens whose expiry has passed. Returns how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let purged = self.tokens.purge_expired(self.clock.now_millis());
        if purged > 0 {
            debug!(purged, "purged expired access tokens");
        }
        purged
    }

    /// Revoke every token issued for `flow_id`.
    pub fn revoke(&self, flow_id: &str, reason: &str) -> usize {
        let revoked = self.tokens.revoke_flow(flow_id, reason);
        if revoked > 0 {
            debug!(flow_id, revoked, reason, "revoked access tokens");
        }
        revoked
    }
}

impl std::fmt::Debug for AuthorizationService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthorizationService")
            .field("endpoints", &self.endpoints)
            .field("token_ttl", &self.token_ttl)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::endpoint::Endpoint;
    use ferry_core::config::LeaseConfig;
    use ferry_core::{DataFlowStartMessage, FlowType, ManualClock, TransferType};
    use ferry_storage::InMemoryDataFlowStore;
    use std::collections::BTreeMap;

    fn pull_flow(id: &str) -> DataFlow {
        DataFlow::from_start_message(
            id.into(),
            DataFlowStartMessage {
                flow_id: None,
                process_id: format!("process-{id}"),
                agreement_id: None,
                asset_id: None,
                source: DataAddress::new("Memory").with_property("bucket", "in"),
                destination: None,
                transfer_type: TransferType::new("HttpData", FlowType::Pull),
                callback_address: None,
                properties: BTreeMap::new(),
                trace_context: BTreeMap::new(),
            },
            0,
        )
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        store: Arc<InMemoryDataFlowStore>,
        auth: AuthorizationService,
    }

    fn fixture() -> Fixture {
        let clock = Arc::new(ManualClock::new(1_000));
        let store = Arc::new(InMemoryDataFlowStore::new(clock.clone(), LeaseConfig::default()));
        let auth = service(generate_key(), store.clone(), clock.clone());
        Fixture { clock, store, auth }
    }

    fn generate_key() -> SigningKey {
        keys::generate_signing_key()
    }

    fn service(
        key: SigningKey,
        store: Arc<InMemoryDataFlowStore>,
        clock: Arc<ManualClock>,
    ) -> AuthorizationService {
        let mut endpoints = PublicEndpointGenerator::new();
        endpoints.add_generator_function("HttpData", |_| {
            Endpoint::new("http://localhost:8181/public", "HttpData")
        });
        AuthorizationService::new(key, endpoints, store, clock, Duration::from_secs(60))
    }

    /// Issue a reference for `id` and persist the flow as STARTED with it.
    async fn issue(fx: &Fixture, id: &str) -> (DataFlow, String) {
        let mut flow = pull_flow(id);
        let edr = fx.auth.create_endpoint_data_reference(&flow).unwrap();
        let token = edr.property(AUTHORIZATION).unwrap().to_string();
        flow.state = DataFlowState::Started;
        flow.endpoint_data_reference = Some(edr);
        let flow = fx.store.create(flow).await.unwrap();
        (flow, token)
    }

    #[tokio::test]
    async fn issued_token_authorizes_the_flow_source() {
        let fx = fixture();
        let (flow, token) = issue(&fx, "f1").await;
        let edr = flow.endpoint_data_reference.as_ref().unwrap();
        assert_eq!(edr.address_type, "HttpData");
        assert_eq!(edr.property(ENDPOINT), Some("http://localhost:8181/public"));
        assert_eq!(edr.property(FLOW_ID), Some("f1"));

        let access = fx.auth.authorize(&token).await.unwrap();
        assert_eq!(access.flow_id, "f1");
        assert_eq!(access.source, flow.source);
        assert_eq!(fx.auth.tokens().len(), 1);
    }

    #[tokio::test]
    async fn another_runtime_with_the_same_key_honours_the_token() {
        let fx = fixture();
        let key = fx.auth.signing_key.clone();
        let (_, token) = issue(&fx, "f1").await;

        let other = service(key, fx.store.clone(), fx.clock.clone());
        assert!(other.tokens().is_empty());
        assert_eq!(other.authorize(&token).await.unwrap().flow_id, "f1");

        // Once the flow leaves STARTED the token is dead everywhere.
        let mut flow = fx.store.find_by_id("f1").await.unwrap().unwrap();
        flow.state = DataFlowState::Completed;
        fx.store
            .save("rt-a", &flow, ferry_storage::SaveMode::ReleaseLease)
            .await
            .unwrap();
        assert!(matches!(
            other.authorize(&token).await,
            Err(AuthorizationError::Revoked { reason }) if reason == "flow is COMPLETED"
        ));
    }

    #[tokio::test]
    async fn revoked_superseded_and_expired_tokens_are_refused() {
        let fx = fixture();
        let (_, revoked) = issue(&fx, "f1").await;
        let (_, expiring) = issue(&fx, "f2").await;

        assert_eq!(fx.auth.revoke("f1", "terminated"), 1);
        assert!(matches!(
            fx.auth.authorize(&revoked).await,
            Err(AuthorizationError::Revoked { reason }) if reason == "terminated"
        ));

        // A fresh reference for f2 replaces the one in the flow record.
        let newer = fx.auth.create_endpoint_data_reference(&pull_flow("f2")).unwrap();
        let mut flow = fx.store.find_by_id("f2").await.unwrap().unwrap();
        flow.endpoint_data_reference = Some(newer);
        fx.store
            .save("rt-a", &flow, ferry_storage::SaveMode::ReleaseLease)
            .await
            .unwrap();
        assert!(matches!(
            fx.auth.authorize(&expiring).await,
            Err(AuthorizationError::Revoked { .. })
        ));

        fx.clock.advance(Duration::from_secs(61));
        assert!(matches!(
            fx.auth.authorize(&expiring).await,
            Err(AuthorizationError::Expired { .. })
        ));
        assert_eq!(fx.auth.tokens().len(), 3);
        assert_eq!(fx.auth.purge_expired(), 3);
        assert!(fx.auth.tokens().is_empty());
    }

    #[tokio::test]
    async fn token_for_an_unknown_flow_is_refused() {
        let fx = fixture();
        let edr = fx.auth.create_endpoint_data_reference(&pull_flow("ghost")).unwrap();
        let token = edr.property(AUTHORIZATION).unwrap();
        assert!(matches!(
            fx.auth.authorize(token).await,
            Err(AuthorizationError::Unknown)
        ));
    }

    #[tokio::test]
    async fn tampered_or_foreign_tokens_are_refused() {
        let fx = fixture();
        let (_, token) = issue(&fx, "f1").await;

        let (claims, sig) = token.split_once('.').unwrap();
        let mut forged = claims.to_string();
        forged.push('A');
        assert!(matches!(
            fx.auth.authorize(&format!("{forged}.{sig}")).await,
            Err(AuthorizationError::InvalidSignature)
        ));
        assert!(matches!(
            fx.auth.authorize("no-dot").await,
            Err(AuthorizationError::Malformed(_))
        ));

        // Signed by another key: verifies nowhere.
        let other = service(generate_key(), fx.store.clone(), fx.clock.clone());
        let foreign = other.create_endpoint_data_reference(&pull_flow("f1")).unwrap();
        assert!(matches!(
            fx.auth.authorize(foreign.property(AUTHORIZATION).unwrap()).await,
            Err(AuthorizationError::InvalidSignature)
        ));
    }

    #[test]
    fn unknown_destination_type_cannot_get_a_reference() {
        let fx = fixture();
        let mut flow = pull_flow("f1");
        flow.transfer_type = TransferType::new("Kafka", FlowType::Pull);
        assert!(matches!(
            fx.auth.create_endpoint_data_reference(&flow),
            Err(FlowError::Configuration(_))
        ));
    }
}
