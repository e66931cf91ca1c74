//! Signed access tokens and their bookkeeping.
//!
//! A token is `base64url(claims json) "." base64url(ed25519 signature)`,
//! both without padding. The store never keeps the token text itself, only
//! its SHA-256 digest.

use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::AuthorizationError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    pub token_id: String,
    pub flow_id: String,
    pub process_id: String,
    /// Epoch millis.
    pub issued_at: i64,
    /// Epoch millis.
    pub expires_at: i64,
}

pub fn sign(claims: &TokenClaims, key: &SigningKey) -> Result<String, AuthorizationError> {
    let payload = serde_json::to_vec(claims)
        .map_err(|e| AuthorizationError::Malformed(e.to_string()))?;
    let encoded = URL_SAFE_NO_PAD.encode(payload);
    let signature = key.sign(encoded.as_bytes());
    Ok(format!(
        "{encoded}.{}",
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    ))
}

/// Check the signature and decode the claims. Expiry is checked by the caller.
pub fn verify(token: &str, key: &VerifyingKey) -> Result<TokenClaims, AuthorizationError> {
    let (encoded, sig) = token
        .split_once('.')
        .ok_or_else(|| AuthorizationError::Malformed("missing signature".into()))?;
    let sig_bytes: [u8; 64] = URL_SAFE_NO_PAD
        .decode(sig)
        .map_err(|e| AuthorizationError::Malformed(e.to_string()))?
        .try_into()
        .map_err(|_| AuthorizationError::Malformed("signature has invalid length".into()))?;
    key.verify(encoded.as_bytes(), &Signature::from_bytes(&sig_bytes))
        .map_err(|_| AuthorizationError::InvalidSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(encoded)
        .map_err(|e| AuthorizationError::Malformed(e.to_string()))?;
    serde_json::from_slice(&payload).map_err(|e| AuthorizationError::Malformed(e.to_string()))
}

fn digest(token: &str) -> String {
    Sha256::digest(token.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessTokenEntry {
    pub token_id: String,
    pub flow_id: String,
    pub expires_at: i64,
    pub revoked: Option<String>,
}

/// Issued tokens, keyed by digest.
#[derive(Debug, Default)]
pub struct AccessTokenStore {
    entries: Mutex<HashMap<String, AccessTokenEntry>>,
}

impl AccessTokenStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, AccessTokenEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn insert(&self, token: &str, entry: AccessTokenEntry) {
        self.lock().insert(digest(token), entry);
    }

    pub fn get(&self, token: &str) -> Option<AccessTokenEntry> {
        self.lock().get(&digest(token)).cloned()
    }

    /// Mark every token of `flow_id` revoked. Returns how many were live.
    pub fn revoke_flow(&self, flow_id: &str, reason: &str) -> usize {
        let mut revoked = 0;
        for entry in self.lock().values_mut() {
            if entry.flow_id == flow_id && entry.revoked.is_none() {
                entry.revoked = Some(reason.to_string());
                revoked += 1;
            }
        }
        revoked
    }

    /// Drop entries expired before `now`. Returns how many were removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let mut entries = self.lock();
        let before = entries.len();
        entries.retain(|_, e| e.expires_at > now);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
