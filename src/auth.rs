//! Issued-Key Authentication
//!
//! Clients authenticate with keys minted by this proxy (`acc_` prefix),
//! carried either as `Authorization: Bearer acc_...` or `x-acc-api-key`.
//! Only the SHA-256 of a key is ever stored; the raw key exists exactly once,
//! in the creation response.
//!
//! Lookup behaviour is deliberately uniform: an unknown key and a revoked key
//! take the same code path (hash, lookup, flag check) and return the same
//! error, so timing does not distinguish them. Missing key material is 401,
//! everything else is 403.

use axum::{
    extract::FromRequestParts,
    http::request::Parts,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use uuid::Uuid;

use crate::error::ProxyError;
use crate::AppState;

pub const API_KEY_HEADER: &str = "x-acc-api-key";
pub const AGENT_ID_HEADER: &str = "x-acc-agent-id";
pub const KEY_PREFIX: &str = "acc_";

/// Quota/rate tier attached to an issued key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    Free,
    Standard,
    Enterprise,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Free => "free",
            Self::Standard => "standard",
            Self::Enterprise => "enterprise",
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Self::Free
    }
}

/// Stored record for one issued key. The raw key is not recoverable.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyRecord {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Scopes budgets and policy to one agent when set
    pub agent_id: Option<Uuid>,
    pub name: String,
    /// First 12 characters, for display (`acc_xxxxxxxx`)
    pub key_prefix: String,
    /// SHA-256 hex of the full key
    #[serde(skip_serializing)]
    pub key_hash: String,
    pub tier: Tier,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
}

/// The authenticated subject of a request.
#[derive(Debug, Clone)]
pub struct Principal {
    pub user_id: Uuid,
    pub agent_id: Option<Uuid>,
    pub tier: Tier,
}

/// SHA-256 hex digest of a raw key, the storage form.
pub fn hash_key(key: &str) -> String {
    hex::encode(Sha256::digest(key.as_bytes()))
}

/// Mint a new key. Returns (full_key, key_hash, key_prefix); the full key
/// must be shown to the caller once and then dropped.
pub fn generate_api_key() -> (String, String, String) {
    use rand::RngCore;

    let mut raw = [0u8; 24];
    rand::thread_rng().fill_bytes(&mut raw);
    let key = format!("{KEY_PREFIX}{}", hex::encode(raw));
    let hash = hash_key(&key);
    let prefix = key[..12].to_string();
    (key, hash, prefix)
}

/// Pull the issued key out of either supported header.
fn extract_issued_key(parts: &Parts) -> Option<String> {
    if let Some(value) = parts
        .headers
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
    {
        return Some(value.to_string());
    }

    let auth = parts
        .headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())?;
    let candidate = auth.strip_prefix("Bearer ").unwrap_or(auth);
    // Authorization may carry the upstream provider key instead; only an
    // acc_ value is ours.
    candidate
        .starts_with(KEY_PREFIX)
        .then(|| candidate.to_string())
}

#[axum::async_trait]
impl FromRequestParts<Arc<AppState>> for Principal {
    type Rejection = ProxyError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let key = extract_issued_key(parts).ok_or_else(|| ProxyError::MissingApiKey {
            message: format!(
                "Missing API key. Use Authorization: Bearer {KEY_PREFIX}... or the {API_KEY_HEADER} header"
            ),
        })?;

        if !key.starts_with(KEY_PREFIX) {
            return Err(ProxyError::InvalidApiKey);
        }

        let key_hash = hash_key(&key);
        let record = match state.store.api_key_by_hash(&key_hash) {
            Some(record) if record.is_active => record,
            Some(_) | None => {
                tracing::debug!("rejected API key (unknown or revoked)");
                return Err(ProxyError::InvalidApiKey);
            }
        };

        // Fire-and-forget last_used_at update; no retry, never blocks auth.
        {
            let store = state.store.clone();
            let hash = key_hash.clone();
            tokio::spawn(async move {
                store.touch_api_key(&hash, Utc::now());
            });
        }

        // A header-scoped agent overrides the key's own scope.
        let agent_id = parts
            .headers
            .get(AGENT_ID_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| Uuid::parse_str(v).ok())
            .or(record.agent_id);

        Ok(Principal {
            user_id: record.user_id,
            agent_id,
            tier: record.tier,
        })
    }
}
