//! Sharded credential-validation cache
//!
//! Gate for the ingest path: maps `(api_key, api_secret)` to a project id.
//! The cache holds only `api_key -> (project_id, expiry)`; secrets are
//! verified against the stored argon2 hash on every miss and never cached,
//! so an entry proves the key's secret verified within the last TTL.

use crate::store::CredentialStore;
use argon2::password_hash::{rand_core::OsRng, SaltString};
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use parking_lot::RwLock;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::warn;

/// Number of independent shards; selection uses the first byte of a SHA-256
/// digest of the key, so each byte value is its own shard.
pub const SHARD_COUNT: usize = 256;

/// How long a verified key binding stays valid without re-verification.
pub const DEFAULT_TTL: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy)]
struct CacheEntry {
    project_id: i32,
    expires_at: Instant,
}

#[derive(Default)]
struct CacheShard {
    entries: RwLock<HashMap<String, CacheEntry>>,
}

/// TTL'd project-binding cache in front of the credential store.
pub struct CredentialCache {
    shards: Vec<CacheShard>,
    store: Arc<dyn CredentialStore>,
    ttl: Duration,
}

impl CredentialCache {
    pub fn new(store: Arc<dyn CredentialStore>, ttl: Duration) -> Self {
        let shards = (0..SHARD_COUNT).map(|_| CacheShard::default()).collect();
        Self { shards, store, ttl }
    }

    fn shard(&self, api_key: &str) -> &CacheShard {
        let digest = Sha256::digest(api_key.as_bytes());
        &self.shards[digest[0] as usize]
    }

    /// Validate a presented key/secret pair into a project id.
    ///
    /// Hit path touches only the shard's read lock. Miss path fetches the
    /// credential row, verifies the secret, and populates the shard. Negative
    /// answers (unknown key, bad secret, store failure) are never cached.
    pub async fn validate(&self, api_key: &str, api_secret: &str) -> Option<i32> {
        let shard = self.shard(api_key);

        {
            let entries = shard.entries.read();
            if let Some(entry) = entries.get(api_key) {
                if Instant::now() < entry.expires_at {
                    return Some(entry.project_id);
                }
            }
        }

        let credential = match self.store.credential_by_key(api_key).await {
            Ok(Some(credential)) => credential,
            Ok(None) => return None,
            Err(e) => {
                warn!(error = %e, "credential lookup failed");
                return None;
            }
        };

        if !verify_secret(api_secret, &credential.secret_hash).await {
            return None;
        }

        let mut entries = shard.entries.write();
        entries.insert(
            api_key.to_string(),
            CacheEntry {
                project_id: credential.project_id,
                expires_at: Instant::now() + self.ttl,
            },
        );

        Some(credential.project_id)
    }
}

/// Verify a presented secret against a stored argon2 hash.
///
/// The comparison runs on the blocking pool; argon2 verification is real CPU
/// work and must not stall the request executor.
async fn verify_secret(secret: &str, stored_hash: &str) -> bool {
    let secret = secret.to_string();
    let stored_hash = stored_hash.to_string();
    tokio::task::spawn_blocking(move || match PasswordHash::new(&stored_hash) {
        Ok(parsed) => Argon2::default()
            .verify_password(secret.as_bytes(), &parsed)
            .is_ok(),
        Err(_) => false,
    })
    .await
    .unwrap_or(false)
}

/// Hash an API secret for storage. Used by provisioning tooling and tests.
pub fn hash_secret(secret: &str) -> Result<String, argon2::password_hash::Error> {
    let salt = SaltString::generate(&mut OsRng);
    Ok(Argon2::default()
        .hash_password(secret.as_bytes(), &salt)?
        .to_string())
}
