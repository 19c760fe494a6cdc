use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::collections::HashMap;
use std::time::Duration;
use tokio::sync::RwLock;

use crate::errors::{ServiceError, ServiceResult};

type HmacSha256 = Hmac<Sha256>;

/// Object store holding payment and delivery proofs.
#[async_trait]
pub trait ObjectStorage: Send + Sync {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> ServiceResult<()>;

    fn public_url(&self, path: &str) -> String;

    async fn signed_url(&self, path: &str, ttl: Duration) -> ServiceResult<String>;
}

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub content_type: String,
    pub bytes: Bytes,
}

/// Process-local store. Signed URLs carry an HMAC over path and expiry.
pub struct InMemoryObjectStorage {
    base_url: String,
    signing_key: Vec<u8>,
    objects: RwLock<HashMap<String, StoredObject>>,
}

impl InMemoryObjectStorage {
    pub fn new(base_url: impl Into<String>, signing_key: impl Into<Vec<u8>>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            signing_key: signing_key.into(),
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, path: &str) -> Option<StoredObject> {
        self.objects.read().await.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }

    fn sign(&self, path: &str, expires: i64) -> ServiceResult<String> {
        let mut mac = HmacSha256::new_from_slice(&self.signing_key)
            .map_err(|e| ServiceError::InternalError(format!("invalid signing key: {e}")))?;
        mac.update(format!("{path}:{expires}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl Default for InMemoryObjectStorage {
    fn default() -> Self {
        Self::new("memory://storage", b"in-memory-storage".to_vec())
    }
}

#[async_trait]
impl ObjectStorage for InMemoryObjectStorage {
    async fn upload(&self, path: &str, bytes: Bytes, content_type: &str) -> ServiceResult<()> {
        if path.trim().is_empty() {
            return Err(ServiceError::validation("storage path is required"));
        }
        self.objects.write().await.insert(
            path.to_string(),
            StoredObject {
                content_type: content_type.to_string(),
                bytes,
            },
        );
        tracing::debug!(path, "object stored");
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    async fn signed_url(&self, path: &str, ttl: Duration) -> ServiceResult<String> {
        if !self.objects.read().await.contains_key(path) {
            return Err(ServiceError::not_found("object", path));
        }
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        let signature = self.sign(path, expires)?;
        Ok(format!(
            "{}?expires={}&signature={}",
            self.public_url(path),
            expires,
            signature
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_then_sign() {
        let store = InMemoryObjectStorage::default();
        store
            .upload("payment-proofs/u/o/1.png", Bytes::from_static(b"png"), "image/png")
            .await
            .unwrap();
        assert_eq!(store.len().await, 1);
        assert_eq!(
            store.public_url("payment-proofs/u/o/1.png"),
            "memory://storage/payment-proofs/u/o/1.png"
        );
        let url = store
            .signed_url("payment-proofs/u/o/1.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.contains("signature="));
        assert!(store.signed_url("missing", Duration::from_secs(60)).await.is_err());
    }
}
