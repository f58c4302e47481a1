//! Recording store issuing HMAC-signed, time-limited URLs.

use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use ring::hmac;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::time::Duration;
use tracing::debug;

use super::{RecordingStore, StoreResult};

pub struct SignedRecordingStore {
    base_url: String,
    key: hmac::Key,
    key_id: String,
    objects: RwLock<HashMap<String, String>>,
}

impl SignedRecordingStore {
    pub fn new(base_url: impl Into<String>, secret: &[u8]) -> Self {
        let key_id = hex::encode(&Sha256::digest(secret)[..4]);
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            key: hmac::Key::new(hmac::HMAC_SHA256, secret),
            key_id,
            objects: RwLock::new(HashMap::new()),
        }
    }

    /// Registers the stored object holding the recording of `stream_id`.
    pub fn insert(&self, stream_id: impl Into<String>, object_path: impl Into<String>) {
        self.objects
            .write()
            .insert(stream_id.into(), object_path.into());
    }

    pub fn sign_at(&self, object_path: &str, expires: i64) -> String {
        let tag = hmac::sign(&self.key, signing_input(object_path, expires).as_bytes());
        let signature = general_purpose::URL_SAFE_NO_PAD.encode(tag.as_ref());
        format!(
            "{}/{}?expires={}&kid={}&signature={}",
            self.base_url, object_path, expires, self.key_id, signature
        )
    }

    /// Checks a URL produced by this store: signature intact and not expired at `now`.
    pub fn verify(&self, url: &str, now: DateTime<Utc>) -> bool {
        let Some(rest) = url.strip_prefix(&self.base_url) else {
            return false;
        };
        let Some((path, query)) = rest.trim_start_matches('/').split_once('?') else {
            return false;
        };
        let params: HashMap<&str, &str> = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .collect();
        let (Some(expires), Some(signature)) = (
            params.get("expires").and_then(|e| e.parse::<i64>().ok()),
            params.get("signature"),
        ) else {
            return false;
        };
        if expires < now.timestamp() {
            return false;
        }
        let Ok(tag) = general_purpose::URL_SAFE_NO_PAD.decode(signature) else {
            return false;
        };
        hmac::verify(&self.key, signing_input(path, expires).as_bytes(), &tag).is_ok()
    }
}

fn signing_input(object_path: &str, expires: i64) -> String {
    format!("{}\n{}", object_path, expires)
}

#[async_trait]
impl RecordingStore for SignedRecordingStore {
    async fn signed_url(&self, stream_id: &str, ttl: Duration) -> StoreResult<Option<String>> {
        let Some(path) = self.objects.read().get(stream_id).cloned() else {
            return Ok(None);
        };
        let expires = Utc::now().timestamp() + ttl.as_secs() as i64;
        debug!(stream = %stream_id, expires, "signing recording url");
        Ok(Some(self.sign_at(&path, expires)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> SignedRecordingStore {
        let store = SignedRecordingStore::new("https://media.example.org/", b"secret");
        store.insert("room-1", "recordings/room-1.webm");
        store
    }

    #[tokio::test]
    async fn issued_urls_verify_until_expiry() {
        let store = store();
        let url = store
            .signed_url("room-1", Duration::from_secs(3600))
            .await
            .unwrap()
            .unwrap();
        assert!(url.starts_with("https://media.example.org/recordings/room-1.webm?expires="));
        assert!(store.verify(&url, Utc::now()));
        assert!(!store.verify(&url, Utc::now() + chrono::Duration::hours(2)));
    }

    #[tokio::test]
    async fn unknown_stream_has_no_url() {
        assert!(store()
            .signed_url("room-2", Duration::from_secs(60))
            .await
            .unwrap()
            .is_none());
    }

    #[test]
    fn tampered_urls_are_rejected() {
        let store = store();
        let expires = Utc::now().timestamp() + 60;
        let url = store.sign_at("recordings/room-1.webm", expires);
        let forged = url.replace("room-1.webm", "room-9.webm");
        assert!(store.verify(&url, Utc::now()));
        assert!(!store.verify(&forged, Utc::now()));

        let other = SignedRecordingStore::new("https://media.example.org", b"other");
        assert!(!other.verify(&url, Utc::now()));
    }
}
