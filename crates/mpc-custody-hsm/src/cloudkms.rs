//! Cloud KMS provider
//!
//! Key material lives inside a managed key-management service and every
//! operation is a REST call against a key resource of the form
//! `projects/{p}/locations/{l}/keyRings/{kr}/cryptoKeys/{ck}`. The
//! service-facing calls sit behind [`KmsApi`] so provider logic (key
//! verification, protection-level checks, health) is testable without the
//! network; [`RestKmsClient`] is the HTTP implementation.

use crate::provider::{
    ensure_active, HealthCache, HealthStatus, InitState, KeyPairHandle, KeyProtector, ProviderKind,
};
use crate::{HsmError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Crypto-key metadata as reported by the service
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CryptoKeyInfo {
    /// Protection level of the key versions, `HSM` or `SOFTWARE`
    pub protection_level: String,
    /// State of the primary key version, must be `ENABLED` for use
    pub primary_state: String,
}

/// Service calls the provider needs, one method per REST endpoint
#[async_trait]
pub trait KmsApi: Send + Sync {
    /// `GET {key}` metadata
    async fn get_crypto_key(&self, key_resource: &str) -> Result<CryptoKeyInfo>;

    /// `POST {key}:encrypt`
    async fn encrypt(&self, key_resource: &str, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// `POST {key}:decrypt`
    async fn decrypt(&self, key_resource: &str, ciphertext: &[u8]) -> Result<Vec<u8>>;

    /// `POST {key}:macSign`
    async fn mac_sign(&self, key_resource: &str, data: &[u8]) -> Result<Vec<u8>>;

    /// `POST {key}:macVerify`; mismatch is `Ok(false)`
    async fn mac_verify(&self, key_resource: &str, data: &[u8], mac: &[u8]) -> Result<bool>;
}

/// Configuration for the cloud KMS provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudKmsConfig {
    pub project_id: String,
    pub location_id: String,
    pub key_ring_id: String,
    pub crypto_key_id: String,
    /// Expected protection level; a mismatch is logged, not fatal
    pub protection_level: String,
}

impl CloudKmsConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            location_id: "us-central1".into(),
            key_ring_id: "custody-keyring".into(),
            crypto_key_id: "custody-root-key".into(),
            protection_level: "HSM".into(),
        }
    }

    /// Full resource name of the configured crypto key
    pub fn key_resource(&self) -> String {
        format!(
            "projects/{}/locations/{}/keyRings/{}/cryptoKeys/{}",
            self.project_id, self.location_id, self.key_ring_id, self.crypto_key_id
        )
    }
}

/// Key protector backed by a cloud key-management service
pub struct CloudKmsProtector {
    config: CloudKmsConfig,
    api: std::sync::Arc<dyn KmsApi>,
    state: RwLock<InitState>,
    /// Protection level observed at initialize time
    observed_level: RwLock<Option<String>>,
    health: HealthCache,
}

impl CloudKmsProtector {
    pub fn new(config: CloudKmsConfig, api: std::sync::Arc<dyn KmsApi>) -> Self {
        Self {
            config,
            api,
            state: RwLock::new(InitState::Uninitialized),
            observed_level: RwLock::new(None),
            health: HealthCache::new(Duration::from_secs(30)),
        }
    }

    fn fail(&self, err: HsmError) -> HsmError {
        *self.state.write() = InitState::Failed;
        err
    }
}

#[async_trait]
impl KeyProtector for CloudKmsProtector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudKms
    }

    fn is_hardware_backed(&self) -> bool {
        self.observed_level
            .read()
            .as_deref()
            .map(|level| level == "HSM")
            .unwrap_or(self.config.protection_level == "HSM")
    }

    fn state(&self) -> InitState {
        *self.state.read()
    }

    #[instrument(skip(self), fields(key = %self.config.key_resource()))]
    async fn initialize(&self) -> Result<()> {
        *self.state.write() = InitState::Initializing;

        let key = self.config.key_resource();
        let info = self
            .api
            .get_crypto_key(&key)
            .await
            .map_err(|e| self.fail(e))?;

        if info.primary_state != "ENABLED" {
            return Err(self.fail(HsmError::ProviderUnavailable(format!(
                "crypto key {} primary version is {}, not ENABLED",
                key, info.primary_state
            ))));
        }
        if info.protection_level != self.config.protection_level {
            warn!(
                expected = %self.config.protection_level,
                actual = %info.protection_level,
                "crypto key protection level differs from configuration"
            );
        }
        *self.observed_level.write() = Some(info.protection_level.clone());

        *self.state.write() = InitState::Active;
        info!(protection_level = %info.protection_level, "cloud KMS provider active");
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        // No session to tear down, the service is stateless
        *self.state.write() = InitState::Uninitialized;
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.api
            .encrypt(&self.config.key_resource(), plaintext)
            .await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.api
            .decrypt(&self.config.key_resource(), ciphertext)
            .await
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.api.mac_sign(&self.config.key_resource(), data).await
    }

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        ensure_active(self.state(), self.kind())?;
        self.api
            .mac_verify(&self.config.key_resource(), data, signature)
            .await
    }

    async fn generate_key_pair(&self) -> Result<KeyPairHandle> {
        ensure_active(self.state(), self.kind())?;
        // Key versions live inside the service; handles are resource names
        let key = self.config.key_resource();
        Ok(KeyPairHandle {
            public_handle: format!("{key}/cryptoKeyVersions/1/publicKey"),
            private_handle: format!("{key}/cryptoKeyVersions/1"),
        })
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if let Some(cached) = self.health.fresh() {
            return Ok(cached);
        }

        // An encrypt/decrypt round trip proves the full data path
        let probe = b"health-check";
        let reachable = match self.api.encrypt(&self.config.key_resource(), probe).await {
            Ok(blob) => self
                .api
                .decrypt(&self.config.key_resource(), &blob)
                .await
                .map(|plain| plain == probe)
                .unwrap_or(false),
            Err(err) => {
                warn!(error = %err, "KMS health probe failed");
                false
            }
        };

        let status = HealthStatus {
            reachable,
            hardware_backed: self.is_hardware_backed(),
            hsm_count: None,
            tamper_detected: None,
            checked_at: Utc::now(),
        };
        self.health.store(status.clone());
        Ok(status)
    }
}

/// HTTP client for the KMS REST API
///
/// Payloads are base64 in both directions. Authorization is a bearer token
/// supplied by the caller's credential machinery.
#[cfg(feature = "cloud-kms")]
pub struct RestKmsClient {
    client: reqwest::Client,
    endpoint: String,
    access_token: String,
}

#[cfg(feature = "cloud-kms")]
impl RestKmsClient {
    pub fn new(access_token: impl Into<String>) -> Result<Self> {
        Self::with_endpoint(access_token, "https://cloudkms.googleapis.com/v1")
    }

    /// Point at a different endpoint, used against emulators
    pub fn with_endpoint(
        access_token: impl Into<String>,
        endpoint: impl Into<String>,
    ) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(15))
            .build()
            .map_err(|e| HsmError::Config(format!("could not build KMS HTTP client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            access_token: access_token.into(),
        })
    }

    async fn post(
        &self,
        key_resource: &str,
        action: &str,
        body: serde_json::Value,
    ) -> Result<serde_json::Value> {
        let url = format!("{}/{}:{}", self.endpoint, key_resource, action);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .json(&body)
            .send()
            .await
            .map_err(|e| HsmError::ProviderUnavailable(format!("KMS request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(match status.as_u16() {
                403 => HsmError::ProviderUnavailable(format!(
                    "KMS permission denied for {key_resource}: {detail}"
                )),
                404 => HsmError::ProviderUnavailable(format!(
                    "crypto key {key_resource} not found: {detail}"
                )),
                _ => HsmError::ProviderUnavailable(format!("KMS returned {status}: {detail}")),
            });
        }

        response
            .json()
            .await
            .map_err(|e| HsmError::Serialization(format!("KMS response: {e}")))
    }

    fn field_bytes(value: &serde_json::Value, field: &str) -> Result<Vec<u8>> {
        use base64::Engine;
        let encoded = value
            .get(field)
            .and_then(|v| v.as_str())
            .ok_or_else(|| HsmError::Serialization(format!("KMS response missing {field}")))?;
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map_err(|e| HsmError::Serialization(format!("KMS response {field}: {e}")))
    }
}

#[cfg(feature = "cloud-kms")]
#[async_trait]
impl KmsApi for RestKmsClient {
    async fn get_crypto_key(&self, key_resource: &str) -> Result<CryptoKeyInfo> {
        let url = format!("{}/{}", self.endpoint, key_resource);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.access_token)
            .send()
            .await
            .map_err(|e| HsmError::ProviderUnavailable(format!("KMS request failed: {e}")))?;

        if !response.status().is_success() {
            return Err(HsmError::ProviderUnavailable(format!(
                "could not read crypto key {key_resource}: {}",
                response.status()
            )));
        }

        let value: serde_json::Value = response
            .json()
            .await
            .map_err(|e| HsmError::Serialization(format!("KMS response: {e}")))?;

        Ok(CryptoKeyInfo {
            protection_level: value
                .pointer("/versionTemplate/protectionLevel")
                .and_then(|v| v.as_str())
                .unwrap_or("SOFTWARE")
                .to_string(),
            primary_state: value
                .pointer("/primary/state")
                .and_then(|v| v.as_str())
                .unwrap_or("DISABLED")
                .to_string(),
        })
    }

    async fn encrypt(&self, key_resource: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        use base64::Engine;
        let body = serde_json::json!({
            "plaintext": base64::engine::general_purpose::STANDARD.encode(plaintext),
        });
        let value = self.post(key_resource, "encrypt", body).await?;
        Self::field_bytes(&value, "ciphertext")
    }

    async fn decrypt(&self, key_resource: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
        use base64::Engine;
        let body = serde_json::json!({
            "ciphertext": base64::engine::general_purpose::STANDARD.encode(ciphertext),
        });
        let value = self.post(key_resource, "decrypt", body).await?;
        Self::field_bytes(&value, "plaintext")
    }

    async fn mac_sign(&self, key_resource: &str, data: &[u8]) -> Result<Vec<u8>> {
        use base64::Engine;
        let body = serde_json::json!({
            "data": base64::engine::general_purpose::STANDARD.encode(data),
        });
        let value = self.post(key_resource, "macSign", body).await?;
        Self::field_bytes(&value, "mac")
    }

    async fn mac_verify(&self, key_resource: &str, data: &[u8], mac: &[u8]) -> Result<bool> {
        use base64::Engine;
        let body = serde_json::json!({
            "data": base64::engine::general_purpose::STANDARD.encode(data),
            "mac": base64::engine::general_purpose::STANDARD.encode(mac),
        });
        let value = self.post(key_resource, "macVerify", body).await?;
        Ok(value
            .get("success")
            .and_then(|v| v.as_bool())
            .unwrap_or(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chacha20poly1305::aead::{Aead, KeyInit};
    use chacha20poly1305::{ChaCha20Poly1305, Key, Nonce};
    use hmac::{Hmac, Mac};
    use parking_lot::Mutex;
    use rand::RngCore;
    use sha2::Sha256;
    use std::sync::Arc;

    /// Service double with a real cipher so round trips are meaningful
    struct ScriptedKmsApi {
        key: [u8; 32],
        info: Mutex<CryptoKeyInfo>,
        fail_requests: Mutex<bool>,
    }

    impl ScriptedKmsApi {
        fn hsm_backed() -> Self {
            let mut key = [0u8; 32];
            rand::rngs::OsRng.fill_bytes(&mut key);
            Self {
                key,
                info: Mutex::new(CryptoKeyInfo {
                    protection_level: "HSM".into(),
                    primary_state: "ENABLED".into(),
                }),
                fail_requests: Mutex::new(false),
            }
        }

        fn set_primary_state(&self, state: &str) {
            self.info.lock().primary_state = state.to_string();
        }

        fn set_protection_level(&self, level: &str) {
            self.info.lock().protection_level = level.to_string();
        }

        fn set_fail_requests(&self, fail: bool) {
            *self.fail_requests.lock() = fail;
        }

        fn guard(&self) -> Result<()> {
            if *self.fail_requests.lock() {
                return Err(HsmError::ProviderUnavailable("service unreachable".into()));
            }
            Ok(())
        }
    }

    #[async_trait]
    impl KmsApi for ScriptedKmsApi {
        async fn get_crypto_key(&self, _key: &str) -> Result<CryptoKeyInfo> {
            self.guard()?;
            Ok(self.info.lock().clone())
        }

        async fn encrypt(&self, _key: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
            self.guard()?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
            let mut nonce = [0u8; 12];
            rand::rngs::OsRng.fill_bytes(&mut nonce);
            let ciphertext = cipher
                .encrypt(Nonce::from_slice(&nonce), plaintext)
                .map_err(|_| HsmError::Crypto("encrypt".into()))?;
            let mut blob = nonce.to_vec();
            blob.extend_from_slice(&ciphertext);
            Ok(blob)
        }

        async fn decrypt(&self, _key: &str, ciphertext: &[u8]) -> Result<Vec<u8>> {
            self.guard()?;
            let cipher = ChaCha20Poly1305::new(Key::from_slice(&self.key));
            let (nonce, payload) = ciphertext.split_at(12);
            cipher
                .decrypt(Nonce::from_slice(nonce), payload)
                .map_err(|_| HsmError::Crypto("bad tag".into()))
        }

        async fn mac_sign(&self, _key: &str, data: &[u8]) -> Result<Vec<u8>> {
            self.guard()?;
            let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.key)
                .map_err(|e| HsmError::Crypto(e.to_string()))?;
            mac.update(data);
            Ok(mac.finalize().into_bytes().to_vec())
        }

        async fn mac_verify(&self, key: &str, data: &[u8], mac: &[u8]) -> Result<bool> {
            Ok(self.mac_sign(key, data).await? == mac)
        }
    }

    fn provider(api: Arc<ScriptedKmsApi>) -> CloudKmsProtector {
        CloudKmsProtector::new(CloudKmsConfig::new("test-project"), api)
    }

    #[tokio::test]
    async fn test_initialize_and_round_trip() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        let kms = provider(api);
        kms.initialize().await.unwrap();

        assert!(kms.is_hardware_backed());
        let blob = kms.encrypt(b"root key material").await.unwrap();
        assert_eq!(kms.decrypt(&blob).await.unwrap(), b"root key material");
    }

    #[tokio::test]
    async fn test_disabled_key_blocks_initialize() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        api.set_primary_state("DISABLED");
        let kms = provider(api);

        let err = kms.initialize().await.unwrap_err();
        assert!(matches!(err, HsmError::ProviderUnavailable(_)));
        assert_eq!(kms.state(), InitState::Failed);
    }

    #[tokio::test]
    async fn test_software_level_reported_not_hardware_backed() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        api.set_protection_level("SOFTWARE");
        let kms = provider(api);
        kms.initialize().await.unwrap();

        // Initialization succeeds but hardware assurance is not claimed
        assert!(!kms.is_hardware_backed());
        let health = kms.health_check().await.unwrap();
        assert!(!health.hardware_backed);
    }

    #[tokio::test]
    async fn test_mac_verify_mismatch_is_false() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        let kms = provider(api);
        kms.initialize().await.unwrap();

        let mac = kms.sign(b"data").await.unwrap();
        assert!(kms.verify(b"data", &mac).await.unwrap());
        assert!(!kms.verify(b"tampered", &mac).await.unwrap());
    }

    #[tokio::test]
    async fn test_health_probe_detects_outage() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        let kms = provider(api.clone());
        kms.initialize().await.unwrap();

        api.set_fail_requests(true);
        let health = kms.health_check().await.unwrap();
        assert!(!health.reachable);
    }

    #[cfg(feature = "cloud-kms")]
    #[test]
    fn test_rest_client_construction_is_fallible() {
        assert!(RestKmsClient::new("token").is_ok());
        assert!(RestKmsClient::with_endpoint("token", "http://localhost:1").is_ok());
    }

    #[tokio::test]
    async fn test_key_resource_format() {
        let config = CloudKmsConfig::new("proj");
        assert_eq!(
            config.key_resource(),
            "projects/proj/locations/us-central1/keyRings/custody-keyring/cryptoKeys/custody-root-key"
        );
    }

    #[tokio::test]
    async fn test_key_pair_handles_are_resource_names() {
        let api = Arc::new(ScriptedKmsApi::hsm_backed());
        let kms = provider(api);
        kms.initialize().await.unwrap();

        let handle = kms.generate_key_pair().await.unwrap();
        assert!(handle.private_handle.contains("cryptoKeyVersions"));
        assert!(handle.public_handle.ends_with("/publicKey"));
    }
}
