//! Embedded secure element provider
//!
//! A local tamper-resistant chip exposed as a character device and driven
//! over PKCS#11. Tamper detection is part of the lifecycle: if the device
//! file is gone or the token reports no slots after a successful probe,
//! the element may have been physically removed and the provider refuses
//! to operate.

use crate::pkcs11::Pkcs11Module;
use crate::provider::{
    ensure_active, HealthCache, HealthStatus, InitState, KeyPairHandle, KeyProtector, ProviderKind,
};
use crate::{HsmError, Result};
use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument, warn};

/// Configuration for the secure element provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecureElementConfig {
    /// PKCS#11 library shipped with the element
    pub lib_path: String,
    /// Device node the element is attached to
    pub device_path: String,
    /// Token PIN
    pub pin: String,
    /// Token slot, usually 0
    pub slot: u32,
    /// Label of the protection key on the element
    pub key_label: String,
    /// Run tamper detection at initialize and on every health check
    pub tamper_check: bool,
}

impl SecureElementConfig {
    pub fn new(lib_path: impl Into<String>, device_path: impl Into<String>) -> Self {
        Self {
            lib_path: lib_path.into(),
            device_path: device_path.into(),
            pin: String::new(),
            slot: 0,
            key_label: "custody-root-key".into(),
            tamper_check: true,
        }
    }
}

/// Key protector backed by an embedded secure element
pub struct SecureElementProtector {
    config: SecureElementConfig,
    module: Arc<dyn Pkcs11Module>,
    state: RwLock<InitState>,
    health: HealthCache,
}

impl SecureElementProtector {
    pub fn new(config: SecureElementConfig, module: Arc<dyn Pkcs11Module>) -> Self {
        Self {
            config,
            module,
            state: RwLock::new(InitState::Uninitialized),
            health: HealthCache::new(Duration::from_secs(30)),
        }
    }

    /// Tamper heuristic: device node gone or token reports no slots
    async fn detect_tamper(&self) -> Result<bool> {
        if !Path::new(&self.config.device_path).exists() {
            return Ok(true);
        }
        let slots = self.module.slot_count().await?;
        Ok(slots == 0)
    }

    fn fail(&self, err: HsmError) -> HsmError {
        *self.state.write() = InitState::Failed;
        err
    }
}

#[async_trait]
impl KeyProtector for SecureElementProtector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::SecureElement
    }

    fn is_hardware_backed(&self) -> bool {
        true
    }

    fn state(&self) -> InitState {
        *self.state.read()
    }

    #[instrument(skip(self), fields(device = %self.config.device_path))]
    async fn initialize(&self) -> Result<()> {
        *self.state.write() = InitState::Initializing;

        if !Path::new(&self.config.lib_path).exists() {
            return Err(self.fail(HsmError::ProviderUnavailable(format!(
                "PKCS#11 library not found at {}",
                self.config.lib_path
            ))));
        }
        if !Path::new(&self.config.device_path).exists() {
            return Err(self.fail(HsmError::ProviderUnavailable(format!(
                "secure element device not found at {}",
                self.config.device_path
            ))));
        }

        if self.config.tamper_check && self.detect_tamper().await.map_err(|e| self.fail(e))? {
            return Err(self.fail(HsmError::TamperDetected(
                "secure element unresponsive, possible physical tampering".into(),
            )));
        }

        self.module
            .open_session(self.config.slot, &self.config.pin)
            .await
            .map_err(|e| self.fail(e))?;

        *self.state.write() = InitState::Active;
        info!("secure element provider active");
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        if let Err(err) = self.module.close_session().await {
            warn!(error = %err, "error closing secure element session");
        }
        *self.state.write() = InitState::Uninitialized;
        Ok(())
    }

    async fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.module.encrypt(&self.config.key_label, plaintext).await
    }

    async fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.module.decrypt(&self.config.key_label, ciphertext).await
    }

    async fn sign(&self, data: &[u8]) -> Result<Vec<u8>> {
        ensure_active(self.state(), self.kind())?;
        self.module.sign(&self.config.key_label, data).await
    }

    async fn verify(&self, data: &[u8], signature: &[u8]) -> Result<bool> {
        ensure_active(self.state(), self.kind())?;
        self.module
            .verify(&self.config.key_label, data, signature)
            .await
    }

    async fn generate_key_pair(&self) -> Result<KeyPairHandle> {
        ensure_active(self.state(), self.kind())?;
        self.module.generate_key_pair(&self.config.key_label).await
    }

    async fn health_check(&self) -> Result<HealthStatus> {
        if let Some(cached) = self.health.fresh() {
            return Ok(cached);
        }

        let tamper = if self.config.tamper_check {
            match self.detect_tamper().await {
                Ok(tamper) => Some(tamper),
                Err(err) => {
                    warn!(error = %err, "tamper check failed");
                    Some(true)
                }
            }
        } else {
            None
        };

        let status = HealthStatus {
            reachable: self.is_active() && tamper != Some(true),
            hardware_backed: true,
            hsm_count: None,
            tamper_detected: tamper,
            checked_at: Utc::now(),
        };
        self.health.store(status.clone());
        Ok(status)
    }
}
