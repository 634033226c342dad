//! Network HSM cluster provider
//!
//! Talks PKCS#11 to a managed HSM fleet. Initialization verifies the
//! cluster is active with at least one active HSM before loading the
//! vendor library and opening a session; any failure leaves the provider
//! in `Failed` with a `ProviderUnavailable` cause, distinct from later
//! cryptographic errors.

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

/// Cluster description from the management API
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterInfo {
    /// Management-plane cluster state, `ACTIVE` when usable
    pub state: String,
    /// HSMs in the cluster
    pub total_hsms: u32,
    /// HSMs currently in active state
    pub active_hsms: u32,
}

/// Management-plane API for the HSM fleet
#[async_trait]
pub trait ClusterApi: Send + Sync {
    async fn describe_cluster(&self, cluster_id: &str) -> Result<ClusterInfo>;
}

/// Configuration for the cluster provider
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudHsmConfig {
    /// Cluster identifier
    pub cluster_id: String,
    /// Vendor PKCS#11 library path
    pub lib_path: String,
    /// Crypto-user PIN
    pub pin: String,
    /// Token slot, usually 0
    pub slot: u32,
    /// Label of the protection key on the token
    pub key_label: String,
    /// Skip the management-plane check (for private deployments)
    pub check_cluster: bool,
}

impl CloudHsmConfig {
    pub fn new(cluster_id: impl Into<String>, lib_path: impl Into<String>, pin: impl Into<String>) -> Self {
        Self {
            cluster_id: cluster_id.into(),
            lib_path: lib_path.into(),
            pin: pin.into(),
            slot: 0,
            key_label: "custody-root-key".into(),
            check_cluster: true,
        }
    }
}

/// Key protector backed by a network HSM cluster
pub struct CloudHsmProtector {
    config: CloudHsmConfig,
    module: Arc<dyn Pkcs11Module>,
    cluster: Arc<dyn ClusterApi>,
    state: RwLock<InitState>,
    health: HealthCache,
}

impl CloudHsmProtector {
    pub fn new(
        config: CloudHsmConfig,
        module: Arc<dyn Pkcs11Module>,
        cluster: Arc<dyn ClusterApi>,
    ) -> Self {
        Self {
            config,
            module,
            cluster,
            state: RwLock::new(InitState::Uninitialized),
            health: HealthCache::new(Duration::from_secs(30)),
        }
    }

    async fn verify_cluster_active(&self) -> Result<ClusterInfo> {
        let info = self.cluster.describe_cluster(&self.config.cluster_id).await?;
        if info.state != "ACTIVE" {
            return Err(HsmError::ProviderUnavailable(format!(
                "cluster {} is not active, current state: {}",
                self.config.cluster_id, info.state
            )));
        }
        if info.active_hsms == 0 {
            return Err(HsmError::ProviderUnavailable(format!(
                "cluster {} has no active HSMs",
                self.config.cluster_id
            )));
        }
        Ok(info)
    }

    fn fail(&self, err: HsmError) -> HsmError {
        *self.state.write() = InitState::Failed;
        err
    }
}

#[async_trait]
impl KeyProtector for CloudHsmProtector {
    fn kind(&self) -> ProviderKind {
        ProviderKind::CloudHsm
    }

    fn is_hardware_backed(&self) -> bool {
        true
    }

    fn state(&self) -> InitState {
        *self.state.read()
    }

    #[instrument(skip(self), fields(cluster_id = %self.config.cluster_id))]
    async fn initialize(&self) -> Result<()> {
        *self.state.write() = InitState::Initializing;

        if self.config.check_cluster {
            let info = self
                .verify_cluster_active()
                .await
                .map_err(|e| self.fail(e))?;
            info!(active_hsms = info.active_hsms, "cluster verified");
        }

        if !Path::new(&self.config.lib_path).exists() {
            return Err(self.fail(HsmError::ProviderUnavailable(format!(
                "PKCS#11 library not found at {}",
                self.config.lib_path
            ))));
        }

        let slots = self.module.slot_count().await.map_err(|e| self.fail(e))?;
        if slots == 0 {
            return Err(self.fail(HsmError::ProviderUnavailable(
                "no HSM slots found, verify client configuration and cluster connectivity".into(),
            )));
        }

        self.module
            .open_session(self.config.slot, &self.config.pin)
            .await
            .map_err(|e| self.fail(e))?;

        *self.state.write() = InitState::Active;
        info!("HSM cluster provider active");
        Ok(())
    }

    async fn finalize(&self) -> Result<()> {
        if let Err(err) = self.module.close_session().await {
            warn!(error = %err, "error closing HSM session");
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

        let (reachable, hsm_count) = match self
            .cluster
            .describe_cluster(&self.config.cluster_id)
            .await
        {
            Ok(info) => (info.state == "ACTIVE", Some(info.active_hsms)),
            Err(err) => {
                warn!(error = %err, "cluster health check failed");
                (false, None)
            }
        };

        let status = HealthStatus {
            reachable,
            hardware_backed: true,
            hsm_count,
            tamper_detected: None,
            checked_at: Utc::now(),
        };
        self.health.store(status.clone());
        Ok(status)
    }
}
