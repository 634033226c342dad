//! Provider selection
//!
//! Deployment environments signal which backend is present through
//! configuration and well-known paths. Selection is a pure function over
//! those signals so it can be tested exhaustively; `from_env` gathers the
//! signals from the process environment.

use crate::provider::ProviderKind;
use tracing::info;

/// Signals provider selection looks at
#[derive(Debug, Clone, Default)]
pub struct SelectionEnv {
    /// Operator-pinned backend, wins over all detection
    pub explicit: Option<ProviderKind>,
    /// Cloud project identifier, set when cloud KMS credentials exist
    pub google_project_id: Option<String>,
    /// Path to cloud application credentials
    pub google_credentials: Option<String>,
    /// Configured PKCS#11 library path, hints at the hardware vendor
    pub lib_path: Option<String>,
}

impl SelectionEnv {
    /// Gather selection signals from the process environment
    pub fn from_env() -> Self {
        Self {
            explicit: std::env::var("HSM_PROVIDER")
                .ok()
                .and_then(|name| match name.as_str() {
                    "software" => Some(ProviderKind::Software),
                    "cloud_hsm" => Some(ProviderKind::CloudHsm),
                    "cloud_kms" => Some(ProviderKind::CloudKms),
                    "secure_element" => Some(ProviderKind::SecureElement),
                    _ => None,
                }),
            google_project_id: std::env::var("GOOGLE_CLOUD_PROJECT_ID").ok(),
            google_credentials: std::env::var("GOOGLE_APPLICATION_CREDENTIALS").ok(),
            lib_path: std::env::var("HSM_LIB_PATH").ok(),
        }
    }
}

/// Pick the backend for this deployment.
///
/// Explicit configuration wins. Otherwise: cloud KMS credentials select
/// the KMS, a vendor library path selects the matching hardware backend,
/// and with no signal at all the software no-op is used.
pub fn detect_provider(env: &SelectionEnv) -> ProviderKind {
    if let Some(kind) = env.explicit {
        info!(provider = %kind, "provider pinned by configuration");
        return kind;
    }

    if env.google_project_id.is_some() || env.google_credentials.is_some() {
        info!("cloud KMS credentials present, selecting cloud_kms");
        return ProviderKind::CloudKms;
    }

    if let Some(lib_path) = env.lib_path.as_deref() {
        let lower = lib_path.to_lowercase();
        if lower.contains("zymbit") || lower.contains("zk_pkcs11") {
            info!(%lib_path, "secure element library configured");
            return ProviderKind::SecureElement;
        }
        if lower.contains("cloudhsm") {
            info!(%lib_path, "HSM cluster library configured");
            return ProviderKind::CloudHsm;
        }
    }

    info!("no hardware signal detected, falling back to software provider");
    ProviderKind::Software
}
