//! # MPC Custody HSM
//!
//! Key-protection backends for the custody system's root key. Every
//! backend implements [`KeyProtector`]; the [`RootKeyService`] wraps one
//! provider and exposes envelope encryption under a single 32-byte root
//! key that exists in plaintext only in process memory.
//!
//! ## Backends
//!
//! - [`SoftwareProtector`] — process-local key, no hardware assurance,
//!   development fallback
//! - [`CloudHsmProtector`] — PKCS#11 against a managed network HSM fleet
//! - [`CloudKmsProtector`] — REST calls against a cloud key-management
//!   service
//! - [`SecureElementProtector`] — PKCS#11 against an embedded
//!   tamper-resistant chip
//!
//! ## Selection
//!
//! [`detect_provider`] maps deployment signals (explicit configuration,
//! cloud credentials, vendor library paths) to a [`ProviderKind`]. There
//! is no silent downgrade: a backend that fails to initialize stays
//! `Failed`, and a service configured to require hardware refuses to
//! start on a software backend.
//!
//! ```no_run
//! use mpc_custody_hsm::{RootKeyService, SoftwareProtector};
//! use std::sync::Arc;
//!
//! # async fn demo() -> mpc_custody_hsm::Result<()> {
//! let service = RootKeyService::new(Arc::new(SoftwareProtector::new()), false);
//! service.start(None).await?;
//!
//! let blob = service.protect(b"wallet key share")?;
//! assert_eq!(service.unprotect(&blob)?, b"wallet key share");
//! # Ok(())
//! # }
//! ```

pub mod cloudhsm;
pub mod cloudkms;
pub mod element;
pub mod error;
pub mod pkcs11;
pub mod provider;
pub mod root_key;
pub mod select;
pub mod software;

pub use cloudhsm::{CloudHsmConfig, CloudHsmProtector, ClusterApi, ClusterInfo};
pub use cloudkms::{CloudKmsConfig, CloudKmsProtector, CryptoKeyInfo, KmsApi};
#[cfg(feature = "cloud-kms")]
pub use cloudkms::RestKmsClient;
pub use element::{SecureElementConfig, SecureElementProtector};
pub use error::{HsmError, Result};
pub use pkcs11::{Pkcs11Module, SoftTokenModule};
pub use provider::{HealthStatus, InitState, KeyPairHandle, KeyProtector, ProviderKind};
pub use root_key::{RootKeyService, RootKeyStore};
pub use select::{detect_provider, SelectionEnv};
pub use software::SoftwareProtector;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
