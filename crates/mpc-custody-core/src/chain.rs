//! Chain identifiers and deterministic address derivation
//!
//! Every address is derived from the wallet's aggregated public key using the
//! chain's standard encoding rule, so all participants compute the same map.

use crate::{CustodyError, KeyType, Result};
use k256::elliptic_curve::sec1::{FromEncodedPoint, ToEncodedPoint};
use k256::{AffinePoint, EncodedPoint};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use tiny_keccak::{Hasher, Keccak};

/// Supported target chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Chain {
    Ethereum,
    Polygon,
    Arbitrum,
    Optimism,
    Base,
    Avalanche,
    Bnb,
    Bitcoin,
    Solana,
    Xrpl,
}

impl Chain {
    /// All chains reachable with secp256k1 ECDSA keys (EVM family)
    pub const EVM: [Chain; 7] = [
        Chain::Ethereum,
        Chain::Polygon,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Base,
        Chain::Avalanche,
        Chain::Bnb,
    ];

    /// Chains for which an address can be derived from a key of `key_type`
    pub fn supported_for(key_type: KeyType) -> &'static [Chain] {
        match key_type {
            KeyType::Ecdsa => &Self::EVM,
            KeyType::Eddsa => &[Chain::Solana],
            KeyType::Taproot => &[Chain::Bitcoin],
        }
    }

    /// Stable lowercase name, matching the serialized form
    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Polygon => "polygon",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Base => "base",
            Chain::Avalanche => "avalanche",
            Chain::Bnb => "bnb",
            Chain::Bitcoin => "bitcoin",
            Chain::Solana => "solana",
            Chain::Xrpl => "xrpl",
        }
    }

    /// Whether this chain uses EVM account addresses
    pub fn is_evm(&self) -> bool {
        Self::EVM.contains(self)
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Chain {
    type Err = CustodyError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "ethereum" => Ok(Chain::Ethereum),
            "polygon" => Ok(Chain::Polygon),
            "arbitrum" => Ok(Chain::Arbitrum),
            "optimism" => Ok(Chain::Optimism),
            "base" => Ok(Chain::Base),
            "avalanche" => Ok(Chain::Avalanche),
            "bnb" => Ok(Chain::Bnb),
            "bitcoin" => Ok(Chain::Bitcoin),
            "solana" => Ok(Chain::Solana),
            "xrpl" => Ok(Chain::Xrpl),
            other => Err(CustodyError::Invalid(format!("unknown chain: {other}"))),
        }
    }
}

/// Compute Keccak256 of `data`
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak::v256();
    hasher.update(data);
    let mut out = [0u8; 32];
    hasher.finalize(&mut out);
    out
}

/// Derive the address for `chain` from an aggregated public key.
///
/// Key encodings: ECDSA keys are 33-byte compressed SEC1 points, EdDSA keys
/// are 32-byte ed25519 points, Taproot keys are 32-byte x-only points. The
/// taproot entry carries the hex output key; final bech32m presentation is
/// left to the broadcast collaborator.
pub fn derive_address(chain: Chain, key_type: KeyType, public_key: &[u8]) -> Result<String> {
    if !Chain::supported_for(key_type).contains(&chain) {
        return Err(CustodyError::Invalid(format!(
            "chain {chain} is not derivable from a {key_type} key"
        )));
    }

    match (chain, key_type) {
        (c, KeyType::Ecdsa) if c.is_evm() => evm_address(public_key),
        (Chain::Solana, KeyType::Eddsa) => {
            if public_key.len() != 32 {
                return Err(CustodyError::Invalid(format!(
                    "ed25519 public key must be 32 bytes, got {}",
                    public_key.len()
                )));
            }
            Ok(bs58::encode(public_key).into_string())
        }
        (Chain::Bitcoin, KeyType::Taproot) => {
            if public_key.len() != 32 {
                return Err(CustodyError::Invalid(format!(
                    "x-only public key must be 32 bytes, got {}",
                    public_key.len()
                )));
            }
            Ok(hex::encode(public_key))
        }
        _ => Err(CustodyError::Invalid(format!(
            "no derivation rule for {chain}/{key_type}"
        ))),
    }
}

/// Derive the full chain -> address map for a wallet key
pub fn derive_addresses(
    key_type: KeyType,
    public_key: &[u8],
) -> Result<std::collections::HashMap<Chain, String>> {
    let mut addresses = std::collections::HashMap::new();
    for chain in Chain::supported_for(key_type) {
        addresses.insert(*chain, derive_address(*chain, key_type, public_key)?);
    }
    Ok(addresses)
}

/// EVM account address: Keccak256 of the uncompressed point, last 20 bytes
fn evm_address(compressed: &[u8]) -> Result<String> {
    let encoded = EncodedPoint::from_bytes(compressed)
        .map_err(|e| CustodyError::Invalid(format!("bad secp256k1 point: {e}")))?;
    let affine = Option::<AffinePoint>::from(AffinePoint::from_encoded_point(&encoded))
        .ok_or_else(|| CustodyError::Invalid("point not on curve".into()))?;

    let uncompressed = affine.to_encoded_point(false);
    let hash = keccak256(&uncompressed.as_bytes()[1..]);
    Ok(format!("0x{}", hex::encode(&hash[12..])))
}
