//! Payment address allocation backends.
//!
//! `devtest` derives addresses from account-level public keys supplied in
//! configuration. `prod` is reserved for a custody-backed gateway and refuses
//! every allocation.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::address::{format_for_response, normalize_for_storage};
use crate::domain::{ResolvePaymentAddressInput, ResolvePaymentAddressOutput};
use crate::error::{AppError, AppResult};
use crate::keys::{self, KeyError};
use crate::ports::PaymentAddressAllocator;

pub const CHAIN_BITCOIN: &str = "bitcoin";
pub const CHAIN_ETHEREUM: &str = "ethereum";
pub const SCHEME_BIP84_P2WPKH: &str = "bip84_p2wpkh";
pub const SCHEME_EVM_BIP44: &str = "evm_bip44";

const BITCOIN_NETWORKS: &[&str] = &["mainnet", "testnet", "regtest"];
const ETHEREUM_NETWORKS: &[&str] = &["mainnet", "sepolia", "local"];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    Devtest,
    Prod,
}

impl AllocationMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AllocationMode::Devtest => "devtest",
            AllocationMode::Prod => "prod",
        }
    }
}

impl fmt::Display for AllocationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AllocationMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "devtest" => Ok(AllocationMode::Devtest),
            "prod" => Ok(AllocationMode::Prod),
            other => Err(format!("unknown allocation mode: {other}")),
        }
    }
}

/// EVM chain id for a supported ethereum network.
pub fn evm_chain_id(network: &str) -> Option<i64> {
    match network {
        "mainnet" => Some(1),
        "sepolia" => Some(11_155_111),
        "local" => Some(31_337),
        _ => None,
    }
}

pub fn is_supported_network(chain: &str, network: &str) -> bool {
    match chain {
        CHAIN_BITCOIN => BITCOIN_NETWORKS.contains(&network),
        CHAIN_ETHEREUM => ETHEREUM_NETWORKS.contains(&network),
        _ => false,
    }
}

/// Derives addresses from configured account-level extended public keys.
#[derive(Clone)]
pub struct DevtestAllocator {
    allow_mainnet: bool,
    keysets: BTreeMap<String, String>,
}

impl fmt::Debug for DevtestAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DevtestAllocator")
            .field("allow_mainnet", &self.allow_mainnet)
            .field("keysets", &self.keysets.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl DevtestAllocator {
    pub fn new(allow_mainnet: bool, keysets: &BTreeMap<String, String>) -> Self {
        let keysets = keysets
            .iter()
            .map(|(id, key)| (id.trim().to_string(), key.trim().to_string()))
            .filter(|(id, _)| !id.is_empty())
            .collect();
        Self {
            allow_mainnet,
            keysets,
        }
    }

    /// Storage-canonical address for the slot.
    pub fn derive(&self, input: &ResolvePaymentAddressInput) -> AppResult<String> {
        let chain = input.chain.trim().to_ascii_lowercase();
        let network = input.network.trim().to_ascii_lowercase();
        let scheme = input.address_scheme.trim().to_ascii_lowercase();

        if network == "mainnet" && !self.allow_mainnet {
            return Err(AppError::validation(
                "mainnet_allocation_blocked",
                "devtest mode blocks mainnet allocations by default",
            )
            .with("chain", chain)
            .with("network", network));
        }

        let raw_key = self
            .keysets
            .get(input.keyset_id.trim())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                AppError::internal(
                    "invalid_configuration",
                    "keyset_id is not configured for devtest wallet allocation",
                )
                .with("keyset_id", input.keyset_id.clone())
                .with("chain", chain.clone())
                .with("network", network.clone())
            })?;

        let expected_scheme = match chain.as_str() {
            CHAIN_BITCOIN => SCHEME_BIP84_P2WPKH,
            CHAIN_ETHEREUM => SCHEME_EVM_BIP44,
            _ => {
                return Err(AppError::validation(
                    "unsupported_allocator_target",
                    "unsupported chain for wallet allocation",
                )
                .with("chain", chain))
            }
        };
        if scheme != expected_scheme {
            return Err(AppError::internal(
                "invalid_configuration",
                format!("{chain} address scheme is not allowed for devtest allocator"),
            )
            .with("address_scheme", input.address_scheme.clone())
            .with("chain", chain));
        }
        if !is_supported_network(&chain, &network) {
            return Err(AppError::validation(
                "unsupported_allocator_target",
                format!("unsupported {chain} network for devtest allocator"),
            )
            .with("network", network));
        }

        let derived: Result<String, KeyError> = if chain == CHAIN_BITCOIN {
            keys::normalize_bitcoin_keyset(raw_key).and_then(|(key, _)| {
                key.validate_account_level()?;
                keys::derive_bitcoin_p2wpkh_address(
                    &key,
                    &network,
                    &input.derivation_path_template,
                    input.derivation_index,
                )
            })
        } else {
            keys::normalize_evm_keyset(raw_key).and_then(|(key, _)| {
                key.validate_account_level()?;
                keys::derive_evm_address(
                    &key,
                    &input.derivation_path_template,
                    input.derivation_index,
                )
            })
        };
        Ok(derived?)
    }
}

/// The allocator selected at composition time.
#[derive(Debug, Clone)]
pub enum WalletAllocator {
    Devtest(DevtestAllocator),
    Prod,
}

impl WalletAllocator {
    pub fn mode(&self) -> AllocationMode {
        match self {
            WalletAllocator::Devtest(_) => AllocationMode::Devtest,
            WalletAllocator::Prod => AllocationMode::Prod,
        }
    }
}

#[async_trait]
impl PaymentAddressAllocator for WalletAllocator {
    async fn resolve(
        &self,
        input: &ResolvePaymentAddressInput,
    ) -> AppResult<ResolvePaymentAddressOutput> {
        let raw = match self {
            WalletAllocator::Devtest(allocator) => allocator.derive(input)?,
            WalletAllocator::Prod => {
                return Err(AppError::internal(
                    "wallet_allocation_not_implemented",
                    "production wallet allocation gateway is not configured",
                ))
            }
        };
        let address_canonical = normalize_for_storage(&input.chain, &raw)?;
        let address = format_for_response(&input.chain, &address_canonical)?;
        Ok(ResolvePaymentAddressOutput {
            address_canonical,
            address,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::DERIVATION_PATH_TEMPLATE;

    const REGTEST_TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";
    const EVM_XPUB: &str = "xpub6BfCU6SeCoGM26Ex6YKnPku57sABcfGprMzPzonYwDPi6Yd6ooHG72cvEC7XKgK1o7nUnyxydj11mXbvhHanRcRVoGhpYYuWJ3gRhPCmQKj";

    fn allocator(allow_mainnet: bool) -> WalletAllocator {
        let keysets = BTreeMap::from([
            ("ks_btc".to_string(), REGTEST_TPUB.to_string()),
            ("ks_evm".to_string(), EVM_XPUB.to_string()),
        ]);
        WalletAllocator::Devtest(DevtestAllocator::new(allow_mainnet, &keysets))
    }

    fn input(chain: &str, network: &str, scheme: &str, keyset: &str) -> ResolvePaymentAddressInput {
        ResolvePaymentAddressInput {
            chain: chain.into(),
            network: network.into(),
            address_scheme: scheme.into(),
            keyset_id: keyset.into(),
            derivation_path_template: DERIVATION_PATH_TEMPLATE.into(),
            derivation_index: 0,
            chain_id: None,
        }
    }

    #[tokio::test]
    async fn derives_bitcoin_regtest() {
        let out = allocator(false)
            .resolve(&input("bitcoin", "regtest", "bip84_p2wpkh", "ks_btc"))
            .await
            .unwrap();
        assert_eq!(
            out.address_canonical,
            "bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg"
        );
        assert_eq!(out.address, out.address_canonical);
    }

    #[tokio::test]
    async fn evm_response_is_checksummed() {
        let out = allocator(false)
            .resolve(&input("ethereum", "sepolia", "evm_bip44", "ks_evm"))
            .await
            .unwrap();
        assert_eq!(
            out.address_canonical,
            "0x61ed32e69db70c5abab0522d80e8f5db215965de"
        );
        assert_eq!(out.address.to_ascii_lowercase(), out.address_canonical);
        assert_ne!(out.address, out.address_canonical);
    }

    #[tokio::test]
    async fn mainnet_is_blocked_unless_allowed() {
        let err = allocator(false)
            .resolve(&input("bitcoin", "mainnet", "bip84_p2wpkh", "ks_btc"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "mainnet_allocation_blocked");
        assert_eq!(err.kind, crate::error::ErrorKind::Validation);

        let out = allocator(true)
            .resolve(&input("bitcoin", "mainnet", "bip84_p2wpkh", "ks_btc"))
            .await
            .unwrap();
        assert!(out.address.starts_with("bc1q"));
    }

    #[tokio::test]
    async fn configuration_failures_are_internal() {
        let err = allocator(false)
            .resolve(&input("bitcoin", "regtest", "bip84_p2wpkh", "missing"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_configuration");
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);

        let err = allocator(false)
            .resolve(&input("bitcoin", "regtest", "evm_bip44", "ks_btc"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "invalid_configuration");
    }

    #[tokio::test]
    async fn unsupported_targets_are_validation() {
        let err = allocator(false)
            .resolve(&input("solana", "devnet", "ed25519", "ks_btc"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "unsupported_allocator_target");

        let err = allocator(false)
            .resolve(&input("ethereum", "holesky", "evm_bip44", "ks_evm"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "unsupported_allocator_target");
    }

    #[tokio::test]
    async fn prod_refuses() {
        let err = WalletAllocator::Prod
            .resolve(&input("bitcoin", "regtest", "bip84_p2wpkh", "ks_btc"))
            .await
            .unwrap_err();
        assert_eq!(err.code, "wallet_allocation_not_implemented");
    }

    #[test]
    fn chain_ids() {
        assert_eq!(evm_chain_id("mainnet"), Some(1));
        assert_eq!(evm_chain_id("sepolia"), Some(11_155_111));
        assert_eq!(evm_chain_id("local"), Some(31_337));
        assert_eq!(evm_chain_id("regtest"), None);
    }
}
