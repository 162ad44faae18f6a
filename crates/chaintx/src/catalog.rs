//! Startup integrity checks for the enabled asset catalog.

use std::collections::{BTreeMap, BTreeSet};

use serde_json::{Map, Value};

use crate::error::{AppError, AppResult};
use crate::keys::{self, KeyError, KeyErrorCode};
use crate::validation::is_expiry_in_range;
use crate::wallet::{AllocationMode, CHAIN_BITCOIN, CHAIN_ETHEREUM};

/// Wallet columns joined onto a catalog row. Absent when the FK dangles.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogWalletSnapshot {
    pub id: String,
    pub chain: String,
    pub network: String,
    pub keyset_id: Option<String>,
    pub derivation_path_template: Option<String>,
    pub next_index: Option<i64>,
    pub is_active: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CatalogIntegrityRow {
    pub chain: String,
    pub network: String,
    pub asset: String,
    pub wallet_account_id: String,
    pub address_scheme: String,
    pub default_expires_in_seconds: i64,
    pub chain_id: Option<i64>,
    pub token_standard: Option<String>,
    pub token_contract: Option<String>,
    pub token_decimals: Option<i32>,
    pub wallet: Option<CatalogWalletSnapshot>,
}

/// Rules the catalog is checked against.
#[derive(Debug, Clone)]
pub struct CatalogIntegrityPolicy {
    pub allocation_mode: AllocationMode,
    pub devtest_allow_mainnet: bool,
    pub devtest_keysets: BTreeMap<String, String>,
    pub address_scheme_allow_list: BTreeMap<String, BTreeSet<String>>,
}

impl CatalogIntegrityPolicy {
    fn scheme_allowed(&self, chain: &str, scheme: &str) -> bool {
        self.address_scheme_allow_list
            .get(chain)
            .is_some_and(|schemes| schemes.contains(scheme))
    }
}

fn invalid(message: &str, details: &Map<String, Value>) -> AppError {
    let mut err = AppError::internal("invalid_configuration", message);
    err.metadata = details.clone();
    err
}

/// Key problems found at startup are all deployment defects.
fn key_error(e: KeyError, details: &Map<String, Value>) -> AppError {
    let code = match e.code {
        KeyErrorCode::InvalidKeyMaterialFormat => "invalid_key_material_format",
        KeyErrorCode::AddressDerivationFailed => "address_derivation_failed",
        KeyErrorCode::InvalidConfiguration | KeyErrorCode::UnsupportedAllocatorTarget => {
            "invalid_configuration"
        }
    };
    let mut err = AppError::internal(code, e.message.clone());
    err.metadata = details.clone();
    err.with("reason", e.message)
}

/// Validate every enabled row. The first violation aborts startup.
pub fn validate_catalog_rows(
    rows: &[CatalogIntegrityRow],
    policy: &CatalogIntegrityPolicy,
) -> AppResult<()> {
    if policy.allocation_mode == AllocationMode::Prod {
        return Err(AppError::internal(
            "wallet_allocation_not_implemented",
            "production wallet allocation gateway is not configured",
        )
        .with("allocation_mode", policy.allocation_mode.as_str()));
    }
    for row in rows {
        validate_row(row, policy)?;
    }
    Ok(())
}

fn validate_row(row: &CatalogIntegrityRow, policy: &CatalogIntegrityPolicy) -> AppResult<()> {
    let chain = row.chain.trim().to_ascii_lowercase();
    let network = row.network.trim().to_ascii_lowercase();
    let scheme = row.address_scheme.trim().to_ascii_lowercase();

    let mut details = Map::new();
    details.insert("chain".into(), chain.clone().into());
    details.insert("network".into(), network.clone().into());
    details.insert("asset".into(), row.asset.trim().to_ascii_uppercase().into());
    details.insert(
        "wallet_account_id".into(),
        row.wallet_account_id.trim().to_string().into(),
    );

    let wallet = match &row.wallet {
        Some(w) if !w.id.trim().is_empty() => w,
        _ => {
            return Err(invalid(
                "enabled asset catalog row references missing wallet account",
                &details,
            ))
        }
    };
    if !wallet.is_active {
        return Err(invalid(
            "enabled asset catalog row references inactive wallet account",
            &details,
        ));
    }
    let wallet_chain = wallet.chain.trim().to_ascii_lowercase();
    let wallet_network = wallet.network.trim().to_ascii_lowercase();
    if wallet_chain != chain || wallet_network != network {
        return Err(
            invalid("wallet account chain/network mismatch with asset catalog row", &details)
                .with("wallet_chain", wallet_chain)
                .with("wallet_network", wallet_network),
        );
    }
    if !is_expiry_in_range(row.default_expires_in_seconds) {
        return Err(
            invalid("default_expires_in_seconds is out of allowed range", &details)
                .with("default_expires_in_seconds", row.default_expires_in_seconds),
        );
    }
    if !policy.scheme_allowed(&chain, &scheme) {
        return Err(invalid("address_scheme is not allowed for chain", &details)
            .with("address_scheme", scheme));
    }
    if chain == CHAIN_ETHEREUM && row.chain_id.is_none() {
        return Err(invalid("ethereum catalog row must define chain_id", &details));
    }
    if row.token_standard.is_some() {
        if row.token_contract.is_none() || row.token_decimals.is_none() {
            return Err(invalid("token asset row is missing token metadata", &details));
        }
    } else if row.token_contract.is_some() || row.token_decimals.is_some() {
        return Err(invalid(
            "native asset row must not include token metadata",
            &details,
        ));
    }
    match wallet.next_index {
        Some(n) if n >= 0 => {}
        _ => {
            return Err(invalid(
                "wallet account next_index must be non-negative",
                &details,
            ))
        }
    }
    let template = wallet
        .derivation_path_template
        .as_deref()
        .map(str::trim)
        .ok_or_else(|| {
            invalid(
                "wallet account derivation_path_template is required",
                &details,
            )
        })?;
    keys::validate_derivation_template(template).map_err(|e| key_error(e, &details))?;

    let keyset_id = wallet
        .keyset_id
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| invalid("wallet account keyset_id is required", &details))?;
    details.insert("keyset_id".into(), keyset_id.into());

    validate_devtest_row(&chain, &network, keyset_id, policy, &details)
}

fn validate_devtest_row(
    chain: &str,
    network: &str,
    keyset_id: &str,
    policy: &CatalogIntegrityPolicy,
    details: &Map<String, Value>,
) -> AppResult<()> {
    if network == "mainnet" && !policy.devtest_allow_mainnet {
        return Err(invalid(
            "devtest mode blocks enabled mainnet allocator rows unless override is enabled",
            details,
        ));
    }
    let raw_key = policy
        .devtest_keysets
        .get(keyset_id)
        .map(|k| k.trim())
        .filter(|k| !k.is_empty())
        .ok_or_else(|| invalid("devtest keyset is missing for wallet account", details))?;
    let parsed = match chain {
        CHAIN_BITCOIN => keys::normalize_bitcoin_keyset(raw_key),
        CHAIN_ETHEREUM => keys::normalize_evm_keyset(raw_key),
        _ => {
            return Err(invalid(
                "unsupported chain for devtest keyset validation",
                details,
            ))
        }
    };
    let (key, _) = parsed.map_err(|e| key_error(e, details))?;
    key.validate_account_level()
        .map_err(|e| key_error(e, details))
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";

    fn policy() -> CatalogIntegrityPolicy {
        CatalogIntegrityPolicy {
            allocation_mode: AllocationMode::Devtest,
            devtest_allow_mainnet: false,
            devtest_keysets: BTreeMap::from([("ks_btc".to_string(), REGTEST_TPUB.to_string())]),
            address_scheme_allow_list: BTreeMap::from([(
                "bitcoin".to_string(),
                BTreeSet::from(["bip84_p2wpkh".to_string()]),
            )]),
        }
    }

    fn row() -> CatalogIntegrityRow {
        CatalogIntegrityRow {
            chain: "bitcoin".into(),
            network: "regtest".into(),
            asset: "BTC".into(),
            wallet_account_id: "wa_btc".into(),
            address_scheme: "bip84_p2wpkh".into(),
            default_expires_in_seconds: 3600,
            chain_id: None,
            token_standard: None,
            token_contract: None,
            token_decimals: None,
            wallet: Some(CatalogWalletSnapshot {
                id: "wa_btc".into(),
                chain: "bitcoin".into(),
                network: "regtest".into(),
                keyset_id: Some("ks_btc".into()),
                derivation_path_template: Some("0/{index}".into()),
                next_index: Some(0),
                is_active: true,
            }),
        }
    }

    fn message_for(mutate: impl FnOnce(&mut CatalogIntegrityRow)) -> String {
        let mut r = row();
        mutate(&mut r);
        validate_catalog_rows(&[r], &policy()).unwrap_err().message
    }

    #[test]
    fn healthy_row_passes() {
        validate_catalog_rows(&[row()], &policy()).unwrap();
    }

    #[test]
    fn wallet_binding_violations() {
        assert_eq!(
            message_for(|r| r.wallet = None),
            "enabled asset catalog row references missing wallet account"
        );
        assert_eq!(
            message_for(|r| r.wallet.as_mut().unwrap().is_active = false),
            "enabled asset catalog row references inactive wallet account"
        );
        assert_eq!(
            message_for(|r| r.wallet.as_mut().unwrap().network = "testnet".into()),
            "wallet account chain/network mismatch with asset catalog row"
        );
        assert_eq!(
            message_for(|r| r.wallet.as_mut().unwrap().next_index = Some(-1)),
            "wallet account next_index must be non-negative"
        );
        assert_eq!(
            message_for(|r| r.wallet.as_mut().unwrap().keyset_id = None),
            "wallet account keyset_id is required"
        );
    }

    #[test]
    fn row_shape_violations() {
        assert_eq!(
            message_for(|r| r.default_expires_in_seconds = 59),
            "default_expires_in_seconds is out of allowed range"
        );
        assert_eq!(
            message_for(|r| r.address_scheme = "legacy_p2pkh".into()),
            "address_scheme is not allowed for chain"
        );
        assert_eq!(
            message_for(|r| r.token_standard = Some("ERC20".into())),
            "token asset row is missing token metadata"
        );
        assert_eq!(
            message_for(|r| r.token_decimals = Some(6)),
            "native asset row must not include token metadata"
        );
    }

    #[test]
    fn template_errors_come_from_key_validation() {
        let mut r = row();
        r.wallet.as_mut().unwrap().derivation_path_template = Some("0'/{index}".into());
        let err = validate_catalog_rows(&[r], &policy()).unwrap_err();
        assert_eq!(err.code, "invalid_configuration");
        assert!(err.metadata.contains_key("reason"));
    }

    #[test]
    fn devtest_keyset_rules() {
        let mut r = row();
        r.network = "mainnet".into();
        r.wallet.as_mut().unwrap().network = "mainnet".into();
        let err = validate_catalog_rows(&[r], &policy()).unwrap_err();
        assert!(err.message.contains("blocks enabled mainnet"));

        assert_eq!(
            message_for(|r| r.wallet.as_mut().unwrap().keyset_id = Some("ks_other".into())),
            "devtest keyset is missing for wallet account"
        );

        let mut p = policy();
        p.devtest_keysets.insert("ks_btc".into(), "not-a-key".into());
        let err = validate_catalog_rows(&[row()], &p).unwrap_err();
        assert_eq!(err.code, "invalid_key_material_format");
    }

    #[test]
    fn prod_mode_fails_startup() {
        let mut p = policy();
        p.allocation_mode = AllocationMode::Prod;
        let err = validate_catalog_rows(&[row()], &p).unwrap_err();
        assert_eq!(err.code, "wallet_allocation_not_implemented");
    }
}
