//! Startup wallet-account sync.
//!
//! For every enabled catalog target the configured key is preflighted against
//! its expected index-0 address, hashed with the active and previous HMAC
//! secrets, and matched against stored wallet accounts. The store then reuses,
//! reactivates or rotates the target's wallet in one transaction.

use std::collections::{BTreeMap, HashMap, HashSet};

use chrono::{DateTime, Utc};

use crate::clock::Clock;
use crate::config::KeysetPreflightEntry;
use crate::domain::{
    HashMatchSource, KeysetTarget, SelectedFrom, WalletAccount, WalletSyncAction,
    KEY_HASH_ALGO_HMAC_SHA256,
};
use crate::error::{AppError, AppResult};
use crate::hmac::key_material_hash;
use crate::keys::{self, KeyError, KeyErrorCode, DERIVATION_PATH_TEMPLATE};
use crate::ports::WalletAccountSyncRepository;
use crate::wallet::{CHAIN_BITCOIN, CHAIN_ETHEREUM};

#[derive(Clone, PartialEq, Eq)]
pub struct WalletSyncSecrets {
    pub active: String,
    pub previous: Vec<String>,
}

impl std::fmt::Debug for WalletSyncSecrets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalletSyncSecrets")
            .field("active", &"[REDACTED]")
            .field("previous", &self.previous.len())
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashCandidate {
    pub hash: String,
    pub source: HashMatchSource,
}

/// One target's sync, ready for the store's transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSyncCommand {
    pub target: KeysetTarget,
    pub active_hash: String,
    /// Distinct from `active_hash` and from each other.
    pub legacy_hashes: Vec<String>,
    pub key_material_hash_algo: String,
    pub now: DateTime<Utc>,
}

impl WalletSyncCommand {
    pub fn new(
        target: KeysetTarget,
        key_material: &str,
        secrets: &WalletSyncSecrets,
        now: DateTime<Utc>,
    ) -> Self {
        let active_hash = key_material_hash(&secrets.active, key_material);
        let mut seen = HashSet::from([active_hash.clone()]);
        let legacy_hashes = secrets
            .previous
            .iter()
            .map(|secret| key_material_hash(secret, key_material))
            .filter(|hash| seen.insert(hash.clone()))
            .collect();
        Self {
            target,
            active_hash,
            legacy_hashes,
            key_material_hash_algo: KEY_HASH_ALGO_HMAC_SHA256.to_string(),
            now,
        }
    }

    /// Active hash first, then legacy hashes in configuration order.
    pub fn candidates(&self) -> Vec<HashCandidate> {
        std::iter::once(HashCandidate {
            hash: self.active_hash.clone(),
            source: HashMatchSource::Active,
        })
        .chain(self.legacy_hashes.iter().map(|hash| HashCandidate {
            hash: hash.clone(),
            source: HashMatchSource::Legacy,
        }))
        .collect()
    }

    /// How the active row's stored hash relates to the configured key.
    /// `None` means the row belongs to different key material.
    pub fn classify(&self, stored_hash: &str) -> Option<HashMatchSource> {
        let stored = stored_hash.trim().to_ascii_lowercase();
        if stored.is_empty() {
            Some(HashMatchSource::Unhashed)
        } else if stored == self.active_hash {
            Some(HashMatchSource::Active)
        } else if self.legacy_hashes.contains(&stored) {
            Some(HashMatchSource::Legacy)
        } else {
            None
        }
    }

    pub fn hash_prefix(&self) -> String {
        hash_prefix(&self.active_hash)
    }

    pub fn new_wallet_account_id(&self) -> String {
        generate_wallet_account_id(
            &self.target.chain,
            &self.target.network,
            &self.active_hash,
            self.now,
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSyncOutcome {
    pub action: WalletSyncAction,
    pub match_source: HashMatchSource,
    pub wallet_account_id: String,
    pub key_hash: String,
}

/// The decision for one target, made from its current wallet rows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSyncPlan {
    pub wallet_account_id: String,
    /// `true` when `wallet_account_id` is a fresh row the store must insert.
    pub create: bool,
    pub action: WalletSyncAction,
    pub match_source: HashMatchSource,
    pub selected_from: SelectedFrom,
    pub previous_active_wallet_account_id: Option<String>,
}

/// Reuse the active row if its hash matches, else reactivate the most recent
/// inactive row matching a candidate hash, else rotate to a new row.
pub fn plan_wallet_sync(command: &WalletSyncCommand, wallets: &[WalletAccount]) -> WalletSyncPlan {
    let recency = |w: &&WalletAccount| (w.updated_at, w.created_at);
    let active = wallets.iter().filter(|w| w.is_active).max_by_key(recency);
    let previous_active_wallet_account_id = active.map(|w| w.id.clone());

    if let Some((wallet, source)) =
        active.and_then(|w| command.classify(&w.key_material_hash).map(|s| (w, s)))
    {
        return WalletSyncPlan {
            wallet_account_id: wallet.id.clone(),
            create: false,
            action: WalletSyncAction::Reused,
            match_source: source,
            selected_from: SelectedFrom::Active,
            previous_active_wallet_account_id,
        };
    }

    let historical = command.candidates().into_iter().find_map(|candidate| {
        wallets
            .iter()
            .filter(|w| !w.is_active && w.key_material_hash == candidate.hash)
            .max_by_key(recency)
            .map(|w| (w, candidate.source))
    });
    match historical {
        Some((wallet, source)) => WalletSyncPlan {
            wallet_account_id: wallet.id.clone(),
            create: false,
            action: WalletSyncAction::Reactivated,
            match_source: source,
            selected_from: SelectedFrom::Historical,
            previous_active_wallet_account_id,
        },
        None => WalletSyncPlan {
            wallet_account_id: command.new_wallet_account_id(),
            create: true,
            action: WalletSyncAction::Rotated,
            match_source: HashMatchSource::Active,
            selected_from: SelectedFrom::New,
            previous_active_wallet_account_id,
        },
    }
}

pub fn hash_prefix(hash: &str) -> String {
    let normalized = hash.trim().to_ascii_lowercase();
    normalized.chars().take(12).collect()
}

/// `wa_{chain}_{network}_{hash12}_{micros:06}_{YYYYMMDDHHMMSS}`.
pub fn generate_wallet_account_id(
    chain: &str,
    network: &str,
    key_hash: &str,
    now: DateTime<Utc>,
) -> String {
    let micros = now.timestamp_subsec_micros() % 1_000_000;
    format!(
        "wa_{chain}_{network}_{}_{micros:06}_{}",
        hash_prefix(key_hash),
        now.format("%Y%m%d%H%M%S")
    )
}

fn target_error(message: &str, target: &KeysetTarget) -> AppError {
    AppError::internal("invalid_configuration", message)
        .with("chain", target.chain.clone())
        .with("network", target.network.clone())
        .with("keyset_id", target.keyset_id.clone())
}

fn preflight_key_error(e: KeyError, target: &KeysetTarget) -> AppError {
    let code = match e.code {
        KeyErrorCode::InvalidKeyMaterialFormat => "invalid_key_material_format",
        KeyErrorCode::AddressDerivationFailed => "address_derivation_failed",
        _ => "invalid_configuration",
    };
    AppError::internal(code, e.message.clone())
        .with("chain", target.chain.clone())
        .with("network", target.network.clone())
        .with("keyset_id", target.keyset_id.clone())
        .with("reason", e.message)
}

/// Derive index 0 from `raw_key` and compare, case-insensitively, with the
/// configured expectation. Returns the derived address.
pub fn verify_index_zero_preflight(
    target: &KeysetTarget,
    raw_key: &str,
    expected_address: &str,
) -> AppResult<String> {
    let derived = match target.chain.as_str() {
        CHAIN_BITCOIN => {
            let (key, _) =
                keys::normalize_bitcoin_keyset(raw_key).map_err(|e| preflight_key_error(e, target))?;
            key.validate_account_level()
                .map_err(|e| preflight_key_error(e, target))?;
            keys::derive_bitcoin_p2wpkh_address(&key, &target.network, DERIVATION_PATH_TEMPLATE, 0)
                .map_err(|e| preflight_key_error(e, target))?
        }
        CHAIN_ETHEREUM => {
            if !matches!(target.network.as_str(), "mainnet" | "sepolia" | "local") {
                return Err(target_error(
                    "unsupported ethereum network for keyset preflight",
                    target,
                ));
            }
            let (key, _) =
                keys::normalize_evm_keyset(raw_key).map_err(|e| preflight_key_error(e, target))?;
            key.validate_account_level()
                .map_err(|e| preflight_key_error(e, target))?;
            keys::derive_evm_address(&key, DERIVATION_PATH_TEMPLATE, 0)
                .map_err(|e| preflight_key_error(e, target))?
        }
        _ => return Err(target_error("unsupported chain for keyset preflight", target)),
    };

    let expected = expected_address.trim().to_ascii_lowercase();
    let derived = derived.trim().to_ascii_lowercase();
    if expected != derived {
        return Err(target_error("devtest keyset preflight mismatch", target)
            .with("expected_address", expected)
            .with("derived_address", derived));
    }
    Ok(derived)
}

fn preflight_key(chain: &str, network: &str, keyset_id: &str) -> String {
    format!("{chain}|{network}|{keyset_id}")
}

/// Run the startup sync for every enabled target. Any failure is fatal.
pub async fn sync_wallet_accounts(
    repo: &dyn WalletAccountSyncRepository,
    keysets: &BTreeMap<String, String>,
    preflights: &[KeysetPreflightEntry],
    secrets: &WalletSyncSecrets,
    clock: &dyn Clock,
) -> AppResult<Vec<WalletSyncOutcome>> {
    if secrets.active.trim().is_empty() {
        return Err(AppError::internal(
            "invalid_configuration",
            "missing keyset hash hmac secret for startup wallet sync",
        ));
    }

    let preflight_by_target: HashMap<String, &KeysetPreflightEntry> = preflights
        .iter()
        .filter(|p| {
            !p.chain.trim().is_empty()
                && !p.network.trim().is_empty()
                && !p.keyset_id.trim().is_empty()
                && !p.extended_public_key.trim().is_empty()
                && !p.expected_index0_address.trim().is_empty()
        })
        .map(|p| {
            (
                preflight_key(
                    &p.chain.trim().to_ascii_lowercase(),
                    &p.network.trim().to_ascii_lowercase(),
                    p.keyset_id.trim(),
                ),
                p,
            )
        })
        .collect();
    if preflight_by_target.is_empty() {
        return Err(AppError::internal(
            "invalid_configuration",
            "devtest startup preflight requires nested keyset entries with expected_index0_address",
        ));
    }

    let targets = repo.list_sync_targets().await?;
    if targets.is_empty() {
        tracing::info!("wallet-account startup sync skipped: no enabled catalog targets");
        return Ok(Vec::new());
    }

    let mut outcomes = Vec::with_capacity(targets.len());
    for target in targets {
        let key_material = keysets
            .get(&target.keyset_id)
            .map(|k| k.trim())
            .filter(|k| !k.is_empty())
            .ok_or_else(|| {
                target_error("devtest keyset is missing for startup wallet sync", &target)
            })?;
        let preflight = preflight_by_target
            .get(&preflight_key(&target.chain, &target.network, &target.keyset_id))
            .ok_or_else(|| target_error("missing preflight entry for enabled wallet target", &target))?;
        if preflight.extended_public_key.trim() != key_material {
            return Err(target_error(
                "preflight key material does not match keyset_id value",
                &target,
            ));
        }
        let derived =
            verify_index_zero_preflight(&target, key_material, &preflight.expected_index0_address)?;
        tracing::info!(
            chain = %target.chain,
            network = %target.network,
            keyset_id = %target.keyset_id,
            address = %derived,
            "startup keyset preflight passed"
        );

        let command = WalletSyncCommand::new(target.clone(), key_material, secrets, clock.now_utc());
        let outcome = repo.sync_target(&command).await?;
        tracing::info!(
            action = outcome.action.as_str(),
            chain = %target.chain,
            network = %target.network,
            keyset_id = %target.keyset_id,
            wallet_account_id = %outcome.wallet_account_id,
            hash_prefix = %hash_prefix(&outcome.key_hash),
            match_source = outcome.match_source.as_str(),
            "wallet-account startup sync"
        );
        outcomes.push(outcome);
    }
    tracing::info!(targets = outcomes.len(), "wallet-account startup sync completed");
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const REGTEST_TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";
    const REGTEST_INDEX0: &str = "bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg";

    fn target() -> KeysetTarget {
        KeysetTarget {
            chain: "bitcoin".into(),
            network: "regtest".into(),
            keyset_id: "ks_btc".into(),
        }
    }

    fn secrets() -> WalletSyncSecrets {
        WalletSyncSecrets {
            active: "new-secret".into(),
            previous: vec!["old-secret".into(), "new-secret".into(), "old-secret".into()],
        }
    }

    #[test]
    fn legacy_hashes_are_deduplicated() {
        let now = Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap();
        let cmd = WalletSyncCommand::new(target(), REGTEST_TPUB, &secrets(), now);
        assert_eq!(cmd.legacy_hashes.len(), 1);
        assert_eq!(cmd.candidates().len(), 2);
        assert_eq!(cmd.candidates()[0].source, HashMatchSource::Active);
        assert_eq!(cmd.key_material_hash_algo, "hmac-sha256");
    }

    #[test]
    fn classification() {
        let now = Utc::now();
        let cmd = WalletSyncCommand::new(target(), REGTEST_TPUB, &secrets(), now);
        assert_eq!(cmd.classify(""), Some(HashMatchSource::Unhashed));
        assert_eq!(
            cmd.classify(&cmd.active_hash.to_uppercase()),
            Some(HashMatchSource::Active)
        );
        assert_eq!(
            cmd.classify(&cmd.legacy_hashes[0]),
            Some(HashMatchSource::Legacy)
        );
        assert_eq!(cmd.classify("deadbeef"), None);
    }

    #[test]
    fn wallet_account_id_shape() {
        let now = Utc
            .with_ymd_and_hms(2026, 3, 1, 12, 34, 56)
            .unwrap()
            .checked_add_signed(chrono::Duration::microseconds(42))
            .unwrap();
        let id = generate_wallet_account_id("bitcoin", "regtest", "ABCDEF0123456789", now);
        assert_eq!(id, "wa_bitcoin_regtest_abcdef012345_000042_20260301123456");
    }

    fn wallet(id: &str, hash: &str, active: bool, age_secs: i64) -> WalletAccount {
        let at = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap() + chrono::Duration::seconds(age_secs);
        WalletAccount {
            id: id.into(),
            chain: "bitcoin".into(),
            network: "regtest".into(),
            keyset_id: "ks_btc".into(),
            derivation_path_template: "0/{index}".into(),
            next_index: 3,
            is_active: active,
            key_material_hash: hash.into(),
            key_material_hash_algo: "hmac-sha256".into(),
            created_at: at,
            updated_at: at,
        }
    }

    #[test]
    fn plan_prefers_matching_active_row() {
        let cmd = WalletSyncCommand::new(target(), REGTEST_TPUB, &secrets(), Utc::now());
        let plan = plan_wallet_sync(&cmd, &[wallet("wa_a", &cmd.legacy_hashes[0], true, 0)]);
        assert_eq!(plan.action, WalletSyncAction::Reused);
        assert_eq!(plan.match_source, HashMatchSource::Legacy);
        assert_eq!(plan.previous_active_wallet_account_id.as_deref(), Some("wa_a"));
        assert!(!plan.create);
    }

    #[test]
    fn plan_reactivates_newest_historical_match() {
        let cmd = WalletSyncCommand::new(target(), REGTEST_TPUB, &secrets(), Utc::now());
        let rows = [
            wallet("wa_current", "ffff", true, 30),
            wallet("wa_old", &cmd.active_hash, false, 10),
            wallet("wa_older", &cmd.active_hash, false, 0),
        ];
        let plan = plan_wallet_sync(&cmd, &rows);
        assert_eq!(plan.action, WalletSyncAction::Reactivated);
        assert_eq!(plan.wallet_account_id, "wa_old");
        assert_eq!(plan.selected_from, SelectedFrom::Historical);
        assert_eq!(plan.previous_active_wallet_account_id.as_deref(), Some("wa_current"));
    }

    #[test]
    fn plan_rotates_without_any_match() {
        let cmd = WalletSyncCommand::new(target(), REGTEST_TPUB, &secrets(), Utc::now());
        let plan = plan_wallet_sync(&cmd, &[wallet("wa_current", "ffff", true, 0)]);
        assert_eq!(plan.action, WalletSyncAction::Rotated);
        assert!(plan.create);
        assert!(plan.wallet_account_id.starts_with("wa_bitcoin_regtest_"));

        let plan = plan_wallet_sync(&cmd, &[]);
        assert!(plan.create);
        assert_eq!(plan.previous_active_wallet_account_id, None);
    }

    #[test]
    fn preflight_accepts_matching_address_case_insensitively() {
        let derived =
            verify_index_zero_preflight(&target(), REGTEST_TPUB, &REGTEST_INDEX0.to_uppercase())
                .unwrap();
        assert_eq!(derived, REGTEST_INDEX0);
    }

    #[test]
    fn preflight_mismatch_reports_both_addresses() {
        let err = verify_index_zero_preflight(&target(), REGTEST_TPUB, "bcrt1qwrong").unwrap_err();
        assert_eq!(err.message, "devtest keyset preflight mismatch");
        assert_eq!(err.metadata["derived_address"], REGTEST_INDEX0);
        assert_eq!(err.metadata["expected_address"], "bcrt1qwrong");
    }
}
