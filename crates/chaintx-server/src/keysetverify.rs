//! Offline check that an extended public key derives the expected index-0
//! address. Backs the `chaintx-keysetverify` binary.

use chaintx::keys::{derive_address, KeyErrorCode};
use chaintx::wallet::{is_supported_network, CHAIN_BITCOIN, CHAIN_ETHEREUM};
use clap::Parser;
use serde::Serialize;

pub const EXIT_MATCH: i32 = 0;
pub const EXIT_INVALID: i32 = 2;
pub const EXIT_MISMATCH: i32 = 3;

#[derive(Debug, Clone, Default, Parser)]
#[command(
    name = "chaintx-keysetverify",
    about = "Verify that an extended public key derives the expected index-0 address"
)]
pub struct VerifyArgs {
    /// bitcoin or ethereum
    #[arg(long, default_value = "")]
    pub chain: String,

    /// bitcoin: regtest, testnet, mainnet; ethereum: local, sepolia, mainnet
    #[arg(long, default_value = "")]
    pub network: String,

    /// bip84_p2wpkh for bitcoin, evm_bip44 for ethereum
    #[arg(long, default_value = "")]
    pub address_scheme: String,

    /// Label echoed back in the report
    #[arg(long, default_value = "")]
    pub keyset_id: String,

    /// Account-level xpub, tpub or vpub
    #[arg(long, default_value = "")]
    pub extended_public_key: String,

    /// Address expected at derivation index 0
    #[arg(long, default_value = "")]
    pub expected_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VerifyReport {
    #[serde(rename = "match")]
    pub matched: bool,
    pub chain: String,
    pub network: String,
    pub address_scheme: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub keyset_id: String,
    pub derivation_index: i64,
    pub expected_address: String,
    pub derived_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
}

impl VerifyReport {
    fn fail(mut self, code: &str, reason: impl Into<String>, exit: i32) -> (Self, i32) {
        self.error_code = Some(code.to_string());
        self.reason = Some(reason.into());
        (self, exit)
    }
}

fn expected_scheme(chain: &str) -> Option<&'static str> {
    match chain {
        CHAIN_BITCOIN => Some("bip84_p2wpkh"),
        CHAIN_ETHEREUM => Some("evm_bip44"),
        _ => None,
    }
}

/// Derive index 0 and compare case-insensitively. Returns the report and the
/// process exit code.
pub fn verify_index_zero(args: &VerifyArgs) -> (VerifyReport, i32) {
    let chain = args.chain.trim().to_ascii_lowercase();
    let network = args.network.trim().to_ascii_lowercase();
    let address_scheme = args.address_scheme.trim().to_ascii_lowercase();
    let extended_public_key = args.extended_public_key.trim();
    let expected_address = args.expected_address.trim().to_string();

    let report = VerifyReport {
        matched: false,
        chain: chain.clone(),
        network: network.clone(),
        address_scheme: address_scheme.clone(),
        keyset_id: args.keyset_id.trim().to_string(),
        derivation_index: 0,
        expected_address: expected_address.clone(),
        derived_address: String::new(),
        reason: None,
        error_code: None,
    };

    if [&chain, &network, &address_scheme, &expected_address]
        .iter()
        .any(|v| v.is_empty())
        || extended_public_key.is_empty()
    {
        return report.fail(
            "invalid_input",
            "missing required fields: chain, network, address-scheme, extended-public-key, expected-address",
            EXIT_INVALID,
        );
    }

    let Some(scheme) = expected_scheme(&chain) else {
        return report.fail(
            KeyErrorCode::UnsupportedAllocatorTarget.as_str(),
            "unsupported chain",
            EXIT_INVALID,
        );
    };
    if address_scheme != scheme {
        return report.fail(
            KeyErrorCode::InvalidConfiguration.as_str(),
            format!("{chain} address scheme must be {scheme}"),
            EXIT_INVALID,
        );
    }
    if !is_supported_network(&chain, &network) {
        return report.fail(
            KeyErrorCode::UnsupportedAllocatorTarget.as_str(),
            format!("unsupported {chain} network"),
            EXIT_INVALID,
        );
    }

    let derived = match derive_address(&chain, &network, &address_scheme, extended_public_key, 0) {
        Ok(address) => address.to_ascii_lowercase(),
        Err(e) => return report.fail(e.code.as_str(), e.message, EXIT_INVALID),
    };

    let mut report = VerifyReport {
        derived_address: derived.clone(),
        ..report
    };
    if expected_address.to_ascii_lowercase() != derived {
        return report.fail(
            "address_mismatch",
            "derived index-0 address does not match expected address",
            EXIT_MISMATCH,
        );
    }
    report.matched = true;
    (report, EXIT_MATCH)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGTEST_TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";
    const EVM_XPUB: &str = "xpub6BfCU6SeCoGM26Ex6YKnPku57sABcfGprMzPzonYwDPi6Yd6ooHG72cvEC7XKgK1o7nUnyxydj11mXbvhHanRcRVoGhpYYuWJ3gRhPCmQKj";

    fn btc_args(expected: &str) -> VerifyArgs {
        VerifyArgs {
            chain: "bitcoin".into(),
            network: "regtest".into(),
            address_scheme: "bip84_p2wpkh".into(),
            keyset_id: "ks_btc".into(),
            extended_public_key: REGTEST_TPUB.into(),
            expected_address: expected.into(),
        }
    }

    #[test]
    fn bitcoin_match() {
        let (report, code) = verify_index_zero(&btc_args("bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg"));
        assert_eq!(code, EXIT_MATCH);
        assert!(report.matched);
        assert_eq!(report.keyset_id, "ks_btc");
        assert!(report.error_code.is_none());
    }

    #[test]
    fn evm_match_ignores_checksum_case() {
        let args = VerifyArgs {
            chain: "Ethereum".into(),
            network: "sepolia".into(),
            address_scheme: "evm_bip44".into(),
            extended_public_key: EVM_XPUB.into(),
            expected_address: "0x61ED32E69DB70C5ABAB0522D80E8F5DB215965DE".into(),
            ..Default::default()
        };
        let (report, code) = verify_index_zero(&args);
        assert_eq!(code, EXIT_MATCH);
        assert_eq!(report.derived_address, "0x61ed32e69db70c5abab0522d80e8f5db215965de");
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["match"], true);
        assert!(json.get("keyset_id").is_none());
    }

    #[test]
    fn mismatch_exits_3() {
        let (report, code) = verify_index_zero(&btc_args("bcrt1qxyz"));
        assert_eq!(code, EXIT_MISMATCH);
        assert_eq!(report.error_code.as_deref(), Some("address_mismatch"));
        assert!(!report.derived_address.is_empty());
    }

    #[test]
    fn input_and_key_errors_exit_2() {
        let (report, code) = verify_index_zero(&VerifyArgs::default());
        assert_eq!(code, EXIT_INVALID);
        assert_eq!(report.error_code.as_deref(), Some("invalid_input"));

        let mut args = btc_args("bcrt1q");
        args.address_scheme = "evm_bip44".into();
        let (report, code) = verify_index_zero(&args);
        assert_eq!(code, EXIT_INVALID);
        assert_eq!(report.error_code.as_deref(), Some("invalid_configuration"));

        let mut args = btc_args("bcrt1q");
        args.extended_public_key = "tpubnotakey".into();
        let (report, code) = verify_index_zero(&args);
        assert_eq!(code, EXIT_INVALID);
        assert_eq!(report.error_code.as_deref(), Some("invalid_key_material_format"));

        let mut args = btc_args("bcrt1q");
        args.network = "signet".into();
        let (_, code) = verify_index_zero(&args);
        assert_eq!(code, EXIT_INVALID);
    }
}
