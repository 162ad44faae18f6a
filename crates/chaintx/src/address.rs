//! Address canonicalization: storage form and response form per chain.

use std::sync::LazyLock;

use alloy::primitives::Address;
use regex::Regex;

use crate::error::{AppError, AppResult};

static EVM_ADDRESS: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0x[0-9a-fA-F]{40}$").expect("valid regex"));
static BTC_BECH32: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(bc1|tb1|bcrt1)[qpzry9x8gf2tvdw0s3jn54khce6mua7l]{11,87}$").expect("valid regex")
});
static BTC_BASE58: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz]{26,35}$")
        .expect("valid regex")
});

fn invalid(message: &str) -> AppError {
    AppError::validation("invalid_request", message).with("field", "address")
}

/// Normalize an address to the form stored in `address_canonical`.
pub fn normalize_for_storage(chain: &str, address: &str) -> AppResult<String> {
    let trimmed = address.trim();
    if trimmed.is_empty() {
        return Err(invalid("address is required"));
    }

    match chain {
        "ethereum" => {
            if !EVM_ADDRESS.is_match(trimmed) {
                return Err(invalid("ethereum address is invalid"));
            }
            Ok(format!("0x{}", trimmed[2..].to_ascii_lowercase()))
        }
        "bitcoin" => {
            let lower = trimmed.to_ascii_lowercase();
            if lower.starts_with("bc1") || lower.starts_with("tb1") || lower.starts_with("bcrt1") {
                if !BTC_BECH32.is_match(&lower) {
                    return Err(invalid("bitcoin bech32 address is invalid"));
                }
                return Ok(lower);
            }
            if !BTC_BASE58.is_match(trimmed) {
                return Err(invalid("bitcoin base58 address is invalid"));
            }
            Ok(trimmed.to_string())
        }
        other => Err(AppError::validation(
            "unsupported_network",
            "unsupported chain for address canonicalization",
        )
        .with("chain", other)),
    }
}

/// Format a stored canonical address for API responses.
pub fn format_for_response(chain: &str, canonical: &str) -> AppResult<String> {
    match chain {
        "ethereum" => to_eip55(canonical),
        "bitcoin" => Ok(canonical.to_string()),
        other => Err(AppError::internal(
            "address_chain_unsupported",
            "address chain is not supported for response formatting",
        )
        .with("chain", other)),
    }
}

/// EIP-55 mixed-case checksum of an EVM address in any case.
pub fn to_eip55(address: &str) -> AppResult<String> {
    let trimmed = address.trim();
    let hex_part = trimmed.strip_prefix("0x").unwrap_or(trimmed);
    let normalized = format!("0x{}", hex_part.to_ascii_lowercase());
    if !EVM_ADDRESS.is_match(&normalized) {
        return Err(AppError::internal(
            "address_canonical_invalid",
            "canonical ethereum address is invalid",
        )
        .with("address", address));
    }
    let bytes = hex::decode(&normalized[2..]).map_err(|_| {
        AppError::internal("address_canonical_invalid", "canonical ethereum address is invalid")
            .with("address", address)
    })?;
    Ok(Address::from_slice(&bytes).to_checksum(None))
}

/// Storage form for an ERC-20 contract address.
pub fn normalize_token_contract(raw: &str) -> AppResult<String> {
    normalize_for_storage("ethereum", raw).map_err(|_| {
        AppError::validation("invalid_request", "token_contract is invalid")
            .with("field", "token_contract")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const CHECKSUMMED: [&str; 3] = [
        "0x5aAeb6053F3E94C9b9A09f33669435E7Ef1BeAed",
        "0xfB6916095ca1df60bB79Ce92cE3Ea74c37c5d359",
        "0xdbF03B407c01E7cD3CBea99509d93f8DDDC8C6FB",
    ];

    #[test]
    fn eip55_known_vectors() {
        for expected in CHECKSUMMED {
            assert_eq!(to_eip55(&expected.to_lowercase()).unwrap(), expected);
            assert_eq!(to_eip55(&expected.to_uppercase().replace("0X", "0x")).unwrap(), expected);
        }
    }

    #[test]
    fn eip55_is_idempotent() {
        for addr in CHECKSUMMED {
            let once = to_eip55(&addr.to_lowercase()).unwrap();
            assert_eq!(to_eip55(&once).unwrap(), once);
        }
    }

    #[test]
    fn evm_storage_is_lowercase() {
        let stored = normalize_for_storage("ethereum", CHECKSUMMED[0]).unwrap();
        assert_eq!(stored, CHECKSUMMED[0].to_lowercase());
        assert!(normalize_for_storage("ethereum", "0x1234").is_err());
    }

    #[test]
    fn bitcoin_bech32_lowercased() {
        let stored =
            normalize_for_storage("bitcoin", "BC1QW508D6QEJXTDG4Y5R3ZARVARY0C5XW7KV8F3T4").unwrap();
        assert_eq!(stored, "bc1qw508d6qejxtdg4y5r3zarvary0c5xw7kv8f3t4");
        assert_eq!(format_for_response("bitcoin", &stored).unwrap(), stored);
    }

    #[test]
    fn bitcoin_base58_kept_as_is() {
        let addr = "1BvBMSEYstWetqTFn5Au4m4GFg7xJaNVN2";
        assert_eq!(normalize_for_storage("bitcoin", addr).unwrap(), addr);
        assert!(normalize_for_storage("bitcoin", "0OIl").is_err());
    }

    #[test]
    fn unsupported_chain() {
        let err = normalize_for_storage("solana", "abc").unwrap_err();
        assert_eq!(err.code, "unsupported_network");
    }

    #[test]
    fn empty_address_rejected() {
        let err = normalize_for_storage("bitcoin", "  ").unwrap_err();
        assert_eq!(err.code, "invalid_request");
    }
}
