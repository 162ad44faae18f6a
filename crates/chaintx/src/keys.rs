//! BIP32 extended public keys: parsing, network normalization and
//! non-hardened `0/{index}` derivation for bitcoin (BIP84) and EVM addresses.

use std::fmt;

use hmac::{Hmac, Mac};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use k256::{ProjectivePoint, PublicKey, SecretKey};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;

use crate::error::AppError;

pub const VERSION_XPUB: u32 = 0x0488_B21E;
pub const VERSION_TPUB: u32 = 0x0435_87CF;
pub const VERSION_VPUB: u32 = 0x045F_1CF6;

pub const DERIVATION_PATH_TEMPLATE: &str = "0/{index}";

const PAYLOAD_LEN: usize = 78;
const HARDENED_OFFSET: u32 = 0x8000_0000;
const MAX_NON_HARDENED_INDEX: i64 = i32::MAX as i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyErrorCode {
    InvalidKeyMaterialFormat,
    InvalidConfiguration,
    UnsupportedAllocatorTarget,
    AddressDerivationFailed,
}

impl KeyErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyErrorCode::InvalidKeyMaterialFormat => "invalid_key_material_format",
            KeyErrorCode::InvalidConfiguration => "invalid_configuration",
            KeyErrorCode::UnsupportedAllocatorTarget => "unsupported_allocator_target",
            KeyErrorCode::AddressDerivationFailed => "address_derivation_failed",
        }
    }
}

impl fmt::Display for KeyErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}")]
pub struct KeyError {
    pub code: KeyErrorCode,
    pub message: String,
}

impl KeyError {
    fn new(code: KeyErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

/// Unsupported targets are caller errors; everything else is a deployment defect.
impl From<KeyError> for AppError {
    fn from(e: KeyError) -> Self {
        let err = match e.code {
            KeyErrorCode::UnsupportedAllocatorTarget => {
                AppError::validation(e.code.as_str(), e.message.clone())
            }
            _ => AppError::internal(e.code.as_str(), e.message.clone()),
        };
        err.with("reason", e.message)
    }
}

fn format_err(message: &str) -> KeyError {
    KeyError::new(KeyErrorCode::InvalidKeyMaterialFormat, message)
}

fn config_err(message: &str) -> KeyError {
    KeyError::new(KeyErrorCode::InvalidConfiguration, message)
}

fn derive_err(message: &str) -> KeyError {
    KeyError::new(KeyErrorCode::AddressDerivationFailed, message)
}

/// Decoded 78-byte BIP32 extended public key.
#[derive(Clone, PartialEq, Eq)]
pub struct ExtendedPublicKey {
    pub version: u32,
    pub depth: u8,
    pub parent_fingerprint: u32,
    pub child_number: u32,
    pub chain_code: [u8; 32],
    pub public_key: [u8; 33],
}

impl fmt::Debug for ExtendedPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtendedPublicKey")
            .field("version", &format_args!("{:#010x}", self.version))
            .field("depth", &self.depth)
            .field("child_number", &self.child_number)
            .finish_non_exhaustive()
    }
}

impl ExtendedPublicKey {
    pub fn parse(serialized: &str) -> Result<Self, KeyError> {
        let payload = bs58::decode(serialized.trim())
            .with_check(None)
            .into_vec()
            .map_err(|_| format_err("invalid extended public key encoding"))?;
        if payload.len() != PAYLOAD_LEN {
            return Err(format_err("invalid extended public key payload length"));
        }

        let version = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if !matches!(version, VERSION_XPUB | VERSION_TPUB | VERSION_VPUB) {
            return Err(format_err("unsupported extended public key version"));
        }

        let key_data = &payload[45..78];
        if key_data[0] != 0x02 && key_data[0] != 0x03 {
            return Err(format_err("extended public key data is invalid"));
        }
        PublicKey::from_sec1_bytes(key_data)
            .map_err(|_| format_err("extended public key point is invalid"))?;

        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(&payload[13..45]);
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(key_data);

        Ok(Self {
            version,
            depth: payload[4],
            parent_fingerprint: u32::from_be_bytes([payload[5], payload[6], payload[7], payload[8]]),
            child_number: u32::from_be_bytes([payload[9], payload[10], payload[11], payload[12]]),
            chain_code,
            public_key,
        })
    }

    pub fn serialize(&self) -> String {
        let mut payload = Vec::with_capacity(PAYLOAD_LEN);
        payload.extend_from_slice(&self.version.to_be_bytes());
        payload.push(self.depth);
        payload.extend_from_slice(&self.parent_fingerprint.to_be_bytes());
        payload.extend_from_slice(&self.child_number.to_be_bytes());
        payload.extend_from_slice(&self.chain_code);
        payload.extend_from_slice(&self.public_key);
        bs58::encode(payload).with_check().into_string()
    }

    /// Depth 3 with a hardened child number, i.e. `m/purpose'/coin'/account'`.
    pub fn validate_account_level(&self) -> Result<(), KeyError> {
        if self.depth != 3 {
            return Err(config_err(
                "extended public key depth must be 3 (account-level)",
            ));
        }
        if self.child_number < HARDENED_OFFSET {
            return Err(config_err(
                "extended public key child number must be hardened account index",
            ));
        }
        Ok(())
    }

    fn derive_child(&self, index: u32) -> Result<Self, KeyError> {
        if index >= HARDENED_OFFSET {
            return Err(config_err(
                "hardened child derivation is not allowed for public key derivation",
            ));
        }
        let parent = PublicKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| format_err("parent public key is invalid"))?;

        let mut mac = Hmac::<Sha512>::new_from_slice(&self.chain_code)
            .map_err(|_| derive_err("chain code rejected by HMAC-SHA512"))?;
        mac.update(&self.public_key);
        mac.update(&index.to_be_bytes());
        let digest = mac.finalize().into_bytes();
        let (il, ir) = digest.split_at(32);

        // SecretKey rejects zero and values >= n.
        let tweak = SecretKey::from_slice(il)
            .map_err(|_| derive_err("child derivation produced invalid scalar"))?;
        let point = ProjectivePoint::GENERATOR * *tweak.to_nonzero_scalar()
            + parent.to_projective();
        let child = PublicKey::from_affine(point.to_affine())
            .map_err(|_| derive_err("child derivation produced point at infinity"))?;

        let encoded = child.to_encoded_point(true);
        let mut public_key = [0u8; 33];
        public_key.copy_from_slice(encoded.as_bytes());
        let mut chain_code = [0u8; 32];
        chain_code.copy_from_slice(ir);

        let parent_hash = hash160(&self.public_key);
        Ok(Self {
            version: self.version,
            depth: self.depth.wrapping_add(1),
            parent_fingerprint: u32::from_be_bytes([
                parent_hash[0],
                parent_hash[1],
                parent_hash[2],
                parent_hash[3],
            ]),
            child_number: index,
            chain_code,
            public_key,
        })
    }

    /// Derive `self/0/index` after validating the template and index range.
    pub fn derive_by_template(&self, template: &str, index: i64) -> Result<Self, KeyError> {
        validate_derivation_template(template)?;
        if index < 0 {
            return Err(config_err("derivation index must be non-negative"));
        }
        if index > MAX_NON_HARDENED_INDEX {
            return Err(derive_err(
                "derivation index exceeds non-hardened BIP32 range",
            ));
        }
        self.derive_child(0)?.derive_child(index as u32)
    }

    /// 64-byte uncompressed point without the 0x04 prefix.
    fn uncompressed_xy(&self) -> Result<Vec<u8>, KeyError> {
        let key = PublicKey::from_sec1_bytes(&self.public_key)
            .map_err(|_| derive_err("failed to parse derived public key"))?;
        let encoded = key.to_encoded_point(false);
        Ok(encoded.as_bytes()[1..].to_vec())
    }
}

pub fn validate_derivation_template(template: &str) -> Result<(), KeyError> {
    let trimmed = template.trim();
    if trimmed.contains('\'') || trimmed.to_ascii_lowercase().contains('h') {
        return Err(config_err(
            "derivation path template must not contain hardened segments",
        ));
    }
    if trimmed != DERIVATION_PATH_TEMPLATE {
        return Err(config_err(
            "derivation path template must be exactly 0/{index}",
        ));
    }
    Ok(())
}

pub fn hash160(input: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(input);
    let digest = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&digest);
    out
}

/// Parse a bitcoin keyset and relabel it as tpub. Version bytes do not
/// affect derivation; the address network comes from the catalog target.
pub fn normalize_bitcoin_keyset(raw: &str) -> Result<(ExtendedPublicKey, String), KeyError> {
    let mut key = ExtendedPublicKey::parse(raw)?;
    key.version = VERSION_TPUB;
    let serialized = key.serialize();
    Ok((key, serialized))
}

/// Parse an EVM keyset (xpub or tpub) and relabel it as xpub.
pub fn normalize_evm_keyset(raw: &str) -> Result<(ExtendedPublicKey, String), KeyError> {
    let mut key = ExtendedPublicKey::parse(raw)?;
    match key.version {
        VERSION_XPUB | VERSION_TPUB => {
            key.version = VERSION_XPUB;
            let serialized = key.serialize();
            Ok((key, serialized))
        }
        _ => Err(format_err("evm keyset must use xpub or tpub")),
    }
}

fn bitcoin_hrp(network: &str) -> Result<bech32::Hrp, KeyError> {
    match network.trim().to_ascii_lowercase().as_str() {
        "mainnet" => Ok(bech32::hrp::BC),
        "testnet" => Ok(bech32::hrp::TB),
        "regtest" => Ok(bech32::hrp::BCRT),
        _ => Err(KeyError::new(
            KeyErrorCode::UnsupportedAllocatorTarget,
            "unsupported bitcoin network",
        )),
    }
}

/// Lowercase bech32 P2WPKH address for `key/0/index`.
pub fn derive_bitcoin_p2wpkh_address(
    key: &ExtendedPublicKey,
    network: &str,
    template: &str,
    index: i64,
) -> Result<String, KeyError> {
    if key.version != VERSION_TPUB {
        return Err(format_err("bitcoin derivation expects normalized tpub key"));
    }
    let child = key.derive_by_template(template, index)?;
    let program = hash160(&child.public_key);
    let hrp = bitcoin_hrp(network)?;
    let address = bech32::segwit::encode_v0(hrp, &program)
        .map_err(|_| derive_err("failed to encode segwit address"))?;
    Ok(address.to_ascii_lowercase())
}

/// Lowercase `0x` EVM address for `key/0/index`.
pub fn derive_evm_address(
    key: &ExtendedPublicKey,
    template: &str,
    index: i64,
) -> Result<String, KeyError> {
    if key.version != VERSION_XPUB {
        return Err(format_err("evm derivation expects normalized xpub key"));
    }
    let child = key.derive_by_template(template, index)?;
    let digest = alloy::primitives::keccak256(child.uncompressed_xy()?);
    Ok(format!("0x{}", hex::encode(&digest[12..])))
}

/// Supported `(chain, network, scheme)` address derivation in one call.
/// Returns the storage-canonical (lowercase) address.
pub fn derive_address(
    chain: &str,
    network: &str,
    address_scheme: &str,
    extended_public_key: &str,
    index: i64,
) -> Result<String, KeyError> {
    match (chain, address_scheme) {
        ("bitcoin", "bip84_p2wpkh") => {
            let (key, _) = normalize_bitcoin_keyset(extended_public_key)?;
            key.validate_account_level()?;
            derive_bitcoin_p2wpkh_address(&key, network, DERIVATION_PATH_TEMPLATE, index)
        }
        ("ethereum", "evm_bip44") => {
            let (key, _) = normalize_evm_keyset(extended_public_key)?;
            key.validate_account_level()?;
            derive_evm_address(&key, DERIVATION_PATH_TEMPLATE, index)
        }
        _ => Err(KeyError::new(
            KeyErrorCode::UnsupportedAllocatorTarget,
            format!("unsupported allocator target {chain}/{address_scheme}"),
        )),
    }
}
