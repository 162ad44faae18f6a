//! Process configuration loaded from environment variables.
//!
//! Every binary calls `dotenvy::dotenv().ok()` first and then
//! [`Config::from_env`]. Parsing goes through [`Config::from_lookup`] so tests
//! can feed a map instead of mutating the process environment.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::env;
use std::time::Duration;

use serde_json::Value;
use url::Url;

use crate::validation::normalize_webhook_host_pattern;
use crate::wallet::AllocationMode;

const DEFAULT_PORT: u16 = 8080;
const DEFAULT_OPENAPI_SPEC_PATH: &str = "api/openapi.yaml";

const DEFAULT_RECONCILER_POLL_SECS: u64 = 15;
const DEFAULT_RECONCILER_BATCH_SIZE: i64 = 100;
const DEFAULT_RECONCILER_LEASE_SECS: u64 = 30;
const DEFAULT_THRESHOLD_BPS: i64 = 10_000;
const DEFAULT_MIN_CONFIRMATIONS: i64 = 1;

const DEFAULT_WEBHOOK_POLL_SECS: u64 = 10;
const DEFAULT_WEBHOOK_BATCH_SIZE: i64 = 100;
const DEFAULT_WEBHOOK_LEASE_SECS: u64 = 30;
const DEFAULT_WEBHOOK_TIMEOUT_SECS: u64 = 5;
const DEFAULT_WEBHOOK_MAX_ATTEMPTS: i32 = 8;
const DEFAULT_WEBHOOK_INITIAL_BACKOFF_SECS: u64 = 5;
const DEFAULT_WEBHOOK_MAX_BACKOFF_SECS: u64 = 300;
const DEFAULT_ALERT_COOLDOWN_SECS: u64 = 300;
const DEFAULT_ALERT_POLL_SECS: u64 = 10;

pub const DB_READINESS_TIMEOUT: Duration = Duration::from_secs(30);
pub const DB_READINESS_RETRY_INTERVAL: Duration = Duration::from_secs(2);
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

const DEVTEST_KEYSETS: &str = "PAYMENT_REQUEST_DEVTEST_KEYSETS_JSON";

/// Index-0 expectation for one nested keyset entry, checked at startup.
#[derive(Clone, PartialEq, Eq)]
pub struct KeysetPreflightEntry {
    pub chain: String,
    pub network: String,
    pub keyset_id: String,
    pub extended_public_key: String,
    pub expected_index0_address: String,
}

impl std::fmt::Debug for KeysetPreflightEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeysetPreflightEntry")
            .field("chain", &self.chain)
            .field("network", &self.network)
            .field("keyset_id", &self.keyset_id)
            .field("expected_index0_address", &self.expected_index0_address)
            .finish_non_exhaustive()
    }
}

#[derive(Clone)]
pub struct ReconcilerConfig {
    pub enabled: bool,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub lease_duration: Duration,
    pub worker_id: String,
    pub detected_threshold_bps: i64,
    pub confirmed_threshold_bps: i64,
    pub btc_min_confirmations: i64,
    pub evm_min_confirmations: i64,
    /// Esplora base URL without trailing slash.
    pub btc_esplora_base_url: Option<String>,
    /// `network -> JSON-RPC URL`.
    pub evm_rpc_urls: BTreeMap<String, String>,
}

#[derive(Clone)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub url_allowlist: Vec<String>,
    pub hmac_secret: String,
    pub poll_interval: Duration,
    pub batch_size: i64,
    pub lease_duration: Duration,
    pub worker_id: String,
    pub timeout: Duration,
    pub max_attempts: i32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub retry_jitter_bps: i64,
    pub retry_budget: i64,
    pub ops_admin_keys: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct AlertConfig {
    pub enabled: bool,
    pub cooldown: Duration,
    pub poll_interval: Duration,
    pub failed_count_threshold: i64,
    pub pending_ready_threshold: i64,
    pub oldest_pending_age_seconds: i64,
}

#[derive(Clone)]
pub struct Config {
    pub database_url: String,
    /// `host/dbname`, safe to log.
    pub database_target: String,
    pub port: u16,
    pub openapi_spec_path: String,
    pub metrics_token: Option<String>,
    pub allocation_mode: AllocationMode,
    pub devtest_allow_mainnet: bool,
    /// `keyset_id -> extended public key`.
    pub devtest_keysets: BTreeMap<String, String>,
    pub devtest_preflights: Vec<KeysetPreflightEntry>,
    pub keyset_hash_hmac_secret: String,
    pub keyset_hash_hmac_previous_secrets: Vec<String>,
    /// `chain -> allowed address schemes`.
    pub address_scheme_allow_list: BTreeMap<String, BTreeSet<String>>,
    pub reconciler: ReconcilerConfig,
    pub webhook: WebhookConfig,
    pub alert: AlertConfig,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("database_target", &self.database_target)
            .field("port", &self.port)
            .field("openapi_spec_path", &self.openapi_spec_path)
            .field(
                "metrics_token",
                &self.metrics_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("allocation_mode", &self.allocation_mode)
            .field("devtest_allow_mainnet", &self.devtest_allow_mainnet)
            .field(
                "devtest_keysets",
                &self.devtest_keysets.keys().collect::<Vec<_>>(),
            )
            .field("devtest_preflights", &self.devtest_preflights)
            .field("keyset_hash_hmac_secret", &"[REDACTED]")
            .field(
                "keyset_hash_hmac_previous_secrets",
                &self.keyset_hash_hmac_previous_secrets.len(),
            )
            .field("address_scheme_allow_list", &self.address_scheme_allow_list)
            .field("reconciler", &self.reconciler)
            .field("webhook", &self.webhook)
            .field("alert", &self.alert)
            .finish()
    }
}

impl std::fmt::Debug for ReconcilerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReconcilerConfig")
            .field("enabled", &self.enabled)
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .field("lease_duration", &self.lease_duration)
            .field("worker_id", &self.worker_id)
            .field("detected_threshold_bps", &self.detected_threshold_bps)
            .field("confirmed_threshold_bps", &self.confirmed_threshold_bps)
            .field("btc_min_confirmations", &self.btc_min_confirmations)
            .field("evm_min_confirmations", &self.evm_min_confirmations)
            .field("btc_esplora_base_url", &self.btc_esplora_base_url)
            .field("evm_networks", &self.evm_rpc_urls.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl std::fmt::Debug for WebhookConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebhookConfig")
            .field("enabled", &self.enabled)
            .field("url_allowlist", &self.url_allowlist)
            .field("hmac_secret", &"[REDACTED]")
            .field("poll_interval", &self.poll_interval)
            .field("batch_size", &self.batch_size)
            .field("lease_duration", &self.lease_duration)
            .field("worker_id", &self.worker_id)
            .field("timeout", &self.timeout)
            .field("max_attempts", &self.max_attempts)
            .field("initial_backoff", &self.initial_backoff)
            .field("max_backoff", &self.max_backoff)
            .field("retry_jitter_bps", &self.retry_jitter_bps)
            .field("retry_budget", &self.retry_budget)
            .field("ops_admin_keys", &self.ops_admin_keys.len())
            .finish()
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingRequired(&'static str),

    #[error("invalid {0}: {1}")]
    Invalid(&'static str, String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build from an arbitrary variable source. Values are trimmed; blank
    /// values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let database_url = get("DATABASE_URL").ok_or(ConfigError::MissingRequired("DATABASE_URL"))?;
        let database_target = parse_database_target(&database_url)?;

        let port = match get("PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| ConfigError::Invalid("PORT", "must be a TCP port".into()))?,
            None => DEFAULT_PORT,
        };
        let openapi_spec_path =
            get("OPENAPI_SPEC_PATH").unwrap_or_else(|| DEFAULT_OPENAPI_SPEC_PATH.to_string());
        let metrics_token = get("METRICS_TOKEN");

        let allocation_mode = match get("PAYMENT_REQUEST_ALLOCATION_MODE") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::Invalid(
                    "PAYMENT_REQUEST_ALLOCATION_MODE",
                    "must be devtest or prod".into(),
                )
            })?,
            None => AllocationMode::Devtest,
        };
        let devtest_allow_mainnet =
            parse_bool(&get, "PAYMENT_REQUEST_DEVTEST_ALLOW_MAINNET", false)?;

        let (devtest_keysets, devtest_preflights) = match get(DEVTEST_KEYSETS) {
            Some(raw) => parse_devtest_keysets(&raw)?,
            None => (BTreeMap::new(), Vec::new()),
        };
        let keyset_hash_hmac_secret =
            get("PAYMENT_REQUEST_KEYSET_HASH_HMAC_SECRET").unwrap_or_default();
        if allocation_mode == AllocationMode::Devtest {
            if devtest_keysets.is_empty() {
                return Err(ConfigError::MissingRequired(DEVTEST_KEYSETS));
            }
            if keyset_hash_hmac_secret.is_empty() {
                return Err(ConfigError::MissingRequired(
                    "PAYMENT_REQUEST_KEYSET_HASH_HMAC_SECRET",
                ));
            }
        }
        let keyset_hash_hmac_previous_secrets = parse_string_array(
            &get,
            "PAYMENT_REQUEST_KEYSET_HASH_HMAC_PREVIOUS_SECRETS_JSON",
        )?;

        let address_scheme_allow_list = parse_scheme_allow_list(&get)?;
        let reconciler = parse_reconciler(&get)?;
        let webhook = parse_webhook(&get)?;
        let alert = parse_alert(&get)?;

        Ok(Self {
            database_url,
            database_target,
            port,
            openapi_spec_path,
            metrics_token,
            allocation_mode,
            devtest_allow_mainnet,
            devtest_keysets,
            devtest_preflights,
            keyset_hash_hmac_secret,
            keyset_hash_hmac_previous_secrets,
            address_scheme_allow_list,
            reconciler,
            webhook,
            alert,
        })
    }
}

fn parse_database_target(raw: &str) -> Result<String, ConfigError> {
    let url = Url::parse(raw)
        .map_err(|_| ConfigError::Invalid("DATABASE_URL", "not a valid URL".into()))?;
    if !matches!(url.scheme(), "postgres" | "postgresql") {
        return Err(ConfigError::Invalid(
            "DATABASE_URL",
            "must use postgres or postgresql scheme".into(),
        ));
    }
    let host = url
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| ConfigError::Invalid("DATABASE_URL", "host is required".into()))?;
    let db_name = url.path().trim_start_matches('/');
    if db_name.is_empty() {
        return Err(ConfigError::Invalid(
            "DATABASE_URL",
            "database name is required".into(),
        ));
    }
    let host = match url.port() {
        Some(port) => format!("{host}:{port}"),
        None => host.to_string(),
    };
    Ok(format!("{host}/{db_name}"))
}

fn parse_bool<G>(get: &G, key: &'static str, default: bool) -> Result<bool, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    match get(key) {
        None => Ok(default),
        Some(raw) => match raw.to_ascii_lowercase().as_str() {
            "1" | "t" | "true" => Ok(true),
            "0" | "f" | "false" => Ok(false),
            _ => Err(ConfigError::Invalid(key, "must be a boolean".into())),
        },
    }
}

fn parse_int<G>(get: &G, key: &'static str, default: i64, min: i64) -> Result<i64, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(default);
    };
    match raw.parse::<i64>() {
        Ok(v) if v >= min => Ok(v),
        _ if min > 0 => Err(ConfigError::Invalid(key, "must be a positive integer".into())),
        _ if min == i64::MIN => Err(ConfigError::Invalid(key, "must be an integer".into())),
        _ => Err(ConfigError::Invalid(
            key,
            format!("must be an integer >= {min}"),
        )),
    }
}

fn parse_seconds<G>(get: &G, key: &'static str, default: u64) -> Result<Duration, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let secs = parse_int(get, key, default as i64, 1)
        .map_err(|_| ConfigError::Invalid(key, "must be a positive integer in seconds".into()))?;
    Ok(Duration::from_secs(secs as u64))
}

/// JSON string array, trimmed, blanks dropped, first occurrence kept.
fn parse_string_array<G>(get: &G, key: &'static str) -> Result<Vec<String>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    let Some(raw) = get(key) else {
        return Ok(Vec::new());
    };
    let decoded: Vec<String> = serde_json::from_str(&raw)
        .map_err(|_| ConfigError::Invalid(key, "must be a JSON array of strings".into()))?;
    let mut seen = HashSet::new();
    Ok(decoded
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty() && seen.insert(s.clone()))
        .collect())
}

fn parse_scheme_allow_list<G>(get: &G) -> Result<BTreeMap<String, BTreeSet<String>>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    const KEY: &str = "PAYMENT_REQUEST_ADDRESS_SCHEME_ALLOW_LIST_JSON";
    let Some(raw) = get(KEY) else {
        return Ok(BTreeMap::from([
            ("bitcoin".to_string(), BTreeSet::from(["bip84_p2wpkh".to_string()])),
            ("ethereum".to_string(), BTreeSet::from(["evm_bip44".to_string()])),
        ]));
    };
    let decoded: BTreeMap<String, Vec<String>> = serde_json::from_str(&raw).map_err(|_| {
        ConfigError::Invalid(KEY, "must be a JSON object of string arrays".into())
    })?;
    let mut out: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (chain, schemes) in decoded {
        let chain = chain.trim().to_ascii_lowercase();
        if chain.is_empty() {
            continue;
        }
        let entry = out.entry(chain).or_default();
        for scheme in schemes {
            let scheme = scheme.trim().to_ascii_lowercase();
            if !scheme.is_empty() {
                entry.insert(scheme);
            }
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Invalid(
            KEY,
            "must define at least one chain/scheme pair".into(),
        ));
    }
    Ok(out)
}

fn key_from_object(obj: &serde_json::Map<String, Value>) -> Option<String> {
    ["extended_public_key", "key_material", "xpub"]
        .iter()
        .filter_map(|field| obj.get(*field).and_then(Value::as_str))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .map(str::to_string)
}

type Keysets = (BTreeMap<String, String>, Vec<KeysetPreflightEntry>);

/// Accepts the flat form `{keyset_id: key | {extended_public_key}}` or the
/// nested form `{chain: {network: {keyset_id, extended_public_key,
/// expected_index0_address}}}`. Only the nested form yields preflight entries.
pub fn parse_devtest_keysets(raw: &str) -> Result<Keysets, ConfigError> {
    let invalid = |reason: &str| ConfigError::Invalid(DEVTEST_KEYSETS, reason.to_string());
    let entries: serde_json::Map<String, Value> =
        serde_json::from_str(raw).map_err(|_| invalid("must be a JSON object"))?;

    if let Some(flat) = parse_flat_keysets(&entries)? {
        return Ok((flat, Vec::new()));
    }

    let mut keysets = BTreeMap::new();
    let mut preflights = Vec::new();
    for (chain, networks) in &entries {
        let chain = chain.trim().to_ascii_lowercase();
        if chain.is_empty() {
            continue;
        }
        let networks = networks.as_object().ok_or_else(|| {
            invalid(&format!("nested format must be chain->network objects ({chain})"))
        })?;
        for (network, entry) in networks {
            let network = network.trim().to_ascii_lowercase();
            if network.is_empty() {
                continue;
            }
            let scope = format!("{chain}/{network}");
            let entry = entry.as_object().ok_or_else(|| {
                invalid(&format!(
                    "nested entries must be objects with keyset_id and extended_public_key ({scope})"
                ))
            })?;
            let keyset_id = entry
                .get("keyset_id")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| invalid(&format!("nested entry is missing keyset_id ({scope})")))?
                .to_string();
            let key = key_from_object(entry).ok_or_else(|| {
                invalid(&format!(
                    "nested entry is missing extended_public_key ({scope}/{keyset_id})"
                ))
            })?;
            let expected = entry
                .get("expected_index0_address")
                .and_then(Value::as_str)
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    invalid(&format!(
                        "nested entry is missing expected_index0_address ({scope}/{keyset_id})"
                    ))
                })?
                .to_string();
            if let Some(existing) = keysets.get(&keyset_id) {
                if existing != &key {
                    return Err(invalid(&format!(
                        "defines conflicting key material for keyset_id {keyset_id}"
                    )));
                }
            }
            keysets.insert(keyset_id.clone(), key.clone());
            preflights.push(KeysetPreflightEntry {
                chain: chain.clone(),
                network,
                keyset_id,
                extended_public_key: key,
                expected_index0_address: expected,
            });
        }
    }
    Ok((keysets, preflights))
}

/// `Ok(None)` when the payload looks nested rather than flat.
fn parse_flat_keysets(
    entries: &serde_json::Map<String, Value>,
) -> Result<Option<BTreeMap<String, String>>, ConfigError> {
    let mut keysets = BTreeMap::new();
    for (keyset_id, payload) in entries {
        let keyset_id = keyset_id.trim();
        if keyset_id.is_empty() {
            continue;
        }
        match payload {
            Value::String(key) => {
                let key = key.trim();
                if key.is_empty() {
                    return Err(ConfigError::Invalid(
                        DEVTEST_KEYSETS,
                        format!("contains empty key material for {keyset_id}"),
                    ));
                }
                keysets.insert(keyset_id.to_string(), key.to_string());
            }
            Value::Object(obj) => match key_from_object(obj) {
                Some(key) => {
                    keysets.insert(keyset_id.to_string(), key);
                }
                None => return Ok(None),
            },
            _ => return Ok(None),
        }
    }
    Ok(Some(keysets))
}

fn parse_reconciler<G>(get: &G) -> Result<ReconcilerConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    const DETECTED: &str = "PAYMENT_REQUEST_RECONCILER_DETECTED_THRESHOLD_BPS";
    const CONFIRMED: &str = "PAYMENT_REQUEST_RECONCILER_CONFIRMED_THRESHOLD_BPS";
    const EVM_RPC_URLS: &str = "PAYMENT_REQUEST_EVM_RPC_URLS_JSON";

    let enabled = parse_bool(get, "PAYMENT_REQUEST_RECONCILER_ENABLED", false)?;
    let poll_interval = parse_seconds(
        get,
        "PAYMENT_REQUEST_RECONCILER_POLL_INTERVAL_SECONDS",
        DEFAULT_RECONCILER_POLL_SECS,
    )?;
    let batch_size = parse_int(
        get,
        "PAYMENT_REQUEST_RECONCILER_BATCH_SIZE",
        DEFAULT_RECONCILER_BATCH_SIZE,
        1,
    )?;
    let lease_duration = parse_seconds(
        get,
        "PAYMENT_REQUEST_RECONCILER_LEASE_SECONDS",
        DEFAULT_RECONCILER_LEASE_SECS,
    )?;
    let worker_id =
        get("PAYMENT_REQUEST_RECONCILER_WORKER_ID").unwrap_or_else(default_worker_id);

    let detected = parse_int(get, DETECTED, DEFAULT_THRESHOLD_BPS, i64::MIN)?;
    let confirmed = parse_int(get, CONFIRMED, DEFAULT_THRESHOLD_BPS, i64::MIN)?;
    if !(1..=10_000).contains(&confirmed) {
        return Err(ConfigError::Invalid(
            CONFIRMED,
            "must be between 1 and 10000".into(),
        ));
    }
    if detected < 1 || detected > confirmed {
        return Err(ConfigError::Invalid(
            DETECTED,
            format!("must be between 1 and {confirmed}"),
        ));
    }

    let btc_min_confirmations = parse_int(
        get,
        "PAYMENT_REQUEST_RECONCILER_BTC_MIN_CONFIRMATIONS",
        DEFAULT_MIN_CONFIRMATIONS,
        1,
    )?;
    let evm_min_confirmations = parse_int(
        get,
        "PAYMENT_REQUEST_RECONCILER_EVM_MIN_CONFIRMATIONS",
        DEFAULT_MIN_CONFIRMATIONS,
        1,
    )?;

    let btc_esplora_base_url = get("PAYMENT_REQUEST_BTC_ESPLORA_BASE_URL")
        .map(|u| u.trim_end_matches('/').to_string())
        .filter(|u| !u.is_empty());

    let mut evm_rpc_urls = BTreeMap::new();
    if let Some(raw) = get(EVM_RPC_URLS) {
        let decoded: BTreeMap<String, String> = serde_json::from_str(&raw).map_err(|_| {
            ConfigError::Invalid(EVM_RPC_URLS, "must be a JSON object of network to URL".into())
        })?;
        for (network, url) in decoded {
            let network = network.trim().to_ascii_lowercase();
            let url = url.trim().to_string();
            if network.is_empty() || url.is_empty() {
                continue;
            }
            Url::parse(&url).map_err(|_| {
                ConfigError::Invalid(EVM_RPC_URLS, format!("invalid URL for network {network}"))
            })?;
            evm_rpc_urls.insert(network, url);
        }
    }

    if enabled && btc_esplora_base_url.is_none() && evm_rpc_urls.is_empty() {
        return Err(ConfigError::Invalid(
            "PAYMENT_REQUEST_RECONCILER_ENABLED",
            "at least one observer endpoint is required when reconciler is enabled".into(),
        ));
    }

    Ok(ReconcilerConfig {
        enabled,
        poll_interval,
        batch_size,
        lease_duration,
        worker_id,
        detected_threshold_bps: detected,
        confirmed_threshold_bps: confirmed,
        btc_min_confirmations,
        evm_min_confirmations,
        btc_esplora_base_url,
        evm_rpc_urls,
    })
}

fn parse_webhook<G>(get: &G) -> Result<WebhookConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    const ENABLED: &str = "PAYMENT_REQUEST_WEBHOOK_ENABLED";
    const SECRET: &str = "PAYMENT_REQUEST_WEBHOOK_HMAC_SECRET";
    const MAX_BACKOFF: &str = "PAYMENT_REQUEST_WEBHOOK_MAX_BACKOFF_SECONDS";
    const JITTER: &str = "PAYMENT_REQUEST_WEBHOOK_RETRY_JITTER_BPS";

    let enabled = parse_bool(get, ENABLED, false)?;
    let hmac_secret = get(SECRET).unwrap_or_default();
    if enabled && hmac_secret.is_empty() {
        return Err(ConfigError::MissingRequired(SECRET));
    }

    let poll_interval = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_POLL_INTERVAL_SECONDS",
        DEFAULT_WEBHOOK_POLL_SECS,
    )?;
    let batch_size = parse_int(
        get,
        "PAYMENT_REQUEST_WEBHOOK_BATCH_SIZE",
        DEFAULT_WEBHOOK_BATCH_SIZE,
        1,
    )?;
    let lease_duration = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_LEASE_SECONDS",
        DEFAULT_WEBHOOK_LEASE_SECS,
    )?;
    let worker_id = get("PAYMENT_REQUEST_WEBHOOK_WORKER_ID").unwrap_or_else(default_worker_id);
    let timeout = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_TIMEOUT_SECONDS",
        DEFAULT_WEBHOOK_TIMEOUT_SECS,
    )?;
    let max_attempts = parse_int(
        get,
        "PAYMENT_REQUEST_WEBHOOK_MAX_ATTEMPTS",
        DEFAULT_WEBHOOK_MAX_ATTEMPTS as i64,
        1,
    )?;
    let max_attempts = i32::try_from(max_attempts).map_err(|_| {
        ConfigError::Invalid("PAYMENT_REQUEST_WEBHOOK_MAX_ATTEMPTS", "is too large".into())
    })?;
    let initial_backoff = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_INITIAL_BACKOFF_SECONDS",
        DEFAULT_WEBHOOK_INITIAL_BACKOFF_SECS,
    )?;
    let max_backoff = parse_seconds(get, MAX_BACKOFF, DEFAULT_WEBHOOK_MAX_BACKOFF_SECS)?;
    if max_backoff < initial_backoff {
        return Err(ConfigError::Invalid(
            MAX_BACKOFF,
            "must be >= PAYMENT_REQUEST_WEBHOOK_INITIAL_BACKOFF_SECONDS".into(),
        ));
    }
    let retry_jitter_bps = parse_int(get, JITTER, 0, 0)?;
    if retry_jitter_bps > 10_000 {
        return Err(ConfigError::Invalid(
            JITTER,
            "must be an integer between 0 and 10000".into(),
        ));
    }
    let retry_budget = parse_int(get, "PAYMENT_REQUEST_WEBHOOK_RETRY_BUDGET", 0, 0)?;

    let url_allowlist = parse_webhook_allowlist(get)?;
    let ops_admin_keys = parse_string_array(get, "PAYMENT_REQUEST_WEBHOOK_OPS_ADMIN_KEYS_JSON")?;

    Ok(WebhookConfig {
        enabled,
        url_allowlist,
        hmac_secret,
        poll_interval,
        batch_size,
        lease_duration,
        worker_id,
        timeout,
        max_attempts,
        initial_backoff,
        max_backoff,
        retry_jitter_bps,
        retry_budget,
        ops_admin_keys,
    })
}

fn parse_webhook_allowlist<G>(get: &G) -> Result<Vec<String>, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    const KEY: &str = "PAYMENT_REQUEST_WEBHOOK_URL_ALLOWLIST_JSON";
    let Some(raw) = get(KEY) else {
        return Ok(vec!["localhost".into(), "127.0.0.1".into(), "::1".into()]);
    };
    let decoded: Vec<String> = serde_json::from_str(&raw)
        .map_err(|_| ConfigError::Invalid(KEY, "must be a JSON array of host patterns".into()))?;
    let mut out: Vec<String> = Vec::with_capacity(decoded.len());
    for pattern in decoded {
        let normalized = normalize_webhook_host_pattern(&pattern)
            .map_err(|_| ConfigError::Invalid(KEY, "must contain valid host patterns".into()))?;
        if !out.contains(&normalized) {
            out.push(normalized);
        }
    }
    if out.is_empty() {
        return Err(ConfigError::Invalid(
            KEY,
            "must contain at least one host pattern".into(),
        ));
    }
    Ok(out)
}

fn parse_alert<G>(get: &G) -> Result<AlertConfig, ConfigError>
where
    G: Fn(&str) -> Option<String>,
{
    const ENABLED: &str = "PAYMENT_REQUEST_WEBHOOK_ALERT_ENABLED";
    let enabled = parse_bool(get, ENABLED, false)?;
    let cooldown = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_ALERT_COOLDOWN_SECONDS",
        DEFAULT_ALERT_COOLDOWN_SECS,
    )?;
    let poll_interval = parse_seconds(
        get,
        "PAYMENT_REQUEST_WEBHOOK_ALERT_POLL_INTERVAL_SECONDS",
        DEFAULT_ALERT_POLL_SECS,
    )?;
    let failed_count_threshold =
        parse_int(get, "PAYMENT_REQUEST_WEBHOOK_ALERT_FAILED_COUNT_THRESHOLD", 0, 0)?;
    let pending_ready_threshold =
        parse_int(get, "PAYMENT_REQUEST_WEBHOOK_ALERT_PENDING_READY_THRESHOLD", 0, 0)?;
    let oldest_pending_age_seconds = parse_int(
        get,
        "PAYMENT_REQUEST_WEBHOOK_ALERT_OLDEST_PENDING_AGE_SECONDS",
        0,
        0,
    )?;
    if enabled
        && failed_count_threshold == 0
        && pending_ready_threshold == 0
        && oldest_pending_age_seconds == 0
    {
        return Err(ConfigError::Invalid(
            ENABLED,
            "at least one webhook alert threshold must be > 0 when webhook alert is enabled"
                .into(),
        ));
    }
    Ok(AlertConfig {
        enabled,
        cooldown,
        poll_interval,
        failed_count_threshold,
        pending_ready_threshold,
        oldest_pending_age_seconds,
    })
}

fn default_worker_id() -> String {
    let host = env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    format!("{host}:{}", std::process::id())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    const TPUB: &str = "tpubDC2pzLGKv5DoHtRoYjJsbgESSzFqc3mtPzahMMqhH89bqqHot28MFUHkUECJrBGFb2KPQZUrApq4Ti6Y69S2K3snrsT8E5Zjt1GqTMj7xn5";

    fn load(vars: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|k| map.get(k).cloned())
    }

    fn base() -> Vec<(&'static str, String)> {
        vec![
            ("DATABASE_URL", "postgres://u:p@db:5432/chaintx".to_string()),
            (
                "PAYMENT_REQUEST_DEVTEST_KEYSETS_JSON",
                format!(r#"{{"ks_btc":"{TPUB}"}}"#),
            ),
            ("PAYMENT_REQUEST_KEYSET_HASH_HMAC_SECRET", "s3cret".to_string()),
        ]
    }

    fn load_with(extra: &[(&str, &str)]) -> Result<Config, ConfigError> {
        let base = base();
        let mut vars: Vec<(&str, &str)> = base.iter().map(|(k, v)| (*k, v.as_str())).collect();
        vars.extend_from_slice(extra);
        load(&vars)
    }

    #[test]
    fn defaults_apply() {
        let cfg = load_with(&[]).unwrap();
        assert_eq!(cfg.database_target, "db:5432/chaintx");
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.allocation_mode, AllocationMode::Devtest);
        assert_eq!(cfg.devtest_keysets.get("ks_btc").map(String::as_str), Some(TPUB));
        assert!(cfg.devtest_preflights.is_empty());
        assert_eq!(cfg.webhook.max_attempts, 8);
        assert_eq!(cfg.webhook.url_allowlist, vec!["localhost", "127.0.0.1", "::1"]);
        assert_eq!(cfg.reconciler.poll_interval, Duration::from_secs(15));
        assert!(cfg.address_scheme_allow_list["bitcoin"].contains("bip84_p2wpkh"));
        assert!(!cfg.alert.enabled);
    }

    #[test]
    fn database_url_is_required_and_checked() {
        assert_eq!(
            load(&[]).unwrap_err(),
            ConfigError::MissingRequired("DATABASE_URL")
        );
        let err = load(&[("DATABASE_URL", "mysql://db/x")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DATABASE_URL", _)));
        let err = load(&[("DATABASE_URL", "postgres://db")]).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("DATABASE_URL", _)));
    }

    #[test]
    fn devtest_requires_keysets_and_secret() {
        let err = load(&[("DATABASE_URL", "postgres://db/x")]).unwrap_err();
        assert_eq!(err, ConfigError::MissingRequired(DEVTEST_KEYSETS));

        let prod = load(&[
            ("DATABASE_URL", "postgres://db/x"),
            ("PAYMENT_REQUEST_ALLOCATION_MODE", "prod"),
        ])
        .unwrap();
        assert_eq!(prod.allocation_mode, AllocationMode::Prod);
    }

    #[test]
    fn nested_keysets_yield_preflights() {
        let raw = format!(
            r#"{{"bitcoin":{{"regtest":{{"keyset_id":"ks_btc","extended_public_key":"{TPUB}","expected_index0_address":"bcrt1q7xfwy8t0z9xar2klctmdgm96kxvg9k8jn30qfg"}}}}}}"#
        );
        let (keysets, preflights) = parse_devtest_keysets(&raw).unwrap();
        assert_eq!(keysets.len(), 1);
        assert_eq!(preflights.len(), 1);
        assert_eq!(preflights[0].network, "regtest");
        assert_eq!(preflights[0].keyset_id, "ks_btc");
    }

    #[test]
    fn nested_keysets_reject_conflicts_and_missing_fields() {
        let conflict = format!(
            r#"{{"bitcoin":{{"regtest":{{"keyset_id":"ks","xpub":"{TPUB}","expected_index0_address":"a"}},"testnet":{{"keyset_id":"ks","xpub":"other","expected_index0_address":"b"}}}}}}"#
        );
        assert!(parse_devtest_keysets(&conflict).is_err());

        let missing = r#"{"bitcoin":{"regtest":{"keyset_id":"ks","xpub":"k"}}}"#;
        let err = parse_devtest_keysets(missing).unwrap_err();
        assert!(err.to_string().contains("expected_index0_address"));
    }

    #[test]
    fn threshold_ordering_is_enforced() {
        let err = load_with(&[
            ("PAYMENT_REQUEST_RECONCILER_DETECTED_THRESHOLD_BPS", "9000"),
            ("PAYMENT_REQUEST_RECONCILER_CONFIRMED_THRESHOLD_BPS", "8000"),
        ])
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid("PAYMENT_REQUEST_RECONCILER_DETECTED_THRESHOLD_BPS", _)
        ));
    }

    #[test]
    fn reconciler_needs_an_endpoint() {
        let err = load_with(&[("PAYMENT_REQUEST_RECONCILER_ENABLED", "true")]).unwrap_err();
        assert!(err.to_string().contains("observer endpoint"));

        let cfg = load_with(&[
            ("PAYMENT_REQUEST_RECONCILER_ENABLED", "true"),
            ("PAYMENT_REQUEST_BTC_ESPLORA_BASE_URL", "http://esplora:3000/api/"),
        ])
        .unwrap();
        assert_eq!(
            cfg.reconciler.btc_esplora_base_url.as_deref(),
            Some("http://esplora:3000/api")
        );
    }

    #[test]
    fn webhook_bounds() {
        assert!(load_with(&[("PAYMENT_REQUEST_WEBHOOK_MAX_ATTEMPTS", "0")]).is_err());
        assert!(load_with(&[("PAYMENT_REQUEST_WEBHOOK_RETRY_JITTER_BPS", "10001")]).is_err());
        assert!(load_with(&[
            ("PAYMENT_REQUEST_WEBHOOK_INITIAL_BACKOFF_SECONDS", "60"),
            ("PAYMENT_REQUEST_WEBHOOK_MAX_BACKOFF_SECONDS", "30"),
        ])
        .is_err());
        assert_eq!(
            load_with(&[("PAYMENT_REQUEST_WEBHOOK_ENABLED", "true")]).unwrap_err(),
            ConfigError::MissingRequired("PAYMENT_REQUEST_WEBHOOK_HMAC_SECRET")
        );
    }

    #[test]
    fn alert_needs_a_threshold() {
        assert!(load_with(&[("PAYMENT_REQUEST_WEBHOOK_ALERT_ENABLED", "true")]).is_err());
        let cfg = load_with(&[
            ("PAYMENT_REQUEST_WEBHOOK_ALERT_ENABLED", "true"),
            ("PAYMENT_REQUEST_WEBHOOK_ALERT_FAILED_COUNT_THRESHOLD", "3"),
        ])
        .unwrap();
        assert_eq!(cfg.alert.failed_count_threshold, 3);
    }

    #[test]
    fn string_arrays_are_trimmed_and_deduplicated() {
        let cfg = load_with(&[(
            "PAYMENT_REQUEST_WEBHOOK_OPS_ADMIN_KEYS_JSON",
            r#"[" k1 ","k1","","k2"]"#,
        )])
        .unwrap();
        assert_eq!(cfg.webhook.ops_admin_keys, vec!["k1", "k2"]);
    }

    #[test]
    fn debug_redacts_secrets() {
        let cfg = load_with(&[("METRICS_TOKEN", "tok-123")]).unwrap();
        let dbg = format!("{cfg:?}");
        assert!(!dbg.contains("s3cret"));
        assert!(!dbg.contains("tok-123"));
        assert!(!dbg.contains(TPUB));
    }
}
