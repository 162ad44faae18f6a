//! Input normalization for payment-request creation.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{Map, Value};
use url::{Host, Url};

use crate::canonical_json;
use crate::error::{AppError, AppResult};

pub const MIN_EXPIRES_IN_SECONDS: i64 = 60;
pub const MAX_EXPIRES_IN_SECONDS: i64 = 2_592_000;
pub const MAX_METADATA_BYTES: usize = 4096;

static CHAIN_OR_NETWORK: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_-]{1,32}$").expect("valid regex"));
static ASSET: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Z0-9_-]{1,32}$").expect("valid regex"));
static AMOUNT_MINOR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]{1,78}$").expect("valid regex"));

fn invalid_field(field: &str, message: &str) -> AppError {
    AppError::validation("invalid_request", message).with("field", field)
}

pub fn normalize_chain(raw: &str) -> AppResult<String> {
    let chain = raw.trim().to_ascii_lowercase();
    if !CHAIN_OR_NETWORK.is_match(&chain) {
        return Err(invalid_field("chain", "chain is invalid"));
    }
    Ok(chain)
}

pub fn normalize_network(raw: &str) -> AppResult<String> {
    let network = raw.trim().to_ascii_lowercase();
    if !CHAIN_OR_NETWORK.is_match(&network) {
        return Err(invalid_field("network", "network is invalid"));
    }
    Ok(network)
}

pub fn normalize_asset(raw: &str) -> AppResult<String> {
    let asset = raw.trim().to_ascii_uppercase();
    if !ASSET.is_match(&asset) {
        return Err(invalid_field("asset", "asset is invalid"));
    }
    Ok(asset)
}

pub fn normalize_expected_amount_minor(raw: &str) -> AppResult<String> {
    let value = raw.trim();
    if !AMOUNT_MINOR.is_match(value) {
        return Err(invalid_field(
            "expected_amount_minor",
            "expected_amount_minor must be an integer string with 1 to 78 digits",
        ));
    }
    Ok(value.to_string())
}

pub fn is_expiry_in_range(value: i64) -> bool {
    (MIN_EXPIRES_IN_SECONDS..=MAX_EXPIRES_IN_SECONDS).contains(&value)
}

/// Pick the requested expiry or fall back to the catalog default.
/// An out-of-range default is a catalog defect, not a caller error.
pub fn resolve_expires_in_seconds(requested: Option<i64>, default_value: i64) -> AppResult<i64> {
    if !is_expiry_in_range(default_value) {
        return Err(AppError::internal(
            "asset_catalog_invalid",
            "asset catalog default_expires_in_seconds is out of range",
        )
        .with("default_expires_in_seconds", default_value));
    }
    match requested {
        None => Ok(default_value),
        Some(v) if is_expiry_in_range(v) => Ok(v),
        Some(_) => Err(invalid_field(
            "expires_in_seconds",
            "expires_in_seconds must be between 60 and 2592000",
        )),
    }
}

/// Normalize a webhook URL. Returns `(canonical_url, host)`; `host` is what
/// the allow-list is matched against.
pub fn normalize_webhook_url(raw: &str) -> AppResult<(String, String)> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Err(invalid_field("webhook_url", "webhook_url is required"));
    }

    let mut parsed = Url::parse(trimmed).map_err(|_| {
        invalid_field("webhook_url", "webhook_url must be a valid absolute URL")
    })?;
    if parsed.host().is_none() {
        return Err(invalid_field(
            "webhook_url",
            "webhook_url must be a valid absolute URL",
        ));
    }
    if !parsed.username().is_empty() || parsed.password().is_some() {
        return Err(invalid_field(
            "webhook_url",
            "webhook_url must not contain user info",
        ));
    }
    if parsed.scheme() != "http" && parsed.scheme() != "https" {
        return Err(invalid_field(
            "webhook_url",
            "webhook_url must use http or https",
        ));
    }

    let host = match parsed.host() {
        Some(Host::Domain(domain)) => domain.trim_end_matches('.').to_ascii_lowercase(),
        Some(Host::Ipv4(ip)) => ip.to_string(),
        Some(Host::Ipv6(ip)) => ip.to_string(),
        None => String::new(),
    };
    if host.is_empty() {
        return Err(invalid_field("webhook_url", "webhook_url host is required"));
    }
    if matches!(parsed.host(), Some(Host::Domain(d)) if d != host) {
        parsed
            .set_host(Some(&host))
            .map_err(|_| invalid_field("webhook_url", "webhook_url host is required"))?;
    }
    parsed.set_fragment(None);

    Ok((parsed.to_string(), host))
}

/// Normalize one allow-list entry: an exact host or `*.suffix`.
pub fn normalize_webhook_host_pattern(raw: &str) -> AppResult<String> {
    let trimmed = raw.trim().to_ascii_lowercase();
    let trimmed = trimmed.trim_end_matches('.');
    if trimmed.is_empty() {
        return Err(AppError::validation(
            "invalid_request",
            "webhook host pattern must not be empty",
        ));
    }
    if trimmed.contains("://") || trimmed.contains(['/', '?', '#', ' ']) {
        return Err(AppError::validation(
            "invalid_request",
            "webhook host pattern must be a host pattern",
        ));
    }
    if let Some(suffix) = trimmed.strip_prefix("*.") {
        if suffix.is_empty() || suffix.contains('*') {
            return Err(AppError::validation(
                "invalid_request",
                "webhook host wildcard pattern is invalid",
            ));
        }
        return Ok(format!("*.{suffix}"));
    }
    if trimmed.contains('*') {
        return Err(AppError::validation(
            "invalid_request",
            "webhook host wildcard pattern is invalid",
        ));
    }
    Ok(trimmed.to_string())
}

/// Exact host match, or `*.suffix` matching strict subdomains of `suffix`.
pub fn is_webhook_host_allowed(host: &str, allowlist: &[String]) -> bool {
    let host = host.trim().trim_end_matches('.').to_ascii_lowercase();
    if host.is_empty() {
        return false;
    }
    allowlist.iter().any(|pattern| {
        let pattern = pattern.trim().trim_end_matches('.').to_ascii_lowercase();
        if pattern.is_empty() {
            return false;
        }
        match pattern.strip_prefix("*.") {
            Some("") => false,
            Some(suffix) => host != suffix && host.ends_with(&format!(".{suffix}")),
            None => host == pattern,
        }
    })
}

/// Metadata must be a JSON object whose canonical encoding fits in 4 KiB.
pub fn normalize_metadata(input: Option<&Map<String, Value>>) -> AppResult<Map<String, Value>> {
    let Some(map) = input else {
        return Ok(Map::new());
    };
    if map.is_empty() {
        return Ok(Map::new());
    }
    let encoded = canonical_json::to_vec(&Value::Object(map.clone()));
    if encoded.len() > MAX_METADATA_BYTES {
        return Err(AppError::validation("invalid_request", "metadata payload exceeds 4KB")
            .with("field", "metadata")
            .with("max_bytes", MAX_METADATA_BYTES));
    }
    Ok(map.clone())
}

/// Lexically clean an absolute path: collapse `//`, drop `.`, resolve `..`.
pub fn clean_path(raw: &str) -> String {
    let mut segments: Vec<&str> = Vec::new();
    for segment in raw.trim().split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                segments.pop();
            }
            s => segments.push(s),
        }
    }
    format!("/{}", segments.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn chain_network_asset_normalization() {
        assert_eq!(normalize_chain(" Bitcoin ").unwrap(), "bitcoin");
        assert_eq!(normalize_network("MAINNET").unwrap(), "mainnet");
        assert_eq!(normalize_asset(" usdt ").unwrap(), "USDT");
        assert_eq!(normalize_chain("bit coin").unwrap_err().message, "chain is invalid");
        assert_eq!(normalize_network("").unwrap_err().message, "network is invalid");
        assert!(normalize_asset(&"A".repeat(33)).is_err());
    }

    #[test]
    fn amount_digit_bounds() {
        assert_eq!(normalize_expected_amount_minor(" 0001 ").unwrap(), "0001");
        assert!(normalize_expected_amount_minor(&"9".repeat(78)).is_ok());
        assert!(normalize_expected_amount_minor(&"9".repeat(79)).is_err());
        assert!(normalize_expected_amount_minor("").is_err());
        assert!(normalize_expected_amount_minor("+1").is_err());
        assert!(normalize_expected_amount_minor("-1").is_err());
        assert!(normalize_expected_amount_minor("1.5").is_err());
    }

    #[test]
    fn expiry_boundaries() {
        assert!(resolve_expires_in_seconds(Some(59), 3600).is_err());
        assert_eq!(resolve_expires_in_seconds(Some(60), 3600).unwrap(), 60);
        assert_eq!(
            resolve_expires_in_seconds(Some(2_592_000), 3600).unwrap(),
            2_592_000
        );
        let err = resolve_expires_in_seconds(Some(2_592_001), 3600).unwrap_err();
        assert_eq!(err.code, "invalid_request");
        assert_eq!(resolve_expires_in_seconds(None, 3600).unwrap(), 3600);
    }

    #[test]
    fn out_of_range_catalog_default_is_internal() {
        let err = resolve_expires_in_seconds(None, 10).unwrap_err();
        assert_eq!(err.code, "asset_catalog_invalid");
        assert_eq!(err.kind, crate::error::ErrorKind::Internal);
    }

    #[test]
    fn webhook_url_normalization() {
        let (url, host) =
            normalize_webhook_url(" HTTPS://Hooks.Example.COM.:8443/pr?x=1#frag ").unwrap();
        assert_eq!(url, "https://hooks.example.com:8443/pr?x=1");
        assert_eq!(host, "hooks.example.com");
    }

    #[test]
    fn webhook_url_rejections() {
        let cases = [
            ("", "webhook_url is required"),
            ("/relative/path", "webhook_url must be a valid absolute URL"),
            ("https://user:pw@example.com/", "webhook_url must not contain user info"),
            ("https://user@example.com/", "webhook_url must not contain user info"),
            ("ftp://example.com/", "webhook_url must use http or https"),
        ];
        for (raw, message) in cases {
            let err = normalize_webhook_url(raw).unwrap_err();
            assert_eq!(err.code, "invalid_request", "{raw}");
            assert_eq!(err.message, message, "{raw}");
        }
    }

    #[test]
    fn ipv6_host_is_unbracketed() {
        let (_, host) = normalize_webhook_url("http://[::1]:9000/hook").unwrap();
        assert_eq!(host, "::1");
        assert!(is_webhook_host_allowed(&host, &["::1".to_string()]));
    }

    #[test]
    fn allowlist_matching() {
        let list = vec!["localhost".to_string(), "*.example.com".to_string()];
        assert!(is_webhook_host_allowed("localhost", &list));
        assert!(is_webhook_host_allowed("hooks.example.com", &list));
        assert!(is_webhook_host_allowed("a.b.example.com", &list));
        assert!(!is_webhook_host_allowed("example.com", &list));
        assert!(!is_webhook_host_allowed("evilexample.com", &list));
        assert!(!is_webhook_host_allowed("", &list));
    }

    #[test]
    fn host_pattern_validation() {
        assert_eq!(normalize_webhook_host_pattern(" *.Example.com. ").unwrap(), "*.example.com");
        assert!(normalize_webhook_host_pattern("https://x").is_err());
        assert!(normalize_webhook_host_pattern("a.*.com").is_err());
        assert!(normalize_webhook_host_pattern("*.").is_err());
        assert!(normalize_webhook_host_pattern("  ").is_err());
    }

    #[test]
    fn metadata_size_limit() {
        let small = json!({"order": "A-1"});
        let map = small.as_object().unwrap();
        assert_eq!(normalize_metadata(Some(map)).unwrap(), map.clone());

        let big = json!({"blob": "x".repeat(MAX_METADATA_BYTES)});
        let err = normalize_metadata(big.as_object()).unwrap_err();
        assert_eq!(err.message, "metadata payload exceeds 4KB");
        assert!(normalize_metadata(None).unwrap().is_empty());
    }

    #[test]
    fn path_cleaning() {
        assert_eq!(clean_path("v1//payment-requests/"), "/v1/payment-requests");
        assert_eq!(clean_path("/v1/./x/../y"), "/v1/y");
        assert_eq!(clean_path(""), "/");
    }
}
