//! EVM observation over JSON-RPC balances.
//!
//! Native assets use `eth_getBalance`; token assets call ERC-20 `balanceOf`.
//! The confirmed amount is the balance at `latest - (min_confirmations - 1)`,
//! so funds count as confirmed once they sit under that many blocks.

use std::collections::BTreeMap;

use alloy::primitives::U512;
use chaintx::threshold::ThresholdPolicy;
use chaintx::{AppError, AppResult, ObservePaymentRequestInput, ObservePaymentRequestOutput};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::observation_failed;

pub const SOURCE: &str = "evm_rpc";

/// `balanceOf(address)`.
const BALANCE_OF_SELECTOR: &str = "0x70a08231";

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcResponse {
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Parse a `0x`-prefixed JSON-RPC quantity or data word.
fn parse_quantity(raw: &str) -> Option<U512> {
    let digits = raw.trim().strip_prefix("0x")?;
    if digits.is_empty() {
        return Some(U512::ZERO);
    }
    U512::from_str_radix(digits, 16).ok()
}

fn parse_block_number(raw: &str) -> Option<u64> {
    let digits = raw.trim().strip_prefix("0x")?;
    u64::from_str_radix(digits, 16).ok()
}

fn block_tag(height: u64) -> String {
    format!("0x{height:x}")
}

/// `balanceOf` call data for a 20-byte address, left-padded to 32 bytes.
fn balance_of_call_data(address: &str) -> Option<String> {
    let hex_addr = address.trim().strip_prefix("0x")?.to_ascii_lowercase();
    if hex_addr.len() != 40 || hex::decode(&hex_addr).is_err() {
        return None;
    }
    Some(format!("{BALANCE_OF_SELECTOR}{}{hex_addr}", "0".repeat(24)))
}

/// Height whose state holds funds with at least `min_confirmations`, or
/// `None` when the chain is not yet that deep.
fn confirmed_height(latest: u64, min_confirmations: i64) -> Option<u64> {
    let depth = u64::try_from(min_confirmations.max(1) - 1).unwrap_or(0);
    latest.checked_sub(depth)
}

pub struct EvmObserver {
    client: reqwest::Client,
    /// `network -> JSON-RPC URL`, keys lowercased.
    rpc_urls: BTreeMap<String, String>,
    min_confirmations: i64,
    policy: ThresholdPolicy,
}

enum Balance<'a> {
    Native { address: &'a str },
    Erc20 { contract: &'a str, call_data: String },
}

impl EvmObserver {
    pub fn new(
        client: reqwest::Client,
        rpc_urls: &BTreeMap<String, String>,
        min_confirmations: i64,
        policy: ThresholdPolicy,
    ) -> Self {
        let rpc_urls = rpc_urls
            .iter()
            .map(|(network, url)| (network.trim().to_ascii_lowercase(), url.trim().to_string()))
            .filter(|(network, url)| !network.is_empty() && !url.is_empty())
            .collect();
        Self {
            client,
            rpc_urls,
            min_confirmations: min_confirmations.max(1),
            policy,
        }
    }

    pub fn supports(&self, network: &str) -> bool {
        self.rpc_urls
            .contains_key(&network.trim().to_ascii_lowercase())
    }

    async fn call(&self, url: &str, network: &str, method: &str, params: Value) -> AppResult<Value> {
        let body = json!({
            "jsonrpc": "2.0",
            "method": method,
            "params": params,
            "id": 1
        });
        let response = self
            .client
            .post(url)
            .header("Content-Type", "application/json")
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                observation_failed("failed to query evm rpc endpoint", network)
                    .with("method", method)
                    .with("error", e.to_string())
            })?;
        if !response.status().is_success() {
            return Err(
                observation_failed("evm rpc endpoint returned non-success status", network)
                    .with("method", method)
                    .with("status_code", response.status().as_u16()),
            );
        }
        let decoded: RpcResponse = response.json().await.map_err(|e| {
            observation_failed("failed to decode evm rpc response", network)
                .with("method", method)
                .with("error", e.to_string())
        })?;
        if let Some(err) = decoded.error {
            return Err(observation_failed("evm rpc call returned an error", network)
                .with("method", method)
                .with("rpc_code", err.code)
                .with("rpc_message", err.message));
        }
        decoded.result.ok_or_else(|| {
            observation_failed("evm rpc response has no result", network).with("method", method)
        })
    }

    async fn quantity(&self, url: &str, network: &str, method: &str, params: Value) -> AppResult<U512> {
        let result = self.call(url, network, method, params).await?;
        result
            .as_str()
            .and_then(parse_quantity)
            .ok_or_else(|| {
                observation_failed("evm rpc returned an invalid quantity", network)
                    .with("method", method)
                    .with("result", result.to_string())
            })
    }

    async fn balance_at(
        &self,
        url: &str,
        network: &str,
        balance: &Balance<'_>,
        tag: &str,
    ) -> AppResult<U512> {
        match balance {
            Balance::Native { address } => {
                self.quantity(url, network, "eth_getBalance", json!([address, tag]))
                    .await
            }
            Balance::Erc20 {
                contract,
                call_data,
            } => {
                self.quantity(
                    url,
                    network,
                    "eth_call",
                    json!([{ "to": contract, "data": call_data }, tag]),
                )
                .await
            }
        }
    }

    /// `Ok(None)` when the network has no configured endpoint or a token
    /// asset lacks its contract.
    pub async fn observe(
        &self,
        input: &ObservePaymentRequestInput,
        expected: U512,
    ) -> AppResult<Option<ObservePaymentRequestOutput>> {
        let network = input.network.trim().to_ascii_lowercase();
        let Some(url) = self.rpc_urls.get(&network) else {
            return Ok(None);
        };
        let address = input.address_canonical.trim().to_ascii_lowercase();

        let balance = match input.token_contract.as_deref().map(str::trim) {
            Some(contract) if !contract.is_empty() => Balance::Erc20 {
                contract,
                call_data: balance_of_call_data(&address).ok_or_else(|| {
                    AppError::internal(
                        "chain_observation_failed",
                        "payment request address is not a valid evm address",
                    )
                    .with("network", network.clone())
                })?,
            },
            _ if input.token_standard.is_some() => return Ok(None),
            _ => Balance::Native { address: &address },
        };

        let head = self.call(url, &network, "eth_blockNumber", json!([])).await?;
        let latest = head
            .as_str()
            .and_then(parse_block_number)
            .ok_or_else(|| {
                observation_failed("evm rpc returned an invalid block number", &network)
                    .with("result", head.to_string())
            })?;

        let total = self.balance_at(url, &network, &balance, &block_tag(latest)).await?;
        let confirmed = match confirmed_height(latest, self.min_confirmations) {
            Some(height) if height == latest => total,
            Some(height) => {
                self.balance_at(url, &network, &balance, &block_tag(height))
                    .await?
            }
            None => U512::ZERO,
        };

        let evaluation = self.policy.evaluate(expected, total, confirmed);
        let mut details = Map::new();
        details.insert("network".into(), json!(network));
        details.insert("asset".into(), json!(input.asset.trim().to_ascii_uppercase()));
        details.insert("total_observed_minor".into(), json!(total.to_string()));
        details.insert("confirmed_observed_minor".into(), json!(confirmed.to_string()));
        details.insert("latest_block_height".into(), json!(latest));
        details.insert("min_confirmations".into(), json!(self.min_confirmations));
        details.insert(
            "required_detected_minor".into(),
            json!(evaluation.required_detected.to_string()),
        );
        details.insert(
            "required_confirmed_minor".into(),
            json!(evaluation.required_confirmed.to_string()),
        );

        Ok(Some(ObservePaymentRequestOutput {
            supported: true,
            observed_amount_minor: total.to_string(),
            detected: evaluation.detected,
            confirmed: evaluation.confirmed,
            source: SOURCE.to_string(),
            details,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quantities_parse_as_hex() {
        assert_eq!(parse_quantity("0x0"), Some(U512::ZERO));
        assert_eq!(parse_quantity("0x"), Some(U512::ZERO));
        assert_eq!(parse_quantity("0x3e8"), Some(U512::from(1000u64)));
        assert_eq!(parse_quantity("1000"), None);
        assert_eq!(parse_quantity("0xzz"), None);
    }

    #[test]
    fn balance_of_pads_the_address() {
        let data = balance_of_call_data("0x61ED32E69DB70C5ABAB0522D80E8F5DB215965DE").unwrap();
        assert_eq!(
            data,
            "0x70a08231\
             000000000000000000000000\
             61ed32e69db70c5abab0522d80e8f5db215965de"
        );
        assert_eq!(data.len(), 10 + 64);
        assert!(balance_of_call_data("0x1234").is_none());
    }

    #[test]
    fn confirmed_height_steps_back_from_latest() {
        assert_eq!(confirmed_height(100, 1), Some(100));
        assert_eq!(confirmed_height(100, 6), Some(95));
        assert_eq!(confirmed_height(3, 6), None);
        assert_eq!(confirmed_height(100, 0), Some(100));
    }

    #[test]
    fn block_tags_are_hex() {
        assert_eq!(block_tag(0), "0x0");
        assert_eq!(block_tag(255), "0xff");
        assert_eq!(parse_block_number("0xff"), Some(255));
        assert_eq!(parse_block_number("0x"), None);
    }
}
