//! Bitcoin observation through an Esplora-compatible REST API.

use alloy::primitives::U512;
use chaintx::threshold::ThresholdPolicy;
use chaintx::{AppError, AppResult, ObservePaymentRequestInput, ObservePaymentRequestOutput};
use serde::Deserialize;
use serde_json::{json, Map, Value};

use super::observation_failed;

pub const SOURCE: &str = "btc_esplora";

#[derive(Debug, Deserialize)]
struct TxoStats {
    #[serde(default)]
    funded_txo_sum: u64,
}

#[derive(Debug, Deserialize)]
struct AddressStats {
    chain_stats: TxoStats,
    mempool_stats: TxoStats,
}

#[derive(Debug, Deserialize)]
struct UtxoStatus {
    #[serde(default)]
    confirmed: bool,
    #[serde(default)]
    block_height: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct Utxo {
    value: u64,
    status: UtxoStatus,
}

/// Confirmations of a UTXO at `tip`; unconfirmed outputs have none.
fn confirmations(utxo: &Utxo, tip: i64) -> i64 {
    match utxo.status.block_height {
        Some(height) if utxo.status.confirmed && height > 0 => (tip - height + 1).max(0),
        _ => 0,
    }
}

pub struct EsploraObserver {
    client: reqwest::Client,
    base_url: String,
    min_confirmations: i64,
    policy: ThresholdPolicy,
}

impl EsploraObserver {
    pub fn new(
        client: reqwest::Client,
        base_url: &str,
        min_confirmations: i64,
        policy: ThresholdPolicy,
    ) -> Self {
        Self {
            client,
            base_url: base_url.trim().trim_end_matches('/').to_string(),
            min_confirmations: min_confirmations.max(1),
            policy,
        }
    }

    async fn get(&self, path: &str, network: &str) -> AppResult<reqwest::Response> {
        let endpoint = format!("{}{path}", self.base_url);
        let response = self.client.get(&endpoint).send().await.map_err(|e| {
            observation_failed("failed to query bitcoin observation endpoint", network)
                .with("error", e.to_string())
        })?;
        if !response.status().is_success() {
            return Err(observation_failed(
                "bitcoin observation endpoint returned non-success status",
                network,
            )
            .with("status_code", response.status().as_u16())
            .with("path", path));
        }
        Ok(response)
    }

    async fn get_json<T: for<'de> Deserialize<'de>>(&self, path: &str, network: &str) -> AppResult<T> {
        self.get(path, network).await?.json::<T>().await.map_err(|e| {
            observation_failed("failed to decode bitcoin observation payload", network)
                .with("error", e.to_string())
                .with("path", path)
        })
    }

    async fn tip_height(&self, network: &str) -> AppResult<i64> {
        let body = self
            .get("/blocks/tip/height", network)
            .await?
            .text()
            .await
            .map_err(|e| {
                observation_failed("failed to read bitcoin tip height", network)
                    .with("error", e.to_string())
            })?;
        match body.trim().parse::<i64>() {
            Ok(height) if height >= 0 => Ok(height),
            _ => Err(observation_failed("failed to parse bitcoin tip height", network)
                .with("body", body.trim().chars().take(64).collect::<String>())),
        }
    }

    pub async fn observe(
        &self,
        input: &ObservePaymentRequestInput,
        expected: U512,
    ) -> AppResult<ObservePaymentRequestOutput> {
        let network = input.network.trim().to_ascii_lowercase();
        let address = input.address_canonical.trim();
        if address.is_empty() {
            return Err(AppError::internal(
                "chain_observation_failed",
                "payment request has no address to observe",
            )
            .with("network", network));
        }
        let address_path = format!("/address/{address}");

        let stats: AddressStats = self.get_json(&address_path, &network).await?;
        let tip = self.tip_height(&network).await?;
        let utxos: Vec<Utxo> = self
            .get_json(&format!("{address_path}/utxo"), &network)
            .await?;

        let total = U512::from(stats.chain_stats.funded_txo_sum)
            + U512::from(stats.mempool_stats.funded_txo_sum);
        let confirmed = utxos
            .iter()
            .filter(|u| confirmations(u, tip) >= self.min_confirmations)
            .fold(U512::ZERO, |sum, u| sum + U512::from(u.value));

        let evaluation = self.policy.evaluate(expected, total, confirmed);
        let mut details = Map::new();
        details.insert("network".into(), json!(network));
        details.insert("total_observed_minor".into(), json!(total.to_string()));
        details.insert("confirmed_observed_minor".into(), json!(confirmed.to_string()));
        details.insert("latest_block_height".into(), json!(tip));
        details.insert("min_confirmations".into(), json!(self.min_confirmations));
        details.insert(
            "required_detected_minor".into(),
            Value::String(evaluation.required_detected.to_string()),
        );
        details.insert(
            "required_confirmed_minor".into(),
            Value::String(evaluation.required_confirmed.to_string()),
        );

        Ok(ObservePaymentRequestOutput {
            supported: true,
            observed_amount_minor: total.to_string(),
            detected: evaluation.detected,
            confirmed: evaluation.confirmed,
            source: SOURCE.to_string(),
            details,
        })
    }
}
