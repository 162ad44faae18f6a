//! Chain observers behind [`ChainObserverGateway`].
//!
//! [`ObserverRouter`] picks the observer for a request's chain. A chain or
//! network without a configured endpoint is reported as unsupported, never as
//! an error.

pub mod esplora;
pub mod evm;

use async_trait::async_trait;
use chaintx::config::ReconcilerConfig;
use chaintx::ports::ChainObserverGateway;
use chaintx::threshold::{parse_expected_amount, ThresholdPolicy};
use chaintx::wallet::{CHAIN_BITCOIN, CHAIN_ETHEREUM};
use chaintx::{AppError, AppResult, ObservePaymentRequestInput, ObservePaymentRequestOutput};

pub use esplora::EsploraObserver;
pub use evm::EvmObserver;

pub(crate) fn observation_failed(message: &str, network: &str) -> AppError {
    AppError::internal("chain_observation_failed", message).with("network", network)
}

pub struct ObserverRouter {
    bitcoin: Option<EsploraObserver>,
    evm: Option<EvmObserver>,
}

impl ObserverRouter {
    pub fn new(bitcoin: Option<EsploraObserver>, evm: Option<EvmObserver>) -> Self {
        Self { bitcoin, evm }
    }

    pub fn from_config(client: reqwest::Client, config: &ReconcilerConfig) -> Self {
        let policy = ThresholdPolicy::new(
            config.detected_threshold_bps,
            config.confirmed_threshold_bps,
        );
        let bitcoin = config
            .btc_esplora_base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
            .map(|url| {
                EsploraObserver::new(client.clone(), url, config.btc_min_confirmations, policy)
            });
        let evm = (!config.evm_rpc_urls.is_empty()).then(|| {
            EvmObserver::new(
                client.clone(),
                &config.evm_rpc_urls,
                config.evm_min_confirmations,
                policy,
            )
        });
        Self::new(bitcoin, evm)
    }

    /// Whether any chain has an endpoint.
    pub fn is_configured(&self) -> bool {
        self.bitcoin.is_some() || self.evm.is_some()
    }
}

#[async_trait]
impl ChainObserverGateway for ObserverRouter {
    async fn observe(
        &self,
        input: &ObservePaymentRequestInput,
    ) -> AppResult<ObservePaymentRequestOutput> {
        let expected = parse_expected_amount(input.expected_amount_minor.as_deref())?;
        let chain = input.chain.trim().to_ascii_lowercase();
        let observed = match chain.as_str() {
            CHAIN_BITCOIN => match &self.bitcoin {
                Some(observer) => Some(observer.observe(input, expected).await?),
                None => None,
            },
            CHAIN_ETHEREUM => match &self.evm {
                Some(observer) => observer.observe(input, expected).await?,
                None => None,
            },
            _ => None,
        };
        Ok(observed.unwrap_or_else(ObservePaymentRequestOutput::unsupported))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(chain: &str, network: &str) -> ObservePaymentRequestInput {
        ObservePaymentRequestInput {
            request_id: "pr_1".into(),
            chain: chain.into(),
            network: network.into(),
            asset: "ETH".into(),
            expected_amount_minor: Some("1000".into()),
            address_canonical: "0x61ed32e69db70c5abab0522d80e8f5db215965de".into(),
            chain_id: None,
            token_standard: None,
            token_contract: None,
            token_decimals: None,
        }
    }

    #[tokio::test]
    async fn unconfigured_chains_are_unsupported() {
        let router = ObserverRouter::new(None, None);
        assert!(!router.is_configured());
        let out = router.observe(&input("bitcoin", "regtest")).await.unwrap();
        assert!(!out.supported);
        let out = router.observe(&input("solana", "mainnet")).await.unwrap();
        assert!(!out.supported);
    }

    #[tokio::test]
    async fn evm_network_without_endpoint_is_unsupported() {
        let urls = [("sepolia".to_string(), "http://127.0.0.1:1".to_string())].into();
        let evm = EvmObserver::new(reqwest::Client::new(), &urls, 1, ThresholdPolicy::new(0, 0));
        assert!(evm.supports(" Sepolia "));
        let router = ObserverRouter::new(None, Some(evm));
        let out = router.observe(&input("ethereum", "mainnet")).await.unwrap();
        assert!(!out.supported);
    }

    #[tokio::test]
    async fn malformed_expectation_is_rejected_before_any_call() {
        let router = ObserverRouter::new(None, None);
        let mut bad = input("bitcoin", "regtest");
        bad.expected_amount_minor = Some("12a".into());
        let err = router.observe(&bad).await.unwrap_err();
        assert_eq!(err.code, "invalid_request");
    }
}
