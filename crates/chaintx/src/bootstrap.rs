//! Startup sequence shared by every binary that touches the database.
//!
//! Readiness with retries, schema migrations, the devtest wallet-account sync
//! and asset-catalog integrity. Any error here is fatal.

use std::time::Duration;

use tokio::time::Instant;

use crate::catalog::{validate_catalog_rows, CatalogIntegrityPolicy};
use crate::clock::Clock;
use crate::config::{Config, DB_READINESS_RETRY_INTERVAL, DB_READINESS_TIMEOUT};
use crate::error::{AppError, AppResult};
use crate::ports::{PersistenceBootstrap, WalletAccountSyncRepository};
use crate::wallet::{AllocationMode, DevtestAllocator, WalletAllocator};
use crate::wallet_sync::{sync_wallet_accounts, WalletSyncOutcome, WalletSyncSecrets};

/// Retry `check_readiness` every `interval` until it succeeds or `timeout`
/// elapses.
pub async fn wait_for_readiness(
    store: &dyn PersistenceBootstrap,
    timeout: Duration,
    interval: Duration,
) -> AppResult<()> {
    let deadline = Instant::now() + timeout;
    let mut attempt = 0u32;
    loop {
        attempt += 1;
        match store.check_readiness().await {
            Ok(()) => {
                tracing::info!(attempt, "database ready");
                return Ok(());
            }
            Err(e) if Instant::now() + interval < deadline => {
                tracing::warn!(attempt, code = %e.code, "database not ready, retrying");
                tokio::time::sleep(interval).await;
            }
            Err(e) => {
                return Err(AppError::internal(
                    "db_readiness_timeout",
                    "database readiness check timed out",
                )
                .with("attempts", attempt)
                .with("timeout_seconds", timeout.as_secs())
                .with("last_code", e.code));
            }
        }
    }
}

pub fn catalog_policy(config: &Config) -> CatalogIntegrityPolicy {
    CatalogIntegrityPolicy {
        allocation_mode: config.allocation_mode,
        devtest_allow_mainnet: config.devtest_allow_mainnet,
        devtest_keysets: config.devtest_keysets.clone(),
        address_scheme_allow_list: config.address_scheme_allow_list.clone(),
    }
}

pub fn build_allocator(config: &Config) -> WalletAllocator {
    match config.allocation_mode {
        AllocationMode::Devtest => WalletAllocator::Devtest(DevtestAllocator::new(
            config.devtest_allow_mainnet,
            &config.devtest_keysets,
        )),
        AllocationMode::Prod => WalletAllocator::Prod,
    }
}

/// What startup did, for the composition root's log line.
#[derive(Debug, Default)]
pub struct StartupReport {
    pub catalog_rows: usize,
    pub wallet_sync: Vec<WalletSyncOutcome>,
}

/// Readiness, migrations, wallet sync, then catalog integrity. The integrity
/// check sees the bindings written by the sync.
pub async fn run_startup(
    store: &dyn PersistenceBootstrap,
    sync_repo: &dyn WalletAccountSyncRepository,
    config: &Config,
    clock: &dyn Clock,
) -> AppResult<StartupReport> {
    wait_for_readiness(store, DB_READINESS_TIMEOUT, DB_READINESS_RETRY_INTERVAL).await?;
    store.run_migrations().await?;
    tracing::info!("schema migrations applied");

    let mut report = StartupReport::default();
    if config.allocation_mode == AllocationMode::Devtest {
        let secrets = WalletSyncSecrets {
            active: config.keyset_hash_hmac_secret.clone(),
            previous: config.keyset_hash_hmac_previous_secrets.clone(),
        };
        report.wallet_sync = sync_wallet_accounts(
            sync_repo,
            &config.devtest_keysets,
            &config.devtest_preflights,
            &secrets,
            clock,
        )
        .await?;
    }

    let rows = store.load_catalog_integrity_rows().await?;
    validate_catalog_rows(&rows, &catalog_policy(config))?;
    report.catalog_rows = rows.len();
    tracing::info!(
        rows = report.catalog_rows,
        allocation_mode = config.allocation_mode.as_str(),
        "asset catalog integrity validated"
    );
    Ok(report)
}
