use std::time::Duration;

use async_trait::async_trait;
use chaintx::bootstrap::{run_startup, StartupReport};
use chaintx::catalog::CatalogIntegrityRow;
use chaintx::ports::{AssetCatalogReadModel, PersistenceBootstrap};
use chaintx::{AppError, AppResult, AssetCatalogEntry, Clock, Config};
use sqlx::postgres::{PgPool, PgPoolOptions};

use crate::error::QueryContext;
use crate::rows::{self, CATALOG_COLUMNS};

/// Embedded schema, applied statement by statement at startup.
const SCHEMA: &str = include_str!("schema.sql");

const DEFAULT_MAX_CONNECTIONS: u32 = 10;
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_MAX_ATTEMPTS: i32 = 8;

fn schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// How status transitions feed the webhook outbox.
#[derive(Debug, Clone, Copy)]
pub struct OutboxSettings {
    pub enabled: bool,
    pub max_attempts: i32,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// PostgreSQL implementation of every storage port.
#[derive(Clone)]
pub struct PgStore {
    pub(crate) pool: PgPool,
    pub(crate) outbox: OutboxSettings,
}

impl PgStore {
    /// Build a pool that connects on first use, so readiness can be retried
    /// by the caller.
    pub fn connect_lazy(database_url: &str) -> AppResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(DEFAULT_MAX_CONNECTIONS)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect_lazy(database_url)
            .map_err(|e| {
                AppError::internal("invalid_configuration", "DATABASE_URL is not a valid connection string")
                    .with("error", e.to_string())
            })?;
        Ok(Self::from_pool(pool))
    }

    /// Connect with the configured outbox settings and run the shared
    /// startup sequence.
    pub async fn bootstrap(config: &Config, clock: &dyn Clock) -> AppResult<(Self, StartupReport)> {
        let store = Self::connect_lazy(&config.database_url)?.with_outbox(OutboxSettings {
            enabled: config.webhook.enabled,
            max_attempts: config.webhook.max_attempts,
        });
        tracing::info!(database = %config.database_target, "connecting to database");
        let report = run_startup(&store, &store, config, clock).await?;
        Ok((store, report))
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self {
            pool,
            outbox: OutboxSettings::default(),
        }
    }

    pub fn with_outbox(mut self, settings: OutboxSettings) -> Self {
        self.outbox = settings;
        self
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

impl std::fmt::Debug for PgStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PgStore")
            .field("pool_size", &self.pool.size())
            .field("outbox", &self.outbox)
            .finish()
    }
}

#[async_trait]
impl PersistenceBootstrap for PgStore {
    async fn check_readiness(&self) -> AppResult<()> {
        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .context("db_not_ready", "database is not ready")?;
        Ok(())
    }

    async fn run_migrations(&self) -> AppResult<()> {
        for statement in schema_statements(SCHEMA) {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("db_migration_apply_failed", "failed to apply migrations")?;
        }
        Ok(())
    }

    async fn load_catalog_integrity_rows(&self) -> AppResult<Vec<CatalogIntegrityRow>> {
        let records = sqlx::query(
            r#"
            SELECT c.chain, c.network, c.asset, c.wallet_account_id, c.address_scheme,
                   c.default_expires_in_seconds, c.chain_id, c.token_standard,
                   c.token_contract, c.token_decimals,
                   w.id AS w_id, w.chain AS w_chain, w.network AS w_network,
                   w.keyset_id AS w_keyset_id,
                   w.derivation_path_template AS w_derivation_path_template,
                   w.next_index AS w_next_index, COALESCE(w.is_active, FALSE) AS w_is_active
            FROM app.asset_catalog c
            LEFT JOIN app.wallet_accounts w ON w.id = c.wallet_account_id
            WHERE c.enabled
            ORDER BY c.chain, c.network, c.asset
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("catalog_integrity_query_failed", "failed to load asset catalog")?;

        records.iter()
            .map(rows::catalog_integrity)
            .collect::<Result<Vec<_>, _>>()
            .context("catalog_integrity_query_failed", "failed to decode asset catalog")
    }
}

#[async_trait]
impl AssetCatalogReadModel for PgStore {
    async fn list_enabled(&self) -> AppResult<Vec<AssetCatalogEntry>> {
        let records = sqlx::query(&format!(
            "SELECT {CATALOG_COLUMNS} FROM app.asset_catalog WHERE enabled \
             ORDER BY chain, network, asset"
        ))
        .fetch_all(&self.pool)
        .await
        .context("asset_catalog_query_failed", "failed to list asset catalog")?;

        records.iter()
            .map(rows::catalog_entry)
            .collect::<Result<Vec<_>, _>>()
            .context("asset_catalog_query_failed", "failed to decode asset catalog")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_splits_into_statements() {
        let statements = schema_statements(SCHEMA);
        assert!(statements[0].ends_with("CREATE SCHEMA IF NOT EXISTS app"));
        assert!(statements.iter().all(|s| s.contains("IF NOT EXISTS")));
        assert!(statements
            .iter()
            .any(|s| s.contains("CREATE TABLE IF NOT EXISTS app.webhook_outbox_events")));
    }

    #[test]
    fn comment_only_chunks_are_dropped() {
        let statements = schema_statements("-- header\n;\nSELECT 1;\n  \n");
        assert_eq!(statements, vec!["SELECT 1"]);
    }
}
