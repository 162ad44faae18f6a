use async_trait::async_trait;
use chaintx::keys::DERIVATION_PATH_TEMPLATE;
use chaintx::ports::WalletAccountSyncRepository;
use chaintx::wallet_sync::{plan_wallet_sync, WalletSyncCommand, WalletSyncOutcome};
use chaintx::{AppError, AppResult, KeysetTarget, WalletSyncEventDetails};
use sqlx::Row;

use crate::error::{QueryContext, StoreError};
use crate::rows::{self, WALLET_COLUMNS};
use crate::store::PgStore;

#[async_trait]
impl WalletAccountSyncRepository for PgStore {
    async fn list_sync_targets(&self) -> AppResult<Vec<KeysetTarget>> {
        let records = sqlx::query(
            r#"
            SELECT DISTINCT lower(btrim(c.chain)) AS chain,
                            lower(btrim(c.network)) AS network,
                            btrim(w.keyset_id) AS keyset_id
            FROM app.asset_catalog c
            JOIN app.wallet_accounts w ON w.id = c.wallet_account_id
            WHERE c.enabled
            ORDER BY 1, 2, 3
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("wallet_sync_targets_failed", "failed to list wallet sync targets")?;

        records
            .iter()
            .map(|row| -> Result<KeysetTarget, StoreError> {
                Ok(KeysetTarget {
                    chain: row.try_get("chain")?,
                    network: row.try_get("network")?,
                    keyset_id: row.try_get("keyset_id")?,
                })
            })
            .collect::<Result<Vec<_>, _>>()
            .context("wallet_sync_targets_failed", "failed to decode wallet sync targets")
    }

    async fn sync_target(&self, command: &WalletSyncCommand) -> AppResult<WalletSyncOutcome> {
        let target = &command.target;
        let now = command.now;
        let mut tx = self
            .pool
            .begin()
            .await
            .context("wallet_sync_tx_begin_failed", "failed to start wallet sync transaction")?;

        let bound: Vec<(String, String, String)> = sqlx::query_as(
            r#"
            SELECT c.chain, c.network, c.asset
            FROM app.asset_catalog c
            JOIN app.wallet_accounts w ON w.id = c.wallet_account_id
            WHERE c.chain = $1 AND c.network = $2 AND w.keyset_id = $3
            ORDER BY c.asset
            FOR UPDATE OF c
            "#,
        )
        .bind(&target.chain)
        .bind(&target.network)
        .bind(&target.keyset_id)
        .fetch_all(&mut *tx)
        .await
        .context("wallet_sync_catalog_lock_failed", "failed to lock asset catalog rows")?;
        if bound.is_empty() {
            return Err(AppError::internal(
                "invalid_configuration",
                "no asset catalog row found for wallet sync target",
            )
            .with("chain", target.chain.clone())
            .with("network", target.network.clone())
            .with("keyset_id", target.keyset_id.clone()));
        }

        let records = sqlx::query(&format!(
            "SELECT {WALLET_COLUMNS} FROM app.wallet_accounts \
             WHERE chain = $1 AND network = $2 AND keyset_id = $3 \
             ORDER BY id FOR UPDATE"
        ))
        .bind(&target.chain)
        .bind(&target.network)
        .bind(&target.keyset_id)
        .fetch_all(&mut *tx)
        .await
        .context("wallet_sync_wallet_lock_failed", "failed to lock wallet accounts")?;
        let wallets = records
            .iter()
            .map(rows::wallet_account)
            .collect::<Result<Vec<_>, _>>()
            .context("wallet_sync_wallet_lock_failed", "failed to decode wallet accounts")?;

        let plan = plan_wallet_sync(command, &wallets);

        // At most one active row per target, so demote before promoting.
        sqlx::query(
            r#"
            UPDATE app.wallet_accounts
            SET is_active = FALSE, updated_at = $5
            WHERE chain = $1 AND network = $2 AND keyset_id = $3 AND is_active AND id <> $4
            "#,
        )
        .bind(&target.chain)
        .bind(&target.network)
        .bind(&target.keyset_id)
        .bind(&plan.wallet_account_id)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("wallet_sync_update_failed", "failed to deactivate wallet accounts")?;

        if plan.create {
            sqlx::query(
                r#"
                INSERT INTO app.wallet_accounts (
                    id, chain, network, keyset_id, derivation_path_template, next_index,
                    is_active, key_material_hash, key_material_hash_algo, created_at, updated_at
                ) VALUES ($1, $2, $3, $4, $5, 0, TRUE, $6, $7, $8, $8)
                "#,
            )
            .bind(&plan.wallet_account_id)
            .bind(&target.chain)
            .bind(&target.network)
            .bind(&target.keyset_id)
            .bind(DERIVATION_PATH_TEMPLATE)
            .bind(&command.active_hash)
            .bind(&command.key_material_hash_algo)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("wallet_sync_insert_failed", "failed to insert wallet account")?;
        } else {
            sqlx::query(
                r#"
                UPDATE app.wallet_accounts
                SET derivation_path_template = $2, key_material_hash = $3,
                    key_material_hash_algo = $4, is_active = TRUE, updated_at = $5
                WHERE id = $1
                "#,
            )
            .bind(&plan.wallet_account_id)
            .bind(DERIVATION_PATH_TEMPLATE)
            .bind(&command.active_hash)
            .bind(&command.key_material_hash_algo)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("wallet_sync_update_failed", "failed to activate wallet account")?;
        }

        for (chain, network, asset) in &bound {
            sqlx::query(
                r#"
                UPDATE app.asset_catalog
                SET wallet_account_id = $4, updated_at = $5
                WHERE chain = $1 AND network = $2 AND asset = $3
                "#,
            )
            .bind(chain)
            .bind(network)
            .bind(asset)
            .bind(&plan.wallet_account_id)
            .bind(now)
            .execute(&mut *tx)
            .await
            .context("wallet_sync_catalog_update_failed", "failed to rebind asset catalog")?;
        }

        let details = serde_json::to_value(WalletSyncEventDetails {
            previous_active_wallet_account_id: plan.previous_active_wallet_account_id.clone(),
            selected_from: plan.selected_from,
            hash_prefix: command.hash_prefix(),
        })
        .map_err(|e| {
            AppError::internal("wallet_sync_event_failed", "failed to encode sync event details")
                .with("error", e.to_string())
        })?;
        sqlx::query(
            r#"
            INSERT INTO app.wallet_account_sync_events (
                chain, network, keyset_id, wallet_account_id, action, match_source,
                key_material_hash, key_material_hash_algo, details, created_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(&target.chain)
        .bind(&target.network)
        .bind(&target.keyset_id)
        .bind(&plan.wallet_account_id)
        .bind(plan.action.as_str())
        .bind(plan.match_source.as_str())
        .bind(&command.active_hash)
        .bind(&command.key_material_hash_algo)
        .bind(details)
        .bind(now)
        .execute(&mut *tx)
        .await
        .context("wallet_sync_event_failed", "failed to record wallet sync event")?;

        tx.commit()
            .await
            .context("wallet_sync_tx_commit_failed", "failed to commit wallet sync")?;

        tracing::info!(
            chain = %target.chain,
            network = %target.network,
            keyset_id = %target.keyset_id,
            wallet_account_id = %plan.wallet_account_id,
            action = plan.action.as_str(),
            match_source = plan.match_source.as_str(),
            "wallet account synced"
        );
        Ok(WalletSyncOutcome {
            action: plan.action,
            match_source: plan.match_source,
            wallet_account_id: plan.wallet_account_id,
            key_hash: command.active_hash.clone(),
        })
    }
}
