//! Postgres quota ledger (`quota_accounts` table).
//!
//! Movements are one `UPDATE ... RETURNING` each; the row lock taken by the
//! update is the only synchronisation.

use sqlx::Row;
use sqlx::postgres::PgRow;

use dirpack_quota::{OwnerKey, QuotaAccount, QuotaMovement};

use super::store::{QuotaLedger, QuotaStoreError};
use crate::pg::{self, PgRuntime};

#[derive(Debug, Clone)]
pub struct PostgresQuotaLedger {
    rt: PgRuntime,
}

impl PostgresQuotaLedger {
    pub fn new(rt: PgRuntime) -> Self {
        Self { rt }
    }
}

fn storage(operation: &'static str) -> impl FnOnce(sqlx::Error) -> QuotaStoreError {
    move |e| QuotaStoreError::Storage(pg::describe(operation, e))
}

fn get_bytes(row: &PgRow, column: &str) -> Result<u64, QuotaStoreError> {
    row.try_get::<i64, _>(column)
        .map(pg::from_db_bytes)
        .map_err(|e| QuotaStoreError::Storage(format!("failed to decode {column}: {e}")))
}

fn movement(row: &PgRow, requested: u64) -> Result<QuotaMovement, QuotaStoreError> {
    let before = get_bytes(row, "used_before")?;
    let after = get_bytes(row, "used_after")?;
    Ok(QuotaMovement {
        requested,
        applied: before.abs_diff(after),
        bytes_used_after: after,
    })
}

impl QuotaLedger for PostgresQuotaLedger {
    fn open_account(&self, key: &OwnerKey, bytes_available: u64) -> Result<QuotaAccount, QuotaStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    INSERT INTO quota_accounts (owner_key, bytes_available, bytes_used, updated_at)
                    VALUES ($1, $2, 0, now())
                    ON CONFLICT (owner_key)
                    DO UPDATE SET bytes_available = EXCLUDED.bytes_available, updated_at = now()
                    RETURNING bytes_available, bytes_used
                    "#,
                )
                .bind(key.as_str())
                .bind(pg::to_db_bytes(bytes_available))
                .fetch_one(self.rt.pool()),
            )
            .map_err(storage("open_account"))?;
        Ok(QuotaAccount::with_usage(
            key.clone(),
            get_bytes(&row, "bytes_available")?,
            get_bytes(&row, "bytes_used")?,
        ))
    }

    fn account(&self, key: &OwnerKey) -> Result<Option<QuotaAccount>, QuotaStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query("SELECT bytes_available, bytes_used FROM quota_accounts WHERE owner_key = $1")
                    .bind(key.as_str())
                    .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("get_account"))?;
        row.map(|row| {
            Ok(QuotaAccount::with_usage(
                key.clone(),
                get_bytes(&row, "bytes_available")?,
                get_bytes(&row, "bytes_used")?,
            ))
        })
        .transpose()
    }

    fn debit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    UPDATE quota_accounts
                    SET bytes_used = bytes_used + $2, updated_at = now()
                    WHERE owner_key = $1
                    RETURNING bytes_used - $2 AS used_before, bytes_used AS used_after
                    "#,
                )
                .bind(key.as_str())
                .bind(pg::to_db_bytes(bytes))
                .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("debit"))?
            .ok_or_else(|| QuotaStoreError::UnknownAccount(key.clone()))?;
        movement(&row, bytes)
    }

    fn credit(&self, key: &OwnerKey, bytes: u64) -> Result<QuotaMovement, QuotaStoreError> {
        let row = self
            .rt
            .block_on(
                sqlx::query(
                    r#"
                    WITH prev AS (
                        SELECT owner_key, bytes_used FROM quota_accounts
                        WHERE owner_key = $1
                        FOR UPDATE
                    )
                    UPDATE quota_accounts q
                    SET bytes_used = GREATEST(q.bytes_used - $2, 0), updated_at = now()
                    FROM prev
                    WHERE q.owner_key = prev.owner_key
                    RETURNING prev.bytes_used AS used_before, q.bytes_used AS used_after
                    "#,
                )
                .bind(key.as_str())
                .bind(pg::to_db_bytes(bytes))
                .fetch_optional(self.rt.pool()),
            )
            .map_err(storage("credit"))?
            .ok_or_else(|| QuotaStoreError::UnknownAccount(key.clone()))?;
        movement(&row, bytes)
    }
}
