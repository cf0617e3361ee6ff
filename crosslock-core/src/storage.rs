//! Persistent state: swap sessions, processed events, chain cursors.
//!
//! The swaps table is the source of truth for every session; the
//! processed_events idempotency index is the only state consulted to decide
//! whether an observed event is acted upon. Cursors are written in the same
//! transaction as the events they cover, so a crash can never leave a cursor
//! ahead of unprocessed events. Swap mutations are compare-and-set on the
//! row version, so writers that slip past the coordinator's partitioning
//! (the admin surface, most notably) still cannot clobber each other.

use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use std::time::Duration;

use crate::error::RelayerError;
use crate::event::{Chain, ChainEvent};
use crate::swap::{SwapSession, SwapStatus};

const UPDATE_RETRY_ATTEMPTS: u32 = 5;

/// Outcome of recording an observed event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    /// First sighting; forward downstream.
    Applied,
    /// Idempotency key already present; drop silently.
    Duplicate,
}

#[derive(Debug, Clone)]
pub struct StoredError {
    pub event_key: String,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug)]
pub struct RelayerStorage {
    pool: SqlitePool,
}

impl RelayerStorage {
    pub async fn new(database_url: &str, max_connections: u32, busy_timeout_ms: u64) -> Result<Self> {
        let file_path = if let Some(stripped) = database_url.strip_prefix("sqlite://") {
            stripped.split('?').next().unwrap_or(stripped)
        } else {
            database_url
        };

        if let Some(parent) = std::path::Path::new(file_path).parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        tracing::info!("Connecting to relayer database: sqlite://{}", file_path);

        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(
                sqlx::sqlite::SqliteConnectOptions::new()
                    .filename(file_path)
                    .create_if_missing(true)
                    .pragma("synchronous", "NORMAL")
                    .pragma("journal_mode", "WAL")
                    .pragma("foreign_keys", "ON")
                    .busy_timeout(Duration::from_millis(busy_timeout_ms)),
            )
            .await?;

        let storage = RelayerStorage { pool };
        storage.initialize_tables().await?;
        Ok(storage)
    }

    /// Single-connection in-memory store, used by tests and by the
    /// integration suite.
    pub async fn in_memory() -> Result<Self> {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let storage = RelayerStorage { pool };
        storage.initialize_tables().await?;
        Ok(storage)
    }

    async fn initialize_tables(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS swaps (
                swap_id TEXT PRIMARY KEY,
                status TEXT NOT NULL,
                source_chain TEXT NOT NULL,
                initiator TEXT NOT NULL,
                receiver TEXT NOT NULL,
                evm_contract_id TEXT,
                move_contract_id TEXT,
                hashlock TEXT NOT NULL UNIQUE,
                preimage TEXT,
                amount TEXT NOT NULL,
                token_source TEXT NOT NULL,
                token_target TEXT NOT NULL,
                timelock INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                retry_count INTEGER NOT NULL DEFAULT 0,
                max_retries INTEGER NOT NULL DEFAULT 3,
                error_messages TEXT NOT NULL DEFAULT '[]',
                source_tx_hash TEXT NOT NULL,
                target_tx_hash TEXT,
                refund_tx_hash TEXT
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS processed_events (
                chain TEXT NOT NULL,
                contract_id TEXT NOT NULL,
                event_type TEXT NOT NULL,
                tx_hash TEXT NOT NULL,
                log_index INTEGER NOT NULL,
                payload TEXT NOT NULL,
                observed_at TEXT NOT NULL,
                processed_at TEXT NOT NULL,
                result TEXT NOT NULL DEFAULT 'applied',
                PRIMARY KEY (chain, contract_id, event_type, tx_hash, log_index)
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS chain_cursors (
                source TEXT PRIMARY KEY,
                position INTEGER NOT NULL,
                updated_at TEXT NOT NULL
            ) WITHOUT ROWID
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS event_errors (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                event_key TEXT NOT NULL,
                error TEXT NOT NULL,
                created_at TEXT NOT NULL
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        self.create_indexes().await?;

        tracing::info!("Relayer database tables initialized");
        Ok(())
    }

    async fn create_indexes(&self) -> Result<()> {
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_swaps_evm_contract
             ON swaps(evm_contract_id) WHERE evm_contract_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_swaps_move_contract
             ON swaps(move_contract_id) WHERE move_contract_id IS NOT NULL",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_swaps_status ON swaps(status, updated_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_swaps_expires ON swaps(expires_at ASC)",
        )
        .execute(&self.pool)
        .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_event_errors_key ON event_errors(event_key, created_at DESC)",
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    pub async fn is_reachable(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // ---- swap repository ----

    /// Inserts the swap unless its id or hashlock already exists. Returns
    /// true when a row was created.
    pub async fn create_swap_if_absent(&self, swap: &SwapSession) -> Result<bool, RelayerError> {
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO swaps (
                swap_id, status, source_chain, initiator, receiver,
                evm_contract_id, move_contract_id, hashlock, preimage,
                amount, token_source, token_target, timelock,
                created_at, updated_at, expires_at,
                retry_count, max_retries, error_messages,
                source_tx_hash, target_tx_hash, refund_tx_hash
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&swap.swap_id)
        .bind(swap.status.as_str())
        .bind(swap.source_chain.as_str())
        .bind(&swap.initiator)
        .bind(&swap.receiver)
        .bind(&swap.evm_contract_id)
        .bind(&swap.move_contract_id)
        .bind(&swap.hashlock)
        .bind(&swap.preimage)
        .bind(&swap.amount)
        .bind(&swap.token_source)
        .bind(&swap.token_target)
        .bind(swap.timelock as i64)
        .bind(swap.created_at.to_rfc3339())
        .bind(swap.updated_at.to_rfc3339())
        .bind(swap.expires_at.to_rfc3339())
        .bind(swap.retry_count as i64)
        .bind(swap.max_retries as i64)
        .bind(serde_json::to_string(&swap.error_messages)?)
        .bind(&swap.source_tx_hash)
        .bind(&swap.target_tx_hash)
        .bind(&swap.refund_tx_hash)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn load_swap(&self, swap_id: &str) -> Result<Option<SwapSession>, RelayerError> {
        let row = sqlx::query("SELECT * FROM swaps WHERE swap_id = ?")
            .bind(swap_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_swap).transpose()
    }

    pub async fn find_by_hashlock(&self, hashlock: &str) -> Result<Option<SwapSession>, RelayerError> {
        let row = sqlx::query("SELECT * FROM swaps WHERE hashlock = ?")
            .bind(hashlock)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_swap).transpose()
    }

    pub async fn find_by_contract(
        &self,
        chain: Chain,
        contract_id: &str,
    ) -> Result<Option<SwapSession>, RelayerError> {
        let sql = match chain {
            Chain::Evm => "SELECT * FROM swaps WHERE evm_contract_id = ?",
            Chain::Move => "SELECT * FROM swaps WHERE move_contract_id = ?",
        };
        let row = sqlx::query(sql)
            .bind(contract_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(row_to_swap).transpose()
    }

    /// Read-modify-write on one swap with optimistic concurrency: the write
    /// is guarded on the `updated_at` the row was read at, and every commit
    /// strictly bumps it, so a concurrent writer cannot silently overwrite
    /// this one — the loser re-reads and reapplies its mutator. The write is
    /// rejected if it moves a terminal swap anywhere, or changes anything
    /// but `error_messages` on a terminal swap.
    pub async fn update_swap<F>(
        &self,
        swap_id: &str,
        mutator: F,
    ) -> Result<SwapSession, RelayerError>
    where
        F: Fn(&mut SwapSession) -> Result<(), RelayerError>,
    {
        for _ in 0..UPDATE_RETRY_ATTEMPTS {
            let row = sqlx::query("SELECT * FROM swaps WHERE swap_id = ?")
                .bind(swap_id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| RelayerError::SwapNotFound(swap_id.to_string()))?;
            let current = row_to_swap(row)?;

            let mut updated = current.clone();
            mutator(&mut updated)?;

            if current.status.is_terminal() {
                let mut frozen = current.clone();
                frozen.error_messages = updated.error_messages.clone();
                frozen.updated_at = updated.updated_at;
                if frozen != updated {
                    return Err(RelayerError::InvalidTransition {
                        from: current.status.as_str().to_string(),
                        to: updated.status.as_str().to_string(),
                    });
                }
            }
            if updated.status != current.status
                && !current.status.can_transition_to(updated.status)
            {
                return Err(RelayerError::InvalidTransition {
                    from: current.status.as_str().to_string(),
                    to: updated.status.as_str().to_string(),
                });
            }
            // updated_at doubles as the row version: strictly monotone.
            if updated.updated_at <= current.updated_at {
                updated.updated_at = current.updated_at + chrono::Duration::microseconds(1);
            }

            let result = sqlx::query(
                r#"
                UPDATE swaps SET
                    status = ?, evm_contract_id = ?, move_contract_id = ?,
                    preimage = ?, token_target = ?, updated_at = ?,
                    retry_count = ?, error_messages = ?,
                    target_tx_hash = ?, refund_tx_hash = ?
                WHERE swap_id = ? AND updated_at = ?
                "#,
            )
            .bind(updated.status.as_str())
            .bind(&updated.evm_contract_id)
            .bind(&updated.move_contract_id)
            .bind(&updated.preimage)
            .bind(&updated.token_target)
            .bind(updated.updated_at.to_rfc3339())
            .bind(updated.retry_count as i64)
            .bind(serde_json::to_string(&updated.error_messages)?)
            .bind(&updated.target_tx_hash)
            .bind(&updated.refund_tx_hash)
            .bind(swap_id)
            .bind(current.updated_at.to_rfc3339())
            .execute(&self.pool)
            .await?;
            if result.rows_affected() == 1 {
                return Ok(updated);
            }
            tracing::debug!("swap {swap_id} version conflict; retrying update");
        }
        Err(RelayerError::Storage(format!(
            "swap {swap_id} update contention exhausted retries"
        )))
    }

    /// Non-terminal swaps whose deadline has passed.
    pub async fn expire_scan(&self, now: DateTime<Utc>) -> Result<Vec<String>, RelayerError> {
        let rows = sqlx::query(
            r#"
            SELECT swap_id FROM swaps
            WHERE status NOT IN ('COMPLETED', 'REFUNDED', 'FAILED')
              AND expires_at <= ?
            "#,
        )
        .bind(now.to_rfc3339())
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|row| row.get::<String, _>("swap_id"))
            .collect())
    }

    pub async fn list_swaps(
        &self,
        status: Option<SwapStatus>,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<SwapSession>, RelayerError> {
        let rows = match status {
            Some(status) => {
                sqlx::query(
                    "SELECT * FROM swaps WHERE status = ?
                     ORDER BY updated_at DESC LIMIT ? OFFSET ?",
                )
                .bind(status.as_str())
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query("SELECT * FROM swaps ORDER BY updated_at DESC LIMIT ? OFFSET ?")
                    .bind(limit)
                    .bind(offset)
                    .fetch_all(&self.pool)
                    .await?
            }
        };
        rows.into_iter().map(row_to_swap).collect()
    }

    pub async fn count_by_status(&self) -> Result<Vec<(String, i64)>, RelayerError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM swaps GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows
            .into_iter()
            .map(|row| (row.get::<String, _>("status"), row.get::<i64, _>("n")))
            .collect())
    }

    /// Non-terminal swaps, for rebuilding the hot cache on startup.
    pub async fn active_swaps(&self) -> Result<Vec<SwapSession>, RelayerError> {
        let rows = sqlx::query(
            "SELECT * FROM swaps WHERE status NOT IN ('COMPLETED', 'REFUNDED', 'FAILED')",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(row_to_swap).collect()
    }

    // ---- event store ----

    /// Insert-if-absent on the idempotency key. `Duplicate` is success.
    pub async fn record_event(&self, event: &ChainEvent) -> Result<RecordOutcome, RelayerError> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_event(&mut tx, event).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    /// Records the event and advances the source cursor in one transaction.
    pub async fn record_event_with_cursor(
        &self,
        event: &ChainEvent,
        source: &str,
        position: u64,
    ) -> Result<RecordOutcome, RelayerError> {
        let mut tx = self.pool.begin().await?;
        let outcome = Self::insert_event(&mut tx, event).await?;
        Self::upsert_cursor(&mut tx, source, position).await?;
        tx.commit().await?;
        Ok(outcome)
    }

    async fn insert_event(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        event: &ChainEvent,
    ) -> Result<RecordOutcome, RelayerError> {
        let meta = event.meta();
        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO processed_events (
                chain, contract_id, event_type, tx_hash, log_index,
                payload, observed_at, processed_at, result
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, 'applied')
            "#,
        )
        .bind(meta.chain.as_str())
        .bind(&meta.contract_id)
        .bind(event.kind().as_str())
        .bind(&meta.tx_hash)
        .bind(meta.log_index as i64)
        .bind(serde_json::to_string(event)?)
        .bind(meta.observed_at.to_rfc3339())
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        if result.rows_affected() > 0 {
            Ok(RecordOutcome::Applied)
        } else {
            Ok(RecordOutcome::Duplicate)
        }
    }

    /// Appends to the error log and flags the processed row. Never called on
    /// the hot path of a healthy event.
    pub async fn record_error(&self, event: &ChainEvent, error: &str) -> Result<(), RelayerError> {
        sqlx::query("INSERT INTO event_errors (event_key, error, created_at) VALUES (?, ?, ?)")
            .bind(event.idempotency_key())
            .bind(error)
            .bind(Utc::now().to_rfc3339())
            .execute(&self.pool)
            .await?;
        let meta = event.meta();
        sqlx::query(
            r#"
            UPDATE processed_events SET result = ?
            WHERE chain = ? AND contract_id = ? AND event_type = ? AND tx_hash = ? AND log_index = ?
            "#,
        )
        .bind(format!("error({error})"))
        .bind(meta.chain.as_str())
        .bind(&meta.contract_id)
        .bind(event.kind().as_str())
        .bind(&meta.tx_hash)
        .bind(meta.log_index as i64)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn recent_errors(&self, limit: i64) -> Result<Vec<StoredError>, RelayerError> {
        let rows = sqlx::query(
            "SELECT event_key, error, created_at FROM event_errors
             ORDER BY id DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter()
            .map(|row| {
                Ok(StoredError {
                    event_key: row.get("event_key"),
                    error: row.get("error"),
                    created_at: parse_ts(&row.get::<String, _>("created_at"))?,
                })
            })
            .collect()
    }

    // ---- chain cursors ----

    pub async fn cursor_of(&self, source: &str) -> Result<Option<u64>, RelayerError> {
        let row = sqlx::query("SELECT position FROM chain_cursors WHERE source = ?")
            .bind(source)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|row| row.get::<i64, _>("position") as u64))
    }

    pub async fn advance_cursor(&self, source: &str, position: u64) -> Result<(), RelayerError> {
        let mut tx = self.pool.begin().await?;
        Self::upsert_cursor(&mut tx, source, position).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn upsert_cursor(
        tx: &mut sqlx::Transaction<'_, sqlx::Sqlite>,
        source: &str,
        position: u64,
    ) -> Result<(), RelayerError> {
        // MAX() keeps the cursor monotone even if batches land out of order.
        sqlx::query(
            r#"
            INSERT INTO chain_cursors (source, position, updated_at)
            VALUES (?, ?, ?)
            ON CONFLICT(source) DO UPDATE SET
                position = MAX(chain_cursors.position, excluded.position),
                updated_at = excluded.updated_at
            "#,
        )
        .bind(source)
        .bind(position as i64)
        .bind(Utc::now().to_rfc3339())
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

fn parse_ts(raw: &str) -> Result<DateTime<Utc>, RelayerError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| RelayerError::Storage(format!("bad timestamp {raw:?}: {e}")))
}

fn row_to_swap(row: sqlx::sqlite::SqliteRow) -> Result<SwapSession, RelayerError> {
    let status = SwapStatus::from_str(&row.get::<String, _>("status"))?;
    let source_chain = Chain::from_str(&row.get::<String, _>("source_chain"))?;
    let error_messages: Vec<String> =
        serde_json::from_str(&row.get::<String, _>("error_messages"))?;
    Ok(SwapSession {
        swap_id: row.get("swap_id"),
        status,
        source_chain,
        initiator: row.get("initiator"),
        receiver: row.get("receiver"),
        evm_contract_id: row.get("evm_contract_id"),
        move_contract_id: row.get("move_contract_id"),
        hashlock: row.get("hashlock"),
        preimage: row.get("preimage"),
        amount: row.get("amount"),
        token_source: row.get("token_source"),
        token_target: row.get("token_target"),
        timelock: row.get::<i64, _>("timelock") as u64,
        created_at: parse_ts(&row.get::<String, _>("created_at"))?,
        updated_at: parse_ts(&row.get::<String, _>("updated_at"))?,
        expires_at: parse_ts(&row.get::<String, _>("expires_at"))?,
        retry_count: row.get::<i64, _>("retry_count") as u32,
        max_retries: row.get::<i64, _>("max_retries") as u32,
        error_messages,
        source_tx_hash: row.get("source_tx_hash"),
        target_tx_hash: row.get("target_tx_hash"),
        refund_tx_hash: row.get("refund_tx_hash"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventMeta;
    use crate::swap::NewSwap;

    fn hex32(byte: u8) -> String {
        format!("0x{}", hex::encode([byte; 32]))
    }

    fn sample_swap(contract_byte: u8, hashlock_byte: u8) -> SwapSession {
        NewSwap {
            source_chain: Chain::Evm,
            source_contract_id: &hex32(contract_byte),
            hashlock: &hex32(hashlock_byte),
            initiator: "0x5555555555555555555555555555555555555555",
            receiver: "0x6666666666666666666666666666666666666666",
            token: "0x0000000000000000000000000000000000000000",
            amount: "1000",
            timelock: (Utc::now().timestamp() + 3600) as u64,
            source_tx_hash: &hex32(0x11),
        }
        .build()
        .unwrap()
    }

    fn created_event(contract_byte: u8, hashlock_byte: u8, log_index: u64) -> ChainEvent {
        ChainEvent::Created {
            meta: EventMeta {
                chain: Chain::Evm,
                contract_id: hex32(contract_byte),
                tx_hash: hex32(0x11),
                log_index,
                position: 50,
                observed_at: Utc::now(),
            },
            sender: "0x5555555555555555555555555555555555555555".into(),
            receiver: "0x6666666666666666666666666666666666666666".into(),
            token: "0x0000000000000000000000000000000000000000".into(),
            amount: "1000".into(),
            hashlock: hex32(hashlock_byte),
            timelock: (Utc::now().timestamp() + 3600) as u64,
            counterparty_chain_id: None,
        }
    }

    #[tokio::test]
    async fn test_create_swap_is_idempotent() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let swap = sample_swap(0xaa, 0xbb);
        assert!(storage.create_swap_if_absent(&swap).await.unwrap());
        assert!(!storage.create_swap_if_absent(&swap).await.unwrap());
        let loaded = storage.load_swap(&swap.swap_id).await.unwrap().unwrap();
        assert_eq!(loaded.hashlock, swap.hashlock);
    }

    #[tokio::test]
    async fn test_find_by_hashlock_and_contract() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let swap = sample_swap(0xaa, 0xbb);
        storage.create_swap_if_absent(&swap).await.unwrap();

        let by_lock = storage.find_by_hashlock(&hex32(0xbb)).await.unwrap();
        assert_eq!(by_lock.unwrap().swap_id, swap.swap_id);

        let by_contract = storage
            .find_by_contract(Chain::Evm, &hex32(0xaa))
            .await
            .unwrap();
        assert_eq!(by_contract.unwrap().swap_id, swap.swap_id);

        assert!(storage
            .find_by_contract(Chain::Move, &hex32(0xaa))
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_swap_transitions() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let swap = sample_swap(0xaa, 0xbb);
        storage.create_swap_if_absent(&swap).await.unwrap();

        let updated = storage
            .update_swap(&swap.swap_id, |s| s.transition(SwapStatus::SourceLocked))
            .await
            .unwrap();
        assert_eq!(updated.status, SwapStatus::SourceLocked);

        // Skipping straight to COMPLETED is rejected by the policy.
        let err = storage
            .update_swap(&swap.swap_id, |s| s.transition(SwapStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_terminal_swaps_are_absorbing() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let swap = sample_swap(0xaa, 0xbb);
        storage.create_swap_if_absent(&swap).await.unwrap();
        storage
            .update_swap(&swap.swap_id, |s| {
                s.transition(SwapStatus::SourceLocked)?;
                s.transition(SwapStatus::Failed)
            })
            .await
            .unwrap();

        // Appending errors is still allowed...
        let updated = storage
            .update_swap(&swap.swap_id, |s| {
                s.push_error("late diagnostics");
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(updated.error_messages, vec!["late diagnostics"]);

        // ...but nothing else may change.
        let err = storage
            .update_swap(&swap.swap_id, |s| {
                s.preimage = Some(hex32(0x42));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayerError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn test_update_swap_bumps_row_version() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let swap = sample_swap(0xaa, 0xbb);
        storage.create_swap_if_absent(&swap).await.unwrap();

        // push_error alone does not touch updated_at; the store must still
        // advance the version or a concurrent CAS could pass twice.
        let first = storage
            .update_swap(&swap.swap_id, |s| {
                s.push_error("first");
                Ok(())
            })
            .await
            .unwrap();
        assert!(first.updated_at > swap.updated_at);

        let second = storage
            .update_swap(&swap.swap_id, |s| {
                s.push_error("second");
                Ok(())
            })
            .await
            .unwrap();
        assert!(second.updated_at > first.updated_at);
    }

    #[tokio::test]
    async fn test_event_dedup() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let event = created_event(0xaa, 0xbb, 0);
        assert_eq!(
            storage.record_event(&event).await.unwrap(),
            RecordOutcome::Applied
        );
        assert_eq!(
            storage.record_event(&event).await.unwrap(),
            RecordOutcome::Duplicate
        );
        assert_eq!(
            storage.record_event(&event).await.unwrap(),
            RecordOutcome::Duplicate
        );
        // A different log index is a different occurrence.
        let other = created_event(0xaa, 0xbb, 1);
        assert_eq!(
            storage.record_event(&other).await.unwrap(),
            RecordOutcome::Applied
        );
    }

    #[tokio::test]
    async fn test_cursor_advances_with_event() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        assert_eq!(storage.cursor_of("evm").await.unwrap(), None);

        let event = created_event(0xaa, 0xbb, 0);
        storage
            .record_event_with_cursor(&event, "evm", 50)
            .await
            .unwrap();
        assert_eq!(storage.cursor_of("evm").await.unwrap(), Some(50));

        // Cursor never moves backwards.
        storage.advance_cursor("evm", 40).await.unwrap();
        assert_eq!(storage.cursor_of("evm").await.unwrap(), Some(50));
        storage.advance_cursor("evm", 60).await.unwrap();
        assert_eq!(storage.cursor_of("evm").await.unwrap(), Some(60));
    }

    #[tokio::test]
    async fn test_expire_scan_skips_terminal() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let mut expired = sample_swap(0xaa, 0xbb);
        expired.expires_at = Utc::now() - chrono::Duration::seconds(10);
        storage.create_swap_if_absent(&expired).await.unwrap();

        let mut done = sample_swap(0xcc, 0xdd);
        done.expires_at = Utc::now() - chrono::Duration::seconds(10);
        done.status = SwapStatus::Refunded;
        storage.create_swap_if_absent(&done).await.unwrap();

        let hits = storage.expire_scan(Utc::now()).await.unwrap();
        assert_eq!(hits, vec![expired.swap_id]);
    }

    #[tokio::test]
    async fn test_error_log() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let event = created_event(0xaa, 0xbb, 0);
        storage.record_event(&event).await.unwrap();
        storage.record_error(&event, "boom").await.unwrap();
        let errors = storage.recent_errors(10).await.unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].error, "boom");
        assert_eq!(errors[0].event_key, event.idempotency_key());
    }

    #[tokio::test]
    async fn test_list_swaps_filters_by_status() {
        let storage = RelayerStorage::in_memory().await.unwrap();
        let a = sample_swap(0xaa, 0xbb);
        storage.create_swap_if_absent(&a).await.unwrap();
        let mut b = sample_swap(0xcc, 0xdd);
        b.status = SwapStatus::SourceLocked;
        storage.create_swap_if_absent(&b).await.unwrap();

        let pending = storage
            .list_swaps(Some(SwapStatus::Pending), 10, 0)
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].swap_id, a.swap_id);

        let all = storage.list_swaps(None, 10, 0).await.unwrap();
        assert_eq!(all.len(), 2);
    }
}
