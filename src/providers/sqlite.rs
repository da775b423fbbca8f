use chrono::Utc;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, Sqlite, Transaction};
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

use super::{ActivityWorkItem, OrchestrationMetadata, OrchestrationWorkItem, Provider, ProviderError};
use crate::runtime::OrchestrationRuntimeState;
use crate::runtime::limits::DEFAULT_LOCK_TIMEOUT;
use crate::{Event, EventKind};

/// Configuration options for SqliteProvider
#[derive(Debug, Clone)]
pub struct SqliteOptions {
    /// How long a fetched work item stays leased. Default: 30s.
    pub lock_timeout: Duration,
    /// Delay before abandoned events become visible again. Default: none.
    pub abandon_delay: Duration,
    /// Pool size for file databases. In-memory databases always use one connection.
    pub max_connections: u32,
}

impl Default for SqliteOptions {
    fn default() -> Self {
        Self {
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            abandon_delay: Duration::ZERO,
            max_connections: 5,
        }
    }
}

/// SQLite-backed provider.
///
/// Every state-changing operation runs in one transaction, so a crash between
/// persisting history and dispatching effects cannot be observed.
pub struct SqliteProvider {
    pool: SqlitePool,
    options: SqliteOptions,
}

impl SqliteProvider {
    /// Convert sqlx error to ProviderError with appropriate retry classification
    fn sqlx_to_provider_error(operation: &str, e: sqlx::Error) -> ProviderError {
        let error_msg = e.to_string();

        if error_msg.contains("database is locked") || error_msg.contains("SQLITE_BUSY") {
            return ProviderError::retryable(operation, format!("Database locked: {error_msg}"));
        }

        if error_msg.contains("UNIQUE constraint") || error_msg.contains("PRIMARY KEY") {
            return ProviderError::permanent(operation, format!("Constraint violation: {error_msg}"));
        }

        if error_msg.contains("connection") || error_msg.contains("timeout") {
            return ProviderError::retryable(operation, format!("Connection error: {error_msg}"));
        }

        // Unknown failures are retried; the lease expiry bounds the damage.
        ProviderError::retryable(operation, error_msg)
    }

    fn encode(operation: &str, event: &Event) -> Result<String, ProviderError> {
        serde_json::to_string(event)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))
    }

    fn decode(operation: &str, data: &str) -> Result<Event, ProviderError> {
        serde_json::from_str(data)
            .map_err(|e| ProviderError::permanent(operation, format!("Deserialization error: {e}")))
    }

    fn now_millis() -> i64 {
        Utc::now().timestamp_millis()
    }

    fn millis_after(delay: Duration) -> i64 {
        Self::now_millis().saturating_add(delay.as_millis().min(i64::MAX as u128) as i64)
    }

    /// Create a new SQLite provider
    ///
    /// # Arguments
    /// * `database_url` - SQLite connection string (e.g., "sqlite:data.db" or "sqlite::memory:")
    /// * `options` - Lease and pool configuration; `None` uses the defaults
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new(database_url: &str, options: Option<SqliteOptions>) -> Result<Self, sqlx::Error> {
        let options = options.unwrap_or_default();
        let is_memory = database_url.contains(":memory:") || database_url.contains("mode=memory");
        let connect_options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);

        let pool_options = if is_memory {
            // Each connection to `:memory:` is its own database; keep exactly one alive.
            SqlitePoolOptions::new()
                .max_connections(1)
                .min_connections(1)
                .idle_timeout(None)
                .max_lifetime(None)
        } else {
            SqlitePoolOptions::new().max_connections(options.max_connections.max(1))
        };

        let pool = pool_options
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    if is_memory {
                        sqlx::query("PRAGMA journal_mode = MEMORY").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = OFF").execute(&mut *conn).await?;
                    } else {
                        sqlx::query("PRAGMA journal_mode = WAL").execute(&mut *conn).await?;
                        sqlx::query("PRAGMA synchronous = NORMAL").execute(&mut *conn).await?;
                    }
                    sqlx::query("PRAGMA busy_timeout = 60000").execute(&mut *conn).await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        Self::create_schema(&pool).await?;
        debug!(target: "taskhub::providers::sqlite", database_url, "sqlite provider ready");
        Ok(Self { pool, options })
    }

    /// Convenience: a private in-memory database, mainly for tests.
    ///
    /// # Errors
    ///
    /// Returns an error if database connection or schema initialization fails.
    pub async fn new_in_memory() -> Result<Self, sqlx::Error> {
        Self::new("sqlite::memory:", None).await
    }

    async fn create_schema(pool: &SqlitePool) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS instances (
                instance_id TEXT PRIMARY KEY,
                orchestration_name TEXT NOT NULL,
                runtime_status TEXT NOT NULL,
                metadata TEXT NOT NULL,
                lock_token TEXT,
                locked_until INTEGER
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS history (
                instance_id TEXT NOT NULL,
                sequence_number INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                event_data TEXT NOT NULL,
                PRIMARY KEY (instance_id, sequence_number)
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS orchestrator_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_data TEXT NOT NULL,
                visible_at INTEGER NOT NULL,
                dequeue_count INTEGER NOT NULL DEFAULT 0,
                lock_token TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            r#"CREATE INDEX IF NOT EXISTS idx_orch_queue_instance ON orchestrator_queue(instance_id, visible_at)"#,
        )
            .execute(pool)
            .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS activity_queue (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                instance_id TEXT NOT NULL,
                event_data TEXT NOT NULL
            )
            "#,
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    /// Activity tasks recorded by completed work items, oldest first.
    pub async fn pending_activities(&self) -> Result<Vec<ActivityWorkItem>, ProviderError> {
        const OP: &str = "pending_activities";
        let rows = sqlx::query("SELECT id, instance_id, event_data FROM activity_queue ORDER BY id")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::decode_activities(OP, rows)
    }

    /// Remove and return every recorded activity task, oldest first.
    pub async fn take_pending_activities(&self) -> Result<Vec<ActivityWorkItem>, ProviderError> {
        const OP: &str = "take_pending_activities";
        let rows = sqlx::query("DELETE FROM activity_queue RETURNING id, instance_id, event_data")
            .fetch_all(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::decode_activities(OP, rows)
    }

    fn decode_activities(operation: &str, rows: Vec<SqliteRow>) -> Result<Vec<ActivityWorkItem>, ProviderError> {
        let mut decoded = rows
            .iter()
            .map(|row| {
                let id: i64 = row.try_get("id").map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                let instance_id: String = row
                    .try_get("instance_id")
                    .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                let data: String = row
                    .try_get("event_data")
                    .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
                let item = ActivityWorkItem {
                    instance_id,
                    event: Self::decode(operation, &data)?,
                };
                Ok((id, item))
            })
            .collect::<Result<Vec<_>, ProviderError>>()?;
        // RETURNING rows come back in no particular order.
        decoded.sort_by_key(|(id, _)| *id);
        Ok(decoded.into_iter().map(|(_, item)| item).collect())
    }

    /// Insert a new instance row. Returns `false` if the id is taken.
    async fn insert_instance(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        metadata: &OrchestrationMetadata,
    ) -> Result<bool, ProviderError> {
        let encoded = serde_json::to_string(metadata)
            .map_err(|e| ProviderError::permanent(operation, format!("Serialization error: {e}")))?;
        let inserted = sqlx::query(
            r#"
            INSERT INTO instances (instance_id, orchestration_name, runtime_status, metadata) VALUES (?, ?, ?, ?)
            ON CONFLICT(instance_id) DO NOTHING
            "#,
        )
        .bind(&metadata.instance_id)
        .bind(&metadata.name)
        .bind(metadata.runtime_status.as_str())
        .bind(encoded)
        .execute(&mut **tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(inserted.rows_affected() == 1)
    }

    async fn enqueue_in_tx(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance_id: &str,
        event: &Event,
        visible_at: i64,
    ) -> Result<(), ProviderError> {
        sqlx::query("INSERT INTO orchestrator_queue (instance_id, event_data, visible_at) VALUES (?, ?, ?)")
            .bind(instance_id)
            .bind(Self::encode(operation, event)?)
            .bind(visible_at)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(())
    }

    async fn instance_exists(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance_id: &str,
    ) -> Result<bool, ProviderError> {
        let row = sqlx::query("SELECT 1 FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        Ok(row.is_some())
    }

    /// Fail with a permanent error unless `token` is the instance's current lease.
    ///
    /// Starts with a write so the transaction takes the write lock up front.
    async fn verify_lease(
        tx: &mut Transaction<'_, Sqlite>,
        operation: &str,
        instance_id: &str,
        token: &str,
    ) -> Result<(), ProviderError> {
        let touched =
            sqlx::query("UPDATE instances SET locked_until = locked_until WHERE instance_id = ? AND lock_token = ?")
            .bind(instance_id)
            .bind(token)
            .execute(&mut **tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(operation, e))?;
        if touched.rows_affected() == 1 {
            return Ok(());
        }
        if !Self::instance_exists(tx, operation, instance_id).await? {
            return Err(ProviderError::not_found(operation, instance_id));
        }
        Err(ProviderError::permanent(
            operation,
            format!("lock token for instance '{instance_id}' is stale or unknown"),
        ))
    }
}

#[async_trait::async_trait]
impl Provider for SqliteProvider {
    async fn create_orchestration_instance(&self, start_event: Event) -> Result<(), ProviderError> {
        const OP: &str = "create_orchestration_instance";
        let metadata = OrchestrationMetadata::pending(&start_event)
            .ok_or_else(|| ProviderError::permanent(OP, "start event must be ExecutionStarted"))?;

        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if !Self::insert_instance(&mut tx, OP, &metadata).await? {
            tx.rollback().await.ok();
            return Err(ProviderError::already_exists(OP, &metadata.instance_id));
        }
        Self::enqueue_in_tx(&mut tx, OP, &metadata.instance_id, &start_event, Self::now_millis()).await?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        debug!(
            target: "taskhub::providers::sqlite",
            instance_id = %metadata.instance_id,
            "created orchestration instance"
        );
        Ok(())
    }

    async fn add_new_orchestration_event(&self, instance_id: &str, event: Event) -> Result<(), ProviderError> {
        const OP: &str = "add_new_orchestration_event";
        let inserted = sqlx::query(
            r#"
            INSERT INTO orchestrator_queue (instance_id, event_data, visible_at)
            SELECT ?1, ?2, ?3 WHERE EXISTS (SELECT 1 FROM instances WHERE instance_id = ?1)
            "#,
        )
        .bind(instance_id)
        .bind(Self::encode(OP, &event)?)
        .bind(Self::now_millis())
        .execute(&self.pool)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if inserted.rows_affected() == 0 {
            return Err(ProviderError::not_found(OP, instance_id));
        }
        Ok(())
    }

    async fn get_orchestration_metadata(&self, instance_id: &str) -> Result<OrchestrationMetadata, ProviderError> {
        const OP: &str = "get_orchestration_metadata";
        let data: Option<String> = sqlx::query_scalar("SELECT metadata FROM instances WHERE instance_id = ?")
            .bind(instance_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let data = data.ok_or_else(|| ProviderError::not_found(OP, instance_id))?;
        serde_json::from_str(&data).map_err(|e| ProviderError::permanent(OP, format!("Deserialization error: {e}")))
    }

    async fn get_orchestration_work_item(&self) -> Result<Option<OrchestrationWorkItem>, ProviderError> {
        const OP: &str = "get_orchestration_work_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        let now_ms = Self::now_millis();

        // Lease the instance owning the oldest visible message, unless it is
        // held by an unexpired lease. Writing first takes the write lock up front.
        let lock_token = uuid::Uuid::new_v4().to_string();
        let locked = sqlx::query(
            r#"
            UPDATE instances SET lock_token = ?1, locked_until = ?2
            WHERE instance_id = (
                SELECT q.instance_id
                FROM orchestrator_queue q
                JOIN instances i ON q.instance_id = i.instance_id
                WHERE q.visible_at <= ?3
                  AND (i.lock_token IS NULL OR i.locked_until <= ?3)
                ORDER BY q.id
                LIMIT 1
            )
            "#,
        )
        .bind(&lock_token)
        .bind(Self::millis_after(self.options.lock_timeout))
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if locked.rows_affected() == 0 {
            tx.rollback().await.ok();
            return Ok(None);
        }

        let instance_id: String = sqlx::query_scalar("SELECT instance_id FROM instances WHERE lock_token = ?")
            .bind(&lock_token)
            .fetch_one(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        sqlx::query(
            r#"
            UPDATE orchestrator_queue SET lock_token = ?1, dequeue_count = dequeue_count + 1
            WHERE instance_id = ?2 AND visible_at <= ?3
            "#,
        )
        .bind(&lock_token)
        .bind(&instance_id)
        .bind(now_ms)
        .execute(&mut *tx)
        .await
        .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let rows =
            sqlx::query("SELECT event_data, dequeue_count FROM orchestrator_queue WHERE lock_token = ? ORDER BY id")
                .bind(&lock_token)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        let mut new_events = Vec::with_capacity(rows.len());
        let mut dequeue_count = 0u32;
        for row in &rows {
            let data: String = row.try_get("event_data").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            let count: i64 = row.try_get("dequeue_count").map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            dequeue_count = dequeue_count.max(u32::try_from(count).unwrap_or(u32::MAX));
            new_events.push(Self::decode(OP, &data)?);
        }

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(
            target: "taskhub::providers::sqlite",
            instance_id = %instance_id,
            event_count = new_events.len(),
            dequeue_count,
            "leased orchestration work item"
        );
        Ok(Some(OrchestrationWorkItem {
            instance_id,
            new_events,
            state: None,
            lock_token,
            dequeue_count,
        }))
    }

    async fn get_orchestration_runtime_state(
        &self,
        work_item: &OrchestrationWorkItem,
    ) -> Result<OrchestrationRuntimeState, ProviderError> {
        let history = self.read_history(&work_item.instance_id).await?;
        Ok(OrchestrationRuntimeState::new(work_item.instance_id.clone(), history))
    }

    async fn complete_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError> {
        const OP: &str = "complete_orchestration_work_item";
        let OrchestrationWorkItem {
            instance_id,
            state,
            lock_token,
            ..
        } = work_item;

        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::verify_lease(&mut tx, OP, &instance_id, &lock_token).await?;

        if let Some(state) = state.as_ref().filter(|s| !s.new_events().is_empty()) {
            let mut next_seq: i64 = if state.continued_as_new() {
                sqlx::query("DELETE FROM history WHERE instance_id = ?")
                    .bind(&instance_id)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                0
            } else {
                sqlx::query_scalar("SELECT COALESCE(MAX(sequence_number) + 1, 0) FROM history WHERE instance_id = ?")
                    .bind(&instance_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?
            };

            for event in state.new_events() {
                sqlx::query(
                    "INSERT INTO history (instance_id, sequence_number, event_type, event_data) VALUES (?, ?, ?, ?)",
                )
                .bind(&instance_id)
                .bind(next_seq)
                .bind(event.kind.name())
                .bind(Self::encode(OP, event)?)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
                next_seq += 1;
            }

            if let Some(metadata) = OrchestrationMetadata::from_state(state) {
                let encoded = serde_json::to_string(&metadata)
                    .map_err(|e| ProviderError::permanent(OP, format!("Serialization error: {e}")))?;
                sqlx::query(
                    r#"
                    UPDATE instances SET orchestration_name = ?, runtime_status = ?, metadata = ?
                    WHERE instance_id = ?
                    "#,
                )
                .bind(&metadata.name)
                .bind(metadata.runtime_status.as_str())
                .bind(encoded)
                .bind(&instance_id)
                .execute(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
        }

        sqlx::query("UPDATE instances SET lock_token = NULL, locked_until = NULL WHERE instance_id = ?")
            .bind(&instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("DELETE FROM orchestrator_queue WHERE lock_token = ?")
            .bind(&lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        if let Some(state) = &state {
            for timer in state.pending_timers() {
                let visible_at = match &timer.kind {
                    EventKind::TimerFired { fire_at, .. } => fire_at.timestamp_millis(),
                    _ => Self::now_millis(),
                };
                Self::enqueue_in_tx(&mut tx, OP, &instance_id, timer, visible_at).await?;
            }

            for message in state.pending_messages() {
                let target = message.target_instance_id.as_str();
                if !Self::instance_exists(&mut tx, OP, target).await? {
                    let Some(metadata) = OrchestrationMetadata::pending(&message.event) else {
                        warn!(
                            target: "taskhub::providers::sqlite",
                            instance_id = %instance_id,
                            target_instance_id = %target,
                            event = message.event.kind.name(),
                            "dropping message for unknown instance"
                        );
                        continue;
                    };
                    Self::insert_instance(&mut tx, OP, &metadata).await?;
                }
                Self::enqueue_in_tx(&mut tx, OP, target, &message.event, Self::now_millis()).await?;
            }

            for task in state.pending_tasks() {
                sqlx::query("INSERT INTO activity_queue (instance_id, event_data) VALUES (?, ?)")
                    .bind(&instance_id)
                    .bind(Self::encode(OP, task)?)
                    .execute(&mut *tx)
                    .await
                    .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
            }
        }

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(target: "taskhub::providers::sqlite", instance_id = %instance_id, "completed orchestration work item");
        Ok(())
    }

    async fn abandon_orchestration_work_item(&self, work_item: OrchestrationWorkItem) -> Result<(), ProviderError> {
        const OP: &str = "abandon_orchestration_work_item";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        Self::verify_lease(&mut tx, OP, &work_item.instance_id, &work_item.lock_token).await?;

        sqlx::query("UPDATE instances SET lock_token = NULL, locked_until = NULL WHERE instance_id = ?")
            .bind(&work_item.instance_id)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        sqlx::query("UPDATE orchestrator_queue SET lock_token = NULL, visible_at = ? WHERE lock_token = ?")
            .bind(Self::millis_after(self.options.abandon_delay))
            .bind(&work_item.lock_token)
            .execute(&mut *tx)
            .await
            .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;

        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        debug!(
            target: "taskhub::providers::sqlite",
            instance_id = %work_item.instance_id,
            "abandoned orchestration work item"
        );
        Ok(())
    }

    async fn read_history(&self, instance_id: &str) -> Result<Vec<Event>, ProviderError> {
        const OP: &str = "read_history";
        let mut tx = self.pool.begin().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        if !Self::instance_exists(&mut tx, OP, instance_id).await? {
            tx.rollback().await.ok();
            return Err(ProviderError::not_found(OP, instance_id));
        }
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT event_data FROM history WHERE instance_id = ? ORDER BY sequence_number")
                .bind(instance_id)
                .fetch_all(&mut *tx)
                .await
                .map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        tx.commit().await.map_err(|e| Self::sqlx_to_provider_error(OP, e))?;
        rows.iter().map(|data| Self::decode(OP, data)).collect()
    }
}
