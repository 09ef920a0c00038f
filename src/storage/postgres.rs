use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};

use crate::definitions::{StateDefinition, StateTableDefinition};
use crate::storage::traits::{StoreResult, TaskStore};
use crate::types::{
    Checkpoint, CheckpointWrite, Event, Payload, PdcaTask, TaskStatus, Transition,
};

const TASK_COLUMNS: &str = r#"
    task_id, owner_id, conversation_key, session_id, status, priority, next_run_at,
    lease_until, worker_id, slice_cycles, max_cycles, max_runtime_seconds,
    token_budget_remaining, failure_streak, last_error, metadata, created_at, updated_at
"#;

pub struct PostgresTaskStore {
    pool: PgPool,
}

impl PostgresTaskStore {
    pub async fn new(database_url: &str) -> StoreResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;
        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn run_migrations(&self) -> StoreResult<()> {
        sqlx::raw_sql(include_str!("../../migrations/V001__initial_schema.sql"))
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Loads the control-plane states and transitions provisioned in the database.
    pub async fn load_state_table(&self) -> StoreResult<StateTableDefinition> {
        let state_rows = sqlx::query(
            r#"
            SELECT id, key, name, enabled, is_initial
            FROM states
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let mut initial_state = None;
        let mut states = Vec::with_capacity(state_rows.len());
        for r in &state_rows {
            let key: String = r.try_get("key")?;
            if r.try_get::<bool, _>("is_initial")? && initial_state.is_none() {
                initial_state = Some(key.clone());
            }
            states.push(StateDefinition {
                id: Some(r.try_get("id")?),
                key,
                name: r.try_get("name")?,
                enabled: r.try_get("enabled")?,
            });
        }

        let transition_rows = sqlx::query(
            r#"
            SELECT state_key, signal_key, action_key, next_state_key
            FROM transitions
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        let transitions = transition_rows
            .iter()
            .map(|r| -> StoreResult<Transition> {
                Ok(Transition {
                    state_key: r.try_get("state_key")?,
                    signal_key: r.try_get("signal_key")?,
                    action_key: r.try_get("action_key")?,
                    next_state_key: r.try_get("next_state_key")?,
                })
            })
            .collect::<StoreResult<Vec<Transition>>>()?;

        let initial_state = initial_state
            .or_else(|| states.first().map(|s| s.key.clone()))
            .unwrap_or_default();

        Ok(StateTableDefinition {
            initial_state,
            states,
            transitions,
        })
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn upsert(&self, mut task: PdcaTask) -> StoreResult<PdcaTask> {
        task.normalize();
        let row = sqlx::query(&format!(
            r#"
            INSERT INTO pdca_tasks (
                task_id, owner_id, conversation_key, session_id, status, priority,
                next_run_at, lease_until, worker_id, slice_cycles, max_cycles,
                max_runtime_seconds, token_budget_remaining, failure_streak, last_error,
                metadata, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16, $17, NOW())
            ON CONFLICT (task_id) DO UPDATE SET
                owner_id = EXCLUDED.owner_id,
                conversation_key = EXCLUDED.conversation_key,
                session_id = EXCLUDED.session_id,
                status = EXCLUDED.status,
                priority = EXCLUDED.priority,
                next_run_at = EXCLUDED.next_run_at,
                lease_until = EXCLUDED.lease_until,
                worker_id = EXCLUDED.worker_id,
                slice_cycles = EXCLUDED.slice_cycles,
                max_cycles = EXCLUDED.max_cycles,
                max_runtime_seconds = EXCLUDED.max_runtime_seconds,
                token_budget_remaining = EXCLUDED.token_budget_remaining,
                failure_streak = EXCLUDED.failure_streak,
                last_error = EXCLUDED.last_error,
                metadata = EXCLUDED.metadata,
                updated_at = NOW()
            RETURNING {}
            "#,
            TASK_COLUMNS
        ))
        .bind(&task.task_id)
        .bind(&task.owner_id)
        .bind(&task.conversation_key)
        .bind(&task.session_id)
        .bind(task.status.as_str())
        .bind(task.priority)
        .bind(task.next_run_at)
        .bind(task.lease_until)
        .bind(&task.worker_id)
        .bind(task.slice_cycles)
        .bind(task.max_cycles)
        .bind(task.max_runtime_seconds)
        .bind(task.token_budget_remaining)
        .bind(task.failure_streak)
        .bind(&task.last_error)
        .bind(Value::Object(task.metadata.clone()))
        .bind(task.created_at)
        .fetch_one(&self.pool)
        .await?;

        row_to_task(&row)
    }

    async fn get_task(&self, task_id: &str) -> StoreResult<Option<PdcaTask>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM pdca_tasks WHERE task_id = $1",
            TASK_COLUMNS
        ))
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_task).transpose()
    }

    async fn list_tasks(&self) -> StoreResult<Vec<PdcaTask>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM pdca_tasks ORDER BY created_at ASC",
            TASK_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn list_runnable(&self, now: DateTime<Utc>, limit: usize) -> StoreResult<Vec<PdcaTask>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {}
            FROM pdca_tasks
            WHERE status IN ('queued', 'running')
              AND (next_run_at IS NULL OR next_run_at <= $1)
              AND (lease_until IS NULL OR lease_until <= $1)
            ORDER BY priority DESC, next_run_at ASC NULLS FIRST, updated_at ASC
            LIMIT $2
            "#,
            TASK_COLUMNS
        ))
        .bind(now)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_task).collect()
    }

    async fn acquire_lease(
        &self,
        task_id: &str,
        worker_id: &str,
        lease_seconds: i64,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let lease_until = now + Duration::seconds(lease_seconds.max(0));
        let result = sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET lease_until = $3,
                worker_id = $2,
                status = CASE WHEN status = 'queued' THEN 'running' ELSE status END,
                updated_at = $4
            WHERE task_id = $1
              AND (lease_until IS NULL OR lease_until <= $4)
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(lease_until)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn release_lease(&self, task_id: &str, worker_id: &str) -> StoreResult<()> {
        sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET lease_until = NULL, worker_id = NULL
            WHERE task_id = $1 AND worker_id = $2
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn reschedule(
        &self,
        task_id: &str,
        worker_id: &str,
        next_run_at: Option<DateTime<Utc>>,
        status: TaskStatus,
    ) -> StoreResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE pdca_tasks
            SET next_run_at = $3, status = $4, updated_at = NOW()
            WHERE task_id = $1 AND worker_id = $2 AND status IN ('queued', 'running')
            "#,
        )
        .bind(task_id)
        .bind(worker_id)
        .bind(next_run_at)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn get_checkpoint(&self, task_id: &str) -> StoreResult<Option<Checkpoint>> {
        let row = sqlx::query(
            r#"
            SELECT task_id, state, task_state, version, created_at, updated_at
            FROM pdca_checkpoints
            WHERE task_id = $1
            "#,
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_checkpoint).transpose()
    }

    async fn save_checkpoint(
        &self,
        task_id: &str,
        state: Payload,
        task_state: Payload,
        expected_version: i64,
    ) -> StoreResult<CheckpointWrite> {
        let saved: Option<i64> = if expected_version == 0 {
            sqlx::query_scalar(
                r#"
                INSERT INTO pdca_checkpoints (task_id, state, task_state, version, created_at, updated_at)
                VALUES ($1, $2, $3, 1, NOW(), NOW())
                ON CONFLICT (task_id) DO NOTHING
                RETURNING version
                "#,
            )
            .bind(task_id)
            .bind(Value::Object(state))
            .bind(Value::Object(task_state))
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query_scalar(
                r#"
                UPDATE pdca_checkpoints
                SET state = $2, task_state = $3, version = version + 1, updated_at = NOW()
                WHERE task_id = $1 AND version = $4
                RETURNING version
                "#,
            )
            .bind(task_id)
            .bind(Value::Object(state))
            .bind(Value::Object(task_state))
            .bind(expected_version)
            .fetch_optional(&self.pool)
            .await?
        };

        if let Some(version) = saved {
            return Ok(CheckpointWrite::Saved { version });
        }

        let current: Option<i64> =
            sqlx::query_scalar("SELECT version FROM pdca_checkpoints WHERE task_id = $1")
                .bind(task_id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(CheckpointWrite::Conflict {
            current_version: current.unwrap_or(0),
        })
    }

    async fn append_event(
        &self,
        task_id: Option<&str>,
        event_type: &str,
        payload: Payload,
        correlation_id: Option<&str>,
    ) -> StoreResult<Event> {
        let event = Event::new(
            task_id.map(str::to_string),
            event_type,
            payload,
            correlation_id.map(str::to_string),
            Utc::now(),
        );

        sqlx::query(
            r#"
            INSERT INTO pdca_events (event_id, task_id, event_type, payload, correlation_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            "#,
        )
        .bind(event.event_id)
        .bind(&event.task_id)
        .bind(&event.event_type)
        .bind(Value::Object(event.payload.clone()))
        .bind(&event.correlation_id)
        .bind(event.created_at)
        .execute(&self.pool)
        .await?;

        Ok(event)
    }

    async fn list_events_since(&self, since: DateTime<Utc>) -> StoreResult<Vec<Event>> {
        let rows = sqlx::query(
            r#"
            SELECT event_id, task_id, event_type, payload, correlation_id, created_at
            FROM pdca_events
            WHERE created_at >= $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(since)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_event).collect()
    }

    async fn latest_event(&self, task_id: &str, event_type: &str) -> StoreResult<Option<Event>> {
        let row = sqlx::query(
            r#"
            SELECT event_id, task_id, event_type, payload, correlation_id, created_at
            FROM pdca_events
            WHERE task_id = $1 AND event_type = $2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(task_id)
        .bind(event_type)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_event).transpose()
    }
}

fn json_to_payload(value: Value) -> Payload {
    match value {
        Value::Object(map) => map,
        _ => Payload::new(),
    }
}

fn row_to_task(r: &PgRow) -> StoreResult<PdcaTask> {
    let status: String = r.try_get("status")?;
    let metadata: Value = r.try_get("metadata")?;

    Ok(PdcaTask {
        task_id: r.try_get("task_id")?,
        owner_id: r.try_get("owner_id")?,
        conversation_key: r.try_get("conversation_key")?,
        session_id: r.try_get("session_id")?,
        status: TaskStatus::parse(&status),
        priority: r.try_get("priority")?,
        next_run_at: r.try_get("next_run_at")?,
        lease_until: r.try_get("lease_until")?,
        worker_id: r.try_get("worker_id")?,
        slice_cycles: r.try_get("slice_cycles")?,
        max_cycles: r.try_get("max_cycles")?,
        max_runtime_seconds: r.try_get("max_runtime_seconds")?,
        token_budget_remaining: r.try_get("token_budget_remaining")?,
        failure_streak: r.try_get("failure_streak")?,
        last_error: r.try_get("last_error")?,
        metadata: json_to_payload(metadata),
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn row_to_checkpoint(r: &PgRow) -> StoreResult<Checkpoint> {
    Ok(Checkpoint {
        task_id: r.try_get("task_id")?,
        state: json_to_payload(r.try_get("state")?),
        task_state: json_to_payload(r.try_get("task_state")?),
        version: r.try_get("version")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

fn row_to_event(r: &PgRow) -> StoreResult<Event> {
    Ok(Event {
        event_id: r.try_get("event_id")?,
        task_id: r.try_get("task_id")?,
        event_type: r.try_get("event_type")?,
        payload: json_to_payload(r.try_get("payload")?),
        correlation_id: r.try_get("correlation_id")?,
        created_at: r.try_get("created_at")?,
    })
}
