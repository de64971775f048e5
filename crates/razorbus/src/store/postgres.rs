//! PostgreSQL store implementation.

use std::time::Duration;

use serde_json::Value;
use sqlx::{PgPool, Postgres, Transaction};
use time::OffsetDateTime;
use uuid::Uuid;

use super::queue::{DeadLetter, DeadLetterQuery, Delivery, MessageQueue};
use super::{CommandStore, Store, UnitOfWork};
use crate::command::{Command, CommandId, ErrorRecord, NewCommand};
use crate::error::{Error, Result};
use crate::message::Message;

/// PostgreSQL-backed store for production use.
///
/// Command transitions are single conditional `UPDATE`s, so they apply to the
/// current row and never overwrite a concurrent change with a stale
/// snapshot. Deliveries are leased with `FOR UPDATE SKIP LOCKED`, so any
/// number of workers can share the queue.
///
/// # Database Schema
///
/// Requires tables in the `razor` schema (see [`PgStore::migrate`]):
///
/// | Table          | Purpose                                          |
/// |----------------|--------------------------------------------------|
/// | `commands`     | Command records with status and error history    |
/// | `messages`     | Queued message bodies with delivery time and lease |
/// | `dead_letters` | Messages that exceeded the retry ceiling         |
///
/// # Example
///
/// ```ignore
/// use razorbus::PgStore;
/// use sqlx::PgPool;
///
/// let pool = PgPool::connect("postgres://...").await?;
/// let store = PgStore::new(pool);
/// store.migrate().await?;
/// ```
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

#[derive(sqlx::FromRow)]
struct CommandRow {
    id: i64,
    command: String,
    params: Value,
    status: String,
    error: Value,
    submitted_by: Option<String>,
    submitted_at: OffsetDateTime,
    finished_at: Option<OffsetDateTime>,
}

impl TryFrom<CommandRow> for Command {
    type Error = Error;

    fn try_from(row: CommandRow) -> Result<Self> {
        let status = row
            .status
            .parse()
            .map_err(|e| Error::Postgres(sqlx::Error::Decode(Box::new(e))))?;
        Ok(Command {
            id: CommandId::new(row.id),
            command: row.command,
            params: row.params,
            status,
            error: serde_json::from_value(row.error)?,
            submitted_by: row.submitted_by,
            submitted_at: row.submitted_at,
            finished_at: row.finished_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct DeliveryRow {
    id: Uuid,
    body: Option<Value>,
    enqueued_at: OffsetDateTime,
    deliver_at: OffsetDateTime,
}

impl From<DeliveryRow> for Delivery {
    fn from(row: DeliveryRow) -> Self {
        Delivery {
            id: row.id,
            body: row.body,
            enqueued_at: row.enqueued_at,
            deliver_at: row.deliver_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct DeadLetterRow {
    id: Uuid,
    message: Value,
    reason: String,
    created_at: OffsetDateTime,
}

const COMMAND_COLUMNS: &str =
    "id, command, params, status, error, submitted_by, submitted_at, finished_at";

impl PgStore {
    /// Create a new PostgreSQL store from a connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    /// Interpret a conditional update: no affected row means either a no-op
    /// transition or a missing command.
    async fn transition_result(&self, id: CommandId, rows_affected: u64) -> Result<bool> {
        if rows_affected > 0 {
            return Ok(true);
        }
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM razor.commands WHERE id = $1)")
                .bind(id.get())
                .fetch_one(&self.pool)
                .await?;
        if exists {
            Ok(false)
        } else {
            Err(Error::CommandNotFound(id))
        }
    }
}

impl Store for PgStore {
    type UnitOfWork<'a> = PgUnitOfWork<'a>;

    async fn begin(&self) -> Result<Self::UnitOfWork<'_>> {
        let tx = self.pool.begin().await?;
        Ok(PgUnitOfWork { tx })
    }
}

/// PostgreSQL unit of work.
///
/// Wraps a transaction. Domain writes can join it through
/// [`transaction`](Self::transaction) so they commit or roll back together
/// with the commands and messages created here.
pub struct PgUnitOfWork<'a> {
    tx: Transaction<'a, Postgres>,
}

impl<'a> PgUnitOfWork<'a> {
    /// The open transaction.
    pub fn transaction(&mut self) -> &mut Transaction<'a, Postgres> {
        &mut self.tx
    }
}

impl UnitOfWork for PgUnitOfWork<'_> {
    async fn create_command(&mut self, command: NewCommand) -> Result<Command> {
        let row: CommandRow = sqlx::query_as(&format!(
            "INSERT INTO razor.commands (command, params, submitted_by)
             VALUES ($1, $2, $3)
             RETURNING {COMMAND_COLUMNS}"
        ))
        .bind(&command.command)
        .bind(&command.params)
        .bind(command.submitted_by.as_deref())
        .fetch_one(&mut *self.tx)
        .await?;

        row.try_into()
    }

    async fn enqueue(&mut self, message: Message) -> Result<()> {
        let body = serde_json::to_value(&message)?;

        sqlx::query("INSERT INTO razor.messages (id, body) VALUES ($1, $2)")
            .bind(Uuid::now_v7())
            .bind(body)
            .execute(&mut *self.tx)
            .await?;

        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }
}

impl CommandStore for PgStore {
    async fn find_command(&self, id: CommandId) -> Result<Option<Command>> {
        let row: Option<CommandRow> = sqlx::query_as(&format!(
            "SELECT {COMMAND_COLUMNS} FROM razor.commands WHERE id = $1"
        ))
        .bind(id.get())
        .fetch_optional(&self.pool)
        .await?;

        row.map(Command::try_from).transpose()
    }

    async fn cancel_command(&self, id: CommandId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE razor.commands
            SET status = 'cancelled',
                finished_at = now()
            WHERE id = $1
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        self.transition_result(id, result.rows_affected()).await
    }

    async fn begin_command(&self, id: CommandId) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE razor.commands
            SET status = 'running'
            WHERE id = $1
              AND status = 'pending'
            "#,
        )
        .bind(id.get())
        .execute(&self.pool)
        .await?;

        self.transition_result(id, result.rows_affected()).await
    }

    async fn finish_command(&self, id: CommandId, success: bool) -> Result<bool> {
        let status = if success { "finished" } else { "failed" };
        let result = sqlx::query(
            r#"
            UPDATE razor.commands
            SET status = $2,
                finished_at = now()
            WHERE id = $1
              AND status IN ('pending', 'running')
            "#,
        )
        .bind(id.get())
        .bind(status)
        .execute(&self.pool)
        .await?;

        self.transition_result(id, result.rows_affected()).await
    }

    async fn add_command_exception(
        &self,
        id: CommandId,
        record: ErrorRecord,
        attempt: Option<u32>,
    ) -> Result<bool> {
        let record = serde_json::to_value(&record)?;

        // The slot check and the write happen under the row lock taken by the
        // UPDATE, so two concurrent writers of one slot cannot both succeed.
        let result = match attempt {
            Some(attempt) => {
                sqlx::query(
                    r#"
                    UPDATE razor.commands
                    SET error = error || jsonb_build_object($2::text, $3::jsonb)
                    WHERE id = $1
                      AND NOT jsonb_exists(error, $2::text)
                    "#,
                )
                .bind(id.get())
                .bind(attempt.to_string())
                .bind(record)
                .execute(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    r#"
                    UPDATE razor.commands
                    SET error = error || jsonb_build_object(
                        (SELECT COALESCE(MAX(slot::bigint) + 1, 0)
                         FROM jsonb_object_keys(error) AS slot)::text,
                        $2::jsonb)
                    WHERE id = $1
                    "#,
                )
                .bind(id.get())
                .bind(record)
                .execute(&self.pool)
                .await?
            }
        };

        self.transition_result(id, result.rows_affected()).await
    }
}

impl MessageQueue for PgStore {
    async fn publish(&self, message: &Message, delay: Duration) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let body = serde_json::to_value(message)?;

        // Delivery time computed in DB to avoid clock skew between app and DB servers.
        sqlx::query(
            r#"
            INSERT INTO razor.messages (id, body, deliver_at)
            VALUES ($1, $2, now() + ($3 * interval '1 second'))
            "#,
        )
        .bind(id)
        .bind(body)
        .bind(delay.as_secs_f64())
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn claim(&self, worker_id: &str, lock_duration: Duration) -> Result<Option<Delivery>> {
        let row: Option<DeliveryRow> = sqlx::query_as(
            r#"
            UPDATE razor.messages
            SET locked_until = now() + ($1 * interval '1 second'),
                locked_by = $2
            WHERE id = (
                SELECT id FROM razor.messages
                WHERE deliver_at <= now()
                  AND (locked_until IS NULL OR locked_until < now())
                ORDER BY deliver_at
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id, body, enqueued_at, deliver_at
            "#,
        )
        .bind(lock_duration.as_secs_f64())
        .bind(worker_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(Delivery::from))
    }

    async fn ack(&self, delivery_id: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM razor.messages WHERE id = $1")
            .bind(delivery_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn pending_messages(&self) -> Result<Vec<Delivery>> {
        let rows: Vec<DeliveryRow> = sqlx::query_as(
            r#"
            SELECT id, body, enqueued_at, deliver_at
            FROM razor.messages
            ORDER BY deliver_at, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Delivery::from).collect())
    }

    async fn requeue(
        &self,
        delivery_id: Uuid,
        message: &Message,
        delay: Duration,
    ) -> Result<Option<Uuid>> {
        // Delete and insert in one statement: either the retry replaces the
        // claimed row or nothing changes.
        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            WITH gone AS (
                DELETE FROM razor.messages
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO razor.messages (id, body, deliver_at)
            SELECT $2, $3::jsonb, now() + ($4::float8 * interval '1 second') FROM gone
            RETURNING id
            "#,
        )
        .bind(delivery_id)
        .bind(Uuid::now_v7())
        .bind(serde_json::to_value(message)?)
        .bind(delay.as_secs_f64())
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn dead_letter_delivery(
        &self,
        delivery_id: Uuid,
        message: &Message,
        reason: &str,
    ) -> Result<Option<Uuid>> {
        let command_id = message
            .command
            .as_ref()
            .and_then(CommandId::from_reference)
            .map(CommandId::get);

        let id: Option<Uuid> = sqlx::query_scalar(
            r#"
            WITH gone AS (
                DELETE FROM razor.messages
                WHERE id = $1
                RETURNING id
            )
            INSERT INTO razor.dead_letters (id, class, command_id, message, reason)
            SELECT $2, $3::text, $4::bigint, $5::jsonb, $6::text FROM gone
            RETURNING id
            "#,
        )
        .bind(delivery_id)
        .bind(Uuid::now_v7())
        .bind(&message.class)
        .bind(command_id)
        .bind(serde_json::to_value(message)?)
        .bind(reason)
        .fetch_optional(&self.pool)
        .await?;

        Ok(id)
    }

    async fn dead_letter(&self, message: &Message, reason: &str) -> Result<Uuid> {
        let id = Uuid::now_v7();
        let command_id = message
            .command
            .as_ref()
            .and_then(CommandId::from_reference)
            .map(CommandId::get);

        sqlx::query(
            r#"
            INSERT INTO razor.dead_letters (id, class, command_id, message, reason)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(id)
        .bind(&message.class)
        .bind(command_id)
        .bind(serde_json::to_value(message)?)
        .bind(reason)
        .execute(&self.pool)
        .await?;

        Ok(id)
    }

    async fn fetch_dead_letters(&self, query: &DeadLetterQuery) -> Result<Vec<DeadLetter>> {
        let limit = query.limit.unwrap_or(100) as i64;

        let rows: Vec<DeadLetterRow> = sqlx::query_as(
            r#"
            SELECT id, message, reason, created_at
            FROM razor.dead_letters
            WHERE ($1::text IS NULL OR class = $1)
              AND ($2::bigint IS NULL OR command_id = $2)
            ORDER BY created_at, id
            LIMIT $3
            "#,
        )
        .bind(query.class.as_deref())
        .bind(query.command.map(CommandId::get))
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<DeadLetter> {
                Ok(DeadLetter {
                    id: row.id,
                    message: serde_json::from_value(row.message)?,
                    reason: row.reason,
                    created_at: row.created_at,
                })
            })
            .collect()
    }

    async fn retry_dead_letter(&self, dead_letter_id: Uuid) -> Result<bool> {
        // Move and reset in one statement so a dead letter is never both
        // queued and stored.
        let result = sqlx::query(
            r#"
            WITH moved AS (
                DELETE FROM razor.dead_letters
                WHERE id = $1
                RETURNING message
            )
            INSERT INTO razor.messages (id, body)
            SELECT $2, message - 'retries' FROM moved
            "#,
        )
        .bind(dead_letter_id)
        .bind(Uuid::now_v7())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
