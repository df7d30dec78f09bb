//! Data-access layer for the configuration database.
//!
//! Every coordination concern of the scheduler goes through this
//! facade: chain and config lookups, run-status threads, execution-log
//! appends and the crash-recovery sweep. All statements are
//! parameterized; callers that need transactional scope pass the
//! transaction in explicitly so one transaction can span a whole chain
//! run.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use thiserror::Error;

pub type DbResult<T> = Result<T, DbError>;

#[derive(Debug, Error)]
pub enum DbError {
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
}

/// Task kinds a chain step dispatches to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Sql,
    Shell,
    Builtin,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sql => "SQL",
            Self::Shell => "SHELL",
            Self::Builtin => "BUILTIN",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SQL" => Some(Self::Sql),
            "SHELL" => Some(Self::Shell),
            "BUILTIN" => Some(Self::Builtin),
            _ => None,
        }
    }
}

/// Lifecycle states of a run-status thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Started,
    ChainFailed,
    ChainDone,
    Dead,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Started => "STARTED",
            Self::ChainFailed => "CHAIN_FAILED",
            Self::ChainDone => "CHAIN_DONE",
            Self::Dead => "DEAD",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Started)
    }
}

/// A scheduling envelope around one chain, as stored in
/// `timetable.chain_execution_config`.
#[derive(Debug, Clone, FromRow)]
pub struct ChainConfig {
    pub chain_execution_config: i32,
    pub chain_id: i32,
    pub chain_name: String,
    pub run_at: Option<String>,
    pub max_instances: Option<i32>,
    pub live: bool,
    pub self_destruct: bool,
    pub exclusive_execution: bool,
    pub excluded_execution_configs: Option<Vec<i32>>,
    pub client_name: Option<String>,
}

/// One executable element of a chain, joined with its base task and
/// the optional target connection string.
#[derive(Debug, Clone, FromRow)]
pub struct ChainStep {
    pub chain_id: i32,
    pub task_id: i32,
    pub name: String,
    pub script: Option<String>,
    pub kind: String,
    pub run_uid: Option<String>,
    pub ignore_error: bool,
    pub connect_string: Option<String>,
}

impl ChainStep {
    pub fn task_kind(&self) -> Option<TaskKind> {
        TaskKind::parse(&self.kind)
    }
}

/// Append-only record of one completed step.
#[derive(Debug, Clone)]
pub struct ExecutionLogEntry {
    pub chain_execution_config: i32,
    pub chain_id: i32,
    pub task_id: i32,
    pub name: String,
    pub script: Option<String>,
    pub kind: String,
    pub started: DateTime<Utc>,
    pub finished: DateTime<Utc>,
    pub returncode: i32,
    pub pid: i64,
}

#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Connect to the configuration database.
    pub async fn connect(url: &str) -> DbResult<Self> {
        let pool = PgPoolOptions::new().max_connections(16).connect(url).await?;
        Ok(Self { pool })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply the embedded schema migrations.
    pub async fn migrate(&self) -> DbResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn begin(&self) -> DbResult<Transaction<'static, Postgres>> {
        Ok(self.pool.begin().await?)
    }

    /// Commit a transaction, surfacing any failure to the caller.
    pub async fn commit(&self, tx: Transaction<'_, Postgres>) -> DbResult<()> {
        tx.commit().await?;
        Ok(())
    }

    /// Configs this agent may consider: live, and either unowned or
    /// owned by this agent's tag. Cron due-ness is evaluated by the
    /// scheduler on top of this set.
    pub async fn select_live_configs(
        &self,
        client_name: Option<&str>,
    ) -> DbResult<Vec<ChainConfig>> {
        let rows = sqlx::query_as::<_, ChainConfig>(
            r#"
            SELECT chain_execution_config, chain_id, chain_name, run_at::TEXT AS run_at,
                   max_instances, live, self_destruct, exclusive_execution,
                   excluded_execution_configs, client_name
            FROM timetable.chain_execution_config
            WHERE live AND (client_name IS NULL OR client_name = $1)
            ORDER BY chain_execution_config
            "#,
        )
        .bind(client_name)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Walk a chain from its head, returning the steps in execution
    /// order. An unknown head yields an empty list.
    pub async fn load_chain_elements(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        head_chain_id: i32,
    ) -> DbResult<Vec<ChainStep>> {
        let rows = sqlx::query_as::<_, ChainStep>(
            r#"
            WITH RECURSIVE x (chain_id, task_id, run_uid, ignore_error, database_connection, step_order) AS (
                SELECT tc.chain_id, tc.task_id, tc.run_uid, tc.ignore_error,
                       tc.database_connection, 1
                FROM timetable.task_chain tc
                WHERE tc.parent_id IS NULL AND tc.chain_id = $1
                UNION ALL
                SELECT tc.chain_id, tc.task_id, tc.run_uid, tc.ignore_error,
                       tc.database_connection, x.step_order + 1
                FROM timetable.task_chain tc
                JOIN x ON tc.parent_id = x.chain_id
            )
            SELECT x.chain_id, x.task_id, bt.name, bt.script, bt.kind::TEXT AS kind,
                   x.run_uid, x.ignore_error, dc.connect_string
            FROM x
            JOIN timetable.base_task bt USING (task_id)
            LEFT JOIN timetable.database_connection dc USING (database_connection)
            ORDER BY x.step_order
            "#,
        )
        .bind(head_chain_id)
        .fetch_all(tx.as_mut())
        .await?;
        Ok(rows)
    }

    /// Parameter values for one step under one config, ordered by
    /// `order_id`. Each value is the textual form of a JSON array.
    pub async fn load_chain_params(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        config_id: i32,
        chain_id: i32,
    ) -> DbResult<Vec<String>> {
        let values = sqlx::query_scalar::<_, String>(
            r#"
            SELECT value::TEXT
            FROM timetable.chain_execution_parameters
            WHERE chain_execution_config = $1 AND chain_id = $2 AND value IS NOT NULL
            ORDER BY order_id ASC
            "#,
        )
        .bind(config_id)
        .bind(chain_id)
        .fetch_all(tx.as_mut())
        .await?;
        Ok(values)
    }

    /// Open a run-status thread with a STARTED row. The returned id is
    /// the thread identifier every later row of this run carries as
    /// `start_status`.
    pub async fn insert_chain_run_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        config_id: i32,
        chain_id: i32,
    ) -> DbResult<i32> {
        let run_status = sqlx::query_scalar::<_, i32>(
            r#"
            INSERT INTO timetable.run_status
                (execution_status, chain_id, started, chain_execution_config)
            VALUES ('STARTED', $1, now(), $2)
            RETURNING run_status
            "#,
        )
        .bind(chain_id)
        .bind(config_id)
        .fetch_one(tx.as_mut())
        .await?;

        sqlx::query("UPDATE timetable.run_status SET start_status = run_status WHERE run_status = $1")
            .bind(run_status)
            .execute(tx.as_mut())
            .await?;

        Ok(run_status)
    }

    /// Append a status row to an existing run thread.
    pub async fn update_chain_run_status(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        status: ExecutionStatus,
        start_status: i32,
        config_id: i32,
        chain_id: i32,
        current_element: Option<i32>,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO timetable.run_status
                (execution_status, start_status, chain_id, current_execution_element,
                 started, last_status_update, chain_execution_config)
            VALUES ($1::timetable.execution_status, $2, $3, $4, clock_timestamp(),
                    clock_timestamp(), $5)
            "#,
        )
        .bind(status.as_str())
        .bind(start_status)
        .bind(chain_id)
        .bind(current_element)
        .bind(config_id)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    pub async fn insert_execution_log(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        entry: &ExecutionLogEntry,
    ) -> DbResult<()> {
        sqlx::query(
            r#"
            INSERT INTO timetable.execution_log
                (chain_execution_config, chain_id, task_id, name, script, kind,
                 last_run, finished, returncode, pid)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            "#,
        )
        .bind(entry.chain_execution_config)
        .bind(entry.chain_id)
        .bind(entry.task_id)
        .bind(&entry.name)
        .bind(&entry.script)
        .bind(&entry.kind)
        .bind(entry.started)
        .bind(entry.finished)
        .bind(entry.returncode)
        .bind(entry.pid)
        .execute(tx.as_mut())
        .await?;
        Ok(())
    }

    /// Delete a config row, e.g. after a self-destruct run. Returns
    /// whether a row actually went away.
    pub async fn delete_chain_config(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        config_id: i32,
    ) -> DbResult<bool> {
        let result =
            sqlx::query("DELETE FROM timetable.chain_execution_config WHERE chain_execution_config = $1")
                .bind(config_id)
                .execute(tx.as_mut())
                .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Whether another instance of this config may start now. With no
    /// active run threads at all the answer is always yes; a NULL
    /// `max_instances` never caps.
    pub async fn can_proceed_chain_execution(
        &self,
        config_id: i32,
        max_instances: Option<i32>,
    ) -> DbResult<bool> {
        let running = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT count(*)
            FROM timetable.get_running_jobs($1)
            WHERE chain_execution_config = $1
            GROUP BY chain_execution_config
            "#,
        )
        .bind(config_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(match running {
            None => true,
            Some(count) => max_instances.map_or(true, |max| count < i64::from(max)),
        })
    }

    /// Config ids with at least one non-terminal run thread, across
    /// every agent sharing this database.
    pub async fn active_config_ids(&self) -> DbResult<Vec<i32>> {
        let ids = sqlx::query_scalar::<_, i32>(
            "SELECT DISTINCT chain_execution_config FROM timetable.get_running_jobs(0)",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(ids)
    }

    /// Startup sweep: every run thread whose latest row is not
    /// terminal gets a DEAD row appended, so admission counts are
    /// accurate after an unclean shutdown. Returns the number of
    /// threads repaired.
    pub async fn fix_scheduler_crash(&self) -> DbResult<u64> {
        let result = sqlx::query(
            r#"
            INSERT INTO timetable.run_status
                (execution_status, start_status, chain_id, started,
                 last_status_update, chain_execution_config)
            SELECT 'DEAD', latest.start_status, latest.chain_id, now(),
                   clock_timestamp(), latest.chain_execution_config
            FROM (
                SELECT DISTINCT ON (start_status)
                       start_status, chain_id, chain_execution_config, execution_status
                FROM timetable.run_status
                WHERE start_status IS NOT NULL
                ORDER BY start_status, last_status_update DESC, run_status DESC
            ) AS latest
            WHERE latest.execution_status NOT IN ('CHAIN_FAILED', 'CHAIN_DONE', 'DEAD')
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    /// Timestamp of the most recent terminal row for a config; drives
    /// `@after` scheduling.
    pub async fn last_completion(&self, config_id: i32) -> DbResult<Option<DateTime<Utc>>> {
        let ts = sqlx::query_scalar::<_, Option<DateTime<Utc>>>(
            r#"
            SELECT max(last_status_update)
            FROM timetable.run_status
            WHERE chain_execution_config = $1
              AND execution_status IN ('CHAIN_FAILED', 'CHAIN_DONE', 'DEAD')
            "#,
        )
        .bind(config_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(ts)
    }
}
