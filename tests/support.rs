//! Shared helpers for database-backed integration tests.
//!
//! These tests need a disposable PostgreSQL database; they are skipped
//! unless `CHAINWHEEL_DATABASE_URL` is set.

#![allow(dead_code)]

use chainwheel::{ChainConfig, Database};

pub async fn connect() -> Option<Database> {
    let url = match std::env::var("CHAINWHEEL_DATABASE_URL") {
        Ok(url) => url,
        Err(_) => {
            eprintln!("skipping test: CHAINWHEEL_DATABASE_URL not set");
            return None;
        }
    };
    let db = Database::connect(&url)
        .await
        .expect("connect to test database");
    db.migrate().await.expect("apply migrations");
    Some(db)
}

/// Clear everything a previous test may have left behind. The seeded
/// BUILTIN base tasks stay.
pub async fn reset(db: &Database) {
    sqlx::query(
        "TRUNCATE timetable.task_chain, timetable.chain_execution_config, \
         timetable.chain_execution_parameters, timetable.log, \
         timetable.execution_log, timetable.run_status CASCADE",
    )
    .execute(db.pool())
    .await
    .expect("reset timetable tables");
    sqlx::query("DELETE FROM timetable.base_task WHERE kind <> 'BUILTIN'")
        .execute(db.pool())
        .await
        .expect("remove test base tasks");
}

pub async fn insert_task(db: &Database, name: &str, kind: &str, script: Option<&str>) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO timetable.base_task (name, kind, script) \
         VALUES ($1, $2::timetable.task_kind, $3) RETURNING task_id",
    )
    .bind(name)
    .bind(kind)
    .bind(script)
    .fetch_one(db.pool())
    .await
    .expect("insert base task")
}

pub async fn insert_chain_step(
    db: &Database,
    task_id: i32,
    parent_id: Option<i32>,
    ignore_error: bool,
) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO timetable.task_chain (task_id, parent_id, ignore_error) \
         VALUES ($1, $2, $3) RETURNING chain_id",
    )
    .bind(task_id)
    .bind(parent_id)
    .bind(ignore_error)
    .fetch_one(db.pool())
    .await
    .expect("insert chain element")
}

pub async fn insert_connection(db: &Database, connect_string: &str) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO timetable.database_connection (connect_string, comment) \
         VALUES ($1, 'test connection') RETURNING database_connection",
    )
    .bind(connect_string)
    .fetch_one(db.pool())
    .await
    .expect("insert database connection")
}

pub async fn insert_chain_step_on(
    db: &Database,
    task_id: i32,
    parent_id: Option<i32>,
    connection_id: i32,
) -> i32 {
    sqlx::query_scalar(
        "INSERT INTO timetable.task_chain (task_id, parent_id, database_connection) \
         VALUES ($1, $2, $3) RETURNING chain_id",
    )
    .bind(task_id)
    .bind(parent_id)
    .bind(connection_id)
    .fetch_one(db.pool())
    .await
    .expect("insert chain element with connection")
}

pub async fn insert_config(
    db: &Database,
    chain_id: i32,
    name: &str,
    self_destruct: bool,
    exclusive: bool,
    max_instances: Option<i32>,
    excluded: &[i32],
) -> i32 {
    let excluded = if excluded.is_empty() {
        None
    } else {
        Some(excluded.to_vec())
    };
    sqlx::query_scalar(
        "INSERT INTO timetable.chain_execution_config \
         (chain_id, chain_name, live, self_destruct, exclusive_execution, \
          max_instances, excluded_execution_configs) \
         VALUES ($1, $2, true, $3, $4, $5, $6) \
         RETURNING chain_execution_config",
    )
    .bind(chain_id)
    .bind(name)
    .bind(self_destruct)
    .bind(exclusive)
    .bind(max_instances)
    .bind(excluded)
    .fetch_one(db.pool())
    .await
    .expect("insert chain execution config")
}

pub async fn insert_param(db: &Database, config_id: i32, chain_id: i32, order: i32, value: &str) {
    sqlx::query(
        "INSERT INTO timetable.chain_execution_parameters \
         (chain_execution_config, chain_id, order_id, value) \
         VALUES ($1, $2, $3, $4::jsonb)",
    )
    .bind(config_id)
    .bind(chain_id)
    .bind(order)
    .bind(value)
    .execute(db.pool())
    .await
    .expect("insert chain parameters");
}

pub async fn load_config(db: &Database, name: &str) -> ChainConfig {
    db.select_live_configs(None)
        .await
        .expect("select live configs")
        .into_iter()
        .find(|c| c.chain_name == name)
        .expect("config exists")
}

/// The newest status row of the config's latest run thread.
pub async fn latest_status(db: &Database, config_id: i32) -> String {
    sqlx::query_scalar(
        "SELECT execution_status::TEXT FROM timetable.run_status \
         WHERE chain_execution_config = $1 \
         ORDER BY run_status DESC LIMIT 1",
    )
    .bind(config_id)
    .fetch_one(db.pool())
    .await
    .expect("run status rows exist")
}
