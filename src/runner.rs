//! Sequential execution of one chain under one config.
//!
//! A run holds a single transaction on the configuration database for
//! its whole lifetime: the STARTED row, every execution-log append and
//! the terminal status all commit together. Shell and cross-database
//! SQL side effects are recorded, never rolled back; recovery is
//! forward-only.

use chrono::Utc;
use tokio::sync::watch;
use tracing::{debug, info};

use crate::db::{ChainConfig, Database, DbResult, ExecutionLogEntry, ExecutionStatus};
use crate::dispatch::Dispatcher;
use crate::logging::{DbLogger, LogLevel};

/// Terminal outcome of one chain run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Done,
    Failed,
    Cancelled,
}

impl RunOutcome {
    fn status(&self) -> ExecutionStatus {
        match self {
            Self::Done => ExecutionStatus::ChainDone,
            Self::Failed => ExecutionStatus::ChainFailed,
            Self::Cancelled => ExecutionStatus::Dead,
        }
    }
}

pub struct ChainRunner {
    db: Database,
    logger: DbLogger,
    dispatcher: Dispatcher,
    cancel: watch::Receiver<bool>,
}

impl ChainRunner {
    pub fn new(
        db: Database,
        logger: DbLogger,
        dispatcher: Dispatcher,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        Self {
            db,
            logger,
            dispatcher,
            cancel,
        }
    }

    /// Walk the chain's steps in order. Cancellation is observed
    /// between steps only; a step in flight always completes.
    pub async fn run(&mut self, config: &ChainConfig) -> DbResult<RunOutcome> {
        let mut tx = self.db.begin().await?;
        let start_status = self
            .db
            .insert_chain_run_status(&mut tx, config.chain_execution_config, config.chain_id)
            .await?;
        let steps = self.db.load_chain_elements(&mut tx, config.chain_id).await?;

        debug!(
            config_id = config.chain_execution_config,
            chain = %config.chain_name,
            steps = steps.len(),
            "chain run started"
        );

        let mut outcome = RunOutcome::Done;
        let mut current_element = None;

        for step in &steps {
            current_element = Some(step.chain_id);

            if *self.cancel.borrow() {
                info!(chain = %config.chain_name, "chain run cancelled at step boundary");
                outcome = RunOutcome::Cancelled;
                break;
            }

            let params = self
                .db
                .load_chain_params(&mut tx, config.chain_execution_config, step.chain_id)
                .await?;

            let started = Utc::now();
            let result = self.dispatcher.execute(step, &params).await;
            let finished = Utc::now();
            let returncode = result.as_ref().map_or_else(|err| err.returncode(), |_| 0);

            self.db
                .insert_execution_log(
                    &mut tx,
                    &ExecutionLogEntry {
                        chain_execution_config: config.chain_execution_config,
                        chain_id: step.chain_id,
                        task_id: step.task_id,
                        name: step.name.clone(),
                        script: step.script.clone(),
                        kind: step.kind.clone(),
                        started,
                        finished,
                        returncode,
                        pid: std::process::id() as i64,
                    },
                )
                .await?;

            if let Err(err) = result {
                self.logger
                    .log(
                        LogLevel::Error,
                        &format!(
                            "chain '{}' step '{}' failed: {err}",
                            config.chain_name, step.name
                        ),
                    )
                    .await;
                if !step.ignore_error {
                    outcome = RunOutcome::Failed;
                    break;
                }
                debug!(step = %step.name, "step failed but ignore_error is set");
            }
        }

        self.db
            .update_chain_run_status(
                &mut tx,
                outcome.status(),
                start_status,
                config.chain_execution_config,
                config.chain_id,
                current_element,
            )
            .await?;
        self.db.commit(tx).await?;

        if outcome == RunOutcome::Done && config.self_destruct {
            let mut tx = self.db.begin().await?;
            let deleted = self
                .db
                .delete_chain_config(&mut tx, config.chain_execution_config)
                .await?;
            self.db.commit(tx).await?;
            if deleted {
                self.logger
                    .log(
                        LogLevel::Log,
                        &format!("self-destruct config '{}' removed", config.chain_name),
                    )
                    .await;
            }
        }

        info!(
            config_id = config.chain_execution_config,
            chain = %config.chain_name,
            outcome = ?outcome,
            "chain run finished"
        );
        Ok(outcome)
    }
}
