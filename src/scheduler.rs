//! Scheduler loop: select due configs, admit, spawn chain runners.
//!
//! One cooperative loop per process. Each tick reads the live configs
//! for this agent from the database, filters the ones whose schedule
//! fires now, asks the admission controller, and spawns a runner task
//! per admitted config. The loop never blocks on a runner.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{Result, anyhow};
use chrono::Utc;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior, interval_at};
use tracing::{debug, error, info};

use crate::admission::{Admission, AdmissionController};
use crate::db::{ChainConfig, Database};
use crate::dispatch::Dispatcher;
use crate::logging::{DbLogger, LogLevel};
use crate::runner::ChainRunner;
use crate::schedule::{Cadence, ConfigClock};

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Poll period; ticks are aligned to wall-clock multiples of it.
    pub tick: Duration,
    /// This agent's tag for `client_name` partitioning.
    pub client_name: Option<String>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(60),
            client_name: None,
        }
    }
}

/// Handle to a running scheduler loop.
pub struct SchedulerHandle {
    shutdown_tx: watch::Sender<bool>,
    handle: JoinHandle<Result<()>>,
}

impl SchedulerHandle {
    pub fn start(config: SchedulerConfig, db: Database, logger: DbLogger) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let (cancel_tx, _) = watch::channel(false);
            let admission = AdmissionController::new(db.clone(), config.client_name.clone());
            let task = SchedulerTask {
                config,
                db,
                logger,
                admission,
                shutdown_rx,
                cancel_tx,
                clocks: HashMap::new(),
                runners: Vec::new(),
            };
            if let Err(err) = task.run().await {
                error!(?err, "scheduler loop terminated with error");
                Err(err)
            } else {
                Ok(())
            }
        });
        Self {
            shutdown_tx,
            handle,
        }
    }

    pub fn trigger_shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Stop the loop and wait for in-flight runners to reach their
    /// next step boundary.
    pub async fn shutdown(self) -> Result<()> {
        self.trigger_shutdown();
        match self.handle.await {
            Ok(result) => result,
            Err(err) => Err(anyhow!("scheduler task panicked: {err}")),
        }
    }
}

struct SchedulerTask {
    config: SchedulerConfig,
    db: Database,
    logger: DbLogger,
    admission: AdmissionController,
    shutdown_rx: watch::Receiver<bool>,
    /// Flipping this tells every runner to stop at its next step
    /// boundary and record DEAD.
    cancel_tx: watch::Sender<bool>,
    /// Firing state per config id; `None` marks an unusable `run_at`
    /// that has already been reported.
    clocks: HashMap<i32, Option<ConfigClock>>,
    runners: Vec<JoinHandle<()>>,
}

impl SchedulerTask {
    async fn run(mut self) -> Result<()> {
        info!(
            tick_secs = self.config.tick.as_secs(),
            client_name = ?self.config.client_name,
            "scheduler loop started"
        );

        let mut ticker = interval_at(Instant::now() + self.aligned_delay(), self.config.tick);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // immediate first pass so @reboot configs fire at process start
        if let Err(err) = self.poll_and_spawn().await {
            error!(?err, "initial scheduler pass failed");
        }

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_and_spawn().await {
                        error!(?err, "scheduler tick failed");
                        self.logger
                            .log(LogLevel::Error, &format!("scheduler tick failed: {err}"))
                            .await;
                    }
                }
                changed = self.shutdown_rx.changed() => {
                    if changed.is_ok() && *self.shutdown_rx.borrow() {
                        info!("scheduler loop shutting down");
                        break;
                    }
                }
            }
        }

        let _ = self.cancel_tx.send(true);
        for handle in self.runners.drain(..) {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Delay until the next wall-clock multiple of the tick period, so
    /// a 60s tick fires on minute boundaries.
    fn aligned_delay(&self) -> Duration {
        let tick = self.config.tick.as_secs().max(1);
        let rem = (Utc::now().timestamp() as u64) % tick;
        Duration::from_secs(if rem == 0 { 0 } else { tick - rem })
    }

    async fn poll_and_spawn(&mut self) -> Result<()> {
        self.runners.retain(|handle| !handle.is_finished());

        let now = Utc::now();
        let configs = self
            .db
            .select_live_configs(self.config.client_name.as_deref())
            .await?;
        self.clocks
            .retain(|id, _| configs.iter().any(|c| c.chain_execution_config == *id));

        for config in configs {
            let id = config.chain_execution_config;

            if !self.clocks.contains_key(&id) {
                let clock = match &config.run_at {
                    None => None,
                    Some(run_at) => match Cadence::parse(run_at) {
                        Ok(cadence) => Some(ConfigClock::new(cadence, now)),
                        Err(err) => {
                            self.logger
                                .log(
                                    LogLevel::Error,
                                    &format!(
                                        "config '{}' has unusable run_at: {err}",
                                        config.chain_name
                                    ),
                                )
                                .await;
                            None
                        }
                    },
                };
                self.clocks.insert(id, clock);
            }

            let needs_anchor = matches!(
                self.clocks.get(&id),
                Some(Some(clock)) if clock.wants_completion_anchor()
            );
            let anchor = if needs_anchor {
                self.db.last_completion(id).await?
            } else {
                None
            };
            let due = match self.clocks.get(&id) {
                Some(Some(clock)) => clock.due(now, anchor),
                _ => false,
            };
            if !due {
                continue;
            }

            match self.admission.can_start(&config).await? {
                Admission::Admitted => {
                    if let Some(Some(clock)) = self.clocks.get_mut(&id) {
                        clock.mark_fired(now);
                    }
                    self.spawn_runner(config);
                }
                Admission::Rejected(reason) => {
                    debug!(config_id = id, reason, "config not eligible");
                }
                Admission::Deferred(reason) => {
                    debug!(config_id = id, reason = %reason, "config deferred this tick");
                }
            }
        }
        Ok(())
    }

    fn spawn_runner(&mut self, config: ChainConfig) {
        let db = self.db.clone();
        let logger = self.logger.clone();
        let dispatcher = Dispatcher::new(db.pool().clone(), logger.clone());
        let cancel = self.cancel_tx.subscribe();
        let handle = tokio::spawn(async move {
            let mut runner = ChainRunner::new(db, logger.clone(), dispatcher, cancel);
            if let Err(err) = runner.run(&config).await {
                error!(
                    config_id = config.chain_execution_config,
                    chain = %config.chain_name,
                    ?err,
                    "chain run aborted"
                );
                logger
                    .log(
                        LogLevel::Error,
                        &format!("chain '{}' aborted: {err}", config.chain_name),
                    )
                    .await;
            }
        });
        self.runners.push(handle);
    }
}
