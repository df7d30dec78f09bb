//! Execution-slot admission.
//!
//! Decides whether a candidate config may start a run right now, given
//! what the database reports about in-flight runs. There is no
//! in-memory fleet view on purpose: several agents may share one
//! configuration database, and the run-status table is the only
//! arbiter they have in common.

use crate::db::{ChainConfig, Database, DbResult};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    Admitted,
    /// Permanently ineligible for this agent.
    Rejected(&'static str),
    /// Not now; ask again next tick.
    Deferred(String),
}

impl Admission {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admitted)
    }
}

pub struct AdmissionController {
    db: Database,
    client_name: Option<String>,
}

impl AdmissionController {
    pub fn new(db: Database, client_name: Option<String>) -> Self {
        Self { db, client_name }
    }

    pub async fn can_start(&self, config: &ChainConfig) -> DbResult<Admission> {
        if !config.live {
            return Ok(Admission::Rejected("config is not live"));
        }
        if let Some(owner) = &config.client_name {
            if self.client_name.as_deref() != Some(owner.as_str()) {
                return Ok(Admission::Rejected("config belongs to another client"));
            }
        }

        let active = self.db.active_config_ids().await?;

        if config.exclusive_execution && !active.is_empty() {
            return Ok(Admission::Deferred(format!(
                "exclusive config must wait for {} active run(s)",
                active.len()
            )));
        }
        if let Some(excluded) = &config.excluded_execution_configs {
            if let Some(id) = active.iter().find(|id| excluded.contains(id)) {
                return Ok(Admission::Deferred(format!(
                    "excluded config {id} is active"
                )));
            }
        }

        if !self
            .db
            .can_proceed_chain_execution(config.chain_execution_config, config.max_instances)
            .await?
        {
            return Ok(Admission::Deferred(format!(
                "max_instances ({}) reached",
                config.max_instances.unwrap_or_default()
            )));
        }

        Ok(Admission::Admitted)
    }
}
