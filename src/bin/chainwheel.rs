//! Main entry point for the chainwheel daemon.
//!
//! Connects to the configuration database, applies the schema, repairs
//! run-status threads left over from an unclean shutdown, then runs
//! the scheduler loop until a termination signal arrives.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chainwheel::{Config, Database, DbLogger, LogLevel, SchedulerConfig, SchedulerHandle};

#[derive(Parser, Debug)]
#[command(name = "chainwheel", about = "PostgreSQL-backed task chain scheduler")]
struct Args {
    /// Database host
    #[arg(long)]
    host: Option<String>,

    /// Database port
    #[arg(long)]
    port: Option<u16>,

    /// Database name
    #[arg(long)]
    dbname: Option<String>,

    /// Database user
    #[arg(long)]
    user: Option<String>,

    /// Database password
    #[arg(long)]
    password: Option<String>,

    /// SSL mode (disable, require, ...)
    #[arg(long)]
    sslmode: Option<String>,

    /// Agent tag; configs with a client_name only run on the matching
    /// agent
    #[arg(long)]
    client_name: Option<String>,

    /// Record DEBUG/NOTICE/LOG levels in the database log
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn apply(self, config: &mut Config) {
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(dbname) = self.dbname {
            config.dbname = dbname;
        }
        if let Some(user) = self.user {
            config.user = user;
        }
        if let Some(password) = self.password {
            config.password = password;
        }
        if let Some(sslmode) = self.sslmode {
            config.sslmode = sslmode;
        }
        if let Some(client_name) = self.client_name {
            config.client_name = Some(client_name);
        }
        if self.verbose {
            config.verbose = true;
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();

    let mut config = Config::from_env()?;
    Args::parse().apply(&mut config);

    info!(
        host = %config.host,
        port = config.port,
        dbname = %config.dbname,
        client_name = ?config.client_name,
        "starting chainwheel"
    );

    let db = Database::connect(&config.database_url()).await?;
    db.migrate().await?;
    info!("database schema ready");

    let logger = DbLogger::new(db.pool().clone(), config.client_name.clone(), config.verbose);

    let repaired = db.fix_scheduler_crash().await?;
    if repaired > 0 {
        logger
            .log(
                LogLevel::Log,
                &format!("marked {repaired} abandoned run(s) as DEAD"),
            )
            .await;
    }

    let scheduler = SchedulerHandle::start(
        SchedulerConfig {
            client_name: config.client_name.clone(),
            ..SchedulerConfig::default()
        },
        db,
        logger.clone(),
    );
    logger.log(LogLevel::Log, "chainwheel started").await;

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");

    scheduler.shutdown().await?;
    logger.log(LogLevel::Log, "chainwheel stopped").await;

    Ok(())
}
