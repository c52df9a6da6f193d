//! CLI command implementations.

pub mod buildrequests;
pub mod get;

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use conductor_config::MasterConfig;
use conductor_core::{Results, SystemClock};
use conductor_data::DataConnector;
use conductor_db::{MasterRepo, PgStore, create_pool, run_migrations};
use conductor_mq::{EventBus, Subscription};
use tracing::info;

/// Patterns printed by `--show-events`.
const EVENT_PATTERNS: [&str; 2] = ["buildrequests.*.*", "buildsets.*.*"];

/// A connected master: data connector plus optional event capture.
pub struct Session {
    pub data: DataConnector,
    events: Vec<Subscription>,
}

impl Session {
    pub async fn open(config: &MasterConfig, database_url: &str, show_events: bool) -> Result<Self> {
        info!("Connecting to database...");
        let pool = create_pool(database_url, config.database.max_connections).await?;
        let store = PgStore::new(pool);
        let masterid = store.find_master_id(&config.master).await?;
        info!(master = %config.master, masterid = %masterid, "Registered master");

        let bus = Arc::new(EventBus::new());
        let mut events = Vec::new();
        if show_events {
            for pattern in EVENT_PATTERNS {
                events.push(bus.subscribe_to(pattern)?);
            }
        }

        let data = DataConnector::new(Arc::new(store), bus, Arc::new(SystemClock), masterid);
        Ok(Self { data, events })
    }

    /// Print every captured event as `topic body`.
    pub fn print_events(&mut self) {
        for subscription in &mut self.events {
            for message in subscription.drain() {
                println!("event {} {}", message.topic, message.body);
            }
        }
    }
}

pub async fn migrate(database_url: &str, max_connections: u32) -> Result<()> {
    info!("Connecting to database...");
    let pool = create_pool(database_url, max_connections).await?;
    run_migrations(&pool).await?;
    println!("Migrations applied");
    Ok(())
}

/// Accept a numeric result code or a well-known name.
pub fn parse_results(s: &str) -> std::result::Result<Results, String> {
    if let Ok(code) = s.parse::<i32>() {
        return Ok(Results(code));
    }
    (0..=6)
        .map(Results)
        .find(|r| r.name() == Some(s))
        .ok_or_else(|| format!("unknown result '{}'", s))
}

pub fn timestamp(secs: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    secs.map(|secs| {
        DateTime::from_timestamp(secs, 0).with_context(|| format!("invalid timestamp {}", secs))
    })
    .transpose()
}
