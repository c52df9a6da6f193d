//! Conductor CLI tool.

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use conductor_config::{LoggingConfig, load_master_config};
use conductor_core::{BuildRequestId, Results};
use tracing_subscriber::EnvFilter;

mod commands;

#[derive(Parser)]
#[command(name = "conductor")]
#[command(about = "Conductor build-request engine", long_about = None)]
struct Cli {
    /// Path to the master configuration
    #[arg(long, short, env = "CONDUCTOR_CONFIG", default_value = "conductor.kdl")]
    config: PathBuf,

    /// Database URL, overriding the configuration
    #[arg(long, env = "DATABASE_URL")]
    database_url: Option<String>,

    /// Print the build request and buildset events the command published
    #[arg(long, global = true)]
    show_events: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Apply database migrations
    Migrate,
    /// Claim build requests for this master
    Claim {
        #[arg(required = true)]
        ids: Vec<BuildRequestId>,
        /// Claim time in epoch seconds (default: now)
        #[arg(long)]
        at: Option<i64>,
    },
    /// Release this master's claims
    Unclaim {
        #[arg(required = true)]
        ids: Vec<BuildRequestId>,
    },
    /// Complete claimed build requests
    Complete {
        #[arg(required = true)]
        ids: Vec<BuildRequestId>,
        /// Result code or name (success, warnings, failure, ...)
        #[arg(long, value_parser = commands::parse_results)]
        results: Results,
        /// Completion time in epoch seconds (default: now)
        #[arg(long)]
        at: Option<i64>,
    },
    /// Refresh the claim time of requests this master holds
    Reclaim {
        #[arg(required = true)]
        ids: Vec<BuildRequestId>,
        #[arg(long)]
        at: Option<i64>,
    },
    /// Release claims of any master older than the expiry
    UnclaimExpired {
        /// Expiry in seconds (default: from the configuration)
        #[arg(long)]
        older_than: Option<u64>,
    },
    /// Submit a new buildset re-running a build request
    Rebuild { id: BuildRequestId },
    /// Query a resource path such as builders/linux/buildrequests
    Get {
        path: String,
        /// Filter as field[__op]=value; repeatable
        #[arg(long = "filter", short)]
        filters: Vec<String>,
        /// Order by field, `-field` for descending; repeatable
        #[arg(long, allow_hyphen_values = true)]
        order: Vec<String>,
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long)]
        offset: Option<usize>,
        /// Attach buildset properties (`*` for all); repeatable
        #[arg(long = "property")]
        properties: Vec<String>,
    },
}

fn init_tracing(logging: &LoggingConfig) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = load_master_config(&cli.config)
        .with_context(|| format!("Failed to load config: {}", cli.config.display()))?;
    init_tracing(&config.logging);

    let database_url = cli
        .database_url
        .clone()
        .or_else(|| config.database.url.clone())
        .context("No database URL: set DATABASE_URL, --database-url or the database node")?;

    if let Commands::Migrate = cli.command {
        return commands::migrate(&database_url, config.database.max_connections).await;
    }

    let mut session = commands::Session::open(&config, &database_url, cli.show_events).await?;
    let outcome = match cli.command {
        Commands::Migrate => Ok(()),
        Commands::Claim { ids, at } => commands::buildrequests::claim(&session, &ids, at).await,
        Commands::Unclaim { ids } => commands::buildrequests::unclaim(&session, &ids).await,
        Commands::Complete { ids, results, at } => {
            commands::buildrequests::complete(&session, &ids, results, at).await
        }
        Commands::Reclaim { ids, at } => {
            commands::buildrequests::reclaim(&session, &ids, at).await
        }
        Commands::UnclaimExpired { older_than } => {
            let expiry = older_than
                .map(std::time::Duration::from_secs)
                .unwrap_or(config.claims.expiry);
            commands::buildrequests::unclaim_expired(&session, expiry).await
        }
        Commands::Rebuild { id } => commands::buildrequests::rebuild(&session, id).await,
        Commands::Get {
            path,
            filters,
            order,
            limit,
            offset,
            properties,
        } => {
            let spec = commands::get::result_spec(&filters, order, limit, offset, properties)?;
            commands::get::get(&session, &path, &spec).await
        }
    };
    session.print_events();
    outcome
}
