use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use mcstats_import::{seed, ImportConfig, ImportEngine, ImportError};
use mcstats_resolver::{MojangClient, NameResolver, ResolverConfig};
use mcstats_storage::PgStore;
use tracing::{error, info};

mod logging;

const EXIT_OK: u8 = 0;
const EXIT_FAILURE: u8 = 1;
const EXIT_CONFIG: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "mcstats-cli")]
#[command(about = "Player statistics importer and name resolver")]
struct Cli {
    /// Also append log output to this file.
    #[arg(long, global = true, env = "MCSTATS_LOG_FILE")]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Import player stats documents into the current run.
    Import {
        #[arg(long)]
        dry_run: bool,
        /// Ignore stored content hashes and recompute every player.
        #[arg(long)]
        force_recompute: bool,
    },
    /// Refresh placeholder and stale player names.
    ResolveNames {
        #[arg(long)]
        run_id: Option<i64>,
        #[arg(long)]
        max_requests: Option<usize>,
        #[arg(long)]
        dry_run: bool,
    },
    /// Apply database migrations.
    Migrate,
    /// Upsert metric definitions and sources from a YAML file.
    SeedMetrics {
        #[arg(long, default_value = "metrics.yaml")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    if let Err(err) = logging::init_tracing("info", cli.log_file.as_deref()) {
        eprintln!("{err:#}");
        return ExitCode::from(EXIT_FAILURE);
    }

    let command = cli.command.unwrap_or(Commands::Import {
        dry_run: false,
        force_recompute: false,
    });
    let code = match command {
        Commands::Import {
            dry_run,
            force_recompute,
        } => import(dry_run, force_recompute).await,
        Commands::ResolveNames {
            run_id,
            max_requests,
            dry_run,
        } => resolve_names(run_id, max_requests, dry_run).await,
        Commands::Migrate => match connect().await {
            Ok(store) => report(migrate(&store).await),
            Err(code) => code,
        },
        Commands::SeedMetrics { path } => match connect().await {
            Ok(store) => report(seed_metrics(&store, &path).await),
            Err(code) => code,
        },
    };
    ExitCode::from(code)
}

async fn connect() -> Result<PgStore, u8> {
    let Ok(url) = std::env::var("DATABASE_URL") else {
        error!("DATABASE_URL is not set");
        return Err(EXIT_CONFIG);
    };
    PgStore::connect(&url).await.map_err(|err| {
        error!(error = %err, "connecting to database failed");
        EXIT_FAILURE
    })
}

async fn import(dry_run: bool, force_recompute: bool) -> u8 {
    let mut config = match ImportConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid import configuration");
            return exit_code(err.exit_code());
        }
    };
    config.dry_run |= dry_run;
    config.force_recompute |= force_recompute;
    let store = match connect().await {
        Ok(store) => store,
        Err(code) => return code,
    };

    match ImportEngine::new(store, config).run().await {
        Ok(summary) => {
            info!(
                run_id = ?summary.run_id,
                dry_run = summary.dry_run,
                kept = summary.kept,
                changed = summary.changed,
                unchanged = summary.unchanged,
                removed = summary.cleanup.profiles,
                awards = summary.awards,
                "import finished"
            );
            EXIT_OK
        }
        // Already logged as a warning; another import is running.
        Err(err @ ImportError::LockHeld(_)) => exit_code(err.exit_code()),
        Err(err) => {
            error!(error = %err, "import failed");
            exit_code(err.exit_code())
        }
    }
}

async fn resolve_names(run_id: Option<i64>, max_requests: Option<usize>, dry_run: bool) -> u8 {
    let mut config = match ResolverConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "invalid resolver configuration");
            return exit_code(err.exit_code());
        }
    };
    config.run_id = run_id.or(config.run_id);
    config.max_requests = max_requests.unwrap_or(config.max_requests);
    config.dry_run |= dry_run;

    let client = match MojangClient::new(&config) {
        Ok(client) => client,
        Err(err) => {
            error!(error = %err, "building identity client failed");
            return exit_code(err.exit_code());
        }
    };
    let store = match connect().await {
        Ok(store) => store,
        Err(code) => return code,
    };

    match NameResolver::new(store, client, config).run().await {
        Ok(_) => EXIT_OK,
        Err(err) => {
            error!(error = %err, "name resolution failed");
            exit_code(err.exit_code())
        }
    }
}

async fn migrate(store: &PgStore) -> Result<()> {
    store.migrate().await.context("applying migrations")?;
    info!("migrations applied");
    Ok(())
}

async fn seed_metrics(store: &PgStore, path: &Path) -> Result<()> {
    let seeded = seed::seed_metrics(store, path).await?;
    info!(path = %path.display(), metrics = seeded, "metric definitions seeded");
    Ok(())
}

fn report(result: Result<()>) -> u8 {
    match result {
        Ok(()) => EXIT_OK,
        Err(err) => {
            error!("command failed: {err:#}");
            EXIT_FAILURE
        }
    }
}

fn exit_code(code: i32) -> u8 {
    u8::try_from(code).unwrap_or(EXIT_FAILURE)
}
