mod config;
mod daemon;
mod db;
mod error_tracker;
mod filename;
mod filters;
mod import;
mod progress;
mod remote;
mod shutdown;
mod sync;

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use config::Settings;

#[derive(Parser)]
#[command(name = "parqsync", version, about = "Continuous parquet snapshot mirror (S3 → Postgres)")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the importer: apply migrations, then sync every configured table forever
    Run {
        /// Comma-separated table list (overrides TABLES / the registry)
        #[arg(long)]
        tables: Option<String>,

        /// Postgres DSN override
        #[arg(long)]
        postgres_dsn: Option<String>,

        /// Local input directory override
        #[arg(long)]
        data_dir: Option<PathBuf>,

        /// Log directory for rolling log files (default: stderr)
        #[arg(long)]
        log_dir: Option<PathBuf>,
    },

    /// Apply schema migrations and exit
    Migrate {
        /// Comma-separated table list (overrides TABLES / the registry)
        #[arg(long)]
        tables: Option<String>,

        /// Postgres DSN override
        #[arg(long)]
        postgres_dsn: Option<String>,
    },
}

fn main() -> anyhow::Result<()> {
    // Load ENV_FILE (default .env) before anything reads the environment.
    let env_file = std::env::var("ENV_FILE").unwrap_or_else(|_| ".env".to_string());
    let _ = dotenvy::from_filename(env_file);

    let cli = Cli::parse();

    // For the long-running daemon a rolling file appender is available;
    // everything else logs to stderr.
    let _guard;
    match &cli.command {
        Commands::Run {
            log_dir: Some(dir), ..
        } => {
            std::fs::create_dir_all(dir)?;
            let file_appender = tracing_appender::rolling::daily(dir, "parqsync.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            _guard = Some(guard);

            tracing_subscriber::fmt()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive("parqsync=info".parse()?),
                )
                .init();
        }
        _ => {
            _guard = None;
            tracing_subscriber::fmt()
                .with_env_filter(
                    tracing_subscriber::EnvFilter::from_default_env()
                        .add_directive("parqsync=info".parse()?),
                )
                .init();
        }
    }

    match cli.command {
        Commands::Run {
            tables,
            postgres_dsn,
            data_dir,
            log_dir: _,
        } => {
            let settings = Settings::from_env()?.with_overrides(
                tables.as_deref(),
                postgres_dsn.as_deref(),
                data_dir.as_deref(),
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(daemon::run(settings))?;
        }
        Commands::Migrate {
            tables,
            postgres_dsn,
        } => {
            let settings = Settings::from_env()?.with_overrides(
                tables.as_deref(),
                postgres_dsn.as_deref(),
                None,
            );

            let rt = tokio::runtime::Runtime::new()?;
            rt.block_on(cmd_migrate(settings))?;
        }
    }

    Ok(())
}

async fn cmd_migrate(settings: Settings) -> anyhow::Result<()> {
    settings.validate()?;
    let tables = settings.table_names()?;
    let views = settings.view_names();

    let pool = db::connect(&settings).await?;
    let applied = db::migrate::run_migrations(&pool, &settings, &tables, &views).await?;
    println!("applied {applied} migration(s)");
    Ok(())
}
