//! Supervisor (the `run` subcommand).
//!
//! Startup order: validate settings → connect the shared Postgres pool →
//! apply migrations → reflect target tables → start one synchronizer per
//! table, each with its own file/download/row-group worker pools. Designed
//! for 24/7 operation: the loop never exits on its own — an interrupt or the
//! first unrecovered synchronizer error sets the process-wide shutdown
//! signal, workers are given a bounded drain window, and the process leaves
//! with exit code 1.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::config::Settings;
use crate::db;
use crate::db::schema::reflect_tables;
use crate::db::tracking::Tracking;
use crate::filters::FilterSet;
use crate::import::ImportContext;
use crate::progress::ProgressSet;
use crate::remote::client::StoreClient;
use crate::shutdown::{is_shutdown_error, Shutdown};
use crate::sync::{run_table_sync, SyncContext};

/// How long workers get to drain after the shutdown signal fires.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Cadence of the counters line in the log.
const PROGRESS_LOG_INTERVAL: Duration = Duration::from_secs(60);

/// Run the importer. Blocks until shutdown; only ever returns an error
/// (a clean exit does not exist for a mirror that is supposed to run
/// forever).
pub async fn run(mut settings: Settings) -> Result<()> {
    settings.validate()?;
    let tables = settings.table_names()?;
    let views = settings.view_names();
    tracing::info!("tables: {}", tables.join(","));

    // Every row-group and file worker may hold a connection at once; a pool
    // smaller than that deadlocks under load, so warn and raise it.
    let needed = ((settings.row_workers + settings.file_workers) * tables.len()) as u32;
    if needed > settings.postgres_pool_size {
        tracing::warn!(
            "postgres_pool_size {} is too small for {} potential workers, raising it",
            settings.postgres_pool_size,
            needed
        );
        settings.postgres_pool_size = needed;
    } else {
        tracing::info!(
            "workers: db_available={} db_needed={} row={} file={}",
            settings.postgres_pool_size,
            needed,
            settings.row_workers,
            settings.file_workers
        );
    }

    let pool = db::connect(&settings).await?;

    tracing::info!("migrating...");
    db::migrate::run_migrations(&pool, &settings, &tables, &views).await?;

    let table_schemas = reflect_tables(&pool, &settings.postgres_schema, &tables).await?;

    let filters = match &settings.filter_file {
        Some(path) => FilterSet::load(path)?,
        None => FilterSet::empty(),
    };

    let store = if settings.local_input_only {
        tracing::info!("local_input_only set; object store disabled");
        None
    } else {
        Some(Arc::new(StoreClient::connect(&settings).await?))
    };

    let shutdown = Shutdown::new();
    let progress = ProgressSet::new(&shutdown);
    let tracking = Tracking::new(pool.clone(), &settings.postgres_schema);
    let settings = Arc::new(settings);

    // One synchronizer per table, each with dedicated worker pools.
    let mut workers: JoinSet<(String, Result<()>)> = JoinSet::new();
    for table in &tables {
        let schema = table_schemas
            .get(table)
            .cloned()
            .with_context(|| format!("missing reflected schema for {table}"))?;
        let predicate = filters.for_table(&settings.parquet_s3_schema, table);
        if predicate.is_some() {
            tracing::info!("{}: row filter active", table);
        }

        let import = ImportContext {
            pool: pool.clone(),
            tracking: tracking.clone(),
            table: schema,
            predicate,
            progress: progress.clone(),
            row_slots: Arc::new(Semaphore::new(settings.row_workers)),
            shutdown: shutdown.clone(),
            file_version: settings.npe_version.clone(),
            incremental_duration: settings.incremental_duration,
            backfill: false,
        };
        let ctx = SyncContext {
            settings: settings.clone(),
            store: store.clone(),
            import,
            file_slots: Arc::new(Semaphore::new(settings.file_workers)),
            download_slots: Arc::new(Semaphore::new(settings.download_workers)),
        };

        let name = table.clone();
        workers.spawn(async move {
            let result = run_table_sync(ctx).await;
            (name, result)
        });
    }

    let mut progress_timer = tokio::time::interval(PROGRESS_LOG_INTERVAL);
    progress_timer.tick().await; // consume first immediate tick

    let mut failure: Option<anyhow::Error> = None;
    let mut interrupted = false;

    loop {
        tokio::select! {
            biased;

            _ = shutdown_signal(), if !shutdown.is_shutting_down() => {
                tracing::info!("interrupt received, shutting down...");
                interrupted = true;
                shutdown.trigger();
            }

            joined = workers.join_next() => {
                match joined {
                    None => break, // every worker is gone
                    Some(Ok((table, Ok(())))) => {
                        // Synchronizers return cleanly only under shutdown.
                        if !shutdown.is_shutting_down() {
                            failure.get_or_insert_with(|| {
                                anyhow!("table {table} completed; this is unexpected")
                            });
                            shutdown.trigger();
                        }
                    }
                    Some(Ok((table, Err(e)))) => {
                        failure.get_or_insert_with(|| e.context(format!("table {table}")));
                        shutdown.trigger();
                    }
                    Some(Err(join_err)) => {
                        failure.get_or_insert_with(|| anyhow!("table worker panicked: {join_err}"));
                        shutdown.trigger();
                    }
                }
            }

            _ = progress_timer.tick() => {
                progress.log_snapshot();
            }
        }

        if shutdown.is_shutting_down() {
            drain_workers(&mut workers).await;
            break;
        }
    }

    progress.log_snapshot();
    tracing::info!("supervisor shutdown complete");

    if let Some(e) = failure {
        return Err(e);
    }
    if interrupted {
        bail!("interrupted");
    }
    bail!("all synchronizers exited; this is unexpected")
}

/// Give workers a bounded window to observe the signal and unwind; abort
/// whatever remains so the process can exit.
async fn drain_workers(workers: &mut JoinSet<(String, Result<()>)>) {
    let drained = tokio::time::timeout(DRAIN_TIMEOUT, async {
        while let Some(joined) = workers.join_next().await {
            if let Ok((table, Err(e))) = joined {
                if !is_shutdown_error(&e) {
                    tracing::warn!("table {} failed during drain: {:#}", table, e);
                }
            }
        }
    })
    .await;

    if drained.is_err() {
        tracing::error!(
            "workers still running after {:?}, force-exiting",
            DRAIN_TIMEOUT
        );
        workers.abort_all();
    }
}

/// Wait for SIGINT (Ctrl-C) or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let ctrl_c = tokio::signal::ctrl_c();
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = ctrl_c => {},
        _ = sigterm.recv() => {},
    }
}
