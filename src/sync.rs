//! Per-table synchronizer.
//!
//! Runs forever (barring shutdown): decide where to pick up from the
//! tracking store, load or resume the full baseline if needed, then walk the
//! incremental windows one `incremental_duration` at a time. Download-and-
//! import tasks run on a bounded per-table pool; their completions are
//! harvested strictly in submission order so `mark_completed` can never skip
//! an earlier unfinished file across a restart.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::Settings;
use crate::error_tracker::ConsecutiveTracker;
use crate::filename::{FileExt, ParquetFilename};
use crate::import::{import_parquet, ImportContext};
use crate::remote::client::StoreClient;
use crate::remote::download::download_object;
use crate::shutdown::{is_shutdown_error, Shutdown};

/// Everything one table's sync loop needs.
#[derive(Clone)]
pub struct SyncContext {
    pub settings: Arc<Settings>,
    /// Absent in local-input-only mode.
    pub store: Option<Arc<StoreClient>>,
    pub import: ImportContext,
    pub file_slots: Arc<Semaphore>,
    pub download_slots: Arc<Semaphore>,
}

impl SyncContext {
    fn table(&self) -> &str {
        &self.import.table.name
    }

    fn shutdown(&self) -> &Shutdown {
        &self.import.shutdown
    }

    fn duration(&self) -> u64 {
        self.settings.incremental_duration
    }
}

/// Entry point for one table. Converts the shutdown sentinel into a clean
/// return; any other error propagates to the supervisor, which brings the
/// process down.
pub async fn run_table_sync(ctx: SyncContext) -> Result<()> {
    match sync_loop(&ctx).await {
        Err(e) if is_shutdown_error(&e) => {
            tracing::debug!("{}: shutting down", ctx.table());
            Ok(())
        }
        Err(e) => {
            tracing::error!("{}: sync failed: {:#}", ctx.table(), e);
            Err(e)
        }
        Ok(()) => {
            // The incremental loop only exits via error or shutdown.
            bail!("{}: sync loop exited unexpectedly", ctx.table())
        }
    }
}

async fn sync_loop(ctx: &SyncContext) -> Result<()> {
    let cursor = resume(ctx).await?;
    run_incrementals(ctx, cursor).await
}

/// Decide where to start: resume a fresh-enough lineage from the tracking
/// store, otherwise (re)load the full baseline. Returns the first
/// incremental window start.
async fn resume(ctx: &SyncContext) -> Result<u64> {
    let s = &ctx.settings;
    let tracking = &ctx.import.tracking;
    let duration = ctx.duration();
    let retention_cutoff =
        (Utc::now().timestamp() as u64).saturating_sub(s.retention_days * 86_400);

    let full = tracking
        .latest_full(ctx.table(), &s.npe_version, duration as i64, false)
        .await?;

    match full {
        Some(full) if (full.end_timestamp as u64) > retention_cutoff => {
            if !full.completed {
                // A partial, unexpired full resumes at its recorded row
                // group rather than being re-downloaded.
                tracing::info!(
                    "{}: resuming partial full {} (last_row_group_imported={:?})",
                    ctx.table(),
                    full.file_name,
                    full.last_row_group_imported
                );
                return load_full(ctx, Some(full.file_name)).await;
            }

            let incremental = tracking
                .latest_completed_incremental(ctx.table(), &s.npe_version, duration as i64, false)
                .await?;
            match incremental {
                Some(name) => {
                    let parsed = ParquetFilename::parse(&name)?;
                    if parsed.end_timestamp > retention_cutoff {
                        tracing::info!(
                            "{}: resuming incrementals after {}",
                            ctx.table(),
                            name
                        );
                        return Ok(parsed.end_timestamp);
                    }
                    tracing::warn!(
                        "{}: newest incremental {} is beyond retention, starting over",
                        ctx.table(),
                        name
                    );
                }
                None => {
                    // Completed full, no incrementals yet: start right after it.
                    tracing::info!(
                        "{}: full {} complete, no incrementals yet",
                        ctx.table(),
                        full.file_name
                    );
                    return Ok(full.end_timestamp as u64);
                }
            }
        }
        Some(full) => {
            tracing::warn!(
                "{}: full {} is beyond retention, starting over",
                ctx.table(),
                full.file_name
            );
        }
        None => {
            tracing::debug!("{}: no full in the tracking table", ctx.table());
        }
    }

    if s.skip_full_import {
        let now = Utc::now().timestamp() as u64;
        let aligned_end = now / duration * duration;
        tracing::info!("{}: skip_full_import set, starting import from now", ctx.table());
        return Ok(aligned_end.saturating_sub(duration));
    }

    load_full(ctx, None).await
}

/// Download (or reuse) and import the full baseline. With `known` the file
/// is a resume target; otherwise the newest full in the store (or the local
/// directory in local-input-only mode) is chosen. Returns its end timestamp.
async fn load_full(ctx: &SyncContext, known: Option<String>) -> Result<u64> {
    let s = &ctx.settings;
    let target_dir = s.target_dir();

    let (file_name, remote) = match known {
        Some(name) => (name, None),
        None => discover_latest_full(ctx).await?,
    };
    let parsed = ParquetFilename::parse(&file_name)?;

    let local_path = target_dir.join(&file_name);
    let local_path = if tokio::fs::try_exists(&local_path).await.unwrap_or(false) {
        tracing::debug!("{} already exists locally, skipping download", file_name);
        local_path
    } else {
        let store = ctx.store.as_ref().with_context(|| {
            format!("{file_name} is not on disk and local_input_only is set")
        })?;
        let (key, size) = match remote {
            Some(pair) => pair,
            None => {
                let key = format!("{}full/{}", s.parquet_s3_prefix(), file_name);
                let size = match store.head(&key, ctx.shutdown()).await {
                    Ok(size) => size,
                    Err(e) => return Err(anyhow::Error::new(e).context("sizing full export")),
                };
                (key, size)
            }
        };

        tracing::info!("{}: downloading full baseline {}", ctx.table(), file_name);
        download_object(
            store,
            &key,
            size,
            &file_name,
            &s.incoming_dir(),
            &target_dir,
            s.download_workers,
            &ctx.download_slots,
            &ctx.import.progress,
            true,
            ctx.shutdown(),
        )
        .await
        .with_context(|| format!("downloading {file_name}"))?
    };

    import_parquet(&ctx.import, &local_path).await?;
    ctx.import
        .tracking
        .mark_completed(std::slice::from_ref(&file_name), ctx.shutdown())
        .await?;
    tracing::info!("{}: full import complete ({})", ctx.table(), file_name);

    Ok(parsed.end_timestamp)
}

/// Newest full export for this table: lexicographic max filename under the
/// `full/` prefix (or among local files when the store is disabled).
/// A missing full is fatal — unlike incrementals it is expected to exist.
async fn discover_latest_full(
    ctx: &SyncContext,
) -> Result<(String, Option<(String, u64)>)> {
    let s = &ctx.settings;
    let name_prefix = format!("{}-{}-0-", s.parquet_s3_schema, ctx.table());

    if let Some(store) = &ctx.store {
        let prefix = format!("{}full/{}", s.parquet_s3_prefix(), name_prefix);
        let objects = match store.list(&prefix, ctx.shutdown()).await {
            Ok(objects) => objects,
            Err(e) => return Err(anyhow::Error::new(e).context("listing full exports")),
        };

        let newest = objects
            .into_iter()
            .max_by(|a, b| object_file_name(&a.key).cmp(object_file_name(&b.key)))
            .with_context(|| {
                format!("no full export found for {} (prefix {})", ctx.table(), prefix)
            })?;

        let file_name = object_file_name(&newest.key).to_string();
        Ok((file_name, Some((newest.key, newest.size))))
    } else {
        let mut newest: Option<String> = None;
        let mut dir = tokio::fs::read_dir(s.target_dir())
            .await
            .with_context(|| format!("reading {}", s.target_dir().display()))?;
        while let Some(entry) = dir.next_entry().await? {
            let Some(name) = entry.file_name().to_str().map(str::to_string) else {
                continue;
            };
            if !name.starts_with(&name_prefix) {
                continue;
            }
            let Ok(parsed) = ParquetFilename::parse(&name) else {
                continue;
            };
            if !parsed.is_full() || parsed.ext != FileExt::Parquet {
                continue;
            }
            if newest.as_deref().map_or(true, |cur| name.as_str() > cur) {
                newest = Some(name);
            }
        }
        let file_name = newest.with_context(|| {
            format!("no local full export for {} in {}", ctx.table(), s.target_dir().display())
        })?;
        Ok((file_name, None))
    }
}

fn object_file_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// The infinite incremental loop. `next_start` is the cursor; each window is
/// handed to a download-and-import task on the file pool, and completions
/// are marked in submission order.
async fn run_incrementals(ctx: &SyncContext, mut next_start: u64) -> Result<()> {
    let duration = ctx.duration();
    let max_wait = Duration::from_secs((4 * duration).max(90));
    let overdue = ConsecutiveTracker::new();

    let mut inflight: VecDeque<(u64, JoinHandle<Result<String>>)> = VecDeque::new();
    let mut completed: Vec<String> = Vec::new();

    tracing::info!(
        "{}: running incrementals from window start {}",
        ctx.table(),
        next_start
    );

    let result = loop {
        // 1. Harvest finished tasks in submission order only — an unfinished
        //    front blocks later completions from being marked.
        while inflight.front().map_or(false, |(_, h)| h.is_finished()) {
            let (window, handle) = inflight.pop_front().unwrap();
            match handle.await {
                Ok(Ok(file_name)) => completed.push(file_name),
                Ok(Err(e)) => {
                    break_with_abort(&mut inflight);
                    return flush_completed(ctx, completed, Err(e.context(format!(
                        "incremental window {window} failed"
                    ))))
                    .await;
                }
                Err(join_err) => {
                    break_with_abort(&mut inflight);
                    return flush_completed(
                        ctx,
                        completed,
                        Err(anyhow::anyhow!("incremental task panicked: {join_err}")),
                    )
                    .await;
                }
            }
        }

        if !completed.is_empty() {
            ctx.import
                .tracking
                .mark_completed(&completed, ctx.shutdown())
                .await?;
            completed.clear();
        }

        // 2. Sleep until the next window's file is expected (publication lags
        //    the window end by a beat); cap at 1 s while work is in flight so
        //    completions keep draining.
        let now = Utc::now().timestamp();
        let expected_at = (next_start + duration + 1) as i64;
        let mut sleep_secs = (expected_at - now).max(0) as u64;
        if !inflight.is_empty() {
            sleep_secs = sleep_secs.min(1);
        }
        if sleep_secs > 0 {
            if let Err(e) = ctx.shutdown().sleep(Duration::from_secs(sleep_secs)).await {
                break Err(anyhow::Error::new(e));
            }
        }

        // Don't run ahead while the front task is still working on an older
        // window that has not come due yet.
        let now = Utc::now().timestamp() as u64;
        if inflight
            .front()
            .map_or(false, |(_, h)| !h.is_finished())
            && now < next_start
        {
            continue;
        }

        // 3. Submit the next window.
        let task_ctx = ctx.clone();
        let window_start = next_start;
        let tracker = overdue.clone();
        let handle = tokio::spawn(async move {
            incremental_task(task_ctx, window_start, tracker, max_wait).await
        });
        inflight.push_back((window_start, handle));

        // 4. Advance the cursor.
        next_start += duration;
    };

    break_with_abort(&mut inflight);
    flush_completed(ctx, completed, result).await
}

fn break_with_abort(inflight: &mut VecDeque<(u64, JoinHandle<Result<String>>)>) {
    for (_, handle) in inflight.iter() {
        handle.abort();
    }
    inflight.clear();
}

/// Final `mark_completed` so no harvested progress is lost on the way out —
/// even when the process-wide token has already fired.
async fn flush_completed(
    ctx: &SyncContext,
    completed: Vec<String>,
    result: Result<()>,
) -> Result<()> {
    if !completed.is_empty() {
        tracing::info!(
            "{}: final mark_completed for {} file(s)",
            ctx.table(),
            completed.len()
        );
        let fresh = Shutdown::new();
        if let Err(e) = ctx.import.tracking.mark_completed(&completed, &fresh).await {
            tracing::warn!("{}: final mark_completed failed: {:#}", ctx.table(), e);
        }
    }
    result
}

/// One download-and-import task: poll for the window's file, synthesize the
/// `.empty` marker for known-empty windows, download and import otherwise.
/// Returns the file name for `mark_completed`.
async fn incremental_task(
    ctx: SyncContext,
    start_ts: u64,
    overdue: ConsecutiveTracker,
    max_wait: Duration,
) -> Result<String> {
    let _permit = ctx
        .file_slots
        .clone()
        .acquire_owned()
        .await
        .context("file worker pool closed")?;

    let s = &ctx.settings;
    let duration = ctx.duration();
    let end_ts = start_ts + duration;
    let parquet_name = ParquetFilename::format(
        &s.parquet_s3_schema,
        ctx.table(),
        start_ts,
        end_ts,
        FileExt::Parquet,
    );
    let empty_name = ParquetFilename::format(
        &s.parquet_s3_schema,
        ctx.table(),
        start_ts,
        end_ts,
        FileExt::Empty,
    );
    let target_dir = s.target_dir();
    let deadline = Instant::now() + max_wait;

    loop {
        ctx.shutdown().check()?;

        // The final name on disk is the sole "downloaded" signal.
        for name in [&parquet_name, &empty_name] {
            let local = target_dir.join(name);
            if tokio::fs::try_exists(&local).await.unwrap_or(false) {
                return import_window(&ctx, &local, name, &overdue).await;
            }
        }

        if let Some(store) = &ctx.store {
            let prefix = format!(
                "{}incremental/{}-{}-{}-{}.",
                s.parquet_s3_prefix(),
                s.parquet_s3_schema,
                ctx.table(),
                start_ts,
                end_ts
            );
            let objects = match store.list(&prefix, ctx.shutdown()).await {
                Ok(objects) => objects,
                Err(e) => return Err(anyhow::Error::new(e).context("probing incremental window")),
            };

            match objects.len() {
                0 => {} // not yet published
                1 => {
                    let object = &objects[0];
                    let file_name = object_file_name(&object.key).to_string();
                    if object.size == 0 || file_name.ends_with(".empty") {
                        // Known-empty window: synthesize the marker locally
                        // instead of downloading nothing.
                        tokio::fs::create_dir_all(&target_dir)
                            .await
                            .with_context(|| format!("creating {}", target_dir.display()))?;
                        let local = target_dir.join(&empty_name);
                        tokio::fs::File::create(&local)
                            .await
                            .with_context(|| format!("creating {}", local.display()))?;
                        return import_window(&ctx, &local, &empty_name, &overdue).await;
                    }

                    let local = download_object(
                        store,
                        &object.key,
                        object.size,
                        &file_name,
                        &s.incoming_dir(),
                        &target_dir,
                        s.download_workers,
                        &ctx.download_slots,
                        &ctx.import.progress,
                        false,
                        ctx.shutdown(),
                    )
                    .await
                    .with_context(|| format!("downloading {file_name}"))?;
                    return import_window(&ctx, &local, &file_name, &overdue).await;
                }
                n => bail!("{n} objects match incremental prefix {prefix}"),
            }
        }

        // Not published yet: wait. Publication lags the window end by a
        // beat, so "overdue" starts one duration past the window start.
        let now = Utc::now().timestamp();
        let expected_in = (start_ts + duration + 1) as i64 - now;
        let is_overdue = expected_in <= 0;

        let sleep_secs = if is_overdue {
            (duration / 10).max(1)
        } else {
            let base = (duration / 2).clamp(1, 30);
            base.min(expected_in as u64)
        };

        if is_overdue {
            let past_deadline = Instant::now() >= deadline;
            if past_deadline && s.exit_after_max_wait {
                bail!(
                    "{}: max wait exceeded, no file imported for window [{start_ts}, {end_ts}) within {:?}",
                    ctx.table(),
                    max_wait
                );
            }
            if overdue.record() {
                if past_deadline {
                    tracing::warn!(
                        "{}: max wait ({:?}) exceeded for window [{start_ts}, {end_ts}), still polling",
                        ctx.table(),
                        max_wait
                    );
                } else {
                    tracing::warn!(
                        "{}: window [{start_ts}, {end_ts}) is overdue by {}s (poll #{})",
                        ctx.table(),
                        -expected_in,
                        overdue.count()
                    );
                }
            }
        } else {
            tracing::debug!(
                "{}: window [{start_ts}, {end_ts}) expected in {}s",
                ctx.table(),
                expected_in
            );
        }

        ctx.shutdown()
            .sleep(Duration::from_secs(sleep_secs))
            .await?;
    }
}

async fn import_window(
    ctx: &SyncContext,
    local: &Path,
    file_name: &str,
    overdue: &ConsecutiveTracker,
) -> Result<String> {
    import_parquet(&ctx.import, local).await?;
    if let Some(run) = overdue.reset() {
        tracing::info!(
            "{}: imports resumed after {} overdue poll(s)",
            ctx.table(),
            run
        );
    }
    Ok(file_name.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_object_file_name() {
        assert_eq!(
            object_file_name("db/schema/v2/full/farcaster-casts-0-100.parquet"),
            "farcaster-casts-0-100.parquet"
        );
        assert_eq!(object_file_name("bare-name.parquet"), "bare-name.parquet");
    }

    #[test]
    fn test_window_names() {
        let parquet =
            ParquetFilename::format("farcaster", "casts", 1000, 1300, FileExt::Parquet);
        let empty = ParquetFilename::format("farcaster", "casts", 1000, 1300, FileExt::Empty);
        assert_eq!(parquet, "farcaster-casts-1000-1300.parquet");
        assert_eq!(empty, "farcaster-casts-1000-1300.empty");
    }
}
