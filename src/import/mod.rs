//! Row-group importer.
//!
//! A parquet file is imported one row group at a time: groups are the unit
//! of progress, recorded durably in the tracking store so a crash resumes at
//! `last_row_group_imported + 1` instead of starting over. Groups are
//! processed by a bounded worker pool but their tracking advances strictly
//! in submit order — a later group never advances past an unfinished earlier
//! one, which is what makes the resume point trustworthy.

pub mod rows;

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use sqlx::postgres::PgArguments;
use sqlx::query::Query;
use sqlx::{PgPool, Postgres};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use crate::db::schema::{ColumnInfo, TableSchema};
use crate::db::tracking::{FileMeta, Tracking};
use crate::db::with_retry;
use crate::filename::{FileExt, ParquetFilename};
use crate::filters::Predicate;
use crate::import::rows::{clean_json_columns, dedupe_last_by_pk, materialize_batch, Row, Value};
use crate::progress::ProgressSet;
use crate::shutdown::{Shutdown, ShuttingDown};

/// Stay below Postgres's 65535 bind-parameter cap per statement.
const MAX_BIND_PARAMS: usize = 60_000;

/// Everything an import needs; cheap to clone into row-group workers.
#[derive(Clone)]
pub struct ImportContext {
    pub pool: PgPool,
    pub tracking: Tracking,
    pub table: Arc<TableSchema>,
    pub predicate: Option<Arc<Predicate>>,
    pub progress: Arc<ProgressSet>,
    pub row_slots: Arc<Semaphore>,
    pub shutdown: Shutdown,
    pub file_version: String,
    pub incremental_duration: u64,
    pub backfill: bool,
}

struct RowGroupReport {
    index: i64,
    kept: usize,
    filtered: usize,
    last_updated_at: Option<DateTime<Utc>>,
}

/// Import one local parquet (or `.empty`) file into its target table,
/// advancing the tracking row as groups land. Completion flags are the
/// caller's job — they are batched per table in submit order.
pub async fn import_parquet(ctx: &ImportContext, local_path: &Path) -> Result<()> {
    let file_name = local_path
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("bad local path {}", local_path.display()))?
        .to_string();
    let parsed = ParquetFilename::parse(&file_name)?;
    let is_full = parsed.is_full();

    if parsed.ext == FileExt::Empty {
        let meta = file_meta(ctx, &parsed, &file_name, true, 0);
        ctx.tracking.upsert_start(&meta, &ctx.shutdown).await?;
        ctx.progress.empty_steps.grow_total(1);
        ctx.progress.empty_steps.advance(1)?;
        tracing::info!("skipping import of empty window {}", file_name);
        return Ok(());
    }

    let total_row_groups = {
        let path = local_path.to_path_buf();
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let file = std::fs::File::open(&path)
                .with_context(|| format!("opening {}", path.display()))?;
            let builder = ParquetRecordBatchReaderBuilder::try_new(file)
                .with_context(|| format!("reading parquet footer of {}", path.display()))?;
            Ok(builder.metadata().num_row_groups())
        })
        .await
        .context("footer reader task failed")??
    };

    let meta = file_meta(ctx, &parsed, &file_name, false, total_row_groups as i64);
    let start = ctx.tracking.upsert_start(&meta, &ctx.shutdown).await?;

    if total_row_groups == 0 {
        tracing::info!("{} has no row groups", file_name);
        return Ok(());
    }
    if start.last_row_group_imported == Some(total_row_groups as i64 - 1) {
        tracing::info!("{} has already been imported", file_name);
        return Ok(());
    }

    let start_rg = start
        .last_row_group_imported
        .map(|last| last + 1)
        .unwrap_or(0) as usize;
    if start.last_row_group_imported.is_some() {
        tracing::info!(
            "{} resuming at row group {}/{}",
            file_name,
            start_rg,
            total_row_groups
        );
    }

    let steps = ctx.progress.steps_for(is_full);
    steps.grow_total((total_row_groups - start_rg) as u64);

    // Submit every remaining group; the row worker pool bounds execution.
    let mut handles: VecDeque<(usize, JoinHandle<Result<RowGroupReport>>)> =
        VecDeque::with_capacity(total_row_groups - start_rg);
    for index in start_rg..total_row_groups {
        let ctx = ctx.clone();
        let path = local_path.to_path_buf();
        let window_end = parsed.end_timestamp;
        let handle =
            tokio::spawn(async move { process_row_group(ctx, path, index, window_end).await });
        handles.push_back((index, handle));
    }

    // Drain in submit order. Already-finished successors collapse into one
    // advance call; an unfinished future blocks the drain until it completes
    // or the shutdown signal fires.
    let mut done_through: i64 = start_rg as i64 - 1;
    while let Some((index, mut handle)) = handles.pop_front() {
        let report = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => {
                handle.abort();
                abort_all(&mut handles);
                return Err(ShuttingDown.into());
            }
            joined = &mut handle => harvest(index, joined, &mut handles)?,
        };

        let mut high = report;
        while handles.front().map_or(false, |(_, h)| h.is_finished()) {
            let (next_index, next) = handles.pop_front().unwrap();
            high = harvest(next_index, next.await, &mut handles)?;
        }

        ctx.tracking.advance(start.id, high.index, &ctx.shutdown).await?;
        steps.advance((high.index - done_through) as u64)?;
        done_through = high.index;

        tracing::debug!(
            "{}: advanced through row group {}/{} ({} rows, {} filtered, last_updated_at={:?})",
            file_name,
            high.index + 1,
            total_row_groups,
            high.kept,
            high.filtered,
            high.last_updated_at
        );
    }

    Ok(())
}

fn abort_all(handles: &mut VecDeque<(usize, JoinHandle<Result<RowGroupReport>>)>) {
    for (_, handle) in handles.iter() {
        handle.abort();
    }
    handles.clear();
}

fn harvest(
    index: usize,
    joined: std::result::Result<Result<RowGroupReport>, tokio::task::JoinError>,
    handles: &mut VecDeque<(usize, JoinHandle<Result<RowGroupReport>>)>,
) -> Result<RowGroupReport> {
    match joined {
        Ok(Ok(report)) => Ok(report),
        Ok(Err(e)) => {
            abort_all(handles);
            Err(e.context(format!("row group {index} failed")))
        }
        Err(join_err) => {
            abort_all(handles);
            bail!("row group {index} worker panicked: {join_err}")
        }
    }
}

fn file_meta<'a>(
    ctx: &'a ImportContext,
    parsed: &'a ParquetFilename,
    file_name: &'a str,
    is_empty: bool,
    total_row_groups: i64,
) -> FileMeta<'a> {
    FileMeta {
        table_name: &ctx.table.name,
        file_name,
        file_type: parsed.file_type(),
        file_version: &ctx.file_version,
        file_duration_s: ctx.incremental_duration as i64,
        end_timestamp: parsed.end_timestamp as i64,
        is_empty,
        total_row_groups,
        backfill: ctx.backfill,
    }
}

/// Read row group `index` into plain rows. Synchronous; runs on the blocking
/// pool.
fn read_row_group(path: &Path, index: usize) -> Result<Vec<Row>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let reader = ParquetRecordBatchReaderBuilder::try_new(file)
        .with_context(|| format!("reading parquet footer of {}", path.display()))?
        .with_row_groups(vec![index])
        .build()
        .with_context(|| format!("opening row group {} of {}", index, path.display()))?;

    let mut out = Vec::new();
    for batch in reader {
        let batch =
            batch.with_context(|| format!("decoding row group {} of {}", index, path.display()))?;
        out.extend(materialize_batch(&batch)?);
    }
    Ok(out)
}

async fn process_row_group(
    ctx: ImportContext,
    path: PathBuf,
    index: usize,
    window_end: u64,
) -> Result<RowGroupReport> {
    let _permit = ctx
        .row_slots
        .clone()
        .acquire_owned()
        .await
        .context("row worker pool closed")?;
    ctx.shutdown.check()?;

    let rows = {
        let path = path.clone();
        tokio::task::spawn_blocking(move || read_row_group(&path, index))
            .await
            .context("row group reader task failed")??
    };
    let read_count = rows.len();

    // Within one statement a primary key may appear only once; last row wins.
    let (rows, duplicates) = dedupe_last_by_pk(rows, &ctx.table.primary_key);
    if duplicates > 0 {
        tracing::debug!(
            "{}: dropped {} duplicate-key row(s) in group {}",
            ctx.table.name,
            duplicates,
            index
        );
    }

    let before = rows.len();
    let mut rows: Vec<Row> = match &ctx.predicate {
        Some(predicate) => rows.into_iter().filter(|r| predicate.matches(r)).collect(),
        None => rows,
    };
    let filtered = before - rows.len();

    clean_json_columns(&mut rows)?;

    let kept = rows.len();
    let last_updated_at = rows
        .last()
        .and_then(|row| row.get("updated_at"))
        .and_then(Value::as_timestamp);

    if kept > 0 {
        upsert_rows(&ctx, &rows).await?;
    }

    let now = Utc::now().timestamp();
    let file_age_s = now - window_end as i64;
    let row_age_s = last_updated_at.map(|ts| now - ts.timestamp());
    tracing::debug!(
        "{} group {}: read={} kept={} filtered={} file_age={}s row_age={:?}",
        ctx.table.name,
        index,
        read_count,
        kept,
        filtered,
        file_age_s,
        row_age_s
    );

    Ok(RowGroupReport {
        index: index as i64,
        kept,
        filtered,
        last_updated_at,
    })
}

/// Build the gated merge: insert, and on primary-key conflict replace all
/// non-key columns only when the incoming `updated_at` is strictly newer.
/// This is the sole ordering guarantee across overlapping windows and
/// retries, so older edits can never clobber newer ones.
fn build_upsert_sql(table: &TableSchema, columns: &[&ColumnInfo], n_rows: usize) -> String {
    let column_list = columns
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");

    let mut values = String::new();
    let mut param = 1usize;
    for row in 0..n_rows {
        if row > 0 {
            values.push_str(", ");
        }
        values.push('(');
        for (ci, col) in columns.iter().enumerate() {
            if ci > 0 {
                values.push_str(", ");
            }
            values.push_str(&format!("${}{}", param, col.cast_suffix()));
            param += 1;
        }
        values.push(')');
    }

    let conflict_target = table
        .primary_key
        .iter()
        .map(|pk| format!("\"{pk}\""))
        .collect::<Vec<_>>()
        .join(", ");

    let updates = columns
        .iter()
        .filter(|c| !table.is_primary_key(&c.name))
        .map(|c| format!("\"{0}\" = EXCLUDED.\"{0}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");

    if updates.is_empty() {
        format!(
            "INSERT INTO {} AS t ({}) VALUES {} ON CONFLICT ({}) DO NOTHING",
            table.qualified(),
            column_list,
            values,
            conflict_target
        )
    } else {
        format!(
            "INSERT INTO {} AS t ({}) VALUES {} ON CONFLICT ({}) DO UPDATE SET {} \
             WHERE EXCLUDED.\"updated_at\" > t.\"updated_at\"",
            table.qualified(),
            column_list,
            values,
            conflict_target,
            updates
        )
    }
}

fn bind_value<'q>(
    q: Query<'q, Postgres, PgArguments>,
    value: &'q Value,
) -> Query<'q, Postgres, PgArguments> {
    match value {
        Value::Null => q.bind(None::<String>),
        Value::Bool(b) => q.bind(*b),
        Value::Int(i) => q.bind(*i),
        Value::Float(f) => q.bind(*f),
        Value::Text(s) => q.bind(s.as_str()),
        Value::Bytes(b) => q.bind(b.as_slice()),
        Value::Timestamp(ts) => q.bind(*ts),
        // json binds as its serialized text; the placeholder cast restores it
        Value::Json(j) => q.bind(j.to_string()),
    }
}

/// One idempotent merge over the kept rows, chunked to stay under the bind
/// parameter cap.
async fn upsert_rows(ctx: &ImportContext, rows: &[Row]) -> Result<()> {
    let table = &ctx.table;

    // Insert in reflected-column order, restricted to columns the file carries.
    let columns: Vec<&ColumnInfo> = table
        .columns
        .iter()
        .filter(|c| rows[0].contains_key(&c.name))
        .collect();

    for pk in &table.primary_key {
        if !rows[0].contains_key(pk) {
            bail!("{} rows are missing primary key column {}", table.name, pk);
        }
    }
    if !rows[0].contains_key("updated_at") {
        bail!("{} rows are missing updated_at; merge gating needs it", table.name);
    }

    let null = Value::Null;
    let rows_per_stmt = (MAX_BIND_PARAMS / columns.len().max(1)).max(1);
    for chunk in rows.chunks(rows_per_stmt) {
        let sql = build_upsert_sql(table, &columns, chunk.len());
        with_retry("row-group upsert", &ctx.shutdown, || {
            let mut q = sqlx::query(&sql);
            for row in chunk {
                for col in &columns {
                    q = bind_value(q, row.get(&col.name).unwrap_or(&null));
                }
            }
            q.execute(&ctx.pool)
        })
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str, data_type: &str, udt: &str) -> ColumnInfo {
        ColumnInfo {
            name: name.to_string(),
            data_type: data_type.to_string(),
            udt_name: udt.to_string(),
        }
    }

    fn casts_table() -> TableSchema {
        TableSchema {
            pg_schema: "public".to_string(),
            name: "casts".to_string(),
            columns: vec![
                col("id", "bigint", "int8"),
                col("text", "text", "text"),
                col("embeds", "jsonb", "jsonb"),
                col("updated_at", "timestamp without time zone", "timestamp"),
            ],
            primary_key: vec!["id".to_string()],
        }
    }

    #[test]
    fn test_upsert_sql_gates_on_updated_at() {
        let table = casts_table();
        let columns: Vec<&ColumnInfo> = table.columns.iter().collect();
        let sql = build_upsert_sql(&table, &columns, 2);

        assert!(sql.starts_with("INSERT INTO \"public\".\"casts\" AS t"));
        assert!(sql.contains("ON CONFLICT (\"id\") DO UPDATE SET"));
        assert!(sql.contains("WHERE EXCLUDED.\"updated_at\" > t.\"updated_at\""));
        // pk never appears in the SET list
        assert!(!sql.contains("\"id\" = EXCLUDED"));
        // both rows present, casts applied
        assert!(sql.contains("$1::bigint"));
        assert!(sql.contains("$5::bigint"));
        assert!(sql.contains("$3::jsonb"));
        assert!(sql.contains("$8::timestamp without time zone"));
    }

    #[test]
    fn test_upsert_sql_all_key_columns_does_nothing() {
        let table = TableSchema {
            pg_schema: "public".to_string(),
            name: "edges".to_string(),
            columns: vec![col("a", "bigint", "int8"), col("b", "bigint", "int8")],
            primary_key: vec!["a".to_string(), "b".to_string()],
        };
        let columns: Vec<&ColumnInfo> = table.columns.iter().collect();
        let sql = build_upsert_sql(&table, &columns, 1);
        assert!(sql.ends_with("ON CONFLICT (\"a\", \"b\") DO NOTHING"));
    }

    #[test]
    fn test_upsert_sql_parameter_numbering_is_dense() {
        let table = casts_table();
        let columns: Vec<&ColumnInfo> = table.columns.iter().collect();
        let sql = build_upsert_sql(&table, &columns, 3);
        // 3 rows × 4 columns = params $1..$12, no more
        assert!(sql.contains("$12::timestamp without time zone"));
        assert!(!sql.contains("$13"));
    }
}
