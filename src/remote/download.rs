//! Resumable chunked downloader.
//!
//! One object is split into up to `max_chunks` byte ranges (≥ 8 MiB each) and
//! fetched by parallel workers into `<incoming>/<name>.N` files. A chunk file
//! that already exists is resumed by appending only its missing suffix, so a
//! restart transfers exactly the bytes it still needs. When every chunk is
//! complete the pieces are concatenated and atomically renamed into the
//! target directory; the final name on disk is the sole "downloaded" signal.
//!
//! On any worker failure the peers are cancelled and partial chunk files are
//! kept for the next invocation.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::progress::{Counter, ProgressSet};
use crate::remote::client::{StoreClient, StoreError};
use crate::shutdown::{Shutdown, ShuttingDown};

/// Chunks are never smaller than this.
pub const MIN_CHUNK_SIZE: u64 = 8 * 1024 * 1024;

/// Attempts per chunk before its error propagates.
const MAX_CHUNK_ATTEMPTS: u32 = 5;

#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    #[error("chunk {path} is {actual} bytes, longer than its {expected}-byte target")]
    CorruptChunk {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("downloaded {path} is {actual} bytes, expected {expected}")]
    SizeMismatch {
        path: PathBuf,
        expected: u64,
        actual: u64,
    },
    #[error("shutting down")]
    Shutdown(#[from] ShuttingDown),
    #[error(transparent)]
    Store(StoreError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl From<StoreError> for DownloadError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::Shutdown(s) => DownloadError::Shutdown(s),
            other => DownloadError::Store(other),
        }
    }
}

/// Split `[0, size)` into `min(max_chunks, ceil(size / MIN_CHUNK_SIZE))`
/// equal-ish ranges. A zero-byte object still yields one empty range.
fn plan_chunks(size: u64, max_chunks: usize) -> Vec<(u64, u64)> {
    let by_size = size.div_ceil(MIN_CHUNK_SIZE).max(1);
    let k = by_size.min(max_chunks.max(1) as u64);
    let chunk_len = size.div_ceil(k);

    (0..k)
        .map(|i| {
            let lo = i * chunk_len;
            let hi = ((i + 1) * chunk_len).min(size);
            (lo, hi)
        })
        .collect()
}

/// Where chunk `i` of `k` lives while in flight. A single-chunk download
/// writes straight to the assembled name.
fn chunk_path(incoming_dir: &Path, file_name: &str, i: usize, k: usize) -> PathBuf {
    if k == 1 {
        incoming_dir.join(file_name)
    } else {
        incoming_dir.join(format!("{file_name}.{i}"))
    }
}

/// Fetch one range into `path`, resuming whatever prefix is already there.
async fn fetch_chunk(
    store: Arc<StoreClient>,
    key: String,
    range: (u64, u64),
    path: PathBuf,
    progress: Arc<ProgressSet>,
    is_full: bool,
    shutdown: Shutdown,
) -> Result<(), DownloadError> {
    let (lo, hi) = range;
    let target_len = hi - lo;
    let bytes: &Counter = progress.bytes_for(is_full);

    let mut attempt = 0u32;
    loop {
        shutdown.check()?;

        let existing = match fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };

        if existing > target_len {
            return Err(DownloadError::CorruptChunk {
                path,
                expected: target_len,
                actual: existing,
            });
        }
        if existing == target_len {
            if existing == 0 {
                // Zero-byte range: materialise the (empty) chunk file.
                File::create(&path)
                    .await
                    .with_context(|| format!("creating {}", path.display()))?;
            }
            return Ok(());
        }

        match append_range(&store, &key, lo + existing, hi, &path, bytes, &shutdown).await {
            Ok(()) => {
                // Loop once more to re-stat and confirm the chunk is whole.
                continue;
            }
            Err(e @ DownloadError::Shutdown(_)) => return Err(e),
            Err(e @ DownloadError::Store(StoreError::NotFound(_))) => return Err(e),
            Err(e) => {
                attempt += 1;
                if attempt >= MAX_CHUNK_ATTEMPTS {
                    return Err(e);
                }
                tracing::warn!(
                    "chunk {} attempt {}/{} failed, resuming: {}",
                    path.display(),
                    attempt,
                    MAX_CHUNK_ATTEMPTS,
                    e
                );
            }
        }
    }
}

/// One streaming append of `[start, hi)` onto the end of `path`. Every body
/// chunk reports its byte count to the sink as it lands.
async fn append_range(
    store: &StoreClient,
    key: &str,
    start: u64,
    hi: u64,
    path: &Path,
    bytes: &Counter,
    shutdown: &Shutdown,
) -> Result<(), DownloadError> {
    let mut stream = store.get_range(key, start, hi, shutdown).await?;

    let mut file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .with_context(|| format!("opening chunk {}", path.display()))?;

    while let Some(chunk) = stream
        .body
        .try_next()
        .await
        .with_context(|| format!("reading body for {}", key))?
    {
        file.write_all(&chunk)
            .await
            .with_context(|| format!("writing chunk {}", path.display()))?;
        bytes.advance(chunk.len() as u64)?;
    }

    file.flush()
        .await
        .with_context(|| format!("flushing chunk {}", path.display()))?;
    Ok(())
}

/// Concatenate chunk files (in index order) into `<incoming>/<name>`.
async fn assemble(
    incoming_dir: &Path,
    file_name: &str,
    k: usize,
) -> Result<PathBuf, DownloadError> {
    let assembled = incoming_dir.join(file_name);
    if k == 1 {
        // Single chunk already carries the final name.
        return Ok(assembled);
    }

    let mut out = File::create(&assembled)
        .await
        .with_context(|| format!("creating {}", assembled.display()))?;

    for i in 0..k {
        let part = chunk_path(incoming_dir, file_name, i, k);
        let mut src = File::open(&part)
            .await
            .with_context(|| format!("opening chunk {}", part.display()))?;
        tokio::io::copy(&mut src, &mut out)
            .await
            .with_context(|| format!("appending chunk {}", part.display()))?;
    }

    out.flush()
        .await
        .with_context(|| format!("flushing {}", assembled.display()))?;
    Ok(assembled)
}

/// Download `key` (of known `expected_size`) into `<target_dir>/<file_name>`,
/// resuming any partial chunks left by a previous run. Returns the final
/// local path.
#[allow(clippy::too_many_arguments)]
pub async fn download_object(
    store: &Arc<StoreClient>,
    key: &str,
    expected_size: u64,
    file_name: &str,
    incoming_dir: &Path,
    target_dir: &Path,
    max_chunks: usize,
    slots: &Arc<Semaphore>,
    progress: &Arc<ProgressSet>,
    is_full: bool,
    shutdown: &Shutdown,
) -> Result<PathBuf, DownloadError> {
    let final_path = target_dir.join(file_name);
    if fs::try_exists(&final_path).await.unwrap_or(false) {
        tracing::debug!("{} already downloaded", final_path.display());
        return Ok(final_path);
    }

    fs::create_dir_all(incoming_dir)
        .await
        .with_context(|| format!("creating {}", incoming_dir.display()))?;
    fs::create_dir_all(target_dir)
        .await
        .with_context(|| format!("creating {}", target_dir.display()))?;

    let ranges = plan_chunks(expected_size, max_chunks);
    let k = ranges.len();

    // The sink only learns about bytes we still have to move; resumed bytes
    // were debited by the run that fetched them.
    let mut missing_total = 0u64;
    for (i, (lo, hi)) in ranges.iter().enumerate() {
        let existing = match fs::metadata(chunk_path(incoming_dir, file_name, i, k)).await {
            Ok(meta) => meta.len(),
            Err(_) => 0,
        };
        missing_total += (hi - lo).saturating_sub(existing);
    }
    progress.bytes_for(is_full).grow_total(missing_total);

    let mut workers: JoinSet<Result<(), DownloadError>> = JoinSet::new();
    for (i, range) in ranges.iter().enumerate() {
        let store = store.clone();
        let key = key.to_string();
        let range = *range;
        let path = chunk_path(incoming_dir, file_name, i, k);
        let slots = slots.clone();
        let progress = progress.clone();
        let shutdown = shutdown.clone();

        workers.spawn(async move {
            let _permit = slots
                .acquire_owned()
                .await
                .context("download worker pool closed")?;
            fetch_chunk(store, key, range, path, progress, is_full, shutdown).await
        });
    }

    // First failure cancels the peers; their partial files stay for resume.
    let mut failure: Option<DownloadError> = None;
    while let Some(joined) = workers.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if failure.is_none() {
                    failure = Some(e);
                    workers.abort_all();
                }
            }
            Err(join_err) if join_err.is_cancelled() => {}
            Err(join_err) => {
                if failure.is_none() {
                    failure = Some(DownloadError::Other(anyhow::anyhow!(
                        "chunk worker panicked: {join_err}"
                    )));
                    workers.abort_all();
                }
            }
        }
    }
    if let Some(e) = failure {
        return Err(e);
    }

    let assembled = assemble(incoming_dir, file_name, k).await?;

    fs::rename(&assembled, &final_path)
        .await
        .with_context(|| {
            format!(
                "renaming {} to {}",
                assembled.display(),
                final_path.display()
            )
        })?;

    if k > 1 {
        for i in 0..k {
            let part = chunk_path(incoming_dir, file_name, i, k);
            if let Err(e) = fs::remove_file(&part).await {
                tracing::warn!("could not remove chunk {}: {}", part.display(), e);
            }
        }
    }

    let actual = fs::metadata(&final_path)
        .await
        .with_context(|| format!("stat {}", final_path.display()))?
        .len();
    if actual != expected_size {
        return Err(DownloadError::SizeMismatch {
            path: final_path,
            expected: expected_size,
            actual,
        });
    }

    tracing::info!(
        "downloaded {} ({} bytes, {} chunk{})",
        final_path.display(),
        expected_size,
        k,
        if k == 1 { "" } else { "s" }
    );
    Ok(final_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_small_file_is_one_chunk() {
        assert_eq!(plan_chunks(5 * MIB, 32), vec![(0, 5 * MIB)]);
    }

    #[test]
    fn test_plan_zero_size() {
        assert_eq!(plan_chunks(0, 32), vec![(0, 0)]);
    }

    #[test]
    fn test_plan_splits_on_min_chunk_size() {
        // 24 MiB → 3 chunks of 8 MiB
        let ranges = plan_chunks(24 * MIB, 32);
        assert_eq!(ranges.len(), 3);
        assert_eq!(ranges[0], (0, 8 * MIB));
        assert_eq!(ranges[2], (16 * MIB, 24 * MIB));
    }

    #[test]
    fn test_plan_caps_at_max_chunks() {
        let size = 1024 * MIB;
        let ranges = plan_chunks(size, 4);
        assert_eq!(ranges.len(), 4);
        assert_eq!(ranges.last().unwrap().1, size);
    }

    #[test]
    fn test_plan_covers_whole_range_contiguously() {
        for size in [1, MIB, 17 * MIB + 3, 100 * MIB] {
            let ranges = plan_chunks(size, 7);
            assert_eq!(ranges[0].0, 0);
            assert_eq!(ranges.last().unwrap().1, size);
            for pair in ranges.windows(2) {
                assert_eq!(pair[0].1, pair[1].0, "gap at {pair:?}");
            }
        }
    }

    #[test]
    fn test_chunk_path_naming() {
        let dir = Path::new("/in");
        assert_eq!(
            chunk_path(dir, "a.parquet", 0, 1),
            PathBuf::from("/in/a.parquet")
        );
        assert_eq!(
            chunk_path(dir, "a.parquet", 2, 3),
            PathBuf::from("/in/a.parquet.2")
        );
    }

    #[tokio::test]
    async fn test_assemble_concatenates_in_order() {
        let dir = tempfile::tempdir().unwrap();
        for (i, contents) in ["aaa", "bb", "c"].iter().enumerate() {
            let path = chunk_path(dir.path(), "f.parquet", i, 3);
            fs::write(&path, contents).await.unwrap();
        }

        let assembled = assemble(dir.path(), "f.parquet", 3).await.unwrap();
        let joined = fs::read_to_string(&assembled).await.unwrap();
        assert_eq!(joined, "aaabbc");
    }

    #[tokio::test]
    async fn test_assemble_single_chunk_is_identity() {
        let dir = tempfile::tempdir().unwrap();
        let path = chunk_path(dir.path(), "f.parquet", 0, 1);
        fs::write(&path, "payload").await.unwrap();

        let assembled = assemble(dir.path(), "f.parquet", 1).await.unwrap();
        assert_eq!(assembled, path);
    }
}
