//! Object-store client.
//!
//! Thin handle over an S3 bucket: paginated list, head, ranged get. Every
//! operation is retried on transient errors with jittered exponential
//! backoff (bounded attempts), and every backoff sleep observes the shutdown
//! signal. A semaphore bounds in-flight requests across all tables — the
//! store sees one shared connection pool, not one per table.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::Settings;
use crate::shutdown::{Shutdown, ShuttingDown};

/// Attempts per operation before the error propagates.
const MAX_ATTEMPTS: u32 = 5;

/// First backoff; doubles per attempt, capped at 30 s.
const BASE_BACKOFF_SECS: f64 = 0.5;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("object not found: {0}")]
    NotFound(String),
    #[error("shutting down")]
    Shutdown(#[from] ShuttingDown),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One listed object.
#[derive(Debug, Clone)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
}

/// An open ranged-get body. Holds its pool permit until dropped so the
/// connection count stays bounded while the body streams.
pub struct RangeStream {
    pub body: ByteStream,
    _permit: OwnedSemaphorePermit,
}

pub struct StoreClient {
    client: Client,
    bucket: String,
    slots: Arc<Semaphore>,
}

/// Backoff for `attempt` (0-based): base · 2^attempt, 50–100 % jitter, ≤ 30 s.
fn backoff_delay(attempt: u32) -> Duration {
    let base = BASE_BACKOFF_SECS * 2f64.powi(attempt as i32);
    let jitter = 0.5 + rand::thread_rng().gen::<f64>() * 0.5;
    Duration::from_secs_f64((base * jitter).min(30.0))
}

impl StoreClient {
    pub async fn connect(settings: &Settings) -> Result<Self> {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(endpoint) = &settings.s3_endpoint {
            loader = loader.endpoint_url(endpoint);
        }
        let shared = loader.load().await;

        // Path-style addressing for S3-compatible endpoints (MinIO etc.)
        let client = if settings.s3_endpoint.is_some() {
            let conf = aws_sdk_s3::config::Builder::from(&shared)
                .force_path_style(true)
                .build();
            Client::from_conf(conf)
        } else {
            Client::new(&shared)
        };

        Ok(Self {
            client,
            bucket: settings.parquet_s3_bucket.clone(),
            slots: Arc::new(Semaphore::new(settings.s3_pool_size)),
        })
    }

    async fn wait_backoff(
        &self,
        what: &str,
        key: &str,
        attempt: u32,
        err: impl std::fmt::Display,
        shutdown: &Shutdown,
    ) -> Result<(), ShuttingDown> {
        let delay = backoff_delay(attempt);
        tracing::warn!(
            "{} {} failed (attempt {}/{}), retrying in {:.1}s: {}",
            what,
            key,
            attempt + 1,
            MAX_ATTEMPTS,
            delay.as_secs_f64(),
            err
        );
        shutdown.sleep(delay).await
    }

    /// List all objects under `prefix` (paginated).
    pub async fn list(
        &self,
        prefix: &str,
        shutdown: &Shutdown,
    ) -> Result<Vec<ObjectInfo>, StoreError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .context("store connection pool closed")?;

        let mut attempt = 0;
        loop {
            shutdown.check()?;
            match self.list_once(prefix).await {
                Ok(objects) => return Ok(objects),
                Err(e) if attempt + 1 < MAX_ATTEMPTS => {
                    self.wait_backoff("list", prefix, attempt, &e, shutdown)
                        .await?;
                    attempt += 1;
                }
                Err(e) => return Err(StoreError::Other(e)),
            }
        }
    }

    async fn list_once(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.with_context(|| format!("listing {}", prefix))?;
            for obj in page.contents() {
                let Some(key) = obj.key() else { continue };
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: obj.size().unwrap_or(0).max(0) as u64,
                });
            }
        }
        Ok(objects)
    }

    /// Object size, or `NotFound`.
    pub async fn head(&self, key: &str, shutdown: &Shutdown) -> Result<u64, StoreError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .context("store connection pool closed")?;

        let mut attempt = 0;
        loop {
            shutdown.check()?;
            let result = self
                .client
                .head_object()
                .bucket(&self.bucket)
                .key(key)
                .send()
                .await;

            match result {
                Ok(out) => {
                    return Ok(out.content_length().unwrap_or(0).max(0) as u64);
                }
                Err(e) => {
                    if e.as_service_error().map_or(false, |se| se.is_not_found()) {
                        return Err(StoreError::NotFound(key.to_string()));
                    }
                    if attempt + 1 >= MAX_ATTEMPTS {
                        return Err(StoreError::Other(
                            anyhow::Error::new(e).context(format!("head {}", key)),
                        ));
                    }
                    self.wait_backoff("head", key, attempt, &e, shutdown).await?;
                    attempt += 1;
                }
            }
        }
    }

    /// Open a ranged get over `[start, end)`. The returned stream holds a
    /// pool slot until dropped.
    pub async fn get_range(
        &self,
        key: &str,
        start: u64,
        end: u64,
        shutdown: &Shutdown,
    ) -> Result<RangeStream, StoreError> {
        debug_assert!(start < end, "empty range requested");
        let permit = self
            .slots
            .clone()
            .acquire_owned()
            .await
            .context("store connection pool closed")?;

        let range = format!("bytes={}-{}", start, end - 1);
        let mut attempt = 0;
        loop {
            shutdown.check()?;
            let result = self
                .client
                .get_object()
                .bucket(&self.bucket)
                .key(key)
                .range(&range)
                .send()
                .await;

            match result {
                Ok(out) => {
                    return Ok(RangeStream {
                        body: out.body,
                        _permit: permit,
                    });
                }
                Err(e) => {
                    if e.as_service_error().map_or(false, |se| se.is_no_such_key()) {
                        return Err(StoreError::NotFound(key.to_string()));
                    }
                    if attempt + 1 >= MAX_ATTEMPTS {
                        return Err(StoreError::Other(
                            anyhow::Error::new(e).context(format!("get {} range {}", key, range)),
                        ));
                    }
                    self.wait_backoff("get", key, attempt, &e, shutdown).await?;
                    attempt += 1;
                }
            }
        }
    }
}
