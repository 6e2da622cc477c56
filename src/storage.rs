//! Durable object storage for uploaded judgments.
//!
//! The uploader talks to storage through the [`ObjectStore`] trait so tests
//! can swap in an in-memory store; production uses S3 with the standard
//! credential/region resolution chain.

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::primitives::ByteStream;
use backoff::ExponentialBackoff;
use std::time::Duration;
use tracing::{debug, warn};

#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Write `body` under `key`, overwriting any existing object.
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()>;

    /// Existence check used to verify an upload actually landed.
    async fn exists(&self, key: &str) -> Result<bool>;
}

pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3Store {
    pub async fn connect(bucket: String) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest()).load().await;
        Self {
            client: aws_sdk_s3::Client::new(&config),
            bucket,
        }
    }

    fn upload_backoff() -> ExponentialBackoff {
        ExponentialBackoff {
            initial_interval: Duration::from_secs(1),
            max_interval: Duration::from_secs(15),
            max_elapsed_time: Some(Duration::from_secs(60)),
            ..ExponentialBackoff::default()
        }
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn put(&self, key: &str, body: Vec<u8>, content_type: &str) -> Result<()> {
        // Transient S3 faults (throttling, 5xx) retry with backoff; the
        // per-file verdict is left to the caller's head-object verify.
        backoff::future::retry(Self::upload_backoff(), || {
            let body = body.clone();
            async move {
                self.client
                    .put_object()
                    .bucket(&self.bucket)
                    .key(key)
                    .content_type(content_type)
                    .body(ByteStream::from(body))
                    .send()
                    .await
                    .map_err(|e| {
                        warn!(key, "put_object attempt failed: {e}");
                        backoff::Error::transient(anyhow!("put_object failed: {e}"))
                    })?;
                Ok::<(), backoff::Error<anyhow::Error>>(())
            }
        })
        .await
        .with_context(|| format!("uploading s3://{}/{key}", self.bucket))?;
        debug!(key, "uploaded");
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let service_err = e.into_service_error();
                if service_err.is_not_found() {
                    Ok(false)
                } else {
                    Err(anyhow!(
                        "head_object s3://{}/{key} failed: {service_err}",
                        self.bucket
                    ))
                }
            }
        }
    }
}
