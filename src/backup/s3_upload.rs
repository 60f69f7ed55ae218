// objectbackup/src/backup/s3_upload.rs
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use s3::config::Region;
use s3::config::http::HttpResponse;
use s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;

use crate::backup::store::{ObjectHead, ObjectStoreClient};
use crate::config::StorageConfig;
use crate::errors::StoreError;

/// S3 rejects multipart uploads with more parts than this.
const MAX_PARTS: u64 = 10_000;

/// Error codes S3 (and compatible stores) use for throttling or transient
/// server trouble, sometimes with a 4xx status.
const RETRIABLE_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

/// `ObjectStoreClient` backed by S3 or an S3-compatible service
/// (DigitalOcean Spaces, MinIO, ...).
///
/// Files above `multipart_threshold` go through a multipart upload with
/// parts of exactly that size, so the resulting ETag matches `Md5Etag`.
#[derive(Clone)]
pub struct S3Store {
    client: s3::Client,
    multipart_threshold: u64,
}

impl S3Store {
    pub async fn connect(storage: &StorageConfig, multipart_threshold: u64) -> Self {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(storage.region.clone()));

        if let (Some(key_id), Some(secret)) = (&storage.access_key_id, &storage.secret_access_key) {
            loader = loader.credentials_provider(s3::config::Credentials::new(
                key_id, secret, None, // session_token
                None,     // expiry
                "Static", // provider_name
            ));
        }
        if let Some(endpoint) = &storage.endpoint_url {
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(storage.endpoint_url.is_some())
            .build();

        S3Store {
            client: s3::Client::from_conf(s3_config),
            multipart_threshold: multipart_threshold.max(1),
        }
    }

    /// HEAD on the target bucket: it exists and the credentials can reach it.
    pub async fn check_connection(&self, bucket: &str) -> Result<()> {
        tracing::info!(bucket, "Checking object store connection");
        self.client
            .head_bucket()
            .bucket(bucket)
            .send()
            .await
            .map_err(|e| anyhow::anyhow!("{}", DisplayErrorContext(&e)))
            .with_context(|| format!("Bucket '{}' is not accessible", bucket))?;
        tracing::info!(bucket, "Target bucket is accessible");
        Ok(())
    }

    async fn put_single(&self, bucket: &str, key: &str, path: &Path) -> Result<String, StoreError> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| local_read_error(path, e))?;

        let output = self
            .client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| classify("PutObject", &e))?;

        output
            .e_tag()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Retriable("PutObject returned no ETag".to_string()))
    }

    async fn put_multipart(
        &self,
        bucket: &str,
        key: &str,
        path: &Path,
        size: u64,
    ) -> Result<String, StoreError> {
        let part_count = size.div_ceil(self.multipart_threshold);
        if part_count > MAX_PARTS {
            return Err(StoreError::Permanent(format!(
                "{} needs {} parts, more than the {} allowed; raise the multipart threshold",
                path.display(),
                part_count,
                MAX_PARTS
            )));
        }

        let created = self
            .client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| classify("CreateMultipartUpload", &e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| {
                StoreError::Retriable("CreateMultipartUpload returned no upload id".to_string())
            })?
            .to_string();

        match self
            .upload_parts(bucket, key, &upload_id, path, size, part_count)
            .await
        {
            Ok(etag) => Ok(etag),
            Err(err) => {
                if let Err(abort_err) = self
                    .client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    tracing::warn!(
                        key,
                        upload_id = %upload_id,
                        error = %DisplayErrorContext(&abort_err),
                        "Failed to abort multipart upload"
                    );
                }
                Err(err)
            }
        }
    }

    async fn upload_parts(
        &self,
        bucket: &str,
        key: &str,
        upload_id: &str,
        path: &Path,
        size: u64,
        part_count: u64,
    ) -> Result<String, StoreError> {
        let mut completed = Vec::with_capacity(part_count as usize);

        for index in 0..part_count {
            let offset = index * self.multipart_threshold;
            let length = self.multipart_threshold.min(size - offset);
            let part_number = (index + 1) as i32;

            let body = ByteStream::read_from()
                .path(path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| local_read_error(path, e))?;

            let output = self
                .client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| classify("UploadPart", &e))?;

            let etag = output.e_tag().ok_or_else(|| {
                StoreError::Retriable(format!("UploadPart {} returned no ETag", part_number))
            })?;
            tracing::debug!(key, part_number, length, "Uploaded part");

            completed.push(
                CompletedPart::builder()
                    .e_tag(etag)
                    .part_number(part_number)
                    .build(),
            );
        }

        let output = self
            .client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify("CompleteMultipartUpload", &e))?;

        output.e_tag().map(str::to_string).ok_or_else(|| {
            StoreError::Retriable("CompleteMultipartUpload returned no ETag".to_string())
        })
    }
}

#[async_trait]
impl ObjectStoreClient for S3Store {
    async fn put_object(
        &self,
        bucket: &str,
        key: &str,
        local_path: &Path,
    ) -> Result<String, StoreError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| local_read_error(local_path, e))?
            .len();

        if size > self.multipart_threshold {
            self.put_multipart(bucket, key, local_path, size).await
        } else {
            self.put_single(bucket, key, local_path).await
        }
    }

    async fn head_object(
        &self,
        bucket: &str,
        key: &str,
    ) -> Result<Option<ObjectHead>, StoreError> {
        match self.client.head_object().bucket(bucket).key(key).send().await {
            Ok(output) => Ok(Some(ObjectHead {
                size: output.content_length().unwrap_or(0).max(0) as u64,
                digest: output.e_tag().unwrap_or_default().to_string(),
            })),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(classify("HeadObject", &err)),
        }
    }
}

fn local_read_error(path: &Path, err: impl std::fmt::Display) -> StoreError {
    StoreError::Permanent(format!("cannot read {}: {}", path.display(), err))
}

fn classify<E>(operation: &str, err: &SdkError<E, HttpResponse>) -> StoreError
where
    E: ProvideErrorMetadata + std::error::Error + 'static,
{
    let message = format!("{} failed: {}", operation, DisplayErrorContext(err));
    let retriable = match err {
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
            true
        }
        SdkError::ServiceError(_) => is_retriable_response(
            err.raw_response().map(|r| r.status().as_u16()),
            err.code(),
        ),
        _ => false,
    };

    if retriable {
        StoreError::Retriable(message)
    } else {
        StoreError::Permanent(message)
    }
}

/// 5xx, 429 and throttling codes are worth another attempt; other 4xx
/// (denied, missing bucket, bad request) are not.
fn is_retriable_response(status: Option<u16>, code: Option<&str>) -> bool {
    if matches!(status, Some(429) | Some(500..=599)) {
        return true;
    }
    code.is_some_and(|c| RETRIABLE_CODES.contains(&c))
}
