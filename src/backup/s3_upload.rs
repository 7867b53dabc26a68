// pgbackup-s3/src/backup/s3_upload.rs
use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytesize::ByteSize;
use s3::config::Region;
use s3::error::DisplayErrorContext;
use s3::primitives::{ByteStream, Length};
use s3::types::{CompletedMultipartUpload, CompletedPart};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::config::{StorageCredentials, StorageDestination};
use crate::errors::UploadError;

/// Files at or above this size go through a multipart upload.
pub const MULTIPART_THRESHOLD: u64 = 64 * 1024 * 1024;
const MAX_PARTS: u64 = 10_000;

/// Durably stores a local file under a key.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        destination: &StorageDestination,
    ) -> Result<(), UploadError>;
}

/// Uploads to S3 or an S3-compatible service. The file body is always
/// streamed from disk, never read into memory whole.
#[derive(Debug, Clone)]
pub struct S3Uploader {
    credentials: StorageCredentials,
}

impl S3Uploader {
    pub fn new(credentials: StorageCredentials) -> Self {
        S3Uploader { credentials }
    }

    async fn client_for(&self, destination: &StorageDestination) -> s3::Client {
        let mut loader = aws_config::defaults(s3::config::BehaviorVersion::latest())
            .region(Region::new(destination.region.clone()))
            .credentials_provider(s3::config::Credentials::new(
                &self.credentials.access_key_id,
                &self.credentials.secret_access_key,
                None,
                None,
                "Static",
            ));
        if let Some(endpoint) = &destination.endpoint {
            info!(endpoint = %endpoint, "Using custom endpoint");
            loader = loader.endpoint_url(endpoint);
        }
        let sdk_config = loader.load().await;

        let s3_config = s3::config::Builder::from(&sdk_config)
            .force_path_style(destination.force_path_style)
            .build();
        s3::Client::from_conf(s3_config)
    }

    async fn put_single(
        &self,
        client: &s3::Client,
        local_path: &Path,
        bucket: &str,
        key: &str,
    ) -> Result<(), UploadError> {
        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| UploadError::Read {
                path: local_path.to_path_buf(),
                source: std::io::Error::other(e),
            })?;

        client
            .put_object()
            .bucket(bucket)
            .key(key)
            .body(body)
            .send()
            .await
            .map_err(|e| service_error("PutObject", bucket, key, e))?;
        Ok(())
    }

    async fn put_multipart(
        &self,
        client: &s3::Client,
        local_path: &Path,
        size: u64,
        bucket: &str,
        key: &str,
    ) -> Result<(), UploadError> {
        let created = client
            .create_multipart_upload()
            .bucket(bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| service_error("CreateMultipartUpload", bucket, key, e))?;
        let upload_id = created
            .upload_id()
            .ok_or_else(|| UploadError::MissingUploadId {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })?
            .to_string();

        let parts = match self
            .upload_parts(client, local_path, size, bucket, key, &upload_id)
            .await
        {
            Ok(parts) => parts,
            Err(e) => {
                if let Err(abort_err) = client
                    .abort_multipart_upload()
                    .bucket(bucket)
                    .key(key)
                    .upload_id(&upload_id)
                    .send()
                    .await
                {
                    warn!(
                        key = %key,
                        error = %DisplayErrorContext(abort_err),
                        "Failed to abort multipart upload; the bucket may hold orphaned parts"
                    );
                }
                return Err(e);
            }
        };

        client
            .complete_multipart_upload()
            .bucket(bucket)
            .key(key)
            .upload_id(&upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(parts))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| service_error("CompleteMultipartUpload", bucket, key, e))?;
        Ok(())
    }

    async fn upload_parts(
        &self,
        client: &s3::Client,
        local_path: &Path,
        size: u64,
        bucket: &str,
        key: &str,
        upload_id: &str,
    ) -> Result<Vec<CompletedPart>, UploadError> {
        let part_size = part_size_for(size);
        let mut parts = Vec::new();
        let mut offset = 0u64;
        let mut part_number = 1i32;

        while offset < size {
            let length = part_size.min(size - offset);
            let body = ByteStream::read_from()
                .path(local_path)
                .offset(offset)
                .length(Length::Exact(length))
                .build()
                .await
                .map_err(|e| UploadError::Read {
                    path: local_path.to_path_buf(),
                    source: std::io::Error::other(e),
                })?;

            let uploaded = client
                .upload_part()
                .bucket(bucket)
                .key(key)
                .upload_id(upload_id)
                .part_number(part_number)
                .body(body)
                .send()
                .await
                .map_err(|e| service_error("UploadPart", bucket, key, e))?;
            debug!(key = %key, part_number, bytes = length, "Uploaded part");

            parts.push(
                CompletedPart::builder()
                    .set_e_tag(uploaded.e_tag().map(str::to_string))
                    .part_number(part_number)
                    .build(),
            );
            offset += length;
            part_number += 1;
        }
        Ok(parts)
    }
}

#[async_trait]
impl ObjectStore for S3Uploader {
    async fn upload(
        &self,
        local_path: &Path,
        key: &str,
        destination: &StorageDestination,
    ) -> Result<(), UploadError> {
        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| UploadError::Read {
                path: local_path.to_path_buf(),
                source: e,
            })?
            .len();
        let bucket = destination.bucket.as_str();
        info!(
            path = %local_path.display(),
            bucket = %bucket,
            key = %key,
            size = %ByteSize::b(size),
            "Uploading backup to S3"
        );

        let client = self.client_for(destination).await;
        if size >= MULTIPART_THRESHOLD {
            self.put_multipart(&client, local_path, size, bucket, key).await?;
        } else {
            self.put_single(&client, local_path, bucket, key).await?;
        }

        info!(bucket = %bucket, key = %key, "Backup uploaded to S3");
        Ok(())
    }
}

/// Part size that keeps the upload within the service's part-count limit.
pub fn part_size_for(size: u64) -> u64 {
    MULTIPART_THRESHOLD.max(size.div_ceil(MAX_PARTS))
}

fn service_error<E>(operation: &'static str, bucket: &str, key: &str, err: E) -> UploadError
where
    E: std::error::Error,
{
    UploadError::Service {
        operation,
        bucket: bucket.to_string(),
        key: key.to_string(),
        message: DisplayErrorContext(err).to_string(),
    }
}
