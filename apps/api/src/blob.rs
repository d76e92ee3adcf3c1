//! Opaque file bytes keyed by path. S3 in production, MinIO locally.

use async_trait::async_trait;
use aws_sdk_s3::primitives::ByteStream;
use bytes::Bytes;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("Blob not found: {0}")]
    NotFound(String),

    #[error("S3 error: {0}")]
    S3(String),
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    async fn put(&self, path: &str, data: Bytes, content_type: Option<&str>)
        -> Result<(), BlobError>;

    async fn get(&self, path: &str) -> Result<Bytes, BlobError>;
}

#[derive(Clone)]
pub struct S3BlobStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

impl S3BlobStore {
    pub fn new(client: aws_sdk_s3::Client, bucket: String) -> Self {
        Self { client, bucket }
    }
}

#[async_trait]
impl BlobStore for S3BlobStore {
    async fn put(
        &self,
        path: &str,
        data: Bytes,
        content_type: Option<&str>,
    ) -> Result<(), BlobError> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(path)
            .body(ByteStream::from(data));
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        request
            .send()
            .await
            .map_err(|e| BlobError::S3(format!("upload of {path} failed: {e}")))?;

        info!("Uploaded blob to s3://{}/{}", self.bucket, path);
        Ok(())
    }

    async fn get(&self, path: &str) -> Result<Bytes, BlobError> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(path)
            .send()
            .await
            .map_err(|e| {
                let e = e.into_service_error();
                if e.is_no_such_key() {
                    BlobError::NotFound(path.to_string())
                } else {
                    BlobError::S3(format!("download of {path} failed: {e}"))
                }
            })?;

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| BlobError::S3(format!("reading {path} failed: {e}")))?;
        Ok(data.into_bytes())
    }
}
