use crate::config::S3Config;
use crate::object_store::{ObjectProbe, ObjectStore, PresignedUpload};
use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Builder as S3ConfigBuilder;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::Client as S3Client;
use std::time::Duration;
use tracing::{debug, info, instrument};

/// S3-compatible object store (AWS, MinIO, LocalStack)
pub struct S3ObjectStore {
    client: S3Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: &S3Config) -> Result<Self> {
        let aws_config = aws_config::defaults(BehaviorVersion::latest())
            .region(aws_config::Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = S3ConfigBuilder::from(&aws_config);

        if let Some(ref endpoint_url) = config.endpoint_url {
            builder = builder.endpoint_url(endpoint_url);
        }

        // Required for MinIO
        if config.force_path_style {
            builder = builder.force_path_style(true);
        }

        let client = S3Client::from_conf(builder.build());

        info!(
            bucket = %config.bucket,
            region = %config.region,
            "S3 object store initialized"
        );

        Ok(Self {
            client,
            bucket: config.bucket.clone(),
        })
    }
}

/// Total object size from a `Content-Range` header such as `bytes 0-1023/5000`
fn total_from_content_range(content_range: &str) -> Option<u64> {
    content_range.rsplit_once('/')?.1.trim().parse().ok()
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self), fields(key = %key))]
    async fn presign_put(&self, key: &str, ttl: Duration) -> Result<PresignedUpload> {
        let upload = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(ttl).context("Invalid presign TTL")?)
            .await
            .context("Failed to presign upload URL")?;

        let get = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(PresigningConfig::expires_in(ttl).context("Invalid presign TTL")?)
            .await
            .context("Failed to presign download URL")?;

        Ok(PresignedUpload {
            upload_url: upload.uri().to_string(),
            get_url: get.uri().to_string(),
        })
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn get_range(&self, key: &str, max_bytes: u64) -> Result<Option<ObjectProbe>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(format!("bytes=0-{}", max_bytes.max(1) - 1))
            .send()
            .await;

        let object = match result {
            Ok(object) => object,
            Err(e) => {
                if e.as_service_error()
                    .map(|e| e.is_no_such_key())
                    .unwrap_or(false)
                {
                    return Ok(None);
                }
                // Ranged reads of an empty object are rejected with 416
                if e.raw_response().map(|r| r.status().as_u16()) == Some(416) {
                    return Ok(Some(ObjectProbe {
                        bytes: Vec::new(),
                        total_size: 0,
                        e_tag: String::new(),
                    }));
                }
                return Err(e).context("Failed to read object range");
            }
        };

        let total_size = object
            .content_range()
            .and_then(total_from_content_range)
            .or_else(|| object.content_length().map(|len| len.max(0) as u64))
            .unwrap_or(0);
        let e_tag = object.e_tag().unwrap_or_default().to_string();

        let bytes = object
            .body
            .collect()
            .await
            .context("Failed to read object body")?
            .into_bytes()
            .to_vec();

        debug!(read_bytes = bytes.len(), total_size, e_tag = %e_tag, "Object read");

        Ok(Some(ObjectProbe {
            bytes,
            total_size,
            e_tag,
        }))
    }

    #[instrument(skip(self), fields(src = %src, dst = %dst))]
    async fn copy(&self, src: &str, dst: &str, if_match: &str) -> Result<Option<String>> {
        let result = self
            .client
            .copy_object()
            .bucket(&self.bucket)
            .copy_source(format!("{}/{}", self.bucket, src))
            .copy_source_if_match(if_match)
            .key(dst)
            .send()
            .await;

        match result {
            Ok(_) => Ok(Some(dst.to_string())),
            Err(e) if e.raw_response().map(|r| r.status().as_u16()) == Some(412) => {
                debug!(if_match = %if_match, "Source object changed before copy");
                Ok(None)
            }
            Err(e) => Err(e).context("Failed to copy object"),
        }
    }

    #[instrument(skip(self), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        // DeleteObject succeeds for missing keys
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .context("Failed to delete object")?;

        debug!("Object deleted");
        Ok(())
    }
}
