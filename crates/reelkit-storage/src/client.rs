//! S3-compatible storage client.

use std::path::Path;

use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::sink::BlobSink;

/// Configuration for the S3 client.
#[derive(Debug, Clone)]
pub struct S3Config {
    /// Optional custom endpoint (R2, MinIO); AWS default when unset
    pub endpoint_url: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    pub region: String,
    /// Base URL for public object access; virtual-hosted style when unset
    pub public_base_url: Option<String>,
}

/// S3-compatible blob sink for final artifacts.
#[derive(Clone)]
pub struct S3Client {
    client: Client,
    bucket: String,
    public_base_url: Option<String>,
    region: String,
}

impl S3Client {
    /// Create a new client from configuration.
    pub fn new(config: S3Config) -> StorageResult<Self> {
        if config.bucket.is_empty() {
            return Err(StorageError::config_error("bucket name is empty"));
        }

        let credentials = Credentials::new(
            &config.access_key_id,
            &config.secret_access_key,
            None,
            None,
            "reelkit",
        );

        let mut builder = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .credentials_provider(credentials);

        if let Some(endpoint) = &config.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: config.bucket,
            public_base_url: config.public_base_url,
            region: config.region,
        })
    }

    /// Public URL for an uploaded key.
    fn url_for(&self, key: &str) -> String {
        match &self.public_base_url {
            Some(base) => format!("{}/{}", base.trim_end_matches('/'), key),
            None => format!(
                "https://{}.s3.{}.amazonaws.com/{}",
                self.bucket, self.region, key
            ),
        }
    }
}

#[async_trait]
impl BlobSink for S3Client {
    async fn put(&self, local_path: &Path, key: &str) -> StorageResult<String> {
        if key.is_empty() || key.starts_with('/') {
            return Err(StorageError::InvalidKey(key.to_string()));
        }

        debug!("Uploading {} to s3://{}/{}", local_path.display(), self.bucket, key);

        let body = ByteStream::from_path(local_path)
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("video/mp4")
            .send()
            .await
            .map_err(|e| StorageError::upload_failed(e.to_string()))?;

        let url = self.url_for(key);
        info!("Uploaded {} to {}", local_path.display(), url);
        Ok(url)
    }
}
