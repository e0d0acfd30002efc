use async_trait::async_trait;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::{config::Region, primitives::ByteStream, Client};
use serde::{Deserialize, Serialize};
use std::env;
use tracing::{debug, info, instrument};

use super::ObjectStore;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    /// Static credentials; the default AWS provider chain is used when absent
    pub access_key: Option<String>,
    pub secret_key: Option<String>,
    pub path_style: bool,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            endpoint: None,
            region: "ap-south-1".to_string(),
            bucket: "edx-energy-data".to_string(),
            access_key: None,
            secret_key: None,
            path_style: false,
        }
    }
}

impl S3Config {
    pub fn with_env_overrides(mut self) -> Self {
        if let Ok(endpoint) = env::var("S3_ENDPOINT") {
            self.endpoint = Some(endpoint);
        }
        if let Ok(region) = env::var("S3_REGION") {
            self.region = region;
        }
        if let Ok(bucket) = env::var("S3_BUCKET") {
            self.bucket = bucket;
        }
        if let Ok(key) = env::var("S3_ACCESS_KEY").or_else(|_| env::var("AWS_ACCESS_KEY_ID")) {
            self.access_key = Some(key);
        }
        if let Ok(secret) =
            env::var("S3_SECRET_KEY").or_else(|_| env::var("AWS_SECRET_ACCESS_KEY"))
        {
            self.secret_key = Some(secret);
        }
        if let Some(path_style) = env::var("S3_PATH_STYLE").ok().and_then(|v| v.parse().ok()) {
            self.path_style = path_style;
        }
        self
    }

    pub fn for_minio(endpoint: impl Into<String>, bucket: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            region: "us-east-1".to_string(),
            bucket: bucket.into(),
            access_key: Some("minioadmin".to_string()),
            secret_key: Some("minioadmin".to_string()),
            path_style: true,
        }
    }
}

#[derive(Clone)]
pub struct S3ObjectStore {
    client: Client,
    bucket: String,
}

impl S3ObjectStore {
    pub async fn new(config: S3Config) -> Result<Self> {
        debug!(bucket = %config.bucket, endpoint = ?config.endpoint, "Initializing S3 object store");

        let shared = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(config.region.clone()))
            .load()
            .await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared).force_path_style(config.path_style);

        if let (Some(access), Some(secret)) = (&config.access_key, &config.secret_key) {
            builder = builder.credentials_provider(Credentials::new(
                access.clone(),
                secret.clone(),
                None,
                None,
                "edx-storage",
            ));
        }

        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }

        let client = Client::from_conf(builder.build());

        info!("Storage client initialized for bucket: {}", config.bucket);

        Ok(Self {
            client,
            bucket: config.bucket,
        })
    }
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    #[instrument(skip(self, data), fields(bytes = data.len()))]
    async fn put(&self, key: &str, data: Vec<u8>, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(ByteStream::from(data))
            .send()
            .await
            .map_err(|e| IngestError::upload(key, aws_sdk_s3::error::DisplayErrorContext(e)))?;

        debug!("Uploaded s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                let missing = e
                    .as_service_error()
                    .is_some_and(|service| service.is_no_such_key());
                if missing {
                    IngestError::ObjectMissing(key.to_string())
                } else {
                    IngestError::fetch(
                        self.location(key),
                        aws_sdk_s3::error::DisplayErrorContext(e).to_string(),
                        true,
                    )
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| IngestError::fetch(self.location(key), e.to_string(), true))?
            .into_bytes()
            .to_vec();

        debug!("Downloaded {} bytes from s3://{}/{}", data.len(), self.bucket, key);
        Ok(data)
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| IngestError::upload(key, aws_sdk_s3::error::DisplayErrorContext(e)))?;
        debug!("Deleted s3://{}/{}", self.bucket, key);
        Ok(())
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| {
                IngestError::fetch(
                    self.location(prefix),
                    aws_sdk_s3::error::DisplayErrorContext(e).to_string(),
                    true,
                )
            })?;
            keys.extend(
                page.contents()
                    .iter()
                    .filter_map(|obj| obj.key().map(|k| k.to_string())),
            );
        }

        keys.sort();
        Ok(keys)
    }

    fn location(&self, key: &str) -> String {
        format!("s3://{}/{}", self.bucket, key)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_for_minio() {
        let config = S3Config::for_minio("http://localhost:9000", "test-bucket");
        assert_eq!(config.endpoint.as_deref(), Some("http://localhost:9000"));
        assert_eq!(config.bucket, "test-bucket");
        assert!(config.path_style);
    }

    #[test]
    fn test_location() {
        let store = S3ObjectStore {
            client: Client::from_conf(aws_sdk_s3::Config::builder().build()),
            bucket: "edx".to_string(),
        };
        assert_eq!(store.location("a/b.csv"), "s3://edx/a/b.csv");
    }
}
