use async_trait::async_trait;
use aws_config::{BehaviorVersion, meta::region::RegionProviderChain};
use aws_credential_types::Credentials;
use aws_sdk_s3::{Client, primitives::ByteStream, types::ServerSideEncryption};
use aws_types::region::Region;
use bytes::Bytes;
use tracing::{debug, error, info};

use crate::{config::Config, storage::{Storage, StorageError}};

// Remote blob backend on S3 or an S3-compatible endpoint
#[derive(Clone)]
pub struct S3Storage {
    client: Client,
    bucket: String,
}

impl S3Storage {
    /// Connects to the configured bucket, creating it when the endpoint allows.
    pub async fn new(config: &Config) -> Self {
        let client = Client::from_conf(Self::client_config(config).await);
        let storage = Self { client, bucket: config.s3_bucket.clone() };
        storage.ensure_bucket().await;
        storage
    }

    async fn client_config(config: &Config) -> aws_sdk_s3::Config {
        let region = RegionProviderChain::first_try(Region::new(config.s3_region.clone()))
            .or_default_provider()
            .or_else(Region::new("us-east-1"));
        let mut loader = aws_config::defaults(BehaviorVersion::latest()).region(region);

        // MinIO and friends take static keys and path-style addressing
        let custom_endpoint = config.s3_endpoint.is_some();
        if let Some(endpoint) = &config.s3_endpoint {
            loader = loader.endpoint_url(endpoint).credentials_provider(Credentials::new(
                config.s3_access_key.clone(),
                config.s3_secret_key.clone(),
                None,
                None,
                "teamdrive-static",
            ));
        }

        let shared = loader.load().await;
        aws_sdk_s3::config::Builder::from(&shared)
            .force_path_style(custom_endpoint)
            .build()
    }

    async fn ensure_bucket(&self) {
        if self.client.head_bucket().bucket(&self.bucket).send().await.is_ok() {
            info!("Using existing bucket {}", self.bucket);
            return;
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => info!("Created bucket {}", self.bucket),
            Err(e) => {
                let owned = e
                    .as_service_error()
                    .is_some_and(|se| se.is_bucket_already_owned_by_you() || se.is_bucket_already_exists());
                if owned {
                    info!("Using existing bucket {}", self.bucket);
                } else {
                    // Remote writes will surface as StorageUnavailable until this is fixed
                    error!("Bucket {} is missing and could not be created: {}", self.bucket, e);
                }
            }
        }
    }
}

#[async_trait]
impl Storage for S3Storage {
    async fn upload(&self, key: &str, content: Bytes) -> Result<String, StorageError> {
        let body = ByteStream::from(content);

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .server_side_encryption(ServerSideEncryption::Aes256)
            .body(body)
            .send()
            .await
            .map_err(|e| StorageError::UploadError(e.to_string()))?;

        Ok(key.to_string())
    }

    async fn download(&self, key: &str) -> Result<Bytes, StorageError> {
        debug!("S3 GET {}", key);
        let response = self.client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StorageError::NotFound(key.to_string())
                } else {
                    StorageError::DownloadError(e.to_string())
                }
            })?;

        let data = response
            .body
            .collect()
            .await
            .map_err(|e| StorageError::DownloadError(e.to_string()))?;

        Ok(data.into_bytes())
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        if !self.exists(key).await? {
            return Ok(false);
        }

        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StorageError::DeleteError(e.to_string()))?;

        info!("Deleted s3 object {}", key);
        Ok(true)
    }

    async fn exists(&self, key: &str) -> Result<bool, StorageError> {
        match self.client.head_object().bucket(&self.bucket).key(key).send().await {
            Ok(_) => Ok(true),
            Err(e) if e.as_service_error().is_some_and(|se| se.is_not_found()) => Ok(false),
            Err(e) => Err(StorageError::DownloadError(e.to_string())),
        }
    }
}
