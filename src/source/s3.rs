use std::time::{Duration, UNIX_EPOCH};

use async_trait::async_trait;
use aws_sdk_s3::Client;
use bytes::Bytes;

use super::{Source, SourceResolver, StatResult};
use crate::error::IoError;
use crate::operation::Identifier;

/// Resolves identifiers to objects in an S3 (or S3-compatible) bucket.
///
/// The identifier, prefixed with the optional key prefix, is the object key.
#[derive(Clone)]
pub struct S3Resolver {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Resolver {
    /// # Arguments
    /// * `client` - AWS S3 client to use for requests
    /// * `bucket` - bucket containing the source images
    /// * `prefix` - key prefix prepended to every identifier (may be empty)
    pub fn new(client: Client, bucket: String, prefix: String) -> Self {
        Self {
            client,
            bucket,
            prefix,
        }
    }

    /// Get the bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    fn key_for(&self, identifier: &Identifier) -> String {
        if self.prefix.is_empty() {
            identifier.to_string()
        } else {
            format!("{}/{}", self.prefix.trim_end_matches('/'), identifier)
        }
    }
}

#[async_trait]
impl SourceResolver for S3Resolver {
    type Source = S3Source;

    fn kind(&self) -> &'static str {
        "s3"
    }

    async fn resolve(&self, identifier: &Identifier) -> Result<Self::Source, IoError> {
        if identifier.as_str().is_empty() {
            return Err(IoError::NotFound(identifier.to_string()));
        }
        let key = self.key_for(identifier);
        let location = format!("s3://{}/{}", self.bucket, key);
        Ok(S3Source {
            client: self.client.clone(),
            bucket: self.bucket.clone(),
            key,
            location,
        })
    }
}

/// One object in S3.
#[derive(Clone)]
pub struct S3Source {
    client: Client,
    bucket: String,
    key: String,
    location: String,
}

impl S3Source {
    /// Get the object key.
    pub fn key(&self) -> &str {
        &self.key
    }
}

/// Classify an SDK failure, detecting "not found" through every channel the
/// SDK may report it on.
fn classify_error(
    location: &str,
    service_not_found: bool,
    status: Option<u16>,
    message: String,
) -> IoError {
    if service_not_found || status == Some(404) {
        return IoError::NotFound(location.to_string());
    }
    // Fallback: check the error string for common patterns
    if message.contains("NotFound") || message.contains("NoSuchKey") || message.contains("404") {
        return IoError::NotFound(location.to_string());
    }
    IoError::S3(message)
}

#[async_trait]
impl Source for S3Source {
    async fn stat(&self) -> Result<StatResult, IoError> {
        let head = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| {
                classify_error(
                    &self.location,
                    e.as_service_error().map(|se| se.is_not_found()).unwrap_or(false),
                    e.raw_response().map(|r| r.status().as_u16()),
                    e.to_string(),
                )
            })?;

        let last_modified = head.last_modified().and_then(|dt| {
            let secs = u64::try_from(dt.secs()).ok()?;
            Some(UNIX_EPOCH + Duration::new(secs, dt.subsec_nanos()))
        });

        Ok(StatResult {
            last_modified,
            length: head.content_length().and_then(|l| u64::try_from(l).ok()),
        })
    }

    async fn read(&self) -> Result<Bytes, IoError> {
        let resp = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&self.key)
            .send()
            .await
            .map_err(|e| {
                classify_error(
                    &self.location,
                    e.as_service_error().map(|se| se.is_no_such_key()).unwrap_or(false),
                    e.raw_response().map(|r| r.status().as_u16()),
                    e.to_string(),
                )
            })?;

        let data = resp
            .body
            .collect()
            .await
            .map_err(|e| IoError::Connection(e.to_string()))?
            .into_bytes();

        Ok(data)
    }

    fn location(&self) -> &str {
        &self.location
    }
}

/// Create an S3 client with optional custom endpoint and region.
///
/// Use a custom endpoint for S3-compatible services like MinIO:
/// ```ignore
/// let client = create_s3_client(Some("http://localhost:9000"), "us-east-1").await;
/// ```
pub async fn create_s3_client(endpoint_url: Option<&str>, region: &str) -> Client {
    let region = aws_config::Region::new(region.to_string());
    let mut config_loader =
        aws_config::defaults(aws_config::BehaviorVersion::latest()).region(region);

    if let Some(endpoint) = endpoint_url {
        config_loader = config_loader.endpoint_url(endpoint);
    }

    let sdk_config = config_loader.load().await;

    // S3-compatible services generally need path-style addressing
    let s3_config = aws_sdk_s3::config::Builder::from(&sdk_config)
        .force_path_style(endpoint_url.is_some())
        .build();

    Client::from_conf(s3_config)
}
