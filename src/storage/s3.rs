//! AWS S3 (and S3-compatible) blob store.
//!
//! Paths are stored as `{prefix}/{path}` inside one bucket. SDK failures are
//! split into transient (timeouts, dispatch failures, 5xx, throttling) and
//! permanent (everything else) so the retry layer only repeats what can
//! recover.

use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::config::http::HttpResponse;
use aws_sdk_s3::error::{DisplayErrorContext, ProvideErrorMetadata, SdkError};
use aws_sdk_s3::primitives::ByteStream;

use crate::error::{AppError, Result};
use crate::models::StorageConfig;
use crate::storage::{BlobStore, paths};

/// Error codes S3 uses for throttling and transient server trouble.
const TRANSIENT_CODES: &[&str] = &[
    "SlowDown",
    "Throttling",
    "ThrottlingException",
    "RequestTimeout",
    "RequestTimeTooSkewed",
    "InternalError",
    "ServiceUnavailable",
];

/// S3-based blob storage.
pub struct S3Storage {
    client: Client,
    bucket: String,
    prefix: String,
}

impl S3Storage {
    /// Create a new S3 storage instance.
    pub fn new(client: Client, bucket: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            client,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
        }
    }

    /// Create S3 storage from configuration, with credentials and region
    /// from the standard AWS environment chain.
    pub async fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(AppError::config("storage.bucket is required for s3"));
        }
        let sdk_config = aws_config::load_defaults(aws_config::BehaviorVersion::latest()).await;
        let mut builder = aws_sdk_s3::config::Builder::from(&sdk_config);
        if let Some(endpoint) = &config.endpoint {
            // S3-compatible stores generally want path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());
        Ok(Self::new(client, &config.bucket, &config.prefix))
    }

    fn key(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn strip_key<'a>(&self, key: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            key
        } else {
            key.strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(key)
        }
    }

    fn classify<E>(path: &str, err: SdkError<E, HttpResponse>) -> AppError
    where
        E: ProvideErrorMetadata + std::error::Error + Send + Sync + 'static,
    {
        let message = DisplayErrorContext(&err).to_string();
        match &err {
            SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) | SdkError::ResponseError(_) => {
                AppError::transient(path, message)
            }
            SdkError::ServiceError(service) => {
                let status = service.raw().status().as_u16();
                let code = service.err().code().unwrap_or_default();
                if status == 404 || code == "NoSuchKey" {
                    AppError::not_found(path)
                } else if status == 429 || status >= 500 || TRANSIENT_CODES.contains(&code) {
                    AppError::transient(path, message)
                } else {
                    AppError::permanent(path, message)
                }
            }
            _ => AppError::permanent(path, message),
        }
    }
}

#[async_trait]
impl BlobStore for S3Storage {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        paths::validate(path)?;
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| Self::classify(path, e))?;

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| AppError::transient(path, e))?;
        Ok(bytes.into_bytes().to_vec())
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        paths::validate(path)?;
        let len = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| Self::classify(path, e))?;

        log::debug!("Wrote {} bytes to s3://{}/{}", len, self.bucket, self.key(path));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut token: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(self.key(prefix))
                .set_continuation_token(token.take())
                .send()
                .await
                .map_err(|e| Self::classify(prefix, e))?;

            for object in output.contents() {
                if let Some(key) = object.key() {
                    keys.push(self.strip_key(key).to_string());
                }
            }

            match output.next_continuation_token() {
                Some(next) if output.is_truncated().unwrap_or(false) => {
                    token = Some(next.to_string());
                }
                _ => break,
            }
        }

        keys.sort();
        Ok(keys)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        paths::validate(path)?;
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(self.key(path))
            .send()
            .await
            .map_err(|e| Self::classify(path, e))?;

        log::debug!("Deleted s3://{}/{}", self.bucket, self.key(path));
        Ok(())
    }

    fn describe(&self) -> String {
        format!("s3://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn storage(prefix: &str) -> S3Storage {
        let config = aws_sdk_s3::Config::builder()
            .behavior_version(aws_sdk_s3::config::BehaviorVersion::latest())
            .region(aws_sdk_s3::config::Region::new("us-east-1"))
            .build();
        S3Storage::new(Client::from_conf(config), "crawl-state", prefix)
    }

    #[test]
    fn test_key_prefixing() {
        let s3 = storage("/jobs/");
        assert_eq!(s3.key("site-A/checkpoint.json"), "jobs/site-A/checkpoint.json");
        assert_eq!(s3.strip_key("jobs/site-A/checkpoint.json"), "site-A/checkpoint.json");
        assert_eq!(s3.describe(), "s3://crawl-state/jobs");
    }

    #[test]
    fn test_empty_prefix() {
        let s3 = storage("");
        assert_eq!(s3.key("site-A/filter/0000000001.bin"), "site-A/filter/0000000001.bin");
        assert_eq!(s3.strip_key("site-A/x"), "site-A/x");
    }
}
