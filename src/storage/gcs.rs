//! Google Cloud Storage blob store over the JSON API.
//!
//! Authentication is a bearer token read once from the environment variable
//! named by `storage.token_env`. Without one, requests go out anonymously,
//! which is what local emulators expect.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::Deserialize;
use url::Url;

use crate::error::{AppError, Result};
use crate::models::StorageConfig;
use crate::storage::{BlobStore, paths};

const DEFAULT_ENDPOINT: &str = "https://storage.googleapis.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListPage {
    #[serde(default)]
    items: Vec<ObjectMeta>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ObjectMeta {
    name: String,
}

/// GCS-based blob storage.
pub struct GcsStorage {
    client: Client,
    endpoint: Url,
    bucket: String,
    prefix: String,
    token: Option<String>,
}

impl GcsStorage {
    pub fn new(
        client: Client,
        endpoint: &str,
        bucket: impl Into<String>,
        prefix: impl Into<String>,
        token: Option<String>,
    ) -> Result<Self> {
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
            bucket: bucket.into(),
            prefix: prefix.into().trim_matches('/').to_string(),
            token,
        })
    }

    pub fn from_config(config: &StorageConfig) -> Result<Self> {
        if config.bucket.trim().is_empty() {
            return Err(AppError::config("storage.bucket is required for gcs"));
        }
        let token = std::env::var(&config.token_env)
            .ok()
            .filter(|t| !t.trim().is_empty());
        if token.is_none() {
            log::warn!(
                "{} is not set; GCS requests will be unauthenticated",
                config.token_env
            );
        }
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let endpoint = config.endpoint.as_deref().unwrap_or(DEFAULT_ENDPOINT);
        Self::new(client, endpoint, &config.bucket, &config.prefix, token)
    }

    fn object_name(&self, path: &str) -> String {
        if self.prefix.is_empty() {
            path.to_string()
        } else {
            format!("{}/{}", self.prefix, path)
        }
    }

    fn strip_name<'a>(&self, name: &'a str) -> &'a str {
        if self.prefix.is_empty() {
            name
        } else {
            name.strip_prefix(&self.prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .unwrap_or(name)
        }
    }

    /// `{endpoint}/{segments...}` with each segment percent-encoded, so a
    /// `/` inside an object name stays part of the name.
    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| AppError::config(format!("endpoint {} cannot be a base", self.endpoint)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn object_url(&self, path: &str) -> Result<Url> {
        let name = self.object_name(path);
        self.url(&["storage", "v1", "b", &self.bucket, "o", &name])
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    fn transport_error(path: &str, error: reqwest::Error) -> AppError {
        if error.is_timeout() || error.is_connect() || error.is_request() {
            AppError::transient(path, error)
        } else {
            AppError::Http(error)
        }
    }

    /// Map a non-success response to the store error taxonomy.
    async fn status_error(path: &str, response: Response) -> AppError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let message = format!("HTTP {}: {}", status, body.trim());
        match status {
            StatusCode::NOT_FOUND => AppError::not_found(path),
            StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
                AppError::transient(path, message)
            }
            s if s.is_server_error() => AppError::transient(path, message),
            _ => AppError::permanent(path, message),
        }
    }
}

#[async_trait]
impl BlobStore for GcsStorage {
    async fn get(&self, path: &str) -> Result<Vec<u8>> {
        paths::validate(path)?;
        let mut url = self.object_url(path)?;
        url.query_pairs_mut().append_pair("alt", "media");

        let response = self
            .authorize(self.client.get(url))
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(path, response).await);
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| Self::transport_error(path, e))?;
        Ok(bytes.to_vec())
    }

    async fn put(&self, path: &str, bytes: Vec<u8>) -> Result<()> {
        paths::validate(path)?;
        let len = bytes.len();
        let mut url = self.url(&["upload", "storage", "v1", "b", &self.bucket, "o"])?;
        url.query_pairs_mut()
            .append_pair("uploadType", "media")
            .append_pair("name", &self.object_name(path));

        let response = self
            .authorize(self.client.post(url))
            .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
            .body(bytes)
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;
        if !response.status().is_success() {
            return Err(Self::status_error(path, response).await);
        }

        log::debug!("Wrote {} bytes to gs://{}/{}", len, self.bucket, self.object_name(path));
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut url = self.url(&["storage", "v1", "b", &self.bucket, "o"])?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", &self.object_name(prefix));
                query.append_pair("fields", "items(name),nextPageToken");
                if let Some(token) = &page_token {
                    query.append_pair("pageToken", token);
                }
            }

            let response = self
                .authorize(self.client.get(url))
                .send()
                .await
                .map_err(|e| Self::transport_error(prefix, e))?;
            if !response.status().is_success() {
                return Err(Self::status_error(prefix, response).await);
            }
            let page: ListPage = response
                .json()
                .await
                .map_err(|e| Self::transport_error(prefix, e))?;

            names.extend(page.items.iter().map(|o| self.strip_name(&o.name).to_string()));
            match page.next_page_token {
                Some(token) if !token.is_empty() => page_token = Some(token),
                _ => break,
            }
        }

        names.sort();
        Ok(names)
    }

    async fn delete(&self, path: &str) -> Result<()> {
        paths::validate(path)?;
        let response = self
            .authorize(self.client.delete(self.object_url(path)?))
            .send()
            .await
            .map_err(|e| Self::transport_error(path, e))?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            return Ok(());
        }
        Err(Self::status_error(path, response).await)
    }

    fn describe(&self) -> String {
        format!("gs://{}/{}", self.bucket, self.prefix)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn storage(server: &MockServer, token: Option<&str>) -> GcsStorage {
        GcsStorage::new(
            Client::new(),
            &server.uri(),
            "crawl-state",
            "jobs",
            token.map(str::to_string),
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_get_encodes_object_name() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/crawl-state/o/jobs%2Fsite-A%2Fcheckpoint.json"))
            .and(query_param("alt", "media"))
            .and(header("authorization", "Bearer secret"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(b"{}".to_vec()))
            .expect(1)
            .mount(&server)
            .await;

        let gcs = storage(&server, Some("secret"));
        assert_eq!(gcs.get("site-A/checkpoint.json").await.unwrap(), b"{}");
    }

    #[tokio::test]
    async fn test_put_uses_media_upload() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/upload/storage/v1/b/crawl-state/o"))
            .and(query_param("uploadType", "media"))
            .and(query_param("name", "jobs/site-A/filter/0000000001.bin"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "name": "jobs/site-A/filter/0000000001.bin"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gcs = storage(&server, None);
        gcs.put("site-A/filter/0000000001.bin", vec![1, 2, 3])
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_list_follows_page_tokens() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/crawl-state/o"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "jobs/site-A/output/a.jsonl"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/storage/v1/b/crawl-state/o"))
            .and(query_param("prefix", "jobs/site-A/output/"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [{"name": "jobs/site-A/output/b.jsonl"}],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;

        let gcs = storage(&server, None);
        assert_eq!(
            gcs.list("site-A/output/").await.unwrap(),
            vec!["site-A/output/a.jsonl", "site-A/output/b.jsonl"]
        );
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/crawl-state/o/.*missing.*"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/crawl-state/o/.*busy.*"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/crawl-state/o/.*broken.*"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r"^/storage/v1/b/crawl-state/o/.*locked.*"))
            .respond_with(ResponseTemplate::new(403).set_body_string("denied"))
            .mount(&server)
            .await;

        let gcs = storage(&server, None);
        assert!(gcs.get("j/missing").await.unwrap_err().is_not_found());
        assert!(gcs.get("j/busy").await.unwrap_err().is_transient());
        assert!(gcs.get("j/broken").await.unwrap_err().is_transient());

        let err = gcs.get("j/locked").await.unwrap_err();
        assert!(matches!(err, AppError::PermanentStore { .. }));
        assert!(err.to_string().contains("denied"));
    }

    #[tokio::test]
    async fn test_delete_missing_is_ok() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let gcs = storage(&server, None);
        gcs.delete("site-A/filter/0000000001.bin").await.unwrap();
    }
}
