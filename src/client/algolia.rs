//! Algolia REST client (blocking)
//!
//! Writes go to `{app}.algolia.net`, reads to `{app}-dsn.algolia.net`, and both
//! fall back to `{app}-{1,2,3}.algolianet.com`. Retries rotate through the
//! hosts with the backoff of the configured [`RetryPolicy`].

use super::{BatchOperation, RemoteError, RemoteErrorKind, RetryPolicy, SearchClient};
use crate::index::Record;
use reqwest::blocking::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

/// Records per browse page (the API maximum)
const BROWSE_PAGE_SIZE: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CallType {
    Read,
    Write,
}

#[derive(Debug, Deserialize)]
struct BrowseResponse {
    #[serde(default)]
    hits: Vec<Record>,
    #[serde(default)]
    cursor: Option<String>,
}

pub struct AlgoliaClient {
    app_id: String,
    api_key: String,
    user_agent: String,
    http: Client,
    retry: RetryPolicy,
    read_hosts: Vec<String>,
    write_hosts: Vec<String>,
}

impl std::fmt::Debug for AlgoliaClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlgoliaClient")
            .field("app_id", &self.app_id)
            .field("user_agent", &self.user_agent)
            .finish_non_exhaustive()
    }
}

impl AlgoliaClient {
    pub fn new(
        app_id: &str,
        api_key: &str,
        user_agent: String,
        retry: RetryPolicy,
    ) -> Result<Self, RemoteError> {
        let http = Client::builder()
            .connect_timeout(retry.connect_timeout)
            .build()
            .map_err(|e| {
                RemoteError::new(
                    RemoteErrorKind::Network,
                    format!("failed to create HTTP client: {}", e),
                )
            })?;

        let (read_hosts, write_hosts) = default_hosts(app_id);

        Ok(Self {
            app_id: app_id.to_string(),
            api_key: api_key.to_string(),
            user_agent,
            http,
            retry,
            read_hosts,
            write_hosts,
        })
    }

    pub fn app_id(&self) -> &str {
        &self.app_id
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// Send a request, retrying retryable failures on the next host
    fn request(
        &self,
        call: CallType,
        path: &str,
        body: &Value,
    ) -> Result<Value, RemoteError> {
        let (hosts, timeout) = match call {
            CallType::Read => (&self.read_hosts, self.retry.read_timeout),
            CallType::Write => (&self.write_hosts, self.retry.write_timeout),
        };

        let mut last_error = RemoteError::new(RemoteErrorKind::Network, "no attempt made");
        for attempt in 0..self.retry.max_attempts {
            if attempt > 0 {
                let delay = self.retry.backoff(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying Algolia request"
                );
                std::thread::sleep(delay);
            }

            let host = &hosts[attempt as usize % hosts.len()];
            match self.send_once(host, path, body, timeout) {
                Ok(value) => return Ok(value),
                Err(e) if e.kind.is_retryable() => {
                    warn!(
                        host = %host,
                        path = %path,
                        attempt = attempt + 1,
                        max_attempts = self.retry.max_attempts,
                        error = %e,
                        "Algolia request failed"
                    );
                    last_error = e;
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error)
    }

    fn send_once(
        &self,
        host: &str,
        path: &str,
        body: &Value,
        timeout: Duration,
    ) -> Result<Value, RemoteError> {
        let url = format!("https://{}{}", host, path);
        let response = self
            .http
            .post(&url)
            .header("X-Algolia-Application-Id", &self.app_id)
            .header("X-Algolia-API-Key", &self.api_key)
            .header(reqwest::header::USER_AGENT, &self.user_agent)
            .timeout(timeout)
            .json(body)
            .send()
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let message = response
                .json::<Value>()
                .ok()
                .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(String::from))
                .unwrap_or_else(|| status.to_string());
            return Err(RemoteError::with_status(status.as_u16(), message));
        }

        response
            .json::<Value>()
            .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))
    }
}

impl SearchClient for AlgoliaClient {
    fn save_objects(&self, index_name: &str, records: &[Record]) -> Result<(), RemoteError> {
        let operations: Vec<BatchOperation> =
            records.iter().cloned().map(BatchOperation::Upsert).collect();
        self.batch(index_name, &operations)
    }

    fn delete_objects(&self, index_name: &str, object_ids: &[String]) -> Result<(), RemoteError> {
        let operations: Vec<BatchOperation> =
            object_ids.iter().map(BatchOperation::delete).collect();
        self.batch(index_name, &operations)
    }

    fn batch(&self, index_name: &str, operations: &[BatchOperation]) -> Result<(), RemoteError> {
        if operations.is_empty() {
            return Ok(());
        }
        let path = index_path(index_name, "batch");
        let body = json!({ "requests": operations });
        self.request(CallType::Write, &path, &body)?;
        debug!(index = %index_name, operations = operations.len(), "Batch sent");
        Ok(())
    }

    fn browse(&self, index_name: &str) -> Result<Vec<Record>, RemoteError> {
        let path = index_path(index_name, "browse");
        let mut records = Vec::new();
        let mut cursor: Option<String> = None;

        loop {
            let body = match &cursor {
                Some(c) => json!({ "cursor": c }),
                None => json!({
                    "hitsPerPage": BROWSE_PAGE_SIZE,
                    "attributesToHighlight": [],
                    "attributesToSnippet": []
                }),
            };
            let value = match self.request(CallType::Read, &path, &body) {
                Ok(v) => v,
                Err(e) if e.kind == RemoteErrorKind::NotFound => return Ok(Vec::new()),
                Err(e) => return Err(e),
            };
            let page: BrowseResponse = serde_json::from_value(value)
                .map_err(|e| RemoteError::new(RemoteErrorKind::Decode, e.to_string()))?;
            records.extend(page.hits.into_iter().map(|mut hit| {
                hit.strip_engine_attributes();
                hit
            }));

            match page.cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => break,
            }
        }

        Ok(records)
    }
}

/// Read hosts and write hosts for an application, primary first
fn default_hosts(app_id: &str) -> (Vec<String>, Vec<String>) {
    let app = app_id.to_lowercase();
    let fallbacks: Vec<String> = (1..=3)
        .map(|n| format!("{}-{}.algolianet.com", app, n))
        .collect();

    let mut read = vec![format!("{}-dsn.algolia.net", app)];
    read.extend(fallbacks.iter().cloned());
    let mut write = vec![format!("{}.algolia.net", app)];
    write.extend(fallbacks);
    (read, write)
}

fn classify_transport_error(e: reqwest::Error) -> RemoteError {
    let kind = if e.is_timeout() {
        RemoteErrorKind::Timeout
    } else {
        RemoteErrorKind::Network
    };
    RemoteError::new(kind, e.to_string())
}

/// `/1/indexes/{name}/{action}` with the index name percent-encoded
fn index_path(index_name: &str, action: &str) -> String {
    format!("/1/indexes/{}/{}", urlencoding::encode(index_name), action)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_hosts() {
        let (read, write) = default_hosts("ABC123");
        assert_eq!(read[0], "abc123-dsn.algolia.net");
        assert_eq!(write[0], "abc123.algolia.net");
        assert_eq!(read.len(), 4);
        assert_eq!(write[3], "abc123-3.algolianet.com");
    }

    #[test]
    fn test_index_path_encodes_name() {
        assert_eq!(index_path("wp_posts_post", "batch"), "/1/indexes/wp_posts_post/batch");
        assert_eq!(
            index_path("wp posts/é", "browse"),
            "/1/indexes/wp%20posts%2F%C3%A9/browse"
        );
    }

    #[test]
    fn test_browse_response_parses_hits() {
        let value = json!({
            "hits": [{"objectID": "post_1", "post_title": "A"}],
            "cursor": "abc"
        });
        let page: BrowseResponse = serde_json::from_value(value).unwrap();
        assert_eq!(page.hits[0].object_id, "post_1");
        assert_eq!(page.cursor.as_deref(), Some("abc"));
    }

    #[test]
    fn test_empty_batch_makes_no_request() {
        let client = AlgoliaClient::new(
            "APP",
            "KEY",
            "test".to_string(),
            RetryPolicy::default(),
        )
        .unwrap();
        assert!(client.batch("wp_users", &[]).is_ok());
    }
}
