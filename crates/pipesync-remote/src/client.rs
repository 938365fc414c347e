//! HTTP client for the CRM record API
//!
//! A typed wrapper over `reqwest` speaking the CRM's wire protocol:
//! offset-paginated full listings, watermark-paginated change feeds, and
//! non-atomic batch updates. Every response's `X-RateLimit-Remaining`
//! header is folded into the shared [`RateBudget`] so the local count never
//! drifts from the remote's accounting.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use pipesync_core::domain::entity::FieldMap;

use crate::budget::RateBudget;

/// Header carrying the remote's remaining-call count
const RATE_REMAINING_HEADER: &str = "x-ratelimit-remaining";

/// Fallback wait when a 429 carries no Retry-After header
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Errors from the CRM wire protocol
#[derive(Debug, Error)]
pub enum RemoteError {
    /// Connection-level failure (DNS, TLS, timeout, read error)
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The remote rejected the request
    #[error("remote API error ({status}): {message}")]
    Api {
        status: StatusCode,
        message: String,
    },

    /// The change-feed cursor is past the remote's retention window
    #[error("change cursor expired on the remote")]
    CursorExpired,

    /// The remote throttled us despite the local budget
    #[error("remote rate limited, retry after {retry_after:?}")]
    RateLimited { retry_after: Duration },
}

// ============================================================================
// Wire types
// ============================================================================

/// One record as the remote serializes it
#[derive(Debug, Clone, Deserialize)]
pub struct RemoteRecordDto {
    /// Remote record identifier
    pub id: String,
    /// Raw field values under remote field names
    pub fields: FieldMap,
    /// Remote modification timestamp
    pub modified_at: DateTime<Utc>,
    /// Deletion marker in the change feed
    #[serde(default)]
    pub deleted: bool,
}

/// Page envelope for both listing endpoints
#[derive(Debug, Deserialize)]
pub struct RecordsPageDto {
    pub records: Vec<RemoteRecordDto>,
    #[serde(default)]
    pub total: Option<u64>,
    #[serde(default)]
    pub has_more: bool,
}

/// One record update in a batch push
#[derive(Debug, Serialize)]
pub struct UpdatePayload {
    pub id: String,
    pub fields: FieldMap,
}

/// Per-record outcome in a batch push response
#[derive(Debug, Deserialize)]
pub struct UpdateResultDto {
    pub id: String,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
struct BatchUpdateRequest<'a> {
    updates: &'a [UpdatePayload],
}

#[derive(Debug, Deserialize)]
struct BatchUpdateResponse {
    results: Vec<UpdateResultDto>,
}

// ============================================================================
// CrmHttpClient
// ============================================================================

/// Authenticated HTTP client for the CRM API
pub struct CrmHttpClient {
    client: Client,
    base_url: String,
    api_token: String,
    /// Shared budget to report remote rate headers into
    budget: Option<Arc<RateBudget>>,
}

impl CrmHttpClient {
    /// Creates a client for the given API base URL and bearer token
    pub fn new(
        base_url: impl Into<String>,
        api_token: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self, RemoteError> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
            api_token: api_token.into(),
            budget: None,
        })
    }

    /// Attaches the shared rate budget for header observation
    pub fn with_budget(mut self, budget: Arc<RateBudget>) -> Self {
        self.budget = Some(budget);
        self
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let url = format!("{}{}", self.base_url, path);
        self.client
            .request(method, &url)
            .bearer_auth(&self.api_token)
    }

    /// Folds rate headers into the budget and maps error statuses
    async fn check(&self, response: Response) -> Result<Response, RemoteError> {
        if let Some(budget) = &self.budget {
            if let Some(remaining) = response
                .headers()
                .get(RATE_REMAINING_HEADER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u32>().ok())
            {
                budget.observe(remaining);
            }
        }

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = response
                .headers()
                .get("retry-after")
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.trim().parse::<u64>().ok())
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_RETRY_AFTER);
            warn!(retry_after_secs = retry_after.as_secs(), "remote throttled us");
            return Err(RemoteError::RateLimited { retry_after });
        }

        if status == StatusCode::GONE {
            return Err(RemoteError::CursorExpired);
        }

        let message = response.text().await.unwrap_or_default();
        Err(RemoteError::Api { status, message })
    }

    /// Fetches one page of the full record listing
    ///
    /// `GET /records?offset=&limit=` — the remote orders records stably, so
    /// offsets are a valid resume position within one traversal.
    pub async fn fetch_full_page(
        &self,
        offset: u64,
        limit: u32,
    ) -> Result<RecordsPageDto, RemoteError> {
        debug!(offset, limit, "fetching full listing page");
        let response = self
            .request(Method::GET, "/records")
            .query(&[("offset", offset.to_string()), ("limit", limit.to_string())])
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    /// Fetches one page of the change feed
    ///
    /// `GET /records/changes?since=&after_id=&limit=` — records modified at
    /// or after `since`, ordered by (modified_at, id). `after_id` breaks
    /// ties when a page boundary falls inside one timestamp.
    pub async fn fetch_changes_page(
        &self,
        since: DateTime<Utc>,
        after_id: Option<&str>,
        limit: u32,
    ) -> Result<RecordsPageDto, RemoteError> {
        debug!(%since, after_id, limit, "fetching change feed page");
        let mut query = vec![
            ("since", since.to_rfc3339()),
            ("limit", limit.to_string()),
        ];
        if let Some(id) = after_id {
            query.push(("after_id", id.to_string()));
        }
        let response = self
            .request(Method::GET, "/records/changes")
            .query(&query)
            .send()
            .await?;
        let response = self.check(response).await?;
        Ok(response.json().await?)
    }

    /// Pushes a batch of record updates
    ///
    /// `POST /records/batch` — the remote applies updates independently and
    /// reports one result per record.
    pub async fn push_updates(
        &self,
        updates: &[UpdatePayload],
    ) -> Result<Vec<UpdateResultDto>, RemoteError> {
        debug!(count = updates.len(), "pushing record updates");
        let response = self
            .request(Method::POST, "/records/batch")
            .json(&BatchUpdateRequest { updates })
            .send()
            .await?;
        let response = self.check(response).await?;
        let body: BatchUpdateResponse = response.json().await?;
        Ok(body.results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> CrmHttpClient {
        CrmHttpClient::new(server.uri(), "test-token", Duration::from_secs(5)).unwrap()
    }

    #[tokio::test]
    async fn test_fetch_full_page_parses_envelope() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records"))
            .and(query_param("offset", "0"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [
                    {"id": "opp-1", "fields": {"StageName": "Proposal"},
                     "modified_at": "2026-03-01T10:00:00Z"}
                ],
                "total": 12000,
                "has_more": true
            })))
            .mount(&server)
            .await;

        let page = client(&server).fetch_full_page(0, 5000).await.unwrap();
        assert_eq!(page.records.len(), 1);
        assert_eq!(page.records[0].id, "opp-1");
        assert!(!page.records[0].deleted);
        assert_eq!(page.total, Some(12000));
        assert!(page.has_more);
    }

    #[tokio::test]
    async fn test_change_feed_deletion_marker() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/changes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "records": [
                    {"id": "opp-9", "fields": {},
                     "modified_at": "2026-03-02T08:00:00Z", "deleted": true}
                ],
                "has_more": false
            })))
            .mount(&server)
            .await;

        let page = client(&server)
            .fetch_changes_page(Utc::now(), None, 100)
            .await
            .unwrap();
        assert!(page.records[0].deleted);
        assert_eq!(page.total, None);
    }

    #[tokio::test]
    async fn test_gone_maps_to_cursor_expired() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records/changes"))
            .respond_with(ResponseTemplate::new(410))
            .mount(&server)
            .await;

        let err = client(&server)
            .fetch_changes_page(Utc::now(), None, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::CursorExpired));
    }

    #[tokio::test]
    async fn test_429_maps_to_rate_limited_with_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "7"))
            .mount(&server)
            .await;

        let err = client(&server).fetch_full_page(0, 10).await.unwrap_err();
        match err {
            RemoteError::RateLimited { retry_after } => {
                assert_eq!(retry_after, Duration::from_secs(7));
            }
            other => panic!("expected RateLimited, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rate_header_observed_into_budget() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/records"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("X-RateLimit-Remaining", "42")
                    .set_body_json(json!({"records": [], "has_more": false})),
            )
            .mount(&server)
            .await;

        let budget = Arc::new(RateBudget::new(
            1000,
            Duration::from_secs(600),
            20,
            Duration::from_millis(0),
        ));
        let client = client(&server).with_budget(Arc::clone(&budget));
        client.fetch_full_page(0, 10).await.unwrap();
        assert_eq!(budget.remaining(), 42);
    }

    #[tokio::test]
    async fn test_push_updates_returns_per_record_results() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/records/batch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [
                    {"id": "opp-1"},
                    {"id": "opp-2", "error": "validation failed: stage"}
                ]
            })))
            .mount(&server)
            .await;

        let updates = vec![UpdatePayload {
            id: "opp-1".to_string(),
            fields: FieldMap::new(),
        }];
        let results = client(&server).push_updates(&updates).await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results[0].error.is_none());
        assert_eq!(results[1].error.as_deref(), Some("validation failed: stage"));
    }
}
