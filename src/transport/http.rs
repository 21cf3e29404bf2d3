use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::{SyncError, SyncResult};
use crate::protocol::{decode_change_feed, decode_query_payload, ChangeFeed, QueryOutcome};

use super::Transport;

const DEFAULT_QUERY_TIMEOUT: Duration = Duration::from_secs(30);

/// Long-poll requests wait out the server-side timeout, so the client-side
/// limit has to be at least as generous.
const POLL_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP implementation of [`Transport`].
///
/// Statements go to `{base}/query` as a POST with form-encoded parameters;
/// change-feed polls go to `{base}/notify` as a GET with the event cursor.
pub struct HttpTransport {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

pub struct HttpTransportBuilder {
    base_url: String,
    token: Option<String>,
    query_timeout: Duration,
}

impl HttpTransportBuilder {
    pub fn new(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: None,
            query_timeout: DEFAULT_QUERY_TIMEOUT,
        }
    }

    pub fn bearer_token(mut self, token: &str) -> Self {
        self.token = Some(token.to_string());
        self
    }

    pub fn query_timeout(mut self, timeout: Duration) -> Self {
        self.query_timeout = timeout;
        self
    }

    pub fn build(self) -> SyncResult<HttpTransport> {
        let client = reqwest::Client::builder()
            .timeout(self.query_timeout)
            .pool_idle_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| SyncError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(HttpTransport {
            base_url: self.base_url,
            token: self.token,
            client,
        })
    }
}

impl HttpTransport {
    pub fn new(base_url: &str) -> SyncResult<Self> {
        HttpTransportBuilder::new(base_url).build()
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json(response: reqwest::Response) -> SyncResult<Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SyncError::Transport(format!("HTTP {}: {}", status, body)));
        }
        response
            .json()
            .await
            .map_err(|e| SyncError::InvalidData(format!("failed to parse response: {}", e)))
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn query(
        &self,
        statement: &str,
        parameters: &[(String, String)],
    ) -> SyncResult<QueryOutcome> {
        let body = serde_urlencoded::to_string(parameters)
            .map_err(|e| SyncError::argument("parameters", e.to_string()))?;

        let request = self
            .client
            .post(format!("{}/query", self.base_url))
            .query(&[("q", statement)])
            .header(reqwest::header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(body);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("query request failed: {}", e)))?;

        decode_query_payload(Self::read_json(response).await?)
    }

    async fn poll_changes(&self, last_event_id: i64) -> SyncResult<ChangeFeed> {
        let request = self
            .client
            .get(format!("{}/notify", self.base_url))
            .query(&[("lastEventId", last_event_id)])
            .timeout(POLL_TIMEOUT);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| SyncError::Transport(format!("change-feed request failed: {}", e)))?;

        decode_change_feed(Self::read_json(response).await?)
    }
}
