//! Remote index backend over HTTP.
//!
//! ```text
//! Add / Update  ->  PUT    {endpoint}/documents/{type}/{id}[?routing=..]   body: {"action", "document"}
//! Delete        ->  DELETE {endpoint}/documents/{type}/{id}[?routing=..]
//! ```
//!
//! Deleting a document the backend does not have counts as success.
//!
//! Every write carries `version`, the highest outbox sequence id behind the
//! operation. A backend that versions documents answers `409 Conflict` when it
//! already holds a newer one; that is reported as [`IndexErrorKind::Fenced`].

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode, Url};
use serde::{Deserialize, Serialize};

use super::{default_mapper, DocumentMapper, IndexError, IndexErrorKind, IndexWriter};
use crate::coalesce::{CoalescedOperation, IndexAction};
use crate::error::RelayError;

/// Remote index endpoint settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpIndexConfig {
    #[serde(default = "default_name")]
    pub name: String,

    /// Base URL of the index service
    pub endpoint: String,

    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Sent as a bearer token when set
    #[serde(default)]
    pub api_key: Option<String>,
}

fn default_name() -> String { "http".to_string() }
fn default_request_timeout() -> Duration { Duration::from_secs(5) }

#[derive(Debug, Serialize)]
struct DocumentRequest<'a> {
    action: IndexAction,
    document: serde_json::Value,
    source_events: Vec<i64>,
    version: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    routing_key: Option<&'a str>,
}

/// [`IndexWriter`] posting documents to a remote service.
pub struct HttpIndexWriter {
    name: String,
    client: Client,
    endpoint: Url,
    api_key: Option<String>,
    mapper: DocumentMapper,
}

impl HttpIndexWriter {
    pub fn new(config: HttpIndexConfig) -> crate::error::Result<Self> {
        let endpoint = Url::parse(&config.endpoint).map_err(|e| {
            RelayError::configuration(format!("invalid index endpoint '{}': {}", config.endpoint, e))
        })?;
        if endpoint.cannot_be_a_base() {
            return Err(RelayError::configuration(format!(
                "index endpoint '{}' cannot be used as a base URL",
                config.endpoint
            )));
        }

        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            name: config.name,
            client,
            endpoint,
            api_key: config.api_key,
            mapper: default_mapper(),
        })
    }

    pub fn with_mapper(mut self, mapper: DocumentMapper) -> Self {
        self.mapper = mapper;
        self
    }

    fn document_url(&self, operation: &CoalescedOperation) -> Result<Url, IndexError> {
        let mut url = self.endpoint.clone();
        url.path_segments_mut()
            .map_err(|_| IndexError::malformed("index endpoint cannot be a base URL"))?
            .pop_if_empty()
            .extend([
                "documents",
                operation.entity.entity_type.as_str(),
                operation.entity.entity_id.as_str(),
            ]);
        if let Some(routing) = &operation.routing_key {
            url.query_pairs_mut().append_pair("routing", routing);
        }
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key),
            None => request,
        }
    }
}

/// Map an HTTP status to the index error taxonomy.
pub fn classify_status(status: StatusCode) -> IndexErrorKind {
    match status {
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => IndexErrorKind::Timeout,
        StatusCode::TOO_MANY_REQUESTS => IndexErrorKind::Overloaded,
        StatusCode::CONFLICT => IndexErrorKind::Fenced,
        StatusCode::BAD_REQUEST | StatusCode::UNPROCESSABLE_ENTITY | StatusCode::PAYLOAD_TOO_LARGE => {
            IndexErrorKind::Malformed
        }
        s if s.is_server_error() => IndexErrorKind::Unavailable,
        _ => IndexErrorKind::Rejected,
    }
}

fn classify_transport(error: &reqwest::Error) -> IndexErrorKind {
    if error.is_timeout() {
        IndexErrorKind::Timeout
    } else if error.is_connect() {
        IndexErrorKind::Unavailable
    } else {
        IndexErrorKind::ConnectionReset
    }
}

#[async_trait]
impl IndexWriter for HttpIndexWriter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn apply(&self, operation: &CoalescedOperation) -> Result<(), IndexError> {
        let url = self.document_url(operation)?;

        let request = match operation.action {
            IndexAction::Delete => self.client.delete(url),
            IndexAction::Add | IndexAction::Update => {
                let body = DocumentRequest {
                    action: operation.action,
                    document: (self.mapper)(&operation.entity)?,
                    source_events: operation.source_events.iter().map(|id| id.0).collect(),
                    version: operation.source_events.iter().map(|id| id.0).max().unwrap_or_default(),
                    routing_key: operation.routing_key.as_deref(),
                };
                self.client.put(url).json(&body)
            }
        };

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| IndexError::new(classify_transport(&e), e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND && operation.action == IndexAction::Delete {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(IndexError::new(
            classify_status(status),
            format!("{} responded {}: {}", self.name, status, body),
        ))
    }

    async fn health_check(&self) -> bool {
        let Ok(url) = self.endpoint.join("health") else {
            return false;
        };
        match self.authorize(self.client.get(url)).send().await {
            Ok(response) => response.status().is_success(),
            Err(_) => false,
        }
    }
}
