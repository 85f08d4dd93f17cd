//! REST surface used by the fetch layer.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;
use sync_core::{Fingerprint, SyncError, SyncErrorCategory};
use tracing::debug;
use url::Url;

/// Longest response body excerpt carried in an error message.
const ERROR_BODY_EXCERPT: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestMethod {
    Get,
    Post,
    Delete,
}

impl RestMethod {
    /// Whether the request changes server state.
    pub fn is_mutation(self) -> bool {
        !matches!(self, Self::Get)
    }

    fn as_reqwest(self) -> reqwest::Method {
        match self {
            Self::Get => reqwest::Method::GET,
            Self::Post => reqwest::Method::POST,
            Self::Delete => reqwest::Method::DELETE,
        }
    }
}

/// One REST call relative to the API base URL.
#[derive(Debug, Clone, PartialEq)]
pub struct RestRequest {
    pub method: RestMethod,
    /// Path relative to the base URL, e.g. `notifications/`.
    pub path: String,
    pub params: Vec<(String, String)>,
    pub body: Option<Value>,
}

impl RestRequest {
    pub fn get(path: impl Into<String>) -> Self {
        Self::new(RestMethod::Get, path)
    }

    pub fn post(path: impl Into<String>, body: Value) -> Self {
        Self {
            body: Some(body),
            ..Self::new(RestMethod::Post, path)
        }
    }

    pub fn delete(path: impl Into<String>) -> Self {
        Self::new(RestMethod::Delete, path)
    }

    fn new(method: RestMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            params: Vec::new(),
            body: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.params.push((key.into(), value.to_string()));
        self
    }

    /// Cache key for this request: path plus sorted parameters.
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint::new(
            self.path.clone(),
            self.params.iter().map(|(k, v)| (k.clone(), v.clone())),
        )
    }
}

/// Executes REST requests and returns the decoded JSON body.
///
/// Non-2xx responses map to [`SyncError::http`]; transport failures map to
/// network errors. An empty body decodes to `Value::Null`.
#[async_trait]
pub trait RestApi: Send + Sync {
    async fn execute(&self, request: &RestRequest) -> Result<Value, SyncError>;
}

/// reqwest-backed [`RestApi`].
#[derive(Debug, Clone)]
pub struct HttpRestClient {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl HttpRestClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, SyncError> {
        let mut base_url = Url::parse(base_url).map_err(|e| {
            SyncError::new(
                SyncErrorCategory::Config,
                "invalid_base_url",
                format!("{base_url}: {e}"),
            )
        })?;
        // Relative joins drop the last segment unless the base ends in '/'.
        if !base_url.path().ends_with('/') {
            let path = format!("{}/", base_url.path());
            base_url.set_path(&path);
        }

        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("sync-runtime/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| SyncError::new(SyncErrorCategory::Config, "http_client_init", e.to_string()))?;

        Ok(Self {
            client,
            base_url,
            bearer_token: None,
        })
    }

    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn url_for(&self, request: &RestRequest) -> Result<Url, SyncError> {
        let mut url = self.base_url.join(&request.path).map_err(|e| {
            SyncError::new(
                SyncErrorCategory::Internal,
                "invalid_request_path",
                format!("{}: {e}", request.path),
            )
        })?;
        if !request.params.is_empty() {
            url.query_pairs_mut().extend_pairs(request.params.iter());
        }
        Ok(url)
    }
}

#[async_trait]
impl RestApi for HttpRestClient {
    async fn execute(&self, request: &RestRequest) -> Result<Value, SyncError> {
        let url = self.url_for(request)?;
        debug!(method = ?request.method, %url, "rest request");

        let mut builder = self.client.request(request.method.as_reqwest(), url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = &request.body {
            builder = builder.json(body);
        }

        let response = builder.send().await.map_err(map_reqwest_error)?;
        let status = response.status();
        let text = response.text().await.map_err(map_reqwest_error)?;

        if !status.is_success() {
            return Err(SyncError::http(status.as_u16(), excerpt(&text)));
        }
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(&text).map_err(SyncError::from)
    }
}

fn map_reqwest_error(err: reqwest::Error) -> SyncError {
    if err.is_timeout() {
        SyncError::network("timeout", err.to_string())
    } else if err.is_connect() {
        SyncError::network("connect_failed", err.to_string())
    } else if let Some(status) = err.status() {
        SyncError::http(status.as_u16(), err.to_string())
    } else {
        SyncError::network("request_failed", err.to_string())
    }
}

fn excerpt(body: &str) -> String {
    match body.char_indices().nth(ERROR_BODY_EXCERPT) {
        Some((idx, _)) => format!("{}...", &body[..idx]),
        None => body.to_owned(),
    }
}
