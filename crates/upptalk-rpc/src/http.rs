//! HTTP side channel for binary transfers outside the RPC stream.
//!
//! Requests carry the endpoint query (e.g. `apikey`) and, unless disabled
//! per request, HTTP basic auth built from the connection's credentials.

use std::time::Duration;

use bytes::Bytes;
use reqwest::{Body, Client, Method};
use serde_json::Value;
use tracing::{debug, instrument};
use upptalk_settings::HttpSettings;

use crate::actions::ProgressFn;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::errors::HttpError;

/// Upload chunk size used for progress reporting.
const CHUNK_SIZE: usize = 16 * 1024;

/// One side-channel request.
#[derive(Clone)]
pub struct HttpRequest {
    /// HTTP method.
    pub method: Method,
    /// Path on the endpoint host.
    pub path: String,
    /// Request body.
    pub body: Option<Bytes>,
    /// `Content-Type` of the body.
    pub content_type: Option<String>,
    /// Attach basic auth from the connection credentials.
    pub auth: bool,
    /// Upload progress.
    pub progress: Option<ProgressFn>,
}

impl HttpRequest {
    /// Authenticated `POST` of `body` to `path`.
    pub fn post(path: impl Into<String>, body: Bytes) -> Self {
        Self {
            method: Method::POST,
            path: path.into(),
            body: Some(body),
            content_type: None,
            auth: true,
            progress: None,
        }
    }

    /// Authenticated `GET` of `path`.
    pub fn get(path: impl Into<String>) -> Self {
        Self {
            method: Method::GET,
            path: path.into(),
            body: None,
            content_type: None,
            auth: true,
            progress: None,
        }
    }

    /// Skip basic auth.
    #[must_use]
    pub fn without_auth(mut self) -> Self {
        self.auth = false;
        self
    }

    /// Set the body content type.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Report upload progress.
    #[must_use]
    pub fn progress(mut self, progress: Option<ProgressFn>) -> Self {
        self.progress = progress;
        self
    }
}

impl std::fmt::Debug for HttpRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpRequest")
            .field("method", &self.method)
            .field("path", &self.path)
            .field("body", &self.body.as_ref().map(Bytes::len))
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

/// Client for the HTTP side channel.
#[derive(Clone, Debug)]
pub struct HttpSideChannel {
    client: Client,
    endpoint: Endpoint,
    settings: HttpSettings,
}

impl HttpSideChannel {
    /// Create a side channel for `endpoint`.
    pub fn new(endpoint: Endpoint, settings: HttpSettings) -> Result<Self, HttpError> {
        let client = Client::builder()
            .timeout(Duration::from_millis(settings.timeout_ms))
            .build()?;
        Ok(Self::with_client(client, endpoint, settings))
    }

    /// Create a side channel around an existing `reqwest` client.
    pub fn with_client(client: Client, endpoint: Endpoint, settings: HttpSettings) -> Self {
        Self {
            client,
            endpoint,
            settings,
        }
    }

    /// Path settings.
    pub fn settings(&self) -> &HttpSettings {
        &self.settings
    }

    /// Send `request` and parse the response body as JSON.
    ///
    /// An empty body yields `null`.
    pub async fn send(&self, conn: &Connection, request: HttpRequest) -> Result<Value, HttpError> {
        let text = self.send_text(conn, request).await?;
        if text.trim().is_empty() {
            return Ok(Value::Null);
        }
        Ok(serde_json::from_str(&text)?)
    }

    /// Send `request` and return the response body as text.
    #[instrument(skip_all, fields(method = %request.method, path = %request.path))]
    pub async fn send_text(&self, conn: &Connection, request: HttpRequest) -> Result<String, HttpError> {
        let url = self
            .endpoint
            .http_url(&request.path)
            .map_err(|e| HttpError::InvalidUrl(e.to_string()))?;

        let mut builder = self.client.request(request.method, url);
        if request.auth {
            if let Some(credentials) = conn.credentials() {
                builder = builder.basic_auth(credentials.username, Some(credentials.password));
            }
        }
        if let Some(content_type) = request.content_type {
            builder = builder.header(reqwest::header::CONTENT_TYPE, content_type);
        }
        if let Some(body) = request.body {
            builder = builder.body(progress_body(body, request.progress));
        }

        let response = builder.send().await?;
        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            return Err(HttpError::Status {
                status: status.as_u16(),
                body: text,
            });
        }
        debug!(status = status.as_u16(), bytes = text.len(), "side-channel response");
        Ok(text)
    }

    /// Public URL of a stored resource, e.g. an uploaded avatar.
    pub fn resource_url(&self, path: &str) -> Result<String, HttpError> {
        self.endpoint
            .resource_url(path)
            .map(String::from)
            .map_err(|e| HttpError::InvalidUrl(e.to_string()))
    }
}

/// Stream `body` in chunks, reporting progress as each chunk is handed off.
fn progress_body(body: Bytes, progress: Option<ProgressFn>) -> Body {
    let Some(progress) = progress else {
        return Body::from(body);
    };
    let chunks = split_chunks(&body, CHUNK_SIZE);
    let total = body.len() as u64;
    let mut sent = 0u64;
    let stream = futures::stream::iter(chunks.into_iter().map(move |chunk| {
        sent += chunk.len() as u64;
        progress(sent, total);
        Ok::<_, std::io::Error>(chunk)
    }));
    Body::wrap_stream(stream)
}

fn split_chunks(body: &Bytes, size: usize) -> Vec<Bytes> {
    (0..body.len())
        .step_by(size.max(1))
        .map(|start| body.slice(start..(start + size).min(body.len())))
        .collect()
}
