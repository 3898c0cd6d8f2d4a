//! Server endpoint URLs.

use std::collections::BTreeMap;

use reqwest::Url;
use upptalk_settings::ServerSettings;

use crate::errors::ConnectionError;

/// Where the WebSocket and HTTP side channel live.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoint {
    host: String,
    port: u16,
    secure: bool,
    path: String,
    query: BTreeMap<String, String>,
}

impl Endpoint {
    /// Build from server settings; the API key joins the query.
    pub fn from_settings(settings: &ServerSettings) -> Self {
        Self {
            host: settings.host.clone(),
            port: settings.port,
            secure: settings.secure,
            path: settings.path.clone(),
            query: settings.effective_query(),
        }
    }

    /// Query parameters sent with every request.
    pub fn query(&self) -> &BTreeMap<String, String> {
        &self.query
    }

    /// `ws(s)://host:port/path?query`.
    pub fn websocket_url(&self) -> Result<Url, ConnectionError> {
        let scheme = if self.secure { "wss" } else { "ws" };
        self.build(scheme, &self.path)
    }

    /// `http(s)://host:port/path?query` for a side-channel request.
    pub fn http_url(&self, path: &str) -> Result<Url, ConnectionError> {
        let scheme = if self.secure { "https" } else { "http" };
        self.build(scheme, path)
    }

    /// `http(s)://host:port/path` without the query, for links handed to
    /// other users.
    pub fn resource_url(&self, path: &str) -> Result<Url, ConnectionError> {
        let mut url = self.http_url(path)?;
        url.set_query(None);
        Ok(url)
    }

    fn build(&self, scheme: &str, path: &str) -> Result<Url, ConnectionError> {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };
        let mut url = Url::parse(&format!("{scheme}://{}:{}{path}", self.host, self.port))
            .map_err(|e| ConnectionError::InvalidUrl(e.to_string()))?;
        if !self.query.is_empty() {
            let _ = url.query_pairs_mut().extend_pairs(self.query.iter());
        }
        Ok(url)
    }
}
