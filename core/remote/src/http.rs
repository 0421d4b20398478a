//! HTTP client for the `/api/v2` CRUD endpoints.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;
use url::Url;

use sanctuary_common::{
    EntityId, Error, LibraryItem, LibraryPatch, ReaderSettings, ReadingSession, Result,
};

use crate::client::RemoteSyncClient;

const LIBRARY_PATH: &str = "/api/v2/library";
const SESSIONS_PATH: &str = "/api/v2/sessions";
const SETTINGS_PATH: &str = "/api/v2/settings";

/// Default per-request deadline.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Remote sync client speaking JSON over HTTP.
pub struct HttpRemoteClient {
    http: Client,
    base_url: Url,
    token: Option<String>,
    timeout: Duration,
}

impl HttpRemoteClient {
    /// Create a client for the API rooted at `base_url`.
    ///
    /// # Errors
    /// - `base_url` is not an absolute http(s) URL
    /// - HTTP client construction failed
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_timeout(base_url, DEFAULT_REQUEST_TIMEOUT)
    }

    /// Create a client with a custom per-request deadline.
    pub fn with_timeout(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| Error::InvalidInput(format!("Invalid API base URL {}: {}", base_url, e)))?;
        if !matches!(base_url.scheme(), "http" | "https") {
            return Err(Error::InvalidInput(format!(
                "Unsupported API scheme: {}",
                base_url.scheme()
            )));
        }

        let http = Client::builder()
            .user_agent("Sanctuary/0.1")
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http,
            base_url,
            token: None,
            timeout,
        })
    }

    /// Attach a bearer token to every request.
    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    fn endpoint(&self, path: &str) -> Result<Url> {
        self.base_url
            .join(path)
            .map_err(|e| Error::InvalidInput(format!("Invalid endpoint {}: {}", path, e)))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder, what: &str) -> Result<Response> {
        let response = self.authorize(request).send().await.map_err(|e| {
            if e.is_timeout() {
                Error::Timeout(self.timeout)
            } else {
                Error::Network(format!("Failed to {}: {}", what, e))
            }
        })?;

        let status = response.status();
        if status.is_success() {
            debug!("{} -> {}", what, status);
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        Err(Error::Remote {
            status: status.as_u16(),
            message: if body.is_empty() {
                format!("Failed to {}", what)
            } else {
                format!("Failed to {}: {}", what, body)
            },
        })
    }

    async fn read_json<T: DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("Failed to parse response: {}", e)))
    }
}

#[async_trait]
impl RemoteSyncClient for HttpRemoteClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn patch_library_item(&self, id: &EntityId, patch: &LibraryPatch) -> Result<()> {
        let url = self.endpoint(LIBRARY_PATH)?;
        let request = self
            .http
            .patch(url)
            .query(&[("id", id.as_str())])
            .json(patch);
        self.send(request, "update library item").await?;
        Ok(())
    }

    async fn save_session(&self, session: &ReadingSession) -> Result<()> {
        let url = self.endpoint(SESSIONS_PATH)?;
        self.send(self.http.post(url).json(session), "save session")
            .await?;
        Ok(())
    }

    async fn get_library(&self) -> Result<Vec<LibraryItem>> {
        let url = self.endpoint(LIBRARY_PATH)?;
        let response = self.send(self.http.get(url), "fetch library").await?;
        Self::read_json(response).await
    }

    async fn get_sessions(&self) -> Result<Vec<ReadingSession>> {
        let url = self.endpoint(SESSIONS_PATH)?;
        let response = self.send(self.http.get(url), "fetch sessions").await?;
        Self::read_json(response).await
    }

    async fn get_settings(&self) -> Result<Option<ReaderSettings>> {
        let url = self.endpoint(SETTINGS_PATH)?;
        let response = self.send(self.http.get(url), "fetch settings").await?;
        Self::read_json(response).await
    }

    async fn save_settings(&self, settings: &ReaderSettings) -> Result<()> {
        let url = self.endpoint(SETTINGS_PATH)?;
        self.send(self.http.put(url).json(settings), "save settings")
            .await?;
        Ok(())
    }
}
