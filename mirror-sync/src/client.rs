//! Server endpoint seam and its reqwest implementation

use crate::error::{SyncError, SyncResult};
use crate::protocol::{
    kind_segment, parse_push_response, parse_snapshot_response, PushAck, PushBody, PushError,
    SnapshotData,
};
use async_trait::async_trait;
use chrono::Utc;
use mirror_store::EntityKind;
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Sync endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Server base URL
    #[serde(default = "default_server_url")]
    pub server_url: String,
    /// Bearer token; requests go out without one when unset
    #[serde(default)]
    pub auth_token: Option<String>,
}

fn default_server_url() -> String {
    "http://localhost:3000".to_string()
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            auth_token: None,
        }
    }
}

/// How a record is sent to the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushAction {
    Create,
    Update { server_id: String },
}

/// The server side of synchronization
#[async_trait]
pub trait ServerEndpoint: Send + Sync {
    /// Fetch the current snapshot
    async fn fetch_snapshot(&self) -> SyncResult<SnapshotData>;

    /// Push one record
    async fn push_record(
        &self,
        kind: EntityKind,
        action: &PushAction,
        body: &PushBody,
    ) -> Result<PushAck, PushError>;
}

/// `ServerEndpoint` over HTTP
pub struct HttpServerEndpoint {
    config: SyncConfig,
    base: Url,
    client: reqwest::Client,
}

impl HttpServerEndpoint {
    pub fn new(config: SyncConfig) -> SyncResult<Self> {
        let base = Url::parse(&config.server_url)
            .map_err(|e| SyncError::Network(format!("Invalid server URL {}: {}", config.server_url, e)))?;
        let client = reqwest::Client::builder()
            .build()
            .map_err(|e| SyncError::Network(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            base,
            client,
        })
    }

    /// `{server_url}/api/offline-sync/{segments...}`
    fn route(&self, segments: &[&str]) -> SyncResult<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| SyncError::Network(format!("Server URL cannot be a base: {}", self.base)))?
            .pop_if_empty()
            .extend(["api", "offline-sync"])
            .extend(segments);
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.config.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[async_trait]
impl ServerEndpoint for HttpServerEndpoint {
    async fn fetch_snapshot(&self) -> SyncResult<SnapshotData> {
        let url = self.route(&[])?;
        let stamp = Utc::now().timestamp_millis().to_string();

        tracing::debug!(url = %url, "Fetching snapshot");

        let response = self
            .authorize(self.client.get(url).query(&[("t", stamp)]))
            .send()
            .await?;
        let status = response.status().as_u16();
        let body = response.text().await?;

        parse_snapshot_response(status, &body)
    }

    async fn push_record(
        &self,
        kind: EntityKind,
        action: &PushAction,
        body: &PushBody,
    ) -> Result<PushAck, PushError> {
        let segment = kind_segment(kind);
        let request = match action {
            PushAction::Create => {
                let url = self.route(&[segment]).map_err(|e| PushError::Network(e.to_string()))?;
                self.client.post(url)
            }
            PushAction::Update { server_id } => {
                let url = self
                    .route(&[segment, server_id.as_str()])
                    .map_err(|e| PushError::Network(e.to_string()))?;
                self.client.put(url)
            }
        };

        let response = self
            .authorize(request.json(body))
            .send()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| PushError::Network(e.to_string()))?;

        parse_push_response(status, &text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_routes_are_built_under_offline_sync() {
        let endpoint = HttpServerEndpoint::new(SyncConfig {
            server_url: "https://labdesk.test/".to_string(),
            auth_token: None,
        })
        .unwrap();

        assert_eq!(
            endpoint.route(&[]).unwrap().as_str(),
            "https://labdesk.test/api/offline-sync"
        );
        assert_eq!(
            endpoint.route(&["expense-types", "abc 1"]).unwrap().as_str(),
            "https://labdesk.test/api/offline-sync/expense-types/abc%201"
        );
    }

    #[test]
    fn test_invalid_server_url() {
        let result = HttpServerEndpoint::new(SyncConfig {
            server_url: "not a url".to_string(),
            auth_token: None,
        });
        assert!(matches!(result, Err(SyncError::Network(_))));
    }
}
