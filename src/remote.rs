use crate::destination::{PostResult, RemoteDestination};
use crate::gid::normalize_network_url;
use crate::model::{BlogId, ItemStatus, PostId};
use crate::post::PreparedPosts;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use indexmap::IndexMap;
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::time::Duration;
use tracing::debug;

pub const DISTRIBUTE_PATH: &str = "contentsync/v1/distribute";

pub fn item_status_path(item_id: i64) -> String {
    format!("contentsync/v1/items/{}/status", item_id)
}

/// Body of a distribution sent to another network.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RemoteDistribution {
    /// Network URL of the sender.
    pub origin: String,
    /// Distribution item ID on the sender.
    pub origin_id: i64,
    pub destination: RemoteDestination,
    pub posts: PreparedPosts,
}

/// Completion report for one blog of a remote distribution.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StatusReport {
    /// Network URL of the reporting side.
    pub network_url: String,
    pub blog_id: BlogId,
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub posts: IndexMap<PostId, PostResult>,
}

#[async_trait]
pub trait RemoteTransport: Send + Sync {
    /// Send a distribution; `None` when the remote gave no usable answer.
    async fn distribute_item(
        &self,
        network_url: &str,
        payload: &RemoteDistribution,
    ) -> Result<Option<Value>>;

    async fn report_item_status(&self, origin: &str, origin_id: i64, report: &StatusReport) -> Result<()>;
}

/// Error message for a failed remote answer, or `None` when the remote
/// accepted the distribution.
pub fn remote_response_error(response: Option<&Value>) -> Option<String> {
    match response {
        None | Some(Value::Null) => Some("no response from remote network".to_string()),
        Some(Value::Bool(false)) => Some("remote network rejected the distribution".to_string()),
        Some(Value::Object(body)) => match body.get("error") {
            None | Some(Value::Null) | Some(Value::Bool(false)) => None,
            Some(Value::String(message)) => Some(message.clone()),
            Some(Value::Object(err)) => Some(
                err.get("message")
                    .and_then(Value::as_str)
                    .map(str::to_string)
                    .unwrap_or_else(|| Value::Object(err.clone()).to_string()),
            ),
            Some(other) => Some(other.to_string()),
        },
        Some(_) => None,
    }
}

/// HTTP transport with a bearer token per network.
#[derive(Clone)]
pub struct RemoteClient {
    http: Client,
    tokens: HashMap<String, String>,
}

impl fmt::Debug for RemoteClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteClient")
            .field("networks", &self.tokens.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl RemoteClient {
    pub fn new(timeout: Duration, tokens: HashMap<String, String>) -> Result<Self> {
        let http = Client::builder()
            .user_agent("contentsync/0.1")
            .timeout(timeout)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            tokens: tokens
                .into_iter()
                .map(|(url, token)| (normalize_network_url(&url), token))
                .collect(),
        })
    }

    pub fn from_config(cfg: &crate::config::Config) -> Result<Self> {
        let tokens = cfg
            .remote
            .networks
            .iter()
            .map(|n| (n.url.clone(), n.token.clone()))
            .collect();
        Self::new(Duration::from_secs(cfg.remote.timeout_seconds), tokens)
    }

    pub fn http(&self) -> &Client {
        &self.http
    }

    pub fn build_request(&self, network_url: &str, path: &str, body: &Value) -> Result<reqwest::Request> {
        let network_url = normalize_network_url(network_url);
        let base = Url::parse(&format!("{}/", network_url))
            .with_context(|| format!("invalid network url {}", network_url))?;
        let endpoint = base.join(path).context("invalid endpoint path")?;
        let mut builder = self
            .http
            .post(endpoint)
            .header("Content-Type", "application/json")
            .json(body);
        if let Some(token) = self.tokens.get(&network_url) {
            builder = builder.header("Authorization", format!("Bearer {}", token));
        }
        builder.build().context("failed to build remote request")
    }

    async fn execute(&self, request: reqwest::Request) -> Result<Option<Value>> {
        debug!(method = %request.method(), url = %request.url(), "sending remote request");
        let url = request.url().clone();
        let res = self
            .http
            .execute(request)
            .await
            .with_context(|| format!("failed to reach {}", url))?;
        let status = res.status();
        debug!(%url, %status, "remote response");
        let text = res.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(anyhow!("remote error {}: {}", status, text));
        }
        if text.trim().is_empty() {
            return Ok(None);
        }
        serde_json::from_str(&text)
            .map(Some)
            .with_context(|| format!("invalid response from {}", url))
    }
}

#[async_trait]
impl RemoteTransport for RemoteClient {
    async fn distribute_item(
        &self,
        network_url: &str,
        payload: &RemoteDistribution,
    ) -> Result<Option<Value>> {
        let body = serde_json::to_value(payload)?;
        let request = self.build_request(network_url, DISTRIBUTE_PATH, &body)?;
        self.execute(request).await
    }

    async fn report_item_status(&self, origin: &str, origin_id: i64, report: &StatusReport) -> Result<()> {
        let body = serde_json::to_value(report)?;
        let request = self.build_request(origin, &item_status_path(origin_id), &body)?;
        self.execute(request).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_remote_answers() {
        assert!(remote_response_error(None).is_some());
        assert!(remote_response_error(Some(&Value::Null)).is_some());
        assert!(remote_response_error(Some(&json!(false))).is_some());
        assert_eq!(
            remote_response_error(Some(&json!({"error": "blog 9 missing"}))).as_deref(),
            Some("blog 9 missing")
        );
        assert_eq!(
            remote_response_error(Some(&json!({"error": {"message": "denied"}}))).as_deref(),
            Some("denied")
        );
        assert!(remote_response_error(Some(&json!({"error": ["a", "b"]}))).is_some());
        assert!(remote_response_error(Some(&json!({"status": "started"}))).is_none());
        assert!(remote_response_error(Some(&json!(true))).is_none());
    }

    #[test]
    fn build_request_targets_network_endpoint_with_token() {
        let mut tokens = HashMap::new();
        tokens.insert("https://remote.example/".to_string(), "secret".to_string());
        let client = RemoteClient::new(Duration::from_secs(5), tokens).unwrap();
        let request = client
            .build_request("https://remote.example", DISTRIBUTE_PATH, &json!({}))
            .unwrap();
        assert_eq!(request.method(), reqwest::Method::POST);
        assert_eq!(request.url().as_str(), "https://remote.example/contentsync/v1/distribute");
        assert_eq!(
            request
                .headers()
                .get("Authorization")
                .and_then(|h| h.to_str().ok()),
            Some("Bearer secret")
        );

        let other = client
            .build_request("https://other.example/sub", &item_status_path(4), &json!({}))
            .unwrap();
        assert_eq!(other.url().path(), "/sub/contentsync/v1/items/4/status");
        assert!(other.headers().get("Authorization").is_none());
    }
}
