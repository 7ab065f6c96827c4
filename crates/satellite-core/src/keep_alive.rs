//! Keep-alive capability for satellites that sleep when idle.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tracing::{debug, trace};

use crate::types::SatelliteId;

#[async_trait]
pub trait KeepAlive: Send + Sync {
    /// Ask `target` (a device identifier) to stay awake.
    async fn keep_awake(&self, satellite: &SatelliteId, target: &str) -> anyhow::Result<()>;
}

/// Records keep-alive pings without contacting any device.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogKeepAlive;

#[async_trait]
impl KeepAlive for LogKeepAlive {
    async fn keep_awake(&self, satellite: &SatelliteId, target: &str) -> anyhow::Result<()> {
        trace!(satellite = %satellite, target, "Keep-alive");
        Ok(())
    }
}

/// Posts `{"target", "satellite"}` to a webhook for every ping.
#[derive(Debug, Clone)]
pub struct WebhookKeepAlive {
    client: reqwest::Client,
    url: String,
}

impl WebhookKeepAlive {
    pub fn new(url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl KeepAlive for WebhookKeepAlive {
    async fn keep_awake(&self, satellite: &SatelliteId, target: &str) -> anyhow::Result<()> {
        let response = self
            .client
            .post(&self.url)
            .json(&json!({ "target": target, "satellite": satellite }))
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("Keep-alive webhook returned {status}");
        }
        debug!(satellite = %satellite, target, "Keep-alive webhook delivered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_log_keep_alive_succeeds() {
        LogKeepAlive
            .keep_awake(&SatelliteId::new("kitchen"), "media_player.kitchen")
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_webhook_unreachable_is_error() {
        let hook = WebhookKeepAlive::new("http://127.0.0.1:9/keep-alive").unwrap();
        assert_eq!(hook.url(), "http://127.0.0.1:9/keep-alive");
        let result = hook
            .keep_awake(&SatelliteId::new("kitchen"), "media_player.kitchen")
            .await;
        assert!(result.is_err());
    }
}
