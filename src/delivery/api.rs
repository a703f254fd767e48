//! Delivery through an HTTP mail API.

use super::sender::{SendError, Sender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiSenderConfig {
    pub endpoint: String,
    pub from_address: String,
    /// Environment variable holding the bearer token.
    #[serde(default)]
    pub api_key_env: Option<String>,
}

#[derive(Serialize)]
struct ApiPayload<'a> {
    from: &'a str,
    to: &'a str,
    subject: &'a str,
    text: &'a str,
    headers: &'a BTreeMap<String, String>,
}

pub struct ApiSender {
    client: reqwest::Client,
    endpoint: url::Url,
    from_address: String,
    api_key: Option<String>,
}

impl ApiSender {
    pub fn from_config(config: &ApiSenderConfig, timeout: Duration) -> anyhow::Result<Self> {
        let endpoint = url::Url::parse(&config.endpoint)
            .map_err(|e| anyhow::anyhow!("invalid delivery endpoint: {e}"))?;
        if !matches!(endpoint.scheme(), "http" | "https") {
            anyhow::bail!("delivery endpoint must be http or https");
        }
        let api_key = config
            .api_key_env
            .as_deref()
            .and_then(|var| std::env::var(var).ok());
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            endpoint,
            from_address: config.from_address.clone(),
            api_key,
        })
    }
}

#[async_trait]
impl Sender for ApiSender {
    fn name(&self) -> &str {
        "api"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        content: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        let payload = ApiPayload {
            from: &self.from_address,
            to: recipient,
            subject,
            text: content,
            headers,
        };

        let mut builder = self.client.post(self.endpoint.clone()).json(&payload);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let response = builder
            .send()
            .await
            .map_err(|e| SendError::Transport(e.without_url().to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else if status.is_client_error() {
            Err(SendError::Rejected(format!("HTTP status {status}")))
        } else {
            Err(SendError::Transport(format!("HTTP status {status}")))
        }
    }
}
