//! Delivery to an SMTP relay, normally the local MTA.

use super::sender::{sanitize_header_value, SendError, Sender};
use anyhow::Context;
use async_trait::async_trait;
use lettre::message::header::{ContentType, HeaderName, HeaderValue};
use lettre::message::Mailbox;
use lettre::transport::smtp::authentication::Credentials;
use lettre::transport::smtp::extension::ClientId;
use lettre::{AsyncSmtpTransport, AsyncTransport, Message, Tokio1Executor};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SmtpSenderConfig {
    pub host: String,
    pub port: u16,
    pub helo: String,
    pub from_address: String,
    pub username: Option<String>,
    /// Environment variable holding the SMTP password.
    pub password_env: Option<String>,
}

impl Default for SmtpSenderConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 25,
            helo: "fence-relay.localdomain".to_string(),
            from_address: "fence-relay@relay.localdomain".to_string(),
            username: None,
            password_env: None,
        }
    }
}

pub struct SmtpSender {
    transport: AsyncSmtpTransport<Tokio1Executor>,
    from: Mailbox,
}

impl SmtpSender {
    /// The relay is reached without TLS; point it at a trusted local MTA.
    pub fn from_config(config: &SmtpSenderConfig, timeout: Duration) -> anyhow::Result<Self> {
        let from: Mailbox = config
            .from_address
            .parse()
            .map_err(|e| anyhow::anyhow!("smtp from address is invalid: {e}"))?;

        let mut builder = AsyncSmtpTransport::<Tokio1Executor>::builder_dangerous(&config.host)
            .port(config.port)
            .hello_name(ClientId::Domain(config.helo.clone()))
            .timeout(Some(timeout));

        if let Some(user) = &config.username {
            let var = config
                .password_env
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("smtp username set without password_env"))?;
            let password = std::env::var(var)
                .with_context(|| format!("environment variable {var} not set"))?;
            builder = builder.credentials(Credentials::new(user.clone(), password));
        }

        Ok(Self {
            transport: builder.build(),
            from,
        })
    }

    fn build_message(
        &self,
        recipient: &str,
        subject: &str,
        content: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<Message, SendError> {
        let to: Mailbox = recipient
            .parse()
            .map_err(|_| SendError::Config("recipient address is invalid".to_string()))?;

        let mut builder = Message::builder()
            .from(self.from.clone())
            .to(to)
            .subject(sanitize_header_value(subject))
            .header(ContentType::TEXT_PLAIN);

        for (name, value) in headers {
            let header = HeaderName::new_from_ascii(name.clone())
                .map_err(|_| SendError::Config(format!("invalid header name {name}")))?;
            builder = builder.raw_header(HeaderValue::new(header, sanitize_header_value(value)));
        }

        builder
            .body(content.to_string())
            .map_err(|e| SendError::Config(format!("message build failed: {e}")))
    }
}

#[async_trait]
impl Sender for SmtpSender {
    fn name(&self) -> &str {
        "smtp"
    }

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        content: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), SendError> {
        let message = self.build_message(recipient, subject, content, headers)?;

        match self.transport.send(message).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_permanent() => Err(SendError::Rejected(e.to_string())),
            Err(e) => Err(SendError::Transport(e.to_string())),
        }
    }
}
