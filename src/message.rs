//! Ephemeral message records.
//!
//! An [`EphemeralMessage`] lives only in memory. It is built once from an
//! [`InboundMessage`] and never mutated afterwards; the store hands out
//! shared references to it.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// TTLs beyond this are clamped (roughly ten years).
const MAX_TTL_SECONDS: i64 = 10 * 365 * 24 * 3600;

/// Inbound message as received from the ingestion layer.
#[derive(Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub id: Option<String>,
    pub sender: String,
    #[serde(default)]
    pub recipients: Vec<String>,
    #[serde(default)]
    pub subject: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub html_body: Option<String>,
    pub real_user: String,
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

#[derive(Clone)]
pub struct EphemeralMessage {
    id: String,
    sender: String,
    recipients: Vec<String>,
    subject: String,
    body: String,
    html_body: Option<String>,
    created_at: DateTime<Utc>,
    ttl_seconds: u64,
    real_user: String,
}

impl EphemeralMessage {
    /// Build from an inbound message, stamped with the current time.
    ///
    /// A missing id gets a fresh UUID; a missing TTL uses `default_ttl_seconds`.
    pub fn from_inbound(inbound: InboundMessage, default_ttl_seconds: u64) -> Self {
        Self::from_inbound_at(inbound, default_ttl_seconds, Utc::now())
    }

    pub fn from_inbound_at(
        inbound: InboundMessage,
        default_ttl_seconds: u64,
        created_at: DateTime<Utc>,
    ) -> Self {
        let id = inbound
            .id
            .filter(|id| !id.trim().is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        Self {
            id,
            sender: inbound.sender,
            recipients: inbound.recipients,
            subject: inbound.subject,
            body: inbound.body,
            html_body: inbound.html_body,
            created_at,
            ttl_seconds: inbound.ttl_seconds.unwrap_or(default_ttl_seconds),
            real_user: inbound.real_user,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn sender(&self) -> &str {
        &self.sender
    }

    pub fn recipients(&self) -> &[String] {
        &self.recipients
    }

    pub fn subject(&self) -> &str {
        &self.subject
    }

    pub fn body(&self) -> &str {
        &self.body
    }

    pub fn html_body(&self) -> Option<&str> {
        self.html_body.as_deref()
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn ttl_seconds(&self) -> u64 {
        self.ttl_seconds
    }

    pub fn real_user(&self) -> &str {
        &self.real_user
    }

    /// Age relative to `now`. Clock skew that puts `created_at` in the
    /// future yields a zero age.
    pub fn age(&self, now: DateTime<Utc>) -> Duration {
        let age = now - self.created_at;
        if age < Duration::zero() {
            Duration::zero()
        } else {
            age
        }
    }

    /// True once the nominal TTL has passed.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.age(now) > self.ttl()
    }

    /// True once TTL plus `grace` has passed. Only this makes a message
    /// eligible for eviction.
    pub fn is_evictable(&self, now: DateTime<Utc>, grace: Duration) -> bool {
        match self.ttl().checked_add(&grace) {
            Some(limit) => self.age(now) > limit,
            None => false,
        }
    }

    fn ttl(&self) -> Duration {
        let seconds = i64::try_from(self.ttl_seconds).unwrap_or(MAX_TTL_SECONDS);
        Duration::seconds(seconds.min(MAX_TTL_SECONDS))
    }
}

// Debug output ends up in logs, so it must not carry content or addresses.
impl fmt::Debug for EphemeralMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralMessage")
            .field("id", &self.id)
            .field("recipients", &self.recipients.len())
            .field("subject_len", &self.subject.len())
            .field("body_len", &self.body.len())
            .field("has_html", &self.html_body.is_some())
            .field("created_at", &self.created_at)
            .field("ttl_seconds", &self.ttl_seconds)
            .finish()
    }
}

impl fmt::Debug for InboundMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InboundMessage")
            .field("id", &self.id)
            .field("recipients", &self.recipients.len())
            .field("body_len", &self.body.len())
            .finish()
    }
}

#[cfg(test)]
pub(crate) fn test_inbound(id: &str, body: &str) -> InboundMessage {
    InboundMessage {
        id: Some(id.to_string()),
        sender: "ex@example.org".to_string(),
        recipients: vec!["alias-42@relay.example.net".to_string()],
        subject: "About the weekend".to_string(),
        body: body.to_string(),
        html_body: None,
        real_user: "parent@example.com".to_string(),
        ttl_seconds: None,
    }
}
