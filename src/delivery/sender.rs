use async_trait::async_trait;
use std::collections::BTreeMap;

#[derive(Debug, thiserror::Error)]
pub enum SendError {
    #[error("rejected by downstream: {0}")]
    Rejected(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("sender misconfigured: {0}")]
    Config(String),
}

/// Hands a message to whatever actually moves mail.
///
/// `Ok(())` means the downstream accepted the message.
#[async_trait]
pub trait Sender: Send + Sync {
    fn name(&self) -> &str;

    async fn send(
        &self,
        recipient: &str,
        subject: &str,
        content: &str,
        headers: &BTreeMap<String, String>,
    ) -> Result<(), SendError>;
}

/// Collapse a value onto one line so it cannot smuggle extra headers.
pub fn sanitize_header_value(value: &str) -> String {
    value
        .split(['\r', '\n'])
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sanitize_header_value() {
        assert_eq!(
            sanitize_header_value("line one\r\nBcc: evil@example.com\n"),
            "line one Bcc: evil@example.com"
        );
        assert_eq!(sanitize_header_value("plain"), "plain");
    }
}
