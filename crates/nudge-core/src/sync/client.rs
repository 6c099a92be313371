//! HTTP client for another instance's sync endpoints.

use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::{Error, Result};
use crate::models::{Envelope, Reminder};

/// Path serving the full local collection
pub const PULL_PATH: &str = "/sync/pull";

/// Path accepting a delta to merge
pub const PUSH_PATH: &str = "/sync/push";

/// Default per-request timeout
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct PeerClient {
    client: reqwest::Client,
}

impl PeerClient {
    pub fn new(timeout: Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder().timeout(timeout).build()?,
        })
    }

    /// Fetch every reminder the peer at `base_url` holds.
    pub async fn pull(&self, base_url: &str) -> Result<Vec<Reminder>> {
        let url = format!("{}{PULL_PATH}", normalize_endpoint(base_url)?);
        let response = self
            .client
            .get(&url)
            .header("Accept", "application/json")
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::Peer(parse_api_error(status, &body)));
        }

        Ok(response.json::<Vec<Reminder>>().await?)
    }

    /// Send `reminders` to the peer at `base_url` for merging.
    ///
    /// A reply envelope with `status: false` is turned into an error.
    pub async fn push(&self, base_url: &str, reminders: &[Reminder]) -> Result<Envelope> {
        let url = format!("{}{PUSH_PATH}", normalize_endpoint(base_url)?);
        let response = self
            .client
            .post(&url)
            .header("Accept", "application/json")
            .json(reminders)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let envelope = match serde_json::from_str::<Envelope>(&body) {
            Ok(envelope) => envelope,
            Err(_) if !status.is_success() => {
                return Err(Error::Peer(parse_api_error(status, &body)))
            }
            Err(error) => return Err(error.into()),
        };
        if !envelope.status {
            return Err(Error::Peer(format!(
                "{} ({})",
                envelope.message.trim(),
                status.as_u16()
            )));
        }
        Ok(envelope)
    }
}

#[derive(Debug, Deserialize)]
struct PeerErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<PeerErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_endpoint(raw: &str) -> Result<String> {
    let endpoint = raw.trim();
    if endpoint.is_empty() {
        return Err(Error::InvalidInput("peer endpoint must not be empty".to_string()));
    }
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::InvalidInput(
            "peer endpoint must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint("").is_err());
        assert!(normalize_endpoint("   ").is_err());
        assert!(normalize_endpoint("laptop:7878").is_err());
        assert_eq!(
            normalize_endpoint(" http://laptop:7878/ ").unwrap(),
            "http://laptop:7878"
        );
    }

    #[test]
    fn parse_api_error_prefers_message_fields() {
        assert_eq!(
            parse_api_error(
                StatusCode::BAD_REQUEST,
                r#"{"id":3,"status":false,"message":"bad title"}"#
            ),
            "bad title (400)"
        );
        assert_eq!(
            parse_api_error(StatusCode::NOT_FOUND, r#"{"error":"missing"}"#),
            "missing (404)"
        );
        assert_eq!(
            parse_api_error(StatusCode::BAD_GATEWAY, "  "),
            "HTTP 502"
        );
        assert_eq!(
            parse_api_error(StatusCode::INTERNAL_SERVER_ERROR, "boom"),
            "boom (500)"
        );
    }

    #[tokio::test]
    async fn unreachable_peer_is_an_error() {
        let client = PeerClient::new(Duration::from_millis(500)).unwrap();
        // Nothing listens on the loopback discard port
        let err = client.pull("http://127.0.0.1:9").await.unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        let err = client.push("not-a-url", &[]).await.unwrap_err();
        assert!(err.is_validation());
    }
}
