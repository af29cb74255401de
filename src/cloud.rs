//! Pulsoid cloud source.
//!
//! Polls the "latest heart rate" endpoint. Every failure, including the
//! 204/412 answers Pulsoid gives before a device has ever reported, yields
//! "no sample".

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;

use crate::error::RelayError;
use crate::types::HeartRateSample;

pub const PULSOID_LATEST_URL: &str = "https://dev.pulsoid.net/api/v1/data/heart_rate/latest";
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

/// A remote heart-rate source polled by the acquisition loop.
#[async_trait]
pub trait CloudSource: Send + Sync {
    async fn poll(&self, api_key: &str) -> Option<HeartRateSample>;
}

#[derive(Debug, Deserialize)]
struct LatestResponse {
    #[allow(dead_code)]
    #[serde(default)]
    measured_at: Option<i64>,
    data: LatestData,
}

#[derive(Debug, Deserialize)]
struct LatestData {
    heart_rate: u16,
}

/// Parse a `/heart_rate/latest` body. A zero reading is a protocol error.
pub fn parse_latest(body: &[u8]) -> Result<HeartRateSample, RelayError> {
    let response: LatestResponse = serde_json::from_slice(body)
        .map_err(|e| RelayError::Protocol(format!("Invalid Pulsoid response: {}", e)))?;
    HeartRateSample::new(response.data.heart_rate)
        .ok_or_else(|| RelayError::Protocol("Pulsoid reported 0 BPM".to_string()))
}

pub struct PulsoidSource {
    client: Client,
    url: String,
}

impl PulsoidSource {
    pub fn new() -> Result<Self, RelayError> {
        Self::with_url(PULSOID_LATEST_URL)
    }

    /// Point the poller at another endpoint serving the same JSON shape.
    pub fn with_url(url: impl Into<String>) -> Result<Self, RelayError> {
        let client = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| RelayError::Config(format!("HTTP client error: {}", e)))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    async fn fetch(&self, api_key: &str) -> Result<Option<HeartRateSample>, RelayError> {
        if api_key.trim().is_empty() {
            return Err(RelayError::PreconditionNotMet(
                "Pulsoid API key is not set".to_string(),
            ));
        }
        let response = self
            .client
            .get(&self.url)
            .bearer_auth(api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;

        match response.status() {
            StatusCode::NO_CONTENT | StatusCode::PRECONDITION_FAILED => {
                log::debug!("Pulsoid has no heart rate yet ({})", response.status());
                return Ok(None);
            }
            status if !status.is_success() => {
                return Err(RelayError::Transport(format!("Pulsoid returned {}", status)));
            }
            _ => {}
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| RelayError::Transport(e.to_string()))?;
        parse_latest(&body).map(Some)
    }
}

#[async_trait]
impl CloudSource for PulsoidSource {
    async fn poll(&self, api_key: &str) -> Option<HeartRateSample> {
        match self.fetch(api_key).await {
            Ok(sample) => sample,
            Err(e) => {
                log::warn!("Pulsoid poll failed: {}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::task::JoinHandle;

    /// Answer one request with a canned response and hand back the raw
    /// request head.
    async fn serve_once(status: &str, body: &str) -> (String, JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/latest", listener.local_addr().unwrap());
        let response = format!(
            "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
            status,
            body.len(),
            body
        );
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut buf = [0u8; 1024];
            while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                let n = stream.read(&mut buf).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..n]);
            }
            stream.write_all(response.as_bytes()).await.unwrap();
            stream.shutdown().await.ok();
            String::from_utf8_lossy(&request).into_owned()
        });
        (url, server)
    }

    #[test]
    fn test_parse_latest() {
        let body = br#"{"measured_at": 1625310655000, "data": {"heart_rate": 87}}"#;
        assert_eq!(parse_latest(body).unwrap(), HeartRateSample::new(87).unwrap());
    }

    #[test]
    fn test_parse_ignores_unknown_fields() {
        let body = br#"{"data": {"heart_rate": 101, "device": "watch"}, "extra": true}"#;
        assert_eq!(parse_latest(body).unwrap().bpm(), 101);
    }

    #[test]
    fn test_parse_rejects_zero_and_garbage() {
        let zero = br#"{"measured_at": 1, "data": {"heart_rate": 0}}"#;
        assert!(matches!(parse_latest(zero), Err(RelayError::Protocol(_))));
        assert!(matches!(parse_latest(b"not json"), Err(RelayError::Protocol(_))));
        assert!(matches!(parse_latest(br#"{"data": {}}"#), Err(RelayError::Protocol(_))));
        assert!(matches!(
            parse_latest(br#"{"data": {"heart_rate": -4}}"#),
            Err(RelayError::Protocol(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_key_is_a_precondition() {
        let source = PulsoidSource::with_url("http://127.0.0.1:9/latest").unwrap();
        assert!(matches!(
            source.fetch("  ").await,
            Err(RelayError::PreconditionNotMet(_))
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_yields_no_sample() {
        // Nothing listens on port 9 of the loopback interface.
        let source = PulsoidSource::with_url("http://127.0.0.1:9/latest").unwrap();
        assert_eq!(source.poll("token").await, None);
    }

    #[tokio::test]
    async fn test_latest_reading_with_bearer_token() {
        let (url, server) =
            serve_once("200 OK", r#"{"measured_at": 1, "data": {"heart_rate": 93}}"#).await;
        let source = PulsoidSource::with_url(url).unwrap();

        assert_eq!(source.poll("secret-token").await, HeartRateSample::new(93));

        let request = server.await.unwrap().to_ascii_lowercase();
        assert!(request.starts_with("get /latest "));
        assert!(request.contains("authorization: bearer secret-token\r\n"));
        assert!(request.contains("accept: application/json\r\n"));
    }

    #[tokio::test]
    async fn test_no_data_yet_is_not_an_error() {
        for status in ["204 No Content", "412 Precondition Failed"] {
            let (url, server) = serve_once(status, "").await;
            let source = PulsoidSource::with_url(url).unwrap();
            assert!(matches!(source.fetch("token").await, Ok(None)), "{}", status);
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_error_statuses_yield_no_sample() {
        for status in ["401 Unauthorized", "500 Internal Server Error"] {
            let (url, server) = serve_once(status, r#"{"error": "nope"}"#).await;
            let source = PulsoidSource::with_url(url).unwrap();
            assert!(
                matches!(source.fetch("token").await, Err(RelayError::Transport(_))),
                "{}",
                status
            );
            server.await.unwrap();

            let (url, server) = serve_once(status, r#"{"error": "nope"}"#).await;
            let source = PulsoidSource::with_url(url).unwrap();
            assert_eq!(source.poll("token").await, None);
            server.await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_zero_reading_yields_no_sample() {
        let (url, server) = serve_once("200 OK", r#"{"data": {"heart_rate": 0}}"#).await;
        let source = PulsoidSource::with_url(url).unwrap();
        assert!(matches!(source.fetch("token").await, Err(RelayError::Protocol(_))));
        server.await.unwrap();
    }
}
