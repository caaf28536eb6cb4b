//! Building and sending signed webhook requests.
//!
//! Nothing here touches the store: requests carry everything needed to make the call, and the
//! caller decides what the outcome means.

use std::time::{Duration, Instant};

use serde::Serialize;

use crate::db::models::endpoints::Endpoint;
use crate::types::DeliveryId;
use crate::webhooks::Envelope;
use crate::webhooks::signing::{self, SIGNATURE_HEADER};

pub const EVENT_HEADER: &str = "X-Webhook-Event";
pub const DELIVERY_HEADER: &str = "X-Webhook-Delivery";
pub const ATTEMPT_HEADER: &str = "X-Webhook-Attempt";

/// A pre-built webhook HTTP request ready to send.
#[derive(Debug, Clone)]
pub struct DeliveryRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub timeout: Duration,
}

/// Outcome of a single HTTP send attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum SendOutcome {
    Success { status_code: u16 },
    Failure { status_code: Option<u16>, error: String },
}

impl SendOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, SendOutcome::Success { .. })
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            SendOutcome::Success { status_code } => Some(*status_code),
            SendOutcome::Failure { status_code, .. } => *status_code,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match self {
            SendOutcome::Success { .. } => None,
            SendOutcome::Failure { error, .. } => Some(error),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SendReport {
    pub outcome: SendOutcome,
    pub response_time: Duration,
}

impl SendReport {
    pub fn response_time_ms(&self) -> u64 {
        self.response_time.as_millis().min(u64::MAX as u128) as u64
    }
}

/// Result of a synchronous test delivery.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TestDeliveryResult {
    pub success: bool,
    pub response_time_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl From<SendReport> for TestDeliveryResult {
    fn from(report: SendReport) -> Self {
        let response_time_ms = report.response_time_ms();
        Self {
            success: report.outcome.is_success(),
            response_time_ms,
            status_code: report.outcome.status_code(),
            error: report.outcome.error().map(str::to_string),
        }
    }
}

/// Install the process-wide rustls provider. Safe to call repeatedly.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
}

/// HTTP client shared by every delivery. Timeouts are set per request.
pub fn build_http_client() -> reqwest::Result<reqwest::Client> {
    install_crypto_provider();
    reqwest::Client::builder()
        .user_agent(concat!("hookline/", env!("CARGO_PKG_VERSION")))
        .build()
}

/// Serialize and sign `envelope` for `endpoint`.
///
/// Custom headers go first so the engine's own headers always win.
pub fn build_request(
    endpoint: &Endpoint,
    envelope: &Envelope,
    delivery_id: DeliveryId,
    attempt_number: u32,
    timeout: Duration,
) -> serde_json::Result<DeliveryRequest> {
    let body = envelope.to_bytes()?;
    let signature = signing::sign(&body, &endpoint.secret);

    let mut headers: Vec<(String, String)> = endpoint
        .headers
        .iter()
        .map(|(name, value)| (name.clone(), value.clone()))
        .collect();
    headers.extend([
        ("Content-Type".to_string(), "application/json".to_string()),
        (SIGNATURE_HEADER.to_string(), signature),
        (EVENT_HEADER.to_string(), envelope.event().to_string()),
        (DELIVERY_HEADER.to_string(), delivery_id.to_string()),
        (ATTEMPT_HEADER.to_string(), attempt_number.to_string()),
    ]);

    Ok(DeliveryRequest {
        url: endpoint.url.clone(),
        headers,
        body,
        timeout,
    })
}

/// POST the request. Any 2xx status is a success; the response body is ignored.
pub async fn send(client: &reqwest::Client, request: DeliveryRequest) -> SendReport {
    let started = Instant::now();

    let mut req_builder = client.post(&request.url).timeout(request.timeout);
    for (name, value) in &request.headers {
        req_builder = req_builder.header(name, value);
    }

    let outcome = match req_builder.body(request.body).send().await {
        Ok(response) => {
            let status_code = response.status().as_u16();
            if response.status().is_success() {
                SendOutcome::Success { status_code }
            } else {
                SendOutcome::Failure {
                    status_code: Some(status_code),
                    error: format!("HTTP {}", status_code),
                }
            }
        }
        Err(e) if e.is_timeout() => SendOutcome::Failure {
            status_code: None,
            error: format!("Timed out after {}ms", request.timeout.as_millis()),
        },
        Err(e) => SendOutcome::Failure {
            status_code: None,
            error: e.to_string(),
        },
    };

    SendReport {
        outcome,
        response_time: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, BTreeSet};

    use chrono::Utc;
    use uuid::Uuid;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;
    use crate::db::models::endpoints::RetryPolicy;
    use crate::webhooks::EventName;

    fn endpoint(url: &str) -> Endpoint {
        let now = Utc::now();
        Endpoint {
            id: Uuid::new_v4(),
            owner_id: Uuid::new_v4(),
            scope_id: None,
            url: url.to_string(),
            secret: "whsec_sender_test".to_string(),
            subscribed_events: BTreeSet::from([EventName::MessageReceived]),
            headers: BTreeMap::from([("Authorization".to_string(), "Bearer abc".to_string())]),
            timeout_ms: 5000,
            retry_policy: RetryPolicy::default(),
            active: true,
            description: None,
            success_count: 0,
            failure_count: 0,
            last_triggered_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_build_request_headers() {
        let endpoint = endpoint("https://example.com/hook");
        let envelope = Envelope::new(EventName::MessageReceived, None, serde_json::json!({"from": "X"}));
        let delivery_id = Uuid::new_v4();

        let request = build_request(&endpoint, &envelope, delivery_id, 2, Duration::from_secs(5)).unwrap();

        let header_value = |name: &str| {
            request
                .headers
                .iter()
                .find(|(n, _)| n == name)
                .map(|(_, v)| v.as_str())
        };

        assert_eq!(request.headers[0].0, "Authorization");
        assert_eq!(header_value("Content-Type"), Some("application/json"));
        assert_eq!(header_value(EVENT_HEADER), Some("message.received"));
        assert_eq!(header_value(DELIVERY_HEADER), Some(delivery_id.to_string().as_str()));
        assert_eq!(header_value(ATTEMPT_HEADER), Some("2"));

        let signature = header_value(SIGNATURE_HEADER).unwrap();
        assert!(signing::verify(&request.body, signature, &endpoint.secret));
        assert_eq!(request.body, envelope.to_bytes().unwrap());
    }

    #[tokio::test]
    async fn test_successful_send() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/hook"))
            .and(header("Content-Type", "application/json"))
            .and(header("Authorization", "Bearer abc"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&mock_server)
            .await;

        let endpoint = endpoint(&format!("{}/hook", mock_server.uri()));
        let envelope = Envelope::test_ping(None);
        let request = build_request(&endpoint, &envelope, Uuid::new_v4(), 1, Duration::from_secs(5)).unwrap();

        let report = send(&build_http_client().unwrap(), request).await;
        assert_eq!(report.outcome, SendOutcome::Success { status_code: 204 });
    }

    #[tokio::test]
    async fn test_http_error_is_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let endpoint = endpoint(&mock_server.uri());
        let request =
            build_request(&endpoint, &Envelope::test_ping(None), Uuid::new_v4(), 1, Duration::from_secs(5)).unwrap();

        let report = send(&build_http_client().unwrap(), request).await;
        assert_eq!(
            report.outcome,
            SendOutcome::Failure {
                status_code: Some(500),
                error: "HTTP 500".to_string()
            }
        );
    }

    #[tokio::test]
    async fn test_redirect_status_is_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(304))
            .mount(&mock_server)
            .await;

        let endpoint = endpoint(&mock_server.uri());
        let request =
            build_request(&endpoint, &Envelope::test_ping(None), Uuid::new_v4(), 1, Duration::from_secs(5)).unwrap();

        let report = send(&build_http_client().unwrap(), request).await;
        assert!(!report.outcome.is_success());
        assert_eq!(report.outcome.status_code(), Some(304));
    }

    #[tokio::test]
    async fn test_timeout_is_failure() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&mock_server)
            .await;

        let endpoint = endpoint(&mock_server.uri());
        let request =
            build_request(&endpoint, &Envelope::test_ping(None), Uuid::new_v4(), 1, Duration::from_millis(50)).unwrap();

        let report = send(&build_http_client().unwrap(), request).await;
        assert!(matches!(report.outcome, SendOutcome::Failure { status_code: None, .. }));
        assert!(report.outcome.error().unwrap().contains("Timed out"));
    }

    #[tokio::test]
    async fn test_network_error_is_failure() {
        // Nothing listens on port 1
        let endpoint = endpoint("http://127.0.0.1:1");
        let request =
            build_request(&endpoint, &Envelope::test_ping(None), Uuid::new_v4(), 1, Duration::from_secs(2)).unwrap();

        let report = send(&build_http_client().unwrap(), request).await;
        let result = TestDeliveryResult::from(report);
        assert!(!result.success);
        assert!(result.status_code.is_none());
        assert!(result.error.is_some());
    }
}
