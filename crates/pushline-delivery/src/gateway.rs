//! Push gateway client for multicast notification delivery.
//!
//! Handles request construction, response reconciliation, and error
//! categorization for retry decisions. One multicast call covers every
//! device token of a recipient; the gateway reports a per-token outcome
//! which the dispatcher reduces to a single job result.

use std::{collections::HashMap, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info_span, Instrument};

use crate::error::{DeliveryError, Result};

/// A push message addressed to a set of device tokens.
///
/// `data` is the opaque key/value payload forwarded to the client
/// application alongside the visible title and body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PushMessage {
    /// Device tokens to fan out to.
    pub tokens: Vec<String>,
    /// Title shown in the push banner.
    pub title: String,
    /// Message body.
    pub body: String,
    /// Key/value payload forwarded to the client.
    pub data: HashMap<String, String>,
}

/// Per-token result of a multicast send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenOutcome {
    /// The device token this outcome belongs to.
    pub token: String,
    /// Whether the gateway accepted the push for this token.
    pub success: bool,
    /// Gateway message ID when accepted.
    pub message_id: Option<String>,
    /// Gateway error code when rejected.
    pub error_code: Option<String>,
}

/// Reconciled result of one multicast call.
///
/// The call either produces this outcome for every token or fails as a
/// whole (transport error, timeout, non-success HTTP status); there is no
/// partial-response case.
#[derive(Debug, Clone, Default)]
pub struct MulticastOutcome {
    /// Number of tokens the gateway accepted.
    pub success_count: usize,
    /// Number of tokens the gateway rejected.
    pub failure_count: usize,
    /// Per-token outcomes in request order.
    pub results: Vec<TokenOutcome>,
}

impl MulticastOutcome {
    /// First successful message ID, falling back to the literal "sent".
    ///
    /// The fallback covers gateways that accept a token without returning
    /// an explicit message ID.
    pub fn primary_message_id(&self) -> String {
        self.results
            .iter()
            .find(|r| r.success)
            .and_then(|r| r.message_id.clone())
            .unwrap_or_else(|| "sent".to_string())
    }

    /// True when the gateway rejected every token.
    pub fn is_all_failed(&self) -> bool {
        self.success_count == 0
    }
}

/// Gateway abstraction for multicast push delivery.
///
/// Production uses [`HttpPushGateway`]; tests inject
/// [`mock::MockPushGateway`] with scripted outcomes. Implementations never
/// retry internally; retry policy belongs to the dispatcher.
#[async_trait]
pub trait PushGateway: Send + Sync + 'static {
    /// Sends one multicast push covering every token in the message.
    ///
    /// # Errors
    ///
    /// Returns a whole-call error for transport failures, timeouts, and
    /// non-success HTTP statuses. Token-level rejections are not errors;
    /// they appear in the returned outcome.
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastOutcome>;
}

/// Configuration for the HTTP push gateway client.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Multicast endpoint URL.
    pub endpoint: String,
    /// Server API key sent in the Authorization header.
    pub api_key: String,
    /// Timeout for the whole multicast call.
    pub timeout: Duration,
    /// User agent string for requests.
    pub user_agent: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://fcm.googleapis.com/fcm/send".to_string(),
            api_key: String::new(),
            timeout: Duration::from_secs(30),
            user_agent: "Pushline-Delivery/1.0".to_string(),
        }
    }
}

#[derive(Serialize)]
struct MulticastRequest<'a> {
    registration_ids: &'a [String],
    notification: NotificationPayload<'a>,
    data: &'a HashMap<String, String>,
}

#[derive(Serialize)]
struct NotificationPayload<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct MulticastResponse {
    #[serde(default)]
    results: Vec<SendResult>,
}

#[derive(Deserialize)]
struct SendResult {
    message_id: Option<String>,
    error: Option<String>,
}

/// HTTP client for the push gateway.
///
/// Uses connection pooling and a bounded timeout. A non-success HTTP status
/// fails the whole call; per-token rejections come back in the response
/// body and are reconciled into a [`MulticastOutcome`].
#[derive(Debug, Clone)]
pub struct HttpPushGateway {
    client: reqwest::Client,
    config: GatewayConfig,
}

impl HttpPushGateway {
    /// Creates a new gateway client with the given configuration.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` if the HTTP client cannot be
    /// built with the provided settings.
    pub fn new(config: GatewayConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .user_agent(&config.user_agent)
            .build()
            .map_err(|e| {
                DeliveryError::configuration(format!("failed to build HTTP client: {e}"))
            })?;

        Ok(Self { client, config })
    }

    fn reconcile(tokens: &[String], response: MulticastResponse) -> MulticastOutcome {
        let mut outcome = MulticastOutcome::default();

        for (index, token) in tokens.iter().enumerate() {
            let result = response.results.get(index);
            let message_id = result.and_then(|r| r.message_id.clone());
            let error_code = result.and_then(|r| r.error.clone());
            let success = message_id.is_some() && error_code.is_none();

            if success {
                outcome.success_count += 1;
            } else {
                outcome.failure_count += 1;
            }

            outcome.results.push(TokenOutcome {
                token: token.clone(),
                success,
                message_id,
                error_code,
            });
        }

        outcome
    }
}

#[async_trait]
impl PushGateway for HttpPushGateway {
    async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastOutcome> {
        let span = info_span!(
            "push_multicast",
            token_count = message.tokens.len(),
            endpoint = %self.config.endpoint,
        );

        async move {
            tracing::debug!("sending multicast push");

            let request = MulticastRequest {
                registration_ids: &message.tokens,
                notification: NotificationPayload { title: &message.title, body: &message.body },
                data: &message.data,
            };

            let response = self
                .client
                .post(&self.config.endpoint)
                .header("Authorization", format!("key={}", self.config.api_key))
                .json(&request)
                .send()
                .await
                .map_err(|e| {
                    if e.is_timeout() {
                        DeliveryError::timeout(self.config.timeout.as_secs())
                    } else if e.is_connect() {
                        DeliveryError::transport(format!("connection failed: {e}"))
                    } else {
                        DeliveryError::transport(e.to_string())
                    }
                })?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                tracing::warn!(status = status.as_u16(), "gateway rejected multicast call");
                return Err(DeliveryError::gateway(status.as_u16(), body));
            }

            let parsed: MulticastResponse = response.json().await.map_err(|e| {
                DeliveryError::transport(format!("malformed gateway response: {e}"))
            })?;

            let outcome = Self::reconcile(&message.tokens, parsed);
            tracing::debug!(
                success_count = outcome.success_count,
                failure_count = outcome.failure_count,
                "multicast reconciled"
            );

            Ok(outcome)
        }
        .instrument(span)
        .await
    }
}

pub mod mock {
    //! Scripted gateway implementation for testing.
    //!
    //! Records every message it is asked to send and replays a queue of
    //! prepared outcomes, defaulting to all-success when the queue is empty.

    use async_trait::async_trait;
    use tokio::sync::RwLock;

    use super::{MulticastOutcome, PushGateway, PushMessage, TokenOutcome};
    use crate::error::{DeliveryError, Result};

    enum Scripted {
        Outcome(Result<MulticastOutcome>),
        AllFailed(String),
    }

    /// Mock gateway with scripted outcomes.
    pub struct MockPushGateway {
        script: RwLock<Vec<Scripted>>,
        calls: RwLock<Vec<PushMessage>>,
    }

    impl MockPushGateway {
        /// Creates a mock gateway with an empty script (all sends succeed).
        pub fn new() -> Self {
            Self { script: RwLock::new(Vec::new()), calls: RwLock::new(Vec::new()) }
        }

        /// Queues an outcome for the next send.
        pub async fn enqueue(&self, outcome: Result<MulticastOutcome>) {
            self.script.write().await.push(Scripted::Outcome(outcome));
        }

        /// Queues a whole-call error.
        pub async fn enqueue_error(&self, error: DeliveryError) {
            self.enqueue(Err(error)).await;
        }

        /// Queues an outcome where every token is rejected with `error_code`.
        pub async fn enqueue_all_failed(&self, error_code: &str) {
            self.script.write().await.push(Scripted::AllFailed(error_code.to_string()));
        }

        /// Messages sent through this gateway, in order.
        pub async fn sent_messages(&self) -> Vec<PushMessage> {
            self.calls.read().await.clone()
        }

        /// Number of multicast calls made.
        pub async fn call_count(&self) -> usize {
            self.calls.read().await.len()
        }

        fn success_outcome(message: &PushMessage) -> MulticastOutcome {
            let results: Vec<TokenOutcome> = message
                .tokens
                .iter()
                .enumerate()
                .map(|(i, token)| TokenOutcome {
                    token: token.clone(),
                    success: true,
                    message_id: Some(format!("mock-msg-{i}")),
                    error_code: None,
                })
                .collect();

            MulticastOutcome {
                success_count: results.len(),
                failure_count: 0,
                results,
            }
        }

        fn all_failed_outcome(message: &PushMessage, error_code: &str) -> MulticastOutcome {
            let results: Vec<TokenOutcome> = message
                .tokens
                .iter()
                .map(|token| TokenOutcome {
                    token: token.clone(),
                    success: false,
                    message_id: None,
                    error_code: Some(error_code.to_string()),
                })
                .collect();

            MulticastOutcome { success_count: 0, failure_count: results.len(), results }
        }
    }

    impl Default for MockPushGateway {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl PushGateway for MockPushGateway {
        async fn send_multicast(&self, message: &PushMessage) -> Result<MulticastOutcome> {
            self.calls.write().await.push(message.clone());

            let scripted = {
                let mut script = self.script.write().await;
                if script.is_empty() { None } else { Some(script.remove(0)) }
            };

            match scripted {
                None => Ok(Self::success_outcome(message)),
                Some(Scripted::AllFailed(code)) => Ok(Self::all_failed_outcome(message, &code)),
                Some(Scripted::Outcome(result)) => result,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use wiremock::{matchers, Mock, MockServer, ResponseTemplate};

    use super::*;

    fn test_gateway(uri: &str) -> HttpPushGateway {
        HttpPushGateway::new(GatewayConfig {
            endpoint: format!("{uri}/fcm/send"),
            api_key: "test-key".to_string(),
            timeout: Duration::from_secs(5),
            user_agent: "pushline-test".to_string(),
        })
        .unwrap()
    }

    fn test_message(tokens: Vec<&str>) -> PushMessage {
        PushMessage {
            tokens: tokens.into_iter().map(String::from).collect(),
            title: "hello".to_string(),
            body: "world".to_string(),
            data: HashMap::from([("k".to_string(), "v".to_string())]),
        }
    }

    #[tokio::test]
    async fn successful_multicast_reconciles_per_token() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::path("/fcm/send"))
            .and(matchers::header("Authorization", "key=test-key"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 2,
                "failure": 1,
                "results": [
                    { "message_id": "m1" },
                    { "error": "NotRegistered" },
                    { "message_id": "m3" }
                ]
            })))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let outcome =
            gateway.send_multicast(&test_message(vec!["t1", "t2", "t3"])).await.unwrap();

        assert_eq!(outcome.success_count, 2);
        assert_eq!(outcome.failure_count, 1);
        assert_eq!(outcome.results.len(), 3);
        assert!(outcome.results[0].success);
        assert!(!outcome.results[1].success);
        assert_eq!(outcome.results[1].error_code.as_deref(), Some("NotRegistered"));
        assert_eq!(outcome.primary_message_id(), "m1");
    }

    #[tokio::test]
    async fn all_tokens_rejected_is_not_a_call_error() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "success": 0,
                "failure": 2,
                "results": [
                    { "error": "NotRegistered" },
                    { "error": "InvalidRegistration" }
                ]
            })))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let outcome = gateway.send_multicast(&test_message(vec!["t1", "t2"])).await.unwrap();

        assert!(outcome.is_all_failed());
        assert_eq!(outcome.failure_count, 2);
        assert_eq!(outcome.primary_message_id(), "sent");
    }

    #[tokio::test]
    async fn server_error_fails_the_whole_call() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .respond_with(ResponseTemplate::new(503).set_body_string("unavailable"))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let result = gateway.send_multicast(&test_message(vec!["t1"])).await;

        match result {
            Err(DeliveryError::Gateway { status_code, .. }) => assert_eq!(status_code, 503),
            other => panic!("expected gateway error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn request_carries_tokens_and_payload() {
        let server = MockServer::start().await;

        Mock::given(matchers::method("POST"))
            .and(matchers::body_partial_json(json!({
                "registration_ids": ["t1", "t2"],
                "notification": { "title": "hello", "body": "world" },
                "data": { "k": "v" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "results": [{ "message_id": "m1" }, { "message_id": "m2" }]
            })))
            .mount(&server)
            .await;

        let gateway = test_gateway(&server.uri());
        let outcome = gateway.send_multicast(&test_message(vec!["t1", "t2"])).await.unwrap();

        assert_eq!(outcome.success_count, 2);
    }

    #[tokio::test]
    async fn connection_failure_is_transport_error() {
        // Port 1 is never listening
        let gateway = test_gateway("http://127.0.0.1:1");
        let result = gateway.send_multicast(&test_message(vec!["t1"])).await;

        assert!(matches!(result, Err(DeliveryError::Transport { .. })));
    }

    #[test]
    fn primary_message_id_falls_back_to_sent() {
        let outcome = MulticastOutcome {
            success_count: 1,
            failure_count: 0,
            results: vec![TokenOutcome {
                token: "t1".to_string(),
                success: true,
                message_id: None,
                error_code: None,
            }],
        };
        assert_eq!(outcome.primary_message_id(), "sent");
    }
}
