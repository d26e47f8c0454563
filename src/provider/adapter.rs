//! Provider Submission Adapter
//!
//! Serializes a mapped payload for the provider's wire protocol, performs the
//! call under a timeout and normalizes the answer.
//!
//! # Response precedence
//!
//! ```text
//! 1. non-2xx                → failure  (ERROR[0].MESSAGE | message | error | "provider error {status}")
//! 2. 2xx + ERROR element    → failure  (same extraction; null or empty ERROR is ignored)
//! 3. 2xx + unparseable body → failure  ("malformed provider response")
//! 4. otherwise              → success  (REFERENCEID | order_id | id, status default "submitted")
//! ```
//!
//! The adapter never touches the ledger or the store.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::{debug, warn};

use super::diagnosis::diagnose;
use super::mapper::ProviderMapping;
use super::transport::{HttpRequest, HttpResponse, HttpTransport, RequestBody};
use super::xml::{from_xml, to_xml};
use crate::models::{ApiProvider, ErrorDiagnosis, WireProtocol};

const DEFAULT_SUBMIT_STATUS: &str = "submitted";
const MALFORMED_RESPONSE: &str = "malformed provider response";

#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Upper bound for a single provider call
    pub timeout: Duration,
    /// Extra attempts for status checks (submission is never retried)
    pub status_retries: u32,
    /// First backoff delay; doubles per attempt
    pub status_backoff: Duration,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            status_retries: 2,
            status_backoff: Duration::from_millis(500),
        }
    }
}

/// Normalized result of one submission attempt
#[derive(Debug, Clone, PartialEq)]
pub struct SubmissionOutcome {
    pub success: bool,
    pub order_id: Option<String>,
    pub status: Option<String>,
    /// None when no HTTP response was received
    pub http_status: Option<u16>,
    pub data: Value,
    pub error: Option<String>,
    pub diagnosis: Option<ErrorDiagnosis>,
    /// Full URL that was called
    pub endpoint: String,
    /// What was sent, credentials redacted
    pub request_payload: String,
    /// Raw response body (empty when none)
    pub response_body: String,
    pub detailed_log: String,
}

/// A failed provider call
#[derive(Debug, Error, Clone, PartialEq)]
#[error("{message}")]
pub struct ProviderFailure {
    pub message: String,
    pub http_status: Option<u16>,
    pub diagnosis: ErrorDiagnosis,
    /// Transport failures, timeouts and 5xx
    pub retryable: bool,
}

/// Upstream answer to a status lookup
#[derive(Debug, Clone, PartialEq)]
pub struct StatusReport {
    pub raw_status: String,
    pub result: Option<String>,
    pub http_status: u16,
    pub data: Value,
}

struct PreparedRequest {
    request: HttpRequest,
    logged_payload: String,
}

pub struct SubmissionAdapter {
    transport: Arc<dyn HttpTransport>,
    config: AdapterConfig,
}

impl SubmissionAdapter {
    pub fn new(transport: Arc<dyn HttpTransport>, config: AdapterConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &AdapterConfig {
        &self.config
    }

    /// Submit a new order. Never retried; every failure comes back as an outcome.
    pub async fn submit(
        &self,
        provider: &ApiProvider,
        mapping: &ProviderMapping,
        payload: &Map<String, Value>,
    ) -> SubmissionOutcome {
        let prepared = self.prepare(
            provider,
            mapping.protocol,
            &mapping.endpoint,
            mapping.mapper.submit_action(),
            "order",
            payload,
        );
        let endpoint = prepared.request.url.clone();
        let logged_payload = prepared.logged_payload.clone();

        debug!(
            provider = %provider.name,
            protocol = %mapping.protocol,
            endpoint = %endpoint,
            "Submitting order to provider"
        );

        let response = self.call(prepared.request).await;
        let (http_status, response_body) = match &response {
            Ok(response) => (Some(response.status), response.body.clone()),
            Err(failure) => (failure.http_status, String::new()),
        };

        let (data, error, diagnosis) =
            match response.and_then(|response| interpret(&response, mapping.protocol)) {
                Ok(data) => (data, None, None),
                Err(failure) => (Value::Null, Some(failure.message), Some(failure.diagnosis)),
            };
        let success = error.is_none();

        let detailed_log = detailed_log(
            &endpoint,
            mapping.protocol,
            &logged_payload,
            http_status,
            &response_body,
            error.as_deref(),
        );

        SubmissionOutcome {
            success,
            order_id: if success { find_order_id(&data) } else { None },
            status: success
                .then(|| find_status(&data).unwrap_or_else(|| DEFAULT_SUBMIT_STATUS.into())),
            http_status,
            data,
            error,
            diagnosis,
            endpoint,
            request_payload: logged_payload,
            response_body,
            detailed_log,
        }
    }

    /// Look up an order's upstream status, retrying transient failures with
    /// exponential backoff.
    pub async fn check_status(
        &self,
        provider: &ApiProvider,
        mapping: &ProviderMapping,
        external_order_id: &str,
    ) -> Result<StatusReport, ProviderFailure> {
        let status_request = mapping.mapper.status_request(external_order_id);
        let mut attempt = 0u32;

        loop {
            let prepared = self.prepare(
                provider,
                mapping.protocol,
                &status_request.endpoint,
                status_request.action,
                "request",
                &status_request.payload,
            );

            let result = self.call(prepared.request).await.and_then(|response| {
                let data = interpret(&response, mapping.protocol)?;
                Ok(StatusReport {
                    raw_status: find_status(&data).unwrap_or_default(),
                    result: find_result(&data),
                    http_status: response.status,
                    data,
                })
            });

            match result {
                Err(failure) if failure.retryable && attempt < self.config.status_retries => {
                    let delay = self.config.status_backoff * 2u32.saturating_pow(attempt);
                    attempt += 1;
                    warn!(
                        provider = %provider.name,
                        external_order_id,
                        attempt,
                        error = %failure,
                        delay_ms = delay.as_millis() as u64,
                        "Status check failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                other => return other,
            }
        }
    }

    fn prepare(
        &self,
        provider: &ApiProvider,
        protocol: WireProtocol,
        endpoint: &str,
        action: Option<&str>,
        xml_root: &str,
        payload: &Map<String, Value>,
    ) -> PreparedRequest {
        let url = format!("{}{}", provider.base_url.trim_end_matches('/'), endpoint);
        let payload = Value::Object(payload.clone());

        match protocol {
            WireProtocol::DhruForm => {
                let username = provider.username.clone().unwrap_or_default();
                let action = action.unwrap_or("placeimeiorder").to_string();
                let parameters = BASE64.encode(payload.to_string());
                let logged_payload = json!({
                    "action": action,
                    "username": username,
                    "apiaccesskey": "***",
                    "parameters": payload,
                })
                .to_string();

                PreparedRequest {
                    request: HttpRequest {
                        url,
                        headers: Vec::new(),
                        body: RequestBody::Form(vec![
                            ("action".into(), action),
                            ("username".into(), username),
                            ("apiaccesskey".into(), provider.api_key.clone()),
                            ("parameters".into(), parameters),
                        ]),
                    },
                    logged_payload,
                }
            }
            WireProtocol::Json | WireProtocol::Xml => {
                let headers = vec![
                    ("Authorization".into(), format!("Bearer {}", provider.api_key)),
                    ("X-API-Key".into(), provider.api_key.clone()),
                ];
                let (body, logged_payload) = if protocol == WireProtocol::Xml {
                    let xml = to_xml(xml_root, &payload);
                    (RequestBody::Xml(xml.clone()), xml)
                } else {
                    (RequestBody::Json(payload.clone()), payload.to_string())
                };

                PreparedRequest {
                    request: HttpRequest { url, headers, body },
                    logged_payload,
                }
            }
        }
    }

    async fn call(&self, request: HttpRequest) -> Result<HttpResponse, ProviderFailure> {
        match tokio::time::timeout(self.config.timeout, self.transport.post(request)).await {
            Err(_) => {
                let message = format!(
                    "Provider request timed out after {}s",
                    self.config.timeout.as_secs_f64()
                );
                Err(failure(message, None, true))
            }
            Ok(Err(e)) => Err(failure(e.to_string(), None, true)),
            Ok(Ok(response)) => Ok(response),
        }
    }
}

fn failure(message: String, http_status: Option<u16>, retryable: bool) -> ProviderFailure {
    let diagnosis = diagnose(http_status, &message);
    ProviderFailure {
        message,
        http_status,
        diagnosis,
        retryable,
    }
}

/// Apply the response precedence rules
fn interpret(response: &HttpResponse, protocol: WireProtocol) -> Result<Value, ProviderFailure> {
    let parsed = parse_body(&response.body, protocol);

    if !response.is_success() {
        let message = parsed
            .as_ref()
            .and_then(extract_error)
            .unwrap_or_else(|| format!("provider error {}", response.status));
        return Err(failure(
            message,
            Some(response.status),
            response.status >= 500,
        ));
    }

    let Some(data) = parsed else {
        return Err(failure(
            MALFORMED_RESPONSE.to_string(),
            Some(response.status),
            false,
        ));
    };

    if has_error(&data) {
        let message =
            extract_error(&data).unwrap_or_else(|| format!("provider error {}", response.status));
        return Err(failure(message, Some(response.status), false));
    }

    Ok(data)
}

fn parse_body(body: &str, protocol: WireProtocol) -> Option<Value> {
    let body = body.trim();
    if body.is_empty() {
        return None;
    }
    match protocol {
        WireProtocol::Xml => from_xml(body).ok(),
        WireProtocol::Json | WireProtocol::DhruForm => serde_json::from_str(body).ok(),
    }
}

/// First element of an array, or the value itself (a single XML element)
fn first(value: &Value) -> &Value {
    match value {
        Value::Array(items) => items.first().unwrap_or(&Value::Null),
        other => other,
    }
}

fn text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// An ERROR element carrying something
fn has_error(data: &Value) -> bool {
    match data.get("ERROR") {
        Some(Value::Array(items)) => !items.is_empty(),
        Some(Value::Object(fields)) => !fields.is_empty(),
        Some(Value::String(s)) => !s.trim().is_empty(),
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(_)) => true,
        Some(Value::Null) | None => false,
    }
}

fn extract_error(data: &Value) -> Option<String> {
    data.get("ERROR")
        .and_then(|errors| first(errors).get("MESSAGE"))
        .and_then(text)
        .or_else(|| data.get("message").and_then(text))
        .or_else(|| data.get("error").and_then(text))
}

fn find_order_id(data: &Value) -> Option<String> {
    let success = data.get("SUCCESS").map(first);
    ["REFERENCEID", "order_id", "id"].iter().find_map(|key| {
        data.get(*key)
            .and_then(text)
            .or_else(|| success.and_then(|s| s.get(*key)).and_then(text))
    })
}

fn find_status(data: &Value) -> Option<String> {
    let success = data.get("SUCCESS").map(first);
    ["status", "STATUS"].iter().find_map(|key| {
        data.get(*key)
            .and_then(text)
            .or_else(|| success.and_then(|s| s.get(*key)).and_then(text))
    })
}

fn find_result(data: &Value) -> Option<String> {
    let success = data.get("SUCCESS").map(first);
    ["result", "code", "CODE"].iter().find_map(|key| {
        data.get(*key)
            .and_then(text)
            .or_else(|| success.and_then(|s| s.get(*key)).and_then(text))
    })
}

fn detailed_log(
    endpoint: &str,
    protocol: WireProtocol,
    request: &str,
    http_status: Option<u16>,
    response: &str,
    error: Option<&str>,
) -> String {
    let mut log = format!("POST {endpoint}\nprotocol: {protocol}\nrequest: {request}\n");
    match http_status {
        Some(status) => log.push_str(&format!("http status: {status}\n")),
        None => log.push_str("http status: none\n"),
    }
    log.push_str(&format!("response: {response}\n"));
    if let Some(error) = error {
        log.push_str(&format!("error: {error}\n"));
    }
    log
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ApiFormat;
    use crate::provider::mapper::MapperRegistry;
    use crate::provider::transport::TransportError;
    use crate::provider::transport::mock::MockTransport;

    fn provider(protocol: WireProtocol) -> ApiProvider {
        ApiProvider {
            id: "p1".into(),
            name: "Upstream".into(),
            base_url: "https://upstream.example.com/".into(),
            api_key: "secret-key".into(),
            username: Some("reseller".into()),
            api_format: ApiFormat::Json,
            wire_protocol: Some(protocol),
            is_active: true,
            auto_submit_enabled: true,
        }
    }

    fn setup(protocol: WireProtocol) -> (Arc<MockTransport>, SubmissionAdapter, ApiProvider, ProviderMapping) {
        let transport = Arc::new(MockTransport::new());
        let adapter = SubmissionAdapter::new(
            transport.clone(),
            AdapterConfig {
                timeout: Duration::from_millis(200),
                status_retries: 2,
                status_backoff: Duration::from_millis(1),
            },
        );
        let provider = provider(protocol);
        let mapping = MapperRegistry::new().resolve(&provider).unwrap();
        (transport, adapter, provider, mapping)
    }

    fn payload() -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("ID".into(), json!("771"));
        map.insert("IMEI".into(), json!("356938035643809"));
        map
    }

    #[tokio::test]
    async fn test_dhru_form_request_shape() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::DhruForm);
        transport.push_json(200, json!({"SUCCESS": [{"MESSAGE": "Order received", "REFERENCEID": 5512}]}));

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(outcome.success);
        assert_eq!(outcome.order_id.as_deref(), Some("5512"));
        assert_eq!(outcome.status.as_deref(), Some("submitted"));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "https://upstream.example.com/api");
        let RequestBody::Form(fields) = &request.body else {
            panic!("expected form body");
        };
        let field = |name: &str| {
            fields
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
                .unwrap()
        };
        assert_eq!(field("action"), "placeimeiorder");
        assert_eq!(field("username"), "reseller");
        assert_eq!(field("apiaccesskey"), "secret-key");
        let decoded = BASE64.decode(field("parameters")).unwrap();
        let params: Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(params["ID"], "771");

        // Credentials never reach the audit payload
        assert!(!outcome.request_payload.contains("secret-key"));
    }

    #[tokio::test]
    async fn test_json_request_headers() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_json(201, json!({"order_id": "EXT-1", "status": "processing"}));

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(outcome.success);
        assert_eq!(outcome.order_id.as_deref(), Some("EXT-1"));
        assert_eq!(outcome.status.as_deref(), Some("processing"));

        let request = &transport.requests()[0];
        assert_eq!(request.url, "https://upstream.example.com/orders");
        assert!(request
            .headers
            .contains(&("Authorization".into(), "Bearer secret-key".into())));
        assert!(request
            .headers
            .contains(&("X-API-Key".into(), "secret-key".into())));
        assert!(matches!(request.body, RequestBody::Json(_)));
    }

    #[tokio::test]
    async fn test_xml_round_trip() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Xml);
        transport.push_response(200, "<response><id>X-42</id><status>pending</status></response>");

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(outcome.success);
        assert_eq!(outcome.order_id.as_deref(), Some("X-42"));

        let RequestBody::Xml(xml) = &transport.requests()[0].body else {
            panic!("expected xml body");
        };
        assert!(xml.contains("<order><ID>771</ID>"));
    }

    #[tokio::test]
    async fn test_order_id_precedence() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_json(200, json!({"id": "c", "order_id": "b", "REFERENCEID": "a"}));
        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert_eq!(outcome.order_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_non_2xx_failure_messages() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_json(400, json!({"ERROR": [{"MESSAGE": "Invalid IMEI"}]}));
        transport.push_json(401, json!({"message": "bad key"}));
        transport.push_json(500, json!({"error": "boom"}));
        transport.push_response(502, "<html>gateway</html>");

        let expected = [
            (400, "Invalid IMEI"),
            (401, "bad key"),
            (500, "boom"),
            (502, "provider error 502"),
        ];
        for (status, message) in expected {
            let outcome = adapter.submit(&provider, &mapping, &payload()).await;
            assert!(!outcome.success);
            assert_eq!(outcome.http_status, Some(status));
            assert_eq!(outcome.error.as_deref(), Some(message));
            assert!(outcome.diagnosis.is_some());
        }
    }

    #[tokio::test]
    async fn test_embedded_error_despite_200() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::DhruForm);
        transport.push_json(200, json!({"ERROR": [{"MESSAGE": "Invalid IMEI"}]}));

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.http_status, Some(200));
        assert_eq!(outcome.error.as_deref(), Some("Invalid IMEI"));
        assert!(outcome.diagnosis.unwrap().is_parameter_mismatch);
    }

    #[tokio::test]
    async fn test_empty_error_element_is_not_a_failure() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::DhruForm);
        transport.push_json(200, json!({"ERROR": null, "REFERENCEID": "EXT-1"}));
        transport.push_json(200, json!({"ERROR": [], "REFERENCEID": "EXT-2"}));
        transport.push_json(200, json!({"ERROR": {}, "REFERENCEID": "EXT-3"}));

        for expected in ["EXT-1", "EXT-2", "EXT-3"] {
            let outcome = adapter.submit(&provider, &mapping, &payload()).await;
            assert!(outcome.success, "{expected}: {:?}", outcome.error);
            assert_eq!(outcome.order_id.as_deref(), Some(expected));
        }

        let (transport, adapter, provider, mapping) = setup(WireProtocol::Xml);
        transport.push_response(200, "<response><ERROR/><id>X-1</id></response>");
        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(outcome.success);
        assert_eq!(outcome.order_id.as_deref(), Some("X-1"));
    }

    #[test]
    fn test_has_error() {
        assert!(has_error(&json!({"ERROR": [{"MESSAGE": "x"}]})));
        assert!(has_error(&json!({"ERROR": "Invalid IMEI"})));
        assert!(!has_error(&json!({"ERROR": ""})));
        assert!(!has_error(&json!({"ERROR": []})));
        assert!(!has_error(&json!({"ERROR": null})));
        assert!(!has_error(&json!({"SUCCESS": []})));
    }

    #[tokio::test]
    async fn test_malformed_2xx_is_failure() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_response(200, "OK!");

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("malformed provider response"));
        assert_eq!(outcome.response_body, "OK!");
    }

    #[tokio::test]
    async fn test_transport_error_is_failure() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_error(TransportError::Connect("connection refused".into()));

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(!outcome.success);
        assert_eq!(outcome.http_status, None);
        assert!(outcome.diagnosis.unwrap().is_server_error);
        assert!(outcome.detailed_log.contains("connection refused"));
    }

    #[tokio::test]
    async fn test_timeout_is_failure_and_not_retried() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.set_delay(Duration::from_secs(5));
        transport.push_json(200, json!({"order_id": "late"}));

        let outcome = adapter.submit(&provider, &mapping, &payload()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("timed out"));
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_check_status_retries_transient_failures() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_error(TransportError::Connect("reset".into()));
        transport.push_json(503, json!({}));
        transport.push_json(200, json!({"status": "completed", "result": "UNLOCK-1234"}));

        let report = adapter.check_status(&provider, &mapping, "EXT-1").await.unwrap();
        assert_eq!(report.raw_status, "completed");
        assert_eq!(report.result.as_deref(), Some("UNLOCK-1234"));
        assert_eq!(transport.call_count(), 3);
        assert_eq!(
            transport.requests()[0].url,
            "https://upstream.example.com/orders/status"
        );
    }

    #[tokio::test]
    async fn test_check_status_gives_up() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        for _ in 0..3 {
            transport.push_json(500, json!({"error": "down"}));
        }
        let err = adapter.check_status(&provider, &mapping, "EXT-1").await.unwrap_err();
        assert_eq!(err.message, "down");
        assert_eq!(transport.call_count(), 3);
    }

    #[tokio::test]
    async fn test_check_status_does_not_retry_client_errors() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::Json);
        transport.push_json(404, json!({"message": "unknown order"}));
        let err = adapter.check_status(&provider, &mapping, "EXT-1").await.unwrap_err();
        assert!(!err.retryable);
        assert_eq!(transport.call_count(), 1);
    }

    #[tokio::test]
    async fn test_dhru_status_check() {
        let (transport, adapter, provider, mapping) = setup(WireProtocol::DhruForm);
        transport.push_json(200, json!({"SUCCESS": [{"STATUS": "approved", "CODE": "0000"}]}));

        let report = adapter.check_status(&provider, &mapping, "5512").await.unwrap();
        assert_eq!(report.raw_status, "approved");
        assert_eq!(report.result.as_deref(), Some("0000"));

        let RequestBody::Form(fields) = &transport.requests()[0].body else {
            panic!("expected form body");
        };
        assert!(fields.contains(&("action".into(), "getimeiorder".into())));
    }
}
