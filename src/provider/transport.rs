//! HTTP transport seam for upstream provider calls

use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Request timed out after {0:?}")]
    Timeout(Duration),

    #[error("Connection failed: {0}")]
    Connect(String),

    #[error("Request failed: {0}")]
    Request(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    Json(Value),
    Xml(String),
    /// Multipart form fields, sent as text parts
    Form(Vec<(String, String)>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpRequest {
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    #[inline]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// POST-only client; every provider interaction is a POST
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

// ============================================================================
// reqwest
// ============================================================================

pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(timeout: Duration) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("reseller_ledger/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Request(e.to_string()))?;
        Ok(Self { client, timeout })
    }

    fn classify(&self, error: reqwest::Error) -> TransportError {
        if error.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else if error.is_connect() {
            TransportError::Connect(error.to_string())
        } else {
            TransportError::Request(error.to_string())
        }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let mut builder = self.client.post(&request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }

        builder = match request.body {
            RequestBody::Json(value) => builder.json(&value),
            RequestBody::Xml(xml) => builder
                .header(reqwest::header::CONTENT_TYPE, "application/xml")
                .body(xml),
            RequestBody::Form(fields) => {
                let form = fields
                    .into_iter()
                    .fold(reqwest::multipart::Form::new(), |form, (name, value)| {
                        form.text(name, value)
                    });
                builder.multipart(form)
            }
        };

        let response = builder.send().await.map_err(|e| self.classify(e))?;
        let status = response.status().as_u16();
        let body = response.text().await.map_err(|e| self.classify(e))?;

        Ok(HttpResponse { status, body })
    }
}

// ============================================================================
// Mock
// ============================================================================

#[cfg(any(test, feature = "mock-api"))]
pub mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Scripted transport: responses are served in the order they were queued
    #[derive(Default)]
    pub struct MockTransport {
        responses: Mutex<VecDeque<Result<HttpResponse, TransportError>>>,
        requests: Mutex<Vec<HttpRequest>>,
        delay: Mutex<Option<Duration>>,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn push_response(&self, status: u16, body: impl Into<String>) {
            lock(&self.responses).push_back(Ok(HttpResponse {
                status,
                body: body.into(),
            }));
        }

        pub fn push_json(&self, status: u16, body: Value) {
            self.push_response(status, body.to_string());
        }

        pub fn push_error(&self, error: TransportError) {
            lock(&self.responses).push_back(Err(error));
        }

        /// Every call sleeps this long before answering
        pub fn set_delay(&self, delay: Duration) {
            *lock(&self.delay) = Some(delay);
        }

        pub fn requests(&self) -> Vec<HttpRequest> {
            lock(&self.requests).clone()
        }

        pub fn call_count(&self) -> usize {
            lock(&self.requests).len()
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    #[async_trait]
    impl HttpTransport for MockTransport {
        async fn post(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
            lock(&self.requests).push(request);

            let delay = *lock(&self.delay);
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let next = lock(&self.responses).pop_front();
            next.unwrap_or_else(|| Err(TransportError::Request("no mock response queued".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[tokio::test]
    async fn test_reqwest_json_post() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("X-API-Key", "secret"))
            .and(body_string_contains("\"reference\":\"ord-1\""))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"order_id": "EXT-1"})))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(HttpRequest {
                url: format!("{}/orders", server.uri()),
                headers: vec![("X-API-Key".into(), "secret".into())],
                body: RequestBody::Json(json!({"reference": "ord-1"})),
            })
            .await
            .unwrap();

        assert_eq!(response.status, 201);
        assert!(response.is_success());
        assert!(response.body.contains("EXT-1"));
    }

    #[tokio::test]
    async fn test_reqwest_xml_post_sets_content_type() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/orders"))
            .and(header("content-type", "application/xml"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<r><id>1</id></r>"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(HttpRequest {
                url: format!("{}/orders", server.uri()),
                headers: vec![],
                body: RequestBody::Xml("<order/>".into()),
            })
            .await
            .unwrap();
        assert_eq!(response.body, "<r><id>1</id></r>");
    }

    #[tokio::test]
    async fn test_reqwest_multipart_form() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api"))
            .and(body_string_contains("name=\"action\""))
            .and(body_string_contains("placeimeiorder"))
            .respond_with(ResponseTemplate::new(200).set_body_string("{}"))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_secs(5)).unwrap();
        let response = transport
            .post(HttpRequest {
                url: format!("{}/api", server.uri()),
                headers: vec![],
                body: RequestBody::Form(vec![("action".into(), "placeimeiorder".into())]),
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn test_reqwest_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_millis(500)))
            .mount(&server)
            .await;

        let transport = ReqwestTransport::new(Duration::from_millis(50)).unwrap();
        let result = transport
            .post(HttpRequest {
                url: server.uri(),
                headers: vec![],
                body: RequestBody::Json(json!({})),
            })
            .await;
        assert!(matches!(result, Err(TransportError::Timeout(_))));
    }

    #[tokio::test]
    async fn test_mock_transport_replays_in_order() {
        let transport = mock::MockTransport::new();
        transport.push_response(200, "first");
        transport.push_error(TransportError::Connect("refused".into()));

        let request = HttpRequest {
            url: "http://upstream/api".into(),
            headers: vec![],
            body: RequestBody::Json(json!({})),
        };
        assert_eq!(transport.post(request.clone()).await.unwrap().body, "first");
        assert!(transport.post(request.clone()).await.is_err());
        assert!(transport.post(request).await.is_err());
        assert_eq!(transport.call_count(), 3);
    }
}
