//! The synchronous HTTP primitive: templated body, auth injection, retry.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use kiwi_utils::template::expand_str;

use crate::retry::{RetryConfig, RetryOutcome, send_with_retry};

/// Default total request timeout.
pub const DEFAULT_TIMEOUT_S: u64 = 30;

/// Authentication to inject as a request header.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthSpec {
    Bearer {
        token: String,
    },
    ApiKey {
        key: String,
        /// Header the key goes into; defaults to `X-API-Key`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        header: Option<String>,
    },
    Basic {
        username: String,
        password: String,
    },
    Oauth2 {
        access_token: String,
    },
}

impl AuthSpec {
    pub(crate) fn header(&self) -> (String, String) {
        match self {
            Self::Bearer { token } | Self::Oauth2 { access_token: token } => {
                ("Authorization".to_string(), format!("Bearer {token}"))
            }
            Self::ApiKey { key, header } => (
                header.clone().unwrap_or_else(|| "X-API-Key".to_string()),
                key.clone(),
            ),
            Self::Basic { username, password } => (
                "Authorization".to_string(),
                format!("Basic {}", STANDARD.encode(format!("{username}:{password}"))),
            ),
        }
    }
}

/// Inputs to the HTTP primitive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpRequest {
    pub method: String,
    pub url: String,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<Value>,
    /// Named values substituted into string leaves of `body`.
    #[serde(default)]
    pub params: BTreeMap<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_s: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_max: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verify_ssl: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthSpec>,
}

/// Outcome of one HTTP execution. Failures are data, never panics.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct HttpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status_code: Option<u16>,
    #[serde(default)]
    pub body: Value,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Streaming mode only: events fanned out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_events_count: Option<u64>,
    /// Streaming mode only: sink kinds in declaration order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_destinations: Option<Vec<String>>,
}

impl HttpResult {
    pub(crate) fn transport_error(message: impl Into<String>, started: Instant) -> Self {
        Self {
            success: false,
            status_code: None,
            body: Value::Null,
            headers: BTreeMap::new(),
            duration_ms: started.elapsed().as_millis() as u64,
            error: Some(message.into()),
            stream_events_count: None,
            stream_destinations: None,
        }
    }
}

/// Recursively substitute `params` into the string leaves of a body.
/// Dict → dict, list → list, string → template expansion.
fn template_body(body: &Value, params: &BTreeMap<String, Value>) -> Value {
    match body {
        Value::String(s) => Value::String(expand_str(s, |name| {
            params.get(name).map(|v| match v {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })),
        Value::Array(items) => {
            Value::Array(items.iter().map(|v| template_body(v, params)).collect())
        }
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), template_body(v, params)))
                .collect(),
        ),
        other => other.clone(),
    }
}

pub(crate) fn build_client(timeout: Option<Duration>, verify_ssl: bool) -> reqwest::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder();
    if let Some(timeout) = timeout {
        builder = builder.timeout(timeout);
    }
    if !verify_ssl {
        builder = builder.danger_accept_invalid_certs(true);
    }
    builder.build()
}

/// Run the synchronous HTTP primitive.
pub async fn run_http(request: &HttpRequest) -> HttpResult {
    let started = Instant::now();

    let method = match Method::from_bytes(request.method.to_uppercase().as_bytes()) {
        Ok(method) => method,
        Err(_) => {
            return HttpResult::transport_error(
                format!("invalid HTTP method '{}'", request.method),
                started,
            );
        }
    };

    let timeout = Duration::from_secs(request.timeout_s.unwrap_or(DEFAULT_TIMEOUT_S));
    let client = match build_client(Some(timeout), request.verify_ssl.unwrap_or(true)) {
        Ok(client) => client,
        Err(e) => return HttpResult::transport_error(format!("client build failed: {e}"), started),
    };

    let body = request
        .body
        .as_ref()
        .map(|b| template_body(b, &request.params));

    let retry = RetryConfig::with_max_retries(request.retry_max.unwrap_or(3));
    debug!(method = %method, url = %request.url, "http request");

    let outcome = send_with_retry(
        || {
            let mut builder = client.request(method.clone(), &request.url);
            for (name, value) in &request.headers {
                builder = builder.header(name, value);
            }
            if let Some(auth) = &request.auth {
                let (name, value) = auth.header();
                builder = builder.header(name, value);
            }
            if let Some(body) = &body {
                builder = builder.json(body);
            }
            builder
        },
        &retry,
    )
    .await;

    match outcome {
        RetryOutcome::Success(response) | RetryOutcome::HttpError(response) => {
            let status = response.status();
            let headers = response_headers(&response);
            let text = response.text().await.unwrap_or_default();
            // JSON bodies decode automatically; anything else stays a string.
            let body = serde_json::from_str(&text).unwrap_or(Value::String(text));
            HttpResult {
                success: status.is_success(),
                status_code: Some(status.as_u16()),
                body,
                headers,
                duration_ms: started.elapsed().as_millis() as u64,
                error: (!status.is_success()).then(|| format!("HTTP {status}")),
                stream_events_count: None,
                stream_destinations: None,
            }
        }
        RetryOutcome::ConnectionError { attempts, source } => HttpResult::transport_error(
            format!("connection error after {attempts} attempts: {source}"),
            started,
        ),
    }
}

pub(crate) fn response_headers(response: &reqwest::Response) -> BTreeMap<String, String> {
    response
        .headers()
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                value.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use serde_json::json;
    use wiremock::matchers::{body_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::{AuthSpec, HttpRequest, run_http};

    fn request(method: &str, url: String) -> HttpRequest {
        HttpRequest {
            method: method.to_string(),
            url,
            headers: BTreeMap::new(),
            body: None,
            params: BTreeMap::new(),
            timeout_s: Some(5),
            retry_max: Some(0),
            verify_ssl: None,
            auth: None,
        }
    }

    #[tokio::test]
    async fn get_decodes_json_bodies() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let result = run_http(&request("GET", format!("{}/data", server.uri()))).await;
        assert!(result.success);
        assert_eq!(result.status_code, Some(200));
        assert_eq!(result.body["ok"], true);
    }

    #[tokio::test]
    async fn body_templating_substitutes_params() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/run"))
            .and(body_json(json!({"query": "hello kiwi", "count": 2})))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
            .mount(&server)
            .await;

        let mut req = request("POST", format!("{}/run", server.uri()));
        req.body = Some(json!({"query": "hello ${name}", "count": 2}));
        req.params = BTreeMap::from([("name".to_string(), json!("kiwi"))]);
        let result = run_http(&req).await;
        assert!(result.success, "error: {:?}", result.error);
    }

    #[tokio::test]
    async fn bearer_auth_is_injected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/secure"))
            .and(header("authorization", "Bearer tok-123"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let mut req = request("GET", format!("{}/secure", server.uri()));
        req.auth = Some(AuthSpec::Bearer {
            token: "tok-123".to_string(),
        });
        let result = run_http(&req).await;
        assert!(result.success);
        assert_eq!(result.body, json!("ok"));
    }

    #[tokio::test]
    async fn basic_auth_encodes_credentials() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("authorization", "Basic dXNlcjpwYXNz"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let mut req = request("GET", server.uri());
        req.auth = Some(AuthSpec::Basic {
            username: "user".to_string(),
            password: "pass".to_string(),
        });
        assert!(run_http(&req).await.success);
    }

    #[tokio::test]
    async fn server_errors_are_retried_then_surface() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(500))
            .up_to_n_times(1)
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("recovered"))
            .mount(&server)
            .await;

        let mut req = request("GET", server.uri());
        req.retry_max = Some(2);
        let result = run_http(&req).await;
        assert!(result.success);
        assert_eq!(result.body, json!("recovered"));
    }

    #[tokio::test]
    async fn client_errors_are_not_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
            .expect(1)
            .mount(&server)
            .await;

        let mut req = request("GET", server.uri());
        req.retry_max = Some(3);
        let result = run_http(&req).await;
        assert!(!result.success);
        assert_eq!(result.status_code, Some(404));
        assert!(result.error.as_deref().unwrap_or_default().contains("404"));
    }

    #[tokio::test]
    async fn connection_failure_is_a_failed_result() {
        // Nothing listens on this port.
        let result = run_http(&request("GET", "http://127.0.0.1:9".to_string())).await;
        assert!(!result.success);
        assert!(result.status_code.is_none());
        assert!(result.error.is_some());
    }

    #[tokio::test]
    async fn invalid_method_is_a_failed_result() {
        let result = run_http(&request("NOT A METHOD", "http://localhost".to_string())).await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("invalid HTTP method"));
    }
}
