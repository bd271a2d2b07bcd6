//! REST transport over a reqwest session.

use super::response::{parse_body, snippet};
use crate::error::{DataResult, DataRetrievalError};
use crate::models::{HttpMethod, RawResult, RestConfig, RestRequest};
use crate::transport::AsyncTransport;
use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, Method, StatusCode};
use serde_json::{Map, Value as JsonValue, json};
use std::time::Instant;
use tracing::debug;

/// Characters of an error body kept in the error message.
const ERROR_SNIPPET_CHARS: usize = 200;

#[derive(Debug, Clone)]
pub struct RestTransport {
    config: RestConfig,
}

/// An open HTTP session: the configured client and its cookie store.
#[derive(Debug, Clone)]
pub struct RestSession {
    client: Client,
}

impl RestSession {
    pub fn client(&self) -> &Client {
        &self.client
    }
}

impl RestTransport {
    pub fn new(config: RestConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &RestConfig {
        &self.config
    }

    fn build_client(&self) -> DataResult<Client> {
        let mut headers = HeaderMap::new();
        for (name, value) in &self.config.headers {
            let (name, value) = header_pair(name, value).map_err(|e| {
                DataRetrievalError::connection(format!("Invalid default header: {e}"))
            })?;
            headers.insert(name, value);
        }
        Client::builder()
            .default_headers(headers)
            .user_agent(self.config.user_agent.clone())
            .timeout(self.config.timeout)
            .cookie_store(true)
            .danger_accept_invalid_certs(!self.config.verify_ssl)
            .build()
            .map_err(|e| DataRetrievalError::connection_with("Failed to build HTTP client", e))
    }

    fn request_error(&self, operation: &str, err: reqwest::Error) -> DataRetrievalError {
        if err.is_timeout() {
            DataRetrievalError::timeout_with(operation, Some(self.config.timeout), err)
        } else {
            err.into()
        }
    }

    /// GET the health path, or the base URL when none is configured.
    async fn ping(&self, client: &Client) -> DataResult<StatusCode> {
        let url = self
            .config
            .endpoint_url(self.config.health_path.as_deref().unwrap_or_default());
        let operation = format!("GET {url}");
        let response = client
            .get(&url)
            .send()
            .await
            .map_err(|e| self.request_error(&operation, e))?;
        Ok(response.status())
    }
}

#[async_trait]
impl AsyncTransport for RestTransport {
    type Handle = RestSession;
    type Request = RestRequest;

    fn name(&self) -> &'static str {
        "rest"
    }

    async fn open(&self) -> DataResult<RestSession> {
        let client = self.build_client()?;
        if self.config.health_path.is_some() {
            let status = self.ping(&client).await?;
            if !status.is_success() {
                return Err(DataRetrievalError::connection(format!(
                    "Health check against {} returned {status}",
                    self.config.base_url
                )));
            }
        }
        debug!(base_url = %self.config.base_url, "HTTP session ready");
        Ok(RestSession { client })
    }

    async fn close(&self, _session: RestSession) -> DataResult<()> {
        // Dropping the client releases its connection pool.
        Ok(())
    }

    async fn run(&self, session: &RestSession, request: &RestRequest) -> DataResult<RawResult> {
        let url = self.config.endpoint_url(&request.endpoint);
        let operation = format!("{} {url}", request.method);

        let mut builder = session
            .client
            .request(reqwest_method(request.method), &url)
            .query(&request.query);
        for (name, value) in &request.headers {
            let (name, value) = header_pair(name, value).map_err(DataRetrievalError::validation)?;
            builder = builder.header(name, value);
        }
        if let Some(body) = &request.body {
            if request.method.carries_body() {
                builder = builder.json(body);
            }
        }

        let started = Instant::now();
        let response = builder
            .send()
            .await
            .map_err(|e| self.request_error(&operation, e))?;
        let status = response.status();
        let final_url = response.url().to_string();
        let headers: Map<String, JsonValue> = response
            .headers()
            .iter()
            .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.to_string(), json!(v))))
            .collect();
        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(String::from);
        let body = response
            .bytes()
            .await
            .map_err(|e| self.request_error(&operation, e))?;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        if !status.is_success() {
            return Err(DataRetrievalError::query(format!(
                "{operation} returned {status}: {}",
                snippet(&body, ERROR_SNIPPET_CHARS)
            )));
        }

        let parsed = parse_body(content_type.as_deref(), &body);
        debug!(
            url = %final_url,
            status = status.as_u16(),
            records = parsed.records.len(),
            elapsed_ms,
            "HTTP request completed"
        );

        let mut raw = RawResult::new(parsed.records)
            .with_metadata("status_code", status.as_u16())
            .with_metadata("url", final_url)
            .with_metadata("method", request.method.as_str())
            .with_metadata("headers", JsonValue::Object(headers))
            .with_metadata("request_time_ms", elapsed_ms);
        if !parsed.pagination.is_empty() {
            raw = raw.with_metadata("pagination", JsonValue::Object(parsed.pagination));
        }
        if let Some(total) = parsed.total_count {
            raw = raw.with_total_count(total);
        }
        if status == StatusCode::PARTIAL_CONTENT {
            raw = raw.partial();
        }
        Ok(raw)
    }

    async fn probe(&self, session: &RestSession) -> bool {
        match self.ping(&session.client).await {
            Ok(status) => status.is_success(),
            Err(e) => {
                debug!(error = %e, "Health probe failed");
                false
            }
        }
    }
}

fn reqwest_method(method: HttpMethod) -> Method {
    match method {
        HttpMethod::Get => Method::GET,
        HttpMethod::Post => Method::POST,
        HttpMethod::Put => Method::PUT,
        HttpMethod::Patch => Method::PATCH,
        HttpMethod::Delete => Method::DELETE,
    }
}

fn header_pair(name: &str, value: &str) -> Result<(HeaderName, HeaderValue), String> {
    let header_name =
        HeaderName::from_bytes(name.as_bytes()).map_err(|_| format!("bad header name '{name}'"))?;
    let header_value =
        HeaderValue::from_str(value).map_err(|_| format!("bad value for header '{name}'"))?;
    Ok((header_name, header_value))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;

    #[test]
    fn test_header_pair() {
        assert!(header_pair("X-Api-Key", "secret").is_ok());
        assert!(header_pair("bad header", "v").is_err());
        assert!(header_pair("X-Ok", "line\nbreak").is_err());
    }

    #[test]
    fn test_invalid_default_header_fails_client_build() {
        let transport =
            RestTransport::new(RestConfig::new("http://localhost").with_header("bad header", "x"));
        let err = transport.build_client().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
    }

    #[tokio::test]
    async fn test_open_unreachable_is_connection_error() {
        // Port 9 (discard) on localhost is closed on test machines.
        let transport = RestTransport::new(
            RestConfig::new("http://127.0.0.1:9").with_timeout(std::time::Duration::from_secs(2)),
        );
        let err = transport.open().await.unwrap_err();
        assert!(matches!(
            err.kind(),
            ErrorKind::Connection | ErrorKind::Timeout
        ));
    }

    #[tokio::test]
    async fn test_open_without_health_path_skips_probe() {
        let transport =
            RestTransport::new(RestConfig::new("http://127.0.0.1:9").with_health_path(None));
        assert!(transport.open().await.is_ok());
    }
}
