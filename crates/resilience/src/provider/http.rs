//! Generic HTTP provider.
//!
//! A provider is configured with a base URL, an [`AuthStrategy`] and a
//! [`ResponseParser`]; nothing here knows any provider's wire format.
//!
//! Request URL: `{base_url}/{endpoint}?{params}` (plus the auth query
//! parameter when the strategy is `QueryParam`).

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use reqwest::{Client, StatusCode};

use super::descriptor::{AuthStrategy, ProviderDescriptor};
use super::traits::DataProvider;
use crate::errors::ResilienceError;
use crate::models::{Payload, ProviderRequest};

/// Bound on establishing a connection. The overall attempt deadline is the
/// executor's `request_timeout`, so the client itself sets no total timeout.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Turns a successful response body into the payload handed to callers.
///
/// Parsers may reject a 2xx body (some APIs report errors in-band); such
/// rejections should be [`ResilienceError::Permanent`].
pub trait ResponseParser: Send + Sync {
    fn parse(&self, provider: &str, body: Vec<u8>) -> Result<Payload, ResilienceError>;
}

/// Returns the body unchanged.
#[derive(Debug, Default, Clone)]
pub struct PassthroughParser;

impl ResponseParser for PassthroughParser {
    fn parse(&self, _provider: &str, body: Vec<u8>) -> Result<Payload, ResilienceError> {
        Ok(body)
    }
}

/// Accepts JSON bodies whose status field (if present) has the expected value.
///
/// For APIs like `{"s": "ok", ...}` / `{"s": "error", "errmsg": "..."}`.
#[derive(Debug, Clone)]
pub struct JsonStatusParser {
    pub status_field: String,
    pub ok_value: String,
    pub message_field: Option<String>,
}

impl JsonStatusParser {
    pub fn new(status_field: impl Into<String>, ok_value: impl Into<String>) -> Self {
        Self {
            status_field: status_field.into(),
            ok_value: ok_value.into(),
            message_field: None,
        }
    }

    pub fn with_message_field(mut self, field: impl Into<String>) -> Self {
        self.message_field = Some(field.into());
        self
    }
}

impl ResponseParser for JsonStatusParser {
    fn parse(&self, provider: &str, body: Vec<u8>) -> Result<Payload, ResilienceError> {
        let value: serde_json::Value =
            serde_json::from_slice(&body).map_err(|e| ResilienceError::Permanent {
                provider: provider.to_string(),
                status: None,
                message: format!("invalid JSON: {e}"),
            })?;

        match value.get(&self.status_field).and_then(|s| s.as_str()) {
            Some(status) if status != self.ok_value => {
                let detail = self
                    .message_field
                    .as_deref()
                    .and_then(|field| value.get(field))
                    .and_then(|m| m.as_str())
                    .unwrap_or(status);
                Err(ResilienceError::Permanent {
                    provider: provider.to_string(),
                    status: None,
                    message: format!("provider reported error: {detail}"),
                })
            }
            _ => Ok(body),
        }
    }
}

/// HTTP provider built from a descriptor.
pub struct HttpProvider {
    descriptor: ProviderDescriptor,
    client: Client,
    parser: Arc<dyn ResponseParser>,
    timeout: Option<Duration>,
}

impl HttpProvider {
    pub fn new(descriptor: ProviderDescriptor) -> Self {
        Self::with_parser(descriptor, Arc::new(PassthroughParser))
    }

    pub fn with_parser(descriptor: ProviderDescriptor, parser: Arc<dyn ResponseParser>) -> Self {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|_| Client::new());

        Self {
            descriptor,
            client,
            parser,
            timeout: None,
        }
    }

    /// Per-request timeout for callers that use the provider outside the
    /// retry executor. Unset by default.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Use a preconfigured client (proxies, custom TLS, shared pool).
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn url_for(&self, request: &ProviderRequest) -> String {
        format!(
            "{}/{}",
            self.descriptor.base_url.trim_end_matches('/'),
            request.endpoint.trim_start_matches('/')
        )
    }

    /// Build the outgoing request with query parameters and auth applied.
    pub fn build_request(
        &self,
        request: &ProviderRequest,
    ) -> Result<reqwest::Request, ResilienceError> {
        let mut builder = self.client.get(self.url_for(request)).query(&request.params);
        if let Some(timeout) = self.timeout {
            builder = builder.timeout(timeout);
        }

        builder = match &self.descriptor.auth {
            AuthStrategy::None => builder,
            AuthStrategy::Bearer { token } => builder.bearer_auth(token),
            AuthStrategy::Header { name, value } => builder.header(name.as_str(), value.as_str()),
            AuthStrategy::QueryParam { name, value } => {
                builder.query(&[(name.as_str(), value.as_str())])
            }
        };

        builder.build().map_err(|e| ResilienceError::Permanent {
            provider: self.id().to_string(),
            status: None,
            message: format!("invalid request: {e}"),
        })
    }
}

/// Map an HTTP status to the error taxonomy. `Ok(())` for 2xx.
pub fn classify_status(provider: &str, status: StatusCode) -> Result<(), ResilienceError> {
    if status.is_success() {
        return Ok(());
    }

    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
        return Err(ResilienceError::Transient {
            provider: provider.to_string(),
            reason: format!("HTTP {}", status.as_u16()),
        });
    }

    Err(ResilienceError::Permanent {
        provider: provider.to_string(),
        status: Some(status.as_u16()),
        message: format!("HTTP error: {status}"),
    })
}

/// Transport failures are transient unless the request itself was malformed.
fn classify_transport(provider: &str, e: reqwest::Error) -> ResilienceError {
    if e.is_builder() {
        ResilienceError::Permanent {
            provider: provider.to_string(),
            status: None,
            message: e.to_string(),
        }
    } else if e.is_timeout() {
        ResilienceError::timeout(provider)
    } else {
        ResilienceError::Transient {
            provider: provider.to_string(),
            reason: e.to_string(),
        }
    }
}

#[async_trait]
impl DataProvider for HttpProvider {
    fn descriptor(&self) -> &ProviderDescriptor {
        &self.descriptor
    }

    async fn fetch(&self, request: &ProviderRequest) -> Result<Payload, ResilienceError> {
        let provider = self.id();
        let http_request = self.build_request(request)?;
        debug!("GET {} via '{}'", http_request.url().path(), provider);

        let response = self
            .client
            .execute(http_request)
            .await
            .map_err(|e| classify_transport(provider, e))?;

        classify_status(provider, response.status())?;

        let body = response
            .bytes()
            .await
            .map_err(|e| classify_transport(provider, e))?;

        self.parser.parse(provider, body.to_vec())
    }
}
