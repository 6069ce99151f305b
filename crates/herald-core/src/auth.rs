//! Client for the application server.
//!
//! One HTTP client serves both channel authorization and lifecycle
//! webhooks; the two differ only in endpoint and form fields. Every request
//! carries the connection's session cookie and an `X-Requested-With` marker
//! so the application treats it like a same-origin XHR from the browser.

use async_trait::async_trait;
use herald_protocol::SubscribeRequest;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, COOKIE};
use serde_json::Value;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::connection::ConnectionInfo;

/// Failure talking to the application server.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// The request never produced a response (connect, TLS, timeout...).
    #[error("Error sending request to the application server: {0}")]
    Request(String),

    /// The application server answered with a non-200 status.
    #[error("Client can not be authenticated, got HTTP status {status}")]
    Rejected { status: u16, body: String },

    /// A presence authorization succeeded without identifying the user.
    #[error("Presence channel data missing from authorization response")]
    MissingMemberData,
}

impl AuthError {
    /// HTTP status reported to the client; 0 when no status applies.
    #[must_use]
    pub fn status(&self) -> u16 {
        match self {
            AuthError::Rejected { status, .. } => *status,
            AuthError::Request(_) | AuthError::MissingMemberData => 0,
        }
    }
}

/// Lifecycle notifications sent to the event endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleEvent {
    Connected,
    Disconnected,
}

impl LifecycleEvent {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleEvent::Connected => "connected",
            LifecycleEvent::Disconnected => "disconnected",
        }
    }
}

/// The application server, as seen by the channel engine.
#[async_trait]
pub trait AppServer: Send + Sync {
    /// Ask whether `connection` may join `request.channel`.
    ///
    /// Returns the application's response body: parsed JSON, or the raw
    /// text as a JSON string when it is not valid JSON.
    async fn authorize(
        &self,
        connection: &ConnectionInfo,
        request: &SubscribeRequest,
    ) -> Result<Value, AuthError>;

    /// Tell the application a connection came or went.
    async fn notify(
        &self,
        connection: &ConnectionInfo,
        event: LifecycleEvent,
    ) -> Result<(), AuthError>;
}

/// Settings of the HTTP application-server client.
#[derive(Debug, Clone)]
pub struct AppServerConfig {
    /// Base URL; its scheme is always used.
    pub host: String,
    /// Path of the channel authorization endpoint.
    pub auth_endpoint: String,
    /// Path of the lifecycle event endpoint.
    pub event_endpoint: String,
    /// Use the connection's `Host` header (port stripped) as destination host.
    pub forward_request_host: bool,
    /// Verify the application server's TLS certificate.
    pub verify_tls: bool,
    /// Upper bound on each request, connect to last body byte.
    pub timeout: Duration,
    /// Log every outcome at info/warn rather than debug.
    pub dev_mode: bool,
}

impl Default for AppServerConfig {
    fn default() -> Self {
        Self {
            host: "http://localhost".to_string(),
            auth_endpoint: "/broadcasting/auth".to_string(),
            event_endpoint: "/broadcasting/event".to_string(),
            forward_request_host: true,
            verify_tls: false,
            timeout: Duration::from_secs(10),
            dev_mode: false,
        }
    }
}

/// HTTP implementation of [`AppServer`].
pub struct HttpAppServer {
    client: reqwest::Client,
    config: AppServerConfig,
}

impl HttpAppServer {
    /// Build the client.
    ///
    /// # Errors
    ///
    /// Returns an error if the TLS backend cannot be initialized.
    pub fn new(config: AppServerConfig) -> Result<Self, AuthError> {
        if !config.verify_tls {
            debug!("TLS verification toward the application server is disabled");
        }
        let client = reqwest::Client::builder()
            .danger_accept_invalid_certs(!config.verify_tls)
            .timeout(config.timeout)
            .build()
            .map_err(|e| AuthError::Request(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Scheme and host requests for `connection` are sent to.
    #[must_use]
    pub fn base_url(&self, connection: &ConnectionInfo) -> String {
        let configured = self.config.host.trim_end_matches('/');
        let forwarded = connection
            .host
            .as_deref()
            .filter(|host| self.config.forward_request_host && !host.is_empty());

        match forwarded {
            Some(host) => {
                let scheme = configured
                    .split_once("://")
                    .map(|(scheme, _)| scheme)
                    .unwrap_or("http");
                format!("{}://{}", scheme, strip_port(host))
            }
            None => configured.to_string(),
        }
    }

    fn headers(&self, connection: &ConnectionInfo, extra: &HashMap<String, String>) -> HeaderMap {
        let mut headers = HeaderMap::with_capacity(extra.len() + 2);
        for (name, value) in extra {
            match (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_str(value),
            ) {
                (Ok(name), Ok(value)) => {
                    headers.insert(name, value);
                }
                _ => warn!(connection = %connection.id, header = %name, "Skipping invalid auth header"),
            }
        }
        if let Some(cookie) = connection
            .cookie
            .as_deref()
            .and_then(|c| HeaderValue::from_str(c).ok())
        {
            headers.insert(COOKIE, cookie);
        }
        headers.insert(
            HeaderName::from_static("x-requested-with"),
            HeaderValue::from_static("XMLHttpRequest"),
        );
        headers
    }

    async fn post(
        &self,
        connection: &ConnectionInfo,
        endpoint: &str,
        form: &[(&str, String)],
        headers: HeaderMap,
    ) -> Result<Value, AuthError> {
        let url = format!("{}{}", self.base_url(connection), endpoint);

        let response = self
            .client
            .post(&url)
            .headers(headers)
            .form(form)
            .send()
            .await
            .map_err(|e| {
                warn!(connection = %connection.id, url = %url, error = %e, "Application server unreachable");
                AuthError::Request(e.to_string())
            })?;

        let status = response.status().as_u16();
        let body = response
            .text()
            .await
            .map_err(|e| AuthError::Request(e.to_string()))?;

        if status != 200 {
            return Err(AuthError::Rejected { status, body });
        }

        Ok(match serde_json::from_str(&body) {
            Ok(value) => value,
            Err(_) => Value::String(body),
        })
    }
}

#[async_trait]
impl AppServer for HttpAppServer {
    async fn authorize(
        &self,
        connection: &ConnectionInfo,
        request: &SubscribeRequest,
    ) -> Result<Value, AuthError> {
        let mut form = vec![("channel_name", request.channel.clone())];
        if let Some(data) = &request.channel_data {
            form.push(("channel_data", data.to_string()));
        }
        let headers = self.headers(connection, &request.auth_headers());

        let result = self
            .post(connection, &self.config.auth_endpoint, &form, headers)
            .await;

        match (&result, self.config.dev_mode) {
            (Ok(_), true) => {
                info!(connection = %connection.id, channel = %request.channel, "Authenticated")
            }
            (Ok(_), false) => {
                debug!(connection = %connection.id, channel = %request.channel, "Authenticated")
            }
            (Err(e), true) => {
                warn!(connection = %connection.id, channel = %request.channel, error = %e, "Could not be authenticated")
            }
            (Err(e), false) => {
                debug!(connection = %connection.id, channel = %request.channel, error = %e, "Could not be authenticated")
            }
        }
        result
    }

    async fn notify(
        &self,
        connection: &ConnectionInfo,
        event: LifecycleEvent,
    ) -> Result<(), AuthError> {
        let form = [
            ("socket_id", connection.id.to_string()),
            ("event", event.as_str().to_string()),
        ];
        let headers = self.headers(connection, &HashMap::new());

        self.post(connection, &self.config.event_endpoint, &form, headers)
            .await?;

        if self.config.dev_mode {
            info!(connection = %connection.id, event = event.as_str(), "Event request sent");
        }
        Ok(())
    }
}

/// Drop a trailing `:port` from a Host header value.
fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // Bracketed IPv6 literal.
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.find(':') {
        Some(idx) if idx > 0 => &host[..idx],
        _ => host,
    }
}
