//! Webhook channel: POSTs the alert as JSON.

use std::time::Duration;

use binwatch_core::config::ChannelConfig;
use binwatch_core::pipeline::BoxFuture;
use binwatch_core::types::{Alert, Severity};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use tracing::debug;

use crate::channel::NotificationChannel;
use crate::error::{ChannelError, NotifierError};

/// HTTP(S) webhook. 5xx, 429, timeouts and connection errors are transient;
/// any other non-2xx answer is permanent.
#[derive(Debug, Clone)]
pub struct WebhookChannel {
    name: String,
    min_severity: Severity,
    url: Url,
    headers: HeaderMap,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, NotifierError> {
        let setup = |reason: String| NotifierError::Setup {
            channel: config.name.clone(),
            reason,
        };

        let url = Url::parse(&config.url).map_err(|e| setup(format!("invalid url: {e}")))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(setup(format!("unsupported scheme '{}'", url.scheme())));
        }

        let mut headers = HeaderMap::new();
        for (name, value) in &config.headers {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|e| setup(format!("invalid header name '{name}': {e}")))?;
            let value = HeaderValue::from_str(value)
                .map_err(|e| setup(format!("invalid value for header '{name}': {e}")))?;
            headers.insert(name, value);
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build()
            .map_err(|e| setup(format!("http client: {e}")))?;

        Ok(Self {
            name: config.name.clone(),
            min_severity: config.min_severity,
            url,
            headers,
            client,
        })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

impl NotificationChannel for WebhookChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn send<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(self.url.clone())
                .headers(self.headers.clone())
                .json(alert)
                .send()
                .await
                .map_err(classify_request_error)?;

            let status = response.status();
            debug!(channel = %self.name, alert_id = %alert.id, status = %status, "webhook answered");
            classify_status(status)
        })
    }
}

fn classify_request_error(err: reqwest::Error) -> ChannelError {
    if err.is_builder() {
        ChannelError::Permanent(format!("request could not be built: {err}"))
    } else {
        ChannelError::Transient(err.to_string())
    }
}

fn classify_status(status: StatusCode) -> Result<(), ChannelError> {
    if status.is_success() {
        Ok(())
    } else if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(ChannelError::Transient(format!("HTTP {status}")))
    } else {
        Err(ChannelError::Permanent(format!("HTTP {status}")))
    }
}
