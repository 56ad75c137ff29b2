//! Usage record delivery.
//!
//! ```text
//! submit(exchange)
//!   ├─ accepts(url)?            // other hosts: nothing spawned
//!   └─ spawn on captured runtime:
//!        ├─ normalize()         // CPU only, errors drop the exchange
//!        └─ deliver()           // one POST, no retry
//! ```
//!
//! Errors never reach the caller of [`UsageReporter::submit`]. They are logged and the
//! exchange is dropped.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, error, info_span};
use url::Url;

use crate::capture::ExchangeHandler;
use crate::config::Config;
use crate::errors::Error;
use crate::models::{CapturedExchange, UsageRecord};
use crate::normalize;

const API_KEY_HEADER: &str = "x-api-key";

/// Normalizes captured exchanges and posts the resulting records to the logging endpoint.
///
/// Cheap to clone; clones share one HTTP client.
#[derive(Clone)]
pub struct UsageReporter {
    inner: Arc<Inner>,
}

struct Inner {
    client: reqwest::Client,
    config: Config,
    runtime: Handle,
}

impl fmt::Debug for UsageReporter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UsageReporter").field("config", &self.inner.config).finish_non_exhaustive()
    }
}

impl UsageReporter {
    /// Validates `config`, builds the delivery client and binds to the current tokio runtime.
    pub fn new(config: Config) -> Result<Self, Error> {
        config.validate()?;
        let client = reqwest::Client::builder().timeout(config.request_timeout).build()?;
        let runtime = Handle::try_current().map_err(|_| Error::NoRuntime)?;
        Ok(Self::with_client(config, client, runtime))
    }

    /// Reporter with a caller-supplied client and runtime. `config` is used as is.
    pub fn with_client(config: Config, client: reqwest::Client, runtime: Handle) -> Self {
        Self {
            inner: Arc::new(Inner { client, config, runtime }),
        }
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Whether `url` points at the target host.
    pub fn accepts(&self, url: &str) -> bool {
        Url::parse(url)
            .ok()
            .and_then(|url| url.host_str().map(|host| host.eq_ignore_ascii_case(&self.inner.config.target_host)))
            .unwrap_or(false)
    }

    /// Reports `exchange` in the background. Returns `None` when its host is not observed.
    pub fn submit(&self, exchange: CapturedExchange) -> Option<JoinHandle<()>> {
        if !self.accepts(&exchange.url) {
            debug!(url = %exchange.url, "Exchange is not for the target host, skipping");
            return None;
        }

        let reporter = self.clone();
        Some(self.inner.runtime.spawn(async move { reporter.report_logged(exchange).await }))
    }

    /// Normalizes and delivers `exchange`, waiting for the endpoint's answer.
    ///
    /// Returns the delivered record, or `None` when the host is not observed.
    pub async fn report(&self, exchange: CapturedExchange) -> Result<Option<UsageRecord>, Error> {
        if !self.accepts(&exchange.url) {
            return Ok(None);
        }

        let record = normalize::normalize_with_user_header(&exchange, &self.inner.config.user_id_header)?;
        self.deliver(&record).await?;
        Ok(Some(record))
    }

    /// Posts one record to the logging endpoint.
    pub async fn deliver(&self, record: &UsageRecord) -> Result<(), Error> {
        let response = self
            .inner
            .client
            .post(self.inner.config.logging_url.clone())
            .header(API_KEY_HEADER, &self.inner.config.api_key)
            .json(record)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::Rejected { status: status.as_u16() });
        }

        debug!(status = status.as_u16(), model = %record.model, "Usage record delivered");
        Ok(())
    }

    async fn report_logged(&self, exchange: CapturedExchange) {
        let span = info_span!("usage_report", url = %exchange.url, method = %exchange.method);
        async move {
            match self.report(exchange).await {
                Ok(_) => {}
                Err(e) if e.is_normalization_error() => {
                    error!(error = %e, "Failed to normalize exchange, dropped");
                }
                Err(e) => {
                    error!(error = %e, "Failed to deliver usage record, dropped");
                }
            }
        }
        .instrument(span)
        .await
    }
}

impl ExchangeHandler for UsageReporter {
    fn handle_exchange(&self, exchange: CapturedExchange) -> impl Future<Output = ()> + Send {
        let reporter = self.clone();
        async move {
            if reporter.accepts(&exchange.url) {
                reporter.report_logged(exchange).await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::time::Duration;
    use wiremock::matchers::{body_partial_json, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const RESPONSE: &str = r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hello"}}],"usage":{"prompt_tokens":12,"completion_tokens":3}}"#;

    fn config(server: &MockServer) -> Config {
        let url = Url::parse(&format!("{}/api/v1/log/openai", server.uri())).unwrap();
        Config::new("lr-test-key").with_logging_url(url)
    }

    fn exchange(url: &str) -> CapturedExchange {
        CapturedExchange {
            method: "POST".to_string(),
            url: url.to_string(),
            status: Some(200),
            request_headers: json!({"authorization": "Bearer sk-ABC123", "x-user-id": "user-1"}).to_string(),
            request_body: json!({"model": "gpt-4", "messages": [{"role": "user", "content": "hi"}]}).to_string(),
            response_headers: r#"{"content-type":"application/json"}"#.to_string(),
            response_body: RESPONSE.to_string(),
            response_compressed: false,
            duration: Duration::from_millis(120),
        }
    }

    #[tokio::test]
    async fn test_report_delivers_record() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/log/openai"))
            .and(header("x-api-key", "lr-test-key"))
            .and(body_partial_json(json!({
                "provider_id": "chatcmpl-1",
                "user_id": "user-1",
                "model": "gpt-4",
                "prompt_tokens": 12,
                "completion_tokens": 3,
                "completion": "hello",
                "streamed": false
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let reporter = UsageReporter::new(config(&mock_server)).unwrap();
        let record = reporter
            .report(exchange("https://api.openai.com/v1/chat/completions"))
            .await
            .unwrap()
            .expect("target host should be reported");

        assert!(!record.request_headers.contains("sk-ABC123"));
        assert!(record.hashed_key.is_some());
    }

    #[tokio::test]
    async fn test_other_hosts_are_ignored() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&mock_server)
            .await;

        let reporter = UsageReporter::new(config(&mock_server)).unwrap();

        assert!(!reporter.accepts("https://api.anthropic.com/v1/messages"));
        assert!(!reporter.accepts("not a url"));
        assert!(reporter.accepts("https://API.OPENAI.COM/v1/models"));
        assert!(reporter.submit(exchange("https://api.anthropic.com/v1/messages")).is_none());
        let result = reporter.report(exchange("https://api.anthropic.com/v1/messages")).await.unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_rejected_status_is_an_error() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&mock_server)
            .await;

        let reporter = UsageReporter::new(config(&mock_server)).unwrap();
        let err = reporter
            .report(exchange("https://api.openai.com/v1/chat/completions"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Rejected { status: 500 }));
    }

    #[tokio::test]
    async fn test_network_failure_is_an_error() {
        let config = Config::new("lr-test-key")
            .with_logging_url(Url::parse("http://127.0.0.1:1/api/v1/log/openai").unwrap());
        let reporter = UsageReporter::new(config).unwrap();

        let err = reporter
            .report(exchange("https://api.openai.com/v1/chat/completions"))
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Delivery(_)));
        assert!(!err.is_normalization_error());
    }

    #[tokio::test]
    async fn test_submit_swallows_errors() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .expect(1)
            .mount(&mock_server)
            .await;

        let reporter = UsageReporter::new(config(&mock_server)).unwrap();
        let handle = reporter
            .submit(exchange("https://api.openai.com/v1/chat/completions"))
            .expect("target host should be submitted");

        // the task completes normally even though delivery failed
        handle.await.unwrap();

        let mut bad = exchange("https://api.openai.com/v1/chat/completions");
        bad.request_body = "{broken".to_string();
        reporter.submit(bad).unwrap().await.unwrap();
    }

    #[tokio::test]
    async fn test_new_rejects_invalid_config() {
        let err = UsageReporter::new(Config::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig { .. }));
    }

    #[test]
    fn test_new_outside_runtime() {
        let err = UsageReporter::new(Config::new("lr-test-key")).unwrap_err();
        assert!(matches!(err, Error::NoRuntime));
    }

    #[tokio::test]
    async fn test_debug_redacts_api_key() {
        let reporter = UsageReporter::new(Config::new("lr-secret")).unwrap();
        assert!(!format!("{reporter:?}").contains("lr-secret"));
    }
}
