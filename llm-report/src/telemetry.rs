//! Tracing setup for applications embedding the reporter.
//!
//! [`init_telemetry`] installs a `tracing-subscriber` registry with an `EnvFilter` (from
//! `RUST_LOG`, default `info`) and a fmt layer. Given a tracer provider, typically one from
//! [`crate::build_tracer_provider`], it also adds a `tracing-opentelemetry` layer so
//! `tracing` spans recording `http.*` fields reach the usage exporter.
//!
//! `tracing-opentelemetry` clones the tracer, not the provider, so the provider is kept in a
//! `OnceLock` for [`shutdown_telemetry`] to flush pending spans before exit.

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use std::sync::OnceLock;
use tracing::{Subscriber, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

const TRACER_NAME: &str = "llm-report";

static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// Initialize tracing, with span export to `provider` when one is given.
pub fn init_telemetry(provider: Option<&SdkTracerProvider>) -> anyhow::Result<()> {
    subscriber(provider).try_init()?;

    match provider {
        Some(provider) => {
            let _ = TRACER_PROVIDER.set(provider.clone());
            info!("Telemetry initialized with usage span export");
        }
        None => info!("Telemetry initialized (span export disabled)"),
    }

    Ok(())
}

/// The registry installed by [`init_telemetry`]: env filter, fmt output and, given a
/// provider, the OpenTelemetry bridge.
fn subscriber(provider: Option<&SdkTracerProvider>) -> impl Subscriber + Send + Sync + use<> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let otel_layer = provider.map(|provider| tracing_opentelemetry::layer().with_tracer(provider.tracer(TRACER_NAME)));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .with(otel_layer)
}

/// Shutdown the stored tracer provider, flushing spans that are still batched
pub fn shutdown_telemetry() {
    if let Some(provider) = TRACER_PROVIDER.get()
        && let Err(e) = provider.shutdown()
    {
        tracing::error!("Failed to shutdown tracer provider: {}", e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::export::UsageSpanExporter;
    use crate::reporter::UsageReporter;
    use opentelemetry_sdk::trace::SimpleSpanProcessor;
    use std::time::Duration;
    use url::Url;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_shutdown_without_init_is_noop() {
        shutdown_telemetry();
        assert!(TRACER_PROVIDER.get().is_none());
    }

    #[tokio::test]
    async fn test_tracing_spans_reach_usage_exporter() {
        let mock_server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({
                "provider_id": "chatcmpl-t",
                "completion": "hi",
                "prompt_tokens": 2,
                "completion_tokens": 1
            })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&mock_server)
            .await;

        let url = Url::parse(&format!("{}/api/v1/log/openai", mock_server.uri())).unwrap();
        let reporter = UsageReporter::new(Config::new("lr-test-key").with_logging_url(url)).unwrap();
        let provider = SdkTracerProvider::builder()
            .with_span_processor(SimpleSpanProcessor::new(UsageSpanExporter::new(reporter)))
            .build();

        tracing::subscriber::with_default(subscriber(Some(&provider)), || {
            let span = tracing::info_span!(
                "chat_completion",
                http.url = "https://api.openai.com/v1/chat/completions",
                http.method = "POST",
                http.status_code = 200_i64,
                http.request.headers = r#"{"authorization":"Bearer sk-1"}"#,
                http.request.body = r#"{"model":"gpt-4","messages":[]}"#,
                http.response.headers = "{}",
                http.response.body = r#"{"id":"chatcmpl-t","choices":[{"message":{"content":"hi"}}],"usage":{"prompt_tokens":2,"completion_tokens":1}}"#
            );
            span.in_scope(|| tracing::info!("calling completion API"));
        });

        for _ in 0..50 {
            if mock_server.received_requests().await.is_some_and(|r| !r.is_empty()) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(mock_server.received_requests().await.map(|r| r.len()), Some(1));
    }
}
