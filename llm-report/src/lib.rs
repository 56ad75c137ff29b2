//! # llm-report: usage reporting for OpenAI API traffic
//!
//! Observes the HTTP calls an application makes to an AI API, turns each request/response
//! pair into a [`UsageRecord`] (model, token counts, completion text, hashed key, timing)
//! and posts it to a logging endpoint. Reporting runs in the background and never affects
//! the observed call.
//!
//! ## Pipeline
//!
//! 1. **Capture.** Exchanges enter through one of two front doors:
//!    - [`CaptureLayer`], a `tower` layer for the HTTP client service. It tees request and
//!      response bodies as they stream.
//!    - [`UsageSpanExporter`], an OpenTelemetry span exporter reading the same data from
//!      `http.*` span attributes.
//! 2. **Normalize.** [`normalize`] decodes the response body (JSON or event stream,
//!    optionally gzip + base64), assembles the completion, counts tokens and strips the
//!    `Authorization` header.
//! 3. **Deliver.** [`UsageReporter`] posts the record with `x-api-key`. Failures are logged
//!    and dropped.
//!
//! ## Example
//!
//! ```no_run
//! use llm_report::{CaptureLayer, Config, UsageReporter};
//!
//! # async fn run() -> Result<(), llm_report::Error> {
//! let config = Config::load(None)?;
//! let target_host = config.target_host.clone();
//! let reporter = UsageReporter::new(config)?;
//! let layer = CaptureLayer::new(reporter, target_host);
//! // wrap the HTTP client service with `layer`
//! # let _ = layer;
//! # Ok(())
//! # }
//! ```

pub mod capture;
pub mod config;
pub mod errors;
pub mod export;
pub mod models;
pub mod normalize;
pub mod reporter;
pub mod telemetry;
pub mod tokens;

use opentelemetry_sdk::trace::SdkTracerProvider;

pub use capture::{CaptureLayer, ExchangeHandler};
pub use config::Config;
pub use errors::Error;
pub use export::UsageSpanExporter;
pub use models::{CapturedExchange, ChatMessage, UsageRecord};
pub use reporter::UsageReporter;

/// Builds a tracer provider whose spans are reported as usage records.
///
/// Spans are batched before export. Must be called inside a tokio runtime.
pub fn build_tracer_provider(config: Config) -> Result<SdkTracerProvider, Error> {
    let reporter = UsageReporter::new(config)?;
    Ok(SdkTracerProvider::builder()
        .with_batch_exporter(UsageSpanExporter::new(reporter))
        .build())
}
