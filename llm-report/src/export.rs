//! OpenTelemetry span exporter feeding the reporter.
//!
//! Spans produced by HTTP client instrumentation carry the exchange in `http.*` attributes
//! (see [`crate::models::attributes`]). Each exported span is turned back into a
//! [`CapturedExchange`] and handed to [`UsageReporter::submit`].

use std::future::{Future, ready};

use opentelemetry_sdk::error::OTelSdkResult;
use opentelemetry_sdk::trace::{SpanData, SpanExporter};
use tracing::trace;

use crate::models::CapturedExchange;
use crate::reporter::UsageReporter;

#[derive(Debug, Clone)]
pub struct UsageSpanExporter {
    reporter: UsageReporter,
}

impl UsageSpanExporter {
    pub fn new(reporter: UsageReporter) -> Self {
        Self { reporter }
    }

    pub fn reporter(&self) -> &UsageReporter {
        &self.reporter
    }
}

/// Rebuilds the exchange recorded on `span`. The span's duration becomes the exchange duration.
pub fn span_to_exchange(span: &SpanData) -> CapturedExchange {
    let duration = span.end_time.duration_since(span.start_time).unwrap_or_default();
    CapturedExchange::from_attributes(&span.attributes, duration)
}

impl SpanExporter for UsageSpanExporter {
    /// Submits every span of the batch and reports success without waiting for deliveries.
    fn export(&self, batch: Vec<SpanData>) -> impl Future<Output = OTelSdkResult> + Send {
        trace!(spans = batch.len(), "Exporting span batch");
        for span in &batch {
            let _ = self.reporter.submit(span_to_exchange(span));
        }
        ready(Ok(()))
    }
}
