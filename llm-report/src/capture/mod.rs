//! HTTP exchange capture.
//!
//! [`CaptureLayer`] wraps an HTTP client service. For requests to the target host it records
//! the request, tees the response body as the caller reads it, and hands the finished
//! [`CapturedExchange`](crate::models::CapturedExchange) to an [`ExchangeHandler`]. The caller
//! sees the same bytes, in the same order, with no added buffering.

mod body;
mod layer;
mod recorder;

pub use body::CapturingBody;
pub use layer::{CaptureLayer, CaptureService, ExchangeHandler, ResponseFuture, headers_to_json, is_target_host};
pub use recorder::BodyRecorder;
