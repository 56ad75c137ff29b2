use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use std::time::Instant;

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use bytes::Bytes;
use http::header::CONTENT_ENCODING;
use http::{HeaderMap, Request, Response, Uri};
use http_body::Body;
use serde_json::{Map, Value};
use tokio::sync::oneshot;
use tower::{Layer, Service};
use tracing::{Instrument, debug, info_span, warn};

use super::body::CapturingBody;
use super::recorder::CapturedBody;
use crate::models::CapturedExchange;

/// Receives every exchange the capture layer completes.
pub trait ExchangeHandler: Send + Sync + 'static {
    fn handle_exchange(&self, exchange: CapturedExchange) -> impl Future<Output = ()> + Send;
}

/// Tower layer that captures exchanges with one target host.
///
/// Wrap the HTTP client service used to reach the AI API. Requests to any other host go
/// through untouched.
pub struct CaptureLayer<H> {
    handler: Arc<H>,
    target_host: Arc<str>,
}

impl<H> CaptureLayer<H> {
    pub fn new(handler: H, target_host: impl Into<String>) -> Self {
        Self::from_arc(Arc::new(handler), target_host)
    }

    pub fn from_arc(handler: Arc<H>, target_host: impl Into<String>) -> Self {
        Self {
            handler,
            target_host: Arc::from(target_host.into()),
        }
    }
}

impl<H> Clone for CaptureLayer<H> {
    fn clone(&self) -> Self {
        Self {
            handler: self.handler.clone(),
            target_host: self.target_host.clone(),
        }
    }
}

impl<S, H> Layer<S> for CaptureLayer<H> {
    type Service = CaptureService<S, H>;

    fn layer(&self, inner: S) -> Self::Service {
        CaptureService {
            inner,
            handler: self.handler.clone(),
            target_host: self.target_host.clone(),
        }
    }
}

pub struct CaptureService<S, H> {
    inner: S,
    handler: Arc<H>,
    target_host: Arc<str>,
}

impl<S: Clone, H> Clone for CaptureService<S, H> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            handler: self.handler.clone(),
            target_host: self.target_host.clone(),
        }
    }
}

/// Whether `uri` points at `target_host`. Hostnames compare case-insensitively.
pub fn is_target_host(uri: &Uri, target_host: &str) -> bool {
    uri.host().is_some_and(|host| host.eq_ignore_ascii_case(target_host))
}

/// Snapshot of a header map as JSON text. Repeated headers become arrays.
pub fn headers_to_json(headers: &HeaderMap) -> String {
    let mut map = Map::new();
    for name in headers.keys() {
        let mut values = headers
            .get_all(name)
            .iter()
            .map(|value| Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()))
            .collect::<Vec<_>>();
        let value = if values.len() == 1 { values.remove(0) } else { Value::Array(values) };
        map.insert(name.as_str().to_string(), value);
    }
    Value::Object(map).to_string()
}

fn is_gzip(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_ENCODING)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|encoding| encoding.trim().eq_ignore_ascii_case("gzip"))
}

impl<S, H, ReqBody, ResBody> Service<Request<ReqBody>> for CaptureService<S, H>
where
    S: Service<Request<CapturingBody<ReqBody>>, Response = Response<ResBody>>,
    ReqBody: Body<Data = Bytes>,
    ResBody: Body<Data = Bytes>,
    H: ExchangeHandler,
{
    type Response = Response<CapturingBody<ResBody>>;
    type Error = S::Error;
    type Future = ResponseFuture<S::Future, H>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        if !is_target_host(req.uri(), &self.target_host) {
            let req = req.map(CapturingBody::passthrough);
            return ResponseFuture {
                inner: self.inner.call(req),
                pending: None,
            };
        }

        let (tx, request_body) = oneshot::channel();
        let pending = PendingExchange {
            method: req.method().to_string(),
            url: req.uri().to_string(),
            request_headers: headers_to_json(req.headers()),
            request_body,
            started: Instant::now(),
            handler: self.handler.clone(),
        };
        let req = req.map(|body| CapturingBody::recording(body, tx));

        ResponseFuture {
            inner: self.inner.call(req),
            pending: Some(pending),
        }
    }
}

/// Request half of an exchange, waiting for the response head.
struct PendingExchange<H> {
    method: String,
    url: String,
    request_headers: String,
    request_body: oneshot::Receiver<CapturedBody>,
    started: Instant,
    handler: Arc<H>,
}

impl<H: ExchangeHandler> PendingExchange<H> {
    /// Spawns the task that assembles the exchange once the response body ends.
    fn spawn_finalizer(self, status: u16, response_headers: String, compressed: bool, response_body: oneshot::Receiver<CapturedBody>) {
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(url = %self.url, "No tokio runtime, exchange will not be captured");
            return;
        };

        let span = info_span!("capture_exchange", url = %self.url, method = %self.method, status = status);
        runtime.spawn(
            async move {
                // a request body that was never fully sent still reports what was written
                let request_body = match self.request_body.await {
                    Ok(body) => body.bytes,
                    Err(_) => Bytes::new(),
                };

                let response = match response_body.await {
                    Ok(body) if body.complete => body,
                    Ok(body) => {
                        debug!(recorded = body.bytes.len(), "Response body ended early, exchange dropped");
                        return;
                    }
                    Err(_) => {
                        debug!("Response body capture lost, exchange dropped");
                        return;
                    }
                };

                let response_text = if compressed {
                    BASE64_STANDARD.encode(&response.bytes)
                } else {
                    String::from_utf8_lossy(&response.bytes).into_owned()
                };

                let exchange = CapturedExchange {
                    method: self.method,
                    url: self.url,
                    status: Some(status),
                    request_headers: self.request_headers,
                    request_body: String::from_utf8_lossy(&request_body).into_owned(),
                    response_headers,
                    response_body: response_text,
                    response_compressed: compressed,
                    duration: response.finished_at.saturating_duration_since(self.started),
                };

                self.handler.handle_exchange(exchange).await;
            }
            .instrument(span),
        );
    }
}

pin_project_lite::pin_project! {
    pub struct ResponseFuture<F, H> {
        #[pin]
        inner: F,
        pending: Option<PendingExchange<H>>,
    }
}

impl<F, H, ResBody, E> Future for ResponseFuture<F, H>
where
    F: Future<Output = Result<Response<ResBody>, E>>,
    ResBody: Body<Data = Bytes>,
    H: ExchangeHandler,
{
    type Output = Result<Response<CapturingBody<ResBody>>, E>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();
        let result = ready!(this.inner.poll(cx));

        let Some(pending) = this.pending.take() else {
            return Poll::Ready(result.map(|response| response.map(CapturingBody::passthrough)));
        };

        match result {
            Ok(response) => {
                let (tx, rx) = oneshot::channel();
                let status = response.status().as_u16();
                let response_headers = headers_to_json(response.headers());
                let compressed = is_gzip(response.headers());
                pending.spawn_finalizer(status, response_headers, compressed, rx);
                Poll::Ready(Ok(response.map(|body| CapturingBody::recording(body, tx))))
            }
            Err(e) => {
                debug!(url = %pending.url, "Request failed before a response arrived, exchange dropped");
                Poll::Ready(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use flate2::{Compression, write::GzEncoder};
    use http::HeaderValue;
    use http_body_util::{BodyExt, Full};
    use std::convert::Infallible;
    use std::io::Write as _;
    use std::time::Duration;
    use tokio::sync::mpsc;
    use tower::{ServiceBuilder, ServiceExt, service_fn};

    struct ChannelHandler {
        tx: mpsc::UnboundedSender<CapturedExchange>,
    }

    impl ExchangeHandler for ChannelHandler {
        fn handle_exchange(&self, exchange: CapturedExchange) -> impl Future<Output = ()> + Send {
            let _ = self.tx.send(exchange);
            std::future::ready(())
        }
    }

    const RESPONSE: &str = r#"{"id":"chatcmpl-1","choices":[{"message":{"content":"hello"}}]}"#;

    fn handler() -> (ChannelHandler, mpsc::UnboundedReceiver<CapturedExchange>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ChannelHandler { tx }, rx)
    }

    /// An upstream that reads the whole request body and answers with `RESPONSE`.
    async fn upstream(req: Request<CapturingBody<Full<Bytes>>>) -> Result<Response<Full<Bytes>>, Infallible> {
        let _ = req.into_body().collect().await?.to_bytes();
        Ok(Response::builder()
            .status(200)
            .header("content-type", "application/json")
            .body(Full::new(Bytes::from_static(RESPONSE.as_bytes())))
            .unwrap())
    }

    fn chat_request(uri: &str) -> Request<Full<Bytes>> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("authorization", "Bearer sk-test")
            .header("accept", "application/json")
            .header("accept", "text/event-stream")
            .body(Full::new(Bytes::from_static(br#"{"model":"gpt-4","messages":[]}"#)))
            .unwrap()
    }

    async fn next_exchange(rx: &mut mpsc::UnboundedReceiver<CapturedExchange>) -> Option<CapturedExchange> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv()).await.ok().flatten()
    }

    #[tokio::test]
    async fn test_captures_target_exchange() {
        let (handler, mut rx) = handler();
        let service = ServiceBuilder::new()
            .layer(CaptureLayer::new(handler, "api.openai.com"))
            .service(service_fn(upstream));

        let response = service.oneshot(chat_request("https://api.openai.com/v1/chat/completions")).await.unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, Bytes::from_static(RESPONSE.as_bytes()));

        let exchange = next_exchange(&mut rx).await.expect("exchange should be captured");
        assert_eq!(exchange.method, "POST");
        assert_eq!(exchange.url, "https://api.openai.com/v1/chat/completions");
        assert_eq!(exchange.status, Some(200));
        assert_eq!(exchange.request_body, r#"{"model":"gpt-4","messages":[]}"#);
        assert_eq!(exchange.response_body, RESPONSE);
        assert!(!exchange.response_compressed);

        let headers: Value = serde_json::from_str(&exchange.request_headers).unwrap();
        assert_eq!(headers["authorization"], "Bearer sk-test");
        assert_eq!(headers["accept"], serde_json::json!(["application/json", "text/event-stream"]));
        let response_headers: Value = serde_json::from_str(&exchange.response_headers).unwrap();
        assert_eq!(response_headers["content-type"], "application/json");
    }

    #[tokio::test]
    async fn test_other_hosts_are_not_captured() {
        let (handler, mut rx) = handler();
        let service = ServiceBuilder::new()
            .layer(CaptureLayer::new(handler, "api.openai.com"))
            .service(service_fn(upstream));

        let response = service.oneshot(chat_request("https://api.anthropic.com/v1/messages")).await.unwrap();
        assert!(!response.body().is_recording());
        let _ = response.into_body().collect().await.unwrap();

        assert!(next_exchange(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_unread_response_is_dropped() {
        let (handler, mut rx) = handler();
        let service = ServiceBuilder::new()
            .layer(CaptureLayer::new(handler, "api.openai.com"))
            .service(service_fn(|req: Request<CapturingBody<Full<Bytes>>>| async move {
                let _ = req.into_body().collect().await?;
                let chunks = futures::stream::iter(vec![
                    Ok::<_, Infallible>(http_body::Frame::data(Bytes::from_static(b"data: {}\n\n"))),
                    Ok(http_body::Frame::data(Bytes::from_static(b"data: [DONE]\n\n"))),
                ]);
                Ok::<_, Infallible>(Response::new(http_body_util::StreamBody::new(chunks)))
            }));

        let response = service.oneshot(chat_request("https://api.openai.com/v1/chat/completions")).await.unwrap();
        // the caller gives up on the stream without reading it
        drop(response);

        assert!(next_exchange(&mut rx).await.is_none());
    }

    #[tokio::test]
    async fn test_gzip_response_is_stored_encoded() {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(RESPONSE.as_bytes()).unwrap();
        let gzipped = Bytes::from(encoder.finish().unwrap());
        let expected = BASE64_STANDARD.encode(&gzipped);

        let (handler, mut rx) = handler();
        let service = ServiceBuilder::new()
            .layer(CaptureLayer::new(handler, "api.openai.com"))
            .service(service_fn(move |req: Request<CapturingBody<Full<Bytes>>>| {
                let gzipped = gzipped.clone();
                async move {
                    let _ = req.into_body().collect().await?;
                    let mut response = Response::new(Full::new(gzipped));
                    response.headers_mut().insert(CONTENT_ENCODING, HeaderValue::from_static("gzip"));
                    Ok::<_, Infallible>(response)
                }
            }));

        let response = service.oneshot(chat_request("https://api.openai.com/v1/chat/completions")).await.unwrap();
        let _ = response.into_body().collect().await.unwrap();

        let exchange = next_exchange(&mut rx).await.expect("exchange should be captured");
        assert!(exchange.response_compressed);
        assert_eq!(exchange.response_body, expected);

        let record = crate::normalize::normalize(&exchange).unwrap();
        assert_eq!(record.completion, "hello");
        assert_eq!(record.provider_id, "chatcmpl-1");
    }

    #[test]
    fn test_is_target_host() {
        let target = "api.openai.com";
        assert!(is_target_host(&Uri::from_static("https://api.openai.com/v1/models"), target));
        assert!(is_target_host(&Uri::from_static("https://API.OpenAI.com/v1/models"), target));
        assert!(!is_target_host(&Uri::from_static("https://api.openai.com.evil.test/v1"), target));
        assert!(!is_target_host(&Uri::from_static("/v1/models"), target));
    }

    #[test]
    fn test_headers_to_json() {
        let mut headers = HeaderMap::new();
        headers.insert("x-user-id", HeaderValue::from_static("u-1"));
        headers.append("accept", HeaderValue::from_static("a"));
        headers.append("accept", HeaderValue::from_static("b"));

        let json: Value = serde_json::from_str(&headers_to_json(&headers)).unwrap();
        assert_eq!(json, serde_json::json!({"x-user-id": "u-1", "accept": ["a", "b"]}));
    }
}
