use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::Bytes;
use http_body::{Body, Frame, SizeHint};
use tokio::sync::oneshot;

use super::recorder::{BodyCapture, CapturedBody};

pin_project_lite::pin_project! {
    /// A body that records every data frame passing through it.
    ///
    /// Bodies of unobserved exchanges are wrapped in passthrough mode and record nothing.
    #[derive(Debug)]
    pub struct CapturingBody<B> {
        #[pin]
        inner: B,
        capture: Option<BodyCapture>,
    }
}

impl<B: Body> CapturingBody<B> {
    pub fn passthrough(inner: B) -> Self {
        Self { inner, capture: None }
    }

    pub(crate) fn recording(inner: B, tx: oneshot::Sender<CapturedBody>) -> Self {
        let capture = BodyCapture::new(tx);
        if inner.is_end_stream() {
            capture.complete();
            return Self::passthrough(inner);
        }
        Self {
            inner,
            capture: Some(capture),
        }
    }

    pub fn is_recording(&self) -> bool {
        self.capture.is_some()
    }
}

impl<B> Body for CapturingBody<B>
where
    B: Body<Data = Bytes>,
{
    type Data = Bytes;
    type Error = B::Error;

    fn poll_frame(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let mut this = self.project();
        let result = ready!(this.inner.as_mut().poll_frame(cx));

        match &result {
            Some(Ok(frame)) => {
                if let Some(capture) = this.capture.as_mut()
                    && let Some(data) = frame.data_ref()
                {
                    capture.record(data);
                }
                if this.inner.is_end_stream()
                    && let Some(capture) = this.capture.take()
                {
                    capture.complete();
                }
            }
            // dropping the capture reports it incomplete
            Some(Err(_)) => {
                this.capture.take();
            }
            None => {
                if let Some(capture) = this.capture.take() {
                    capture.complete();
                }
            }
        }

        Poll::Ready(result)
    }

    fn is_end_stream(&self) -> bool {
        self.inner.is_end_stream()
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}
