//! Accumulation of a body that is written or read in many frames.

use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

/// Collects every chunk of one body, in order, until [`BodyRecorder::finish`].
#[derive(Debug, Default)]
pub struct BodyRecorder {
    buf: BytesMut,
}

impl BodyRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    pub fn finish(self) -> Bytes {
        self.buf.freeze()
    }
}

/// A finished body capture.
#[derive(Debug)]
pub(crate) struct CapturedBody {
    pub bytes: Bytes,
    /// False when the body was dropped or failed before its end
    pub complete: bool,
    pub finished_at: Instant,
}

/// A [`BodyRecorder`] bound to the channel its result is delivered on.
///
/// The result is sent exactly once: by [`BodyCapture::complete`] at end of stream, or on drop
/// with `complete = false`.
#[derive(Debug)]
pub(crate) struct BodyCapture {
    recorder: BodyRecorder,
    tx: Option<oneshot::Sender<CapturedBody>>,
}

impl BodyCapture {
    pub fn new(tx: oneshot::Sender<CapturedBody>) -> Self {
        Self {
            recorder: BodyRecorder::new(),
            tx: Some(tx),
        }
    }

    pub fn record(&mut self, chunk: &[u8]) {
        self.recorder.record(chunk);
    }

    pub fn complete(mut self) {
        self.send(true);
    }

    fn send(&mut self, complete: bool) {
        if let Some(tx) = self.tx.take() {
            let recorder = std::mem::take(&mut self.recorder);
            // the receiver is gone when the exchange was abandoned, nothing to report then
            let _ = tx.send(CapturedBody {
                bytes: recorder.finish(),
                complete,
                finished_at: Instant::now(),
            });
        }
    }
}

impl Drop for BodyCapture {
    fn drop(&mut self) {
        self.send(false);
    }
}
