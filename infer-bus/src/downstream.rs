use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};

use futures::Stream;

use crate::frame_info::FrameInfo;

/// Entry point of the next pipeline stage. Called from arbitrary threads.
pub trait Downstream: Send + Sync {
    fn forward(&self, frame: Arc<FrameInfo>);
}

impl<F> Downstream for F
where
    F: Fn(Arc<FrameInfo>) + Send + Sync,
{
    fn forward(&self, frame: Arc<FrameInfo>) {
        self(frame)
    }
}

/// Channel-backed sink; forwarded frames are read back as a [`Stream`].
pub struct ChannelDownstream {
    writer: tokio::sync::mpsc::UnboundedSender<Arc<FrameInfo>>,
    inner: Mutex<tokio::sync::mpsc::UnboundedReceiver<Arc<FrameInfo>>>,
}

impl ChannelDownstream {
    pub fn new() -> Self {
        let (writer, receiver) = tokio::sync::mpsc::unbounded_channel();
        Self {
            writer,
            inner: Mutex::new(receiver),
        }
    }

    pub fn try_recv(&self) -> Option<Arc<FrameInfo>> {
        self.inner
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .try_recv()
            .ok()
    }

    /// Everything forwarded so far.
    pub fn drain(&self) -> Vec<Arc<FrameInfo>> {
        std::iter::from_fn(|| self.try_recv()).collect()
    }

    /// Returns a stream of forwarded frames. Use this when you have `Arc<ChannelDownstream>`.
    pub fn as_stream(this: Arc<Self>) -> ChannelDownstreamStream {
        ChannelDownstreamStream(this)
    }
}

impl Default for ChannelDownstream {
    fn default() -> Self {
        Self::new()
    }
}

impl Downstream for ChannelDownstream {
    fn forward(&self, frame: Arc<FrameInfo>) {
        if self.writer.send(frame).is_err() {
            log::warn!("downstream receiver dropped, frame discarded");
        }
    }
}

/// Wrapper to use `Arc<ChannelDownstream>` as Stream (orphan rule workaround).
pub struct ChannelDownstreamStream(pub Arc<ChannelDownstream>);

impl Stream for ChannelDownstreamStream {
    type Item = Arc<FrameInfo>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut guard = self.0.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.poll_recv(cx)
    }
}
