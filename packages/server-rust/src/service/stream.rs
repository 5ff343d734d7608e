//! Wire-facing view of a streamed call.
//!
//! [`ResultStream`] turns a function's [`ItemStream`] into [`StreamChunk`]s
//! and guarantees exactly one terminal chunk: an `Err` item or a panic while
//! polling becomes an `error` chunk, and an inner stream that simply ends is
//! closed with a synthesized `done`. Nothing runs until the consumer polls.

use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::task::{Context, Poll};

use forrst_core::{ErrorInfo, StreamChunk};
use futures_util::Stream;
use tokio_util::sync::CancellationToken;
use tracing::error;

use super::error::DispatchError;
use super::function::{ItemStream, StreamItem};

/// Chunk stream of one streamed call.
///
/// Dropping it, or calling [`cancel`](Self::cancel), fires the producer's
/// cancellation token.
pub struct ResultStream {
    inner: Option<ItemStream>,
    cancel: CancellationToken,
}

impl ResultStream {
    #[must_use]
    pub fn new(inner: ItemStream, cancel: CancellationToken) -> Self {
        Self {
            inner: Some(inner),
            cancel,
        }
    }

    /// Stream that yields one `error` chunk, for producers that failed to
    /// start.
    #[must_use]
    pub fn failed(err: &DispatchError) -> Self {
        let info = err.to_error_info();
        let inner: ItemStream = Box::pin(futures_util::stream::once(async move {
            Err(DispatchError::Application(info))
        }));
        Self::new(inner, CancellationToken::new())
    }

    /// Stops the producer and ends the stream without a terminal chunk.
    pub fn cancel(&mut self) {
        self.cancel.cancel();
        self.inner = None;
    }

    /// Whether a terminal chunk has been yielded or the stream was cancelled.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }
}

fn into_chunk(item: StreamItem) -> StreamChunk {
    match item {
        StreamItem::Progress { progress, message } => StreamChunk::progress(progress, message),
        StreamItem::Data(data) => StreamChunk::Data { data },
        StreamItem::Done(result) => StreamChunk::Done { result },
    }
}

impl Stream for ResultStream {
    type Item = StreamChunk;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<StreamChunk>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let polled = std::panic::catch_unwind(AssertUnwindSafe(|| inner.as_mut().poll_next(cx)));
        let chunk = match polled {
            Ok(Poll::Pending) => return Poll::Pending,
            Ok(Poll::Ready(Some(Ok(item)))) => into_chunk(item),
            Ok(Poll::Ready(Some(Err(err)))) => StreamChunk::Error {
                errors: vec![err.to_error_info()],
            },
            Ok(Poll::Ready(None)) => StreamChunk::Done { result: None },
            Err(_) => {
                error!("stream producer panicked");
                StreamChunk::error(ErrorInfo::internal())
            }
        };
        if chunk.is_terminal() {
            this.inner = None;
        }
        Poll::Ready(Some(chunk))
    }
}

impl Drop for ResultStream {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
