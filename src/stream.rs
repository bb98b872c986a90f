use std::future::Future;
use std::pin::Pin;
use std::task::Poll;

use futures_util::stream;
use futures_util::Stream;
use futures_util::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::model::ChunkStream;

/// Wraps a chunk stream so it ends as soon as `token` is cancelled.
/// The inner stream is dropped on cancellation, which aborts the
/// underlying upstream connection.
pub fn cancellable_stream(stream: ChunkStream, token: CancellationToken) -> ChunkStream {
    let mut cancelled = Box::pin(token.cancelled_owned());
    let mut inner = Some(stream);

    stream::poll_fn(move |cx| {
        if cancelled.as_mut().poll(cx).is_ready() {
            inner.take();
            return Poll::Ready(None);
        }

        let Some(stream) = inner.as_mut() else {
            return Poll::Ready(None);
        };
        Pin::new(stream).poll_next(cx)
    })
    .boxed()
}
