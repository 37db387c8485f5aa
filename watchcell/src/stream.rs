use std::{
    fmt,
    future::{poll_fn, Future},
    pin::Pin,
    sync::Weak,
    task::{ready, Context, Poll},
};

use futures_core::Stream;
use tokio::sync::{mpsc, oneshot};

use crate::{cell::Inner, dispatcher::AddAck, SubscriberId, Subscription};

#[cfg(doc)]
use crate::Cell;

/// A stream of the values of a [`Cell`], created by [`Cell::stream`].
///
/// Unlike a callback subscriber, a `ValueStream` buffers every delivered
/// value until it is polled. The stream ends if the dispatcher feeding it
/// stops because another subscriber panicked.
pub struct ValueStream<T> {
    cell: Weak<Inner<T>>,
    receiver: mpsc::UnboundedReceiver<T>,
    subscription: Subscription<T>,
    /// Acknowledgement of the `Add` that registered this stream, until it
    /// has been received.
    pending: Option<oneshot::Receiver<AddAck<T>>>,
}

impl<T> ValueStream<T>
where
    T: Clone + Send + 'static,
{
    pub(crate) fn new(
        cell: Weak<Inner<T>>,
        subscription: Subscription<T>,
        pending: oneshot::Receiver<AddAck<T>>,
        receiver: mpsc::UnboundedReceiver<T>,
    ) -> Self {
        Self { cell, receiver, subscription, pending: Some(pending) }
    }

    /// Wait for the next value.
    ///
    /// This method is a convenience so you don't have to import a `Stream`
    /// extension trait such as `futures::StreamExt` or
    /// `tokio_stream::StreamExt`.
    #[allow(clippy::should_implement_trait)]
    pub async fn next(&mut self) -> Option<T> {
        poll_fn(|cx| Pin::new(&mut *self).poll_next(cx)).await
    }

    /// The id of the subscriber feeding this stream.
    ///
    /// May change on the first poll if the stream had to be registered with
    /// a new dispatcher.
    pub fn id(&self) -> SubscriberId {
        self.subscription.id()
    }

    /// Drive the registration of this stream's subscriber.
    ///
    /// An `Add` that was still queued when its dispatcher stopped is handed
    /// back; it is registered again, with a fresh replay of the current value.
    fn poll_registered(&mut self, cx: &mut Context<'_>) -> Poll<()> {
        while let Some(pending) = &mut self.pending {
            match ready!(Pin::new(pending).poll(cx)) {
                Ok(AddAck::Rejected(callback)) => {
                    let Some(cell) = self.cell.upgrade() else {
                        self.pending = None;
                        break;
                    };
                    let (subscription, ack) = cell.enqueue_add(callback);
                    self.subscription = subscription;
                    self.pending = Some(ack);
                }
                Ok(AddAck::Added) | Err(_) => self.pending = None,
            }
        }
        Poll::Ready(())
    }
}

impl<T> Stream for ValueStream<T>
where
    T: Clone + Send + 'static,
{
    type Item = T;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        // The replay is sent before the `Add` is acknowledged, so the
        // receiver is polled even while registration is pending.
        let _ = this.poll_registered(cx);
        this.receiver.poll_recv(cx)
    }
}

impl<T> fmt::Debug for ValueStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueStream").field("subscription", &self.subscription).finish()
    }
}
