use std::fmt;

use tokio::sync::oneshot;

use crate::dispatcher::{self, DispatcherHandle, Instruction};

#[cfg(doc)]
use crate::Cell;

/// Identifier of a subscriber, unique within its [`Cell`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriberId(pub(crate) u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A handle to a subscriber callback registered with [`Cell::subscribe`].
///
/// Call [`unsubscribe`][Self::unsubscribe] to remove the callback and wait
/// until it is guaranteed not to be called again. Dropping the handle also
/// removes the callback, but without waiting: a delivery that is already in
/// progress may still call it.
#[must_use = "dropping a `Subscription` unsubscribes the callback"]
pub struct Subscription<T> {
    id: SubscriberId,
    dispatcher: Option<DispatcherHandle<T>>,
}

impl<T> Subscription<T> {
    pub(crate) fn new(id: SubscriberId, dispatcher: DispatcherHandle<T>) -> Self {
        Self { id, dispatcher: Some(dispatcher) }
    }

    /// The id of this subscriber.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Whether the callback may still be called.
    ///
    /// Returns `false` after unsubscribing, and after the dispatcher that
    /// owned the callback stopped because a subscriber panicked.
    pub fn is_active(&self) -> bool {
        self.dispatcher.as_ref().is_some_and(|handle| !handle.is_closed())
    }

    /// Remove the callback and block until it is guaranteed not to be called
    /// again.
    ///
    /// Once this returns, anything the callback captured may be discarded.
    /// Calling this more than once does nothing. When called from within a
    /// subscriber callback of the same cell, this doesn't block, but the
    /// callback still won't be called for any later delivery.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context, see
    /// [`unsubscribe_async`][Self::unsubscribe_async] for that.
    pub fn unsubscribe(&mut self) {
        if let Some(ack) = self.enqueue_remove() {
            let _ = ack.blocking_recv();
        }
    }

    /// Remove the callback and wait until it is guaranteed not to be called
    /// again.
    ///
    /// Otherwise the same as [`unsubscribe`][Self::unsubscribe].
    pub async fn unsubscribe_async(&mut self) {
        if let Some(ack) = self.enqueue_remove() {
            let _ = ack.await;
        }
    }

    pub(crate) fn on_dispatcher_thread(&self) -> bool {
        self.dispatcher.as_ref().is_some_and(DispatcherHandle::is_current_thread)
    }

    fn enqueue_remove(&mut self) -> Option<oneshot::Receiver<()>> {
        let handle = self.dispatcher.take()?;
        if handle.is_current_thread() {
            // Deliveries queued ahead of the `Remove` skip detached
            // subscribers, so there is nothing to wait for.
            dispatcher::detach(self.id);
            handle.send(Instruction::Remove { id: self.id, ack: None });
            return None;
        }

        let (ack, ack_rx) = oneshot::channel();
        handle.send(Instruction::Remove { id: self.id, ack: Some(ack) }).then_some(ack_rx)
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        if let Some(handle) = self.dispatcher.take() {
            if handle.is_current_thread() {
                dispatcher::detach(self.id);
            }
            handle.send(Instruction::Remove { id: self.id, ack: None });
        }
    }
}

impl<T> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("active", &self.is_active())
            .finish()
    }
}
