//! This module defines the [`Cell`] type, a clonable value container that
//! requires only `&` access to update its inner value and notifies callback
//! subscribers of every change.

use std::{
    fmt, mem,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::{mpsc, oneshot};

use crate::{
    dispatcher::{self, AddAck, Callback, DispatcherConfig, DispatcherHandle, Instruction},
    policy::{BoxedSkipPolicy, NeverSkip, PanicPolicy, SkipEq, SkipPolicy},
    stream::ValueStream,
    SubscriberId, Subscription,
};

/// A value whose changes are delivered to subscriber callbacks.
///
/// `Cell` can be cloned cheaply, all clones refer to the same value. Writes
/// ([`set`][Self::set], [`update`][Self::update], …) are serialized by an
/// exclusive lock and never wait for subscribers: they hand the new value to
/// a dispatcher thread which calls every subscriber in turn. Use
/// [`wait`][Self::wait] to block until the deliveries enqueued so far have
/// completed.
///
/// The dispatcher thread is started by the first [`subscribe`][Self::subscribe]
/// and exits when the last subscriber is removed.
pub struct Cell<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) struct Inner<T> {
    state: Mutex<State<T>>,
    skip_policy: BoxedSkipPolicy<T>,
    config: DispatcherConfig,
}

impl<T> Inner<T> {
    /// Lock the cell's state.
    ///
    /// Poisoning is ignored: the value is only ever replaced as a whole, so a
    /// panic while the lock is held (e.g. in an updater) can't leave it half
    /// written.
    pub(crate) fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `callback` with the running dispatcher, starting one if
    /// needed. The returned receiver resolves once the initial replay ran.
    pub(crate) fn enqueue_add(
        self: &Arc<Self>,
        callback: Callback<T>,
    ) -> (Subscription<T>, oneshot::Receiver<AddAck<T>>)
    where
        T: Clone + Send + 'static,
    {
        let (ack, ack_rx) = oneshot::channel();
        let mut state = self.lock();
        let id = state.next_subscriber_id();
        let initial = state.value.clone();
        let handle = state.ensure_dispatcher(self);
        handle.send(Instruction::Add { id, callback, initial, ack });
        (Subscription::new(id, handle.clone()), ack_rx)
    }
}

pub(crate) struct State<T> {
    value: T,

    /// Source of subscriber ids. Ids are never reused so a stale
    /// `Subscription` can't remove a newer subscriber.
    next_id: u64,

    /// Incremented for each dispatcher started by this cell.
    generation: u64,

    /// The running dispatcher, if any.
    ///
    /// `Some` exactly as long as the dispatcher has subscribers, or is about
    /// to process the removal of its last one.
    dispatcher: Option<DispatcherHandle<T>>,
}

impl<T> State<T> {
    fn new(value: T) -> Self {
        Self { value, next_id: 0, generation: 0, dispatcher: None }
    }

    /// Called by a dispatcher that is exiting.
    pub(crate) fn clear_dispatcher(&mut self, generation: u64) {
        if self.dispatcher.as_ref().is_some_and(|handle| handle.generation() == generation) {
            self.dispatcher = None;
        }
    }

    fn next_subscriber_id(&mut self) -> SubscriberId {
        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        id
    }

    fn ensure_dispatcher(&mut self, inner: &Arc<Inner<T>>) -> &DispatcherHandle<T>
    where
        T: Send + 'static,
    {
        let Self { dispatcher: handle, generation, .. } = self;
        handle.get_or_insert_with(|| {
            *generation += 1;
            dispatcher::spawn(Arc::downgrade(inner), *generation, &inner.config)
        })
    }

    /// Replace the value and enqueue a delivery unless `skip_policy` deems the
    /// new value equivalent to the old one.
    fn commit(&mut self, skip_policy: &BoxedSkipPolicy<T>, value: T) -> T
    where
        T: Clone,
    {
        let notify = !skip_policy.is_equivalent(&self.value, &value);
        let previous = mem::replace(&mut self.value, value);
        if notify {
            if let Some(handle) = &self.dispatcher {
                handle.send(Instruction::Deliver(self.value.clone()));
            }
        }
        previous
    }
}

impl<T> Cell<T>
where
    T: Clone + Send + 'static,
{
    /// Create a new `Cell` with the given initial value.
    ///
    /// Every write notifies subscribers, see [`builder`][Self::builder] to
    /// configure a different [`SkipPolicy`].
    pub fn new(value: T) -> Self {
        Self::builder(value).build()
    }

    /// Create a new `Cell` that doesn't notify subscribers when a write
    /// doesn't change the value according to `PartialEq`.
    ///
    /// Don't use this for types with interior mutability, see
    /// [`SkipPolicy`].
    pub fn new_eq(value: T) -> Self
    where
        T: PartialEq,
    {
        Self::builder(value).skip_policy(SkipEq).build()
    }

    /// Start building a `Cell` with the given initial value.
    pub fn builder(value: T) -> CellBuilder<T> {
        CellBuilder::new(value)
    }

    /// Get a clone of the inner value.
    pub fn get(&self) -> T {
        self.inner.lock().value.clone()
    }

    /// Set the inner value to the given `value` and notify subscribers.
    pub fn set(&self, value: T) {
        self.replace(value);
    }

    /// Set the inner value to the given `value`, notify subscribers and return
    /// the previous value.
    pub fn replace(&self, value: T) -> T {
        self.inner.lock().commit(&self.inner.skip_policy, value)
    }

    /// Update the inner value based on the current one and notify
    /// subscribers.
    ///
    /// `f` runs while the cell is locked, so it must not access this cell.
    /// If `f` panics, the panic propagates to the caller, the inner value is
    /// left unchanged and nobody is notified.
    pub fn update(&self, f: impl FnOnce(&T) -> T) {
        let mut state = self.inner.lock();
        let value = f(&state.value);
        state.commit(&self.inner.skip_policy, value);
    }

    /// Fallible version of [`update`][Self::update].
    ///
    /// If `f` returns an error, the inner value is left unchanged, nobody is
    /// notified and the error is returned.
    pub fn try_update<E>(&self, f: impl FnOnce(&T) -> Result<T, E>) -> Result<(), E> {
        let mut state = self.inner.lock();
        let value = f(&state.value)?;
        state.commit(&self.inner.skip_policy, value);
        Ok(())
    }

    /// Register a callback that is called with every new value.
    ///
    /// The callback is called once with the current value before this method
    /// returns, then with every value written to the cell afterwards, in
    /// commit order. All calls happen on the dispatcher thread.
    ///
    /// Calling this from within a subscriber callback of the same cell
    /// doesn't wait for the initial call.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context, see
    /// [`subscribe_async`][Self::subscribe_async] for that.
    pub fn subscribe(&self, f: impl FnMut(&T) + Send + 'static) -> Subscription<T> {
        let mut callback: Callback<T> = Box::new(f);
        loop {
            let (subscription, ack) = self.inner.enqueue_add(callback);
            if subscription.on_dispatcher_thread() {
                return subscription;
            }
            match ack.blocking_recv() {
                Ok(AddAck::Rejected(returned)) => callback = returned,
                Ok(AddAck::Added) | Err(_) => return subscription,
            }
        }
    }

    /// Register a callback that is called with every new value.
    ///
    /// Resolves once the callback has been called with the current value.
    /// Otherwise the same as [`subscribe`][Self::subscribe].
    pub async fn subscribe_async(&self, f: impl FnMut(&T) + Send + 'static) -> Subscription<T> {
        let mut callback: Callback<T> = Box::new(f);
        loop {
            let (subscription, ack) = self.inner.enqueue_add(callback);
            if subscription.on_dispatcher_thread() {
                return subscription;
            }
            match ack.await {
                Ok(AddAck::Rejected(returned)) => callback = returned,
                Ok(AddAck::Added) | Err(_) => return subscription,
            }
        }
    }

    /// Obtain a [`Stream`][futures_core::Stream] of the values of this cell.
    ///
    /// The first item is the current value, followed by every value written
    /// afterwards. Values are buffered until the stream is polled. Dropping
    /// the stream unsubscribes.
    pub fn stream(&self) -> ValueStream<T> {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (subscription, ack) = self.inner.enqueue_add(Box::new(move |value: &T| {
            let _ = sender.send(value.clone());
        }));
        ValueStream::new(Arc::downgrade(&self.inner), subscription, ack, receiver)
    }

    /// Block until every delivery enqueued before this call has completed.
    ///
    /// Returns immediately if there are no subscribers, or if called from
    /// within a subscriber callback of this cell.
    ///
    /// # Panics
    ///
    /// Panics if called from within an asynchronous execution context, see
    /// [`wait_async`][Self::wait_async] for that.
    pub fn wait(&self) {
        if let Some(ack) = self.enqueue_flush() {
            let _ = ack.blocking_recv();
        }
    }

    /// Wait until every delivery enqueued before this call has completed.
    pub async fn wait_async(&self) {
        if let Some(ack) = self.enqueue_flush() {
            let _ = ack.await;
        }
    }

    /// Whether a dispatcher thread is currently running for this cell.
    pub fn is_dispatching(&self) -> bool {
        self.inner.lock().dispatcher.is_some()
    }

    fn enqueue_flush(&self) -> Option<oneshot::Receiver<()>> {
        let state = self.inner.lock();
        let handle = state.dispatcher.as_ref()?;
        if handle.is_current_thread() {
            #[cfg(feature = "tracing")]
            tracing::warn!("Can't wait for deliveries from within a subscriber callback");
            return None;
        }

        let (ack, ack_rx) = oneshot::channel();
        handle.send(Instruction::Flush(ack));
        Some(ack_rx)
    }
}

impl<T> Clone for Cell<T> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<T> Default for Cell<T>
where
    T: Clone + Default + Send + 'static,
{
    fn default() -> Self {
        Self::new(T::default())
    }
}

impl<T: fmt::Debug> fmt::Debug for Cell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.lock();
        f.debug_struct("Cell")
            .field("value", &state.value)
            .field("dispatcher", &state.dispatcher)
            .finish_non_exhaustive()
    }
}

/// Builder for a [`Cell`] with non-default settings.
///
/// ```
/// use watchcell::{Cell, PanicPolicy, SkipEq};
///
/// let cell = Cell::builder(0)
///     .skip_policy(SkipEq)
///     .panic_policy(PanicPolicy::Isolate)
///     .thread_name("counter-dispatcher")
///     .build();
/// assert_eq!(cell.get(), 0);
/// ```
#[derive(Debug)]
#[must_use]
pub struct CellBuilder<T> {
    value: T,
    skip_policy: BoxedSkipPolicy<T>,
    config: DispatcherConfig,
}

impl<T> CellBuilder<T>
where
    T: Clone + Send + 'static,
{
    fn new(value: T) -> Self {
        Self {
            value,
            skip_policy: BoxedSkipPolicy::new(NeverSkip),
            config: DispatcherConfig::default(),
        }
    }

    /// Set the policy that decides whether a write notifies subscribers.
    ///
    /// Defaults to [`NeverSkip`].
    pub fn skip_policy(mut self, policy: impl SkipPolicy<T> + 'static) -> Self {
        self.skip_policy = BoxedSkipPolicy::new(policy);
        self
    }

    /// Set what happens when a subscriber callback panics.
    ///
    /// Defaults to [`PanicPolicy::Propagate`].
    pub fn panic_policy(mut self, policy: PanicPolicy) -> Self {
        self.config.panic_policy = policy;
        self
    }

    /// Set the name of the dispatcher thread.
    pub fn thread_name(mut self, name: impl Into<String>) -> Self {
        self.config.thread_name = name.into();
        self
    }

    /// Create the [`Cell`].
    pub fn build(self) -> Cell<T> {
        let inner = Inner {
            state: Mutex::new(State::new(self.value)),
            skip_policy: self.skip_policy,
            config: self.config,
        };
        Cell { inner: Arc::new(inner) }
    }
}
