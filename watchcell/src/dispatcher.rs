//! The serialized worker that owns a cell's subscriber registry.
//!
//! Every registry mutation and every callback invocation happens on the
//! dispatcher thread, one instruction at a time, so the registry needs no
//! lock and no lock is held while a callback runs.

use std::{
    any::Any,
    cell::RefCell,
    collections::{HashMap, HashSet},
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Weak,
    thread::{self, ThreadId},
};

use tokio::sync::{mpsc, oneshot};

use crate::{cell::Inner, policy::PanicPolicy, SubscriberId};

pub(crate) type Callback<T> = Box<dyn FnMut(&T) + Send>;

type PanicPayload = Box<dyn Any + Send>;

thread_local! {
    /// Subscribers that were unsubscribed from within a callback running on
    /// this dispatcher thread, whose `Remove` is still queued.
    static DETACHED: RefCell<HashSet<SubscriberId>> = RefCell::new(HashSet::new());
}

/// Stop calling the given subscriber right away. Only valid on the
/// subscriber's own dispatcher thread; a `Remove` must follow.
pub(crate) fn detach(id: SubscriberId) {
    DETACHED.with(|detached| detached.borrow_mut().insert(id));
}

fn is_detached(id: SubscriberId) -> bool {
    DETACHED.with(|detached| detached.borrow().contains(&id))
}

pub(crate) enum Instruction<T> {
    /// Register a subscriber and replay `initial` to it.
    Add { id: SubscriberId, callback: Callback<T>, initial: T, ack: oneshot::Sender<AddAck<T>> },
    Remove { id: SubscriberId, ack: Option<oneshot::Sender<()>> },
    Deliver(T),
    /// Acknowledged once every instruction queued before it has completed.
    Flush(oneshot::Sender<()>),
}

pub(crate) enum AddAck<T> {
    /// The subscriber is registered and its initial replay has run.
    Added,
    /// The dispatcher stopped before processing the `Add`. The callback is
    /// handed back so it can be registered with a new dispatcher.
    Rejected(Callback<T>),
}

#[derive(Clone, Debug)]
pub(crate) struct DispatcherConfig {
    pub(crate) panic_policy: PanicPolicy,
    pub(crate) thread_name: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self { panic_policy: PanicPolicy::default(), thread_name: "watchcell-dispatcher".to_owned() }
    }
}

/// Sending half of a running dispatcher.
pub(crate) struct DispatcherHandle<T> {
    sender: mpsc::UnboundedSender<Instruction<T>>,
    thread: ThreadId,
    generation: u64,
}

impl<T> DispatcherHandle<T> {
    /// Enqueue an instruction. Returns `false` if the dispatcher has already
    /// stopped, in which case the instruction is dropped.
    pub(crate) fn send(&self, instruction: Instruction<T>) -> bool {
        self.sender.send(instruction).is_ok()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    /// Whether the caller is running on this dispatcher's thread, i.e. inside
    /// one of its subscriber callbacks. Blocking on an acknowledgement from
    /// there would deadlock.
    pub(crate) fn is_current_thread(&self) -> bool {
        thread::current().id() == self.thread
    }
}

impl<T> Clone for DispatcherHandle<T> {
    fn clone(&self) -> Self {
        Self { sender: self.sender.clone(), thread: self.thread, generation: self.generation }
    }
}

impl<T> fmt::Debug for DispatcherHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatcherHandle")
            .field("thread", &self.thread)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

/// Spawn a new dispatcher thread for the given cell.
///
/// Must be called with the cell's lock held, and the first instruction sent
/// to the returned handle must be an `Add`.
///
/// # Panics
///
/// Panics if the OS fails to create the thread, like [`std::thread::spawn`].
pub(crate) fn spawn<T: Send + 'static>(
    cell: Weak<Inner<T>>,
    generation: u64,
    config: &DispatcherConfig,
) -> DispatcherHandle<T> {
    let (sender, receiver) = mpsc::unbounded_channel();
    let worker = Worker {
        cell,
        generation,
        receiver,
        subscribers: HashMap::new(),
        panic_policy: config.panic_policy,
    };

    let join_handle = thread::Builder::new()
        .name(config.thread_name.clone())
        .spawn(move || worker.run())
        .expect("failed to spawn dispatcher thread");

    #[cfg(feature = "tracing")]
    tracing::debug!(generation, thread = %config.thread_name, "Started dispatcher");

    DispatcherHandle { sender, thread: join_handle.thread().id(), generation }
}

struct Worker<T> {
    cell: Weak<Inner<T>>,
    generation: u64,
    receiver: mpsc::UnboundedReceiver<Instruction<T>>,
    subscribers: HashMap<SubscriberId, Callback<T>>,
    panic_policy: PanicPolicy,
}

impl<T> Worker<T> {
    fn run(mut self) {
        while let Some(instruction) = self.receiver.blocking_recv() {
            let ack = match self.handle(instruction) {
                Ok(ack) => ack,
                Err(payload) => {
                    self.shut_down();
                    panic::resume_unwind(payload);
                }
            };

            // The stop decision is recorded before acknowledging, so once an
            // `unsubscribe` of the last subscriber returns, the cell already
            // knows this dispatcher is gone.
            let stopped = self.subscribers.is_empty() && self.try_stop();
            if let Some(ack) = ack {
                let _ = ack.send(());
            }
            if stopped {
                break;
            }
        }
    }

    fn handle(
        &mut self,
        instruction: Instruction<T>,
    ) -> Result<Option<oneshot::Sender<()>>, PanicPayload> {
        match instruction {
            Instruction::Add { id, mut callback, initial, ack } => {
                let replay = invoke(self.panic_policy, id, &mut callback, &initial);
                self.subscribers.insert(id, callback);
                let _ = ack.send(AddAck::Added);
                replay?;
                Ok(None)
            }
            Instruction::Remove { id, ack } => {
                self.subscribers.remove(&id);
                DETACHED.with(|detached| detached.borrow_mut().remove(&id));
                Ok(ack)
            }
            Instruction::Deliver(value) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Delivering value to {} subscribers", self.subscribers.len());

                for (&id, callback) in &mut self.subscribers {
                    if is_detached(id) {
                        continue;
                    }
                    invoke(self.panic_policy, id, callback, &value)?;
                }
                Ok(None)
            }
            Instruction::Flush(ack) => Ok(Some(ack)),
        }
    }

    /// Mark this dispatcher as stopped in the cell, unless more instructions
    /// are already queued.
    ///
    /// The cell enqueues every instruction while holding its lock, so
    /// checking the queue under that same lock can't miss an `Add`.
    fn try_stop(&self) -> bool {
        let Some(cell) = self.cell.upgrade() else {
            // The cell is gone, nobody can subscribe anymore.
            return true;
        };

        let mut state = cell.lock();
        if !self.receiver.is_empty() {
            return false;
        }
        state.clear_dispatcher(self.generation);

        #[cfg(feature = "tracing")]
        tracing::debug!(generation = self.generation, "No subscribers left, stopping dispatcher");

        true
    }

    /// Tear down after a subscriber panicked under [`PanicPolicy::Propagate`].
    fn shut_down(&mut self) {
        #[cfg(feature = "tracing")]
        tracing::error!(generation = self.generation, "Subscriber panicked, stopping dispatcher");

        // Closed under the cell lock, so nobody observes the cell without a
        // dispatcher while its subscriptions still look active.
        match self.cell.upgrade() {
            Some(cell) => {
                let mut state = cell.lock();
                self.receiver.close();
                state.clear_dispatcher(self.generation);
            }
            None => self.receiver.close(),
        }

        // Nothing can be enqueued by the cell anymore. Hand pending
        // subscribers back so they can be registered elsewhere, and drop every
        // other acknowledgement so its waiter wakes up.
        while let Ok(instruction) = self.receiver.try_recv() {
            if let Instruction::Add { callback, ack, .. } = instruction {
                let _ = ack.send(AddAck::Rejected(callback));
            }
        }
        self.subscribers.clear();
    }
}

#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
fn invoke<T>(
    panic_policy: PanicPolicy,
    id: SubscriberId,
    callback: &mut Callback<T>,
    value: &T,
) -> Result<(), PanicPayload> {
    match panic::catch_unwind(AssertUnwindSafe(|| callback(value))) {
        Ok(()) => Ok(()),
        Err(payload) => match panic_policy {
            PanicPolicy::Isolate => {
                #[cfg(feature = "tracing")]
                tracing::error!(subscriber = %id, "Subscriber panicked, continuing delivery");
                Ok(())
            }
            PanicPolicy::Propagate => Err(payload),
        },
    }
}
