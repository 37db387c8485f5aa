//! Policies that configure how a [`Cell`](crate::Cell) notifies its
//! subscribers.

use std::{
    fmt,
    hash::{Hash, Hasher},
};

/// Decides whether a write can skip notifying subscribers because the new
/// value is equivalent to the previous one.
///
/// The value is still assigned when a write is skipped, only the
/// notification is suppressed.
///
/// # Reference-like values
///
/// Skipping is unsound for types with interior mutability (for example
/// `Arc<Mutex<_>>` or `Rc<RefCell<_>>`). The "previous" value may already
/// have been mutated in place through another handle by the time it is
/// compared, so a real change would compare equal and be dropped. Use
/// [`NeverSkip`] for such types.
pub trait SkipPolicy<T>: Send + Sync {
    /// Returns `true` if `new` is equivalent to `old` and subscribers don't
    /// need to be notified.
    fn is_equivalent(&self, old: &T, new: &T) -> bool;
}

/// Always notify subscribers. This is the default policy.
#[derive(Clone, Copy, Debug, Default)]
pub struct NeverSkip;

impl<T> SkipPolicy<T> for NeverSkip {
    fn is_equivalent(&self, _old: &T, _new: &T) -> bool {
        false
    }
}

/// Skip notifying subscribers if the new value compares equal to the
/// previous value.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipEq;

impl<T: PartialEq> SkipPolicy<T> for SkipEq {
    fn is_equivalent(&self, old: &T, new: &T) -> bool {
        old == new
    }
}

/// Skip notifying subscribers if the hash of the new value equals the hash of
/// the previous value.
#[derive(Clone, Copy, Debug, Default)]
pub struct SkipHash;

impl<T: Hash> SkipPolicy<T> for SkipHash {
    fn is_equivalent(&self, old: &T, new: &T) -> bool {
        hash(old) == hash(new)
    }
}

impl<T, F> SkipPolicy<T> for F
where
    F: Fn(&T, &T) -> bool + Send + Sync,
{
    fn is_equivalent(&self, old: &T, new: &T) -> bool {
        self(old, new)
    }
}

/// What the dispatcher does when a subscriber callback panics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum PanicPolicy {
    /// Stop the dispatcher and resume the panic on its thread.
    ///
    /// Subscribers after the panicking one don't receive the value, and all
    /// subscriptions of the stopped dispatcher are discarded. Later writes
    /// notify nobody until the next `subscribe` starts a new dispatcher.
    #[default]
    Propagate,

    /// Catch the panic and keep delivering to the remaining subscribers.
    ///
    /// The panicking subscriber stays registered.
    Isolate,
}

pub(crate) struct BoxedSkipPolicy<T>(Box<dyn SkipPolicy<T>>);

impl<T> BoxedSkipPolicy<T> {
    pub(crate) fn new(policy: impl SkipPolicy<T> + 'static) -> Self {
        Self(Box::new(policy))
    }

    pub(crate) fn is_equivalent(&self, old: &T, new: &T) -> bool {
        self.0.is_equivalent(old, new)
    }
}

impl<T> fmt::Debug for BoxedSkipPolicy<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SkipPolicy")
    }
}

fn hash<T: Hash>(value: &T) -> u64 {
    use std::collections::hash_map::DefaultHasher;

    let mut hasher = DefaultHasher::new();
    value.hash(&mut hasher);
    hasher.finish()
}
