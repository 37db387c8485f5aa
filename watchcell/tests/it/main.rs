#![allow(missing_docs)]

use std::sync::{Arc, Mutex};

mod concurrency;
mod panic;
mod stream;

/// Shared log of the values a subscriber callback was called with.
#[derive(Clone)]
struct Recorder<T>(Arc<Mutex<Vec<T>>>);

impl<T: Clone + Send + 'static> Recorder<T> {
    fn new() -> Self {
        Self(Arc::new(Mutex::new(Vec::new())))
    }

    fn callback(&self) -> impl FnMut(&T) + Send + 'static {
        let values = self.0.clone();
        move |value: &T| values.lock().unwrap().push(value.clone())
    }

    fn values(&self) -> Vec<T> {
        self.0.lock().unwrap().clone()
    }
}
