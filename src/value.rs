//! The future result of a fired event.
use crate::*;
use std::sync::{Arc, Mutex};

struct ValueInner {
    value: Option<Box<dyn Any + Send>>,
    errors: bool,
    promise: bool,
    done: bool,
    observers: Vec<Box<dyn FnMut(&ValueHandle) + Send>>,
}

/// A handle to the future result of a fired event.
///
/// Holds the most-recent non-null return of a handler, an `errors` flag, a
/// `promise` flag (set once at least one handler suspended), and observers
/// informed exactly once, when the event's last handler/task finishes.
///
/// Unlike the queue and the resolution cache, a `Value` is handed to
/// external callers and may legitimately be read from a different thread
/// than the one driving the [`Manager`](crate::Manager) — hence the lock.
#[derive(Clone)]
pub struct ValueHandle {
    inner: Arc<Mutex<ValueInner>>,
}

impl ValueHandle {
    pub(crate) fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(ValueInner {
                value: None,
                errors: false,
                promise: false,
                done: false,
                observers: Vec::new(),
            })),
        }
    }

    /// Stores a non-null handler return.
    pub(crate) fn set(&self, value: Box<dyn Any + Send>) {
        self.inner.lock().unwrap().value = Some(value);
    }

    /// Marks that at least one handler suspended (returned a [`Step`](crate::Step)).
    pub(crate) fn set_promise(&self) {
        self.inner.lock().unwrap().promise = true;
    }

    /// Marks that a handler raised.
    pub(crate) fn set_errors(&self) {
        self.inner.lock().unwrap().errors = true;
    }

    /// Delivers `inform(true)`: the value is final, notify every observer.
    ///
    /// Called exactly once per event, from [`Manager`](crate::Manager)'s
    /// `event_done` gate, after the last handler/task has finished — this
    /// folds the synchronous zero-task completion path and the task-exhaustion
    /// path into one place (see `DESIGN.md`).
    pub(crate) fn inform_done(&self) {
        let mut observers = {
            let mut guard = self.inner.lock().unwrap();
            if guard.done {
                return;
            }
            guard.done = true;
            std::mem::take(&mut guard.observers)
        };
        for mut observer in observers.drain(..) {
            observer(self);
        }
    }

    /// Registers a callback run once, when [`ValueHandle::inform_done`] fires.
    ///
    /// If the value is already final the callback runs immediately.
    pub(crate) fn on_done<F>(&self, callback: F)
    where
        F: FnMut(&ValueHandle) + Send + 'static,
    {
        let mut callback = callback;
        let already_done = {
            let mut guard = self.inner.lock().unwrap();
            if guard.done {
                true
            } else {
                guard.observers.push(Box::new(callback));
                false
            }
        };
        if already_done {
            callback(self);
        }
    }

    /// Returns true if any handler for this event raised.
    pub fn has_errors(&self) -> bool {
        self.inner.lock().unwrap().errors
    }

    /// Returns true if at least one handler suspended.
    pub fn is_promise(&self) -> bool {
        self.inner.lock().unwrap().promise
    }

    /// Returns true once the value is final.
    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Returns true if `self` and `other` are handles to the *same* value
    /// cell, i.e. came from the same `fire`. Used by [`Wait`](crate::manager::Wait)
    /// to tell apart two firings of the same event name.
    pub(crate) fn same_as(&self, other: &ValueHandle) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Downcasts the most recent non-null handler return, if any.
    pub fn get<T: 'static>(&self) -> Option<T>
    where
        T: Clone,
    {
        self.inner
            .lock()
            .unwrap()
            .value
            .as_ref()
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Runs `f` against the most recent non-null handler return, if any.
    pub fn with<T: 'static, R>(&self, f: impl FnOnce(&T) -> R) -> Option<R> {
        self.inner
            .lock()
            .unwrap()
            .value
            .as_ref()
            .and_then(|v| v.downcast_ref::<T>())
            .map(f)
    }
}

impl fmt::Debug for ValueHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let guard = self.inner.lock().unwrap();
        f.debug_struct("ValueHandle")
            .field("errors", &guard.errors)
            .field("promise", &guard.promise)
            .field("done", &guard.done)
            .field("has_value", &guard.value.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_and_get_roundtrip() {
        let v = ValueHandle::new();
        v.set(Box::new(42_i32));
        assert_eq!(v.get::<i32>(), Some(42));
    }

    #[test]
    fn inform_done_runs_once() {
        let v = ValueHandle::new();
        let count = Arc::new(Mutex::new(0));
        let c = count.clone();
        v.on_done(move |_| {
            *c.lock().unwrap() += 1;
        });
        v.inform_done();
        v.inform_done();
        assert_eq!(*count.lock().unwrap(), 1);
    }

    #[test]
    fn on_done_after_final_runs_immediately() {
        let v = ValueHandle::new();
        v.inform_done();
        let ran = Arc::new(Mutex::new(false));
        let r = ran.clone();
        v.on_done(move |_| {
            *r.lock().unwrap() = true;
        });
        assert!(*ran.lock().unwrap());
    }
}
