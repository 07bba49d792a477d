//! Write-once result cells.
//!
//! A [`Promise`] starts out pending and is settled exactly once, by
//! fulfillment, rejection or cancellation. Any clone may settle it, from any
//! thread; later attempts are ignored and reported through the `bool` they
//! return. Waiters can block ([`Promise::get`]), poll ([`Promise::try_get`]),
//! await ([`Promise::wait`], or `.await` the promise itself) or attach
//! continuations ([`Promise::on_complete`], [`Promise::then`]).
//!
//! Never block on a promise from the connection read task that is supposed to
//! resolve it: the reply can only be delivered once that task gets to run.

use crate::{lock, Error, Result};
use futures::future::BoxFuture;
use std::{
    fmt,
    future::IntoFuture,
    pin::pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};
use tokio::sync::Notify;

type Continuation<T> = Box<dyn FnOnce(Result<T>) + Send>;

enum State<T> {
    Pending(Vec<Continuation<T>>),
    Fulfilled(T),
    Rejected(Error),
    Cancelled,
}

impl<T: Clone> State<T> {
    fn outcome(&self) -> Option<Result<T>> {
        use State::*;
        match self {
            Pending(_) => None,
            Fulfilled(value) => Some(Ok(value.clone())),
            Rejected(error) => Some(Err(error.clone())),
            Cancelled => Some(Err(Error::Cancelled)),
        }
    }
}

struct Shared<T> {
    state: Mutex<State<T>>,
    settled: Condvar,
    notify: Notify,
}

pub struct Promise<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T: Clone + Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(State::Pending(Vec::new())),
                settled: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    pub fn fulfilled(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    pub fn rejected(error: Error) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: Result<T>) -> Self {
        let promise = Self::new();
        promise.complete(result);
        promise
    }

    pub fn fulfill(&self, value: T) -> bool {
        self.settle(State::Fulfilled(value))
    }

    pub fn reject(&self, error: Error) -> bool {
        self.settle(State::Rejected(error))
    }

    pub fn complete(&self, result: Result<T>) -> bool {
        match result {
            Ok(value) => self.fulfill(value),
            Err(error) => self.reject(error),
        }
    }

    /// Cancels the promise if it is still pending. A cancelled promise
    /// ignores any later completion and its waiters see [`Error::Cancelled`].
    pub fn cancel(&self) -> bool {
        self.settle(State::Cancelled)
    }

    pub fn is_done(&self) -> bool {
        !matches!(*self.lock(), State::Pending(_))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.lock(), State::Cancelled)
    }

    /// Returns the outcome without waiting, or `None` while pending.
    pub fn try_get(&self) -> Option<Result<T>> {
        self.lock().outcome()
    }

    /// Blocks the calling thread until the promise is settled.
    pub fn get(&self) -> Result<T> {
        let mut state = self.lock();
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            state = self
                .shared
                .settled
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Like [`get`](Self::get) but gives up after `timeout`. The promise
    /// itself stays pending, so a later call may still succeed.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T> {
        let mut state = self.lock();
        if let Some(outcome) = state.outcome() {
            return outcome;
        }
        // A deadline past what `Instant` can represent never expires.
        let Some(deadline) = Instant::now().checked_add(timeout) else {
            drop(state);
            return self.get();
        };
        loop {
            if let Some(outcome) = state.outcome() {
                return outcome;
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout(timeout));
            }
            let (guard, _) = self
                .shared
                .settled
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    pub async fn wait(&self) -> Result<T> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            // Register before looking at the state so a concurrent settle
            // cannot slip in between.
            notified.as_mut().enable();
            if let Some(outcome) = self.try_get() {
                return outcome;
            }
            notified.await;
        }
    }

    pub async fn wait_timeout(&self, timeout: Duration) -> Result<T> {
        tokio::time::timeout(timeout, self.wait())
            .await
            .unwrap_or(Err(Error::Timeout(timeout)))
    }

    /// Runs `f` with the outcome once the promise is settled: on the settling
    /// thread, or right away if it already is.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<T>) + Send + 'static,
    {
        let mut state = self.lock();
        if let State::Pending(continuations) = &mut *state {
            continuations.push(Box::new(f));
            return;
        }
        let outcome = state.outcome();
        drop(state);
        if let Some(outcome) = outcome {
            f(outcome);
        }
    }

    /// Derives a promise settled with `f` applied to this one's outcome.
    pub fn then<U, F>(&self, f: F) -> Promise<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(Result<T>) -> Result<U> + Send + 'static,
    {
        let derived = Promise::new();
        let target = derived.clone();
        self.on_complete(move |outcome| {
            target.complete(f(outcome));
        });
        derived
    }

    fn settle(&self, next: State<T>) -> bool {
        let mut state = self.lock();
        let State::Pending(continuations) = &mut *state else {
            return false;
        };
        let continuations = std::mem::take(continuations);
        *state = next;
        let outcome = state.outcome();
        drop(state);

        self.shared.settled.notify_all();
        self.shared.notify.notify_waiters();
        if let Some(outcome) = outcome {
            for continuation in continuations {
                continuation(outcome.clone());
            }
        }
        true
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        lock(&self.shared.state)
    }
}

impl<T: Clone + Send + 'static> IntoFuture for Promise<T> {
    type Output = Result<T>;
    type IntoFuture = BoxFuture<'static, Result<T>>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(async move { self.wait().await })
    }
}

impl<T: Clone + Send + 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let state = match &*self.lock() {
            State::Pending(_) => "pending",
            State::Fulfilled(_) => "fulfilled",
            State::Rejected(_) => "rejected",
            State::Cancelled => "cancelled",
        };
        f.debug_struct("Promise").field("state", &state).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::atomic::AtomicUsize, sync::atomic::Ordering, thread};

    #[test]
    fn second_completion_is_ignored() {
        let promise = Promise::new();
        assert!(promise.fulfill(1));
        assert!(!promise.fulfill(2));
        assert!(!promise.reject(Error::Cancelled));
        assert!(!promise.cancel());
        assert_eq!(promise.get(), Ok(1));
    }

    #[test]
    fn cancel_wins_over_late_fulfillment() {
        let promise = Promise::<u32>::new();
        assert!(promise.cancel());
        assert!(!promise.fulfill(7));
        assert!(promise.is_cancelled());
        assert_eq!(promise.get(), Err(Error::Cancelled));
    }

    #[test]
    fn get_timeout_leaves_promise_pending() {
        let promise = Promise::<u32>::new();
        let timeout = Duration::from_millis(20);
        assert_eq!(promise.get_timeout(timeout), Err(Error::Timeout(timeout)));
        assert!(!promise.is_done());

        promise.fulfill(3);
        assert_eq!(promise.get_timeout(timeout), Ok(3));
    }

    #[test]
    fn get_timeout_accepts_unbounded_timeouts() {
        let settled = Promise::fulfilled(4u32);
        assert_eq!(settled.get_timeout(Duration::MAX), Ok(4));

        let promise = Promise::new();
        let settler = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            settler.fulfill(5u32);
        });
        assert_eq!(promise.get_timeout(Duration::MAX), Ok(5));
        handle.join().unwrap();
    }

    #[test]
    fn get_blocks_until_settled_from_another_thread() {
        let promise = Promise::new();
        let settler = promise.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            settler.fulfill("done".to_owned());
        });
        assert_eq!(promise.get().as_deref(), Ok("done"));
        handle.join().unwrap();
    }

    #[test]
    fn continuations_run_once_in_either_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let promise = Promise::new();

        let before = calls.clone();
        promise.on_complete(move |outcome| {
            assert_eq!(outcome, Ok(5));
            before.fetch_add(1, Ordering::SeqCst);
        });
        promise.fulfill(5);
        promise.fulfill(6);

        let after = calls.clone();
        promise.on_complete(move |outcome| {
            assert_eq!(outcome, Ok(5));
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn then_maps_values_and_errors() {
        let promise = Promise::new();
        let doubled = promise.then(|outcome| outcome.map(|n: i32| n * 2));
        promise.fulfill(21);
        assert_eq!(doubled.try_get(), Some(Ok(42)));

        let failing = Promise::<i32>::rejected(Error::Protocol("bad".into()));
        let mapped = failing.then(|outcome| outcome.map(|n| n + 1));
        assert_eq!(mapped.try_get(), Some(Err(Error::Protocol("bad".into()))));
    }

    #[tokio::test]
    async fn awaiting_sees_settlement_from_a_task() {
        let promise = Promise::new();
        let settler = promise.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            settler.fulfill(9u8);
        });
        assert_eq!(promise.clone().await, Ok(9));
        assert_eq!(promise.wait_timeout(Duration::from_millis(1)).await, Ok(9));
    }

    #[tokio::test]
    async fn wait_timeout_expires() {
        let promise = Promise::<()>::new();
        let timeout = Duration::from_millis(10);
        assert_eq!(promise.wait_timeout(timeout).await, Err(Error::Timeout(timeout)));
    }
}
