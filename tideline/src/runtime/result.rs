//! Single-assignment completion cell.
//!
//! An [`AsyncResult`] starts pending and is completed exactly once, either with
//! a value or with an [`Error`]. A single completion callback may be
//! registered; it runs on whichever thread performs the completing transition,
//! or immediately on the registering thread if the result is already complete.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, OnceLock};
use std::task::{Context as TaskContext, Poll, Waker};

use parking_lot::Mutex;

use crate::error::Error;

type Handler<T> = Box<dyn FnOnce(Result<&T, &Error>) + Send + 'static>;

struct Shared<T> {
    /// Terminal outcome. Written once, while `handler` is locked.
    outcome: OnceLock<Result<T, Error>>,
    handler: Mutex<Option<Handler<T>>>,
}

/// Handle to a single-assignment result cell. Clones share the cell.
pub struct AsyncResult<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for AsyncResult<T> {
    fn clone(&self) -> Self {
        AsyncResult {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Send + Sync + 'static> Default for AsyncResult<T> {
    fn default() -> Self {
        Self::pending()
    }
}

impl<T: Send + Sync + 'static> AsyncResult<T> {
    /// Create a pending result.
    pub fn pending() -> Self {
        AsyncResult {
            shared: Arc::new(Shared {
                outcome: OnceLock::new(),
                handler: Mutex::new(None),
            }),
        }
    }

    /// Create a result that has already succeeded.
    pub fn succeeded(value: T) -> Self {
        let res = Self::pending();
        let _ = res.shared.outcome.set(Ok(value));
        res
    }

    /// Create a result that has already failed.
    pub fn failed(err: Error) -> Self {
        let res = Self::pending();
        let _ = res.shared.outcome.set(Err(err));
        res
    }

    /// Complete with a value.
    ///
    /// Returns [`Error::AlreadyComplete`] if the result was already completed.
    pub fn complete(&self, value: T) -> Result<(), Error> {
        self.transition(Ok(value))
    }

    /// Complete with a failure.
    ///
    /// Returns [`Error::AlreadyComplete`] if the result was already completed.
    pub fn fail(&self, err: Error) -> Result<(), Error> {
        self.transition(Err(err))
    }

    /// Like [`complete`](Self::complete), but reports a lost race as `false`.
    pub fn try_complete(&self, value: T) -> bool {
        self.complete(value).is_ok()
    }

    /// Like [`fail`](Self::fail), but reports a lost race as `false`.
    pub fn try_fail(&self, err: Error) -> bool {
        self.fail(err).is_ok()
    }

    fn transition(&self, outcome: Result<T, Error>) -> Result<(), Error> {
        let handler = {
            let mut slot = self.shared.handler.lock();
            if self.shared.outcome.set(outcome).is_err() {
                return Err(Error::AlreadyComplete {
                    succeeded: self.is_succeeded(),
                });
            }
            slot.take()
        };
        if let Some(handler) = handler {
            self.fire(handler);
        }
        Ok(())
    }

    fn fire(&self, handler: Handler<T>) {
        if let Some(outcome) = self.shared.outcome.get() {
            handler(outcome.as_ref());
        }
    }

    /// Register the completion callback, replacing any earlier registration.
    ///
    /// Fires immediately on this thread if the result is already complete.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<&T, &Error>) + Send + 'static,
    {
        let handler: Handler<T> = Box::new(f);
        let immediate = {
            let mut slot = self.shared.handler.lock();
            if self.shared.outcome.get().is_some() {
                Some(handler)
            } else {
                *slot = Some(handler);
                None
            }
        };
        if let Some(handler) = immediate {
            self.fire(handler);
        }
    }

    /// Whether the result has reached a terminal state.
    pub fn is_complete(&self) -> bool {
        self.shared.outcome.get().is_some()
    }

    /// Whether the result completed with a value.
    pub fn is_succeeded(&self) -> bool {
        matches!(self.shared.outcome.get(), Some(Ok(_)))
    }

    /// Whether the result completed with a failure.
    pub fn is_failed(&self) -> bool {
        matches!(self.shared.outcome.get(), Some(Err(_)))
    }

    /// Borrow the terminal outcome, if any.
    pub fn outcome(&self) -> Option<Result<&T, &Error>> {
        self.shared.outcome.get().map(Result::as_ref)
    }

    /// The failure, if the result failed.
    pub fn cause(&self) -> Option<Error> {
        match self.shared.outcome.get() {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Derive a result by applying `f` to the success value.
    pub fn map<U, F>(&self, f: F) -> AsyncResult<U>
    where
        U: Send + Sync + 'static,
        F: FnOnce(&T) -> U + Send + 'static,
    {
        let mapped = AsyncResult::pending();
        let out = mapped.clone();
        self.on_complete(move |res| {
            let _ = match res {
                Ok(value) => out.complete(f(value)),
                Err(err) => out.fail(err.clone()),
            };
        });
        mapped
    }

    /// Chain a further asynchronous step after a success.
    pub fn compose<U, F>(&self, f: F) -> AsyncResult<U>
    where
        U: Clone + Send + Sync + 'static,
        F: FnOnce(&T) -> AsyncResult<U> + Send + 'static,
    {
        let composed = AsyncResult::pending();
        let out = composed.clone();
        self.on_complete(move |res| match res {
            Ok(value) => f(value).on_complete(out.completer()),
            Err(err) => {
                let _ = out.fail(err.clone());
            }
        });
        composed
    }
}

impl<T: Clone + Send + Sync + 'static> AsyncResult<T> {
    /// Clone of the success value, if any.
    pub fn result(&self) -> Option<T> {
        match self.shared.outcome.get() {
            Some(Ok(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// A callback that completes this result from another result's outcome.
    pub fn completer(&self) -> impl FnOnce(Result<&T, &Error>) + Send + 'static {
        let target = self.clone();
        move |res| {
            let _ = match res {
                Ok(value) => target.complete(value.clone()),
                Err(err) => target.fail(err.clone()),
            };
        }
    }

    /// A future resolving to the outcome. Occupies the callback slot.
    pub fn wait(&self) -> Wait<T> {
        Wait {
            result: self.clone(),
            waker: Arc::new(Mutex::new(None)),
            registered: false,
        }
    }
}

impl<T> fmt::Debug for AsyncResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.shared.outcome.get() {
            None => "pending",
            Some(Ok(_)) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("AsyncResult").field("state", &state).finish()
    }
}

/// Future returned by [`AsyncResult::wait`].
pub struct Wait<T> {
    result: AsyncResult<T>,
    waker: Arc<Mutex<Option<Waker>>>,
    registered: bool,
}

impl<T: Clone + Send + Sync + 'static> Future for Wait<T> {
    type Output = Result<T, Error>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Self::Output> {
        if let Some(outcome) = self.result.shared.outcome.get() {
            return Poll::Ready(outcome.clone());
        }
        *self.waker.lock() = Some(cx.waker().clone());
        if !self.registered {
            self.registered = true;
            let waker = Arc::clone(&self.waker);
            self.result.on_complete(move |_| {
                if let Some(w) = waker.lock().take() {
                    w.wake();
                }
            });
        }
        // The callback may have fired between the first check and registration.
        match self.result.shared.outcome.get() {
            Some(outcome) => Poll::Ready(outcome.clone()),
            None => Poll::Pending,
        }
    }
}
