//! Combinators rolling N child results up into one.
//!
//! [`CompositeResult::all`] short-circuits on the first failure,
//! [`CompositeResult::any`] on the first success, and
//! [`CompositeResult::join`] waits for every child before deciding.

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use super::result::AsyncResult;
use crate::error::Error;

type CompositeHandler<T> = Box<dyn FnOnce(Result<&CompositeResult<T>, &Error>) + Send + 'static>;
type Predicate<T> = Arc<dyn Fn(&CompositeResult<T>) -> bool + Send + Sync + 'static>;

enum Policy<T> {
    All,
    Any,
    Join(Predicate<T>),
}

struct State<T> {
    /// Children counted towards the policy's threshold. Never decreases.
    count: usize,
    outcome: Option<Result<(), Error>>,
    handler: Option<CompositeHandler<T>>,
}

struct Inner<T> {
    children: Vec<AsyncResult<T>>,
    state: Mutex<State<T>>,
}

/// A derived result over an ordered set of children.
///
/// Registering a composite takes over the completion callback slot of every
/// child. Positional accessors follow construction order regardless of the
/// order in which children complete.
///
/// Children hold the composite weakly. Once every handle is dropped, later
/// child completions are ignored and the handler never runs.
pub struct CompositeResult<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CompositeResult<T> {
    fn clone(&self) -> Self {
        CompositeResult {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: Send + Sync + 'static> CompositeResult<T> {
    /// Succeeds once every child succeeds; fails with the first failure.
    pub fn all(children: Vec<AsyncResult<T>>) -> Self {
        Self::with_policy(children, Policy::All)
    }

    /// Succeeds with the first success; fails once every child has failed,
    /// with the last failure observed.
    pub fn any(children: Vec<AsyncResult<T>>) -> Self {
        Self::with_policy(children, Policy::Any)
    }

    /// Waits for every child, then succeeds only if all of them succeeded.
    pub fn join(children: Vec<AsyncResult<T>>) -> Self {
        Self::join_with(|c: &CompositeResult<T>| c.all_succeeded(), children)
    }

    /// Waits for every child, then succeeds if `predicate` holds.
    ///
    /// A rejected predicate fails the composite with
    /// [`Error::CompositeFailed`]. The predicate runs on the thread that
    /// completed the last child.
    pub fn join_with<P>(predicate: P, children: Vec<AsyncResult<T>>) -> Self
    where
        P: Fn(&CompositeResult<T>) -> bool + Send + Sync + 'static,
    {
        Self::with_policy(children, Policy::Join(Arc::new(predicate)))
    }

    fn with_policy(children: Vec<AsyncResult<T>>, policy: Policy<T>) -> Self {
        let composite = CompositeResult {
            inner: Arc::new(Inner {
                children,
                state: Mutex::new(State {
                    count: 0,
                    outcome: None,
                    handler: None,
                }),
            }),
        };
        if composite.inner.children.is_empty() {
            let _ = composite.settle(Ok(()));
            return composite;
        }
        let policy = Arc::new(policy);
        for child in &composite.inner.children {
            let this = Arc::downgrade(&composite.inner);
            let policy = Arc::clone(&policy);
            child.on_complete(move |res| {
                if let Some(inner) = Weak::upgrade(&this) {
                    CompositeResult { inner }.child_completed(&policy, res);
                }
            });
        }
        composite
    }

    fn child_completed(&self, policy: &Policy<T>, res: Result<&T, &Error>) {
        let len = self.inner.children.len();
        let decision = {
            let mut state = self.inner.state.lock();
            match (policy, res) {
                (Policy::All, Ok(_)) => {
                    state.count += 1;
                    (state.outcome.is_none() && state.count == len).then_some(Ok(()))
                }
                (Policy::All, Err(err)) => state.outcome.is_none().then(|| Err(err.clone())),
                (Policy::Any, Ok(_)) => state.outcome.is_none().then_some(Ok(())),
                (Policy::Any, Err(err)) => {
                    state.count += 1;
                    (state.outcome.is_none() && state.count == len).then(|| Err(err.clone()))
                }
                (Policy::Join(_), _) => {
                    state.count += 1;
                    if state.outcome.is_none() && state.count == len {
                        // Placeholder; the predicate is evaluated below.
                        Some(Ok(()))
                    } else {
                        None
                    }
                }
            }
        };
        let Some(mut outcome) = decision else {
            return;
        };
        // Only one completion observes count == len, so the predicate runs
        // once and outside the lock.
        if let Policy::Join(predicate) = policy
            && !predicate(self)
        {
            outcome = Err(Error::CompositeFailed);
        }
        // A manual completion may have won in the meantime.
        let _ = self.settle(outcome);
    }

    fn settle(&self, outcome: Result<(), Error>) -> Result<(), Error> {
        let (handler, fired) = {
            let mut state = self.inner.state.lock();
            if let Some(prev) = &state.outcome {
                return Err(Error::AlreadyComplete {
                    succeeded: prev.is_ok(),
                });
            }
            state.outcome = Some(outcome.clone());
            (state.handler.take(), outcome)
        };
        if let Some(handler) = handler {
            match &fired {
                Ok(()) => handler(Ok(self)),
                Err(err) => handler(Err(err)),
            }
        }
        Ok(())
    }

    /// Complete the composite manually.
    pub fn complete(&self) -> Result<(), Error> {
        self.settle(Ok(()))
    }

    /// Fail the composite manually.
    pub fn fail(&self, err: Error) -> Result<(), Error> {
        self.settle(Err(err))
    }

    /// Register the completion callback, replacing any earlier one.
    ///
    /// Fires immediately on this thread if the composite is already complete.
    pub fn on_complete<F>(&self, f: F)
    where
        F: FnOnce(Result<&CompositeResult<T>, &Error>) + Send + 'static,
    {
        let immediate = {
            let mut state = self.inner.state.lock();
            if state.outcome.is_none() {
                state.handler = Some(Box::new(f));
                return;
            }
            state.outcome.clone()
        };
        match immediate {
            Some(Ok(())) => f(Ok(self)),
            Some(Err(err)) => f(Err(&err)),
            None => {}
        }
    }

    /// Whether the composite has completed.
    pub fn is_complete(&self) -> bool {
        self.inner.state.lock().outcome.is_some()
    }

    /// Whether the composite succeeded.
    pub fn is_succeeded(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Ok(())))
    }

    /// Whether the composite failed.
    pub fn is_failed(&self) -> bool {
        matches!(self.inner.state.lock().outcome, Some(Err(_)))
    }

    /// The composite's failure, if it failed.
    pub fn cause(&self) -> Option<Error> {
        match &self.inner.state.lock().outcome {
            Some(Err(err)) => Some(err.clone()),
            _ => None,
        }
    }

    /// Number of children.
    pub fn len(&self) -> usize {
        self.inner.children.len()
    }

    /// Whether there are no children.
    pub fn is_empty(&self) -> bool {
        self.inner.children.is_empty()
    }

    /// The child at `index`.
    pub fn child(&self, index: usize) -> Result<&AsyncResult<T>, Error> {
        self.inner
            .children
            .get(index)
            .ok_or(Error::IndexOutOfBounds {
                index,
                len: self.inner.children.len(),
            })
    }

    /// Success value of the child at `index`, `None` unless it succeeded.
    pub fn result_at(&self, index: usize) -> Result<Option<&T>, Error> {
        Ok(self.child(index)?.outcome().and_then(Result::ok))
    }

    /// Failure of the child at `index`, `None` unless it failed.
    pub fn cause_at(&self, index: usize) -> Result<Option<Error>, Error> {
        Ok(self.child(index)?.cause())
    }

    /// Whether the child at `index` succeeded.
    pub fn succeeded_at(&self, index: usize) -> Result<bool, Error> {
        Ok(self.child(index)?.is_succeeded())
    }

    /// Whether the child at `index` failed.
    pub fn failed_at(&self, index: usize) -> Result<bool, Error> {
        Ok(self.child(index)?.is_failed())
    }

    /// Whether the child at `index` is complete.
    pub fn is_complete_at(&self, index: usize) -> Result<bool, Error> {
        Ok(self.child(index)?.is_complete())
    }

    fn all_succeeded(&self) -> bool {
        self.inner.children.iter().all(AsyncResult::is_succeeded)
    }
}

impl<T: Clone + Send + Sync + 'static> CompositeResult<T> {
    /// Success values in child order; `None` for children that did not succeed.
    pub fn values(&self) -> Vec<Option<T>> {
        self.inner.children.iter().map(AsyncResult::result).collect()
    }
}

impl<T> fmt::Debug for CompositeResult<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match &self.inner.state.lock().outcome {
            None => "pending",
            Some(Ok(())) => "succeeded",
            Some(Err(_)) => "failed",
        };
        f.debug_struct("CompositeResult")
            .field("children", &self.inner.children.len())
            .field("state", &state)
            .finish()
    }
}
