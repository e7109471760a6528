//! Owning execution contexts.
//!
//! A [`Context`] is one OS thread draining its own task queue. State that
//! belongs to a context (a connection's flags, its handlers) is only mutated
//! from that thread; other threads marshal work onto it with
//! [`Context::run_on_context`].

use std::cell::RefCell;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::{Receiver, Sender};
use parking_lot::RwLock;

use crate::error::Error;

pub(crate) type Task = Box<dyn FnOnce() + Send + 'static>;

pub(crate) enum Message {
    Run(Task),
    Shutdown,
}

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    /// The context whose loop is running on this thread, if any.
    static CURRENT: RefCell<Option<Context>> = const { RefCell::new(None) };
}

/// Process-unique context identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(u64);

struct Inner {
    id: ContextId,
    index: usize,
    name: String,
    tx: Sender<Message>,
    /// Held shared while posting, exclusive while stopping, so every task
    /// accepted before a stop is queued ahead of `Shutdown`.
    stopped: RwLock<bool>,
}

/// Handle to an execution context. Clones refer to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

impl Context {
    pub(crate) fn new(index: usize, name: String) -> (Context, Receiver<Message>) {
        let (tx, rx) = crossbeam_channel::unbounded();
        let ctx = Context {
            inner: Arc::new(Inner {
                id: ContextId(NEXT_ID.fetch_add(1, Ordering::Relaxed)),
                index,
                name,
                tx,
                stopped: RwLock::new(false),
            }),
        };
        (ctx, rx)
    }

    /// The context running on the calling thread.
    pub fn current() -> Option<Context> {
        CURRENT.with(|c| c.borrow().clone())
    }

    pub fn id(&self) -> ContextId {
        self.inner.id
    }

    /// Position of this context within its group.
    pub fn index(&self) -> usize {
        self.inner.index
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Whether the calling thread is this context's thread.
    pub fn is_current(&self) -> bool {
        CURRENT.with(|c| {
            c.borrow()
                .as_ref()
                .is_some_and(|cur| Arc::ptr_eq(&cur.inner, &self.inner))
        })
    }

    /// `Err(WrongContext)` unless called from this context's thread.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_current() {
            Ok(())
        } else {
            Err(Error::WrongContext)
        }
    }

    /// Queue `task` to run on this context, after anything already queued.
    ///
    /// Returns `false` if the context has stopped; the task is dropped.
    pub fn run_on_context<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let stopped = self.inner.stopped.read();
        if *stopped || self.inner.tx.send(Message::Run(Box::new(task))).is_err() {
            drop(stopped);
            tracing::warn!(context = %self.inner.name, "context stopped, task dropped");
            return false;
        }
        true
    }

    /// Run `task` inline when already on this context, otherwise queue it.
    pub fn execute<F>(&self, task: F)
    where
        F: FnOnce() + Send + 'static,
    {
        if self.is_current() {
            task();
        } else {
            self.run_on_context(task);
        }
    }

    pub fn is_stopped(&self) -> bool {
        *self.inner.stopped.read()
    }

    /// Ask the loop to exit once the tasks queued so far have run.
    pub(crate) fn stop(&self) {
        let mut stopped = self.inner.stopped.write();
        if !*stopped {
            *stopped = true;
            let _ = self.inner.tx.send(Message::Shutdown);
        }
    }

    /// Drain tasks on the calling thread until shutdown.
    pub(crate) fn run_loop(self, rx: Receiver<Message>) {
        crate::counter::bind_context_shard(self.inner.index);
        CURRENT.with(|c| *c.borrow_mut() = Some(self.clone()));
        for msg in rx.iter() {
            match msg {
                Message::Run(task) => {
                    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
                        tracing::error!(context = %self.inner.name, "task panicked");
                    }
                }
                Message::Shutdown => break,
            }
        }
        CURRENT.with(|c| *c.borrow_mut() = None);
        tracing::debug!(context = %self.inner.name, "context loop exited");
    }
}

impl PartialEq for Context {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Context {}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    fn spawn(name: &str) -> (Context, thread::JoinHandle<()>) {
        let (ctx, rx) = Context::new(0, name.to_string());
        let runner = ctx.clone();
        let handle = thread::spawn(move || runner.run_loop(rx));
        (ctx, handle)
    }

    #[test]
    fn tasks_run_in_order_on_the_context() {
        let (ctx, handle) = spawn("ctx-order");
        let (tx, rx) = crossbeam_channel::unbounded();
        for i in 0..10 {
            let tx = tx.clone();
            let c = ctx.clone();
            ctx.run_on_context(move || {
                tx.send((i, c.is_current())).unwrap();
            });
        }
        for i in 0..10 {
            assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), (i, true));
        }
        assert!(!ctx.is_current());
        assert!(matches!(ctx.check(), Err(Error::WrongContext)));
        ctx.stop();
        handle.join().unwrap();
    }

    #[test]
    fn panicking_task_does_not_stop_the_loop() {
        let (ctx, handle) = spawn("ctx-panic");
        let (tx, rx) = crossbeam_channel::unbounded();
        ctx.run_on_context(|| panic!("boom"));
        ctx.run_on_context(move || tx.send(()).unwrap());
        rx.recv_timeout(Duration::from_secs(5)).unwrap();
        ctx.stop();
        handle.join().unwrap();
    }

    #[test]
    fn stopped_context_rejects_tasks() {
        let (ctx, handle) = spawn("ctx-stop");
        ctx.stop();
        handle.join().unwrap();
        assert!(ctx.is_stopped());
        assert!(!ctx.run_on_context(|| {}));
    }

    #[test]
    fn execute_runs_inline_on_context() {
        let (ctx, handle) = spawn("ctx-inline");
        let (tx, rx) = crossbeam_channel::unbounded();
        let c = ctx.clone();
        ctx.run_on_context(move || {
            let (inner_tx, inner_rx) = crossbeam_channel::bounded(1);
            c.execute(move || inner_tx.send(()).unwrap());
            // Inline execution means the message is already there.
            tx.send(inner_rx.try_recv().is_ok()).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
        ctx.stop();
        handle.join().unwrap();
    }

    #[test]
    fn tasks_accepted_during_stop_still_run() {
        use std::sync::atomic::AtomicUsize;

        let (ctx, handle) = spawn("ctx-race");
        let accepted = Arc::new(AtomicUsize::new(0));
        let ran = Arc::new(AtomicUsize::new(0));
        let posters: Vec<_> = (0..4)
            .map(|_| {
                let ctx = ctx.clone();
                let accepted = Arc::clone(&accepted);
                let ran = Arc::clone(&ran);
                thread::spawn(move || {
                    for _ in 0..500 {
                        let ran = Arc::clone(&ran);
                        if ctx.run_on_context(move || {
                            ran.fetch_add(1, Ordering::SeqCst);
                        }) {
                            accepted.fetch_add(1, Ordering::SeqCst);
                        }
                    }
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(1));
        ctx.stop();
        for p in posters {
            p.join().unwrap();
        }
        handle.join().unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), accepted.load(Ordering::SeqCst));
    }
}
