use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use crate::config::EventLoopConfig;
use crate::error::Error;
use crate::runtime::context::Context;

/// Handle used to stop every context of an [`EventLoopGroup`] from any thread.
#[derive(Clone)]
pub struct ShutdownHandle {
    contexts: Arc<[Context]>,
}

impl ShutdownHandle {
    /// Signal all contexts to exit.
    ///
    /// Tasks queued before the call still run; tasks queued afterwards are
    /// dropped and `run_on_context` returns `false`.
    pub fn shutdown(&self) {
        for ctx in self.contexts.iter() {
            ctx.stop();
        }
    }
}

/// A fixed set of execution contexts, one OS thread each.
///
/// Connections are spread across the contexts with [`next`](Self::next).
/// Dropping the group stops its contexts without waiting for them;
/// call [`join`](Self::join) to wait.
pub struct EventLoopGroup {
    contexts: Arc<[Context]>,
    threads: Vec<thread::JoinHandle<()>>,
    next: AtomicUsize,
}

impl EventLoopGroup {
    /// Spawn `config.threads` contexts (0 = number of CPUs).
    pub fn new(config: &EventLoopConfig) -> Result<Self, Error> {
        config.validate()?;
        let num_threads = if config.threads == 0 {
            num_cpus()
        } else {
            config.threads
        };

        let mut contexts = Vec::with_capacity(num_threads);
        let mut threads = Vec::with_capacity(num_threads);
        for index in 0..num_threads {
            let name = format!("{}-{index}", config.thread_name);
            let (ctx, rx) = Context::new(index, name.clone());
            let runner = ctx.clone();
            let spawned = thread::Builder::new()
                .name(name)
                .spawn(move || runner.run_loop(rx));
            match spawned {
                Ok(handle) => {
                    contexts.push(ctx);
                    threads.push(handle);
                }
                Err(e) => {
                    for started in &contexts {
                        started.stop();
                    }
                    return Err(e.into());
                }
            }
        }

        tracing::debug!(threads = num_threads, "event loop group started");
        Ok(EventLoopGroup {
            contexts: contexts.into(),
            threads,
            next: AtomicUsize::new(0),
        })
    }

    /// Next context in round-robin order.
    pub fn next(&self) -> Context {
        let i = self.next.fetch_add(1, Ordering::Relaxed) % self.contexts.len();
        self.contexts[i].clone()
    }

    pub fn contexts(&self) -> &[Context] {
        &self.contexts
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            contexts: Arc::clone(&self.contexts),
        }
    }

    /// Stop every context and wait for its thread to exit.
    pub fn join(mut self) -> Result<(), Error> {
        self.shutdown_handle().shutdown();
        let mut result = Ok(());
        for handle in self.threads.drain(..) {
            let name = handle.thread().name().unwrap_or("context").to_string();
            if handle.join().is_err() {
                result = Err(Error::Io(Arc::new(io::Error::other(format!(
                    "{name} panicked"
                )))));
            }
        }
        result
    }
}

impl Drop for EventLoopGroup {
    fn drop(&mut self) {
        for ctx in self.contexts.iter() {
            ctx.stop();
        }
    }
}

fn num_cpus() -> usize {
    thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}
