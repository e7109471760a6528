//! Integration tests: connection pooling over the in-memory transport.
//!
//! Each test starts a small event loop group, routes requests through a
//! `ConnectionManager` backed by `MemoryProvider`, and observes waiter
//! results from the test thread.

use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tideline::{
    Channel, Connection, ConnectionManager, EndpointKey, Error, EventLoopConfig, EventLoopGroup,
    MemoryProvider, PoolOptions, PoolStats, Waiter,
};

const TIMEOUT: Duration = Duration::from_secs(5);

// ── Helpers ─────────────────────────────────────────────────────────

struct Harness {
    group: EventLoopGroup,
    provider: Arc<MemoryProvider>,
    manager: ConnectionManager<Connection>,
}

fn harness(max_connections: usize, max_wait_queue_size: i32) -> Harness {
    let group = EventLoopGroup::new(&EventLoopConfig {
        threads: 2,
        thread_name: "pool-it".to_string(),
    })
    .unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let manager = ConnectionManager::<Connection>::new(
        provider.clone(),
        PoolOptions {
            max_connections,
            max_wait_queue_size,
        },
    );
    Harness {
        group,
        provider,
        manager,
    }
}

fn key() -> EndpointKey {
    EndpointKey::new(false, 8080, "backend")
}

/// Block until the waiter's result completes.
fn outcome(waiter: &Waiter<Connection>) -> Result<Connection, Error> {
    let (tx, rx) = crossbeam_channel::bounded(1);
    waiter.result().on_complete(move |res| {
        let _ = tx.send(res.cloned().map_err(Clone::clone));
    });
    rx.recv_timeout(TIMEOUT).expect("waiter never completed")
}

/// Poll `cond` until it holds or the timeout elapses.
fn eventually(mut cond: impl FnMut() -> bool) {
    let deadline = Instant::now() + TIMEOUT;
    while !cond() {
        assert!(Instant::now() < deadline, "condition not reached");
        thread::sleep(Duration::from_millis(2));
    }
}

// ── Admission ───────────────────────────────────────────────────────

#[test]
fn requests_beyond_limit_queue_then_fail() {
    let h = harness(2, 1);
    let w1 = h.manager.request(&key(), h.group.next());
    let w2 = h.manager.request(&key(), h.group.next());
    let w3 = h.manager.request(&key(), h.group.next());
    let w4 = h.manager.request(&key(), h.group.next());

    assert!(outcome(&w1).is_ok());
    assert!(outcome(&w2).is_ok());
    assert!(matches!(outcome(&w4), Err(Error::QueueFull)));
    assert!(!w3.result().is_complete());
    assert_eq!(
        h.manager.stats(&key()),
        Some(PoolStats {
            live: 2,
            idle: 0,
            waiting: 1,
        })
    );
    assert_eq!(h.provider.attempts(), 2);
    h.group.join().unwrap();
}

#[test]
fn zero_wait_queue_fails_fast() {
    let h = harness(1, 0);
    let w1 = h.manager.request(&key(), h.group.next());
    let w2 = h.manager.request(&key(), h.group.next());
    assert!(outcome(&w1).is_ok());
    assert!(matches!(outcome(&w2), Err(Error::QueueFull)));
    h.group.join().unwrap();
}

#[test]
fn per_endpoint_options() {
    let group = EventLoopGroup::new(&EventLoopConfig {
        threads: 1,
        thread_name: "pool-opts".to_string(),
    })
    .unwrap();
    let provider = Arc::new(MemoryProvider::new());
    let manager = ConnectionManager::<Connection>::with_options(provider, |key: &EndpointKey| {
        PoolOptions {
            max_connections: if key.secure { 1 } else { 3 },
            max_wait_queue_size: 0,
        }
    });
    let tls = EndpointKey::new(true, 443, "backend");
    assert!(outcome(&manager.request(&tls, group.next())).is_ok());
    assert!(matches!(
        outcome(&manager.request(&tls, group.next())),
        Err(Error::QueueFull)
    ));
    for _ in 0..3 {
        assert!(outcome(&manager.request(&key(), group.next())).is_ok());
    }
    group.join().unwrap();
}

// ── Hand-off to queued waiters ──────────────────────────────────────

#[test]
fn closed_connection_hands_its_slot_to_queued_waiter() {
    let h = harness(1, -1);
    let first = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let queued = h.manager.request(&key(), h.group.next());
    assert!(!queued.result().is_complete());

    let _ = first.close();
    let second = outcome(&queued).unwrap();
    assert_ne!(second.id(), first.id());
    assert_eq!(h.provider.attempts(), 2);
    assert_eq!(h.manager.stats(&key()).unwrap().live, 1);
    h.group.join().unwrap();
}

#[test]
fn recycled_connection_goes_to_oldest_waiter() {
    let h = harness(1, -1);
    let conn = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let older = h.manager.request(&key(), h.group.next());
    let newer = h.manager.request(&key(), h.group.next());

    h.manager.recycle(conn.clone());
    assert_eq!(outcome(&older).unwrap().id(), conn.id());
    assert!(!newer.result().is_complete());
    assert_eq!(h.provider.attempts(), 1);
    h.group.join().unwrap();
}

#[test]
fn assignment_runs_on_connection_context() {
    let h = harness(1, -1);
    h.provider.hold(true);
    let waiter = h.manager.request(&key(), h.group.next());
    let (tx, rx) = crossbeam_channel::bounded(1);
    waiter.result().on_complete(move |res| {
        let on_owner = res.map(|conn| conn.context().is_current()).unwrap_or(false);
        let _ = tx.send(on_owner);
    });
    assert!(h.provider.release());
    assert!(rx.recv_timeout(TIMEOUT).unwrap());
    h.group.join().unwrap();
}

// ── Close, cancel, eviction ─────────────────────────────────────────

#[test]
fn double_close_decrements_once() {
    let h = harness(2, -1);
    let a = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let _b = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    assert_eq!(h.manager.stats(&key()).unwrap().live, 2);

    let _ = a.close();
    let _ = a.close();
    a.handle_closed();
    assert_eq!(h.manager.stats(&key()).unwrap().live, 1);
    assert_eq!(h.manager.connection_count(), 1);
    h.group.join().unwrap();
}

#[test]
fn cancel_is_idempotent() {
    let h = harness(1, -1);
    let conn = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let queued = h.manager.request(&key(), h.group.next());

    assert!(h.manager.cancel(&key(), queued.id()));
    assert!(!h.manager.cancel(&key(), queued.id()));
    assert_eq!(h.manager.stats(&key()).unwrap().waiting, 0);

    // The cancelled waiter must not receive the connection.
    h.manager.recycle(conn);
    assert_eq!(h.manager.stats(&key()).unwrap().idle, 1);
    assert!(!queued.result().is_complete());
    h.group.join().unwrap();
}

#[test]
fn resubmitted_waiter_is_queued_once() {
    let h = harness(1, -1);
    let conn = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let waiter = Waiter::new(h.group.next());
    h.manager.get_connection(&key(), waiter.clone());
    h.manager.get_connection(&key(), waiter.clone());
    assert_eq!(h.manager.stats(&key()).unwrap().waiting, 1);

    // Cancelling removes the only entry; the connection goes idle.
    assert!(h.manager.cancel(&key(), waiter.id()));
    h.manager.recycle(conn);
    assert_eq!(h.manager.stats(&key()).unwrap().idle, 1);
    assert!(!waiter.result().is_complete());
    h.group.join().unwrap();
}

#[test]
fn empty_pool_is_removed_and_recreated() {
    let h = harness(1, -1);
    let conn = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    assert_eq!(h.manager.pool_count(), 1);

    let _ = conn.close();
    assert_eq!(h.manager.pool_count(), 0);
    assert_eq!(h.manager.connection_count(), 0);

    let again = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    assert_ne!(again.id(), conn.id());
    assert_eq!(h.manager.pool_count(), 1);
    h.group.join().unwrap();
}

// ── Connect failures ────────────────────────────────────────────────

#[test]
fn connect_failure_fails_only_its_waiter() {
    let h = harness(1, -1);
    h.provider.hold(true);
    let w1 = h.manager.request(&key(), h.group.next());
    let w2 = h.manager.request(&key(), h.group.next());
    let w3 = h.manager.request(&key(), h.group.next());
    assert_eq!(h.provider.held(), 1);

    assert!(h.provider.refuse());
    assert!(matches!(outcome(&w1), Err(Error::Connect(_))));

    // w2 gets a fresh attempt of its own.
    eventually(|| h.provider.held() == 1);
    assert!(h.provider.release());
    assert!(outcome(&w2).is_ok());
    assert!(!w3.result().is_complete());
    assert_eq!(h.manager.stats(&key()).unwrap().waiting, 1);
    assert_eq!(h.provider.attempts(), 2);
    h.group.join().unwrap();
}

#[test]
fn failed_connect_with_no_waiters_retires_pool() {
    let h = harness(1, -1);
    h.provider.fail_next(1);
    let w = h.manager.request(&key(), h.group.next());
    assert!(matches!(outcome(&w), Err(Error::Connect(_))));
    eventually(|| h.manager.pool_count() == 0);
    assert!(outcome(&h.manager.request(&key(), h.group.next())).is_ok());
    h.group.join().unwrap();
}

// ── Manager close ───────────────────────────────────────────────────

#[test]
fn manager_close_closes_connections() {
    let h = harness(2, -1);
    let conn = outcome(&h.manager.request(&key(), h.group.next())).unwrap();
    let channel = h.provider.channel(&conn).unwrap();
    h.manager.close();
    assert!(h.manager.is_closed());
    assert!(!channel.is_open());
    assert!(matches!(
        outcome(&h.manager.request(&key(), h.group.next())),
        Err(Error::PoolClosed)
    ));
    h.group.join().unwrap();
}

// ── Concurrency ─────────────────────────────────────────────────────

#[test]
fn concurrent_requests_share_bounded_connections() {
    let h = harness(4, -1);
    let manager = h.manager.clone();
    let (tx, rx) = crossbeam_channel::unbounded();

    let requesters: Vec<_> = (0..8)
        .map(|_| {
            let manager = manager.clone();
            let tx = tx.clone();
            let contexts = h.group.contexts().to_vec();
            thread::spawn(move || {
                for i in 0..4 {
                    let waiter = manager.request(&key(), contexts[i % contexts.len()].clone());
                    let manager = manager.clone();
                    let tx = tx.clone();
                    waiter.result().on_complete(move |res| {
                        let ok = res.is_ok();
                        if let Ok(conn) = res {
                            manager.recycle(conn.clone());
                        }
                        let _ = tx.send(ok);
                    });
                }
            })
        })
        .collect();
    for r in requesters {
        r.join().unwrap();
    }

    for _ in 0..32 {
        assert!(rx.recv_timeout(TIMEOUT).unwrap());
    }
    assert!(h.provider.attempts() <= 4);
    let stats = h.manager.stats(&key()).unwrap();
    assert_eq!(stats.waiting, 0);
    assert_eq!(stats.live, stats.idle);
    h.group.join().unwrap();
}
