//! Per-context sharded counters.
//!
//! Every execution context increments its own shard of a [`CounterGroup`], so
//! connections on different contexts never contend on a cache line. Threads
//! that are not contexts (callers, transport threads) share the overflow
//! shard. [`Counter`] names one slot of a group and is exposed through
//! [`metriken::Metric`].

use std::cell::Cell;
use std::sync::atomic::{AtomicU64, Ordering};

const SLOTS: usize = 8;
const CONTEXT_SHARDS: usize = 63;
/// Shard used by threads that are not execution contexts.
const OVERFLOW_SHARD: usize = CONTEXT_SHARDS;

thread_local! {
    static SHARD: Cell<usize> = const { Cell::new(OVERFLOW_SHARD) };
}

/// Route this thread's increments to the shard of context `index`.
///
/// Called once by each context thread before it starts draining tasks.
pub(crate) fn bind_context_shard(index: usize) {
    SHARD.set(index % CONTEXT_SHARDS);
}

#[repr(C, align(64))]
struct Shard {
    slots: [AtomicU64; SLOTS],
}

/// Sharded storage for up to eight counters.
pub struct CounterGroup {
    shards: [Shard; CONTEXT_SHARDS + 1],
}

impl CounterGroup {
    /// Create a group with every slot at zero.
    #[allow(clippy::declare_interior_mutable_const)]
    pub const fn new() -> Self {
        const ZERO: AtomicU64 = AtomicU64::new(0);
        const EMPTY: Shard = Shard {
            slots: [ZERO; SLOTS],
        };
        CounterGroup {
            shards: [EMPTY; CONTEXT_SHARDS + 1],
        }
    }

    #[inline]
    fn add(&self, slot: usize, n: u64) {
        debug_assert!(slot < SLOTS, "counter slot out of range");
        let shard = SHARD.get();
        self.shards[shard].slots[slot].fetch_add(n, Ordering::Relaxed);
    }

    fn sum(&self, slot: usize) -> u64 {
        self.shards
            .iter()
            .map(|s| s.slots[slot].load(Ordering::Relaxed))
            .sum()
    }
}

impl Default for CounterGroup {
    fn default() -> Self {
        Self::new()
    }
}

/// One slot of a [`CounterGroup`], registrable with `#[metric]`.
pub struct Counter {
    group: &'static CounterGroup,
    slot: usize,
}

impl Counter {
    /// Counter backed by `slot` of `group`.
    pub const fn new(group: &'static CounterGroup, slot: usize) -> Self {
        Counter { group, slot }
    }

    #[inline]
    pub fn increment(&self) {
        self.group.add(self.slot, 1);
    }

    #[inline]
    pub fn add(&self, n: u64) {
        self.group.add(self.slot, n);
    }

    /// Sum over every shard.
    pub fn value(&self) -> u64 {
        self.group.sum(self.slot)
    }
}

impl metriken::Metric for Counter {
    fn as_any(&self) -> Option<&dyn std::any::Any> {
        Some(self)
    }

    fn value(&self) -> Option<metriken::Value<'_>> {
        Some(metriken::Value::Counter(Counter::value(self)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn slots_are_independent() {
        static GROUP: CounterGroup = CounterGroup::new();
        let a = Counter::new(&GROUP, 0);
        let b = Counter::new(&GROUP, 1);
        a.increment();
        b.add(4);
        assert_eq!(a.value(), 1);
        assert_eq!(b.value(), 4);
    }

    #[test]
    fn context_shards_sum_up() {
        static GROUP: CounterGroup = CounterGroup::new();
        static C: Counter = Counter::new(&GROUP, 2);
        let handles: Vec<_> = (0..4)
            .map(|i| {
                thread::spawn(move || {
                    bind_context_shard(i);
                    for _ in 0..250 {
                        C.increment();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        C.add(1);
        assert_eq!(C.value(), 1001);
    }
}
