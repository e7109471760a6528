use std::collections::HashMap;

use slab::Slab;

use crate::pool::WaiterId;

struct Node<T> {
    id: WaiterId,
    item: T,
    prev: Option<usize>,
    next: Option<usize>,
}

/// FIFO of waiters with O(1) removal by id.
///
/// Nodes live in a slab and are linked by slab index; `index` maps each
/// queued id to its node so a cancelled waiter can be unlinked in place.
pub(crate) struct WaitQueue<T> {
    nodes: Slab<Node<T>>,
    index: HashMap<WaiterId, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<T> Default for WaitQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> WaitQueue<T> {
    pub(crate) fn new() -> Self {
        WaitQueue {
            nodes: Slab::new(),
            index: HashMap::new(),
            head: None,
            tail: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Append `item`. An `id` that is already queued is refused and the item
    /// handed back.
    pub(crate) fn push_back(&mut self, id: WaiterId, item: T) -> Result<(), T> {
        if self.index.contains_key(&id) {
            return Err(item);
        }
        let key = self.nodes.insert(Node {
            id,
            item,
            prev: self.tail,
            next: None,
        });
        match self.tail {
            Some(tail) => self.nodes[tail].next = Some(key),
            None => self.head = Some(key),
        }
        self.tail = Some(key);
        self.index.insert(id, key);
        Ok(())
    }

    pub(crate) fn pop_front(&mut self) -> Option<T> {
        let head = self.head?;
        Some(self.unlink(head))
    }

    /// Remove the waiter `id`. `None` if it is not (or no longer) queued.
    pub(crate) fn remove(&mut self, id: WaiterId) -> Option<T> {
        let key = *self.index.get(&id)?;
        Some(self.unlink(key))
    }

    /// Empty the queue, oldest first.
    pub(crate) fn drain(&mut self) -> Vec<T> {
        let mut out = Vec::with_capacity(self.len());
        while let Some(item) = self.pop_front() {
            out.push(item);
        }
        out
    }

    fn unlink(&mut self, key: usize) -> T {
        let node = self.nodes.remove(key);
        match node.prev {
            Some(prev) => self.nodes[prev].next = node.next,
            None => self.head = node.next,
        }
        match node.next {
            Some(next) => self.nodes[next].prev = node.prev,
            None => self.tail = node.prev,
        }
        self.index.remove(&node.id);
        node.item
    }
}
