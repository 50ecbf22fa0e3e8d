//! Eviction strategies and the shared access-order list.
//!
//! Three strategies trade access-order accuracy against lock traffic:
//!
//! | Strategy | Read cost | Accuracy |
//! |---|---|---|
//! | `Precise` | list lock on every read | exact LRU |
//! | `Probabilistic` | list lock on ~p of reads | approximate |
//! | `Clock` | two atomic stores, no lock | second-chance |
//!
//! Precise and probabilistic share [`AccessList`], a slab-allocated
//! doubly-linked list with an index map for O(1) touch/remove. Clock keeps
//! no list at all; its sweep lives in the cache itself.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use memotier_core::CacheKey;

/// L1 eviction strategy, chosen at construction.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EvictionPolicy {
    /// Every read moves the entry to the MRU end under the list lock.
    Precise,
    /// Each read performs the precise update with a configured
    /// probability, cutting lock acquisitions by roughly that factor.
    #[default]
    Probabilistic,
    /// No list: reads set an access bit; eviction sweeps with
    /// clear-and-second-chance semantics.
    Clock,
}

impl EvictionPolicy {
    /// Whether this strategy maintains the access-order list.
    pub(crate) fn uses_order_list(self) -> bool {
        !matches!(self, EvictionPolicy::Clock)
    }
}

const NIL: usize = usize::MAX;

struct Node {
    key: CacheKey,
    prev: usize,
    next: usize,
}

/// Doubly-linked access-order list over a slab, with an index for O(1)
/// lookup. Head is MRU, tail is LRU.
#[derive(Default)]
pub(crate) struct AccessList {
    nodes: Vec<Node>,
    index: HashMap<CacheKey, usize>,
    free: Vec<usize>,
    head: usize,
    tail: usize,
}

impl AccessList {
    pub(crate) fn new() -> Self {
        AccessList {
            nodes: Vec::new(),
            index: HashMap::new(),
            free: Vec::new(),
            head: NIL,
            tail: NIL,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.index.len()
    }

    /// Moves `key` to the MRU end, inserting it if absent.
    pub(crate) fn touch(&mut self, key: &CacheKey) {
        match self.index.get(key).copied() {
            Some(slot) => {
                self.unlink(slot);
                self.link_front(slot);
            }
            None => {
                let slot = self.allocate(key.clone());
                self.index.insert(key.clone(), slot);
                self.link_front(slot);
            }
        }
    }

    /// Removes `key` from the list, if present.
    pub(crate) fn remove(&mut self, key: &CacheKey) {
        if let Some(slot) = self.index.remove(key) {
            self.unlink(slot);
            self.release(slot);
        }
    }

    /// Pops the LRU key, if any.
    pub(crate) fn pop_lru(&mut self) -> Option<CacheKey> {
        let slot = self.tail;
        if slot == NIL {
            return None;
        }
        self.unlink(slot);
        let key = self.release(slot);
        self.index.remove(&key);
        Some(key)
    }

    pub(crate) fn clear(&mut self) {
        self.nodes.clear();
        self.index.clear();
        self.free.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    fn allocate(&mut self, key: CacheKey) -> usize {
        match self.free.pop() {
            Some(slot) => {
                self.nodes[slot] = Node {
                    key,
                    prev: NIL,
                    next: NIL,
                };
                slot
            }
            None => {
                self.nodes.push(Node {
                    key,
                    prev: NIL,
                    next: NIL,
                });
                self.nodes.len() - 1
            }
        }
    }

    fn release(&mut self, slot: usize) -> CacheKey {
        self.free.push(slot);
        // Leave the node in place; the slab slot is reused on the next
        // allocation. Swap in an empty key to drop the old one now.
        std::mem::replace(&mut self.nodes[slot].key, CacheKey::new(""))
    }

    fn link_front(&mut self, slot: usize) {
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = self.head;
        if self.head != NIL {
            self.nodes[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.nodes[slot].prev, self.nodes[slot].next);
        if prev != NIL {
            self.nodes[prev].next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.nodes[next].prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.nodes[slot].prev = NIL;
        self.nodes[slot].next = NIL;
    }
}
