// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Probabilistic skip list keyed by an ordered key.
//!
//! Nodes live in an arena and link to each other by index. Levels come
//! from independent coin flips per insert, capped at `max_level`, which
//! gives expected O(log n) insert, remove and ceiling search.

use rand::Rng;

struct Node<K, V> {
    key: K,
    value: V,
    /// `forward[i]` is the next node at level `i`.
    forward: Vec<Option<usize>>,
}

pub struct SkipList<K, V, R> {
    nodes: Vec<Option<Node<K, V>>>,
    free: Vec<usize>,
    /// Forward pointers of the header, one per possible level.
    head: Vec<Option<usize>>,
    /// Highest level currently in use.
    level: usize,
    max_level: usize,
    len: usize,
    rng: R,
}

impl<K: Ord, V, R: Rng> SkipList<K, V, R> {
    pub fn new(max_level: usize, rng: R) -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: vec![None; max_level + 1],
            level: 0,
            max_level,
            len: 0,
            rng,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    fn node(&self, idx: usize) -> &Node<K, V> {
        match &self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("skip list link to freed node {}", idx),
        }
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<K, V> {
        match &mut self.nodes[idx] {
            Some(node) => node,
            None => unreachable!("skip list link to freed node {}", idx),
        }
    }

    /// Next node at `level` after `at` (`None` = header).
    fn next(&self, at: Option<usize>, level: usize) -> Option<usize> {
        match at {
            None => self.head[level],
            Some(idx) => self.node(idx).forward[level],
        }
    }

    fn set_next(&mut self, at: Option<usize>, level: usize, to: Option<usize>) {
        match at {
            None => self.head[level] = to,
            Some(idx) => self.node_mut(idx).forward[level] = to,
        }
    }

    fn random_level(&mut self) -> usize {
        let mut level = 0;
        while level < self.max_level && self.rng.gen_bool(0.5) {
            level += 1;
        }
        level
    }

    /// Rightmost node with key < `key` on every level (`None` = header).
    fn predecessors(&self, key: &K) -> Vec<Option<usize>> {
        let mut update = vec![None; self.max_level + 1];
        let mut x = None;
        for level in (0..=self.level).rev() {
            while let Some(next) = self.next(x, level) {
                if self.node(next).key < *key {
                    x = Some(next);
                } else {
                    break;
                }
            }
            update[level] = x;
        }
        update
    }

    /// Insert or replace. Returns the replaced value.
    pub fn insert(&mut self, key: K, value: V) -> Option<V> {
        let update = self.predecessors(&key);
        if let Some(existing) = self.next(update[0], 0) {
            if self.node(existing).key == key {
                return Some(std::mem::replace(&mut self.node_mut(existing).value, value));
            }
        }

        let level = self.random_level();
        if level > self.level {
            // predecessors above the old top level are the header, which
            // `update` already holds as `None`
            self.level = level;
        }

        let forward = (0..=level).map(|i| self.next(update[i], i)).collect();
        let node = Node {
            key,
            value,
            forward,
        };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        for (i, &pred) in update.iter().enumerate().take(level + 1) {
            self.set_next(pred, i, Some(idx));
        }
        self.len += 1;
        None
    }

    /// Remove `key`. Returns its value if it was present.
    pub fn remove(&mut self, key: &K) -> Option<V> {
        let update = self.predecessors(key);
        let target = self.next(update[0], 0)?;
        if self.node(target).key != *key {
            return None;
        }
        for (i, &pred) in update.iter().enumerate().take(self.level + 1) {
            if self.next(pred, i) != Some(target) {
                break;
            }
            let after = self.node(target).forward[i];
            self.set_next(pred, i, after);
        }
        let node = self.nodes[target].take()?;
        self.free.push(target);
        while self.level > 0 && self.head[self.level].is_none() {
            self.level -= 1;
        }
        self.len -= 1;
        Some(node.value)
    }

    /// Entry with the smallest key >= `key`.
    pub fn ceiling_entry(&self, key: &K) -> Option<(&K, &V)> {
        let mut x = None;
        for level in (0..=self.level).rev() {
            while let Some(next) = self.next(x, level) {
                if self.node(next).key < *key {
                    x = Some(next);
                } else {
                    break;
                }
            }
        }
        self.next(x, 0).map(|idx| {
            let node = self.node(idx);
            (&node.key, &node.value)
        })
    }

    pub fn get(&self, key: &K) -> Option<&V> {
        match self.ceiling_entry(key) {
            Some((k, v)) if k == key => Some(v),
            _ => None,
        }
    }

    /// Entries in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&K, &V)> + '_ {
        let mut cursor = self.head[0];
        std::iter::from_fn(move || {
            let idx = cursor?;
            let node = self.node(idx);
            cursor = node.forward[0];
            Some((&node.key, &node.value))
        })
    }
}
