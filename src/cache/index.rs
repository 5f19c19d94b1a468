//! Dual index over cache nodes: ordered by key and ordered by recency.
//!
//! Nodes live in an arena and are addressed by stable [`NodeId`]s. The
//! ordered map points at arena slots, and every slot is threaded onto a
//! doubly linked recency queue (head = least recently used, tail = most
//! recently used). Every mutation updates both views together, so a key is
//! in the map if and only if its node is on the queue.

use std::collections::BTreeMap;

use crate::cache::key::BlockCacheKey;

/// Stable handle to a node in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
struct Node<V> {
    key: BlockCacheKey,
    value: V,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug)]
pub struct NodeIndex<V> {
    slots: Vec<Option<Node<V>>>,
    free_slots: Vec<usize>,
    map: BTreeMap<BlockCacheKey, usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl<V> Default for NodeIndex<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> NodeIndex<V> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_slots: Vec::new(),
            map: BTreeMap::new(),
            head: None,
            tail: None,
        }
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn get(&self, key: &BlockCacheKey) -> Option<NodeId> {
        self.map.get(key).copied().map(NodeId)
    }

    fn node(&self, idx: usize) -> &Node<V> {
        self.slots[idx]
            .as_ref()
            .expect("node index points at an empty slot")
    }

    fn node_mut(&mut self, idx: usize) -> &mut Node<V> {
        self.slots[idx]
            .as_mut()
            .expect("node index points at an empty slot")
    }

    pub fn value(&self, id: NodeId) -> &V {
        &self.node(id.0).value
    }

    pub fn value_mut(&mut self, id: NodeId) -> &mut V {
        &mut self.node_mut(id.0).value
    }

    /// Insert a node for a key that is not present and link it at the queue tail.
    ///
    /// Returns the value back if the key is already indexed.
    pub fn insert_tail(&mut self, key: BlockCacheKey, value: V) -> Result<NodeId, V> {
        if self.map.contains_key(&key) {
            return Err(value);
        }

        let node = Node {
            key,
            value,
            prev: None,
            next: None,
        };
        let idx = match self.free_slots.pop() {
            Some(idx) => {
                self.slots[idx] = Some(node);
                idx
            }
            None => {
                self.slots.push(Some(node));
                self.slots.len() - 1
            }
        };

        self.map.insert(key, idx);
        self.link_tail(idx);
        Ok(NodeId(idx))
    }

    /// Mark a node as most recently used.
    pub fn touch(&mut self, id: NodeId) {
        if self.tail == Some(id.0) {
            return;
        }
        self.unlink(id.0);
        self.link_tail(id.0);
    }

    /// Unlink a node from both views and hand back its contents.
    pub fn remove(&mut self, id: NodeId) -> (BlockCacheKey, V) {
        self.unlink(id.0);
        let node = self.slots[id.0]
            .take()
            .expect("node index points at an empty slot");
        self.map.remove(&node.key);
        self.free_slots.push(id.0);
        (node.key, node.value)
    }

    /// Remove the least recently used node.
    pub fn pop_head(&mut self) -> Option<(BlockCacheKey, V)> {
        let head = self.head?;
        Some(self.remove(NodeId(head)))
    }

    /// Keys from least to most recently used.
    pub fn lru_keys(&self) -> Vec<BlockCacheKey> {
        let mut keys = Vec::with_capacity(self.len());
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let node = self.node(idx);
            keys.push(node.key);
            cursor = node.next;
        }
        keys
    }

    /// Keys in key order.
    pub fn ordered_keys(&self) -> impl Iterator<Item = &BlockCacheKey> {
        self.map.keys()
    }

    /// Verify that the ordered map and the recency queue cover the same nodes exactly once.
    pub fn is_consistent(&self) -> bool {
        let mut seen = 0usize;
        let mut prev = None;
        let mut cursor = self.head;
        while let Some(idx) = cursor {
            let Some(node) = self.slots.get(idx).and_then(|s| s.as_ref()) else {
                return false;
            };
            if node.prev != prev || self.map.get(&node.key) != Some(&idx) {
                return false;
            }
            seen += 1;
            if seen > self.map.len() {
                return false;
            }
            prev = Some(idx);
            cursor = node.next;
        }
        prev == self.tail && seen == self.map.len()
    }

    fn link_tail(&mut self, idx: usize) {
        let old_tail = self.tail;
        {
            let node = self.node_mut(idx);
            node.prev = old_tail;
            node.next = None;
        }
        match old_tail {
            Some(t) => self.node_mut(t).next = Some(idx),
            None => self.head = Some(idx),
        }
        self.tail = Some(idx);
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = {
            let node = self.node(idx);
            (node.prev, node.next)
        };
        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }
        let node = self.node_mut(idx);
        node.prev = None;
        node.next = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(block_id: u32) -> BlockCacheKey {
        BlockCacheKey::new(0x1000, block_id)
    }

    #[test]
    fn test_insert_orders_queue_by_arrival() {
        let mut index = NodeIndex::new();
        for id in [3, 1, 2] {
            index.insert_tail(key(id), id).unwrap();
        }
        assert_eq!(index.lru_keys(), vec![key(3), key(1), key(2)]);
        let ordered: Vec<_> = index.ordered_keys().copied().collect();
        assert_eq!(ordered, vec![key(1), key(2), key(3)]);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_duplicate_insert_rejected() {
        let mut index = NodeIndex::new();
        index.insert_tail(key(1), "a").unwrap();
        assert_eq!(index.insert_tail(key(1), "b"), Err("b"));
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn test_touch_moves_to_tail() {
        let mut index = NodeIndex::new();
        let first = index.insert_tail(key(1), ()).unwrap();
        index.insert_tail(key(2), ()).unwrap();
        index.insert_tail(key(3), ()).unwrap();

        index.touch(first);
        assert_eq!(index.lru_keys(), vec![key(2), key(3), key(1)]);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_remove_middle_and_reuse_slot() {
        let mut index = NodeIndex::new();
        index.insert_tail(key(1), 10).unwrap();
        let mid = index.insert_tail(key(2), 20).unwrap();
        index.insert_tail(key(3), 30).unwrap();

        assert_eq!(index.remove(mid), (key(2), 20));
        assert!(index.get(&key(2)).is_none());
        assert_eq!(index.lru_keys(), vec![key(1), key(3)]);

        let reused = index.insert_tail(key(4), 40).unwrap();
        assert_eq!(reused, mid);
        assert_eq!(*index.value(reused), 40);
        assert!(index.is_consistent());
    }

    #[test]
    fn test_pop_head_drains_oldest_first() {
        let mut index = NodeIndex::new();
        for id in 0..4 {
            index.insert_tail(key(id), id).unwrap();
        }
        let drained: Vec<_> = std::iter::from_fn(|| index.pop_head()).map(|(_, v)| v).collect();
        assert_eq!(drained, vec![0, 1, 2, 3]);
        assert!(index.is_empty());
        assert!(index.is_consistent());
    }
}
