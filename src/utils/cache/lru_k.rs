use std::collections::{HashMap, VecDeque};

use super::Replacer;
use crate::buffer::FrameId;
use crate::error::{CrabTreeError, CrabTreeResult};

#[derive(Debug)]
struct LRUKNode {
    k: usize,
    // timestamps of the last k accesses of this frame
    history: VecDeque<u64>,
    is_evictable: bool,
}

impl LRUKNode {
    fn new(k: usize) -> Self {
        Self {
            k,
            history: VecDeque::new(),
            is_evictable: false,
        }
    }

    fn record_access(&mut self, timestamp: u64) {
        self.history.push_back(timestamp);
        if self.history.len() > self.k {
            self.history.pop_front();
        }
    }
}

#[derive(Debug)]
pub struct LRUKReplacer {
    // number of frames currently evictable
    current_size: usize,
    replacer_size: usize,
    k: usize,
    node_store: HashMap<FrameId, LRUKNode>,
    current_timestamp: u64,
}

impl LRUKReplacer {
    pub fn with_k(num_frames: usize, k: usize) -> Self {
        Self {
            current_size: 0,
            replacer_size: num_frames,
            k,
            node_store: HashMap::with_capacity(num_frames),
            current_timestamp: 0,
        }
    }
}

impl Replacer for LRUKReplacer {
    fn new(capacity: usize) -> Self {
        Self::with_k(capacity, 2)
    }

    fn record_access(&mut self, frame_id: FrameId) -> CrabTreeResult<()> {
        if let Some(node) = self.node_store.get_mut(&frame_id) {
            node.record_access(self.current_timestamp);
        } else {
            if self.node_store.len() >= self.replacer_size {
                return Err(CrabTreeError::Internal(
                    "frame count exceeds the replacer capacity".to_string(),
                ));
            }
            let mut node = LRUKNode::new(self.k);
            node.record_access(self.current_timestamp);
            self.node_store.insert(frame_id, node);
        }
        self.current_timestamp += 1;
        Ok(())
    }

    /// Evict the evictable frame with the largest backward k-distance.
    /// Frames with fewer than k recorded accesses count as infinite distance
    /// and are evicted first, oldest access first.
    fn evict(&mut self) -> Option<FrameId> {
        let mut max_k_distance = 0u64;
        let mut result = None;
        for (frame_id, node) in self.node_store.iter() {
            if !node.is_evictable {
                continue;
            }
            let oldest = match node.history.front() {
                Some(ts) => *ts,
                None => continue,
            };
            let k_distance = if node.history.len() < self.k {
                u64::MAX - oldest
            } else {
                self.current_timestamp - oldest
            };
            if k_distance > max_k_distance {
                max_k_distance = k_distance;
                result = Some(*frame_id);
            }
        }
        if let Some(frame_id) = result {
            self.remove(frame_id);
        }
        result
    }

    fn set_evictable(&mut self, frame_id: FrameId, set_evictable: bool) -> CrabTreeResult<()> {
        let Some(node) = self.node_store.get_mut(&frame_id) else {
            return Err(CrabTreeError::Internal(format!(
                "frame {} not found in the replacer",
                frame_id
            )));
        };
        let was_evictable = node.is_evictable;
        node.is_evictable = set_evictable;
        if set_evictable && !was_evictable {
            self.current_size += 1;
        } else if !set_evictable && was_evictable {
            self.current_size -= 1;
        }
        Ok(())
    }

    fn remove(&mut self, frame_id: FrameId) {
        if let Some(node) = self.node_store.remove(&frame_id) {
            if node.is_evictable {
                self.current_size -= 1;
            }
        }
    }

    fn size(&self) -> usize {
        self.current_size
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::cache::Replacer;

    #[test]
    fn test_lru_k_set_evictable() {
        let mut replacer = LRUKReplacer::with_k(3, 2);
        replacer.record_access(1).unwrap();
        replacer.set_evictable(1, true).unwrap();
        assert_eq!(replacer.size(), 1);
        replacer.set_evictable(1, false).unwrap();
        assert_eq!(replacer.size(), 0);
    }

    #[test]
    fn test_lru_k_evict_all_frames_at_least_k() {
        let mut replacer = LRUKReplacer::with_k(2, 3);
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.record_access(2).unwrap();
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        // frame 1 history: [0, 3], k-distance 5; frame 2 history: [1, 2, 4], k-distance 4
        assert_eq!(replacer.evict(), Some(1));
    }

    #[test]
    fn test_lru_k_evict_prefers_infinite_distance() {
        let mut replacer = LRUKReplacer::with_k(3, 3);
        replacer.record_access(1).unwrap(); // ts=0
        replacer.record_access(2).unwrap(); // ts=1, history < k
        replacer.record_access(3).unwrap(); // ts=2, history < k
        replacer.record_access(1).unwrap(); // ts=3
        replacer.record_access(1).unwrap(); // ts=4, history = [0, 3, 4]
        replacer.record_access(3).unwrap(); // ts=5, history = [2, 5]
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        replacer.set_evictable(3, true).unwrap();
        // frames 2 and 3 have infinite k-distance; frame 2 has the oldest access
        assert_eq!(replacer.evict(), Some(2));
        assert_eq!(replacer.evict(), Some(3));
        assert_eq!(replacer.evict(), Some(1));
        assert_eq!(replacer.evict(), None);
    }

    #[test]
    fn test_lru_k_remove() {
        let mut replacer = LRUKReplacer::with_k(3, 2);
        replacer.record_access(1).unwrap();
        replacer.record_access(2).unwrap();
        replacer.set_evictable(1, true).unwrap();
        replacer.set_evictable(2, true).unwrap();
        assert_eq!(replacer.size(), 2);
        replacer.remove(1);
        assert_eq!(replacer.size(), 1);
        assert_eq!(replacer.evict(), Some(2));
    }
}
