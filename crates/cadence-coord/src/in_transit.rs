//! Tags of messages relayed by the RTI but not yet known to be processed

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use cadence_core::Tag;

/// Min-heap of in-transit message tags for one destination
#[derive(Debug, Clone, Default)]
pub struct InTransitQueue {
    heap: BinaryHeap<Reverse<Tag>>,
}

impl InTransitQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tag: Tag) {
        self.heap.push(Reverse(tag));
    }

    /// Earliest tag still in transit
    pub fn earliest(&self) -> Option<Tag> {
        self.heap.peek().map(|Reverse(tag)| *tag)
    }

    /// Forget every record at or before `completed`
    pub fn remove_up_to(&mut self, completed: Tag) {
        while let Some(Reverse(tag)) = self.heap.peek() {
            if *tag > completed {
                break;
            }
            self.heap.pop();
        }
    }

    pub fn clear(&mut self) {
        self.heap.clear();
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }
}
