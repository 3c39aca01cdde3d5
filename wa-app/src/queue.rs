use chrono::{DateTime, Utc};
use std::collections::VecDeque;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedPrompt {
    /// Arrival order, unique per queue.
    pub seq: u64,
    pub text: String,
    pub queued_at: DateTime<Utc>,
}

/// FIFO of prompts typed while the session was busy. Only the tail can be
/// edited or withdrawn.
#[derive(Debug, Default)]
pub struct PromptQueue {
    entries: VecDeque<QueuedPrompt>,
    next_seq: u64,
}

impl PromptQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `text` and returns its 1-based position.
    pub fn push(&mut self, text: impl Into<String>) -> usize {
        self.next_seq += 1;
        self.entries.push_back(QueuedPrompt {
            seq: self.next_seq,
            text: text.into(),
            queued_at: Utc::now(),
        });
        self.entries.len()
    }

    pub fn pop_front(&mut self) -> Option<QueuedPrompt> {
        self.entries.pop_front()
    }

    /// Replaces the tail's text in place, keeping its arrival order.
    pub fn edit_tail(&mut self, text: impl Into<String>) -> bool {
        match self.entries.back_mut() {
            Some(tail) => {
                tail.text = text.into();
                true
            }
            None => false,
        }
    }

    pub fn take_tail(&mut self) -> Option<QueuedPrompt> {
        self.entries.pop_back()
    }

    pub fn texts(&self) -> Vec<String> {
        self.entries.iter().map(|p| p.text.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_in_arrival_order() {
        let mut q = PromptQueue::new();
        assert_eq!(q.push("one"), 1);
        assert_eq!(q.push("two"), 2);
        assert_eq!(q.push("three"), 3);

        let drained: Vec<String> = std::iter::from_fn(|| q.pop_front().map(|p| p.text)).collect();
        assert_eq!(drained, vec!["one", "two", "three"]);
        assert!(q.texts().is_empty());
    }

    #[test]
    fn editing_the_tail_keeps_earlier_entries_in_place() {
        let mut q = PromptQueue::new();
        q.push("list plugins");
        q.push("delete akismet");
        assert!(q.edit_tail("deactivate akismet"));

        assert_eq!(q.texts(), vec!["list plugins", "deactivate akismet"]);
        assert_eq!(q.take_tail().map(|p| p.seq), Some(2));
    }

    #[test]
    fn take_tail_only_removes_the_newest() {
        let mut q = PromptQueue::new();
        q.push("a");
        q.push("b");
        assert_eq!(q.take_tail().map(|p| p.text).as_deref(), Some("b"));
        assert_eq!(q.texts(), vec!["a"]);

        q.push("c");
        let seqs: Vec<u64> = std::iter::from_fn(|| q.pop_front().map(|p| p.seq)).collect();
        assert_eq!(seqs, vec![1, 3]);
    }

    #[test]
    fn empty_queue_has_no_tail() {
        let mut q = PromptQueue::new();
        assert!(!q.edit_tail("x"));
        assert!(q.take_tail().is_none());
        assert!(q.pop_front().is_none());
    }
}
