//! In-flight task tracking and completion dedup

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

/// Context attached to a dispatched task so completions can be routed back
/// to the right message/attachment.
#[derive(Debug, Clone, Default)]
pub struct TaskContext {
    pub message_id: Option<String>,
    pub attachment_id: Option<String>,
    pub conversation_id: Option<String>,
    pub user_id: Option<String>,
}

/// Task id -> context map. Entries are created on dispatch and removed on
/// completion or failure.
///
/// Process-local; a standalone voice-job completion whose task was
/// dispatched by a previous process simply loses its attachment association.
#[derive(Default)]
pub struct PendingTasks {
    inner: Mutex<HashMap<String, TaskContext>>,
}

impl PendingTasks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, task_id: &str, context: TaskContext) {
        let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
        inner.insert(task_id.to_string(), context);
    }

    pub fn get(&self, task_id: &str) -> Option<TaskContext> {
        let inner = self.inner.lock().expect("pending tasks lock poisoned");
        inner.get(task_id).cloned()
    }

    pub fn remove(&self, task_id: &str) -> Option<TaskContext> {
        let mut inner = self.inner.lock().expect("pending tasks lock poisoned");
        inner.remove(task_id)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("pending tasks lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct ProcessedInner {
    seen: HashSet<(String, String)>,
    order: VecDeque<(String, String)>,
}

/// Bounded set of `(task_id, target_language)` pairs making completion
/// handling idempotent. FIFO eviction once the capacity is reached.
pub struct ProcessedTaskSet {
    inner: Mutex<ProcessedInner>,
    capacity: usize,
}

impl ProcessedTaskSet {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(ProcessedInner {
                seen: HashSet::new(),
                order: VecDeque::new(),
            }),
            capacity: capacity.max(1),
        }
    }

    /// Record the pair. Returns `false` when it was already present, in
    /// which case the caller drops the duplicate delivery.
    pub fn insert(&self, task_id: &str, target_language: &str) -> bool {
        let key = (task_id.to_string(), target_language.to_string());
        let mut inner = self.inner.lock().expect("processed set lock poisoned");
        if !inner.seen.insert(key.clone()) {
            return false;
        }
        inner.order.push_back(key);
        while inner.order.len() > self.capacity {
            if let Some(oldest) = inner.order.pop_front() {
                inner.seen.remove(&oldest);
            }
        }
        true
    }

    pub fn contains(&self, task_id: &str, target_language: &str) -> bool {
        let inner = self.inner.lock().expect("processed set lock poisoned");
        inner
            .seen
            .contains(&(task_id.to_string(), target_language.to_string()))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("processed set lock poisoned").seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_insert_get_remove() {
        let pending = PendingTasks::new();
        pending.insert(
            "t1",
            TaskContext {
                message_id: Some("m1".to_string()),
                attachment_id: Some("a1".to_string()),
                conversation_id: Some("c1".to_string()),
                user_id: Some("u1".to_string()),
            },
        );
        assert_eq!(pending.len(), 1);
        assert_eq!(pending.get("t1").unwrap().message_id.as_deref(), Some("m1"));

        let removed = pending.remove("t1").unwrap();
        assert_eq!(removed.attachment_id.as_deref(), Some("a1"));
        assert!(pending.remove("t1").is_none());
        assert!(pending.is_empty());
    }

    #[test]
    fn test_processed_set_rejects_duplicates() {
        let set = ProcessedTaskSet::new(1000);
        assert!(set.insert("t1", "fr"));
        assert!(!set.insert("t1", "fr"));
        assert!(set.insert("t1", "de"));
        assert!(set.insert("t2", "fr"));
        assert_eq!(set.len(), 3);
    }

    #[test]
    fn test_processed_set_bounded_fifo() {
        let set = ProcessedTaskSet::new(3);
        for i in 0..5 {
            assert!(set.insert(&format!("t{}", i), "fr"));
        }
        assert_eq!(set.len(), 3);
        // Eldest entries are gone; a redelivery of t0 is no longer deduped.
        assert!(!set.contains("t0", "fr"));
        assert!(!set.contains("t1", "fr"));
        assert!(set.contains("t2", "fr"));
        assert!(set.contains("t4", "fr"));
        assert!(set.insert("t0", "fr"));
    }
}
