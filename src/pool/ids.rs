//! Task ids and sandbox container names
//!
//! Container names never derive from client input. Production names carry
//! the random tail of a UUIDv7; tests use a deterministic counter.

use std::sync::atomic::{AtomicU64, Ordering};

use uuid::Uuid;

/// Source of task ids and container base names
pub trait IdSource: Send + Sync {
    /// Next task id, unique for the process lifetime
    fn next_task_id(&self) -> u64;

    /// Fresh container base name, unique per task
    fn container_name(&self) -> String;
}

/// Sequential task ids, `codexec-<12 hex>` container names
#[derive(Debug, Default)]
pub struct UuidIds {
    next_task: AtomicU64,
}

impl UuidIds {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdSource for UuidIds {
    fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn container_name(&self) -> String {
        // v7 = 48-bit timestamp + random; the last 12 hex digits are random
        let simple = Uuid::now_v7().simple().to_string();
        format!("codexec-{}", &simple[simple.len() - 12..])
    }
}

/// Fully deterministic ids: `<prefix>-1`, `<prefix>-2`, ...
#[derive(Debug)]
pub struct SequentialIds {
    prefix: String,
    next_task: AtomicU64,
    next_container: AtomicU64,
}

impl SequentialIds {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_task: AtomicU64::new(0),
            next_container: AtomicU64::new(0),
        }
    }
}

impl IdSource for SequentialIds {
    fn next_task_id(&self) -> u64 {
        self.next_task.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn container_name(&self) -> String {
        let n = self.next_container.fetch_add(1, Ordering::Relaxed) + 1;
        format!("{}-{}", self.prefix, n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_uuid_names_are_unique() {
        let ids = UuidIds::new();
        let names: HashSet<String> = (0..100).map(|_| ids.container_name()).collect();
        assert_eq!(names.len(), 100);
        assert!(names.iter().all(|n| n.starts_with("codexec-") && n.len() == 20));
    }

    #[test]
    fn test_task_ids_start_at_one() {
        let ids = UuidIds::new();
        assert_eq!(ids.next_task_id(), 1);
        assert_eq!(ids.next_task_id(), 2);
    }

    #[test]
    fn test_sequential_names() {
        let ids = SequentialIds::new("box");
        assert_eq!(ids.container_name(), "box-1");
        assert_eq!(ids.container_name(), "box-2");
    }
}
