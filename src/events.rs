use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventSource {
    Local,
    Remote,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventType {
    LocalCreated,
    LocalModified,
    LocalDeleted,
    RemoteCreated,
    RemoteModified,
    RemoteDeleted,
    TransferComplete,
    TransferFailed,
}

impl EventType {
    pub fn source(&self) -> EventSource {
        match self {
            EventType::LocalCreated | EventType::LocalModified | EventType::LocalDeleted => {
                EventSource::Local
            }
            EventType::RemoteCreated | EventType::RemoteModified | EventType::RemoteDeleted => {
                EventSource::Remote
            }
            EventType::TransferComplete | EventType::TransferFailed => EventSource::Internal,
        }
    }
}

/// Event priority levels; lower numeric value sorts first (higher priority).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Priority(pub u8);

impl Priority {
    pub const CRITICAL: Priority = Priority(10);
    pub const HIGH: Priority = Priority(20);
    pub const NORMAL: Priority = Priority(30);
    pub const LOW: Priority = Priority(90);
}

struct PriorityRule {
    event_type: EventType,
    priority: Priority,
}

/// Declarative event-type -> priority table (sec 4.8). Deletions first to
/// avoid wasted uploads, then local changes, then remote changes, then
/// internal bookkeeping last.
const PRIORITY_RULES: &[PriorityRule] = &[
    PriorityRule { event_type: EventType::LocalDeleted, priority: Priority::CRITICAL },
    PriorityRule { event_type: EventType::RemoteDeleted, priority: Priority::CRITICAL },
    PriorityRule { event_type: EventType::LocalCreated, priority: Priority::HIGH },
    PriorityRule { event_type: EventType::LocalModified, priority: Priority::HIGH },
    PriorityRule { event_type: EventType::RemoteCreated, priority: Priority::NORMAL },
    PriorityRule { event_type: EventType::RemoteModified, priority: Priority::NORMAL },
    PriorityRule { event_type: EventType::TransferComplete, priority: Priority::LOW },
    PriorityRule { event_type: EventType::TransferFailed, priority: Priority::LOW },
];

pub fn priority_for(event_type: EventType) -> Priority {
    PRIORITY_RULES
        .iter()
        .find(|r| r.event_type == event_type)
        .map(|r| r.priority)
        .unwrap_or(Priority::NORMAL)
}

/// A single sync event: a filesystem or remote change, or internal
/// bookkeeping fed back into the queue by the coordinator.
#[derive(Debug, Clone)]
pub struct SyncEvent {
    pub path: String,
    pub event_type: EventType,
    /// File mtime at observation time, when known (absent for internal
    /// bookkeeping events).
    pub mtime: Option<i64>,
    /// Monotonic-ish wall clock timestamp this event was enqueued at, used
    /// as a tiebreaker when mtimes are equal.
    pub timestamp: i64,
    pub dest_path: Option<String>,
}

impl SyncEvent {
    pub fn source(&self) -> EventSource {
        self.event_type.source()
    }

    pub fn priority(&self) -> Priority {
        priority_for(self.event_type)
    }

    /// Mtime-aware dedup comparator (sec 4.8, sec 8 property 5): returns
    /// true if `new` should replace `old` for the same path.
    ///
    /// - If both carry an mtime, the newer mtime wins; ties break by event
    ///   timestamp (newer wins).
    /// - If either is missing an mtime, `new` replaces `old` by default.
    pub fn should_replace(old: &SyncEvent, new: &SyncEvent) -> bool {
        match (old.mtime, new.mtime) {
            (Some(old_mtime), Some(new_mtime)) => {
                if new_mtime < old_mtime {
                    false
                } else if new_mtime == old_mtime {
                    new.timestamp > old.timestamp
                } else {
                    true
                }
            }
            _ => true,
        }
    }
}

struct QueueEntry {
    priority: Priority,
    sequence: u64,
    event: SyncEvent,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.sequence == other.sequence
    }
}
impl Eq for QueueEntry {}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; invert priority so the lowest numeric
        // value (highest priority) pops first, and lowest sequence (oldest)
        // breaks ties among equal priorities.
        other
            .priority
            .cmp(&self.priority)
            .then_with(|| other.sequence.cmp(&self.sequence))
    }
}
impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Priority queue of pending sync events with mtime-aware dedup per path:
/// enqueuing a second event for a path already queued replaces the first
/// only if [`SyncEvent::should_replace`] says so.
pub struct EventQueue {
    heap: BinaryHeap<QueueEntry>,
    by_path: HashMap<String, u64>,
    next_sequence: u64,
}

impl Default for EventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl EventQueue {
    pub fn new() -> Self {
        Self {
            heap: BinaryHeap::new(),
            by_path: HashMap::new(),
            next_sequence: 0,
        }
    }

    /// Enqueues `event`, deduplicating against any currently-queued event
    /// for the same path.
    pub fn push(&mut self, event: SyncEvent) {
        if let Some(&existing_sequence) = self.by_path.get(&event.path) {
            if let Some(existing) = self.peek_by_sequence(existing_sequence) {
                if !SyncEvent::should_replace(existing, &event) {
                    return;
                }
            }
        }

        let sequence = self.next_sequence;
        self.next_sequence += 1;
        self.by_path.insert(event.path.clone(), sequence);
        self.heap.push(QueueEntry { priority: event.priority(), sequence, event });
    }

    fn peek_by_sequence(&self, sequence: u64) -> Option<&SyncEvent> {
        self.heap.iter().find(|e| e.sequence == sequence).map(|e| &e.event)
    }

    /// Pops the highest-priority event, skipping stale entries left behind
    /// by dedup replacement (an event whose path now maps to a newer
    /// sequence number in `by_path`).
    pub fn pop(&mut self) -> Option<SyncEvent> {
        while let Some(entry) = self.heap.pop() {
            if self.by_path.get(&entry.event.path) == Some(&entry.sequence) {
                self.by_path.remove(&entry.event.path);
                return Some(entry.event);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.by_path.is_empty()
    }

    pub fn len(&self) -> usize {
        self.by_path.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(path: &str, event_type: EventType, mtime: Option<i64>, timestamp: i64) -> SyncEvent {
        SyncEvent { path: path.to_string(), event_type, mtime, timestamp, dest_path: None }
    }

    #[test]
    fn priority_ordering_pops_critical_first() {
        let mut queue = EventQueue::new();
        queue.push(event("b.txt", EventType::RemoteCreated, None, 1));
        queue.push(event("a.txt", EventType::LocalDeleted, None, 2));

        let first = queue.pop().unwrap();
        assert_eq!(first.path, "a.txt");
    }

    #[test]
    fn dedup_keeps_newer_mtime() {
        let mut queue = EventQueue::new();
        queue.push(event("a.txt", EventType::LocalModified, Some(100), 1));
        queue.push(event("a.txt", EventType::LocalModified, Some(200), 2));

        assert_eq!(queue.len(), 1);
        let popped = queue.pop().unwrap();
        assert_eq!(popped.mtime, Some(200));
    }

    #[test]
    fn dedup_rejects_stale_mtime() {
        let mut queue = EventQueue::new();
        queue.push(event("a.txt", EventType::LocalModified, Some(200), 1));
        queue.push(event("a.txt", EventType::LocalModified, Some(100), 2));

        let popped = queue.pop().unwrap();
        assert_eq!(popped.mtime, Some(200));
    }

    #[test]
    fn dedup_ties_break_by_timestamp() {
        let mut queue = EventQueue::new();
        queue.push(event("a.txt", EventType::LocalModified, Some(100), 1));
        queue.push(event("a.txt", EventType::LocalModified, Some(100), 2));

        let popped = queue.pop().unwrap();
        assert_eq!(popped.timestamp, 2);
    }

    #[test]
    fn missing_mtime_always_replaces() {
        let mut queue = EventQueue::new();
        queue.push(event("a.txt", EventType::TransferComplete, None, 1));
        queue.push(event("a.txt", EventType::TransferFailed, None, 2));

        let popped = queue.pop().unwrap();
        assert_eq!(popped.event_type, EventType::TransferFailed);
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn dedup_always_keeps_higher_mtime(m1 in any::<i64>(), m2 in any::<i64>(), t1 in any::<i64>(), t2 in any::<i64>()) {
            let mut queue = EventQueue::new();
            let e1 = SyncEvent { path: "a.txt".into(), event_type: EventType::LocalModified, mtime: Some(m1), timestamp: t1, dest_path: None };
            let e2 = SyncEvent { path: "a.txt".into(), event_type: EventType::LocalModified, mtime: Some(m2), timestamp: t2, dest_path: None };
            queue.push(e1);
            queue.push(e2);

            let popped = queue.pop().unwrap();
            let expected_mtime = if m1 == m2 {
                if t2 > t1 { m2 } else { m1 }
            } else {
                m1.max(m2)
            };
            prop_assert_eq!(popped.mtime, Some(expected_mtime));
        }
    }
}
