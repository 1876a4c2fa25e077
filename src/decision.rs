use crate::events::{EventSource, EventType, SyncEvent};
use crate::tracker::{Transfer, TransferType};

/// Action the coordinator takes when a new event arrives for a path that
/// already has an active transfer (sec 4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecisionAction {
    /// Already handling this path; drop the new event.
    Ignore,
    /// Cancel the active transfer and re-enqueue the new event.
    CancelAndRequeue,
    /// Let the active transfer continue, but flag a potential conflict.
    MarkConflict,
    /// Save the local file aside before the active transfer overwrites it.
    CreateConflictCopy,
}

struct DecisionRule {
    new_event_source: EventSource,
    new_event_type: Option<EventType>,
    existing_transfer: TransferType,
    action: DecisionAction,
}

/// Declarative decision matrix (sec 4.9), evaluated top to bottom; the
/// first matching rule wins.
const DECISION_RULES: &[DecisionRule] = &[
    // Local events during a download: local change takes precedence.
    DecisionRule {
        new_event_source: EventSource::Local,
        new_event_type: None,
        existing_transfer: TransferType::Download,
        action: DecisionAction::CancelAndRequeue,
    },
    // Remote modified during an upload: server may have changed underneath us.
    DecisionRule {
        new_event_source: EventSource::Remote,
        new_event_type: Some(EventType::RemoteModified),
        existing_transfer: TransferType::Upload,
        action: DecisionAction::MarkConflict,
    },
    // Remote deleted during an upload: preserve local work as a conflict copy.
    DecisionRule {
        new_event_source: EventSource::Remote,
        new_event_type: Some(EventType::RemoteDeleted),
        existing_transfer: TransferType::Upload,
        action: DecisionAction::CreateConflictCopy,
    },
    // Remote events during a download: already fetching the latest.
    DecisionRule {
        new_event_source: EventSource::Remote,
        new_event_type: None,
        existing_transfer: TransferType::Download,
        action: DecisionAction::Ignore,
    },
    // Local events during an upload: already uploading local changes.
    DecisionRule {
        new_event_source: EventSource::Local,
        new_event_type: None,
        existing_transfer: TransferType::Upload,
        action: DecisionAction::Ignore,
    },
];

fn matches(rule: &DecisionRule, source: EventSource, event_type: EventType, transfer_type: TransferType) -> bool {
    rule.new_event_source == source
        && rule.existing_transfer == transfer_type
        && rule.new_event_type.is_none_or(|t| t == event_type)
}

/// Evaluates the decision matrix for a new event against an active
/// transfer. Every `(source, event_type, transfer_type)` triple matches
/// exactly one outcome: the first matching rule, or [`DecisionAction::Ignore`]
/// as the default fallback (sec 8 property 7: decision totality).
pub fn decide(new_event: &SyncEvent, existing_transfer: &Transfer) -> DecisionAction {
    let source = new_event.source();
    let event_type = new_event.event_type;
    let transfer_type = existing_transfer.transfer_type;

    DECISION_RULES
        .iter()
        .find(|rule| matches(rule, source, event_type, transfer_type))
        .map(|rule| rule.action)
        .unwrap_or(DecisionAction::Ignore)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracker::TransferTracker;

    fn event(event_type: EventType) -> SyncEvent {
        SyncEvent { path: "a.txt".into(), event_type, mtime: None, timestamp: 0, dest_path: None }
    }

    #[test]
    fn local_change_cancels_download() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Download, None);
        let action = decide(&event(EventType::LocalModified), transfer);
        assert_eq!(action, DecisionAction::CancelAndRequeue);
    }

    #[test]
    fn remote_modified_during_upload_marks_conflict() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, Some(3));
        let action = decide(&event(EventType::RemoteModified), transfer);
        assert_eq!(action, DecisionAction::MarkConflict);
    }

    #[test]
    fn remote_deleted_during_upload_creates_conflict_copy() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, Some(3));
        let action = decide(&event(EventType::RemoteDeleted), transfer);
        assert_eq!(action, DecisionAction::CreateConflictCopy);
    }

    #[test]
    fn remote_events_during_download_are_ignored() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Download, None);
        let action = decide(&event(EventType::RemoteCreated), transfer);
        assert_eq!(action, DecisionAction::Ignore);
    }

    #[test]
    fn local_events_during_upload_are_ignored() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, None);
        let action = decide(&event(EventType::LocalCreated), transfer);
        assert_eq!(action, DecisionAction::Ignore);
    }

    #[test]
    fn unmatched_combination_defaults_to_ignore() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Delete, None);
        let action = decide(&event(EventType::LocalCreated), transfer);
        assert_eq!(action, DecisionAction::Ignore);
    }
}
