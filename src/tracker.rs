use crate::error::SyncError;
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferType {
    Upload,
    Download,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransferStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TransferStatus::Pending => "pending",
            TransferStatus::InProgress => "in_progress",
            TransferStatus::Completed => "completed",
            TransferStatus::Cancelled => "cancelled",
            TransferStatus::Failed => "failed",
        }
    }

    fn valid_next(&self) -> &'static [TransferStatus] {
        match self {
            TransferStatus::Pending => &[TransferStatus::InProgress, TransferStatus::Cancelled],
            TransferStatus::InProgress => &[
                TransferStatus::Completed,
                TransferStatus::Cancelled,
                TransferStatus::Failed,
            ],
            TransferStatus::Completed | TransferStatus::Cancelled | TransferStatus::Failed => &[],
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.valid_next().is_empty()
    }
}

#[derive(Debug)]
pub struct InvalidTransition {
    pub from: TransferStatus,
    pub to: TransferStatus,
}

impl std::fmt::Display for InvalidTransition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "cannot transition from {} to {}",
            self.from.as_str(),
            self.to.as_str()
        )
    }
}

impl std::error::Error for InvalidTransition {}

impl From<InvalidTransition> for SyncError {
    fn from(err: InvalidTransition) -> Self {
        SyncError::Fatal(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConflictKind {
    MetadataCommit,
    EagerDecision,
}

/// A tracked transfer operation for a single path. At most one non-terminal
/// transfer may exist per path at a time (enforced by [`TransferTracker`]).
#[derive(Debug)]
pub struct Transfer {
    pub path: String,
    pub transfer_type: TransferType,
    pub status: TransferStatus,
    pub cancel_requested: bool,
    pub error: Option<String>,
    pub base_version: Option<i64>,
    pub detected_server_version: Option<i64>,
    pub has_conflict: bool,
    pub conflict_kind: Option<ConflictKind>,
}

impl Transfer {
    fn new(path: impl Into<String>, transfer_type: TransferType, base_version: Option<i64>) -> Self {
        Self {
            path: path.into(),
            transfer_type,
            status: TransferStatus::Pending,
            cancel_requested: false,
            error: None,
            base_version,
            detected_server_version: None,
            has_conflict: false,
            conflict_kind: None,
        }
    }

    pub fn transition_to(&mut self, new_status: TransferStatus) -> Result<(), InvalidTransition> {
        if !self.status.valid_next().contains(&new_status) {
            return Err(InvalidTransition { from: self.status, to: new_status });
        }
        self.status = new_status;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TransferStatus::InProgress)
    }

    pub fn complete(&mut self) -> Result<(), InvalidTransition> {
        self.transition_to(TransferStatus::Completed)
    }

    /// Unlike most transitions, cancelling a terminal transfer is a no-op
    /// rather than an error, matching the source's forgiving `cancel()`.
    pub fn cancel(&mut self) {
        if matches!(self.status, TransferStatus::Pending | TransferStatus::InProgress) {
            let _ = self.transition_to(TransferStatus::Cancelled);
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) -> Result<(), InvalidTransition> {
        self.transition_to(TransferStatus::Failed)?;
        self.error = Some(error.into());
        Ok(())
    }

    pub fn request_cancel(&mut self) {
        self.cancel_requested = true;
    }

    pub fn mark_conflict(&mut self, kind: ConflictKind, detected_version: Option<i64>) {
        self.has_conflict = true;
        self.conflict_kind = Some(kind);
        if let Some(version) = detected_version {
            self.detected_server_version = Some(version);
        }
        self.request_cancel();
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// Tracks active transfers by path, enforcing at most one non-terminal
/// transfer per path (sec 4.10 invariant).
#[derive(Default)]
pub struct TransferTracker {
    transfers: HashMap<String, Transfer>,
}

impl TransferTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(
        &mut self,
        path: impl Into<String>,
        transfer_type: TransferType,
        base_version: Option<i64>,
    ) -> &mut Transfer {
        let path = path.into();
        let transfer = Transfer::new(path.clone(), transfer_type, base_version);
        self.transfers.insert(path.clone(), transfer);
        self.transfers.get_mut(&path).expect("just inserted")
    }

    pub fn get(&self, path: &str) -> Option<&Transfer> {
        self.transfers.get(path)
    }

    pub fn get_mut(&mut self, path: &str) -> Option<&mut Transfer> {
        self.transfers.get_mut(path)
    }

    /// Returns the transfer for `path` only if it is not yet terminal.
    pub fn get_active(&self, path: &str) -> Option<&Transfer> {
        self.transfers.get(path).filter(|t| !t.is_terminal())
    }

    pub fn remove(&mut self, path: &str) {
        self.transfers.remove(path);
    }

    pub fn all_active(&self) -> Vec<&Transfer> {
        self.transfers.values().filter(|t| !t.is_terminal()).collect()
    }

    pub fn cancel_all(&mut self) {
        for transfer in self.transfers.values_mut() {
            transfer.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.transfers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.transfers.is_empty()
    }

    pub fn contains(&self, path: &str) -> bool {
        self.transfers.contains_key(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_transitions_succeed() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, None);
        transfer.start().unwrap();
        transfer.complete().unwrap();
        assert!(transfer.is_terminal());
    }

    #[test]
    fn terminal_states_reject_transitions() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, None);
        transfer.start().unwrap();
        transfer.complete().unwrap();
        assert!(transfer.start().is_err());
    }

    #[test]
    fn cancel_requested_does_not_change_status() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("a.txt", TransferType::Upload, None);
        transfer.start().unwrap();
        transfer.request_cancel();
        assert_eq!(transfer.status, TransferStatus::InProgress);
        assert!(transfer.cancel_requested);
    }

    #[test]
    fn mark_conflict_requests_cancel() {
        let mut tracker = TransferTracker::new();
        let transfer = tracker.create("doc.txt", TransferType::Upload, Some(3));
        transfer.mark_conflict(ConflictKind::MetadataCommit, Some(4));
        assert!(transfer.has_conflict);
        assert_eq!(transfer.detected_server_version, Some(4));
        assert!(transfer.cancel_requested);
    }

    #[test]
    fn at_most_one_active_transfer_per_path() {
        let mut tracker = TransferTracker::new();
        tracker.create("a.txt", TransferType::Upload, None);
        assert!(tracker.get_active("a.txt").is_some());
        tracker.get_mut("a.txt").unwrap().start().unwrap();
        tracker.get_mut("a.txt").unwrap().complete().unwrap();
        assert!(tracker.get_active("a.txt").is_none());
    }
}
