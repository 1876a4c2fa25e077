use thiserror::Error;

/// Error taxonomy for the sync engine. Each variant group determines how the
/// coordinator and retry layer react: connectivity retries indefinitely,
/// transient retries up to a bound, conflict is handed to the resolver, the
/// rest surface directly.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error("validation: {0}")]
    Validation(String),

    #[error("authentication: {0}")]
    Authentication(String),

    #[error("conflict: server has version {detected_version}")]
    Conflict { detected_version: u64 },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("integrity: {0}")]
    Integrity(#[from] IntegrityError),

    #[error("connectivity: {0}")]
    Connectivity(String),

    #[error("transient: {0}")]
    Transient(String),

    #[error("cancelled")]
    Cancelled,

    #[error("fatal: {0}")]
    Fatal(String),
}

/// Integrity failures: tampered ciphertext or a corrupt reassembly.
#[derive(Debug, Error)]
pub enum IntegrityError {
    #[error("authentication tag mismatch: bad key or tampered ciphertext")]
    BadKeyOrTampered,

    #[error("content hash mismatch after reassembly: expected {expected}, got {actual}")]
    ContentHashMismatch { expected: String, actual: String },
}

impl SyncError {
    /// True for errors the retry layer should treat as connectivity: worth
    /// an indefinite network-wait rather than a bounded backoff.
    pub fn is_connectivity(&self) -> bool {
        matches!(self, SyncError::Connectivity(_))
    }

    /// True for errors worth a bounded backoff retry (sec 7: 5xx/429).
    pub fn is_transient(&self) -> bool {
        matches!(self, SyncError::Transient(_))
    }

    /// True for errors that must never be retried.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SyncError::Validation(_)
                | SyncError::Authentication(_)
                | SyncError::Fatal(_)
                | SyncError::Integrity(_)
        )
    }

    pub fn connectivity(msg: impl Into<String>) -> Self {
        SyncError::Connectivity(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        SyncError::Transient(msg.into())
    }

    /// Classifies a `reqwest::Error` per sec 7: timeouts/connect failures are
    /// connectivity, 5xx/429 status codes are transient, everything else is
    /// treated as a fatal wire-protocol violation.
    pub fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() || err.is_connect() {
            return SyncError::Connectivity(err.to_string());
        }
        if let Some(status) = err.status() {
            if status.is_server_error() || status.as_u16() == 429 {
                return SyncError::Transient(err.to_string());
            }
            if status.as_u16() == 401 || status.as_u16() == 403 {
                return SyncError::Authentication(err.to_string());
            }
            if status.as_u16() == 404 {
                return SyncError::NotFound(err.to_string());
            }
        }
        SyncError::Fatal(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_retry_groups() {
        assert!(SyncError::connectivity("refused").is_connectivity());
        assert!(SyncError::transient("503").is_transient());
        assert!(SyncError::Validation("bad path".into()).is_terminal());
        assert!(SyncError::Integrity(IntegrityError::BadKeyOrTampered).is_terminal());
        assert!(!SyncError::Cancelled.is_terminal());
    }

    #[test]
    fn integrity_converts_via_from() {
        let err: SyncError = IntegrityError::BadKeyOrTampered.into();
        assert!(matches!(err, SyncError::Integrity(_)));
    }
}
