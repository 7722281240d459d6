//! Process-wide table of pending and in-flight transfers.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::{TransferId, TransferSession, TransferState};
use crate::error::{Error, Result};

#[derive(Debug)]
struct Entry {
    session: TransferSession,
    cancel: CancellationToken,
    data_plane_active: bool,
}

/// Tracks every live [`TransferSession`] by id.
///
/// Ids are unique while a session lives, each id has at most one active
/// data-plane operation, and every session owns a [`CancellationToken`].
/// Moving a session into a terminal state removes it.
#[derive(Debug, Clone, Default)]
pub struct TransferRegistry {
    entries: Arc<Mutex<HashMap<TransferId, Entry>>>,
}

impl TransferRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new session and return its cancellation token.
    pub async fn insert(&self, session: TransferSession) -> Result<CancellationToken> {
        let mut entries = self.entries.lock().await;
        if entries.contains_key(&session.transfer_id) {
            return Err(Error::DuplicateTransfer(session.transfer_id.to_string()));
        }

        let cancel = CancellationToken::new();
        entries.insert(
            session.transfer_id.clone(),
            Entry {
                session,
                cancel: cancel.clone(),
                data_plane_active: false,
            },
        );
        Ok(cancel)
    }

    /// Snapshot of one session.
    pub async fn get(&self, id: &TransferId) -> Option<TransferSession> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| entry.session.clone())
    }

    /// Whether a session with this id is live.
    pub async fn contains(&self, id: &TransferId) -> bool {
        self.entries.lock().await.contains_key(id)
    }

    /// Snapshot of every live session, oldest first.
    pub async fn sessions(&self) -> Vec<TransferSession> {
        let mut sessions: Vec<_> = self
            .entries
            .lock()
            .await
            .values()
            .map(|entry| entry.session.clone())
            .collect();
        sessions.sort_by_key(|s| s.started_at);
        sessions
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.entries.lock().await.len()
    }

    /// Whether no session is live.
    pub async fn is_empty(&self) -> bool {
        self.entries.lock().await.is_empty()
    }

    /// Move a session to `next`.
    ///
    /// Terminal states remove the session; the returned snapshot is the
    /// final one.
    pub async fn transition(
        &self,
        id: &TransferId,
        next: TransferState,
    ) -> Result<TransferSession> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;

        let current = entry.session.state;
        if !current.can_transition_to(next) {
            return Err(Error::InvalidState {
                transfer_id: id.to_string(),
                from: current.to_string(),
                to: next.to_string(),
            });
        }

        entry.session.state = next;
        let snapshot = entry.session.clone();
        tracing::debug!("transfer {}: {} -> {}", id, current, next);

        if next.is_terminal() {
            entries.remove(id);
        }
        Ok(snapshot)
    }

    /// Mark a session failed with `message` and remove it.
    pub async fn fail(&self, id: &TransferId, message: &str) -> Option<TransferSession> {
        let mut entries = self.entries.lock().await;
        let mut entry = entries.remove(id)?;
        entry.session.state = TransferState::Failed;
        entry.session.error = Some(message.to_string());
        tracing::debug!("transfer {} failed: {}", id, message);
        Some(entry.session)
    }

    /// Claim the single data-plane slot for `id`.
    ///
    /// Returns the session's cancellation token; a second claim while the
    /// first is live fails with [`Error::TransferActive`].
    pub async fn begin_data_plane(&self, id: &TransferId) -> Result<CancellationToken> {
        let mut entries = self.entries.lock().await;
        let entry = entries
            .get_mut(id)
            .ok_or_else(|| Error::UnknownTransfer(id.to_string()))?;

        if entry.data_plane_active {
            return Err(Error::TransferActive(id.to_string()));
        }
        entry.data_plane_active = true;
        Ok(entry.cancel.clone())
    }

    /// Record progress; the stored count never decreases.
    ///
    /// Returns the stored count, or `None` if the session is gone.
    pub async fn record_progress(&self, id: &TransferId, bytes: u64) -> Option<u64> {
        let mut entries = self.entries.lock().await;
        let entry = entries.get_mut(id)?;
        entry.session.bytes_transferred = entry.session.bytes_transferred.max(bytes);
        Some(entry.session.bytes_transferred)
    }

    /// The session's cancellation token.
    pub async fn token(&self, id: &TransferId) -> Option<CancellationToken> {
        self.entries
            .lock()
            .await
            .get(id)
            .map(|entry| entry.cancel.clone())
    }

    /// Trigger the session's cancellation token.
    ///
    /// The task that owns the data plane observes the token and finishes the
    /// session. Returns `false` if no such session is live.
    pub async fn cancel(&self, id: &TransferId) -> bool {
        match self.entries.lock().await.get(id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transfer::TransportKind;

    fn outbound(id: &str) -> TransferSession {
        TransferSession::outbound(
            TransferId::from(id),
            "192.168.1.42:8080",
            "a.txt",
            10,
            TransportKind::Chunked,
        )
    }

    #[tokio::test]
    async fn test_duplicate_id_rejected() {
        let registry = TransferRegistry::new();
        registry.insert(outbound("t1")).await.expect("first insert");

        let err = registry.insert(outbound("t1")).await.unwrap_err();
        assert!(matches!(err, Error::DuplicateTransfer(id) if id == "t1"));
        assert_eq!(registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_single_data_plane_per_id() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        registry.insert(outbound("t1")).await.expect("insert");

        registry.begin_data_plane(&id).await.expect("first claim");
        let err = registry.begin_data_plane(&id).await.unwrap_err();
        assert!(matches!(err, Error::TransferActive(_)));
    }

    #[tokio::test]
    async fn test_illegal_transition_rejected() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        registry.insert(outbound("t1")).await.expect("insert");

        let err = registry
            .transition(&id, TransferState::Transferring)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidState { .. }));
        assert_eq!(
            registry.get(&id).await.map(|s| s.state),
            Some(TransferState::Idle)
        );
    }

    #[tokio::test]
    async fn test_terminal_state_removes_session() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        registry.insert(outbound("t1")).await.expect("insert");

        registry
            .transition(&id, TransferState::MetadataSent)
            .await
            .expect("sent");
        registry
            .transition(&id, TransferState::AwaitingAccept)
            .await
            .expect("awaiting");
        let last = registry
            .transition(&id, TransferState::Rejected)
            .await
            .expect("rejected");

        assert_eq!(last.state, TransferState::Rejected);
        assert!(!registry.contains(&id).await);
        // the id may be reused once the old session is gone
        registry.insert(outbound("t1")).await.expect("reinsert");
    }

    #[tokio::test]
    async fn test_progress_is_monotonic() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        registry.insert(outbound("t1")).await.expect("insert");

        assert_eq!(registry.record_progress(&id, 6).await, Some(6));
        assert_eq!(registry.record_progress(&id, 4).await, Some(6));
        assert_eq!(registry.record_progress(&id, 10).await, Some(10));
        assert_eq!(
            registry.record_progress(&TransferId::from("nope"), 1).await,
            None
        );
    }

    #[tokio::test]
    async fn test_cancel_triggers_token() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        let token = registry.insert(outbound("t1")).await.expect("insert");

        assert!(registry.cancel(&id).await);
        assert!(token.is_cancelled());
        assert!(!registry.cancel(&TransferId::from("other")).await);
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let registry = TransferRegistry::new();
        let id = TransferId::from("t1");
        registry.insert(outbound("t1")).await.expect("insert");

        let failed = registry.fail(&id, "disk full").await.expect("session");
        assert_eq!(failed.state, TransferState::Failed);
        assert_eq!(failed.error.as_deref(), Some("disk full"));
        assert!(registry.is_empty().await);
    }
}
