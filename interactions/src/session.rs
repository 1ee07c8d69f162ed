//! The viewer identity lifecycle. Reconciliation is meaningless without an
//! identified viewer, and the override store must always be addressed by the
//! active viewer id, so the current identity is an explicit object here
//! rather than process-wide state.

use std::sync::Arc;

use thiserror::Error;
use tracing::{info, instrument, warn};

use crate::client::{ApiClient, ApiError};
use crate::entity::UserSummary;
use crate::store::StorageBackend;

/// Storage key holding the credential of the signed-in viewer.
pub const ACTIVE_API_KEY_STORAGE_KEY: &str = "session:api_key";

/// Any verification failure, transport trouble included, counts as a failed
/// sign-in and leaves the session signed out.
#[derive(Error, Debug)]
#[error("credential verification failed: {0}")]
pub struct SessionError(#[from] pub ApiError);

pub struct Session {
    api: Arc<dyn ApiClient>,
    storage: Arc<dyn StorageBackend>,
    viewer: Option<UserSummary>,
}

impl Session {
    pub fn new(api: Arc<dyn ApiClient>, storage: Arc<dyn StorageBackend>) -> Session {
        Session {
            api,
            storage,
            viewer: None,
        }
    }

    /// Verify a credential against the backend and make its account the
    /// active viewer. The credential is persisted so the next run can
    /// [`resume`](Session::resume) the session.
    #[instrument(skip_all)]
    pub async fn login(&mut self, api_key: &str) -> Result<UserSummary, SessionError> {
        self.api.set_api_key(Some(api_key.to_owned()));
        match self.api.current_user().await {
            Ok(user) => {
                if let Err(e) = self.storage.set(ACTIVE_API_KEY_STORAGE_KEY, api_key) {
                    // Sign-in still succeeds; it just will not survive a restart.
                    warn!("failed to persist session credential: {e}");
                }
                info!(viewer_id = user.id, "signed in");
                self.viewer = Some(user.clone());

                Ok(user)
            }
            Err(e) => {
                self.clear();

                Err(SessionError(e))
            }
        }
    }

    /// Sign out, dropping the in-memory viewer, the client credential and
    /// the persisted key.
    pub fn logout(&mut self) {
        self.clear();
    }

    /// Sign out and sign back in under another credential. Overrides written
    /// by the previous viewer stay keyed to that viewer and are invisible to
    /// the new one.
    pub async fn switch_identity(&mut self, api_key: &str) -> Result<UserSummary, SessionError> {
        self.logout();
        self.login(api_key).await
    }

    /// Re-verify a credential persisted by an earlier run, if any.
    #[instrument(skip_all)]
    pub async fn resume(&mut self) -> Result<Option<UserSummary>, SessionError> {
        match self.storage.get(ACTIVE_API_KEY_STORAGE_KEY) {
            Some(key) => self.login(&key).await.map(Some),
            None => Ok(None),
        }
    }

    pub fn viewer(&self) -> Option<&UserSummary> {
        self.viewer.as_ref()
    }

    pub fn viewer_id(&self) -> Option<i64> {
        self.viewer.as_ref().map(|v| v.id)
    }

    fn clear(&mut self) {
        self.viewer = None;
        self.api.set_api_key(None);
        if let Err(e) = self.storage.remove(ACTIVE_API_KEY_STORAGE_KEY) {
            warn!("failed to drop persisted session credential: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MockApiClient;
    use crate::store::MemoryStorage;

    fn mock_with_user(id: i64, username: &str) -> MockApiClient {
        MockApiClient::new().with_user(UserSummary {
            id,
            username: username.to_string(),
        })
    }

    #[tokio::test]
    async fn test_login_persists_credential_and_viewer() {
        let mock = mock_with_user(1, "arnau");
        let storage = Arc::new(MemoryStorage::new());
        let mut session = Session::new(Arc::new(mock.clone()), storage.clone());

        let viewer = session.login("key-1").await.expect("login verified");

        assert_eq!(viewer.id, 1);
        assert_eq!(session.viewer_id(), Some(1));
        assert_eq!(mock.api_key(), Some("key-1".to_string()));
        assert_eq!(
            storage.get(ACTIVE_API_KEY_STORAGE_KEY),
            Some("key-1".to_string())
        );
    }

    #[tokio::test]
    async fn test_failed_login_clears_credential() {
        // No user configured: every credential is rejected.
        let mock = MockApiClient::new();
        let storage = Arc::new(MemoryStorage::new());
        storage
            .set(ACTIVE_API_KEY_STORAGE_KEY, "stale")
            .expect("write fixture");
        let mut session = Session::new(Arc::new(mock.clone()), storage.clone());

        assert!(session.login("bad-key").await.is_err());
        assert_eq!(session.viewer_id(), None);
        assert_eq!(mock.api_key(), None);
        assert!(storage.get(ACTIVE_API_KEY_STORAGE_KEY).is_none());
    }

    #[tokio::test]
    async fn test_logout_drops_everything() {
        let mock = mock_with_user(1, "arnau");
        let storage = Arc::new(MemoryStorage::new());
        let mut session = Session::new(Arc::new(mock.clone()), storage.clone());

        session.login("key-1").await.expect("login verified");
        session.logout();

        assert_eq!(session.viewer_id(), None);
        assert_eq!(mock.api_key(), None);
        assert!(storage.get(ACTIVE_API_KEY_STORAGE_KEY).is_none());
    }

    #[tokio::test]
    async fn test_resume_without_persisted_credential() {
        let mut session = Session::new(
            Arc::new(MockApiClient::new()),
            Arc::new(MemoryStorage::new()),
        );

        let resumed = session.resume().await.expect("nothing to verify");
        assert!(resumed.is_none());
    }

    #[tokio::test]
    async fn test_resume_reverifies_persisted_credential() {
        let mock = mock_with_user(11, "nettie");
        let storage = Arc::new(MemoryStorage::new());

        {
            let mut session = Session::new(Arc::new(mock.clone()), storage.clone());
            session.login("key-11").await.expect("login verified");
        }

        // A fresh session over the same storage picks the credential up.
        let mut session = Session::new(Arc::new(mock), storage);
        let resumed = session.resume().await.expect("credential re-verified");
        assert_eq!(resumed.map(|v| v.id), Some(11));
        assert_eq!(session.viewer_id(), Some(11));
    }

    #[tokio::test]
    async fn test_switch_identity_changes_viewer() {
        // The mock serves one account at a time; swap it between logins.
        let mock = mock_with_user(1, "arnau");
        let storage = Arc::new(MemoryStorage::new());
        let mut session = Session::new(Arc::new(mock.clone()), storage);

        session.login("key-1").await.expect("login verified");
        assert_eq!(session.viewer_id(), Some(1));

        let mock = mock.with_user(UserSummary {
            id: 4,
            username: "andreu".to_string(),
        });
        session.switch_identity("key-4").await.expect("login verified");
        assert_eq!(session.viewer_id(), Some(4));
        assert_eq!(mock.api_key(), Some("key-4".to_string()));
    }
}
