use std::{sync::Arc, time::Duration};

use crate::{
    models::{AccountType, StickySession},
    store::{Store, StoreExt, StoreKeys, StoreResult},
};

/// Sticky-session records in the store.
///
/// A binding maps a session fingerprint to the upstream account serving that
/// conversation. Bindings are written with the configured TTL and renewed
/// for the same span on every reuse; rebinding simply overwrites.
#[derive(Clone)]
pub struct SessionStore {
    store: Arc<dyn Store>,
    ttl: Duration,
}

impl SessionStore {
    pub fn new(store: Arc<dyn Store>, ttl: Duration) -> Self {
        Self { store, ttl }
    }

    pub async fn get(&self, session_hash: &str) -> StoreResult<Option<StickySession>> {
        self.store
            .get_json(&StoreKeys::sticky_session(session_hash))
            .await
    }

    /// Create or replace a binding with a fresh TTL.
    pub async fn bind(
        &self,
        session_hash: &str,
        account_id: &str,
        account_type: AccountType,
    ) -> StoreResult<()> {
        let session = StickySession::new(account_id, account_type, self.ttl);
        self.store
            .set_json(&StoreKeys::sticky_session(session_hash), &session, self.ttl)
            .await
    }

    /// Extend an existing binding, stamping the renewal time.
    pub async fn renew(&self, session_hash: &str, mut session: StickySession) -> StoreResult<()> {
        session.renew(self.ttl);
        self.store
            .set_json(&StoreKeys::sticky_session(session_hash), &session, self.ttl)
            .await
    }

    pub async fn delete(&self, session_hash: &str) -> StoreResult<()> {
        self.store
            .delete(&StoreKeys::sticky_session(session_hash))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn sessions() -> SessionStore {
        SessionStore::new(Arc::new(MemoryStore::new()), Duration::from_secs(3600))
    }

    #[tokio::test]
    async fn test_bind_get_delete() {
        let sessions = sessions();

        assert!(sessions.get("H").await.unwrap().is_none());

        sessions.bind("H", "a1", AccountType::Claude).await.unwrap();
        let session = sessions.get("H").await.unwrap().unwrap();
        assert_eq!(session.account_id, "a1");
        assert_eq!(session.account_type, AccountType::Claude);
        assert!(session.renewed_at.is_none());

        sessions.delete("H").await.unwrap();
        assert!(sessions.get("H").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_rebind_replaces() {
        let sessions = sessions();
        sessions.bind("H", "a1", AccountType::Claude).await.unwrap();
        sessions
            .bind("H", "a2", AccountType::ClaudeConsole)
            .await
            .unwrap();

        let session = sessions.get("H").await.unwrap().unwrap();
        assert_eq!(session.account_id, "a2");
        assert_eq!(session.account_type, AccountType::ClaudeConsole);
    }

    #[tokio::test]
    async fn test_renew_stamps_renewal() {
        let sessions = sessions();
        sessions.bind("H", "a1", AccountType::Claude).await.unwrap();

        let session = sessions.get("H").await.unwrap().unwrap();
        sessions.renew("H", session).await.unwrap();

        let renewed = sessions.get("H").await.unwrap().unwrap();
        assert!(renewed.renewed_at.is_some());
    }
}
