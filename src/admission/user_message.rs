use std::{sync::Arc, time::Duration};

use chrono::Utc;

use crate::store::{Store, StoreKeys, StoreResult, UserMessageAcquire};

/// Serializes conversation turns against one upstream account.
///
/// At most one request holds the lock per account, and consecutive holders
/// are spaced by a minimum gap (measured from the previous holder's release)
/// so bursty clients cannot hammer a single upstream session.
#[derive(Clone)]
pub struct UserMessageSerializer {
    store: Arc<dyn Store>,
}

impl UserMessageSerializer {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Try to take the turn for `request_id` against `account_id`.
    pub async fn acquire(
        &self,
        account_id: &str,
        request_id: &str,
        lock_ttl: Duration,
        min_gap: Duration,
    ) -> StoreResult<UserMessageAcquire> {
        self.store
            .user_message_acquire(
                &StoreKeys::user_message_lock(account_id),
                &StoreKeys::user_message_last(account_id),
                request_id,
                lock_ttl.as_millis() as i64,
                min_gap.as_millis() as i64,
                Utc::now().timestamp_millis(),
            )
            .await
    }

    /// Release the turn, stamping the completion time the next acquire's gap
    /// check reads. Returns false when this request no longer held the lock.
    pub async fn release(&self, account_id: &str, request_id: &str) -> StoreResult<bool> {
        self.store
            .user_message_release(
                &StoreKeys::user_message_lock(account_id),
                &StoreKeys::user_message_last(account_id),
                request_id,
                Utc::now().timestamp_millis(),
            )
            .await
    }
}
