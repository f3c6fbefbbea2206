use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AccountType;

/// A sticky-session binding from a session fingerprint to an upstream
/// account, so follow-up turns of one conversation reach the same upstream.
///
/// Stored as JSON under `sticky_session:{hash}` with RFC 3339 timestamps.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StickySession {
    pub account_id: String,
    pub account_type: AccountType,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub renewed_at: Option<DateTime<Utc>>,
}

impl StickySession {
    pub fn new(account_id: impl Into<String>, account_type: AccountType, ttl: std::time::Duration) -> Self {
        let now = Utc::now();
        Self {
            account_id: account_id.into(),
            account_type,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1)),
            renewed_at: None,
        }
    }

    /// Extend the binding, stamping the renewal time.
    pub fn renew(&mut self, ttl: std::time::Duration) {
        let now = Utc::now();
        self.expires_at = now + chrono::Duration::from_std(ttl).unwrap_or(chrono::Duration::hours(1));
        self.renewed_at = Some(now);
    }
}
