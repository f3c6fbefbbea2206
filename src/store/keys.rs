use std::time::Duration;

use crate::models::AccountType;

/// TTLs for the keys owned by the control plane.
///
/// These are part of the wire contract: other deployments of the relay read
/// and write the same keys, so changing a TTL here changes how long *their*
/// counters live too.
pub mod ttl {
    use std::time::Duration;

    /// API key field-hash. Refreshed on every write.
    pub const API_KEY: Duration = Duration::from_secs(365 * 86400);
    /// Daily usage and cost hashes.
    pub const USAGE_DAILY: Duration = Duration::from_secs(32 * 86400);
    /// Monthly usage and cost hashes.
    pub const USAGE_MONTHLY: Duration = Duration::from_secs(365 * 86400);
    /// Hourly usage hashes.
    pub const USAGE_HOURLY: Duration = Duration::from_secs(7 * 86400);
    /// Weekly Opus cost bucket, keyed by Monday of the week.
    pub const COST_WEEKLY_OPUS: Duration = Duration::from_secs(8 * 86400);
    /// Queue outcome counters.
    pub const QUEUE_STATS: Duration = Duration::from_secs(7 * 86400);
    /// Queue wait-time sample lists.
    pub const QUEUE_WAIT_TIMES: Duration = Duration::from_secs(86400);
    /// Sticky session records (caller-overridable at bind time).
    pub const STICKY_SESSION: Duration = Duration::from_secs(3600);
    /// OAuth handshake session records.
    pub const OAUTH_SESSION: Duration = Duration::from_secs(600);
    /// `user_msg_queue_last:` completion markers.
    pub const USER_MESSAGE_LAST: Duration = Duration::from_secs(60);
}

/// Builder for every key the control plane touches.
///
/// The formats are wire-compatible with existing relay deployments and must
/// not drift: a second control plane pointed at the same store has to see the
/// same counters.
pub struct StoreKeys;

impl StoreKeys {
    /// API key field-hash: `apikey:{id}`
    pub fn api_key(id: &str) -> String {
        format!("apikey:{}", id)
    }

    /// Legacy API key location, read-through only: `api_key:{id}`
    pub fn api_key_legacy(id: &str) -> String {
        format!("api_key:{}", id)
    }

    /// Secondary index from SHA-256 hex to key id: `apikey:hash_map`
    pub const API_KEY_HASH_INDEX: &'static str = "apikey:hash_map";

    /// Concurrency lease set per key (or per upstream account): `concurrency:{id}`
    pub fn concurrency(id: &str) -> String {
        format!("concurrency:{}", id)
    }

    /// Queue depth counter: `concurrency:queue:{id}`
    pub fn queue_counter(id: &str) -> String {
        format!("concurrency:queue:{}", id)
    }

    /// Queue outcome counters hash: `concurrency:queue:stats:{id}`
    pub fn queue_stats(id: &str) -> String {
        format!("concurrency:queue:stats:{}", id)
    }

    /// Per-key wait-time sample list: `concurrency:queue:wait_times:{id}`
    pub fn queue_wait_times(id: &str) -> String {
        format!("concurrency:queue:wait_times:{}", id)
    }

    /// Global wait-time sample list.
    pub const QUEUE_WAIT_TIMES_GLOBAL: &'static str = "concurrency:queue:wait_times:global";

    /// User-message serialization lock per upstream account.
    pub fn user_message_lock(account_id: &str) -> String {
        format!("user_msg_queue_lock:{}", account_id)
    }

    /// Last-completed marker paired with the user-message lock.
    pub fn user_message_last(account_id: &str) -> String {
        format!("user_msg_queue_last:{}", account_id)
    }

    /// Request-count window bucket: `rate_limit:{id}:{window}:{bucket}`
    pub fn rate_limit_window(id: &str, window: &str, bucket: i64) -> String {
        format!("rate_limit:{}:{}:{}", id, window, bucket)
    }

    /// Window-cost scalar: `rate_limit:cost:{id}`
    pub fn rate_limit_cost(id: &str) -> String {
        format!("rate_limit:cost:{}", id)
    }

    /// All-time usage hash per key: `usage:{id}`
    pub fn usage_total(id: &str) -> String {
        format!("usage:{}", id)
    }

    /// Daily usage hash: `usage:daily:{id}:{date}`
    pub fn usage_daily(id: &str, date: &str) -> String {
        format!("usage:daily:{}:{}", id, date)
    }

    /// Monthly usage hash: `usage:monthly:{id}:{month}`
    pub fn usage_monthly(id: &str, month: &str) -> String {
        format!("usage:monthly:{}:{}", id, month)
    }

    /// Hourly usage hash: `usage:hourly:{id}:{hour}`
    pub fn usage_hourly(id: &str, hour: &str) -> String {
        format!("usage:hourly:{}:{}", id, hour)
    }

    /// Per-model usage hash: `usage:{id}:model:{kind}:{model}:{bucket}`
    /// where `kind` is `daily`, `monthly` or `hourly`. System-wide variants
    /// use `system` as the id.
    pub fn usage_model(id: &str, kind: &str, model: &str, bucket: &str) -> String {
        format!("usage:{}:model:{}:{}:{}", id, kind, model, bucket)
    }

    /// Daily cost hash: `usage:cost:daily:{id}:{date}`
    pub fn cost_daily(id: &str, date: &str) -> String {
        format!("usage:cost:daily:{}:{}", id, date)
    }

    /// Monthly cost hash: `usage:cost:monthly:{id}:{month}`
    pub fn cost_monthly(id: &str, month: &str) -> String {
        format!("usage:cost:monthly:{}:{}", id, month)
    }

    /// All-time cost hash: `usage:cost:total:{id}`
    pub fn cost_total(id: &str) -> String {
        format!("usage:cost:total:{}", id)
    }

    /// Weekly Opus cost scalar, keyed by Monday of the week:
    /// `usage:cost:weekly_opus:{id}:{monday}`
    pub fn cost_weekly_opus(id: &str, monday: &str) -> String {
        format!("usage:cost:weekly_opus:{}:{}", id, monday)
    }

    /// All-time account usage mirror: `account_usage:{id}`
    pub fn account_usage_total(id: &str) -> String {
        format!("account_usage:{}", id)
    }

    /// Bucketed account usage mirror: `account_usage:{kind}:{id}:{bucket}`
    pub fn account_usage(kind: &str, id: &str, bucket: &str) -> String {
        format!("account_usage:{}:{}:{}", kind, id, bucket)
    }

    /// Sticky session record: `sticky_session:{hash}`
    pub fn sticky_session(session_hash: &str) -> String {
        format!("sticky_session:{}", session_hash)
    }

    /// Generic session record: `session:{id}`
    pub fn session(id: &str) -> String {
        format!("session:{}", id)
    }

    /// OAuth handshake session: `oauth_session:{id}`
    pub fn oauth_session(id: &str) -> String {
        format!("oauth_session:{}", id)
    }

    /// JSON account record: `{type_prefix}{id}`, e.g. `claude:account:{id}`
    pub fn account(account_type: AccountType, id: &str) -> String {
        format!("{}{}", account_type.key_prefix(), id)
    }

    /// System-wide per-minute metrics hash: `system:metrics:minute:{bucket}`
    pub fn system_metrics_minute(minute_bucket: i64) -> String {
        format!("system:metrics:minute:{}", minute_bucket)
    }

    /// TTL for a queue depth counter: the wait deadline plus a buffer so a
    /// crashed waiter cannot pin the counter forever.
    pub fn queue_counter_ttl(timeout_ms: u64) -> Duration {
        Duration::from_secs(timeout_ms.div_ceil(1000) + 30)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_key_formats() {
        assert_eq!(StoreKeys::api_key("k1"), "apikey:k1");
        assert_eq!(StoreKeys::api_key_legacy("k1"), "api_key:k1");
        assert_eq!(StoreKeys::API_KEY_HASH_INDEX, "apikey:hash_map");
    }

    #[test]
    fn test_concurrency_and_queue_formats() {
        assert_eq!(StoreKeys::concurrency("k1"), "concurrency:k1");
        assert_eq!(StoreKeys::queue_counter("k1"), "concurrency:queue:k1");
        assert_eq!(StoreKeys::queue_stats("k1"), "concurrency:queue:stats:k1");
        assert_eq!(
            StoreKeys::queue_wait_times("k1"),
            "concurrency:queue:wait_times:k1"
        );
        assert_eq!(
            StoreKeys::QUEUE_WAIT_TIMES_GLOBAL,
            "concurrency:queue:wait_times:global"
        );
    }

    #[test]
    fn test_rate_limit_formats() {
        assert_eq!(
            StoreKeys::rate_limit_window("k1", "minute", 28963440),
            "rate_limit:k1:minute:28963440"
        );
        assert_eq!(StoreKeys::rate_limit_cost("k1"), "rate_limit:cost:k1");
    }

    #[test]
    fn test_usage_formats() {
        assert_eq!(StoreKeys::usage_total("k1"), "usage:k1");
        assert_eq!(
            StoreKeys::usage_daily("k1", "2025-01-01"),
            "usage:daily:k1:2025-01-01"
        );
        assert_eq!(
            StoreKeys::usage_model("k1", "daily", "claude-3-5-sonnet", "2025-01-01"),
            "usage:k1:model:daily:claude-3-5-sonnet:2025-01-01"
        );
        assert_eq!(
            StoreKeys::cost_weekly_opus("k1", "2024-12-30"),
            "usage:cost:weekly_opus:k1:2024-12-30"
        );
    }

    #[test]
    fn test_account_formats() {
        assert_eq!(
            StoreKeys::account(AccountType::Claude, "a1"),
            "claude:account:a1"
        );
        assert_eq!(
            StoreKeys::account(AccountType::ClaudeConsole, "a1"),
            "claude_console:account:a1"
        );
        assert_eq!(
            StoreKeys::account(AccountType::AzureOpenAi, "a1"),
            "azure_openai:account:a1"
        );
    }

    #[test]
    fn test_queue_counter_ttl_rounds_up() {
        assert_eq!(
            StoreKeys::queue_counter_ttl(10_000),
            Duration::from_secs(40)
        );
        assert_eq!(StoreKeys::queue_counter_ttl(1_500), Duration::from_secs(32));
    }
}
