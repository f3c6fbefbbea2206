use std::{collections::HashMap, fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Permission scope for API keys.
///
/// When `permissions` is empty on a key, the key has full access. When set,
/// the key can only reach provider categories matching those permissions
/// (or `all`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Permission {
    All,
    Claude,
    Gemini,
    Openai,
    Droid,
    Bedrock,
    Azure,
}

impl Permission {
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::All => "all",
            Permission::Claude => "claude",
            Permission::Gemini => "gemini",
            Permission::Openai => "openai",
            Permission::Droid => "droid",
            Permission::Bedrock => "bedrock",
            Permission::Azure => "azure",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "all" => Ok(Permission::All),
            "claude" => Ok(Permission::Claude),
            "gemini" => Ok(Permission::Gemini),
            "openai" => Ok(Permission::Openai),
            "droid" => Ok(Permission::Droid),
            "bedrock" => Ok(Permission::Bedrock),
            "azure" => Ok(Permission::Azure),
            _ => Err(format!("Invalid permission '{}'", s)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExpirationMode {
    /// `expires_at` is fixed at creation time.
    #[default]
    Fixed,
    /// `expires_at` is stamped on first use: the key activates itself and
    /// lives for `activation_days` x `activation_unit` from that moment.
    Activation,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivationUnit {
    #[default]
    Days,
    Hours,
}

/// The tenant credential.
///
/// Stored as a field-hash under `apikey:{id}` with camelCase field names;
/// numeric fields are ASCII decimal and parsed defensively (garbage reads
/// as zero). A secondary index maps the SHA-256 of the raw key to the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ApiKey {
    pub id: String,
    pub name: String,
    /// SHA-256 hex of the raw key. Written to both `hashedKey` and the
    /// legacy `apiKey` field for older readers.
    pub hashed_key: String,
    pub is_active: bool,
    pub is_deleted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub expiration_mode: ExpirationMode,
    pub is_activated: bool,
    pub activated_at: Option<DateTime<Utc>>,
    pub activation_days: i64,
    pub activation_unit: ActivationUnit,
    /// Empty means all providers.
    pub permissions: Vec<Permission>,
    /// Client allow-list. `*`/`all` entries allow anything; `prefix*`
    /// matches by prefix; anything else matches exactly (case-insensitive).
    /// Empty means all clients.
    pub allowed_clients: Vec<String>,
    /// Blocked model patterns: exact (case-insensitive), substring, or
    /// `prefix*`.
    pub model_blacklist: Vec<String>,
    /// 0 disables the concurrency gate.
    pub concurrent_limit: u32,
    /// 0 disables the per-minute window.
    pub rate_limit_per_min: u32,
    /// 0 disables the per-hour window.
    pub rate_limit_per_hour: u32,
    /// 0 disables the daily cost gate. USD.
    pub daily_cost_limit: f64,
    /// 0 disables the all-time cost gate. USD.
    pub total_cost_limit: f64,
    /// 0 disables the weekly Opus cost gate. USD.
    pub weekly_opus_cost_limit: f64,
    /// Length of the rolling cost window; 0 disables the window gate.
    pub rate_limit_window_minutes: u32,
    /// Cost cap inside the rolling window. USD.
    pub rate_limit_cost: f64,
    pub concurrent_request_queue_enabled: bool,
    pub concurrent_request_queue_max_size: u32,
    pub concurrent_request_queue_max_size_multiplier: f64,
    /// Non-positive falls back to the configured default.
    pub concurrent_request_queue_timeout_ms: i64,
    /// Prepaid balance that suppresses the daily/total/window cost gates
    /// while positive and unexpired. Never the weekly Opus gate.
    pub fuel_balance: f64,
    pub fuel_next_expires_at_ms: i64,
    pub created_at: DateTime<Utc>,
}

impl Default for ApiKey {
    fn default() -> Self {
        Self {
            id: String::new(),
            name: String::new(),
            hashed_key: String::new(),
            is_active: true,
            is_deleted: false,
            expires_at: None,
            expiration_mode: ExpirationMode::Fixed,
            is_activated: false,
            activated_at: None,
            activation_days: 0,
            activation_unit: ActivationUnit::Days,
            permissions: Vec::new(),
            allowed_clients: Vec::new(),
            model_blacklist: Vec::new(),
            concurrent_limit: 0,
            rate_limit_per_min: 0,
            rate_limit_per_hour: 0,
            daily_cost_limit: 0.0,
            total_cost_limit: 0.0,
            weekly_opus_cost_limit: 0.0,
            rate_limit_window_minutes: 0,
            rate_limit_cost: 0.0,
            concurrent_request_queue_enabled: false,
            concurrent_request_queue_max_size: 0,
            concurrent_request_queue_max_size_multiplier: 0.0,
            concurrent_request_queue_timeout_ms: 0,
            fuel_balance: 0.0,
            fuel_next_expires_at_ms: 0,
            created_at: Utc::now(),
        }
    }
}

/// SHA-256 hex of a raw API key, the index value for lookups.
pub fn hash_raw_key(raw_key: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(raw_key.as_bytes());
    hex::encode(hasher.finalize())
}

impl ApiKey {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|at| at <= now)
    }

    /// Whether this key still needs its activation-on-first-use transition.
    pub fn needs_activation(&self) -> bool {
        self.expiration_mode == ExpirationMode::Activation && !self.is_activated
    }

    /// Expiry stamped at activation: `activation_days` x unit from `now`.
    pub fn activation_expiry(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let span = match self.activation_unit {
            ActivationUnit::Days => chrono::Duration::days(self.activation_days),
            ActivationUnit::Hours => chrono::Duration::hours(self.activation_days),
        };
        now + span
    }

    pub fn has_permission(&self, required: Permission) -> bool {
        if self.permissions.is_empty() {
            return true;
        }
        self.permissions
            .iter()
            .any(|p| *p == Permission::All || *p == required)
    }

    pub fn client_allowed(&self, client: &str) -> bool {
        if self.allowed_clients.is_empty() {
            return true;
        }
        self.allowed_clients
            .iter()
            .any(|pattern| client_matches_pattern(client, pattern))
    }

    pub fn model_blacklisted(&self, model: &str) -> bool {
        self.model_blacklist
            .iter()
            .any(|pattern| blacklist_matches(model, pattern))
    }

    /// An active fuel pack requires both a positive balance and an unexpired
    /// next-expiry stamp.
    pub fn has_active_fuel_pack(&self, now_ms: i64) -> bool {
        self.fuel_balance > 0.0 && self.fuel_next_expires_at_ms > now_ms
    }

    /// Queue wait deadline, falling back to `default_ms` for non-positive
    /// overrides.
    pub fn queue_timeout_ms(&self, default_ms: u64) -> u64 {
        if self.concurrent_request_queue_timeout_ms > 0 {
            self.concurrent_request_queue_timeout_ms as u64
        } else {
            default_ms
        }
    }

    // ─────────────────────────────────────────────────────────────────────────
    // Field-hash codec
    // ─────────────────────────────────────────────────────────────────────────

    /// Encode for HSET. Both `hashedKey` and `apiKey` carry the hash so
    /// older readers keep working.
    pub fn to_fields(&self) -> Vec<(String, String)> {
        let mut fields = vec![
            ("id".into(), self.id.clone()),
            ("name".into(), self.name.clone()),
            ("hashedKey".into(), self.hashed_key.clone()),
            ("apiKey".into(), self.hashed_key.clone()),
            ("isActive".into(), self.is_active.to_string()),
            ("isDeleted".into(), self.is_deleted.to_string()),
            (
                "expirationMode".into(),
                match self.expiration_mode {
                    ExpirationMode::Fixed => "fixed".into(),
                    ExpirationMode::Activation => "activation".into(),
                },
            ),
            ("isActivated".into(), self.is_activated.to_string()),
            ("activationDays".into(), self.activation_days.to_string()),
            (
                "activationUnit".into(),
                match self.activation_unit {
                    ActivationUnit::Days => "days".into(),
                    ActivationUnit::Hours => "hours".into(),
                },
            ),
            (
                "permissions".into(),
                serde_json::to_string(&self.permissions).unwrap_or_else(|_| "[]".into()),
            ),
            (
                "allowedClients".into(),
                serde_json::to_string(&self.allowed_clients).unwrap_or_else(|_| "[]".into()),
            ),
            (
                "modelBlacklist".into(),
                serde_json::to_string(&self.model_blacklist).unwrap_or_else(|_| "[]".into()),
            ),
            ("concurrentLimit".into(), self.concurrent_limit.to_string()),
            ("rateLimitPerMin".into(), self.rate_limit_per_min.to_string()),
            (
                "rateLimitPerHour".into(),
                self.rate_limit_per_hour.to_string(),
            ),
            ("dailyCostLimit".into(), self.daily_cost_limit.to_string()),
            ("totalCostLimit".into(), self.total_cost_limit.to_string()),
            (
                "weeklyOpusCostLimit".into(),
                self.weekly_opus_cost_limit.to_string(),
            ),
            (
                "rateLimitWindowMinutes".into(),
                self.rate_limit_window_minutes.to_string(),
            ),
            ("rateLimitCost".into(), self.rate_limit_cost.to_string()),
            (
                "concurrentRequestQueueEnabled".into(),
                self.concurrent_request_queue_enabled.to_string(),
            ),
            (
                "concurrentRequestQueueMaxSize".into(),
                self.concurrent_request_queue_max_size.to_string(),
            ),
            (
                "concurrentRequestQueueMaxSizeMultiplier".into(),
                self.concurrent_request_queue_max_size_multiplier.to_string(),
            ),
            (
                "concurrentRequestQueueTimeoutMs".into(),
                self.concurrent_request_queue_timeout_ms.to_string(),
            ),
            ("fuelBalance".into(), self.fuel_balance.to_string()),
            (
                "fuelNextExpiresAtMs".into(),
                self.fuel_next_expires_at_ms.to_string(),
            ),
            ("createdAt".into(), self.created_at.to_rfc3339()),
        ];
        if let Some(at) = self.expires_at {
            fields.push(("expiresAt".into(), at.to_rfc3339()));
        }
        if let Some(at) = self.activated_at {
            fields.push(("activatedAt".into(), at.to_rfc3339()));
        }
        fields
    }

    /// Decode from HGETALL output. Returns `None` for an empty record.
    /// Every field parses defensively: bad strings read as zero/false/empty.
    pub fn from_fields(fields: &HashMap<String, String>) -> Option<Self> {
        let id = fields.get("id")?.clone();
        let hashed_key = fields
            .get("hashedKey")
            .or_else(|| fields.get("apiKey"))
            .cloned()
            .unwrap_or_default();

        Some(Self {
            id,
            name: field_str(fields, "name"),
            hashed_key,
            is_active: field_bool(fields, "isActive"),
            is_deleted: field_bool(fields, "isDeleted"),
            expires_at: field_time(fields, "expiresAt"),
            expiration_mode: match fields.get("expirationMode").map(String::as_str) {
                Some("activation") => ExpirationMode::Activation,
                _ => ExpirationMode::Fixed,
            },
            is_activated: field_bool(fields, "isActivated"),
            activated_at: field_time(fields, "activatedAt"),
            activation_days: field_i64(fields, "activationDays"),
            activation_unit: match fields.get("activationUnit").map(String::as_str) {
                Some("hours") => ActivationUnit::Hours,
                _ => ActivationUnit::Days,
            },
            permissions: field_list(fields, "permissions")
                .iter()
                .filter_map(|s| s.parse().ok())
                .collect(),
            allowed_clients: field_list(fields, "allowedClients"),
            model_blacklist: field_list(fields, "modelBlacklist"),
            concurrent_limit: field_i64(fields, "concurrentLimit").max(0) as u32,
            rate_limit_per_min: field_i64(fields, "rateLimitPerMin").max(0) as u32,
            rate_limit_per_hour: field_i64(fields, "rateLimitPerHour").max(0) as u32,
            daily_cost_limit: field_f64(fields, "dailyCostLimit"),
            total_cost_limit: field_f64(fields, "totalCostLimit"),
            weekly_opus_cost_limit: field_f64(fields, "weeklyOpusCostLimit"),
            rate_limit_window_minutes: field_i64(fields, "rateLimitWindowMinutes").max(0) as u32,
            rate_limit_cost: field_f64(fields, "rateLimitCost"),
            concurrent_request_queue_enabled: field_bool(fields, "concurrentRequestQueueEnabled"),
            concurrent_request_queue_max_size: field_i64(fields, "concurrentRequestQueueMaxSize")
                .max(0) as u32,
            concurrent_request_queue_max_size_multiplier: field_f64(
                fields,
                "concurrentRequestQueueMaxSizeMultiplier",
            ),
            concurrent_request_queue_timeout_ms: field_i64(
                fields,
                "concurrentRequestQueueTimeoutMs",
            ),
            fuel_balance: field_f64(fields, "fuelBalance"),
            fuel_next_expires_at_ms: field_i64(fields, "fuelNextExpiresAtMs"),
            created_at: field_time(fields, "createdAt").unwrap_or_else(Utc::now),
        })
    }
}

fn field_str(fields: &HashMap<String, String>, name: &str) -> String {
    fields.get(name).cloned().unwrap_or_default()
}

fn field_bool(fields: &HashMap<String, String>, name: &str) -> bool {
    fields.get(name).is_some_and(|v| v == "true" || v == "1")
}

fn field_i64(fields: &HashMap<String, String>, name: &str) -> i64 {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn field_f64(fields: &HashMap<String, String>, name: &str) -> f64 {
    fields
        .get(name)
        .and_then(|v| v.parse().ok())
        .unwrap_or(0.0)
}

fn field_time(fields: &HashMap<String, String>, name: &str) -> Option<DateTime<Utc>> {
    fields
        .get(name)
        .and_then(|v| DateTime::parse_from_rfc3339(v).ok())
        .map(|t| t.with_timezone(&Utc))
}

/// List fields are JSON arrays; older writers stored comma-separated
/// strings, so fall back to splitting.
fn field_list(fields: &HashMap<String, String>, name: &str) -> Vec<String> {
    let Some(raw) = fields.get(name) else {
        return Vec::new();
    };
    if raw.is_empty() {
        return Vec::new();
    }
    if let Ok(list) = serde_json::from_str::<Vec<String>>(raw) {
        return list;
    }
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect()
}

/// Client allow-list matching: `*` and `all` allow anything, `prefix*`
/// matches by prefix, anything else matches exactly. Case-insensitive.
fn client_matches_pattern(client: &str, pattern: &str) -> bool {
    if pattern == "*" || pattern.eq_ignore_ascii_case("all") {
        return true;
    }
    if let Some(prefix) = pattern.strip_suffix('*') {
        return client.to_ascii_lowercase().starts_with(&prefix.to_ascii_lowercase());
    }
    client.eq_ignore_ascii_case(pattern)
}

/// Model blacklist matching: exact (case-insensitive), substring, or
/// `prefix*`.
fn blacklist_matches(model: &str, pattern: &str) -> bool {
    let model_lower = model.to_ascii_lowercase();
    if let Some(prefix) = pattern.strip_suffix('*') {
        return model_lower.starts_with(&prefix.to_ascii_lowercase());
    }
    let pattern_lower = pattern.to_ascii_lowercase();
    model_lower == pattern_lower || model_lower.contains(&pattern_lower)
}

#[cfg(test)]
mod tests {
    use rstest::rstest;

    use super::*;

    #[test]
    fn test_hash_raw_key_is_sha256_hex() {
        // SHA-256("cr_test") -- pinned so the index stays wire-compatible
        assert_eq!(
            hash_raw_key("cr_test"),
            "e4fef97da781febe1f10f6fc39cf8d3b814a49510a2778559163e44b6dce5e05"
        );
    }

    #[test]
    fn test_field_round_trip() {
        let key = ApiKey {
            id: "k1".into(),
            name: "test".into(),
            hashed_key: "abc123".into(),
            permissions: vec![Permission::Claude, Permission::Gemini],
            allowed_clients: vec!["claude-cli*".into()],
            model_blacklist: vec!["gpt-3.5*".into()],
            concurrent_limit: 5,
            rate_limit_per_min: 60,
            daily_cost_limit: 10.5,
            expires_at: Some("2025-06-01T00:00:00Z".parse().unwrap()),
            concurrent_request_queue_enabled: true,
            concurrent_request_queue_max_size: 8,
            concurrent_request_queue_timeout_ms: 5_000,
            fuel_balance: 2.5,
            fuel_next_expires_at_ms: 1_750_000_000_000,
            ..Default::default()
        };

        let fields: HashMap<String, String> = key.to_fields().into_iter().collect();
        // Both the current and the legacy hash field carry the value
        assert_eq!(fields.get("hashedKey").unwrap(), "abc123");
        assert_eq!(fields.get("apiKey").unwrap(), "abc123");

        let parsed = ApiKey::from_fields(&fields).unwrap();
        assert_eq!(parsed.id, "k1");
        assert_eq!(parsed.permissions, vec![Permission::Claude, Permission::Gemini]);
        assert_eq!(parsed.allowed_clients, vec!["claude-cli*".to_string()]);
        assert_eq!(parsed.concurrent_limit, 5);
        assert_eq!(parsed.daily_cost_limit, 10.5);
        assert_eq!(parsed.expires_at, key.expires_at);
        assert!(parsed.concurrent_request_queue_enabled);
        assert_eq!(parsed.fuel_balance, 2.5);
    }

    #[test]
    fn test_from_fields_parses_garbage_as_zero() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "k1".to_string());
        fields.insert("concurrentLimit".to_string(), "not-a-number".to_string());
        fields.insert("dailyCostLimit".to_string(), "NaN garbage".to_string());
        fields.insert("isActive".to_string(), "yes".to_string());

        let key = ApiKey::from_fields(&fields).unwrap();
        assert_eq!(key.concurrent_limit, 0);
        assert_eq!(key.daily_cost_limit, 0.0);
        assert!(!key.is_active);
    }

    #[test]
    fn test_from_fields_accepts_comma_separated_lists() {
        let mut fields = HashMap::new();
        fields.insert("id".to_string(), "k1".to_string());
        fields.insert("allowedClients".to_string(), "gemini-cli, claude-cli".to_string());

        let key = ApiKey::from_fields(&fields).unwrap();
        assert_eq!(key.allowed_clients, vec!["gemini-cli", "claude-cli"]);
    }

    #[test]
    fn test_empty_permissions_allow_everything() {
        let key = ApiKey::default();
        assert!(key.has_permission(Permission::Claude));
        assert!(key.has_permission(Permission::Droid));
    }

    #[test]
    fn test_permission_all_short_circuits() {
        let key = ApiKey {
            permissions: vec![Permission::All],
            ..Default::default()
        };
        assert!(key.has_permission(Permission::Azure));
    }

    #[test]
    fn test_permission_exact_match() {
        let key = ApiKey {
            permissions: vec![Permission::Gemini],
            ..Default::default()
        };
        assert!(key.has_permission(Permission::Gemini));
        assert!(!key.has_permission(Permission::Claude));
    }

    #[rstest]
    #[case::star("*", "anything", true)]
    #[case::all_word("all", "anything", true)]
    #[case::exact("claude-cli", "claude-cli", true)]
    #[case::exact_case_insensitive("Claude-CLI", "claude-cli", true)]
    #[case::prefix("claude-*", "claude-code/1.2", true)]
    #[case::prefix_miss("claude-*", "gemini-cli", false)]
    #[case::mismatch("claude-cli", "gemini-cli", false)]
    fn test_client_patterns(#[case] pattern: &str, #[case] client: &str, #[case] expected: bool) {
        let key = ApiKey {
            allowed_clients: vec![pattern.to_string()],
            ..Default::default()
        };
        assert_eq!(key.client_allowed(client), expected);
    }

    #[rstest]
    #[case::exact("gpt-4o", "gpt-4o", true)]
    #[case::substring("opus", "claude-opus-4-20250514", true)]
    #[case::prefix("claude-3*", "claude-3-haiku", true)]
    #[case::miss("gpt-4o", "gpt-4o-mini", true)] // substring rule catches it
    #[case::clean_miss("davinci", "gpt-4o", false)]
    fn test_blacklist_patterns(#[case] pattern: &str, #[case] model: &str, #[case] expected: bool) {
        let key = ApiKey {
            model_blacklist: vec![pattern.to_string()],
            ..Default::default()
        };
        assert_eq!(key.model_blacklisted(model), expected);
    }

    #[test]
    fn test_fuel_pack_requires_balance_and_future_expiry() {
        let now_ms = 1_700_000_000_000;

        let active = ApiKey {
            fuel_balance: 5.0,
            fuel_next_expires_at_ms: now_ms + 3_600_000,
            ..Default::default()
        };
        assert!(active.has_active_fuel_pack(now_ms));

        let drained = ApiKey {
            fuel_balance: 0.0,
            fuel_next_expires_at_ms: now_ms + 3_600_000,
            ..Default::default()
        };
        assert!(!drained.has_active_fuel_pack(now_ms));

        let expired = ApiKey {
            fuel_balance: 5.0,
            fuel_next_expires_at_ms: now_ms - 1,
            ..Default::default()
        };
        assert!(!expired.has_active_fuel_pack(now_ms));
    }

    #[test]
    fn test_activation_expiry_units() {
        let key = ApiKey {
            activation_days: 7,
            ..Default::default()
        };
        let t0: DateTime<Utc> = "2025-01-01T00:00:00Z".parse().unwrap();
        assert_eq!(
            key.activation_expiry(t0),
            "2025-01-08T00:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );

        let hourly = ApiKey {
            activation_days: 12,
            activation_unit: ActivationUnit::Hours,
            ..Default::default()
        };
        assert_eq!(
            hourly.activation_expiry(t0),
            "2025-01-01T12:00:00Z".parse::<DateTime<Utc>>().unwrap()
        );
    }

    #[test]
    fn test_queue_timeout_fallback() {
        let key = ApiKey::default();
        assert_eq!(key.queue_timeout_ms(10_000), 10_000);

        let negative = ApiKey {
            concurrent_request_queue_timeout_ms: -5,
            ..Default::default()
        };
        assert_eq!(negative.queue_timeout_ms(10_000), 10_000);

        let set = ApiKey {
            concurrent_request_queue_timeout_ms: 2_000,
            ..Default::default()
        };
        assert_eq!(set.queue_timeout_ms(10_000), 2_000);
    }
}
