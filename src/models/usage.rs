use chrono::{DateTime, Datelike, Duration as ChronoDuration, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Token usage reported by the forwarder after an upstream response
/// completes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    /// The admitted API key.
    pub key_id: String,
    /// The upstream account that served the request, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    pub model: String,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_create_tokens: i64,
    pub cache_read_tokens: i64,
    pub ephemeral_5m_tokens: i64,
    pub ephemeral_1h_tokens: i64,
    /// Classified by the caller; accounted separately so operators can
    /// measure the extended-context share.
    pub is_long_context: bool,
}

impl UsageRecord {
    /// input + output, the headline token count.
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens
    }

    /// Sum over all four token kinds.
    pub fn all_tokens(&self) -> i64 {
        self.input_tokens + self.output_tokens + self.cache_create_tokens + self.cache_read_tokens
    }
}

/// Monetary cost of one usage event, in USD.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostBreakdown {
    pub input: f64,
    pub output: f64,
    pub cache_create: f64,
    pub cache_read: f64,
    pub total: f64,
}

/// Normalize a model name for counter keys.
///
/// `claude-*` names lose any trailing `-YYYYMMDD` date stamp and any
/// trailing `-vN:M` ARN version; other names lose `-vN:M` or `:latest`.
/// Empty input reads as `unknown`.
pub fn normalize_model_name(model: &str) -> String {
    if model.is_empty() {
        return "unknown".to_string();
    }
    let mut name = model;
    if name.starts_with("claude-") {
        name = strip_trailing_date(name);
        name = strip_arn_version(name);
    } else {
        let stripped = strip_arn_version(name);
        if stripped.len() != name.len() {
            name = stripped;
        } else if let Some(head) = name.strip_suffix(":latest") {
            name = head;
        }
    }
    if name.is_empty() {
        "unknown".to_string()
    } else {
        name.to_string()
    }
}

/// Whether the model participates in the weekly Opus cost bucket.
pub fn is_opus_model(model: &str) -> bool {
    model.to_ascii_lowercase().contains("opus")
}

/// Strip a trailing `-YYYYMMDD` release date.
fn strip_trailing_date(name: &str) -> &str {
    if let Some((head, tail)) = name.rsplit_once('-')
        && tail.len() == 8
        && tail.bytes().all(|b| b.is_ascii_digit())
    {
        head
    } else {
        name
    }
}

/// Strip a trailing `-vN:M` ARN version suffix.
fn strip_arn_version(name: &str) -> &str {
    if let Some((head, tail)) = name.rsplit_once("-v")
        && let Some((major, minor)) = tail.split_once(':')
        && !major.is_empty()
        && major.bytes().all(|b| b.is_ascii_digit())
        && !minor.is_empty()
        && minor.bytes().all(|b| b.is_ascii_digit())
    {
        head
    } else {
        name
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Time bucketing
// ─────────────────────────────────────────────────────────────────────────────
//
// All date/month/hour/week keys are formatted in one configured fixed offset
// so every control-plane node agrees on bucket boundaries.

/// Bucket keys for one instant.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeBuckets {
    /// `YYYY-MM-DD`
    pub date: String,
    /// `YYYY-MM`
    pub month: String,
    /// `YYYY-MM-DD:HH`
    pub hour: String,
    /// Monday of the current week, `YYYY-MM-DD`. Indexes the weekly Opus
    /// cost bucket.
    pub week_monday: String,
    /// `floor(unix_seconds / 60)`, for the system per-minute hash.
    pub minute: i64,
}

/// The configured bucketing timezone. The offset is validated by the config
/// layer, so construction cannot fail.
pub fn bucket_offset(offset_hours: i32) -> FixedOffset {
    FixedOffset::east_opt(offset_hours * 3600).expect("offset validated by config")
}

pub fn time_buckets(now: DateTime<Utc>, offset_hours: i32) -> TimeBuckets {
    let local = now.with_timezone(&bucket_offset(offset_hours));
    let date = local.date_naive();
    let monday = date - ChronoDuration::days(i64::from(date.weekday().num_days_from_monday()));
    TimeBuckets {
        date: local.format("%Y-%m-%d").to_string(),
        month: local.format("%Y-%m").to_string(),
        hour: local.format("%Y-%m-%d:%H").to_string(),
        week_monday: monday.format("%Y-%m-%d").to_string(),
        minute: now.timestamp().div_euclid(60),
    }
}

/// Next local midnight, as a UTC instant. Daily cost gates reset here.
pub fn next_midnight(now: DateTime<Utc>, offset_hours: i32) -> DateTime<Utc> {
    let offset = bucket_offset(offset_hours);
    let local_date = now.with_timezone(&offset).date_naive() + ChronoDuration::days(1);
    local_midnight(local_date, offset)
}

/// Next Monday 00:00 local, as a UTC instant. The weekly Opus gate resets
/// here; a Monday maps to the following Monday.
pub fn next_monday_midnight(now: DateTime<Utc>, offset_hours: i32) -> DateTime<Utc> {
    let offset = bucket_offset(offset_hours);
    let local_date = now.with_timezone(&offset).date_naive();
    let days_ahead = 7 - i64::from(local_date.weekday().num_days_from_monday());
    local_midnight(local_date + ChronoDuration::days(days_ahead), offset)
}

fn local_midnight(date: chrono::NaiveDate, offset: FixedOffset) -> DateTime<Utc> {
    let naive = date.and_hms_opt(0, 0, 0).expect("midnight is valid");
    // Fixed offsets have no DST gaps, so the local time is unambiguous
    offset
        .from_local_datetime(&naive)
        .single()
        .expect("fixed offset has no ambiguity")
        .with_timezone(&Utc)
}
