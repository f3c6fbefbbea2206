use std::{fmt, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Upstream account type. The string forms are wire values: they appear in
/// sticky-session records and derive the per-type key prefixes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AccountType {
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "claude-console")]
    ClaudeConsole,
    #[serde(rename = "bedrock")]
    Bedrock,
    #[serde(rename = "ccr")]
    Ccr,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "gemini-api")]
    GeminiApi,
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "azure-openai")]
    AzureOpenAi,
    #[serde(rename = "droid")]
    Droid,
}

/// Provider category an account type belongs to. Schedulers are instantiated
/// per category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderCategory {
    Claude,
    Gemini,
    OpenAi,
    Droid,
}

impl AccountType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Claude => "claude",
            AccountType::ClaudeConsole => "claude-console",
            AccountType::Bedrock => "bedrock",
            AccountType::Ccr => "ccr",
            AccountType::Gemini => "gemini",
            AccountType::GeminiApi => "gemini-api",
            AccountType::OpenAi => "openai",
            AccountType::OpenAiResponses => "openai-responses",
            AccountType::AzureOpenAi => "azure-openai",
            AccountType::Droid => "droid",
        }
    }

    /// Store key prefix for JSON account records of this type.
    pub fn key_prefix(&self) -> &'static str {
        match self {
            AccountType::Claude => "claude:account:",
            AccountType::ClaudeConsole => "claude_console:account:",
            AccountType::Bedrock => "bedrock:account:",
            AccountType::Ccr => "ccr:account:",
            AccountType::Gemini => "gemini:account:",
            AccountType::GeminiApi => "gemini_api:account:",
            AccountType::OpenAi => "openai:account:",
            AccountType::OpenAiResponses => "openai_responses:account:",
            AccountType::AzureOpenAi => "azure_openai:account:",
            AccountType::Droid => "droid:account:",
        }
    }

    pub fn category(&self) -> ProviderCategory {
        match self {
            AccountType::Claude
            | AccountType::ClaudeConsole
            | AccountType::Bedrock
            | AccountType::Ccr => ProviderCategory::Claude,
            AccountType::Gemini | AccountType::GeminiApi => ProviderCategory::Gemini,
            AccountType::OpenAi | AccountType::OpenAiResponses | AccountType::AzureOpenAi => {
                ProviderCategory::OpenAi
            }
            AccountType::Droid => ProviderCategory::Droid,
        }
    }
}

impl fmt::Display for AccountType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for AccountType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AccountType::Claude),
            "claude-console" => Ok(AccountType::ClaudeConsole),
            "bedrock" => Ok(AccountType::Bedrock),
            "ccr" => Ok(AccountType::Ccr),
            "gemini" => Ok(AccountType::Gemini),
            "gemini-api" => Ok(AccountType::GeminiApi),
            "openai" => Ok(AccountType::OpenAi),
            "openai-responses" => Ok(AccountType::OpenAiResponses),
            "azure-openai" => Ok(AccountType::AzureOpenAi),
            "droid" => Ok(AccountType::Droid),
            _ => Err(format!("Invalid account type '{}'", s)),
        }
    }
}

impl ProviderCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderCategory::Claude => "claude",
            ProviderCategory::Gemini => "gemini",
            ProviderCategory::OpenAi => "openai",
            ProviderCategory::Droid => "droid",
        }
    }

    /// Account types served by this category's scheduler.
    pub fn account_types(&self) -> &'static [AccountType] {
        match self {
            ProviderCategory::Claude => &[
                AccountType::Claude,
                AccountType::ClaudeConsole,
                AccountType::Bedrock,
                AccountType::Ccr,
            ],
            ProviderCategory::Gemini => &[AccountType::Gemini, AccountType::GeminiApi],
            ProviderCategory::OpenAi => &[
                AccountType::OpenAi,
                AccountType::OpenAiResponses,
                AccountType::AzureOpenAi,
            ],
            ProviderCategory::Droid => &[AccountType::Droid],
        }
    }
}

impl fmt::Display for ProviderCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountStatus {
    #[default]
    Active,
    Inactive,
    Error,
    Disabled,
}

/// Claude subscription tier, relevant only to OAuth accounts. Gates which
/// Opus models the account may serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SubscriptionLevel {
    Free,
    Pro,
    Max,
}

/// Fields shared by every account type.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BaseAccount {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub status: AccountStatus,
    #[serde(default)]
    pub is_overloaded: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overloaded_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub overloaded_until: Option<DateTime<Utc>>,
    /// Pending upstream error. An account with one set is out of rotation
    /// until an operator (or the error-recovery job) clears it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_msg: Option<String>,
    #[serde(default)]
    pub error_count: i64,
    /// Account-level priority bump on top of the type priority.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i32>,
    /// Free-form capability tags matched (case-insensitively) against a
    /// request's required features.
    #[serde(default)]
    pub features: Vec<String>,
    pub created_at: DateTime<Utc>,
}

impl BaseAccount {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            status: AccountStatus::Active,
            is_overloaded: false,
            overloaded_at: None,
            overloaded_until: None,
            error_msg: None,
            error_count: 0,
            priority: None,
            features: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subscription_level: Option<SubscriptionLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaudeConsoleAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BedrockAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_access_key_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aws_secret_access_key: Option<String>,
    #[serde(default)]
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CcrAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GeminiAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refresh_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_expiry: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyedAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AzureOpenAiAccount {
    #[serde(flatten)]
    pub base: BaseAccount,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub api_version: String,
}

/// An upstream account. One variant per provider integration, sharing
/// `BaseAccount`; the scheduler only goes through the methods below.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "accountType")]
pub enum Account {
    #[serde(rename = "claude")]
    Claude(ClaudeAccount),
    #[serde(rename = "claude-console")]
    ClaudeConsole(ClaudeConsoleAccount),
    #[serde(rename = "bedrock")]
    Bedrock(BedrockAccount),
    #[serde(rename = "ccr")]
    Ccr(CcrAccount),
    #[serde(rename = "gemini")]
    Gemini(GeminiAccount),
    #[serde(rename = "gemini-api")]
    GeminiApi(ApiKeyedAccount),
    #[serde(rename = "openai")]
    OpenAi(ApiKeyedAccount),
    #[serde(rename = "openai-responses")]
    OpenAiResponses(ApiKeyedAccount),
    #[serde(rename = "azure-openai")]
    AzureOpenAi(AzureOpenAiAccount),
    #[serde(rename = "droid")]
    Droid(ApiKeyedAccount),
}

impl Account {
    pub fn account_type(&self) -> AccountType {
        match self {
            Account::Claude(_) => AccountType::Claude,
            Account::ClaudeConsole(_) => AccountType::ClaudeConsole,
            Account::Bedrock(_) => AccountType::Bedrock,
            Account::Ccr(_) => AccountType::Ccr,
            Account::Gemini(_) => AccountType::Gemini,
            Account::GeminiApi(_) => AccountType::GeminiApi,
            Account::OpenAi(_) => AccountType::OpenAi,
            Account::OpenAiResponses(_) => AccountType::OpenAiResponses,
            Account::AzureOpenAi(_) => AccountType::AzureOpenAi,
            Account::Droid(_) => AccountType::Droid,
        }
    }

    pub fn base(&self) -> &BaseAccount {
        match self {
            Account::Claude(a) => &a.base,
            Account::ClaudeConsole(a) => &a.base,
            Account::Bedrock(a) => &a.base,
            Account::Ccr(a) => &a.base,
            Account::Gemini(a) => &a.base,
            Account::GeminiApi(a) => &a.base,
            Account::OpenAi(a) => &a.base,
            Account::OpenAiResponses(a) => &a.base,
            Account::AzureOpenAi(a) => &a.base,
            Account::Droid(a) => &a.base,
        }
    }

    pub fn base_mut(&mut self) -> &mut BaseAccount {
        match self {
            Account::Claude(a) => &mut a.base,
            Account::ClaudeConsole(a) => &mut a.base,
            Account::Bedrock(a) => &mut a.base,
            Account::Ccr(a) => &mut a.base,
            Account::Gemini(a) => &mut a.base,
            Account::GeminiApi(a) => &mut a.base,
            Account::OpenAi(a) => &mut a.base,
            Account::OpenAiResponses(a) => &mut a.base,
            Account::AzureOpenAi(a) => &mut a.base,
            Account::Droid(a) => &mut a.base,
        }
    }

    pub fn id(&self) -> &str {
        &self.base().id
    }

    pub fn status(&self) -> AccountStatus {
        self.base().status
    }

    /// Account-level priority bump. Added to the type priority at selection.
    pub fn priority_bump(&self) -> i32 {
        self.base().priority.unwrap_or(0)
    }

    /// Whether the account is currently masked by an overload mark.
    /// The mark wears off once `overloaded_until` passes; a mark with no
    /// deadline holds until explicitly cleared.
    pub fn is_overloaded_at(&self, now: DateTime<Utc>) -> bool {
        let base = self.base();
        if !base.is_overloaded {
            return false;
        }
        match base.overloaded_until {
            Some(until) => until > now,
            None => true,
        }
    }

    /// Whether the stored credentials can plausibly serve a request right
    /// now. For OAuth accounts an expired token (with no refresh token)
    /// takes the account out of rotation.
    pub fn has_live_credentials(&self, now: DateTime<Utc>) -> bool {
        match self {
            Account::Claude(a) => oauth_credentials_live(
                a.refresh_token.as_deref(),
                a.access_token.as_deref(),
                a.token_expiry,
                now,
            ),
            Account::Gemini(a) => oauth_credentials_live(
                a.refresh_token.as_deref(),
                a.access_token.as_deref(),
                a.token_expiry,
                now,
            ),
            Account::ClaudeConsole(a) => a.session_key.is_some(),
            Account::Bedrock(a) => {
                a.aws_access_key_id.is_some() && a.aws_secret_access_key.is_some()
            }
            Account::Ccr(a) => !a.base_url.is_empty(),
            Account::GeminiApi(a) | Account::OpenAi(a) | Account::OpenAiResponses(a)
            | Account::Droid(a) => a.api_key.is_some(),
            Account::AzureOpenAi(a) => a.api_key.is_some() && !a.endpoint.is_empty(),
        }
    }

    /// The scheduler's candidate predicate, minus the per-request parts
    /// (exclusions, features, model).
    pub fn is_schedulable(&self, now: DateTime<Utc>) -> bool {
        let base = self.base();
        base.status == AccountStatus::Active
            && base.error_msg.is_none()
            && !self.is_overloaded_at(now)
            && self.has_live_credentials(now)
    }

    /// Whether every required feature appears in the account's feature list,
    /// case-insensitively.
    pub fn has_features(&self, required: &[String]) -> bool {
        required.iter().all(|needed| {
            self.base()
                .features
                .iter()
                .any(|have| have.eq_ignore_ascii_case(needed))
        })
    }

    /// Whether this account can serve the named model. An empty model name
    /// is unconstrained.
    pub fn supports_model(&self, model: &str) -> bool {
        if model.is_empty() {
            return true;
        }
        let m = model.to_ascii_lowercase();
        match self.account_type() {
            AccountType::Claude | AccountType::ClaudeConsole => {
                let claude_family = ["claude", "sonnet", "opus", "haiku"]
                    .iter()
                    .any(|kw| m.contains(kw));
                if !claude_family {
                    return false;
                }
                if m.contains("opus") {
                    return self.opus_permitted(&m);
                }
                true
            }
            AccountType::Bedrock => m.contains("claude") || m.contains("anthropic"),
            AccountType::Gemini | AccountType::GeminiApi => {
                m.contains("gemini") || m.contains("palm")
            }
            AccountType::OpenAi | AccountType::OpenAiResponses | AccountType::AzureOpenAi => {
                ["gpt", "o1", "o3", "text-", "davinci", "curie"]
                    .iter()
                    .any(|kw| m.contains(kw))
            }
            AccountType::Droid | AccountType::Ccr => true,
        }
    }

    /// Subscription gate for Opus models (`model_lower` must already be
    /// lowercased).
    ///
    /// `pro` only rejects `opus-4-*` variants outside the allow-set; Opus-3
    /// names pass. That mirrors the deployed relay fleet; tighten here once
    /// the intended policy for old Opus generations is settled.
    fn opus_permitted(&self, model_lower: &str) -> bool {
        let level = match self {
            Account::Claude(a) => a.subscription_level,
            _ => None,
        };
        match level {
            Some(SubscriptionLevel::Free) => false,
            Some(SubscriptionLevel::Pro) => {
                if model_lower.contains("opus-4-5") || model_lower.contains("opus-4-20250514") {
                    true
                } else {
                    !model_lower.contains("opus-4")
                }
            }
            Some(SubscriptionLevel::Max) | None => true,
        }
    }
}

fn oauth_credentials_live(
    refresh_token: Option<&str>,
    access_token: Option<&str>,
    token_expiry: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    if refresh_token.is_none() && access_token.is_none() {
        return false;
    }
    match token_expiry {
        // Expired access token: usable only if a refresh token is on file
        Some(expiry) if expiry <= now => refresh_token.is_some(),
        _ => true,
    }
}
