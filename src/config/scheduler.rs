use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use super::ConfigError;
use crate::models::AccountType;

/// Scheduler configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Sticky session lifetime in seconds. Sessions are renewed for this
    /// long every time the scheduler reuses the binding.
    #[serde(default = "default_sticky_session_ttl")]
    pub sticky_session_ttl_secs: u64,

    /// Base priority per account type. Selection sorts by
    /// `type_priority + account.priority` descending, then load ascending.
    /// Types missing from the map score 0.
    #[serde(default = "default_type_priorities")]
    pub type_priorities: HashMap<AccountType, i32>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            sticky_session_ttl_secs: default_sticky_session_ttl(),
            type_priorities: default_type_priorities(),
        }
    }
}

impl SchedulerConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.sticky_session_ttl_secs == 0 {
            return Err(ConfigError::Validation(
                "sticky_session_ttl_secs must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn type_priority(&self, account_type: AccountType) -> i32 {
        self.type_priorities
            .get(&account_type)
            .copied()
            .unwrap_or(0)
    }
}

fn default_sticky_session_ttl() -> u64 {
    3600
}

/// OAuth accounts rank above console/API-key accounts, which rank above the
/// Bedrock and CCR fallbacks.
fn default_type_priorities() -> HashMap<AccountType, i32> {
    HashMap::from([
        (AccountType::Claude, 100),
        (AccountType::ClaudeConsole, 80),
        (AccountType::Bedrock, 60),
        (AccountType::Ccr, 40),
        (AccountType::Gemini, 100),
        (AccountType::GeminiApi, 80),
        (AccountType::OpenAi, 100),
        (AccountType::OpenAiResponses, 90),
        (AccountType::AzureOpenAi, 80),
        (AccountType::Droid, 100),
    ])
}
