//! Upstream account selection.
//!
//! One scheduler serves one provider category (claude, gemini, openai,
//! droid). Selection honors sticky sessions first, then collects active
//! candidates across the category's account types, filters them against the
//! request, and picks by priority (descending) then load (ascending).
//! Overload marks are written by the forwarder after observing upstream
//! 429/529 responses; the scheduler itself only reads them.

mod session;

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::Utc;
use thiserror::Error;

pub use session::SessionStore;

use crate::{
    config::SchedulerConfig,
    models::{Account, AccountType, ProviderCategory},
    observability::metrics,
    store::{Store, StoreError, StoreKeys, StoreResult},
};

/// Account access seam consumed by the scheduler, implemented by the store
/// facade. Keeps the scheduler decoupled from key formats.
#[async_trait]
pub trait AccountRepository: Send + Sync {
    /// Accounts of one type passing the active + not-overloaded +
    /// live-credentials fast path.
    async fn active_accounts(&self, account_type: AccountType) -> StoreResult<Vec<Account>>;

    async fn get_account(&self, account_type: AccountType, id: &str)
    -> StoreResult<Option<Account>>;

    async fn put_account(&self, account: &Account) -> StoreResult<()>;
}

/// Per-request selection input.
#[derive(Debug, Clone, Default)]
pub struct SelectOptions {
    /// The admitted API key, for logging and stickiness attribution.
    pub api_key_id: String,
    pub model: Option<String>,
    /// Session fingerprint for sticky routing.
    pub session_hash: Option<String>,
    /// Restrict to these types; each must belong to this scheduler's
    /// category.
    pub preferred_account_types: Vec<AccountType>,
    /// Accounts the caller already failed against this request.
    pub excluded_account_ids: Vec<String>,
    /// Capability tags the account must carry.
    pub required_features: Vec<String>,
}

/// A scheduling decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub account_type: AccountType,
    pub account_id: String,
    /// True when a live sticky session produced the account.
    pub from_session: bool,
}

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("no {category} account available (model: {model:?})")]
    NotAvailable {
        category: ProviderCategory,
        model: Option<String>,
    },

    #[error("account type {account_type} is not served by the {category} scheduler")]
    TypeNotServed {
        account_type: AccountType,
        category: ProviderCategory,
    },

    #[error("account store error: {0}")]
    Store(#[from] StoreError),
}

pub struct Scheduler {
    category: ProviderCategory,
    repo: Arc<dyn AccountRepository>,
    store: Arc<dyn Store>,
    sessions: SessionStore,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(
        category: ProviderCategory,
        repo: Arc<dyn AccountRepository>,
        store: Arc<dyn Store>,
        config: SchedulerConfig,
    ) -> Self {
        let sessions = SessionStore::new(
            Arc::clone(&store),
            Duration::from_secs(config.sticky_session_ttl_secs),
        );
        Self {
            category,
            repo,
            store,
            sessions,
            config,
        }
    }

    pub fn category(&self) -> ProviderCategory {
        self.category
    }

    /// Select an upstream account for one request.
    pub async fn select(&self, opts: &SelectOptions) -> Result<Selection, ScheduleError> {
        // Sticky session first. Any mismatch falls through to fresh
        // selection; the stale mapping is left for the rebind to overwrite.
        if let Some(session_hash) = opts.session_hash.as_deref()
            && let Some(selection) = self.try_sticky_session(session_hash, opts).await
        {
            metrics::record_selection(self.category.as_str(), true);
            return Ok(selection);
        }

        let types: Vec<AccountType> = if opts.preferred_account_types.is_empty() {
            self.category.account_types().to_vec()
        } else {
            for preferred in &opts.preferred_account_types {
                if preferred.category() != self.category {
                    return Err(ScheduleError::TypeNotServed {
                        account_type: *preferred,
                        category: self.category,
                    });
                }
            }
            opts.preferred_account_types.clone()
        };

        let now = Utc::now();
        let model = opts.model.as_deref().unwrap_or("");
        let mut candidates = Vec::new();
        for account_type in types {
            let accounts = self.repo.active_accounts(account_type).await?;
            for account in accounts {
                if !account.is_schedulable(now) {
                    continue;
                }
                if opts
                    .excluded_account_ids
                    .iter()
                    .any(|excluded| excluded == account.id())
                {
                    continue;
                }
                if !account.supports_model(model) {
                    continue;
                }
                if !account.has_features(&opts.required_features) {
                    continue;
                }
                candidates.push(account);
            }
        }

        if candidates.is_empty() {
            return Err(ScheduleError::NotAvailable {
                category: self.category,
                model: opts.model.clone(),
            });
        }

        // Priority descending, then live load ascending, id as a
        // deterministic tiebreak.
        let mut ranked = Vec::with_capacity(candidates.len());
        for account in candidates {
            let load = self.account_load(account.id()).await;
            let priority =
                self.config.type_priority(account.account_type()) + account.priority_bump();
            ranked.push((account, priority, load));
        }
        ranked.sort_by(|a, b| {
            b.1.cmp(&a.1)
                .then(a.2.cmp(&b.2))
                .then_with(|| a.0.id().cmp(b.0.id()))
        });

        let best = &ranked[0].0;
        let selection = Selection {
            account_type: best.account_type(),
            account_id: best.id().to_string(),
            from_session: false,
        };

        // Bind (or replace) the sticky session. Failures are logged, not
        // propagated: stickiness is an optimization, not a correctness
        // requirement.
        if let Some(session_hash) = opts.session_hash.as_deref()
            && let Err(error) = self
                .sessions
                .bind(session_hash, &selection.account_id, selection.account_type)
                .await
        {
            tracing::warn!(
                session_hash = %session_hash,
                account_id = %selection.account_id,
                error = %error,
                "failed to bind sticky session"
            );
        }

        metrics::record_selection(self.category.as_str(), false);
        Ok(selection)
    }

    /// Resolve a sticky session if the bound account can still serve the
    /// request.
    async fn try_sticky_session(
        &self,
        session_hash: &str,
        opts: &SelectOptions,
    ) -> Option<Selection> {
        let session = match self.sessions.get(session_hash).await {
            Ok(Some(session)) => session,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(session_hash = %session_hash, error = %error, "sticky session read failed");
                return None;
            }
        };

        if session.account_type.category() != self.category {
            return None;
        }
        let account = match self
            .repo
            .get_account(session.account_type, &session.account_id)
            .await
        {
            Ok(Some(account)) => account,
            Ok(None) => return None,
            Err(error) => {
                tracing::warn!(
                    session_hash = %session_hash,
                    account_id = %session.account_id,
                    error = %error,
                    "sticky account read failed"
                );
                return None;
            }
        };

        let now = Utc::now();
        if !account.is_schedulable(now) {
            return None;
        }
        if let Some(model) = opts.model.as_deref()
            && !account.supports_model(model)
        {
            return None;
        }

        if let Err(error) = self.sessions.renew(session_hash, session.clone()).await {
            tracing::warn!(session_hash = %session_hash, error = %error, "sticky session renewal failed");
        }

        Some(Selection {
            account_type: session.account_type,
            account_id: session.account_id,
            from_session: true,
        })
    }

    /// Live concurrency of one upstream account, read from its lease set.
    /// Read failures count as zero load rather than failing selection.
    async fn account_load(&self, account_id: &str) -> u64 {
        let now_ms = Utc::now().timestamp_millis();
        match self
            .store
            .lease_set_count(&StoreKeys::concurrency(account_id), now_ms)
            .await
        {
            Ok(load) => load,
            Err(error) => {
                tracing::warn!(account_id = %account_id, error = %error, "account load read failed");
                0
            }
        }
    }

    /// Take an account out of rotation for `duration`, after the forwarder
    /// observed an upstream overload signal (429/529 or equivalent).
    /// Returns false when the account does not exist.
    pub async fn mark_overloaded(
        &self,
        account_type: AccountType,
        account_id: &str,
        duration: Duration,
    ) -> Result<bool, ScheduleError> {
        let Some(mut account) = self.repo.get_account(account_type, account_id).await? else {
            return Ok(false);
        };
        let now = Utc::now();
        let base = account.base_mut();
        base.is_overloaded = true;
        base.overloaded_at = Some(now);
        base.overloaded_until =
            Some(now + chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::minutes(1)));
        self.repo.put_account(&account).await?;
        tracing::info!(
            account_id = %account_id,
            account_type = %account_type,
            until = ?account.base().overloaded_until,
            "account marked overloaded"
        );
        Ok(true)
    }

    /// Clear an overload mark.
    pub async fn clear_overloaded(
        &self,
        account_type: AccountType,
        account_id: &str,
    ) -> Result<bool, ScheduleError> {
        let Some(mut account) = self.repo.get_account(account_type, account_id).await? else {
            return Ok(false);
        };
        let base = account.base_mut();
        base.is_overloaded = false;
        base.overloaded_at = None;
        base.overloaded_until = None;
        self.repo.put_account(&account).await?;
        Ok(true)
    }

    /// Sticky-session surface, for callers that manage sessions directly.
    pub fn sessions(&self) -> &SessionStore {
        &self.sessions
    }
}
