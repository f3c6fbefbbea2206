//! Typed read/write facade over the KV store.
//!
//! Accounts are JSON-serialized full records under per-type prefixes
//! (`claude:account:{id}`, `openai:account:{id}`, ...), written with SET and
//! no TTL. API keys are field-hashes under `apikey:{id}` with a secondary
//! index from SHA-256 hex to id; reads fall through to the legacy `api_key:`
//! prefix left behind by earlier deployments.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    models::{Account, AccountType, ApiKey},
    scheduler::AccountRepository,
    store::{Store, StoreExt, StoreKeys, StoreResult, ttl},
};

/// API key records and their hash index.
#[derive(Clone)]
pub struct ApiKeyStore {
    store: Arc<dyn Store>,
}

impl ApiKeyStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    /// Look a key up by the SHA-256 hex of its raw form.
    pub async fn find_by_hash(&self, hashed_key: &str) -> StoreResult<Option<ApiKey>> {
        let id = self
            .store
            .hash_get(StoreKeys::API_KEY_HASH_INDEX, hashed_key)
            .await?;
        match id {
            Some(id) => self.get(&id).await,
            None => Ok(None),
        }
    }

    /// Fetch by id, reading through to the legacy prefix for records written
    /// by older deployments.
    pub async fn get(&self, id: &str) -> StoreResult<Option<ApiKey>> {
        let fields = self.store.hash_get_all(&StoreKeys::api_key(id)).await?;
        if let Some(key) = ApiKey::from_fields(&fields) {
            return Ok(Some(key));
        }
        let legacy = self
            .store
            .hash_get_all(&StoreKeys::api_key_legacy(id))
            .await?;
        Ok(ApiKey::from_fields(&legacy))
    }

    /// Write the record and keep the hash index in step. When the hash
    /// changed, the old index entry is removed and the new one inserted in
    /// one transaction so no reader observes both or neither.
    pub async fn save(&self, key: &ApiKey) -> StoreResult<()> {
        let record_key = StoreKeys::api_key(&key.id);
        let current_hash = self.store.hash_get(&record_key, "hashedKey").await?;

        match current_hash {
            Some(old_hash) if old_hash != key.hashed_key => {
                self.store
                    .hash_swap_field(
                        StoreKeys::API_KEY_HASH_INDEX,
                        &old_hash,
                        &key.hashed_key,
                        &key.id,
                    )
                    .await?;
            }
            _ => {
                self.store
                    .hash_set(StoreKeys::API_KEY_HASH_INDEX, &key.hashed_key, &key.id)
                    .await?;
            }
        }

        self.store
            .hash_set_all(&record_key, &key.to_fields(), ttl::API_KEY)
            .await
    }

    /// Activation-on-first-use transition. Returns false when another writer
    /// already activated the key.
    pub async fn activate(
        &self,
        id: &str,
        activated_at: DateTime<Utc>,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let fields = vec![
            ("isActivated".to_string(), "true".to_string()),
            ("activatedAt".to_string(), activated_at.to_rfc3339()),
            ("expiresAt".to_string(), expires_at.to_rfc3339()),
        ];
        self.store
            .hash_set_if_falsy(&StoreKeys::api_key(id), "isActivated", &fields)
            .await
    }

    /// Remove the record and its index entry.
    pub async fn delete(&self, id: &str) -> StoreResult<()> {
        let record_key = StoreKeys::api_key(id);
        if let Some(hash) = self.store.hash_get(&record_key, "hashedKey").await? {
            self.store
                .hash_del(StoreKeys::API_KEY_HASH_INDEX, &hash)
                .await?;
        }
        self.store.delete(&record_key).await
    }
}

/// Upstream account records.
#[derive(Clone)]
pub struct AccountStore {
    store: Arc<dyn Store>,
}

impl AccountStore {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, account_type: AccountType, id: &str) -> StoreResult<Option<Account>> {
        self.store
            .get_json(&StoreKeys::account(account_type, id))
            .await
    }

    /// Full-record write, no TTL: accounts live until deleted.
    pub async fn put(&self, account: &Account) -> StoreResult<()> {
        let key = StoreKeys::account(account.account_type(), account.id());
        self.store.set_json(&key, account, Duration::ZERO).await
    }

    pub async fn delete(&self, account_type: AccountType, id: &str) -> StoreResult<()> {
        self.store
            .delete(&StoreKeys::account(account_type, id))
            .await
    }

    /// Every stored account of one type. Records that no longer parse are
    /// skipped with a warning rather than failing the scan.
    pub async fn list(&self, account_type: AccountType) -> StoreResult<Vec<Account>> {
        let keys = self.store.scan_prefix(account_type.key_prefix()).await?;
        let mut accounts = Vec::with_capacity(keys.len());
        for key in keys {
            match self.store.get_json::<Account>(&key).await {
                Ok(Some(account)) => accounts.push(account),
                Ok(None) => {}
                Err(error) => {
                    tracing::warn!(key = %key, error = %error, "skipping unreadable account record");
                }
            }
        }
        Ok(accounts)
    }

    /// Accounts of one type that pass the scheduler's active + not-overloaded
    /// + live-credentials fast path.
    pub async fn get_active(&self, account_type: AccountType) -> StoreResult<Vec<Account>> {
        let now = Utc::now();
        let mut accounts = self.list(account_type).await?;
        accounts.retain(|account| account.is_schedulable(now));
        Ok(accounts)
    }
}

#[async_trait]
impl AccountRepository for AccountStore {
    async fn active_accounts(&self, account_type: AccountType) -> StoreResult<Vec<Account>> {
        self.get_active(account_type).await
    }

    async fn get_account(&self, account_type: AccountType, id: &str) -> StoreResult<Option<Account>> {
        self.get(account_type, id).await
    }

    async fn put_account(&self, account: &Account) -> StoreResult<()> {
        self.put(account).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        models::{
            AccountStatus, ApiKeyedAccount, BaseAccount, hash_raw_key,
        },
        store::MemoryStore,
    };

    fn api_keys() -> ApiKeyStore {
        ApiKeyStore::new(Arc::new(MemoryStore::new()))
    }

    fn openai_account(id: &str) -> Account {
        Account::OpenAi(ApiKeyedAccount {
            base: BaseAccount::new(id, "test"),
            api_key: Some("sk-test".into()),
        })
    }

    #[tokio::test]
    async fn test_save_and_find_by_hash() {
        let repo = api_keys();
        let key = ApiKey {
            id: "k1".into(),
            hashed_key: hash_raw_key("cr_live_abc"),
            concurrent_limit: 3,
            ..Default::default()
        };
        repo.save(&key).await.unwrap();

        let found = repo
            .find_by_hash(&hash_raw_key("cr_live_abc"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "k1");
        assert_eq!(found.concurrent_limit, 3);

        assert!(
            repo.find_by_hash(&hash_raw_key("cr_live_other"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_hash_change_moves_index_entry() {
        let repo = api_keys();
        let mut key = ApiKey {
            id: "k1".into(),
            hashed_key: hash_raw_key("cr_old"),
            ..Default::default()
        };
        repo.save(&key).await.unwrap();

        key.hashed_key = hash_raw_key("cr_new");
        repo.save(&key).await.unwrap();

        assert!(
            repo.find_by_hash(&hash_raw_key("cr_old"))
                .await
                .unwrap()
                .is_none()
        );
        assert_eq!(
            repo.find_by_hash(&hash_raw_key("cr_new"))
                .await
                .unwrap()
                .unwrap()
                .id,
            "k1"
        );
    }

    #[tokio::test]
    async fn test_legacy_prefix_read_through() {
        let store = Arc::new(MemoryStore::new());
        let repo = ApiKeyStore::new(Arc::clone(&store) as Arc<dyn Store>);

        // A record written by an old deployment under `api_key:` only
        let legacy = ApiKey {
            id: "old1".into(),
            hashed_key: hash_raw_key("cr_legacy"),
            ..Default::default()
        };
        store
            .hash_set_all(
                &StoreKeys::api_key_legacy("old1"),
                &legacy.to_fields(),
                Duration::ZERO,
            )
            .await
            .unwrap();
        store
            .hash_set(
                StoreKeys::API_KEY_HASH_INDEX,
                &legacy.hashed_key,
                "old1",
            )
            .await
            .unwrap();

        let found = repo
            .find_by_hash(&hash_raw_key("cr_legacy"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(found.id, "old1");
    }

    #[tokio::test]
    async fn test_activate_is_single_writer() {
        let repo = api_keys();
        let key = ApiKey {
            id: "k1".into(),
            hashed_key: "h".into(),
            ..Default::default()
        };
        repo.save(&key).await.unwrap();

        let now = Utc::now();
        let expires = now + chrono::Duration::days(7);
        assert!(repo.activate("k1", now, expires).await.unwrap());
        // Second writer loses
        assert!(!repo.activate("k1", now, expires).await.unwrap());

        let stored = repo.get("k1").await.unwrap().unwrap();
        assert!(stored.is_activated);
        assert!(stored.expires_at.is_some());
    }

    #[tokio::test]
    async fn test_delete_removes_index_entry() {
        let repo = api_keys();
        let key = ApiKey {
            id: "k1".into(),
            hashed_key: hash_raw_key("cr_gone"),
            ..Default::default()
        };
        repo.save(&key).await.unwrap();
        repo.delete("k1").await.unwrap();

        assert!(repo.get("k1").await.unwrap().is_none());
        assert!(
            repo.find_by_hash(&hash_raw_key("cr_gone"))
                .await
                .unwrap()
                .is_none()
        );
    }

    #[tokio::test]
    async fn test_account_round_trip_and_active_filter() {
        let accounts = AccountStore::new(Arc::new(MemoryStore::new()));

        accounts.put(&openai_account("a1")).await.unwrap();

        let mut disabled = openai_account("a2");
        disabled.base_mut().status = AccountStatus::Disabled;
        accounts.put(&disabled).await.unwrap();

        let all = accounts.list(AccountType::OpenAi).await.unwrap();
        assert_eq!(all.len(), 2);

        let active = accounts.get_active(AccountType::OpenAi).await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id(), "a1");

        // Types are namespaced: nothing leaks across prefixes
        assert!(accounts.list(AccountType::Claude).await.unwrap().is_empty());
    }
}
