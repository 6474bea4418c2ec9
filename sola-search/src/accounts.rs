//! Account lookup and search log
//!
//! Accounts come from `user_view` by API key; callers without a key share the
//! anonymous tier (row id 0) but are counted per client address.

use chrono::{DateTime, Utc};
use sola_common::db::{Tier, UserRecord};
use sola_common::{time, Error, Result};
use sqlx::SqlitePool;

/// Accounts below this id are system accounts: they keep the anonymous tier
/// limits and may search on behalf of an explicit uid.
pub const SYSTEM_ACCOUNT_LIMIT: i64 = 1000;

/// Identity and limits a request is admitted under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub uid: String,
    pub quota: i64,
    pub concurrency: i64,
    pub priority: i64,
}

impl Account {
    fn with_tier(uid: String, tier: Tier) -> Self {
        Self {
            uid,
            quota: tier.quota,
            concurrency: tier.concurrency,
            priority: tier.priority,
        }
    }
}

/// Relational side of admission: tiers, users and the search log
#[derive(Clone)]
pub struct AccountStore {
    pool: SqlitePool,
}

impl AccountStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Tier applied to anonymous callers and system accounts
    pub async fn default_tier(&self) -> Result<Tier> {
        sqlx::query_as::<_, Tier>("SELECT concurrency, quota, priority FROM tier WHERE id = 0")
            .fetch_optional(&self.pool)
            .await?
            .ok_or_else(|| Error::Config("tier table has no default row (id 0)".to_string()))
    }

    pub async fn find_by_api_key(&self, api_key: &str) -> Result<Option<UserRecord>> {
        let user = sqlx::query_as::<_, UserRecord>(
            "SELECT id, quota, concurrency, priority FROM user_view WHERE api_key = ?",
        )
        .bind(api_key)
        .fetch_optional(&self.pool)
        .await?;
        Ok(user)
    }

    /// Resolve the account a request runs under
    ///
    /// Returns `Ok(None)` when a key was supplied but matches no user.
    pub async fn resolve(
        &self,
        api_key: Option<&str>,
        uid_param: Option<&str>,
        client_addr: &str,
    ) -> Result<Option<Account>> {
        let tier = self.default_tier().await?;

        let Some(api_key) = api_key.filter(|k| !k.is_empty()) else {
            return Ok(Some(Account::with_tier(client_addr.to_string(), tier)));
        };

        let Some(user) = self.find_by_api_key(api_key).await? else {
            return Ok(None);
        };

        if user.id >= SYSTEM_ACCOUNT_LIMIT {
            return Ok(Some(Account {
                uid: user.id.to_string(),
                quota: user.quota,
                concurrency: user.concurrency,
                priority: user.priority,
            }));
        }

        let uid = uid_param
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| user.id.to_string());
        Ok(Some(Account::with_tier(uid, tier)))
    }

    /// Successful searches of `uid` since the start of the month containing `now`
    pub async fn count_monthly_successes(&self, uid: &str, now: DateTime<Utc>) -> Result<i64> {
        let since = time::to_log_time(time::month_start(now));
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(time) FROM log WHERE time >= ? AND status = 200 AND uid = ?",
        )
        .bind(since)
        .bind(uid)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// Append one log row for a finished request
    pub async fn append_log(&self, uid: &str, status: u16, search_time_ms: Option<u64>) -> Result<()> {
        sqlx::query("INSERT INTO log (time, uid, status, search_time) VALUES (?, ?, ?, ?)")
            .bind(time::to_log_time(time::now()))
            .bind(uid)
            .bind(i64::from(status))
            .bind(search_time_ms.map(|ms| ms as i64))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sola_common::db::{init_memory_pool, init_search_tables};

    async fn store() -> AccountStore {
        let pool = init_memory_pool().await.unwrap();
        init_search_tables(&pool).await.unwrap();
        sqlx::query("INSERT INTO tier (id, concurrency, quota, priority) VALUES (1, 3, 50, 2)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO users (id, api_key, tier) VALUES (1500, 'paid', 1), (7, 'bot', 1)")
            .execute(&pool)
            .await
            .unwrap();
        AccountStore::new(pool)
    }

    #[tokio::test]
    async fn test_anonymous_caller_keyed_by_address() {
        let store = store().await;
        let account = store.resolve(None, None, "203.0.113.9").await.unwrap().unwrap();
        assert_eq!(account.uid, "203.0.113.9");
        assert_eq!(account.quota, 1000);
        assert_eq!(account.concurrency, 1);

        // Empty key behaves like no key
        let account = store.resolve(Some(""), None, "203.0.113.9").await.unwrap().unwrap();
        assert_eq!(account.uid, "203.0.113.9");
    }

    #[tokio::test]
    async fn test_unknown_key_resolves_to_none() {
        let store = store().await;
        assert!(store.resolve(Some("nope"), None, "addr").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_regular_account_uses_own_tier() {
        let store = store().await;
        let account = store.resolve(Some("paid"), Some("999"), "addr").await.unwrap().unwrap();
        assert_eq!(
            account,
            Account {
                uid: "1500".to_string(),
                quota: 50,
                concurrency: 3,
                priority: 2,
            }
        );
    }

    #[tokio::test]
    async fn test_system_account_acts_for_uid_with_default_tier() {
        let store = store().await;
        let on_behalf = store.resolve(Some("bot"), Some("42"), "addr").await.unwrap().unwrap();
        assert_eq!(on_behalf.uid, "42");
        assert_eq!(on_behalf.quota, 1000);

        let own = store.resolve(Some("bot"), None, "addr").await.unwrap().unwrap();
        assert_eq!(own.uid, "7");
    }

    #[tokio::test]
    async fn test_monthly_count_only_counts_current_month_successes() {
        let store = store().await;
        let now = time::now();
        let last_month = time::to_log_time(time::month_start(now) - chrono::Duration::seconds(1));

        store.append_log("u", 200, Some(120)).await.unwrap();
        store.append_log("u", 200, Some(80)).await.unwrap();
        store.append_log("u", 402, None).await.unwrap();
        store.append_log("other", 200, Some(10)).await.unwrap();
        sqlx::query("INSERT INTO log (time, uid, status) VALUES (?, 'u', 200)")
            .bind(last_month)
            .execute(store.pool())
            .await
            .unwrap();

        assert_eq!(store.count_monthly_successes("u", now).await.unwrap(), 2);
    }
}
