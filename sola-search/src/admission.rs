//! Admission control
//!
//! A request is admitted when the account still has monthly quota, its
//! in-flight count stays within its concurrency limit, and the global backlog
//! of tiers at or above its priority is below the queue cap.
//!
//! Increment-then-compare on the cache counters is not atomic as a whole, so
//! a burst can over-admit by the few requests racing in the same window. The
//! counters carry a TTL so a crashed request cannot hold a slot forever.
//!
//! Once counters are incremented, every exit path goes through [`AdmissionController::release`]
//! exactly once: [`SearchPermit::finish`] on normal completion, or a detached
//! release from `Drop` when the request future is abandoned.

use crate::accounts::{Account, AccountStore};
use crate::counters::Counters;
use crate::error::SearchError;
use sola_common::time;
use tracing::{debug, error, warn};

/// Status logged when a permit is dropped without an explicit outcome
pub const ABANDONED_STATUS: u16 = 500;

/// Caller identity as presented on the request
#[derive(Debug, Clone, Default)]
pub struct AdmissionRequest {
    pub api_key: Option<String>,
    pub uid: Option<String>,
    pub client_addr: String,
}

/// Which counters a request currently holds
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct Held {
    concurrency: bool,
    priority: bool,
}

impl Held {
    const BOTH: Held = Held {
        concurrency: true,
        priority: true,
    };
}

#[derive(Clone)]
pub struct AdmissionController {
    accounts: AccountStore,
    counters: Counters,
    queue_cap: i64,
}

impl AdmissionController {
    pub fn new(accounts: AccountStore, counters: Counters, queue_cap: i64) -> Self {
        Self {
            accounts,
            counters,
            queue_cap,
        }
    }

    /// Decide whether the request may proceed
    pub async fn admit(&self, request: &AdmissionRequest) -> Result<SearchPermit, SearchError> {
        let account = self
            .accounts
            .resolve(
                request.api_key.as_deref(),
                request.uid.as_deref(),
                &request.client_addr,
            )
            .await?
            .ok_or(SearchError::InvalidKey)?;

        let monthly_count = self.monthly_count(&account.uid).await?;
        if monthly_count >= account.quota {
            let err = SearchError::QuotaExceeded;
            self.accounts
                .append_log(&account.uid, err.status_code().as_u16(), None)
                .await?;
            debug!(uid = %account.uid, monthly_count, quota = account.quota, "Quota depleted");
            return Err(err);
        }

        let mut held = Held::default();
        match self.acquire(&account, &mut held).await {
            Ok(()) => Ok(SearchPermit {
                account,
                monthly_count,
                controller: Some(self.clone()),
            }),
            Err(err) => {
                self.release_held(&account, held, err.status_code().as_u16(), None)
                    .await;
                Err(err)
            }
        }
    }

    /// Monthly successful searches, seeding the cache from the log on a miss
    pub async fn monthly_count(&self, uid: &str) -> Result<i64, SearchError> {
        let key = Counters::monthly_key(uid);
        if let Some(count) = self.counters.get(&key).await?.filter(|c| *c > 0) {
            return Ok(count);
        }

        let now = time::now();
        let count = self.accounts.count_monthly_successes(uid, now).await?;
        self.counters
            .set_monthly(uid, count, time::seconds_until_month_end(now))
            .await?;
        Ok(count)
    }

    async fn acquire(&self, account: &Account, held: &mut Held) -> Result<(), SearchError> {
        let in_flight = self
            .counters
            .increment(&Counters::concurrency_key(&account.uid))
            .await?;
        held.concurrency = true;
        if in_flight > account.concurrency {
            debug!(uid = %account.uid, in_flight, limit = account.concurrency, "Concurrency limit exceeded");
            return Err(SearchError::ConcurrencyExceeded);
        }

        self.counters
            .increment(&Counters::priority_key(account.priority))
            .await?;
        held.priority = true;
        let backlog = self.counters.priority_backlog(account.priority).await?;
        if backlog >= self.queue_cap {
            debug!(priority = account.priority, backlog, cap = self.queue_cap, "Search queue full");
            return Err(SearchError::QueueFull);
        }

        Ok(())
    }

    /// Release both counters of an admitted request and log its outcome
    pub async fn release(
        &self,
        account: &Account,
        status: u16,
        search_time_ms: Option<u64>,
    ) {
        self.release_held(account, Held::BOTH, status, search_time_ms)
            .await;
    }

    async fn release_held(
        &self,
        account: &Account,
        held: Held,
        status: u16,
        search_time_ms: Option<u64>,
    ) {
        if let Err(e) = self
            .accounts
            .append_log(&account.uid, status, search_time_ms)
            .await
        {
            error!(uid = %account.uid, status, "Failed to write search log: {}", e);
        }

        if held.concurrency {
            let key = Counters::concurrency_key(&account.uid);
            if let Err(e) = self.counters.decrement_floor0(&key).await {
                warn!(key = %key, "Failed to release counter (TTL will reclaim it): {}", e);
            }
        }

        if held.priority {
            let key = Counters::priority_key(account.priority);
            if let Err(e) = self.counters.decrement_floor0(&key).await {
                warn!(key = %key, "Failed to release counter (TTL will reclaim it): {}", e);
            }
        }
    }

    /// Optimistically bump the cached monthly count after a success
    async fn record_success(&self, uid: &str, previous_count: i64) {
        let now = time::now();
        if let Err(e) = self
            .counters
            .set_monthly(uid, previous_count + 1, time::seconds_until_month_end(now))
            .await
        {
            warn!(uid, "Failed to update monthly count: {}", e);
        }
    }
}

/// Proof of admission; releases the held counters exactly once
pub struct SearchPermit {
    account: Account,
    monthly_count: i64,
    controller: Option<AdmissionController>,
}

impl std::fmt::Debug for SearchPermit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchPermit")
            .field("account", &self.account)
            .field("monthly_count", &self.monthly_count)
            .finish_non_exhaustive()
    }
}

impl SearchPermit {
    pub fn account(&self) -> &Account {
        &self.account
    }

    /// Monthly count observed at admission time
    pub fn monthly_count(&self) -> i64 {
        self.monthly_count
    }

    /// Release counters, log the final status and, on success, the latency
    pub async fn finish(mut self, status: u16, search_time_ms: Option<u64>) {
        if let Some(controller) = self.controller.take() {
            controller
                .release(&self.account, status, search_time_ms)
                .await;
            if status == 200 {
                controller
                    .record_success(&self.account.uid, self.monthly_count)
                    .await;
            }
        }
    }
}

impl Drop for SearchPermit {
    fn drop(&mut self) {
        let Some(controller) = self.controller.take() else {
            return;
        };
        let account = self.account.clone();
        warn!(uid = %account.uid, "Search abandoned before completion, releasing counters");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    controller.release(&account, ABANDONED_STATUS, None).await;
                });
            }
            Err(_) => {
                error!(uid = %account.uid, "No runtime to release counters; TTL will reclaim them");
            }
        }
    }
}
