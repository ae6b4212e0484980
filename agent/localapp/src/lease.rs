//! Named, time-bounded mutual exclusion across processes sharing a
//! [`StateStore`].
//!
//! The store has no compare-and-swap, so acquisition is write-then-verify: a
//! contender writes its claim, waits one poll interval for competing writes
//! to land, and re-reads. Whoever's token is still stored holds the lease.
//! Holders renew their claim every poll interval; every process sweeps claims
//! whose deadline passed or whose owning process died.

use std::future::Future;
use std::ops::ControlFlow;
use std::sync::{Arc, OnceLock};

use localapp_config::LeaseConfig;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};
use uuid::Uuid;

use crate::clock::{Clock, SystemClock};
use crate::error::{LocalAppError, Result};
use crate::records::{lock_key, LockRecord, LOCK_PREFIX};
use crate::schedule::{sleep_or_cancel, PeriodicTask};
use crate::store::{self, StateStore, StoreResult};

/// Who a lease belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LeaseOwner {
    /// This process; the claim dies with it.
    #[default]
    Process,
    /// A logical session that may span processes; only the deadline bounds
    /// the claim.
    Session,
}

pub struct LeaseLock {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    sweeper: OnceLock<PeriodicTask>,
}

impl LeaseLock {
    pub fn new(store: Arc<dyn StateStore>, config: LeaseConfig) -> Self {
        Self::with_clock(store, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        store: Arc<dyn StateStore>,
        config: LeaseConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            store,
            clock,
            config,
            sweeper: OnceLock::new(),
        }
    }

    /// Acquire `name` for this process, waiting as long as another live
    /// holder exists. Fails with `LockCancelled` once `cancel` fires.
    pub async fn acquire(&self, name: &str, cancel: &CancellationToken) -> Result<LeaseGuard> {
        self.acquire_as(name, LeaseOwner::Process, cancel).await
    }

    pub async fn acquire_as(
        &self,
        name: &str,
        owner: LeaseOwner,
        cancel: &CancellationToken,
    ) -> Result<LeaseGuard> {
        self.ensure_sweeper();

        let key = lock_key(name);
        let poll = self.config.poll_interval();
        let cancelled = || LocalAppError::LockCancelled {
            lock: name.to_string(),
        };

        loop {
            if cancel.is_cancelled() {
                return Err(cancelled());
            }

            let current = store::load::<LockRecord>(self.store.as_ref(), &key).await?;
            if current.is_some_and(|record| record.is_live(self.clock.now_ms())) {
                trace!(lock = name, "lease held elsewhere; waiting");
                if !sleep_or_cancel(poll, cancel).await {
                    return Err(cancelled());
                }
                continue;
            }

            let claim = LockRecord {
                owner_token: Uuid::new_v4().to_string(),
                deadline: self.next_deadline(),
                owner_pid: match owner {
                    LeaseOwner::Process => Some(std::process::id()),
                    LeaseOwner::Session => None,
                },
            };
            store::save(self.store.as_ref(), &key, &claim).await?;

            if !sleep_or_cancel(poll, cancel).await {
                self.remove_if_ours(&key, &claim.owner_token).await;
                return Err(cancelled());
            }

            let stored = match store::load::<LockRecord>(self.store.as_ref(), &key).await {
                Ok(stored) => stored,
                Err(err) => {
                    self.remove_if_ours(&key, &claim.owner_token).await;
                    return Err(err.into());
                }
            };
            if stored.is_some_and(|record| record.owner_token == claim.owner_token) {
                debug!(lock = name, token = %claim.owner_token, "lease acquired");
                return Ok(self.start_guard(name, key, claim, cancel));
            }
            debug!(lock = name, "lost lease race; retrying");
        }
    }

    /// Run `operation` while holding `name`, releasing the lease on every
    /// exit path.
    ///
    /// `operation` receives a token that fires when the caller cancels or the
    /// lease is lost; it is expected to stop promptly when it does.
    pub async fn with_lock<T, F, Fut>(
        &self,
        name: &str,
        cancel: &CancellationToken,
        operation: F,
    ) -> Result<T>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let guard = self.acquire(name, cancel).await?;
        let token = guard.cancellation().clone();

        let outcome = match operation(token.clone()).await {
            Err(LocalAppError::Cancelled) if token.is_cancelled() => {
                Err(LocalAppError::LockCancelled {
                    lock: name.to_string(),
                })
            }
            other => other,
        };

        if let Err(err) = guard.release().await {
            warn!(lock = name, error = %err, "failed to release lease");
        }
        outcome
    }

    /// Delete every stale lease record. Returns how many were removed.
    pub async fn sweep_once(&self) -> Result<usize> {
        Ok(sweep(self.store.as_ref(), self.clock.as_ref()).await?)
    }

    /// Start the background sweep if it is not running yet.
    pub fn ensure_sweeper(&self) {
        self.sweeper.get_or_init(|| {
            let store = Arc::clone(&self.store);
            let clock = Arc::clone(&self.clock);
            debug!(
                interval_ms = self.config.stale_check_interval_ms,
                "starting stale lease sweeper"
            );
            PeriodicTask::spawn("lease-sweep", self.config.stale_check_interval(), move || {
                let store = Arc::clone(&store);
                let clock = Arc::clone(&clock);
                async move {
                    if let Err(err) = sweep(store.as_ref(), clock.as_ref()).await {
                        warn!(error = %err, "stale lease sweep failed");
                    }
                    ControlFlow::Continue(())
                }
            })
        });
    }

    fn next_deadline(&self) -> i64 {
        deadline_after(self.clock.as_ref(), &self.config)
    }

    async fn remove_if_ours(&self, key: &str, token: &str) {
        match store::load::<LockRecord>(self.store.as_ref(), key).await {
            Ok(Some(record)) if record.owner_token == token => {
                if let Err(err) = store::remove(self.store.as_ref(), key).await {
                    warn!(key, error = %err, "failed to withdraw lease claim");
                }
            }
            Ok(_) => {}
            Err(err) => warn!(key, error = %err, "failed to withdraw lease claim"),
        }
    }

    fn start_guard(
        &self,
        name: &str,
        key: String,
        claim: LockRecord,
        cancel: &CancellationToken,
    ) -> LeaseGuard {
        let lost = cancel.child_token();
        let renewal = {
            let store = Arc::clone(&self.store);
            let clock = Arc::clone(&self.clock);
            let config = self.config.clone();
            let key = key.clone();
            let name = name.to_string();
            let claim = claim.clone();
            let lost = lost.clone();

            PeriodicTask::spawn("lease-renewal", self.config.poll_interval(), move || {
                let store = Arc::clone(&store);
                let clock = Arc::clone(&clock);
                let config = config.clone();
                let key = key.clone();
                let name = name.clone();
                let claim = claim.clone();
                let lost = lost.clone();
                async move {
                    match renew(store.as_ref(), clock.as_ref(), &config, &key, &claim).await {
                        Ok(true) => ControlFlow::Continue(()),
                        Ok(false) => {
                            warn!(lock = %name, "lease lost to another owner; cancelling holder");
                            lost.cancel();
                            ControlFlow::Break(())
                        }
                        Err(err) => {
                            warn!(lock = %name, error = %err, "lease renewal failed");
                            ControlFlow::Continue(())
                        }
                    }
                }
            })
        };

        LeaseGuard {
            name: name.to_string(),
            key,
            token: claim.owner_token,
            store: Arc::clone(&self.store),
            cancel: lost,
            renewal: Some(renewal),
            released: false,
        }
    }
}

fn deadline_after(clock: &dyn Clock, config: &LeaseConfig) -> i64 {
    let extra = config.lease_timeout() + config.poll_interval() * 2;
    clock
        .now_ms()
        .saturating_add(i64::try_from(extra.as_millis()).unwrap_or(i64::MAX))
}

/// Push the deadline forward if the stored claim is still ours.
async fn renew(
    store: &dyn StateStore,
    clock: &dyn Clock,
    config: &LeaseConfig,
    key: &str,
    claim: &LockRecord,
) -> StoreResult<bool> {
    match store::load::<LockRecord>(store, key).await? {
        Some(record) if record.owner_token == claim.owner_token => {
            let refreshed = LockRecord {
                deadline: deadline_after(clock, config),
                ..record
            };
            store::save(store, key, &refreshed).await?;
            Ok(true)
        }
        _ => Ok(false),
    }
}

/// Remove stale lease records, then whatever interrupted writes left behind.
async fn sweep(store: &dyn StateStore, clock: &dyn Clock) -> StoreResult<usize> {
    let now = clock.now_ms();
    let mut removed = 0;
    for key in store.keys(LOCK_PREFIX).await? {
        let Some(value) = store.get(&key).await? else {
            continue;
        };
        let stale = match serde_json::from_value::<LockRecord>(value) {
            Ok(record) => !record.is_live(now),
            Err(_) => true,
        };
        if stale {
            store::remove(store, &key).await?;
            info!(key = %key, "removed stale lease");
            removed += 1;
        }
    }

    let leftovers = store.purge_leftovers().await?;
    if leftovers > 0 {
        debug!(count = leftovers, "purged abandoned store writes");
    }
    Ok(removed)
}

/// Proof of holding a lease.
///
/// Release with [`LeaseGuard::release`]. A guard dropped without releasing
/// schedules the release on the current runtime.
pub struct LeaseGuard {
    name: String,
    key: String,
    token: String,
    store: Arc<dyn StateStore>,
    cancel: CancellationToken,
    renewal: Option<PeriodicTask>,
    released: bool,
}

impl LeaseGuard {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn owner_token(&self) -> &str {
        &self.token
    }

    /// Fires when the caller cancels or the lease is taken away.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_lost(&self) -> bool {
        self.renewal.as_ref().is_some_and(PeriodicTask::is_finished) && self.cancel.is_cancelled()
    }

    /// Stop renewing and delete the lease record, whoever it belongs to now.
    pub async fn release(mut self) -> Result<()> {
        self.released = true;
        if let Some(renewal) = self.renewal.take() {
            renewal.stop().await;
        }
        store::remove(self.store.as_ref(), &self.key).await?;
        debug!(lock = %self.name, "lease released");
        Ok(())
    }
}

impl Drop for LeaseGuard {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        let renewal = self.renewal.take();
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            warn!(lock = %self.name, "lease guard dropped outside a runtime; record expires on its own");
            return;
        };
        let store = Arc::clone(&self.store);
        let key = std::mem::take(&mut self.key);
        let name = std::mem::take(&mut self.name);
        runtime.spawn(async move {
            if let Some(renewal) = renewal {
                renewal.stop().await;
            }
            match store::remove(store.as_ref(), &key).await {
                Ok(()) => debug!(lock = %name, "lease released on drop"),
                Err(err) => warn!(lock = %name, error = %err, "failed to release dropped lease"),
            }
        });
    }
}

impl std::fmt::Debug for LeaseGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeaseGuard")
            .field("name", &self.name)
            .field("token", &self.token)
            .field("released", &self.released)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::store::MemoryStateStore;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn lease_lock(store: &Arc<MemoryStateStore>) -> Arc<LeaseLock> {
        Arc::new(LeaseLock::with_clock(
            store.clone(),
            LeaseConfig::testing(),
            Arc::new(TokioClock::new()),
        ))
    }

    async fn stored(store: &MemoryStateStore, name: &str) -> Option<LockRecord> {
        store::load(store, &lock_key(name)).await.unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn acquire_writes_record_with_pid_and_deadline() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let clock = TokioClock::new();

        let guard = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap();

        let record = stored(&store, "example.org").await.unwrap();
        assert_eq!(record.owner_token, guard.owner_token());
        assert_eq!(guard.name(), "example.org");
        assert_eq!(record.owner_pid, Some(std::process::id()));
        assert!(record.deadline > clock.now_ms() + 4_000);

        guard.release().await.unwrap();
        assert!(stored(&store, "example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn session_owned_lease_has_no_pid() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);

        let guard = locks
            .acquire_as("session", LeaseOwner::Session, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(stored(&store, "session").await.unwrap().owner_pid, None);
        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_acquirer_waits_for_release() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let first = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap();

        let waiter = {
            let locks = Arc::clone(&locks);
            tokio::spawn(async move {
                locks
                    .acquire("example.org", &CancellationToken::new())
                    .await
                    .unwrap()
            })
        };

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(!waiter.is_finished());

        first.release().await.unwrap();
        let second = waiter.await.unwrap();
        assert_eq!(
            stored(&store, "example.org").await.unwrap().owner_token,
            second.owner_token()
        );
        second.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn cancelling_a_waiter_fails_with_lock_cancelled() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let held = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let waiter = {
            let locks = Arc::clone(&locks);
            let cancel = cancel.clone();
            tokio::spawn(async move { locks.acquire("example.org", &cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(300)).await;
        cancel.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, LocalAppError::LockCancelled { ref lock } if lock == "example.org"));

        assert_eq!(
            stored(&store, "example.org").await.unwrap().owner_token,
            held.owner_token()
        );
        held.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_holders_never_overlap() {
        let store = Arc::new(MemoryStateStore::new());
        let active = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(AtomicUsize::new(0));

        let mut tasks = Vec::new();
        for _ in 0..6 {
            // Separate LeaseLock per task, like separate processes.
            let locks = lease_lock(&store);
            let active = Arc::clone(&active);
            let entered = Arc::clone(&entered);
            tasks.push(tokio::spawn(async move {
                locks
                    .with_lock("example.org", &CancellationToken::new(), |_| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        assert_eq!(now, 1, "two holders inside the lease");
                        entered.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(120)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await
            }));
        }

        for task in tasks {
            task.await.unwrap().unwrap();
        }
        assert_eq!(entered.load(Ordering::SeqCst), 6);
        assert!(stored(&store, "example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn renewal_keeps_a_long_holder_alive() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let guard = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap();

        // Well past lease_timeout; renewals must keep pushing the deadline.
        tokio::time::sleep(Duration::from_secs(12)).await;

        let record = stored(&store, "example.org").await.unwrap();
        assert_eq!(record.owner_token, guard.owner_token());
        assert!(record.is_live(TokioClock::new().now_ms()));
        assert!(!guard.cancellation().is_cancelled());

        let other = lease_lock(&store);
        let cancel = CancellationToken::new();
        let attempt = tokio::time::timeout(
            Duration::from_secs(1),
            other.acquire("example.org", &cancel),
        )
        .await;
        assert!(attempt.is_err());

        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn losing_the_record_cancels_the_holder() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let caller = CancellationToken::new();
        let guard = locks.acquire("example.org", &caller).await.unwrap();

        store::remove(store.as_ref(), &lock_key("example.org"))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(guard.cancellation().is_cancelled());
        assert!(guard.is_lost());
        assert!(!caller.is_cancelled());
        guard.release().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_maps_cancelled_operation_to_lock_cancelled() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let cancel = CancellationToken::new();

        let result: Result<()> = locks
            .with_lock("example.org", &cancel, |token| {
                let cancel = cancel.clone();
                async move {
                    cancel.cancel();
                    token.cancelled().await;
                    Err(LocalAppError::Cancelled)
                }
            })
            .await;

        assert!(matches!(result, Err(LocalAppError::LockCancelled { .. })));
        assert!(stored(&store, "example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn with_lock_releases_after_error() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);

        let result: Result<()> = locks
            .with_lock("example.org", &CancellationToken::new(), |_| async {
                Err(LocalAppError::spawn("boom"))
            })
            .await;

        assert!(matches!(result, Err(LocalAppError::SpawnFailed(_))));
        assert!(stored(&store, "example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_guard_is_released() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let guard = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap();
        drop(guard);

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(stored(&store, "example.org").await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_removes_expired_and_orphaned_records() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        let now = TokioClock::new().now_ms();

        let records = [
            ("expired", now - 1, None),
            ("orphaned", now + 60_000, Some(0)),
            ("live-session", now + 60_000, None),
            ("live-process", now + 60_000, Some(std::process::id())),
        ];
        for (name, deadline, owner_pid) in records {
            let record = LockRecord {
                owner_token: name.to_string(),
                deadline,
                owner_pid,
            };
            store::save(store.as_ref(), &lock_key(name), &record)
                .await
                .unwrap();
        }
        store
            .set("lock/garbage", Some(serde_json::json!("not a record")))
            .await
            .unwrap();

        assert_eq!(locks.sweep_once().await.unwrap(), 3);

        let mut remaining = store.keys(LOCK_PREFIX).await.unwrap();
        remaining.sort();
        assert_eq!(remaining, vec!["lock/live-process", "lock/live-session"]);
    }

    #[tokio::test(start_paused = true)]
    async fn background_sweep_frees_an_orphaned_name() {
        let store = Arc::new(MemoryStateStore::new());
        let locks = lease_lock(&store);
        locks.ensure_sweeper();

        let orphan = LockRecord {
            owner_token: "crashed".to_string(),
            deadline: TokioClock::new().now_ms() - 1,
            owner_pid: None,
        };
        store::save(store.as_ref(), &lock_key("example.org"), &orphan)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(stored(&store, "example.org").await.is_none());
    }

    /// Fails the `fail_on`-th read and passes everything else through.
    struct FailingRead {
        inner: MemoryStateStore,
        reads: AtomicUsize,
        fail_on: usize,
    }

    #[async_trait::async_trait]
    impl StateStore for FailingRead {
        async fn get(&self, key: &str) -> StoreResult<Option<serde_json::Value>> {
            if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.fail_on {
                return Err(crate::store::StoreError::Io {
                    key: key.to_string(),
                    source: std::io::Error::other("disk unavailable"),
                });
            }
            self.inner.get(key).await
        }

        async fn set(&self, key: &str, value: Option<serde_json::Value>) -> StoreResult<()> {
            self.inner.set(key, value).await
        }

        async fn keys(&self, prefix: &str) -> StoreResult<Vec<String>> {
            self.inner.keys(prefix).await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failed_verification_withdraws_the_claim() {
        // Read one checks the name is free, read two verifies the claim.
        let store = Arc::new(FailingRead {
            inner: MemoryStateStore::new(),
            reads: AtomicUsize::new(0),
            fail_on: 2,
        });
        let locks = LeaseLock::with_clock(
            store.clone(),
            LeaseConfig::testing(),
            Arc::new(TokioClock::new()),
        );

        let err = locks
            .acquire("example.org", &CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, LocalAppError::Store(_)), "{err:?}");
        assert!(stored(&store.inner, "example.org").await.is_none());
    }
}
