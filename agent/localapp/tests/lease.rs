//! Leases between independent lock instances over a directory-backed store.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use localapp::records::{lock_key, LockRecord};
use localapp::store::{self, FsStateStore, StateStore};
use localapp::{Clock, LeaseLock, LocalAppError, SystemClock};
use localapp_config::LeaseConfig;
use tokio_util::sync::CancellationToken;

fn fast_leases() -> LeaseConfig {
    LeaseConfig {
        poll_interval_ms: 50,
        lease_timeout_ms: 2_000,
        stale_check_interval_ms: 200,
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_holders_never_overlap_across_lock_instances() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let active = Arc::new(AtomicUsize::new(0));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut tasks = Vec::new();
    for _ in 0..4 {
        let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await?);
        let leases = LeaseLock::new(store, fast_leases());
        let active = Arc::clone(&active);
        let completed = Arc::clone(&completed);
        tasks.push(tokio::spawn(async move {
            for _ in 0..3 {
                let active = Arc::clone(&active);
                leases
                    .with_lock("example.org", &CancellationToken::new(), |_| async move {
                        assert_eq!(active.fetch_add(1, Ordering::SeqCst), 0);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .await?;
                completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok::<_, LocalAppError>(())
        }));
    }

    for task in tasks {
        task.await??;
    }
    assert_eq!(completed.load(Ordering::SeqCst), 12);
    Ok(())
}

#[tokio::test]
async fn test_dead_holder_does_not_block_acquisition() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await?);

    // A holder that died without releasing: its pid no longer exists.
    let orphan = LockRecord {
        owner_token: "crashed".to_string(),
        deadline: SystemClock.now_ms() + 3_600_000,
        owner_pid: Some(u32::MAX - 1),
    };
    store::save(store.as_ref(), &lock_key("example.org"), &orphan).await?;

    let leases = LeaseLock::new(Arc::clone(&store), fast_leases());
    let guard = tokio::time::timeout(
        Duration::from_secs(5),
        leases.acquire("example.org", &CancellationToken::new()),
    )
    .await??;

    let stored: Option<LockRecord> = store::load(store.as_ref(), &lock_key("example.org")).await?;
    assert_eq!(
        stored.map(|record| record.owner_token),
        Some(guard.owner_token().to_string())
    );
    guard.release().await?;
    Ok(())
}

#[tokio::test]
async fn test_session_lease_waits_for_deadline() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await?);

    let held = LockRecord {
        owner_token: "session".to_string(),
        deadline: SystemClock.now_ms() + 300,
        owner_pid: None,
    };
    store::save(store.as_ref(), &lock_key("example.org"), &held).await?;

    let leases = LeaseLock::new(Arc::clone(&store), fast_leases());
    let started = std::time::Instant::now();
    let guard = leases
        .acquire("example.org", &CancellationToken::new())
        .await?;

    assert!(started.elapsed() >= Duration::from_millis(250));
    guard.release().await?;
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_leaves_no_record_or_temporaries_behind() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let store: Arc<dyn StateStore> = Arc::new(FsStateStore::open(dir.path()).await?);
    let leases = LeaseLock::new(
        Arc::clone(&store),
        LeaseConfig {
            poll_interval_ms: 1,
            lease_timeout_ms: 2_000,
            stale_check_interval_ms: 60_000,
        },
    );

    for _ in 0..200 {
        let guard = leases
            .acquire("example.org", &CancellationToken::new())
            .await?;
        // Long enough for renewals to be in flight when we release.
        tokio::time::sleep(Duration::from_millis(3)).await;
        guard.release().await?;
        assert!(store.get(&lock_key("example.org")).await?.is_none());
    }

    let leftovers: Vec<_> = std::fs::read_dir(dir.path())?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    assert!(leftovers.is_empty(), "{leftovers:?}");
    Ok(())
}
