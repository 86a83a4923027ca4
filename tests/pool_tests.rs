//! Session pool behavior: reuse, per-host and global caps, eviction, and
//! failure handling.


use std::time::Duration;

use tokio_util::sync::CancellationToken;

use fleetrun::config::PoolConfig;
use fleetrun::error::{ConnectReason, FleetError};
use test_harness::{test_pool, FakeTransport, Step};

fn small_pool_config() -> PoolConfig {
    PoolConfig {
        max_sessions: 4,
        max_per_host: 1,
        connect_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(60),
    }
}

#[tokio::test]
async fn healthy_sessions_are_reused() {
    let transport = FakeTransport::new();
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());
    let token = CancellationToken::new();

    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, true);
    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, true);

    assert_eq!(transport.connects(), 1, "second acquire must reuse the idle session");
    assert_eq!(pool.live_sessions(), 1);
    assert_eq!(pool.idle_sessions(), 1);
}

#[tokio::test]
async fn unhealthy_release_forces_reconnect() {
    let transport = FakeTransport::new();
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());
    let token = CancellationToken::new();

    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, false);
    assert_eq!(pool.live_sessions(), 0);

    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, true);
    assert_eq!(transport.connects(), 2);
}

#[tokio::test]
async fn per_host_cap_makes_second_acquire_wait() {
    let transport = FakeTransport::new();
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());
    let token = CancellationToken::new();

    let held = pool.acquire("web-1", &token).await.unwrap();

    // Cap of one: a second acquire must block until the first is returned.
    let waited = tokio::time::timeout(Duration::from_millis(50), pool.acquire("web-1", &token)).await;
    assert!(waited.is_err(), "acquire should wait while the cap is hit");

    pool.release(held, true);
    let handle = tokio::time::timeout(Duration::from_millis(500), pool.acquire("web-1", &token))
        .await
        .expect("acquire should resume after release")
        .unwrap();
    pool.release(handle, true);
    assert_eq!(transport.connects(), 1);
}

#[tokio::test]
async fn global_cap_evicts_oldest_idle() {
    let transport = FakeTransport::new();
    let config = PoolConfig {
        max_sessions: 2,
        ..small_pool_config()
    };
    let pool = test_pool(transport.clone(), &["web-1", "web-2", "web-3"], config);
    let token = CancellationToken::new();

    // web-1 idles; web-2 is held; the pool is now full.
    let h1 = pool.acquire("web-1", &token).await.unwrap();
    pool.release(h1, true);
    let h2 = pool.acquire("web-2", &token).await.unwrap();
    assert_eq!(pool.live_sessions(), 2);

    // A third host fits only by dropping the idle web-1 session.
    let h3 = pool.acquire("web-3", &token).await.unwrap();
    assert_eq!(transport.connects(), 3);
    assert_eq!(pool.live_sessions(), 2);
    assert_eq!(pool.idle_sessions(), 0);

    pool.release(h2, true);
    pool.release(h3, true);
}

#[tokio::test]
async fn waiting_acquire_honours_cancellation() {
    let transport = FakeTransport::new();
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());
    let token = CancellationToken::new();

    let _held = pool.acquire("web-1", &token).await.unwrap();

    let cancel = CancellationToken::new();
    cancel.cancel();
    let err = pool.acquire("web-1", &cancel).await.unwrap_err();
    assert!(matches!(err, FleetError::Cancelled));
}

#[tokio::test]
async fn connect_failure_frees_the_reserved_slot() {
    let transport = FakeTransport::new();
    transport.script("web-1", vec![Step::Unreachable, Step::Exit(0)]);
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());
    let token = CancellationToken::new();

    let err = pool.acquire("web-1", &token).await.unwrap_err();
    assert!(matches!(
        err,
        FleetError::Connect {
            reason: ConnectReason::Unreachable,
            ..
        }
    ));
    assert_eq!(pool.live_sessions(), 0, "failed connect must not leak a slot");

    // The slot is usable again once the host comes back.
    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, true);
}

#[tokio::test]
async fn auth_rejection_is_fatal() {
    let transport = FakeTransport::new();
    transport.script("web-1", vec![Step::RejectAuth]);
    let pool = test_pool(transport.clone(), &["web-1"], small_pool_config());

    let err = pool
        .acquire("web-1", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(err.is_fatal_auth());
}

#[tokio::test]
async fn idle_sessions_are_evicted_after_timeout() {
    let transport = FakeTransport::new();
    let config = PoolConfig {
        idle_timeout: Duration::from_millis(10),
        ..small_pool_config()
    };
    let pool = test_pool(transport.clone(), &["web-1"], config);
    let token = CancellationToken::new();

    let handle = pool.acquire("web-1", &token).await.unwrap();
    pool.release(handle, true);
    assert_eq!(pool.idle_sessions(), 1);

    tokio::time::sleep(Duration::from_millis(30)).await;
    assert_eq!(pool.evict_idle(), 1);
    assert_eq!(pool.idle_sessions(), 0);
    assert_eq!(pool.live_sessions(), 0);
}

#[tokio::test]
async fn unknown_host_is_rejected() {
    let transport = FakeTransport::new();
    let pool = test_pool(transport, &["web-1"], small_pool_config());

    let err = pool
        .acquire("ghost", &CancellationToken::new())
        .await
        .unwrap_err();
    assert!(matches!(err, FleetError::UnknownHost(_)));
}
