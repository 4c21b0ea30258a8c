// tests/pool_integration.rs
//! End-to-end pool tests driving the real binary as the worker process

use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tenant_pool::{
    CancelState, Identity, PoolConfig, PoolError, QueryFailure, QueryRequest, SessionEvent,
    StaticResolver, WorkerPool,
};
use tempfile::TempDir;

const WORKSPACES: [&str; 5] = ["site-a", "site-b", "site-c", "site-d", "site-e"];

struct Fixture {
    dir: TempDir,
    pool: WorkerPool,
}

impl Fixture {
    fn socket_files(&self) -> usize {
        let socket_dir = self.dir.path().join("run").join(self.pool.pool_id());
        match std::fs::read_dir(socket_dir) {
            Ok(entries) => entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().extension().map_or(false, |ext| ext == "sock"))
                .count(),
            Err(_) => 0,
        }
    }
}

fn config(dir: &Path, capacity: usize) -> PoolConfig {
    let mut config = PoolConfig::new(capacity, 0, 5_000, 0, 300);
    config.runtime_dir = dir.join("run");
    config.shutdown_grace_ms = 1_000;
    config.worker.program = Some(PathBuf::from(env!("CARGO_BIN_EXE_tenant-pool")));
    config.worker.args = vec!["worker".to_string()];
    config
}

fn start_with(dir: TempDir, config: PoolConfig) -> Fixture {
    let mut resolver = StaticResolver::new();
    for ws in WORKSPACES {
        resolver.insert(ws, Identity::current(dir.path()));
    }
    let pool = WorkerPool::start(config, Arc::new(resolver)).unwrap();
    Fixture { dir, pool }
}

fn start(capacity: usize) -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), capacity);
    start_with(dir, config)
}

async fn wait_for_live(pool: &WorkerPool, live: usize) {
    for _ in 0..200 {
        if pool.stats().live == live {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("pool never reached {} live workers: {:?}", live, pool.stats());
}

#[tokio::test]
async fn test_query_streams_then_completes() {
    let fx = start(2);
    let session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"prompt": "one two", "chunks": 3})),
        )
        .await
        .unwrap();

    let (messages, result) = session.collect().await;
    assert_eq!(messages.len(), 3);
    assert_eq!(messages[0]["text"], json!("one"));
    assert_eq!(result.unwrap()["text"], json!("one two one"));

    let stats = fx.pool.stats();
    assert_eq!(stats.live, 1);
    assert_eq!(stats.ready, 1);
    fx.pool.shutdown().await;
    assert_eq!(fx.socket_files(), 0);
}

#[tokio::test]
async fn test_same_workspace_reuses_handle() {
    let fx = start(2);

    let first = fx.pool.query("site-a", QueryRequest::new(json!("hi"))).await.unwrap();
    let first_handle = first.handle_id();
    first.collect().await.1.unwrap();

    let second = fx.pool.query("site-a", QueryRequest::new(json!("again"))).await.unwrap();
    assert_eq!(second.handle_id(), first_handle);
    second.collect().await.1.unwrap();

    let handles = fx.pool.handles();
    assert_eq!(handles.len(), 1);
    assert_eq!(handles[0].queries_completed, 2);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_busy_workspace_fails_fast() {
    let fx = start(2);
    let held = fx.pool.acquire("site-a").await.unwrap();

    match fx.pool.acquire("site-a").await {
        Err(PoolError::WorkspaceBusy { state, .. }) => assert_eq!(state, "busy"),
        other => panic!("Expected WorkspaceBusy, got {:?}", other),
    }

    fx.pool.release(held);
    let again = fx.pool.acquire("site-a").await.unwrap();
    drop(again);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_capacity_with_no_idle_worker() {
    let fx = start(1);
    let _held = fx.pool.acquire("site-a").await.unwrap();

    match fx.pool.acquire("site-b").await {
        Err(PoolError::PoolAtCapacity { capacity }) => assert_eq!(capacity, 1),
        other => panic!("Expected PoolAtCapacity, got {:?}", other),
    }
    assert_eq!(fx.pool.stats().live, 1);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_least_recently_used_is_evicted() {
    let fx = start(2);

    for ws in ["site-a", "site-b"] {
        let session = fx.pool.query(ws, QueryRequest::new(json!(ws))).await.unwrap();
        session.collect().await.1.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let session = fx.pool.query("site-c", QueryRequest::new(json!("c"))).await.unwrap();
    session.collect().await.1.unwrap();

    let mut workspaces: Vec<String> = fx.pool.handles().into_iter().map(|h| h.workspace).collect();
    workspaces.sort();
    assert_eq!(workspaces, vec!["site-b".to_string(), "site-c".to_string()]);
    assert_eq!(fx.socket_files(), 2);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_acquires_respect_capacity() {
    let fx = start(2);

    let results =
        futures::future::join_all(WORKSPACES.iter().map(|ws| fx.pool.acquire(*ws))).await;

    let mut held = Vec::new();
    for result in results {
        match result {
            Ok(worker) => held.push(worker),
            Err(PoolError::PoolAtCapacity { .. }) => {}
            Err(e) => panic!("Unexpected error: {}", e),
        }
    }
    assert_eq!(held.len(), 2);
    assert_eq!(fx.pool.stats().live, 2);

    drop(held);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_concurrent_evictions_each_get_a_slot() {
    let fx = start(2);
    for ws in ["site-a", "site-b"] {
        let session = fx.pool.query(ws, QueryRequest::new(json!(ws))).await.unwrap();
        session.collect().await.1.unwrap();
    }

    let (c, d) = tokio::join!(fx.pool.acquire("site-c"), fx.pool.acquire("site-d"));
    let (c, d) = (c.unwrap(), d.unwrap());
    assert_eq!(fx.pool.stats().live, 2);

    let mut workspaces: Vec<String> = fx.pool.handles().into_iter().map(|h| h.workspace).collect();
    workspaces.sort();
    assert_eq!(workspaces, vec!["site-c".to_string(), "site-d".to_string()]);

    fx.pool.release(c);
    fx.pool.release(d);
    fx.pool.shutdown().await;
    assert_eq!(fx.socket_files(), 0);
}

#[tokio::test]
async fn test_abandoned_acquire_keeps_capacity() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 1);
    config
        .worker
        .args
        .extend(["--ready-delay-ms".to_string(), "500".to_string()]);
    let fx = start_with(dir, config);

    let abandoned =
        tokio::time::timeout(Duration::from_millis(100), fx.pool.acquire("site-a")).await;
    assert!(abandoned.is_err(), "acquire should still be spawning");

    // The spawn completes on its own and parks the worker as ready
    for _ in 0..200 {
        if fx.pool.stats().ready == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    let stats = fx.pool.stats();
    assert_eq!(stats.spawning, 0, "{:?}", stats);
    assert_eq!(stats.ready, 1, "{:?}", stats);
    assert_eq!(fx.socket_files(), 1);

    let worker = fx.pool.acquire("site-a").await.unwrap();
    fx.pool.release(worker);

    let session = fx.pool.query("site-b", QueryRequest::new(json!("b"))).await.unwrap();
    session.collect().await.1.unwrap();
    assert_eq!(fx.pool.stats().live, 1);

    fx.pool.shutdown().await;
    assert_eq!(fx.socket_files(), 0);
}

#[tokio::test]
async fn test_spawn_timeout_leaves_no_socket() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 2);
    config.spawn_timeout_ms = 300;
    config.worker.args.push("--stall-before-ready".to_string());
    let fx = start_with(dir, config);

    match fx.pool.acquire("site-a").await {
        Err(PoolError::SpawnFailed { reason, .. }) => {
            assert!(reason.contains("did not become ready"), "{}", reason)
        }
        other => panic!("Expected SpawnFailed, got {:?}", other),
    }
    assert_eq!(fx.pool.stats().live, 0);
    assert_eq!(fx.socket_files(), 0);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_crash_mid_query_then_respawn() {
    let fx = start(2);

    let session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"chunks": 3, "crash_after": 1})),
        )
        .await
        .unwrap();
    let crashed_handle = session.handle_id();

    match session.collect().await.1 {
        Err(QueryFailure::WorkerCrashed { reason }) => {
            assert!(reason.contains("101"), "{}", reason)
        }
        other => panic!("Expected WorkerCrashed, got {:?}", other),
    }
    assert_eq!(fx.pool.stats().live, 0);
    assert_eq!(fx.socket_files(), 0);

    let session = fx.pool.query("site-a", QueryRequest::new(json!("back"))).await.unwrap();
    assert_ne!(session.handle_id(), crashed_handle);
    session.collect().await.1.unwrap();
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_worker_error_passes_through() {
    let fx = start(2);

    let session = fx
        .pool
        .query("site-a", QueryRequest::new(json!({"fail": "tool exploded"})))
        .await
        .unwrap();
    let handle = session.handle_id();
    assert_eq!(
        session.collect().await.1,
        Err(QueryFailure::Worker {
            code: "scripted_failure".to_string(),
            message: "tool exploded".to_string(),
        })
    );

    // Application errors do not cost the worker
    let session = fx.pool.query("site-a", QueryRequest::new(json!("ok"))).await.unwrap();
    assert_eq!(session.handle_id(), handle);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_cancel_acknowledged_keeps_worker() {
    let fx = start(2);

    let mut session = fx
        .pool
        .query("site-a", QueryRequest::new(json!({"hang": true})))
        .await
        .unwrap();
    let handle = session.handle_id();

    session.cancel();
    assert!(session.next_event().await.is_none());
    assert_eq!(session.cancel_outcome().await, CancelState::Acked);

    let stats = fx.pool.stats();
    assert_eq!(stats.ready, 1);

    let session = fx.pool.query("site-a", QueryRequest::new(json!("next"))).await.unwrap();
    assert_eq!(session.handle_id(), handle);
    session.collect().await.1.unwrap();
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_cancel_mid_stream_stops_messages() {
    let fx = start(2);

    let mut session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"chunks": 50, "delay_ms": 20})),
        )
        .await
        .unwrap();

    match session.next_event().await {
        Some(SessionEvent::Message(_)) => {}
        other => panic!("Expected a message, got {:?}", other),
    }

    session.cancel();
    assert!(session.next_event().await.is_none());
    assert_eq!(session.cancel_outcome().await, CancelState::Acked);
    assert!(session.next_event().await.is_none());

    let stats = fx.pool.stats();
    assert_eq!(stats.ready, 1);
    assert_eq!(stats.busy, 0);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_ignored_cancel_is_force_killed() {
    let fx = start(2);

    let mut session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"hang": true, "ignore_cancel": true})),
        )
        .await
        .unwrap();

    session.cancel();
    assert_eq!(session.cancel_outcome().await, CancelState::ForceKilled);
    assert_eq!(fx.pool.stats().live, 0);
    assert_eq!(fx.socket_files(), 0);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_query_timeout() {
    let fx = start(2);

    let mut session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"hang": true, "chunks": 0}))
                .with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    match session.next_event().await {
        Some(SessionEvent::Failed(QueryFailure::TimedOut(d))) => {
            assert_eq!(d, Duration::from_millis(200))
        }
        other => panic!("Expected TimedOut, got {:?}", other),
    }
    assert_eq!(session.cancel_state(), CancelState::Acked);
    assert_eq!(fx.pool.stats().ready, 1);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_query_timeout_as_pool_error() {
    let fx = start(2);

    let session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"hang": true, "chunks": 0}))
                .with_timeout(Duration::from_millis(200)),
        )
        .await
        .unwrap();

    match session.result().await {
        Err(PoolError::Timeout(d)) => assert_eq!(d, Duration::from_millis(200)),
        other => panic!("Expected Timeout, got {:?}", other),
    }
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_unbounded_timeout_is_accepted() {
    let fx = start(2);

    let session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!("hi")).with_timeout(Duration::MAX),
        )
        .await
        .unwrap();
    let handle = session.handle_id();
    session.result().await.unwrap();

    let session = fx.pool.query("site-a", QueryRequest::new(json!("again"))).await.unwrap();
    assert_eq!(session.handle_id(), handle);
    session.collect().await.1.unwrap();
    assert_eq!(fx.pool.stats().live, 1);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_idle_workers_are_swept() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 2);
    config.idle_eviction_threshold_ms = 100;
    let fx = start_with(dir, config);

    let session = fx.pool.query("site-a", QueryRequest::new(json!("x"))).await.unwrap();
    session.collect().await.1.unwrap();
    assert_eq!(fx.pool.stats().live, 1);

    wait_for_live(&fx.pool, 0).await;
    assert_eq!(fx.socket_files(), 0);
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_unanswered_healthchecks_tear_down_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 2);
    config.healthcheck_interval_ms = 50;
    config.healthcheck_timeout_ms = 100;
    config.worker.args.push("--ignore-healthchecks".to_string());
    let fx = start_with(dir, config);

    let worker = fx.pool.acquire("site-a").await.unwrap();
    fx.pool.release(worker);

    wait_for_live(&fx.pool, 0).await;
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_answered_healthchecks_keep_worker() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = config(dir.path(), 2);
    config.healthcheck_interval_ms = 30;
    config.healthcheck_timeout_ms = 500;
    let fx = start_with(dir, config);

    let worker = fx.pool.acquire("site-a").await.unwrap();
    let handle = worker.handle_id();
    fx.pool.release(worker);

    tokio::time::sleep(Duration::from_millis(300)).await;
    let session = fx.pool.query("site-a", QueryRequest::new(json!("x"))).await.unwrap();
    assert_eq!(session.handle_id(), handle);
    session.collect().await.1.unwrap();
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_drain_retires_after_query() {
    let fx = start(2);

    let session = fx
        .pool
        .query(
            "site-a",
            QueryRequest::new(json!({"chunks": 2, "delay_ms": 50})),
        )
        .await
        .unwrap();
    assert!(fx.pool.drain("site-a").await.unwrap());
    assert_eq!(fx.pool.stats().draining, 1);

    session.collect().await.1.unwrap();
    wait_for_live(&fx.pool, 0).await;
    assert!(!fx.pool.drain("site-a").await.unwrap());
    fx.pool.shutdown().await;
}

#[tokio::test]
async fn test_shutdown_cancels_running_and_rejects_new() {
    let fx = start(2);

    let idle = fx.pool.query("site-b", QueryRequest::new(json!("x"))).await.unwrap();
    idle.collect().await.1.unwrap();

    let mut running = fx
        .pool
        .query("site-a", QueryRequest::new(json!({"hang": true, "chunks": 0})))
        .await
        .unwrap();

    fx.pool.shutdown().await;

    assert_eq!(
        running.next_event().await,
        Some(SessionEvent::Failed(QueryFailure::Cancelled))
    );
    assert_eq!(fx.pool.stats().live, 0);
    assert!(matches!(
        fx.pool.query("site-a", QueryRequest::new(json!("x"))).await,
        Err(PoolError::PoolClosed)
    ));
    assert!(!fx.dir.path().join("run").join(fx.pool.pool_id()).exists());
}
