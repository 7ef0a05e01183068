//! Integration tests for the pool's public surface.
//!
//! These run without any backend: clients are constructed against
//! unreachable hosts, so they never come online and the tests exercise
//! the queueing, timeout, and teardown behavior of the dispatcher
//! itself.

use std::time::Duration;

use comfyui_fleet::auth::Credentials;
use comfyui_fleet::client::{ClientOptions, ComfyUIClient};
use comfyui_fleet::events::PoolEvent;
use comfyui_fleet::pool::{ComfyUIPool, JobFilter, PoolError, PoolOptions, QueueMode, RunOptions};

fn offline_client(id: &str) -> ComfyUIClient {
    ComfyUIClient::with_options(
        format!("http://{id}.invalid:8188"),
        Credentials::None,
        ClientOptions {
            id: Some(id.to_string()),
            ..Default::default()
        },
    )
    .expect("valid host")
}

fn quick_pool(mode: QueueMode) -> ComfyUIPool {
    ComfyUIPool::with_options(PoolOptions {
        mode,
        init_tries: 1,
        init_delay: Duration::from_millis(1),
        ..Default::default()
    })
}

// ---------------------------------------------------------------------------
// Test: adding clients emits added events and tracks state
// ---------------------------------------------------------------------------

#[tokio::test]
async fn add_client_emits_added_and_registers_state() {
    let pool = quick_pool(QueueMode::PickLowest);
    let mut events = pool.subscribe();

    pool.add_client(offline_client("a"));
    pool.add_client(offline_client("b"));

    assert_eq!(pool.client_count(), 2);
    let states = pool.client_states();
    assert_eq!(states[0].id, "a");
    assert_eq!(states[1].id, "b");
    // Never probed successfully: offline, unlocked, empty queue.
    assert!(states.iter().all(|s| !s.online && !s.locked));

    let mut added = Vec::new();
    while let Ok(event) = events.try_recv() {
        if let PoolEvent::Added { client_idx } = event {
            added.push(client_idx);
        }
    }
    assert_eq!(added, vec![0, 1]);

    pool.destroy();
}

// ---------------------------------------------------------------------------
// Test: offline clients never receive jobs
// ---------------------------------------------------------------------------

#[tokio::test]
async fn jobs_never_reach_offline_clients() {
    let pool = quick_pool(QueueMode::PickLowest);
    pool.add_client(offline_client("a"));

    let result: Result<(), PoolError> = pool
        .run(
            |_client, _idx| async move { Ok::<_, String>(()) },
            1.0,
            JobFilter::default(),
            RunOptions {
                selection_timeout: Some(Duration::from_millis(100)),
                ..Default::default()
            },
        )
        .await;

    assert!(matches!(result, Err(PoolError::NoClient)));
    pool.destroy();
}

// ---------------------------------------------------------------------------
// Test: destroy cancels queued work and destroys clients
// ---------------------------------------------------------------------------

#[tokio::test]
async fn destroy_rejects_new_and_pending_work() {
    let pool = quick_pool(QueueMode::PickRoutine);
    let client = offline_client("a");
    pool.add_client(client.clone());

    let background = pool.clone();
    let pending = tokio::spawn(async move {
        background
            .run(
                |_client, _idx| async move { Ok::<_, String>(()) },
                1.0,
                JobFilter::default(),
                RunOptions::default(),
            )
            .await
    });
    tokio::time::sleep(Duration::from_millis(20)).await;

    pool.destroy();

    let pending_result = pending.await.expect("task joins");
    assert!(matches!(pending_result, Err(PoolError::Destroyed)));
    assert!(client.is_destroyed());

    // New work is refused outright.
    let after: Result<(), PoolError> = pool
        .run(
            |_client, _idx| async move { Ok::<_, String>(()) },
            1.0,
            JobFilter::default(),
            RunOptions::default(),
        )
        .await;
    assert!(matches!(after, Err(PoolError::Destroyed)));
}

// ---------------------------------------------------------------------------
// Test: queue bound
// ---------------------------------------------------------------------------

#[tokio::test]
async fn queue_bound_is_enforced() {
    let pool = ComfyUIPool::with_options(PoolOptions {
        mode: QueueMode::PickLowest,
        max_queue_size: 2,
        init_tries: 1,
        init_delay: Duration::from_millis(1),
    });

    let mut parked = Vec::new();
    for _ in 0..2 {
        let background = pool.clone();
        parked.push(tokio::spawn(async move {
            background
                .run(
                    |_client, _idx| async move { Ok::<_, String>(()) },
                    1.0,
                    JobFilter::default(),
                    RunOptions::default(),
                )
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(30)).await;

    let overflow: Result<(), PoolError> = pool
        .run(
            |_client, _idx| async move { Ok::<_, String>(()) },
            1.0,
            JobFilter::default(),
            RunOptions::default(),
        )
        .await;
    assert!(matches!(overflow, Err(PoolError::QueueFull)));

    pool.destroy();
    for handle in parked {
        let result = handle.await.expect("task joins");
        assert!(matches!(result, Err(PoolError::Destroyed)));
    }
}

// ---------------------------------------------------------------------------
// Test: mode changes are observable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn change_mode_round_trips() {
    let pool = quick_pool(QueueMode::PickZero);
    assert_eq!(pool.mode(), QueueMode::PickZero);
    pool.change_mode(QueueMode::PickLowest);
    assert_eq!(pool.mode(), QueueMode::PickLowest);
    pool.destroy();
}
