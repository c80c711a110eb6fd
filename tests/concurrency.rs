//! Idle timer shared across threads on the multi-thread runtime.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use idle_timer::{Config, IdleTimer, TimerError, create};
use tokio::task::JoinSet;
use tokio::time::{sleep, timeout};

const ROUNDS: u32 = 100;
const WORKERS: usize = 4;

fn fast_config() -> Config {
    Config {
        interval_ms: 1,
        timeout_ms: 3,
    }
}

/// Touch until the timer goes away or `touches` runs out.
async fn touch_worker(timer: Arc<IdleTimer>, touches: u32) {
    for _ in 0..touches {
        match timer.touch() {
            Ok(()) => {}
            Err(TimerError::AlreadyDestroyed) => return,
            Err(e) => panic!("unexpected touch error: {e}"),
        }
        sleep(Duration::from_micros(500)).await;
    }
}

/// Wait (bounded) until the handler count reaches `expected`.
async fn wait_for_count(fired: &AtomicU32, expected: u32) {
    timeout(Duration::from_secs(5), async {
        while fired.load(Ordering::SeqCst) < expected {
            sleep(Duration::from_millis(1)).await;
        }
    })
    .await
    .expect("timer did not fire in time");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_touch_and_destroy() {
    for round in 0..ROUNDS {
        let fired = Arc::new(AtomicU32::new(0));
        let counter = fired.clone();
        let timer = Arc::new(
            create(
                move |elapsed| {
                    assert!(elapsed >= Duration::from_millis(3));
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &fast_config(),
            )
            .unwrap(),
        );

        let mut workers = JoinSet::new();
        for _ in 0..WORKERS {
            workers.spawn(touch_worker(timer.clone(), 10));
        }

        // Even rounds race an explicit destroy against the workers
        let destroyed_early = round % 2 == 0;
        if destroyed_early {
            sleep(Duration::from_millis(2)).await;
            timer.destroy();
        }

        while let Some(result) = workers.join_next().await {
            result.unwrap();
        }

        if destroyed_early {
            // May have fired just before the destroy, never twice
            sleep(Duration::from_millis(10)).await;
            assert!(fired.load(Ordering::SeqCst) <= 1, "round {round}");
        } else {
            wait_for_count(&fired, 1).await;
            sleep(Duration::from_millis(10)).await;
            assert_eq!(fired.load(Ordering::SeqCst), 1, "round {round}");
        }

        assert!(timer.is_destroyed());
        assert!(matches!(timer.touch(), Err(TimerError::AlreadyDestroyed)));

        // Destroying again has no effect
        timer.destroy();
        assert!(fired.load(Ordering::SeqCst) <= 1);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_touch_from_os_thread_defers_firing() {
    let fired = Arc::new(AtomicU32::new(0));
    let counter = fired.clone();
    let config = Config {
        interval_ms: 20,
        timeout_ms: 200,
    };
    let timer = Arc::new(
        create(
            move |_| {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &config,
        )
        .unwrap(),
    );

    // Plain thread, outside the runtime
    let toucher = {
        let timer = timer.clone();
        std::thread::spawn(move || {
            for _ in 0..30 {
                timer.touch().unwrap();
                std::thread::sleep(Duration::from_millis(10));
            }
        })
    };
    tokio::task::spawn_blocking(move || toucher.join())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(fired.load(Ordering::SeqCst), 0);

    wait_for_count(&fired, 1).await;
    assert!(timer.is_destroyed());
    assert!(matches!(timer.touch(), Err(TimerError::AlreadyDestroyed)));
}
