use futures::FutureExt;
use memorate::{AsyncMemoize, AsyncMemoized, RawKey};
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn identical_calls_compute_once() {
    let calls = AtomicU32::new(0);
    let memo: AsyncMemoize<u32, u64> = AsyncMemoize::builder().build();
    for _ in 0..3 {
        let value = memo
            .call(&5, |n| {
                calls.fetch_add(1, Ordering::Relaxed);
                let n = u64::from(*n);
                async move { n * n }
            })
            .await;
        assert_eq!(value, 25);
    }
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(memo.stats().hits(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_calls_share_one_execution() {
    const TASKS: usize = 8;
    let memo: Arc<AsyncMemoize<u32, u32>> = Arc::new(AsyncMemoize::builder().build());
    let executions = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..TASKS)
        .map(|_| {
            let memo = Arc::clone(&memo);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                memo.call(&42, |n| {
                    let executions = Arc::clone(&executions);
                    let n = *n;
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(30)).await;
                        n * 2
                    }
                })
                .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), 84);
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(memo.in_flight(), 0);
}

#[tokio::test]
async fn errors_fan_out_and_are_not_cached() {
    let memo: Arc<AsyncMemoize<u32, u32, String>> = Arc::new(AsyncMemoize::builder().build());
    let executions = Arc::new(AtomicUsize::new(0));

    let tasks: Vec<_> = (0..4)
        .map(|_| {
            let memo = Arc::clone(&memo);
            let executions = Arc::clone(&executions);
            tokio::spawn(async move {
                memo.try_call(&1, |_| {
                    let executions = Arc::clone(&executions);
                    async move {
                        executions.fetch_add(1, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        Err::<u32, _>("down".to_string())
                    }
                })
                .await
            })
        })
        .collect();

    for task in tasks {
        assert_eq!(task.await.unwrap(), Err("down".to_string()));
    }
    assert_eq!(executions.load(Ordering::SeqCst), 1);
    assert_eq!(memo.len(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_leader_hands_off_to_a_waiter() {
    let memo: Arc<AsyncMemoize<u32, u32>> = Arc::new(AsyncMemoize::builder().build());

    // The leader stalls long enough to be aborted mid-computation.
    let leader = {
        let memo = Arc::clone(&memo);
        tokio::spawn(async move {
            memo.call(&1, |_| async {
                tokio::time::sleep(Duration::from_secs(60)).await;
                0
            })
            .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    let waiter = {
        let memo = Arc::clone(&memo);
        tokio::spawn(async move { memo.call(&1, |n| async move { n + 100 }).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;

    leader.abort();
    let _ = leader.await;

    // The waiter takes over leadership and computes.
    assert_eq!(waiter.await.unwrap(), 101);
    assert_eq!(memo.len(), 1);
}

#[tokio::test]
async fn async_keygen_folds_equivalent_calls() {
    let calls = AtomicU32::new(0);
    let memo: AsyncMemoize<String, String> = AsyncMemoize::builder()
        .keygen_async(|path: &String| {
            async move {
                // Resolve e.g. a symlink or canonical form before keying.
                let canonical = path.trim_end_matches('/').to_string();
                let mut key = RawKey::new();
                key.push_part(format!("{canonical:?}"));
                key
            }
            .boxed()
        })
        .build_keyed();

    for path in ["/data/x", "/data/x/"] {
        let value = memo
            .call(&path.to_string(), |p| {
                calls.fetch_add(1, Ordering::Relaxed);
                let p = p.clone();
                async move { p.to_uppercase() }
            })
            .await;
        assert_eq!(value, path.to_uppercase());
    }
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(memo.len(), 1);
}

#[tokio::test]
async fn bounds_apply_to_async_engines() {
    let memo: AsyncMemoize<u32, u32> = AsyncMemoize::builder().size(2).build();
    for n in 0..3 {
        memo.call(&n, |n| {
            let n = *n;
            async move { n }
        })
        .await;
    }
    assert_eq!(memo.len(), 2);

    let memo: AsyncMemoize<u32, u32> = AsyncMemoize::builder()
        .duration(Duration::from_millis(20))
        .build();
    let calls = AtomicU32::new(0);
    for _ in 0..2 {
        memo.call(&1, |_| {
            calls.fetch_add(1, Ordering::Relaxed);
            async { 1 }
        })
        .await;
        tokio::time::sleep(Duration::from_millis(40)).await;
    }
    assert_eq!(calls.load(Ordering::Relaxed), 2);
}

#[tokio::test]
async fn async_memoized_wrapper_binds_one_callable() {
    let calls = Arc::new(AtomicU32::new(0));
    let counter = Arc::clone(&calls);
    let fetch = AsyncMemoized::new(move |id: &u64| {
        counter.fetch_add(1, Ordering::Relaxed);
        let id = *id;
        async move { format!("record-{id}") }.boxed()
    });

    assert_eq!(fetch.call(9).await, "record-9");
    assert_eq!(fetch.call(9).await, "record-9");
    assert_eq!(calls.load(Ordering::Relaxed), 1);
    assert_eq!(fetch.engine().len(), 1);

    fetch.engine().reset();
    assert!(fetch.engine().is_empty());
}
