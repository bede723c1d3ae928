use std::collections::HashSet;
use std::sync::atomic::{AtomicI32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use coopsync::backoff::{BackoffConfig, ExponentialConfig};
use coopsync::routine::{RoutineFn, RoutineRef};
use coopsync::{Error, Keyed, KeyedRefCount};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, PartialEq)]
struct TestData {
    value: String,
}

fn root() -> Arc<CancellationToken> {
    Arc::new(CancellationToken::new())
}

#[tokio::test]
async fn sync_keys_reconciles() {
    let (vals_tx, mut vals_rx) = mpsc::channel::<String>(128);
    let (stopped_tx, mut stopped_rx) = mpsc::channel::<String>(8);

    let k: Keyed<String, TestData> = Keyed::new(move |key: &String| {
        let key = key.clone();
        let vals_tx = vals_tx.clone();
        let stopped_tx = stopped_tx.clone();
        let routine_key = key.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let key = routine_key.clone();
                let vals_tx = vals_tx.clone();
                let stopped_tx = stopped_tx.clone();
                async move {
                    let _ = vals_tx.send(key.clone()).await;
                    ctx.cancelled().await;
                    let _ = stopped_tx.send(key).await;
                    Err(Error::Canceled)
                }
            }),
            TestData { value: key.clone() },
        )
    });

    let keys = vec!["a".to_string(), "b".to_string(), "c".to_string()];
    let (added, removed) = k.sync_keys(keys.clone(), false);
    assert_eq!(added, keys);
    assert!(removed.is_empty());

    // Nothing runs until a context is set.
    tokio::task::yield_now().await;
    assert!(vals_rx.try_recv().is_err());

    let ctx = root();
    k.set_context(Some(ctx.clone()), false);

    let mut seen = HashSet::new();
    while seen.len() < 3 {
        let val = vals_rx.recv().await.unwrap();
        assert!(seen.insert(val), "duplicate start");
    }

    // Dropping "c" cancels its routine.
    let (added, removed) = k.sync_keys(vec!["a".to_string(), "b".to_string()], false);
    assert!(added.is_empty());
    assert_eq!(removed, vec!["c".to_string()]);
    assert_eq!(stopped_rx.recv().await.unwrap(), "c");

    let mut live = k.get_keys();
    live.sort();
    assert_eq!(live, vec!["a".to_string(), "b".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn release_delay_defers_cancel() {
    let (started_tx, mut started_rx) = mpsc::channel::<()>(4);
    let (canceled_tx, mut canceled_rx) = mpsc::channel::<()>(4);

    let k: Keyed<String, TestData> = Keyed::builder(move |key: &String| {
        let started_tx = started_tx.clone();
        let canceled_tx = canceled_tx.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let started_tx = started_tx.clone();
                let canceled_tx = canceled_tx.clone();
                async move {
                    let _ = started_tx.send(()).await;
                    ctx.cancelled().await;
                    let _ = canceled_tx.send(()).await;
                    Ok(())
                }
            }),
            TestData { value: key.clone() },
        )
    })
    .release_delay(Duration::from_millis(180))
    .build();

    let ctx = root();
    k.set_context(Some(ctx.clone()), false);

    k.set_key("test".to_string(), true);
    started_rx.recv().await.unwrap();

    // Removed, but still running during the delay.
    assert!(k.remove_key(&"test".to_string()));
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(canceled_rx.try_recv().is_err());

    // The delay elapses and the routine is canceled.
    canceled_rx.recv().await.unwrap();

    // Second round: re-adding within the delay keeps the routine alive.
    k.set_key("test".to_string(), false);
    started_rx.recv().await.unwrap();
    assert!(k.remove_key(&"test".to_string()));
    k.set_key("test".to_string(), false);
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(canceled_rx.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn retry_with_backoff() {
    let (vals_tx, mut vals_rx) = mpsc::channel::<String>(4);
    let remaining = Arc::new(AtomicI32::new(5));
    let attempts = Arc::new(AtomicUsize::new(0));

    let ctor_remaining = remaining.clone();
    let ctor_attempts = attempts.clone();
    let k: Keyed<String, TestData> = Keyed::builder(move |key: &String| {
        let key = key.clone();
        let vals_tx = vals_tx.clone();
        let remaining = ctor_remaining.clone();
        let attempts = ctor_attempts.clone();
        let routine_key = key.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let key = routine_key.clone();
                let vals_tx = vals_tx.clone();
                let remaining = remaining.clone();
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    if remaining.fetch_sub(1, Ordering::SeqCst) > 0 {
                        return Err(Error::msg("returning error to test retry"));
                    }
                    tokio::select! {
                        _ = ctx.cancelled() => Err(Error::Canceled),
                        _ = vals_tx.send(key) => Ok(()),
                    }
                }
            }),
            TestData { value: key.clone() },
        )
    })
    .retry(BackoffConfig::exponential(ExponentialConfig {
        initial_interval: Duration::from_millis(200),
        max_interval: Duration::from_millis(1000),
        randomization_factor: 0.0,
        ..Default::default()
    }))
    .build();

    let ctx = root();
    k.set_context(Some(ctx.clone()), true);
    let before = tokio::time::Instant::now();
    let (_data, existed) = k.set_key("test-key".to_string(), true);
    assert!(!existed);

    assert_eq!(vals_rx.recv().await.unwrap(), "test-key");
    assert_eq!(attempts.load(Ordering::SeqCst), 6);

    // Five failures; delays 200, 360, 648, 1000 (capped), 1000 ms.
    let elapsed = before.elapsed();
    assert!(
        elapsed >= Duration::from_millis(3200),
        "retries completed too fast: {elapsed:?}"
    );
}

#[tokio::test]
async fn exit_callbacks_receive_error() {
    let (exit_tx, mut exit_rx) = mpsc::channel::<(String, Option<Error>)>(4);
    let failure = Error::msg("test error");

    let routine_failure = failure.clone();
    let k: Keyed<String, TestData> = Keyed::builder(move |key: &String| {
        let failure = routine_failure.clone();
        (
            RoutineFn::arc(move |_ctx: CancellationToken| {
                let failure = failure.clone();
                async move { Err(failure) }
            }),
            TestData { value: key.clone() },
        )
    })
    .exit_cb(Arc::new(
        move |key: &String, _routine: &RoutineRef, _data: &TestData, err: Option<&Error>| {
            let _ = exit_tx.try_send((key.clone(), err.cloned()));
        },
    ))
    .build();

    let ctx = root();
    k.set_context(Some(ctx.clone()), true);
    let (_data, existed) = k.set_key("test-key".to_string(), true);
    assert!(!existed);

    let (key, err) = exit_rx.recv().await.unwrap();
    assert_eq!(key, "test-key");
    assert_eq!(err.unwrap(), failure);
}

#[tokio::test]
async fn refcount_keeps_routine_alive() {
    let start_count = Arc::new(AtomicUsize::new(0));
    let stop_count = Arc::new(AtomicUsize::new(0));
    let (started_tx, mut started_rx) = mpsc::channel::<()>(8);
    let (stopped_tx, mut stopped_rx) = mpsc::channel::<()>(8);

    let ctor_start = start_count.clone();
    let ctor_stop = stop_count.clone();
    let k: KeyedRefCount<String, TestData> = KeyedRefCount::new(move |key: &String| {
        let start_count = ctor_start.clone();
        let stop_count = ctor_stop.clone();
        let started_tx = started_tx.clone();
        let stopped_tx = stopped_tx.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let start_count = start_count.clone();
                let stop_count = stop_count.clone();
                let started_tx = started_tx.clone();
                let stopped_tx = stopped_tx.clone();
                async move {
                    start_count.fetch_add(1, Ordering::SeqCst);
                    let _ = started_tx.send(()).await;
                    ctx.cancelled().await;
                    stop_count.fetch_add(1, Ordering::SeqCst);
                    let _ = stopped_tx.send(()).await;
                    Err(Error::Canceled)
                }
            }),
            TestData { value: key.clone() },
        )
    });

    let ctx = root();
    k.set_context(Some(ctx.clone()), false);

    let (ref1, data1, existed1) = k.add_key_ref("test-key".to_string());
    assert!(!existed1);
    assert_eq!(data1.value, "test-key");

    let (ref2, data2, existed2) = k.add_key_ref("test-key".to_string());
    assert!(existed2);
    assert_eq!(data2.value, "test-key");

    started_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 1);
    assert_eq!(stop_count.load(Ordering::SeqCst), 0);

    // One reference down: still running.
    ref1.release();
    tokio::task::yield_now().await;
    assert_eq!(start_count.load(Ordering::SeqCst), 1);
    assert_eq!(stop_count.load(Ordering::SeqCst), 0);

    // Last reference down: stopped.
    ref2.release();
    stopped_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 1);
    assert_eq!(stop_count.load(Ordering::SeqCst), 1);

    // A fresh reference restarts the routine.
    let (ref3, _data, _existed) = k.add_key_ref("test-key".to_string());
    started_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 2);

    // Removing the key directly stops it; releasing afterwards is a no-op.
    k.remove_key(&"test-key".to_string());
    stopped_rx.recv().await.unwrap();
    assert_eq!(stop_count.load(Ordering::SeqCst), 2);
    ref3.release();
    assert_eq!(start_count.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn restart_and_reset() {
    let start_count = Arc::new(AtomicUsize::new(0));
    let ctor_count = Arc::new(AtomicUsize::new(0));
    let (started_tx, mut started_rx) = mpsc::channel::<()>(16);

    let ctor_starts = start_count.clone();
    let ctor_counts = ctor_count.clone();
    let k: Keyed<String, TestData> = Keyed::new(move |key: &String| {
        let n = ctor_counts.fetch_add(1, Ordering::SeqCst) + 1;
        let start_count = ctor_starts.clone();
        let started_tx = started_tx.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let start_count = start_count.clone();
                let started_tx = started_tx.clone();
                async move {
                    start_count.fetch_add(1, Ordering::SeqCst);
                    let _ = started_tx.send(()).await;
                    ctx.cancelled().await;
                    Err(Error::Canceled)
                }
            }),
            TestData {
                value: format!("{key}-{n}"),
            },
        )
    });

    let ctx = root();
    k.set_context(Some(ctx.clone()), false);
    let key = "test-key".to_string();
    let (_data, existed) = k.set_key(key.clone(), true);
    assert!(!existed);
    started_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 1);
    assert_eq!(ctor_count.load(Ordering::SeqCst), 1);

    // Restart keeps the constructor result.
    let (existed, restarted) = k.restart_routine(&key, &[]);
    assert!(existed && restarted);
    started_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 2);
    assert_eq!(ctor_count.load(Ordering::SeqCst), 1);

    // Reset rebuilds routine and data.
    let (existed, reset) = k.reset_routine(&key, &[]);
    assert!(existed && reset);
    started_rx.recv().await.unwrap();
    assert_eq!(start_count.load(Ordering::SeqCst), 3);
    assert_eq!(ctor_count.load(Ordering::SeqCst), 2);
    assert_eq!(k.get_key(&key).unwrap().value, "test-key-2");

    // Conditional reset on (key, data).
    let (existed, reset) = k.reset_routine(
        &key,
        &[&|_k: &String, v: &TestData| v.value == "test-key-2"],
    );
    assert!(existed && reset);
    started_rx.recv().await.unwrap();
    assert_eq!(ctor_count.load(Ordering::SeqCst), 3);

    // Non-matching condition leaves the routine alone.
    let (existed, reset) = k.reset_routine(
        &key,
        &[&|_k: &String, v: &TestData| v.value == "does-not-match"],
    );
    assert!(existed);
    assert!(!reset);

    // Reset-all with no conditions resets the single key.
    let (reset_count, total) = k.reset_all_routines(&[]);
    assert_eq!((reset_count, total), (1, 1));
    started_rx.recv().await.unwrap();
    assert_eq!(ctor_count.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn context_cancellation_flows_to_exit_callbacks() {
    let (exit_tx, mut exit_rx) = mpsc::channel::<Option<Error>>(4);

    let k: Keyed<String, TestData> = Keyed::builder(move |key: &String| {
        (
            RoutineFn::arc(move |ctx: CancellationToken| async move {
                ctx.cancelled().await;
                Err(Error::Canceled)
            }),
            TestData { value: key.clone() },
        )
    })
    .exit_cb(Arc::new(
        move |_key: &String, _routine: &RoutineRef, _data: &TestData, err: Option<&Error>| {
            let _ = exit_tx.try_send(err.cloned());
        },
    ))
    .build();

    let cancelable = CancellationToken::new();
    let ctx = Arc::new(cancelable.clone());
    k.set_context(Some(ctx), false);
    let (_data, existed) = k.set_key("test-key".to_string(), true);
    assert!(!existed);

    // Root cancellation propagates to the routine.
    cancelable.cancel();
    let err = exit_rx.recv().await.unwrap();
    assert!(matches!(err, Some(Error::Canceled)));

    // A fresh context restarts the errored routine, and removal cancels it
    // again.
    let ctx2 = root();
    k.set_context(Some(ctx2), true);
    k.remove_key(&"test-key".to_string());
    let err = exit_rx.recv().await.unwrap();
    assert!(matches!(err, Some(Error::Canceled)));
}

#[tokio::test]
async fn get_keys_with_data_snapshots() {
    let k: Keyed<String, TestData> = Keyed::new(|key: &String| {
        (
            RoutineFn::arc(|ctx: CancellationToken| async move {
                ctx.cancelled().await;
                Ok(())
            }),
            TestData { value: key.clone() },
        )
    });

    k.set_key("a".to_string(), false);
    k.set_key("b".to_string(), false);

    let mut snapshot = k.get_keys_with_data();
    snapshot.sort_by(|x, y| x.key.cmp(&y.key));
    assert_eq!(snapshot.len(), 2);
    assert_eq!(snapshot[0].key, "a");
    assert_eq!(snapshot[0].data.value, "a");
    assert!(k.get_key(&"missing".to_string()).is_none());
}
