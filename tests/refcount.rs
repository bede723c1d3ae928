use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use coopsync::refcount::{wait_refcount_container, RefCount, ReleaseFn, ReleasedCb};
use coopsync::{CContainer, Error};
use tokio_util::sync::CancellationToken;

fn root() -> Arc<CancellationToken> {
    Arc::new(CancellationToken::new())
}

#[tokio::test]
async fn resolves_while_referenced() {
    let resolve_count = Arc::new(AtomicUsize::new(0));
    let release_count = Arc::new(AtomicUsize::new(0));

    let resolver_resolves = resolve_count.clone();
    let resolver_releases = release_count.clone();
    let rc: RefCount<String> = RefCount::new(None, false, None, None, move |_ctx, _released| {
        let resolves = resolver_resolves.clone();
        let releases = resolver_releases.clone();
        async move {
            resolves.fetch_add(1, Ordering::SeqCst);
            let rel: ReleaseFn = Box::new(move || {
                releases.fetch_add(1, Ordering::SeqCst);
            });
            Ok(("hello".to_string(), Some(rel)))
        }
    });

    // A reference alone does not resolve; the context is still unset.
    let ref1 = rc.add_ref(None);
    tokio::task::yield_now().await;
    assert_eq!(resolve_count.load(Ordering::SeqCst), 0);

    let ctx = root();
    rc.set_context(Some(ctx.clone()));

    // Both references observe the same value.
    let (val, ref2) = rc.wait(&ctx).await.unwrap();
    assert_eq!(val, "hello");
    assert_eq!(resolve_count.load(Ordering::SeqCst), 1);
    assert_eq!(release_count.load(Ordering::SeqCst), 0);

    // Releasing one of two refs keeps the value alive.
    ref1.release();
    tokio::task::yield_now().await;
    assert_eq!(release_count.load(Ordering::SeqCst), 0);

    // Releasing the last ref releases the value exactly once.
    ref2.release();
    assert_eq!(release_count.load(Ordering::SeqCst), 1);
    ref2.release();
    assert_eq!(release_count.load(Ordering::SeqCst), 1);

    // A new ref re-invokes the resolver.
    let (val, ref3) = rc.wait(&ctx).await.unwrap();
    assert_eq!(val, "hello");
    assert_eq!(resolve_count.load(Ordering::SeqCst), 2);
    ref3.release();
}

#[tokio::test]
async fn released_callback_restarts_resolution() {
    let counter = Arc::new(AtomicUsize::new(0));
    let released_slot: Arc<Mutex<Option<ReleasedCb>>> = Arc::new(Mutex::new(None));

    let resolver_counter = counter.clone();
    let resolver_slot = released_slot.clone();
    let rc: RefCount<usize> = RefCount::new(None, false, None, None, move |_ctx, released| {
        let counter = resolver_counter.clone();
        let slot = resolver_slot.clone();
        async move {
            let val = counter.fetch_add(1, Ordering::SeqCst) + 1;
            *slot.lock().unwrap() = Some(released);
            Ok((val, None))
        }
    });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));

    let (v1, r) = rc.wait(&ctx).await.unwrap();
    assert_eq!(v1, 1);

    // The resolver flags its value as stale; resolution restarts while the
    // ref is still held.
    let released = released_slot.lock().unwrap().take().unwrap();
    released();

    let (v2, r2) = rc.wait(&ctx).await.unwrap();
    assert_eq!(v2, 2);
    r.release();
    r2.release();
}

#[tokio::test(start_paused = true)]
async fn keep_unreferenced_retains_value() {
    let resolve_count = Arc::new(AtomicUsize::new(0));
    let release_count = Arc::new(AtomicUsize::new(0));
    let released_slot: Arc<Mutex<Option<ReleasedCb>>> = Arc::new(Mutex::new(None));

    let resolver_resolves = resolve_count.clone();
    let resolver_releases = release_count.clone();
    let resolver_slot = released_slot.clone();
    let rc: RefCount<usize> = RefCount::new(None, true, None, None, move |_ctx, released| {
        let resolves = resolver_resolves.clone();
        let releases = resolver_releases.clone();
        let slot = resolver_slot.clone();
        async move {
            let val = resolves.fetch_add(1, Ordering::SeqCst) + 1;
            *slot.lock().unwrap() = Some(released);
            let rel: ReleaseFn = Box::new(move || {
                releases.fetch_add(1, Ordering::SeqCst);
            });
            Ok((val, Some(rel)))
        }
    });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));

    let (v1, r1) = rc.wait(&ctx).await.unwrap();
    assert_eq!(v1, 1);

    // All refs gone, but the successful value is kept.
    r1.release();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(release_count.load(Ordering::SeqCst), 0);

    // A later ref observes the existing value without re-resolving.
    let (v2, r2) = rc.wait(&ctx).await.unwrap();
    assert_eq!(v2, 1);
    assert_eq!(resolve_count.load(Ordering::SeqCst), 1);

    // The released callback tears the value down and re-resolves.
    let released = released_slot.lock().unwrap().take().unwrap();
    released();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(release_count.load(Ordering::SeqCst), 1);

    let (v3, r3) = rc.wait(&ctx).await.unwrap();
    assert_eq!(v3, 2);
    assert_eq!(resolve_count.load(Ordering::SeqCst), 2);
    r2.release();
    r3.release();
}

#[tokio::test(start_paused = true)]
async fn wait_with_released_signals_end_of_cycle() {
    let trigger = CancellationToken::new();
    let cycles = Arc::new(AtomicUsize::new(0));

    let resolver_trigger = trigger.clone();
    let resolver_cycles = cycles.clone();
    let rc: RefCount<bool> = RefCount::new(None, false, None, None, move |_ctx, released| {
        let trigger = resolver_trigger.clone();
        let first = resolver_cycles.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            // Only the first cycle arms the teardown trigger.
            if first {
                tokio::spawn(async move {
                    trigger.cancelled().await;
                    released();
                });
            }
            Ok((true, None))
        }
    });

    let released_called = Arc::new(AtomicBool::new(false));
    let observer = released_called.clone();
    let (promise, r) = rc.wait_with_released(move || {
        assert!(
            !observer.swap(true, Ordering::SeqCst),
            "released called multiple times"
        );
    });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));
    let val = promise.await_result(&ctx).await.unwrap();
    assert!(val);
    assert!(!released_called.load(Ordering::SeqCst));

    trigger.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(released_called.load(Ordering::SeqCst));
    r.release();
}

#[tokio::test(start_paused = true)]
async fn composes_as_resolver() {
    let trigger = CancellationToken::new();
    let cycles = Arc::new(AtomicUsize::new(0));

    let resolver_trigger = trigger.clone();
    let resolver_cycles = cycles.clone();
    let rc: RefCount<bool> = RefCount::new(None, false, None, None, move |_ctx, released| {
        let trigger = resolver_trigger.clone();
        let first = resolver_cycles.fetch_add(1, Ordering::SeqCst) == 0;
        async move {
            // Only the first cycle arms the teardown trigger.
            if first {
                tokio::spawn(async move {
                    trigger.cancelled().await;
                    released();
                });
            }
            Ok((true, None))
        }
    });

    let inner = rc.clone();
    let rc2: RefCount<bool> = RefCount::new(None, false, None, None, move |ctx, released| {
        let inner = inner.clone();
        async move { inner.resolve_with_released(&ctx, released).await }
    });

    let released_called = Arc::new(AtomicBool::new(false));
    let observer = released_called.clone();
    let (promise, r) = rc2.wait_with_released(move || {
        assert!(
            !observer.swap(true, Ordering::SeqCst),
            "released called multiple times"
        );
    });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));
    rc2.set_context(Some(ctx.clone()));

    let val = promise.await_result(&ctx).await.unwrap();
    assert!(val);
    assert!(!released_called.load(Ordering::SeqCst));

    // The inner teardown propagates out through the composed resolver.
    trigger.cancel();
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(released_called.load(Ordering::SeqCst));
    r.release();
}

#[tokio::test]
async fn mirrors_value_and_error() {
    let target: CContainer<Option<String>> = CContainer::new(None);
    let target_err: CContainer<Option<Error>> = CContainer::new(None);

    let rc: RefCount<String> = RefCount::new(
        None,
        false,
        Some(target.clone()),
        Some(target_err.clone()),
        |_ctx, _released| async { Ok(("mirrored".to_string(), None)) },
    );

    let ctx = root();
    rc.set_context(Some(ctx.clone()));
    let (val, r) = rc.wait(&ctx).await.unwrap();
    assert_eq!(val, "mirrored");

    let mirrored = wait_refcount_container(&ctx, &target, Some(&target_err))
        .await
        .unwrap();
    assert_eq!(mirrored, "mirrored");

    // Teardown clears the mirror.
    r.release();
    target.wait_value_empty(&ctx, None).await.unwrap();

    // Errors land in the error mirror and surface through the helper.
    let failure = Error::msg("resolve failed");
    let resolver_failure = failure.clone();
    let err_target: CContainer<Option<String>> = CContainer::new(None);
    let err_target_err: CContainer<Option<Error>> = CContainer::new(None);
    let failing: RefCount<String> = RefCount::new(
        Some(ctx.clone()),
        false,
        Some(err_target.clone()),
        Some(err_target_err.clone()),
        move |_ctx, _released| {
            let failure = resolver_failure.clone();
            async move { Err(failure) }
        },
    );
    let _r = failing.add_ref(None);
    let got = wait_refcount_container(&ctx, &err_target, Some(&err_target_err))
        .await
        .unwrap_err();
    assert_eq!(got, failure);
}

#[tokio::test]
async fn access_follows_value_changes() {
    let counter = Arc::new(AtomicUsize::new(0));
    let released_slot: Arc<Mutex<Option<ReleasedCb>>> = Arc::new(Mutex::new(None));

    let resolver_counter = counter.clone();
    let resolver_slot = released_slot.clone();
    let rc: RefCount<usize> = RefCount::new(None, false, None, None, move |_ctx, released| {
        let counter = resolver_counter.clone();
        let slot = resolver_slot.clone();
        async move {
            let val = counter.fetch_add(1, Ordering::SeqCst) + 1;
            *slot.lock().unwrap() = Some(released);
            Ok((val, None))
        }
    });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));

    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = seen.clone();
    rc.access(&ctx, false, move |_cb_ctx, val| {
        let seen = observer.clone();
        async move {
            seen.lock().unwrap().push(val);
            Ok(())
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn access_surfaces_callback_error() {
    let rc: RefCount<usize> =
        RefCount::new(None, false, None, None, |_ctx, _released| async {
            Ok((7usize, None))
        });

    let ctx = root();
    rc.set_context(Some(ctx.clone()));

    let failure = Error::msg("callback failed");
    let cb_failure = failure.clone();
    let got = rc
        .access(&ctx, false, move |_cb_ctx, _val| {
            let failure = cb_failure.clone();
            async move { Err(failure) }
        })
        .await
        .unwrap_err();
    assert_eq!(got, failure);
}

#[tokio::test]
async fn set_context_if_canceled_adopts_live_ctx() {
    let resolve_count = Arc::new(AtomicUsize::new(0));
    let resolver_resolves = resolve_count.clone();
    let rc: RefCount<usize> = RefCount::new(None, false, None, None, move |_ctx, _released| {
        let resolves = resolver_resolves.clone();
        async move { Ok((resolves.fetch_add(1, Ordering::SeqCst) + 1, None)) }
    });

    // use_ctx lets access adopt the caller's context.
    let ctx = root();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = seen.clone();
    rc.access(&ctx, true, move |_cb_ctx, val| {
        let seen = observer.clone();
        async move {
            seen.lock().unwrap().push(val);
            Ok(())
        }
    })
    .await
    .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec![1]);

    // A live context is not replaced.
    assert!(!rc.set_context_if_canceled(root()));
}
