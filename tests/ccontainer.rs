use std::sync::Arc;
use std::time::Duration;

use coopsync::{CContainer, Error, Watchable};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn wait_and_set() {
    let c: CContainer<Option<i64>> = CContainer::new(None);
    let ctx = CancellationToken::new();

    let waiter = c.clone();
    let waiter_ctx = ctx.clone();
    let task = tokio::spawn(async move { waiter.wait_value(&waiter_ctx, None).await });

    c.set_value(Some(5));
    assert_eq!(task.await.unwrap().unwrap(), Some(5));
    assert_eq!(c.get_value(), Some(5));
}

#[tokio::test(start_paused = true)]
async fn set_equal_value_does_not_wake() {
    let c: CContainer<Option<u32>> = CContainer::new(Some(1));
    let ctx = CancellationToken::new();

    let waiter = c.clone();
    let waiter_ctx = ctx.clone();
    let task =
        tokio::spawn(async move { waiter.wait_value_change(&waiter_ctx, &Some(1), None).await });

    // Unchanged value: the waiter must stay parked.
    c.set_value(Some(1));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!task.is_finished());

    c.set_value(Some(2));
    assert_eq!(task.await.unwrap().unwrap(), Some(2));
}

#[tokio::test]
async fn custom_equality_suppresses_change() {
    // Values compare equal modulo 10.
    let c: CContainer<u32> =
        CContainer::new_with_equal(3, Arc::new(|a: &u32, b: &u32| a % 10 == b % 10));
    c.set_value(13);
    assert_eq!(c.get_value(), 3);

    c.set_value(4);
    assert_eq!(c.get_value(), 4);
}

#[tokio::test]
async fn swap_value_stores_result() {
    let c: CContainer<u32> = CContainer::new(1);
    let out = c.swap_value(|v| v + 10);
    assert_eq!(out, 11);
    assert_eq!(c.get_value(), 11);
}

#[tokio::test]
async fn wait_value_empty_observes_clear() {
    let c: CContainer<Option<&'static str>> = CContainer::new(Some("x"));
    let ctx = CancellationToken::new();

    let waiter = c.clone();
    let waiter_ctx = ctx.clone();
    let task = tokio::spawn(async move { waiter.wait_value_empty(&waiter_ctx, None).await });

    c.set_value(None);
    task.await.unwrap().unwrap();
}

#[tokio::test]
async fn error_channel_interrupts_wait() {
    let c: CContainer<Option<u32>> = CContainer::new(None);
    let ctx = CancellationToken::new();
    let (tx, mut rx) = mpsc::channel::<Error>(1);

    let failure = Error::msg("backend failed");
    tx.send(failure.clone()).await.unwrap();
    let res = c.wait_value(&ctx, Some(&mut rx)).await;
    assert_eq!(res.unwrap_err(), failure);

    // A closed channel reads as cancellation.
    drop(tx);
    let res = c.wait_value(&ctx, Some(&mut rx)).await;
    assert!(matches!(res, Err(Error::Canceled)));
}

#[tokio::test]
async fn validator_error_surfaces() {
    let c: CContainer<u32> = CContainer::new(7);
    let ctx = CancellationToken::new();
    let boom = Error::msg("bad value");
    let got = c
        .wait_value_with_validator(&ctx, |_v| Err(boom.clone()), None)
        .await;
    assert_eq!(got.unwrap_err(), boom);
}

#[tokio::test]
async fn watchable_view() {
    let c: CContainer<Option<u32>> = CContainer::new(Some(9));
    let w: Arc<dyn Watchable<Option<u32>>> = c.as_watchable();
    assert_eq!(w.get_value(), Some(9));

    let ctx = CancellationToken::new();
    let got = w.wait_value(&ctx, None).await.unwrap();
    assert_eq!(got, Some(9));
}
