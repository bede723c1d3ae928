//! # Example: keyed_supervisor
//!
//! Supervise a dynamic set of workers keyed by name.
//!
//! Demonstrates how to:
//! - Build a `Keyed` whose constructor produces one routine per key.
//! - Reconcile the live set with `sync_keys` as the desired set changes.
//! - Retry failing workers with an exponential backoff.
//!
//! ## Run
//! ```bash
//! cargo run --example keyed_supervisor
//! ```

use std::sync::Arc;
use std::time::Duration;

use coopsync::backoff::{BackoffConfig, ExponentialConfig};
use coopsync::routine::RoutineFn;
use coopsync::{Error, Keyed};
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let keyed: Keyed<String, ()> = Keyed::builder(|key: &String| {
        let key = key.clone();
        (
            RoutineFn::arc(move |ctx: CancellationToken| {
                let key = key.clone();
                async move {
                    println!("[{key}] worker started");
                    if key == "flaky" {
                        // Fails once, then the backoff brings it back.
                        return Err(Error::msg("flaky worker crashed"));
                    }
                    ctx.cancelled().await;
                    println!("[{key}] worker stopped");
                    Ok(())
                }
            }),
            (),
        )
    })
    .retry(BackoffConfig::exponential(ExponentialConfig {
        initial_interval: Duration::from_millis(100),
        ..Default::default()
    }))
    .build();

    // Workers start once a root context is installed.
    let root = Arc::new(CancellationToken::new());
    keyed.set_context(Some(root.clone()), false);

    let (added, _removed) = keyed.sync_keys(
        vec!["alpha".to_string(), "beta".to_string(), "flaky".to_string()],
        false,
    );
    println!("added: {added:?}");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Shrink the set: "beta" is canceled.
    let (_added, removed) = keyed.sync_keys(vec!["alpha".to_string(), "flaky".to_string()], false);
    println!("removed: {removed:?}");
    tokio::time::sleep(Duration::from_millis(300)).await;

    // Shut everything down.
    root.cancel();
    keyed.clear_context();
    tokio::time::sleep(Duration::from_millis(50)).await;
    Ok(())
}
