//! # Example: watch_value
//!
//! Observe a concurrent container from several waiters.
//!
//! Demonstrates how to:
//! - Share a `CContainer` between a producer and observers.
//! - Block on `wait_value` / `wait_value_change` until a predicate holds.
//! - Use `wait_value_empty` to observe teardown.
//!
//! ## Run
//! ```bash
//! cargo run --example watch_value
//! ```

use std::time::Duration;

use coopsync::CContainer;
use tokio_util::sync::CancellationToken;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let ctx = CancellationToken::new();
    let config: CContainer<Option<String>> = CContainer::new(None);

    // Observer 1: waits for the first non-empty value.
    let first = {
        let config = config.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            let val = config.wait_value(&ctx, None).await?;
            println!("[observer-1] first value: {val:?}");
            Ok::<_, coopsync::Error>(val)
        })
    };

    // Producer: publish the first version.
    config.set_value(Some("v1".to_string()));

    // Observer 2: waits for the value to move past the current snapshot.
    let second = {
        let config = config.clone();
        let ctx = ctx.clone();
        let old = config.get_value();
        tokio::spawn(async move {
            let val = config.wait_value_change(&ctx, &old, None).await?;
            println!("[observer-2] changed away from {old:?}: {val:?}");
            Ok::<_, coopsync::Error>(val)
        })
    };

    tokio::time::sleep(Duration::from_millis(50)).await;
    config.set_value(Some("v2".to_string()));

    first.await??;
    second.await??;

    config.set_value(None);
    config.wait_value_empty(&ctx, None).await?;
    println!("[producer] container cleared");
    Ok(())
}
