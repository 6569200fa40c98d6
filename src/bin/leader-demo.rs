//! Console worker demonstrating lease-based leader election.
//!
//! Starts a few competing mutex instances against one shared in-memory
//! store. Exactly one of them logs leader heartbeats at a time; the rest
//! log that they could not acquire the lease. Ctrl-C shuts everything down
//! and releases the lease.

use std::{sync::Arc, time::Duration};

use lease_mutex::{DistributedMutex, InMemoryLeaseStore, LeaseKey, LeaseStore, MutexSettings};
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let store: Arc<dyn LeaseStore> = Arc::new(InMemoryLeaseStore::new());
    let shutdown = CancellationToken::new();

    // Short intervals so handoffs are visible within seconds.
    let settings = MutexSettings {
        lease_duration: Duration::from_secs(6),
        renew_interval: Duration::from_secs(2),
        acquire_retry_interval: Duration::from_secs(3),
        ..MutexSettings::default()
    };

    let mut workers = Vec::new();
    for worker in 0..3u32 {
        let mutex = DistributedMutex::new(
            store.clone(),
            LeaseKey::new("leader"),
            settings.clone(),
            move |scope| async move {
                let mut ticker = tokio::time::interval(Duration::from_secs(2));
                loop {
                    tokio::select! {
                        () = scope.cancelled() => {
                            info!(worker, "no longer the leader");
                            return Ok(());
                        }
                        _ = ticker.tick() => {
                            info!(worker, "this worker is currently the leader");
                        }
                    }
                }
            },
        )?
        .on_acquire_failed(move || {
            info!(worker, "could not acquire lease, retrying");
        });

        let shutdown = shutdown.clone();
        workers.push(tokio::spawn(async move { mutex.run(shutdown).await }));
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");
    shutdown.cancel();
    for worker in workers {
        let _ = worker.await;
    }
    Ok(())
}
