//! Simulation helpers for exercising the mutex against slow or misbehaving
//! lease stores, plus an instrumented workload for observing leadership from
//! the outside.

use crate::{
    error::Result,
    store::{AcquireOutcome, LeaseStore, LeaseToken},
    LeaseKey,
};
use anyhow::anyhow;
use async_trait::async_trait;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};
use tokio::{
    sync::watch,
    time::{sleep, Instant},
};
use tokio_util::sync::CancellationToken;

/// Wraps a real [`LeaseStore`] with injectable RPC latency and switchable
/// failure modes, and records enough about each call to assert on release
/// counts and renewal cadence.
#[derive(Debug)]
pub struct FaultStore {
    inner: Arc<dyn LeaseStore>,
    latency: Duration,
    fail_acquires: AtomicBool,
    fail_renews: AtomicBool,
    panic_renews: AtomicBool,
    fail_releases: AtomicBool,
    acquire_attempts: AtomicUsize,
    renew_log: Mutex<Vec<(LeaseToken, Instant)>>,
    release_counts: Mutex<HashMap<LeaseToken, usize>>,
}

impl FaultStore {
    pub fn new(inner: Arc<dyn LeaseStore>) -> Self {
        Self::with_latency(inner, Duration::ZERO)
    }

    /// Every store call sleeps for `latency` before hitting the inner store.
    pub fn with_latency(inner: Arc<dyn LeaseStore>, latency: Duration) -> Self {
        Self {
            inner,
            latency,
            fail_acquires: AtomicBool::new(false),
            fail_renews: AtomicBool::new(false),
            panic_renews: AtomicBool::new(false),
            fail_releases: AtomicBool::new(false),
            acquire_attempts: AtomicUsize::new(0),
            renew_log: Mutex::new(Vec::new()),
            release_counts: Mutex::new(HashMap::new()),
        }
    }

    /// Make every acquisition fail with a transient store error.
    pub fn fail_acquires(&self, fail: bool) {
        self.fail_acquires.store(fail, Ordering::SeqCst);
    }

    /// Make every renewal fail, simulating lease loss or a partition.
    pub fn fail_renews(&self, fail: bool) {
        self.fail_renews.store(fail, Ordering::SeqCst);
    }

    /// Make every renewal panic instead of returning, simulating a crashed
    /// renewal task.
    pub fn panic_renews(&self, panic: bool) {
        self.panic_renews.store(panic, Ordering::SeqCst);
    }

    /// Make every release fail. The mutex must shrug this off.
    pub fn fail_releases(&self, fail: bool) {
        self.fail_releases.store(fail, Ordering::SeqCst);
    }

    pub fn acquire_attempts(&self) -> usize {
        self.acquire_attempts.load(Ordering::SeqCst)
    }

    /// Instants at which renewal calls arrived, per token, in call order.
    pub fn renew_log(&self) -> Vec<(LeaseToken, Instant)> {
        self.renew_log.lock().clone()
    }

    /// How many release calls each token has received.
    pub fn release_counts(&self) -> HashMap<LeaseToken, usize> {
        self.release_counts.lock().clone()
    }
}

#[async_trait]
impl LeaseStore for FaultStore {
    async fn acquire(&self, key: &LeaseKey, duration: Duration) -> Result<AcquireOutcome> {
        self.acquire_attempts.fetch_add(1, Ordering::SeqCst);
        sleep(self.latency).await;
        if self.fail_acquires.load(Ordering::SeqCst) {
            return Err(anyhow!("injected acquire failure").into());
        }
        self.inner.acquire(key, duration).await
    }

    async fn renew(&self, key: &LeaseKey, token: &LeaseToken, duration: Duration) -> Result<()> {
        self.renew_log.lock().push((*token, Instant::now()));
        sleep(self.latency).await;
        if self.panic_renews.load(Ordering::SeqCst) {
            panic!("injected renew panic");
        }
        if self.fail_renews.load(Ordering::SeqCst) {
            return Err(anyhow!("injected renew failure").into());
        }
        self.inner.renew(key, token, duration).await
    }

    async fn release(&self, key: &LeaseKey, token: &LeaseToken) -> Result<()> {
        *self.release_counts.lock().entry(*token).or_insert(0) += 1;
        sleep(self.latency).await;
        if self.fail_releases.load(Ordering::SeqCst) {
            return Err(anyhow!("injected release failure").into());
        }
        self.inner.release(key, token).await
    }

    async fn create_if_missing(&self, key: &LeaseKey) -> Result<()> {
        sleep(self.latency).await;
        self.inner.create_if_missing(key).await
    }
}

/// Observable workload: reports over a watch channel when it starts running
/// and when it stops, and otherwise just parks until cancelled.
#[derive(Debug, Clone)]
pub struct WorkloadProbe {
    tx: Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl WorkloadProbe {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: Arc::new(tx),
            rx,
        }
    }

    /// Whether the workload is running right now.
    pub fn running(&self) -> bool {
        *self.rx.borrow()
    }

    pub async fn wait_running(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|running| *running).await;
    }

    pub async fn wait_stopped(&self) {
        let mut rx = self.rx.clone();
        let _ = rx.wait_for(|running| !running).await;
    }

    /// The workload closure to hand to `DistributedMutex::new`.
    pub fn workload(
        &self,
    ) -> impl Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync + 'static {
        let tx = self.tx.clone();
        move |scope: CancellationToken| {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(true);
                scope.cancelled().await;
                let _ = tx.send(false);
                Ok(())
            }) as BoxFuture<'static, Result<()>>
        }
    }
}

impl Default for WorkloadProbe {
    fn default() -> Self {
        Self::new()
    }
}
