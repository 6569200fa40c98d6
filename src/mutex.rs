use crate::{
    error::Result,
    manager::LeaseManager,
    store::{LeaseStore, LeaseToken},
    Error, LeaseKey,
};
use futures::future::BoxFuture;
use std::{future::Future, sync::Arc, time::Duration};
use tokio::{
    task::JoinError,
    time::{sleep, timeout, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

pub const DEFAULT_LEASE_DURATION: Duration = Duration::from_secs(60);
pub const DEFAULT_RENEW_INTERVAL: Duration = Duration::from_secs(10);
pub const DEFAULT_ACQUIRE_RETRY_INTERVAL: Duration = Duration::from_secs(20);
pub const DEFAULT_RELEASE_GRACE: Duration = Duration::from_secs(5);

/// Timing knobs for [`DistributedMutex`].
///
/// The renew interval must stay well below the lease duration so that one
/// slow or missed renewal does not let the lease expire under a healthy
/// holder.
#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
#[serde(default)]
pub struct MutexSettings {
    /// How long each acquisition or renewal keeps the lease valid.
    pub lease_duration: Duration,
    /// Target cadence between renewal attempts while holding.
    pub renew_interval: Duration,
    /// Wait between failed acquisition attempts.
    pub acquire_retry_interval: Duration,
    /// How long to wait for a cancelled activity to finish before abandoning
    /// it and moving on to release.
    pub release_grace: Duration,
}

impl Default for MutexSettings {
    fn default() -> Self {
        Self {
            lease_duration: DEFAULT_LEASE_DURATION,
            renew_interval: DEFAULT_RENEW_INTERVAL,
            acquire_retry_interval: DEFAULT_ACQUIRE_RETRY_INTERVAL,
            release_grace: DEFAULT_RELEASE_GRACE,
        }
    }
}

impl MutexSettings {
    pub fn validate(&self) -> Result<()> {
        if self.lease_duration.is_zero()
            || self.renew_interval.is_zero()
            || self.acquire_retry_interval.is_zero()
        {
            return Err(Error::InvalidSettings(
                "durations must be non-zero".to_string(),
            ));
        }
        if self.renew_interval >= self.lease_duration {
            return Err(Error::InvalidSettings(format!(
                "renew interval {:?} must be smaller than lease duration {:?}",
                self.renew_interval, self.lease_duration
            )));
        }
        Ok(())
    }
}

type WorkloadFn = dyn Fn(CancellationToken) -> BoxFuture<'static, Result<()>> + Send + Sync;
type NotifyFn = dyn Fn() + Send + Sync;

/// Lease-based distributed mutex.
///
/// [`run`](DistributedMutex::run) loops until the shutdown token fires:
/// acquire the lease (retrying on a fixed interval while someone else holds
/// it), then run the workload and a renewal loop side by side under one
/// cancellation scope. Whichever of the two ends first cancels the other;
/// the lease is then released and the loop starts over.
pub struct DistributedMutex {
    manager: LeaseManager,
    settings: MutexSettings,
    workload: Arc<WorkloadFn>,
    on_acquire_failed: Option<Arc<NotifyFn>>,
}

impl std::fmt::Debug for DistributedMutex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DistributedMutex")
            .field("key", self.manager.key())
            .field("settings", &self.settings)
            .finish_non_exhaustive()
    }
}

impl DistributedMutex {
    /// Build a mutex over `store` for `key`.
    ///
    /// `workload` runs only while the lease is held and must treat
    /// cancellation of its token as "no longer the leader, stop now".
    pub fn new<F, Fut>(
        store: Arc<dyn LeaseStore>,
        key: LeaseKey,
        settings: MutexSettings,
        workload: F,
    ) -> Result<Self>
    where
        F: Fn(CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        settings.validate()?;
        let manager = LeaseManager::new(store, key, settings.lease_duration);
        Ok(Self {
            manager,
            settings,
            workload: Arc::new(move |scope: CancellationToken| -> BoxFuture<'static, Result<()>> {
                Box::pin(workload(scope))
            }),
            on_acquire_failed: None,
        })
    }

    /// Install a callback invoked each time an acquisition attempt fails,
    /// e.g. for an operator-visible "could not acquire, retrying" line.
    #[must_use]
    pub fn on_acquire_failed<F>(mut self, notify: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        self.on_acquire_failed = Some(Arc::new(notify));
        self
    }

    /// Supervisory loop. Returns only after `shutdown` has fired and any
    /// in-flight holding period has been torn down and released.
    pub async fn run(&self, shutdown: CancellationToken) {
        while !shutdown.is_cancelled() {
            if let Some(token) = self.try_acquire_or_wait(&shutdown).await {
                self.hold(token, &shutdown).await;
            }
        }
        debug!(key = %self.manager.key(), "distributed mutex stopped");
    }

    /// One pass through the `Acquiring` state: a single acquisition attempt,
    /// then (on failure) the retry wait, cut short by shutdown. Transient
    /// store errors are deliberately handled like a plain conflict.
    async fn try_acquire_or_wait(&self, shutdown: &CancellationToken) -> Option<LeaseToken> {
        match self.manager.try_acquire().await {
            Ok(Some(token)) => return Some(token),
            Ok(None) => {}
            Err(err) => {
                debug!(key = %self.manager.key(), %err, "acquisition attempt failed");
            }
        }

        if let Some(notify) = &self.on_acquire_failed {
            notify();
        }
        tokio::select! {
            () = shutdown.cancelled() => {}
            () = sleep(self.settings.acquire_retry_interval) => {}
        }
        None
    }

    /// One holding period: run the workload and the renewal loop under a
    /// cancellation scope derived from `shutdown`, then release the lease.
    async fn hold(&self, token: LeaseToken, shutdown: &CancellationToken) {
        info!(key = %self.manager.key(), "lease acquired, starting workload");
        let scope = shutdown.child_token();
        // If this future itself is dropped mid-hold, the children still get
        // cancelled.
        let _scope_guard = scope.clone().drop_guard();

        let mut workload = tokio::spawn((self.workload)(scope.clone()));
        let mut renewal = tokio::spawn(Self::keep_renewing(
            self.manager.clone(),
            token,
            self.settings.renew_interval,
            scope.clone(),
        ));

        // Whichever activity ends first ends the holding period for both.
        tokio::select! {
            outcome = &mut workload => {
                Self::observe_workload(outcome);
                scope.cancel();
                match timeout(self.settings.release_grace, &mut renewal).await {
                    Ok(outcome) => Self::observe_renewal(outcome),
                    Err(_) => {
                        warn!(key = %self.manager.key(), "renewal loop ignored cancellation, aborting it");
                        renewal.abort();
                    }
                }
            }
            outcome = &mut renewal => {
                Self::observe_renewal(outcome);
                scope.cancel();
                match timeout(self.settings.release_grace, &mut workload).await {
                    Ok(outcome) => Self::observe_workload(outcome),
                    Err(_) => {
                        warn!(
                            key = %self.manager.key(),
                            grace = ?self.settings.release_grace,
                            "workload ignored cancellation, aborting it",
                        );
                        workload.abort();
                    }
                }
            }
        }

        self.manager.release(&token).await;
        info!(key = %self.manager.key(), "holding period ended");
    }

    /// Renewal loop. Renews immediately on entry (the time already spent
    /// acquiring is unknown), then at a steady cadence: the sleep is the
    /// interval minus the time the renewal call itself took, clamped at
    /// zero so an over-long call renews again right away.
    async fn keep_renewing(
        manager: LeaseManager,
        token: LeaseToken,
        interval: Duration,
        scope: CancellationToken,
    ) {
        while !scope.is_cancelled() {
            let started = Instant::now();
            if !manager.renew(&token).await {
                info!(key = %manager.key(), "lease lost, ending holding period");
                scope.cancel();
                return;
            }

            let wait = interval.saturating_sub(started.elapsed());
            tokio::select! {
                () = scope.cancelled() => return,
                () = sleep(wait) => {}
            }
        }
    }

    /// The renewal loop only ever returns unit, so the only interesting join
    /// outcome is a panic.
    fn observe_renewal(outcome: std::result::Result<(), JoinError>) {
        if let Err(err) = outcome {
            if !err.is_cancelled() {
                error!(%err, "renewal loop panicked");
            }
        }
    }

    /// A workload ending by cancellation is routine; anything else that is
    /// not a clean finish gets logged and the supervisory loop carries on.
    fn observe_workload(outcome: std::result::Result<Result<()>, JoinError>) {
        match outcome {
            Ok(Ok(())) => debug!("workload finished"),
            Ok(Err(err)) => error!(%err, "workload failed"),
            Err(err) if err.is_cancelled() => {}
            Err(err) => error!(%err, "workload panicked"),
        }
    }
}
