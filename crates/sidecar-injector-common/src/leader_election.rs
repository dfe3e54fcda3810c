//! Leader election using Kubernetes Leases
//!
//! Only one controller replica reconciles at a time. Replicas race for a
//! coordination.k8s.io/v1 Lease; the holder renews it in the background and
//! everyone else polls until it expires or is released.
//!
//! # Atomicity
//!
//! Every write carries the resourceVersion that was read. If the lease changed
//! in between, the write fails with 409 Conflict and the attempt counts as
//! lost, so two replicas can never both believe they hold the lease.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, PostParams};
use kube::Client;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default lease name for the sidecar injector controller
pub const DEFAULT_LEASE_NAME: &str = "sidecar-injector";

const LEASE_DURATION: Duration = Duration::from_secs(60);
const RENEW_DEADLINE: Duration = Duration::from_secs(15);
const RETRY_PERIOD: Duration = Duration::from_secs(5);

/// Leader election errors
#[derive(Debug, Error)]
pub enum LeaderElectionError {
    /// Kubernetes API error
    #[error("kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The stored lease is malformed
    #[error("invalid lease {name}: {message}")]
    InvalidLease {
        /// Lease name
        name: String,
        /// What is wrong with it
        message: String,
    },

    /// Leadership was lost while running exclusive work
    #[error("leadership lost for lease {0}")]
    LeadershipLost(String),
}

/// Timing of the election
#[derive(Clone, Debug)]
pub struct LeaderElectionConfig {
    /// How long a lease is valid without renewal
    pub lease_duration: Duration,
    /// How long the holder keeps trying to renew before giving up
    pub renew_deadline: Duration,
    /// Interval between acquisition and renewal attempts
    pub retry_period: Duration,
}

impl Default for LeaderElectionConfig {
    fn default() -> Self {
        Self {
            lease_duration: LEASE_DURATION,
            renew_deadline: RENEW_DEADLINE,
            retry_period: RETRY_PERIOD,
        }
    }
}

/// Storage for a single named Lease.
///
/// `create` and `replace` return `Ok(false)` on a write conflict.
#[async_trait]
pub trait LeaseClient: Send + Sync {
    /// Read the lease, `None` if it does not exist
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError>;
    /// Create the lease
    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError>;
    /// Replace the lease, guarded by its resourceVersion
    async fn replace(&self, name: &str, lease: &Lease) -> Result<bool, LeaderElectionError>;
}

/// [`LeaseClient`] backed by the Kubernetes API
pub struct KubeLeaseClient {
    api: Api<Lease>,
}

impl KubeLeaseClient {
    /// Leases in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
        }
    }
}

#[async_trait]
impl LeaseClient for KubeLeaseClient {
    async fn get(&self, name: &str) -> Result<Option<Lease>, LeaderElectionError> {
        Ok(crate::kube_utils::not_found_as_none(self.api.get(name).await)?)
    }

    async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api.create(&PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn replace(&self, name: &str, lease: &Lease) -> Result<bool, LeaderElectionError> {
        match self.api.replace(name, &PostParams::default(), lease).await {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(false),
            Err(e) => Err(e.into()),
        }
    }
}

/// Leader elector over a single Lease
pub struct LeaderElector {
    leases: Arc<dyn LeaseClient>,
    lease_name: String,
    identity: String,
    config: LeaderElectionConfig,
    is_leader: Arc<AtomicBool>,
}

impl LeaderElector {
    /// Create an elector with default timing (60s lease, 15s renew deadline, 5s retry)
    pub fn new(leases: Arc<dyn LeaseClient>, lease_name: &str, identity: &str) -> Self {
        Self::with_config(leases, lease_name, identity, LeaderElectionConfig::default())
    }

    /// Create an elector with custom timing
    pub fn with_config(
        leases: Arc<dyn LeaseClient>,
        lease_name: &str,
        identity: &str,
        config: LeaderElectionConfig,
    ) -> Self {
        Self {
            leases,
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            config,
            is_leader: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Identity this elector competes as
    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Whether this elector currently holds the lease
    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::SeqCst)
    }

    /// Run `on_acquire` while holding the lease.
    ///
    /// Blocks until the lease is acquired, then runs `on_acquire` exactly once
    /// with a token that is cancelled on shutdown. When `on_acquire` returns
    /// the lease is released so a standby can take over immediately.
    ///
    /// Losing the lease cancels the work and returns
    /// [`LeaderElectionError::LeadershipLost`]; callers must treat that as
    /// fatal and exit. Returns `Ok(())` without running anything if `shutdown`
    /// fires before the lease is acquired.
    pub async fn run_exclusive<F, Fut>(
        self: Arc<Self>,
        shutdown: CancellationToken,
        on_acquire: F,
    ) -> Result<(), LeaderElectionError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = ()>,
    {
        let mut guard = tokio::select! {
            _ = shutdown.cancelled() => {
                info!(identity = %self.identity, "Shutdown before leadership was acquired");
                return Ok(());
            }
            guard = Arc::clone(&self).acquire() => guard,
        };

        let work = shutdown.child_token();
        let task = on_acquire(work.clone());
        tokio::pin!(task);

        tokio::select! {
            _ = &mut task => {
                if let Err(e) = guard.release_leadership().await {
                    warn!(identity = %self.identity, error = %e, "Failed to release lease");
                }
                Ok(())
            }
            _ = guard.lost() => {
                work.cancel();
                error!(identity = %self.identity, lease = %self.lease_name, "Leadership lost");
                Err(LeaderElectionError::LeadershipLost(self.lease_name.clone()))
            }
        }
    }

    /// Block until leadership is acquired, then return a guard that keeps
    /// renewing the lease in the background.
    pub async fn acquire(self: Arc<Self>) -> LeaderGuard {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership..."
        );

        loop {
            match self.try_acquire_or_renew().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    self.is_leader.store(true, Ordering::SeqCst);
                    return self.create_guard();
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_ms = self.config.retry_period.as_millis() as u64,
                        "Lease held by another, waiting..."
                    );
                }
                Err(e) => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        "Failed to acquire lease, retrying..."
                    );
                }
            }
            tokio::time::sleep(self.config.retry_period).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            elector: Arc::clone(self),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Acquire, renew or take over the lease in one compare-and-swap step
    async fn try_acquire_or_renew(&self) -> Result<bool, LeaderElectionError> {
        let now = Utc::now();

        let Some(lease) = self.leases.get(&self.lease_name).await? else {
            return self.create_lease(now).await;
        };

        let spec = lease.spec.as_ref();
        let holder = spec
            .and_then(|s| s.holder_identity.as_deref())
            .filter(|h| !h.is_empty());

        if holder == Some(self.identity.as_str()) {
            return self.renew_lease(&lease, now).await;
        }

        let renew_time = spec.and_then(|s| s.renew_time.as_ref());
        let duration_secs = spec.and_then(|s| s.lease_duration_seconds);
        let is_expired = match (holder, renew_time, duration_secs) {
            (None, _, _) => true,
            (Some(_), Some(rt), Some(duration)) => {
                now > rt.0 + chrono::Duration::seconds(duration as i64)
            }
            _ => true,
        };

        if is_expired {
            let transitions = spec.and_then(|s| s.lease_transitions).unwrap_or(0);
            self.take_over_lease(&lease, now, transitions).await
        } else {
            Ok(false)
        }
    }

    fn lease_spec(&self, now: chrono::DateTime<Utc>, transitions: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some(self.identity.clone()),
            lease_duration_seconds: Some(self.config.lease_duration.as_secs().max(1) as i32),
            acquire_time: Some(MicroTime(now)),
            renew_time: Some(MicroTime(now)),
            lease_transitions: Some(transitions),
            ..Default::default()
        }
    }

    async fn create_lease(&self, now: chrono::DateTime<Utc>) -> Result<bool, LeaderElectionError> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, 0)),
        };

        let created = self.leases.create(&lease).await?;
        if created {
            info!(identity = %self.identity, "Created new lease");
        } else {
            debug!(identity = %self.identity, "Lease creation conflict, will retry");
        }
        Ok(created)
    }

    async fn renew_lease(
        &self,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
    ) -> Result<bool, LeaderElectionError> {
        self.require_resource_version(existing)?;

        let mut updated = existing.clone();
        if let Some(ref mut spec) = updated.spec {
            spec.renew_time = Some(MicroTime(now));
        }

        let renewed = self.leases.replace(&self.lease_name, &updated).await?;
        if renewed {
            debug!(identity = %self.identity, "Lease renewed");
        } else {
            warn!(identity = %self.identity, "Lease renewal conflict - lost leadership");
        }
        Ok(renewed)
    }

    async fn take_over_lease(
        &self,
        existing: &Lease,
        now: chrono::DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool, LeaderElectionError> {
        let rv = self.require_resource_version(existing)?;

        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: existing.metadata.namespace.clone(),
                resource_version: Some(rv),
                ..Default::default()
            },
            spec: Some(self.lease_spec(now, transitions + 1)),
        };

        let taken = self.leases.replace(&self.lease_name, &lease).await?;
        if taken {
            info!(
                identity = %self.identity,
                transitions = transitions + 1,
                "Took over expired lease"
            );
        } else {
            debug!(identity = %self.identity, "Lease takeover conflict, will retry");
        }
        Ok(taken)
    }

    fn require_resource_version(&self, lease: &Lease) -> Result<String, LeaderElectionError> {
        lease
            .metadata
            .resource_version
            .clone()
            .ok_or_else(|| LeaderElectionError::InvalidLease {
                name: self.lease_name.clone(),
                message: "missing resourceVersion".to_string(),
            })
    }

    /// Renew every retry period; give up once no renewal has succeeded for
    /// the renew deadline, or immediately when another holder owns the lease.
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewed = Instant::now();
        loop {
            tokio::time::sleep(self.config.retry_period).await;

            let attempt =
                tokio::time::timeout(self.config.renew_deadline, self.try_acquire_or_renew()).await;
            match attempt {
                Ok(Ok(true)) => last_renewed = Instant::now(),
                Ok(Ok(false)) => {
                    warn!(identity = %self.identity, "Lease is held by another replica");
                    break;
                }
                Ok(Err(e)) if last_renewed.elapsed() < self.config.renew_deadline => {
                    warn!(identity = %self.identity, error = %e, "Lease renewal failed, retrying");
                }
                Ok(Err(e)) => {
                    warn!(identity = %self.identity, error = %e, "Renew deadline exceeded");
                    break;
                }
                Err(_) => {
                    warn!(identity = %self.identity, "Lease renewal timed out");
                    break;
                }
            }
        }
        self.is_leader.store(false, Ordering::SeqCst);
        let _ = lost_tx.send(());
    }

    /// Clear the holder so another replica can take over without waiting
    /// for the lease to expire.
    async fn release_lease(&self) -> Result<(), LeaderElectionError> {
        let Some(lease) = self.leases.get(&self.lease_name).await? else {
            debug!(identity = %self.identity, "Lease not found, nothing to release");
            return Ok(());
        };

        let holder = lease.spec.as_ref().and_then(|s| s.holder_identity.as_ref());
        if holder != Some(&self.identity) {
            debug!(identity = %self.identity, "Not the lease holder, nothing to release");
            return Ok(());
        }

        let mut released = lease.clone();
        if let Some(ref mut spec) = released.spec {
            spec.holder_identity = None;
            spec.renew_time = Some(MicroTime(Utc::now() - chrono::Duration::seconds(60)));
        }

        if self.leases.replace(&self.lease_name, &released).await? {
            info!(identity = %self.identity, "Lease released for fast failover");
        }
        Ok(())
    }
}

/// Guard that maintains leadership
///
/// The renewal task is aborted when the guard is dropped.
pub struct LeaderGuard {
    elector: Arc<LeaderElector>,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost
    pub async fn lost(&mut self) {
        match self.lost_rx.take() {
            Some(rx) => {
                let _ = rx.await;
            }
            None => std::future::pending::<()>().await,
        }
    }

    /// Stop renewing and hand the lease back
    pub async fn release_leadership(&self) -> Result<(), LeaderElectionError> {
        self.renewal_task.abort();
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.elector.release_lease().await
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.elector.is_leader.store(false, Ordering::SeqCst);
        self.renewal_task.abort();
        info!(identity = %self.elector.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::AtomicUsize;

    /// In-memory lease store with resourceVersion compare-and-swap
    #[derive(Default)]
    struct MemoryLeases {
        lease: Mutex<Option<Lease>>,
        version: AtomicUsize,
    }

    impl MemoryLeases {
        fn stamp(&self, lease: &Lease) -> Lease {
            let mut stored = lease.clone();
            let rv = self.version.fetch_add(1, Ordering::SeqCst) + 1;
            stored.metadata.resource_version = Some(rv.to_string());
            stored
        }

        fn holder(&self) -> Option<String> {
            self.lease
                .lock()
                .as_ref()
                .and_then(|l| l.spec.as_ref())
                .and_then(|s| s.holder_identity.clone())
        }
    }

    #[async_trait]
    impl LeaseClient for MemoryLeases {
        async fn get(&self, _name: &str) -> Result<Option<Lease>, LeaderElectionError> {
            Ok(self.lease.lock().clone())
        }

        async fn create(&self, lease: &Lease) -> Result<bool, LeaderElectionError> {
            let mut slot = self.lease.lock();
            if slot.is_some() {
                return Ok(false);
            }
            *slot = Some(self.stamp(lease));
            Ok(true)
        }

        async fn replace(&self, _name: &str, lease: &Lease) -> Result<bool, LeaderElectionError> {
            let mut slot = self.lease.lock();
            let current = slot.as_ref().and_then(|l| l.metadata.resource_version.clone());
            if current != lease.metadata.resource_version {
                return Ok(false);
            }
            *slot = Some(self.stamp(lease));
            Ok(true)
        }
    }

    fn fast_config() -> LeaderElectionConfig {
        LeaderElectionConfig {
            lease_duration: Duration::from_secs(1),
            renew_deadline: Duration::from_millis(500),
            retry_period: Duration::from_millis(100),
        }
    }

    fn elector(store: &Arc<MemoryLeases>, identity: &str) -> Arc<LeaderElector> {
        Arc::new(LeaderElector::with_config(
            store.clone(),
            "sidecar-injector",
            identity,
            fast_config(),
        ))
    }

    #[tokio::test]
    async fn first_candidate_creates_lease() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert_eq!(store.holder().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn live_lease_blocks_other_candidate() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!b.try_acquire_or_renew().await.unwrap());
        assert!(a.try_acquire_or_renew().await.unwrap());
    }

    #[tokio::test]
    async fn released_lease_is_taken_over_immediately() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");
        let b = elector(&store, "b");
        assert!(a.try_acquire_or_renew().await.unwrap());
        a.release_lease().await.unwrap();
        assert_eq!(store.holder(), None);
        assert!(b.try_acquire_or_renew().await.unwrap());
        let transitions = store
            .lease
            .lock()
            .as_ref()
            .and_then(|l| l.spec.as_ref())
            .and_then(|s| s.lease_transitions);
        assert_eq!(transitions, Some(1));
    }

    #[tokio::test]
    async fn stale_resource_version_conflicts() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());
        let stale = store.lease.lock().clone().unwrap();
        assert!(a.try_acquire_or_renew().await.unwrap());
        assert!(!store.replace("sidecar-injector", &stale).await.unwrap());
    }

    #[tokio::test]
    async fn shutdown_before_acquire_skips_work() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");
        assert!(a.try_acquire_or_renew().await.unwrap());

        let b = elector(&store, "b");
        let shutdown = CancellationToken::new();
        shutdown.cancel();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = ran.clone();
        b.run_exclusive(shutdown, |_| async move {
            flag.store(true, Ordering::SeqCst);
        })
        .await
        .unwrap();
        assert!(!ran.load(Ordering::SeqCst));
    }

    // =========================================================================
    // Story Tests
    // =========================================================================

    #[tokio::test]
    async fn story_racing_candidates_never_overlap() {
        let store = Arc::new(MemoryLeases::default());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for identity in ["a", "b"] {
            let elector = elector(&store, identity);
            let (active, max_active, runs) = (active.clone(), max_active.clone(), runs.clone());
            handles.push(tokio::spawn(async move {
                elector
                    .run_exclusive(CancellationToken::new(), |_| async move {
                        let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                        max_active.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        active.fetch_sub(1, Ordering::SeqCst);
                        runs.fetch_add(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(5), handle)
                .await
                .expect("election finished")
                .expect("task joined")
                .expect("no leadership loss");
        }
        assert_eq!(runs.load(Ordering::SeqCst), 2);
        assert_eq!(max_active.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn story_standby_takes_over_after_holder_dies() {
        let store = Arc::new(MemoryLeases::default());

        let (acquired_tx, acquired_rx) = oneshot::channel();
        let holder = elector(&store, "a");
        let holder_task = tokio::spawn(async move {
            holder
                .run_exclusive(CancellationToken::new(), |_| async move {
                    let _ = acquired_tx.send(());
                    std::future::pending::<()>().await;
                })
                .await
        });
        acquired_rx.await.unwrap();

        let standby_ran = Arc::new(AtomicBool::new(false));
        let flag = standby_ran.clone();
        let standby = elector(&store, "b");
        let standby_task = tokio::spawn(async move {
            standby
                .run_exclusive(CancellationToken::new(), |_| async move {
                    flag.store(true, Ordering::SeqCst);
                })
                .await
        });

        // Holder keeps renewing, so the standby stays blocked
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!standby_ran.load(Ordering::SeqCst));
        assert_eq!(store.holder().as_deref(), Some("a"));

        // Kill the holder without releasing: standby waits for expiry
        holder_task.abort();
        let started = std::time::Instant::now();
        tokio::time::timeout(Duration::from_secs(3), standby_task)
            .await
            .expect("standby acquired in bounded time")
            .unwrap()
            .unwrap();
        assert!(standby_ran.load(Ordering::SeqCst));
        assert!(started.elapsed() < Duration::from_millis(2500));
    }

    #[tokio::test]
    async fn story_holder_gives_up_when_lease_is_stolen() {
        let store = Arc::new(MemoryLeases::default());
        let a = elector(&store, "a");

        let (acquired_tx, acquired_rx) = oneshot::channel();
        let task = tokio::spawn(a.run_exclusive(CancellationToken::new(), |_| async move {
            let _ = acquired_tx.send(());
            std::future::pending::<()>().await;
        }));
        acquired_rx.await.unwrap();

        // Another replica overwrites the lease out from under the holder
        {
            let mut slot = store.lease.lock();
            let lease = slot.as_mut().unwrap();
            lease.spec.as_mut().unwrap().holder_identity = Some("intruder".to_string());
            lease.spec.as_mut().unwrap().renew_time = Some(MicroTime(Utc::now()));
            lease.metadata.resource_version = Some("999".to_string());
        }

        let result = tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("holder noticed the loss")
            .unwrap();
        assert!(matches!(result, Err(LeaderElectionError::LeadershipLost(_))));
    }
}
