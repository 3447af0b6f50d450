//! Cluster-scoped exclusive lock around the count-and-decide section
//!
//! Every admission for the same scope must see the decisions of the ones
//! before it, across webhook replicas, so exclusion is delegated to a record
//! in the cluster: whoever creates it holds the lock until it deletes it.
//!
//! There is no expiry and no fencing token. A holder that dies inside the
//! section leaves the record behind, and every later admission for that scope
//! times out until the record is deleted by hand.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use tokio::time::{timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[cfg(test)]
use mockall::automock;

use crate::cluster::{ClusterState, LockRecord};
use crate::config::{LockScopeMode, LockSettings};
use crate::error::{Error, Result};

/// Name of a lock record.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockScope {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for LockScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

impl LockScope {
    /// Derive the scope guarding decisions for `pod`.
    ///
    /// In [`LockScopeMode::GenerateName`] every replica of one ReplicaSet
    /// shares a name prefix and therefore a lock. Pods created without a
    /// generateName fall back to the deployment.
    pub fn for_pod(namespace: &str, pod: &Pod, deployment: &str, settings: &LockSettings) -> Self {
        let prefix = match settings.scope_mode {
            LockScopeMode::GenerateName => {
                match pod.metadata.generate_name.as_deref().filter(|g| !g.is_empty()) {
                    Some(generate_name) => generate_name.to_string(),
                    None => {
                        warn!(
                            namespace = %namespace,
                            deployment = %deployment,
                            "pod has no generateName, scoping lock to the deployment"
                        );
                        deployment.to_string()
                    }
                }
            }
            LockScopeMode::Deployment => deployment.to_string(),
        };

        LockScope {
            namespace: namespace.to_string(),
            name: format!("{}-{}", prefix, settings.suffix),
        }
    }
}

/// Identity recorded on the lock record. Only its owner may delete it.
pub fn holder_identity(pod: &Pod) -> String {
    match pod.metadata.name.as_deref().filter(|n| !n.is_empty()) {
        Some(name) => name.to_string(),
        None => format!(
            "{}{}",
            pod.metadata.generate_name.as_deref().unwrap_or_default(),
            uuid::Uuid::new_v4()
        ),
    }
}

/// Exclusive create/delete primitive the pipeline serializes on.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Make one attempt at taking `scope`. `Ok(false)` means someone else
    /// holds it.
    async fn try_acquire(&self, scope: &LockScope, holder: &str) -> Result<bool>;

    /// Drop `scope` if `holder` owns it.
    async fn release(&self, scope: &LockScope, holder: &str) -> Result<()>;
}

/// [`Coordinator`] storing lock records through [`ClusterState`].
pub struct LeaseCoordinator {
    cluster: Arc<dyn ClusterState>,
}

impl LeaseCoordinator {
    pub fn new(cluster: Arc<dyn ClusterState>) -> Self {
        Self { cluster }
    }
}

#[async_trait]
impl Coordinator for LeaseCoordinator {
    async fn try_acquire(&self, scope: &LockScope, holder: &str) -> Result<bool> {
        let record = self.cluster.create_lock_record(scope, holder).await?;
        Ok(record == LockRecord::Created)
    }

    async fn release(&self, scope: &LockScope, holder: &str) -> Result<()> {
        self.cluster.delete_lock_record(scope, holder).await
    }
}

/// How long one admission may wait for its lock.
#[derive(Debug, Clone)]
pub struct AcquireWindow {
    pub retry_interval: Duration,
    pub deadline: Instant,
    /// Fires when the caller stops waiting for the verdict.
    pub cancel: CancellationToken,
}

impl AcquireWindow {
    /// Open a window now, closing after the configured deadline or the
    /// caller's own timeout, whichever is sooner.
    pub fn new(
        settings: &LockSettings,
        request_timeout: Option<Duration>,
        cancel: CancellationToken,
    ) -> Self {
        let budget = request_timeout.map_or(settings.deadline, |t| t.min(settings.deadline));
        Self {
            retry_interval: settings.retry_interval,
            deadline: Instant::now() + budget,
            cancel,
        }
    }
}

/// Poll `try_acquire` every `retry_interval` until it succeeds, the deadline
/// passes or the window is cancelled. The first attempt is made immediately
/// and no attempt outlives the window.
pub async fn acquire_exclusive(
    coordinator: &dyn Coordinator,
    scope: &LockScope,
    holder: &str,
    window: &AcquireWindow,
) -> Result<()> {
    let mut ticker = tokio::time::interval(window.retry_interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut attempts = 0;

    loop {
        tokio::select! {
            biased;
            _ = window.cancel.cancelled() => {
                debug!(scope = %scope, attempts, "caller gone, abandoning lock");
                return Err(Error::RequestAbandoned {
                    scope: scope.to_string(),
                });
            }
            _ = tokio::time::sleep_until(window.deadline) => {
                return Err(Error::LockCancelled {
                    scope: scope.to_string(),
                    attempts,
                });
            }
            _ = ticker.tick() => {
                attempts += 1;
                let attempt = tokio::select! {
                    biased;
                    _ = window.cancel.cancelled() => None,
                    res = timeout_at(window.deadline, coordinator.try_acquire(scope, holder)) => {
                        res.ok()
                    }
                };
                match attempt {
                    Some(Ok(true)) => {
                        debug!(scope = %scope, holder = %holder, attempts, "lock acquired");
                        return Ok(());
                    }
                    Some(Ok(false)) => {
                        debug!(scope = %scope, attempts, "lock held elsewhere, retrying")
                    }
                    Some(Err(e)) => {
                        warn!(scope = %scope, error = %e, "lock attempt failed, retrying")
                    }
                    None => {
                        // the create may still have landed
                        warn!(scope = %scope, attempts, "lock attempt cut off, releasing");
                        release_quietly(coordinator, scope, holder).await;
                    }
                }
            }
        }
    }
}

async fn release_quietly(coordinator: &dyn Coordinator, scope: &LockScope, holder: &str) {
    match coordinator.release(scope, holder).await {
        Ok(()) => debug!(scope = %scope, "lock released"),
        Err(e) => warn!(
            scope = %scope,
            error = %e,
            "failed to release lock, the record must be removed by hand"
        ),
    }
}

/// Run `section` while holding `scope`.
///
/// The lock is released on every exit of the section, whatever it returns.
/// A failed release is logged and does not change the section's result.
pub async fn with_exclusive<T, F, Fut>(
    coordinator: &dyn Coordinator,
    scope: &LockScope,
    holder: &str,
    window: &AcquireWindow,
    section: F,
) -> Result<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    acquire_exclusive(coordinator, scope, holder, window).await?;

    let outcome = section().await;
    release_quietly(coordinator, scope, holder).await;

    outcome
}
