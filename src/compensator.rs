//! The scheduling-compensation pipeline
//!
//! resolve strategy -> gate -> acquire -> count siblings -> decide -> merge
//! affinity -> diff -> release. Each request runs the pipeline on its own; the
//! only thing shared between requests is the lock record in the cluster.

use std::sync::Arc;
use std::time::Duration;

use json_patch::Patch;
use kube::core::admission::Operation;
use kube::Client;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::affinity::ensure_capacity_affinity;
use crate::capacity::count_on_demand_siblings;
use crate::cluster::{ClusterState, KubeClusterState};
use crate::config::CompensationConfig;
use crate::coordinator::{
    holder_identity, with_exclusive, AcquireWindow, Coordinator, LeaseCoordinator, LockScope,
};
use crate::error::{Error, Result};
use crate::patch::AdmittedPod;
use crate::policy::{PlacementPolicy, WaterLevelPolicy};
use crate::strategy::{resolve_strategy, PlacementStrategy};

/// The answer to one admission request.
#[derive(Debug, Clone, PartialEq)]
pub enum Verdict {
    /// Admit the pod, applying `patch` when present.
    Allowed(Option<Patch>),
    /// Refuse the pod with an HTTP-style status code.
    Errored { code: u16, message: String },
}

impl Verdict {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Verdict::Allowed(_))
    }

    pub fn patch(&self) -> Option<&Patch> {
        match self {
            Verdict::Allowed(patch) => patch.as_ref(),
            Verdict::Errored { .. } => None,
        }
    }
}

impl From<&Error> for Verdict {
    fn from(e: &Error) -> Self {
        Verdict::Errored {
            code: e.status_code(),
            message: e.to_string(),
        }
    }
}

/// A pod admission as seen by the pipeline, stripped of transport details.
#[derive(Debug, Clone)]
pub struct PodAdmission {
    pub uid: String,
    pub operation: Operation,
    /// Namespace of the request; the pod itself often carries none on create.
    pub namespace: Option<String>,
    pub object: Option<Value>,
    /// How long the caller waits for the verdict, when it says so.
    pub timeout: Option<Duration>,
}

pub struct Compensator {
    pub(crate) cluster: Arc<dyn ClusterState>,
    pub(crate) coordinator: Arc<dyn Coordinator>,
    pub(crate) policy: Arc<dyn PlacementPolicy>,
    pub(crate) config: Arc<CompensationConfig>,
}

impl Compensator {
    pub fn new(
        cluster: Arc<dyn ClusterState>,
        coordinator: Arc<dyn Coordinator>,
        policy: Arc<dyn PlacementPolicy>,
        config: Arc<CompensationConfig>,
    ) -> Self {
        Compensator {
            cluster,
            coordinator,
            policy,
            config,
        }
    }

    /// Pipeline backed by the kube-api, locking through Leases.
    pub fn with_client(client: Client, config: CompensationConfig) -> Self {
        let cluster: Arc<dyn ClusterState> = Arc::new(KubeClusterState::new(client));
        let coordinator = Arc::new(LeaseCoordinator::new(cluster.clone()));
        Self::new(
            cluster,
            coordinator,
            Arc::new(WaterLevelPolicy),
            Arc::new(config),
        )
    }

    /// Decide on one admission.
    pub async fn admit(&self, admission: PodAdmission) -> Verdict {
        self.admit_cancellable(admission, CancellationToken::new()).await
    }

    /// Decide on one admission, giving up on the lock once `cancel` fires.
    pub async fn admit_cancellable(
        &self,
        admission: PodAdmission,
        cancel: CancellationToken,
    ) -> Verdict {
        let uid = admission.uid.clone();
        let window = AcquireWindow::new(&self.config.lock, admission.timeout, cancel);
        match self.compensate(admission, &window).await {
            Ok(patch) => Verdict::Allowed(patch),
            Err(e) => {
                error!(uid = %uid, error = %e, "compensation failed, rejecting pod");
                Verdict::from(&e)
            }
        }
    }

    async fn compensate(
        &self,
        admission: PodAdmission,
        window: &AcquireWindow,
    ) -> Result<Option<Patch>> {
        let PodAdmission {
            uid,
            operation,
            namespace,
            object,
            ..
        } = admission;

        if operation != Operation::Create {
            debug!(uid = %uid, operation = ?operation, "not a create, allowing unchanged");
            return Ok(None);
        }

        let raw = object.ok_or_else(|| Error::decode("admission request carries no object"))?;
        let admitted = AdmittedPod::decode(raw)?;
        let namespace = namespace
            .filter(|ns| !ns.is_empty())
            .or_else(|| admitted.pod.metadata.namespace.clone())
            .ok_or_else(|| Error::decode("admission request carries no namespace"))?;
        let pod_name = admitted
            .pod
            .metadata
            .name
            .clone()
            .or_else(|| admitted.pod.metadata.generate_name.clone())
            .unwrap_or_default();

        debug!(uid = %uid, namespace = %namespace, pod = %pod_name, "mutating pod");

        let resolved =
            resolve_strategy(&*self.cluster, &self.config.keys, &namespace, &admitted.pod).await?;

        if !self.policy.should_compensate(&resolved.strategy) {
            debug!(
                uid = %uid,
                namespace = %namespace,
                pod = %pod_name,
                deployment = %resolved.deployment,
                "compensation disabled, skipping"
            );
            return Ok(None);
        }

        let scope = LockScope::for_pod(
            &namespace,
            &admitted.pod,
            &resolved.deployment,
            &self.config.lock,
        );
        let holder = holder_identity(&admitted.pod);

        let (ns, pod, strategy) = (&namespace, &admitted, &resolved.strategy);
        let patch = with_exclusive(
            &*self.coordinator,
            &scope,
            &holder,
            window,
            move || self.decide(ns, pod, strategy),
        )
        .await?;

        if patch.0.is_empty() {
            debug!(uid = %uid, pod = %pod_name, "pod already compliant");
            return Ok(None);
        }
        Ok(Some(patch))
    }

    /// The critical section: count, decide, merge, diff.
    async fn decide(
        &self,
        namespace: &str,
        admitted: &AdmittedPod,
        strategy: &PlacementStrategy,
    ) -> Result<Patch> {
        let keys = &self.config.keys;
        let count =
            count_on_demand_siblings(&*self.cluster, namespace, &admitted.pod, &keys.on_demand)
                .await?;
        let class = self.policy.decide(count, strategy);

        let mut pod = admitted.pod.clone();
        ensure_capacity_affinity(&mut pod, class, keys);

        info!(
            namespace = %namespace,
            pod = ?admitted.pod.metadata.generate_name,
            on_demand = count,
            low_water_level = strategy.low_water_level,
            high_water_level = strategy.high_water_level,
            class = %class,
            "capacity class decided"
        );

        admitted.patch_to(&pod)
    }
}
