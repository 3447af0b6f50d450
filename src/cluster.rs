use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::api::core::v1::Pod;
use kube::{
    api::{Api, DeleteParams, ListParams, PostParams, Preconditions},
    core::ObjectMeta,
    Client,
};
use tracing::debug;

use crate::coordinator::LockScope;
use crate::error::{Error, Result};

/// Outcome of an exclusive create of a lock record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRecord {
    Created,
    AlreadyExists,
}

/// The slice of the Kubernetes API the compensation pipeline reads and writes.
///
/// Lookups of a missing object return [`Error::NotFound`] so callers never have
/// to inspect raw API status codes.
#[async_trait]
pub trait ClusterState: Send + Sync {
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet>;

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment>;

    /// List pods in `namespace` matching a `k=v,k=v` label selector.
    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>>;

    /// Create the lock record for `scope`, failing softly if it already exists.
    async fn create_lock_record(&self, scope: &LockScope, holder: &str) -> Result<LockRecord>;

    /// Delete the lock record for `scope` if `holder` owns it. A missing
    /// record or one owned by someone else is left alone.
    async fn delete_lock_record(&self, scope: &LockScope, holder: &str) -> Result<()>;
}

/// [`ClusterState`] backed by the kube-api, with lock records stored as
/// `coordination.k8s.io/v1` Leases.
#[derive(Clone)]
pub struct KubeClusterState {
    client: Client,
}

impl KubeClusterState {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn not_found(err: kube::Error, kind: &str, namespace: &str, name: &str) -> Error {
    match err {
        kube::Error::Api(e) if e.code == 404 => Error::NotFound {
            kind: kind.to_string(),
            namespace: namespace.to_string(),
            name: name.to_string(),
        },
        e => Error::Kube(e),
    }
}

#[async_trait]
impl ClusterState for KubeClusterState {
    async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
        let api: Api<ReplicaSet> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| not_found(e, "ReplicaSet", namespace, name))
    }

    async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.get(name)
            .await
            .map_err(|e| not_found(e, "Deployment", namespace, name))
    }

    async fn list_pods(&self, namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let lp = ListParams::default().labels(label_selector);
        Ok(api.list(&lp).await?.items)
    }

    async fn create_lock_record(&self, scope: &LockScope, holder: &str) -> Result<LockRecord> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &scope.namespace);
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(scope.name.clone()),
                namespace: Some(scope.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(holder.to_string()),
                ..Default::default()
            }),
        };

        match api.create(&PostParams::default(), &lease).await {
            Ok(_) => Ok(LockRecord::Created),
            Err(kube::Error::Api(e)) if e.code == 409 => Ok(LockRecord::AlreadyExists),
            Err(e) => Err(e.into()),
        }
    }

    async fn delete_lock_record(&self, scope: &LockScope, holder: &str) -> Result<()> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &scope.namespace);
        let Some(lease) = api.get_opt(&scope.name).await? else {
            debug!(scope = %scope, "lock record already gone");
            return Ok(());
        };

        let owner = lease.spec.as_ref().and_then(|s| s.holder_identity.as_deref());
        if owner != Some(holder) {
            debug!(
                scope = %scope,
                holder = %holder,
                owner = ?owner,
                "lock record not ours, leaving it"
            );
            return Ok(());
        }

        // pin the delete to the record we just read
        let dp = DeleteParams {
            preconditions: Some(Preconditions {
                uid: lease.metadata.uid.clone(),
                resource_version: lease.metadata.resource_version.clone(),
            }),
            ..Default::default()
        };
        match api.delete(&scope.name, &dp).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(e)) if e.code == 404 || e.code == 409 => {
                debug!(scope = %scope, code = e.code, "lock record changed before delete");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
pub(crate) mod fake {
    //! In-memory [`ClusterState`] for pipeline tests.

    use std::collections::{BTreeMap, HashMap};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use k8s_openapi::apimachinery::pkg::apis::meta::v1::OwnerReference;

    use super::*;

    /// Holds owner objects, pods and lock records in memory.
    ///
    /// `list_pods` marks the start of a critical section and the lock delete
    /// marks its end, so `max_in_section` reports how many pipelines ever read
    /// sibling state at the same time.
    #[derive(Default)]
    pub(crate) struct FakeCluster {
        replica_sets: Mutex<BTreeMap<String, ReplicaSet>>,
        deployments: Mutex<BTreeMap<String, Deployment>>,
        pods: Mutex<Vec<Pod>>,
        leases: Mutex<HashMap<String, String>>,
        pub(crate) create_attempts: AtomicUsize,
        pub(crate) deletes: AtomicUsize,
        in_section: AtomicUsize,
        pub(crate) max_in_section: AtomicUsize,
        pub(crate) fail_list: Mutex<bool>,
        pub(crate) list_delay: Option<Duration>,
    }

    pub(crate) fn controller_ref(kind: &str, name: &str) -> OwnerReference {
        OwnerReference {
            api_version: "apps/v1".to_string(),
            kind: kind.to_string(),
            name: name.to_string(),
            uid: format!("{name}-uid"),
            controller: Some(true),
            ..Default::default()
        }
    }

    impl FakeCluster {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        /// Register `deployment` and its ReplicaSet `replica_set` with the
        /// given deployment annotations.
        pub(crate) fn with_owner_chain(
            self,
            replica_set: &str,
            deployment: &str,
            annotations: &[(&str, &str)],
        ) -> Self {
            let rs = ReplicaSet {
                metadata: ObjectMeta {
                    name: Some(replica_set.to_string()),
                    owner_references: Some(vec![controller_ref("Deployment", deployment)]),
                    ..Default::default()
                },
                ..Default::default()
            };
            let deploy = Deployment {
                metadata: ObjectMeta {
                    name: Some(deployment.to_string()),
                    annotations: Some(
                        annotations
                            .iter()
                            .map(|(k, v)| (k.to_string(), v.to_string()))
                            .collect(),
                    ),
                    ..Default::default()
                },
                ..Default::default()
            };
            self.replica_sets
                .lock()
                .unwrap()
                .insert(replica_set.to_string(), rs);
            self.deployments
                .lock()
                .unwrap()
                .insert(deployment.to_string(), deploy);
            self
        }

        pub(crate) fn with_replica_set(self, rs: ReplicaSet) -> Self {
            let name = rs.metadata.name.clone().unwrap_or_default();
            self.replica_sets.lock().unwrap().insert(name, rs);
            self
        }

        pub(crate) fn with_pods(self, pods: Vec<Pod>) -> Self {
            self.pods.lock().unwrap().extend(pods);
            self
        }

        pub(crate) fn with_list_delay(mut self, delay: Duration) -> Self {
            self.list_delay = Some(delay);
            self
        }

        /// Record `scope` as held by a holder no pipeline will ever use.
        pub(crate) fn hold_lock(&self, scope: &LockScope) {
            self.leases
                .lock()
                .unwrap()
                .insert(scope.to_string(), "elsewhere".to_string());
        }

        pub(crate) fn lock_held(&self, scope: &LockScope) -> bool {
            self.leases.lock().unwrap().contains_key(&scope.to_string())
        }

        pub(crate) fn lock_holder(&self, scope: &LockScope) -> Option<String> {
            self.leases.lock().unwrap().get(&scope.to_string()).cloned()
        }

        pub(crate) fn add_pod(&self, pod: Pod) {
            self.pods.lock().unwrap().push(pod);
        }

        pub(crate) fn create_attempts(&self) -> usize {
            self.create_attempts.load(Ordering::SeqCst)
        }

        pub(crate) fn max_in_section(&self) -> usize {
            self.max_in_section.load(Ordering::SeqCst)
        }
    }

    fn matches(pod: &Pod, selector: &str) -> bool {
        let labels = pod.metadata.labels.clone().unwrap_or_default();
        selector
            .split(',')
            .filter(|s| !s.is_empty())
            .all(|pair| match pair.split_once('=') {
                Some((k, v)) => labels.get(k).map(String::as_str) == Some(v),
                None => false,
            })
    }

    #[async_trait]
    impl ClusterState for FakeCluster {
        async fn get_replica_set(&self, namespace: &str, name: &str) -> Result<ReplicaSet> {
            self.replica_sets
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    kind: "ReplicaSet".into(),
                    namespace: namespace.into(),
                    name: name.into(),
                })
        }

        async fn get_deployment(&self, namespace: &str, name: &str) -> Result<Deployment> {
            self.deployments
                .lock()
                .unwrap()
                .get(name)
                .cloned()
                .ok_or_else(|| Error::NotFound {
                    kind: "Deployment".into(),
                    namespace: namespace.into(),
                    name: name.into(),
                })
        }

        async fn list_pods(&self, _namespace: &str, label_selector: &str) -> Result<Vec<Pod>> {
            let now = self.in_section.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_section.fetch_max(now, Ordering::SeqCst);

            if let Some(delay) = self.list_delay {
                tokio::time::sleep(delay).await;
            } else {
                tokio::task::yield_now().await;
            }

            if *self.fail_list.lock().unwrap() {
                return Err(Error::Kube(kube::Error::Api(kube::core::ErrorResponse {
                    status: "Failure".into(),
                    message: "injected list failure".into(),
                    reason: "InternalError".into(),
                    code: 500,
                })));
            }
            Ok(self
                .pods
                .lock()
                .unwrap()
                .iter()
                .filter(|p| matches(p, label_selector))
                .cloned()
                .collect())
        }

        async fn create_lock_record(&self, scope: &LockScope, holder: &str) -> Result<LockRecord> {
            self.create_attempts.fetch_add(1, Ordering::SeqCst);
            let mut leases = self.leases.lock().unwrap();
            if leases.contains_key(&scope.to_string()) {
                return Ok(LockRecord::AlreadyExists);
            }
            leases.insert(scope.to_string(), holder.to_string());
            Ok(LockRecord::Created)
        }

        async fn delete_lock_record(&self, scope: &LockScope, holder: &str) -> Result<()> {
            let mut leases = self.leases.lock().unwrap();
            if leases.get(&scope.to_string()).map(String::as_str) != Some(holder) {
                return Ok(());
            }
            leases.remove(&scope.to_string());
            self.deletes.fetch_add(1, Ordering::SeqCst);
            // a section that failed before listing never entered
            let _ = self
                .in_section
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
            Ok(())
        }
    }
}
