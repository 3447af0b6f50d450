use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{NodeSelectorRequirement, Pod};

use crate::cluster::ClusterState;
use crate::config::NodeLabel;
use crate::error::Result;

pub(crate) const OPERATOR_IN: &str = "In";

/// Render a label set as an equality selector, `k1=v1,k2=v2` in key order.
///
/// An empty set renders as the empty selector, which matches every pod in
/// the namespace.
pub fn label_selector(labels: Option<&BTreeMap<String, String>>) -> String {
    labels
        .into_iter()
        .flatten()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

fn is_on_demand_requirement(req: &NodeSelectorRequirement, on_demand: &NodeLabel) -> bool {
    req.key == on_demand.key
        && req.operator == OPERATOR_IN
        && req
            .values
            .as_ref()
            .and_then(|values| values.first())
            .is_some_and(|v| *v == on_demand.value)
}

/// Whether `pod` is hard-pinned to on-demand capacity by any required term.
///
/// Preferred terms never count, so a spot-leaning pod is not a commitment.
pub fn is_on_demand_committed(pod: &Pod, on_demand: &NodeLabel) -> bool {
    pod.spec
        .as_ref()
        .and_then(|spec| spec.affinity.as_ref())
        .and_then(|affinity| affinity.node_affinity.as_ref())
        .and_then(|node| node.required_during_scheduling_ignored_during_execution.as_ref())
        .map(|required| {
            required.node_selector_terms.iter().any(|term| {
                term.match_expressions
                    .iter()
                    .flatten()
                    .any(|req| is_on_demand_requirement(req, on_demand))
            })
        })
        .unwrap_or(false)
}

pub fn count_on_demand(pods: &[Pod], on_demand: &NodeLabel) -> usize {
    pods.iter()
        .filter(|pod| is_on_demand_committed(pod, on_demand))
        .count()
}

/// Count the siblings of `pod` (same namespace, same label set) already
/// committed to on-demand capacity.
///
/// Only meaningful while holding the scope's lock.
pub async fn count_on_demand_siblings(
    cluster: &dyn ClusterState,
    namespace: &str,
    pod: &Pod,
    on_demand: &NodeLabel,
) -> Result<usize> {
    let selector = label_selector(pod.metadata.labels.as_ref());
    let siblings = cluster.list_pods(namespace, &selector).await?;
    Ok(count_on_demand(&siblings, on_demand))
}
