//! Placement strategy resolution
//!
//! A pod only carries a reference to its ReplicaSet; the strategy lives as
//! annotations on the Deployment two hops up the owner chain. Malformed
//! annotation values never fail a request, they fall back to the value that
//! turns compensation off. Only infrastructure failures are errors.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use tracing::debug;

use crate::cluster::ClusterState;
use crate::config::PlacementKeys;
use crate::error::{Error, Result};

/// Water levels and switch read off a Deployment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PlacementStrategy {
    pub low_water_level: i64,
    /// Accepted but not consulted by [`crate::policy::WaterLevelPolicy`].
    pub high_water_level: i64,
    pub compensation_enabled: Option<bool>,
}

/// A strategy together with where it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedStrategy {
    pub strategy: PlacementStrategy,
    pub deployment: String,
    /// Annotation keys that were missing or malformed and fell back to defaults.
    pub defaulted: Vec<String>,
}

/// A parsed configuration value, flagged when it is the fallback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Parsed<T> {
    pub value: T,
    pub defaulted: bool,
}

/// Parse `raw` with `parse`, falling back to `default` when it is missing or
/// rejected.
pub fn parse_with_default<T>(
    raw: Option<&str>,
    default: T,
    parse: impl FnOnce(&str) -> Option<T>,
) -> Parsed<T> {
    match raw.and_then(parse) {
        Some(value) => Parsed {
            value,
            defaulted: false,
        },
        None => Parsed {
            value: default,
            defaulted: true,
        },
    }
}

/// Boolean literals as accepted by Kubernetes tooling.
pub fn parse_bool(s: &str) -> Option<bool> {
    match s {
        "1" | "t" | "T" | "TRUE" | "true" | "True" => Some(true),
        "0" | "f" | "F" | "FALSE" | "false" | "False" => Some(false),
        _ => None,
    }
}

impl PlacementStrategy {
    /// Read the strategy from a Deployment's annotations.
    pub fn from_annotations(
        annotations: &BTreeMap<String, String>,
        keys: &PlacementKeys,
    ) -> (Self, Vec<String>) {
        let get = |key: &str| annotations.get(key).map(String::as_str);
        let mut defaulted = vec![];

        let low = parse_with_default(get(&keys.low_water_level), 0, |s| s.parse::<i64>().ok());
        if low.defaulted {
            defaulted.push(keys.low_water_level.clone());
        }
        let high = parse_with_default(get(&keys.high_water_level), 0, |s| s.parse::<i64>().ok());
        if high.defaulted {
            defaulted.push(keys.high_water_level.clone());
        }
        let enabled = parse_with_default(get(&keys.schedule_compensation), None, |s| {
            parse_bool(s).map(Some)
        });
        if enabled.defaulted {
            defaulted.push(keys.schedule_compensation.clone());
        }

        let strategy = PlacementStrategy {
            low_water_level: low.value,
            high_water_level: high.value,
            compensation_enabled: enabled.value,
        };
        (strategy, defaulted)
    }
}

/// The owner reference marked as the managing controller, if any.
pub fn controller_of(meta: &ObjectMeta) -> Option<&OwnerReference> {
    meta.owner_references
        .as_ref()?
        .iter()
        .find(|r| r.controller == Some(true))
}

fn require_controller<'a>(meta: &'a ObjectMeta, kind: &str) -> Result<&'a OwnerReference> {
    controller_of(meta).ok_or_else(|| Error::MissingControllerOwner {
        kind: kind.to_string(),
        name: meta
            .name
            .clone()
            .or_else(|| meta.generate_name.clone())
            .unwrap_or_default(),
    })
}

/// Walk Pod -> ReplicaSet -> Deployment and read the placement strategy.
pub async fn resolve_strategy(
    cluster: &dyn ClusterState,
    keys: &PlacementKeys,
    namespace: &str,
    pod: &Pod,
) -> Result<ResolvedStrategy> {
    let rs_ref = require_controller(&pod.metadata, "Pod")?;
    let replica_set = cluster.get_replica_set(namespace, &rs_ref.name).await?;

    let deploy_ref = require_controller(&replica_set.metadata, "ReplicaSet")?;
    let deployment = cluster.get_deployment(namespace, &deploy_ref.name).await?;

    let annotations = deployment.metadata.annotations.unwrap_or_default();
    let (strategy, defaulted) = PlacementStrategy::from_annotations(&annotations, keys);
    if !defaulted.is_empty() {
        debug!(
            deployment = %deploy_ref.name,
            keys = ?defaulted,
            "annotations missing or malformed, using defaults"
        );
    }

    Ok(ResolvedStrategy {
        strategy,
        deployment: deploy_ref.name.clone(),
        defaulted,
    })
}
