//! Affinity merging
//!
//! Folds a capacity requirement into whatever affinity the pod already has.
//! Required node-selector terms are OR'd by the scheduler, so appending a
//! required term widens the set of eligible nodes. Preferred terms are scored
//! independently and summed, so appending one only adds weight.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, Pod,
    PreferredSchedulingTerm,
};

use crate::capacity::OPERATOR_IN;
use crate::config::{NodeLabel, PlacementKeys};
use crate::policy::CapacityClass;

/// The mutation payload for one decision.
#[derive(Debug, Clone, PartialEq)]
pub enum AffinityRequirement {
    Required(NodeSelectorTerm),
    Preferred(PreferredSchedulingTerm),
}

fn label_term(label: &NodeLabel) -> NodeSelectorTerm {
    NodeSelectorTerm {
        match_expressions: Some(vec![NodeSelectorRequirement {
            key: label.key.clone(),
            operator: OPERATOR_IN.to_string(),
            values: Some(vec![label.value.clone()]),
        }]),
        ..Default::default()
    }
}

impl AffinityRequirement {
    /// The requirement expressing `class` with the configured node labels.
    pub fn for_class(class: CapacityClass, keys: &PlacementKeys) -> Self {
        match class {
            CapacityClass::OnDemand => AffinityRequirement::Required(label_term(&keys.on_demand)),
            CapacityClass::Spot => AffinityRequirement::Preferred(PreferredSchedulingTerm {
                weight: keys.spot_weight,
                preference: label_term(&keys.spot),
            }),
        }
    }

    fn into_node_affinity(self) -> NodeAffinity {
        match self {
            AffinityRequirement::Required(term) => NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![term],
                }),
                ..Default::default()
            },
            AffinityRequirement::Preferred(term) => NodeAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![term]),
                ..Default::default()
            },
        }
    }
}

fn append_once<T: PartialEq>(list: &mut Vec<T>, item: T) {
    if !list.contains(&item) {
        list.push(item);
    }
}

/// Merge `requirement` into `affinity`, leaving every unrelated rule intact.
///
/// Merging the same requirement twice leaves the affinity unchanged.
pub fn merge_affinity(affinity: &mut Option<Affinity>, requirement: AffinityRequirement) {
    match affinity {
        None => {
            *affinity = Some(Affinity {
                node_affinity: Some(requirement.into_node_affinity()),
                ..Default::default()
            })
        }
        Some(affinity) => match affinity.node_affinity.as_mut() {
            None => affinity.node_affinity = Some(requirement.into_node_affinity()),
            Some(node) => merge_node_affinity(node, requirement),
        },
    }
}

fn merge_node_affinity(node: &mut NodeAffinity, requirement: AffinityRequirement) {
    match requirement {
        AffinityRequirement::Required(term) => {
            match node.required_during_scheduling_ignored_during_execution.as_mut() {
                Some(selector) if !selector.node_selector_terms.is_empty() => {
                    append_once(&mut selector.node_selector_terms, term)
                }
                _ => {
                    node.required_during_scheduling_ignored_during_execution = Some(NodeSelector {
                        node_selector_terms: vec![term],
                    })
                }
            }
        }
        AffinityRequirement::Preferred(term) => {
            match node.preferred_during_scheduling_ignored_during_execution.as_mut() {
                Some(preferred) => append_once(preferred, term),
                None => {
                    node.preferred_during_scheduling_ignored_during_execution = Some(vec![term])
                }
            }
        }
    }
}

/// Apply the decision for `class` to the pod's spec.
pub fn ensure_capacity_affinity(pod: &mut Pod, class: CapacityClass, keys: &PlacementKeys) {
    let spec = pod.spec.get_or_insert_with(Default::default);
    merge_affinity(&mut spec.affinity, AffinityRequirement::for_class(class, keys));
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::{PodAffinity, PodAffinityTerm};

    use super::*;

    fn term(key: &str, value: &str) -> NodeSelectorTerm {
        NodeSelectorTerm {
            match_expressions: Some(vec![NodeSelectorRequirement {
                key: key.into(),
                operator: "In".into(),
                values: Some(vec![value.into()]),
            }]),
            ..Default::default()
        }
    }

    fn keys() -> PlacementKeys {
        PlacementKeys::default()
    }

    #[test]
    fn test_requirements_use_configured_labels() {
        let required = AffinityRequirement::for_class(CapacityClass::OnDemand, &keys());
        assert_eq!(
            required,
            AffinityRequirement::Required(term("node.kubernetes.io/capacity", "on-demand"))
        );

        let preferred = AffinityRequirement::for_class(CapacityClass::Spot, &keys());
        assert_eq!(
            preferred,
            AffinityRequirement::Preferred(PreferredSchedulingTerm {
                weight: 100,
                preference: term("node.kubernetes.io/capacity", "spot"),
            })
        );

        let custom = PlacementKeys {
            spot: NodeLabel::new("example.org/lifecycle", "preemptible"),
            spot_weight: 10,
            ..Default::default()
        };
        let AffinityRequirement::Preferred(p) =
            AffinityRequirement::for_class(CapacityClass::Spot, &custom)
        else {
            panic!("spot must be a preference");
        };
        assert_eq!(p.weight, 10);
        assert_eq!(p.preference, term("example.org/lifecycle", "preemptible"));
    }

    #[test]
    fn test_merge_into_empty_affinity() {
        let mut affinity = None;
        merge_affinity(
            &mut affinity,
            AffinityRequirement::for_class(CapacityClass::OnDemand, &keys()),
        );

        let selector = affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap();
        assert_eq!(
            selector.node_selector_terms,
            vec![term("node.kubernetes.io/capacity", "on-demand")]
        );
    }

    #[test]
    fn test_merge_keeps_pod_affinity() {
        let pod_affinity = PodAffinity {
            required_during_scheduling_ignored_during_execution: Some(vec![PodAffinityTerm {
                topology_key: "kubernetes.io/hostname".into(),
                ..Default::default()
            }]),
            ..Default::default()
        };
        let mut affinity = Some(Affinity {
            pod_affinity: Some(pod_affinity.clone()),
            ..Default::default()
        });

        merge_affinity(
            &mut affinity,
            AffinityRequirement::for_class(CapacityClass::Spot, &keys()),
        );

        let affinity = affinity.unwrap();
        assert_eq!(affinity.pod_affinity, Some(pod_affinity));
        assert_eq!(
            affinity
                .node_affinity
                .unwrap()
                .preferred_during_scheduling_ignored_during_execution
                .unwrap()
                .len(),
            1
        );
    }

    #[test]
    fn test_required_term_is_appended_not_intersected() {
        let existing: Vec<_> = (0..3).map(|i| term("zone", &format!("zone-{i}"))).collect();
        let mut affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: existing.clone(),
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        merge_affinity(
            &mut affinity,
            AffinityRequirement::for_class(CapacityClass::OnDemand, &keys()),
        );

        let terms = affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 4);
        assert_eq!(&terms[..3], &existing[..]);
        // each existing term is untouched, the new one stands alone
        assert_eq!(terms[3], term("node.kubernetes.io/capacity", "on-demand"));
    }

    #[test]
    fn test_required_fills_empty_term_list() {
        let mut affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(NodeSelector {
                    node_selector_terms: vec![],
                }),
                ..Default::default()
            }),
            ..Default::default()
        });

        merge_affinity(
            &mut affinity,
            AffinityRequirement::for_class(CapacityClass::OnDemand, &keys()),
        );

        let terms = affinity
            .unwrap()
            .node_affinity
            .unwrap()
            .required_during_scheduling_ignored_during_execution
            .unwrap()
            .node_selector_terms;
        assert_eq!(terms.len(), 1);
    }

    #[test]
    fn test_spot_preference_is_additive() {
        let other = PreferredSchedulingTerm {
            weight: 20,
            preference: term("disk", "ssd"),
        };
        let required = NodeSelector {
            node_selector_terms: vec![term("zone", "a")],
        };
        let mut affinity = Some(Affinity {
            node_affinity: Some(NodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(required.clone()),
                preferred_during_scheduling_ignored_during_execution: Some(vec![other.clone()]),
            }),
            ..Default::default()
        });

        merge_affinity(
            &mut affinity,
            AffinityRequirement::for_class(CapacityClass::Spot, &keys()),
        );

        let node = affinity.unwrap().node_affinity.unwrap();
        assert_eq!(
            node.required_during_scheduling_ignored_during_execution,
            Some(required)
        );
        let preferred = node.preferred_during_scheduling_ignored_during_execution.unwrap();
        assert_eq!(preferred.len(), 2);
        assert_eq!(preferred[0], other);
        assert_eq!(preferred[1].weight, 100);
    }

    #[test]
    fn test_merge_is_idempotent() {
        for class in [CapacityClass::OnDemand, CapacityClass::Spot] {
            let mut pod = Pod::default();
            ensure_capacity_affinity(&mut pod, class, &keys());
            let once = pod.clone();
            ensure_capacity_affinity(&mut pod, class, &keys());
            assert_eq!(pod, once, "{class}");
        }
    }
}
