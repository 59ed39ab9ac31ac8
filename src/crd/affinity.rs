//! Placement affinity for a role group and its translation to a pod `Affinity`.

use k8s_openapi::api::core::v1::{
    Affinity, NodeAffinity as K8sNodeAffinity, NodeSelector as K8sNodeSelector,
    NodeSelectorRequirement, NodeSelectorTerm, PodAffinity as K8sPodAffinity,
    PodAffinityTerm, PodAntiAffinity as K8sPodAntiAffinity, PreferredSchedulingTerm,
    WeightedPodAffinityTerm,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const HOSTNAME_TOPOLOGY_KEY: &str = "kubernetes.io/hostname";

/// Affinity configuration of a role group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AffinitySpec {
    #[serde(default)]
    pub node_affinity: Option<NodeAffinity>,
    #[serde(default)]
    pub pod_anti_affinity: Option<PodAffinity>,
    #[serde(default)]
    pub pod_affinity: Option<PodAffinity>,
}

/// Node affinity. `type` is `soft` or `hard`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NodeAffinity {
    #[serde(default)]
    pub r#type: String,
    #[serde(default)]
    pub node_selector: Vec<NodeSelector>,
    /// Weight used when the type is `soft`
    #[serde(default = "default_weight")]
    pub weight: i32,
}

/// A single `key in (values)` node requirement
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct NodeSelector {
    pub key: String,
    #[serde(default)]
    pub values: Vec<String>,
}

/// Pod affinity or anti-affinity toward the pods of the same role group
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PodAffinity {
    #[serde(default)]
    pub r#type: String,
    #[serde(default = "default_weight")]
    pub weight: i32,
}

fn default_weight() -> i32 {
    40
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strength {
    Soft,
    Hard,
}

fn strength(kind: &str) -> Option<Strength> {
    match kind.to_ascii_lowercase().as_str() {
        "soft" => Some(Strength::Soft),
        "hard" => Some(Strength::Hard),
        _ => None,
    }
}

impl AffinitySpec {
    /// Translate to a pod affinity. `selector` matches the pods of the role group.
    pub fn to_k8s_affinity(&self, selector: &BTreeMap<String, String>) -> Option<Affinity> {
        let affinity = Affinity {
            node_affinity: self.node_affinity.as_ref().and_then(NodeAffinity::to_k8s),
            pod_affinity: self.pod_affinity.as_ref().and_then(|p| {
                let (required, preferred) = p.terms(selector)?;
                Some(K8sPodAffinity {
                    required_during_scheduling_ignored_during_execution: required,
                    preferred_during_scheduling_ignored_during_execution: preferred,
                })
            }),
            pod_anti_affinity: self.pod_anti_affinity.as_ref().and_then(|p| {
                let (required, preferred) = p.terms(selector)?;
                Some(K8sPodAntiAffinity {
                    required_during_scheduling_ignored_during_execution: required,
                    preferred_during_scheduling_ignored_during_execution: preferred,
                })
            }),
        };

        if affinity.node_affinity.is_none()
            && affinity.pod_affinity.is_none()
            && affinity.pod_anti_affinity.is_none()
        {
            None
        } else {
            Some(affinity)
        }
    }
}

impl NodeAffinity {
    fn to_k8s(&self) -> Option<K8sNodeAffinity> {
        if self.node_selector.is_empty() {
            return None;
        }
        let term = NodeSelectorTerm {
            match_expressions: Some(
                self.node_selector
                    .iter()
                    .map(|s| NodeSelectorRequirement {
                        key: s.key.clone(),
                        operator: "In".to_string(),
                        values: Some(s.values.clone()),
                    })
                    .collect(),
            ),
            ..Default::default()
        };
        match strength(&self.r#type)? {
            Strength::Hard => Some(K8sNodeAffinity {
                required_during_scheduling_ignored_during_execution: Some(K8sNodeSelector {
                    node_selector_terms: vec![term],
                }),
                ..Default::default()
            }),
            Strength::Soft => Some(K8sNodeAffinity {
                preferred_during_scheduling_ignored_during_execution: Some(vec![
                    PreferredSchedulingTerm {
                        preference: term,
                        weight: self.weight,
                    },
                ]),
                ..Default::default()
            }),
        }
    }
}

type PodTerms = (
    Option<Vec<PodAffinityTerm>>,
    Option<Vec<WeightedPodAffinityTerm>>,
);

impl PodAffinity {
    fn terms(&self, selector: &BTreeMap<String, String>) -> Option<PodTerms> {
        let term = PodAffinityTerm {
            label_selector: Some(LabelSelector {
                match_labels: Some(selector.clone()),
                ..Default::default()
            }),
            topology_key: HOSTNAME_TOPOLOGY_KEY.to_string(),
            ..Default::default()
        };
        match strength(&self.r#type)? {
            Strength::Hard => Some((Some(vec![term]), None)),
            Strength::Soft => Some((
                None,
                Some(vec![WeightedPodAffinityTerm {
                    pod_affinity_term: term,
                    weight: self.weight,
                }]),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selector() -> BTreeMap<String, String> {
        BTreeMap::from([("app.kubernetes.io/role".to_string(), "broker".to_string())])
    }

    #[test]
    fn test_empty_spec_yields_none() {
        assert!(AffinitySpec::default().to_k8s_affinity(&selector()).is_none());
    }

    #[test]
    fn test_hard_node_affinity() {
        let spec = AffinitySpec {
            node_affinity: Some(NodeAffinity {
                r#type: "hard".to_string(),
                node_selector: vec![NodeSelector {
                    key: "disk".to_string(),
                    values: vec!["ssd".to_string()],
                }],
                weight: 40,
            }),
            ..Default::default()
        };
        let affinity = spec.to_k8s_affinity(&selector()).unwrap();
        let node = affinity.node_affinity.unwrap();
        let required = node.required_during_scheduling_ignored_during_execution.unwrap();
        let expr = &required.node_selector_terms[0].match_expressions.as_ref().unwrap()[0];
        assert_eq!(expr.key, "disk");
        assert_eq!(expr.operator, "In");
        assert!(node.preferred_during_scheduling_ignored_during_execution.is_none());
    }

    #[test]
    fn test_soft_anti_affinity_uses_weight_and_selector() {
        let spec: AffinitySpec =
            serde_json::from_str(r#"{"podAntiAffinity": {"type": "soft"}}"#).unwrap();
        let affinity = spec.to_k8s_affinity(&selector()).unwrap();
        let anti = affinity.pod_anti_affinity.unwrap();
        let preferred = anti.preferred_during_scheduling_ignored_during_execution.unwrap();
        assert_eq!(preferred[0].weight, 40);
        assert_eq!(preferred[0].pod_affinity_term.topology_key, HOSTNAME_TOPOLOGY_KEY);
        assert_eq!(
            preferred[0]
                .pod_affinity_term
                .label_selector
                .as_ref()
                .unwrap()
                .match_labels,
            Some(selector())
        );
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        let spec: AffinitySpec =
            serde_json::from_str(r#"{"podAffinity": {"type": "maybe"}}"#).unwrap();
        assert!(spec.to_k8s_affinity(&selector()).is_none());
    }
}
