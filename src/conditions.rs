//! Kubernetes-standard status condition helpers
//!
//! Conditions are stable, type-keyed status facts. [`Conditions`] keeps them
//! in insertion order and serializes as a plain list, so the status
//! subresource looks like any other Kubernetes condition array.

use chrono::{SecondsFormat, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;

// AutoMQ condition types, one per pipeline step
pub const CONDITION_S3_READY: &str = "SyncS3ServiceReady";
pub const CONDITION_CONFIGMAP_READY: &str = "SyncConfigmapReady";
pub const CONDITION_CONTROLLER_SCALE: &str = "SyncControllerScale";
pub const CONDITION_CONTROLLER_READY: &str = "SyncControllerReady";
pub const CONDITION_BROKER_SCALE: &str = "SyncBrokerScale";
pub const CONDITION_BROKER_READY: &str = "SyncBrokerReady";
pub const CONDITION_BOOTSTRAP_READY: &str = "SyncBootstrapServiceReady";

// Finalizer name
pub const AUTOMQ_FINALIZER: &str = "apps.cuisongliu.com/automq.finalizer";

/// Status of a condition (True, False, Unknown)
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
pub enum ConditionStatus {
    True,
    False,
    #[default]
    Unknown,
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConditionStatus::True => write!(f, "True"),
            ConditionStatus::False => write!(f, "False"),
            ConditionStatus::Unknown => write!(f, "Unknown"),
        }
    }
}

/// A single status condition
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition
    pub r#type: String,
    /// Status of the condition (True, False, Unknown)
    pub status: ConditionStatus,
    /// Last time the condition transitioned, RFC 3339
    #[serde(default)]
    pub last_transition_time: Option<String>,
    /// Machine-readable reason code
    #[serde(default)]
    pub reason: Option<String>,
    /// Human-readable message
    #[serde(default)]
    pub message: Option<String>,
    /// Generation of the AutoMQ the condition was computed against
    #[serde(default)]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Build a condition without a transition time; the set stamps it.
    pub fn new(condition_type: &str, status: ConditionStatus, reason: &str, message: &str) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status,
            last_transition_time: None,
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            observed_generation: None,
        }
    }

    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }

    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// Current time in the format used for `lastTransitionTime`.
pub fn now_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Insertion-ordered set of conditions keyed by type.
///
/// At most one entry exists per type. Replacing an entry keeps its position.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct Conditions(Vec<Condition>);

impl Conditions {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    /// Set or replace a condition, stamping the transition time with now.
    pub fn set(&mut self, condition: Condition) {
        self.set_at(condition, &now_timestamp());
    }

    /// Set or replace a condition using `now` as the transition time.
    ///
    /// The transition time only moves when the status changes.
    pub fn set_at(&mut self, mut condition: Condition, now: &str) {
        match self.position(&condition.r#type) {
            Some(i) => {
                let existing = &self.0[i];
                condition.last_transition_time = if existing.status != condition.status {
                    Some(now.to_string())
                } else {
                    existing.last_transition_time.clone()
                };
                self.0[i] = condition;
            }
            None => {
                condition.last_transition_time = Some(now.to_string());
                self.0.push(condition);
            }
        }
    }

    /// Remove the condition of the given type; no-op if absent.
    pub fn remove(&mut self, condition_type: &str) -> Option<Condition> {
        self.position(condition_type).map(|i| self.0.remove(i))
    }

    pub fn get(&self, condition_type: &str) -> Option<&Condition> {
        self.0.iter().find(|c| c.r#type == condition_type)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Condition> {
        self.0.iter()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// True when every condition is `True`. Vacuously true when empty.
    pub fn all_true(&self) -> bool {
        self.0.iter().all(Condition::is_true)
    }

    fn position(&self, condition_type: &str) -> Option<usize> {
        self.0.iter().position(|c| c.r#type == condition_type)
    }
}

impl FromIterator<Condition> for Conditions {
    fn from_iter<I: IntoIterator<Item = Condition>>(iter: I) -> Self {
        let mut set = Conditions::new();
        for condition in iter {
            set.set(condition);
        }
        set
    }
}
