//! Status conditions and the predicates evaluated by the poller
//!
//! A predicate is total: it is asked about an observation (`Some(object)` or
//! `None` for "does not exist") and answers `true` or `false`, never an
//! error. A missing condition list, a missing entry, a status the harness
//! does not recognize, or an object that cannot be read as the expected type
//! all answer `false`, which the poller treats as "not converged yet".

use std::fmt;
use std::sync::Arc;

use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::Pod;
use kube::api::DynamicObject;
use schemars::JsonSchema;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::accessor::{decode, KubeKind};

/// The "Ready" condition type set by the OCM and Flux controllers
pub const CONDITION_READY: &str = "Ready";
/// The "Available" condition type for deployments
pub const CONDITION_AVAILABLE: &str = "Available";

/// Deployment condition tracking the rollout
pub const CONDITION_PROGRESSING: &str = "Progressing";

/// `Progressing` reason once the newest ReplicaSet is fully available
pub const REASON_NEW_REPLICA_SET_AVAILABLE: &str = "NewReplicaSetAvailable";

/// Condition status following Kubernetes conventions
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum ConditionStatus {
    /// Condition is true
    True,
    /// Condition is false
    False,
    /// Condition status is unknown
    #[default]
    Unknown,
}

impl ConditionStatus {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::True => "True",
            Self::False => "False",
            Self::Unknown => "Unknown",
        }
    }

    /// Parse a status string; anything unrecognized is `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "True" => Self::True,
            "False" => Self::False,
            _ => Self::Unknown,
        }
    }
}

impl fmt::Display for ConditionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ConditionStatus {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ConditionStatus {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Ok(Self::parse(&s))
    }
}

impl JsonSchema for ConditionStatus {
    fn schema_name() -> String {
        "ConditionStatus".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        String::json_schema(gen)
    }
}

/// Kubernetes-style status condition
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type (e.g. Ready)
    #[serde(rename = "type")]
    pub type_: String,

    /// True, False or Unknown
    #[serde(default)]
    pub status: ConditionStatus,

    /// Machine-readable reason
    #[serde(default)]
    pub reason: String,

    /// Human-readable message
    #[serde(default)]
    pub message: String,

    /// Generation the controller observed when it set this condition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// RFC 3339 timestamp of the last status transition
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl Condition {
    /// Create a condition without generation or timestamp
    pub fn new(
        type_: impl Into<String>,
        status: ConditionStatus,
        reason: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            type_: type_.into(),
            status,
            reason: reason.into(),
            message: message.into(),
            observed_generation: None,
            last_transition_time: None,
        }
    }

    /// Set the observed generation
    pub fn with_observed_generation(mut self, generation: i64) -> Self {
        self.observed_generation = Some(generation);
        self
    }

    /// True when the status is `True`
    pub fn is_true(&self) -> bool {
        self.status == ConditionStatus::True
    }
}

/// First condition of the given type, if any
pub fn find_condition<'a>(conditions: &'a [Condition], condition_type: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == condition_type)
}

/// Anything the poller can read a condition from.
///
/// Lookups return owned conditions so foreign condition types (Deployment,
/// Pod, untyped JSON) can be projected into [`Condition`].
pub trait ConditionLookup {
    /// First condition of the given type
    fn find_condition(&self, condition_type: &str) -> Option<Condition>;

    /// Object-level `status.observedGeneration`, when the kind reports one
    fn observed_generation(&self) -> Option<i64> {
        None
    }
}

impl ConditionLookup for Deployment {
    fn find_condition(&self, condition_type: &str) -> Option<Condition> {
        let status = self.status.as_ref()?;
        status
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == condition_type)
            .map(|c| Condition {
                type_: c.type_.clone(),
                status: ConditionStatus::parse(&c.status),
                reason: c.reason.clone().unwrap_or_default(),
                message: c.message.clone().unwrap_or_default(),
                observed_generation: status.observed_generation,
                last_transition_time: c.last_transition_time.as_ref().map(|t| t.0.to_rfc3339()),
            })
    }

    fn observed_generation(&self) -> Option<i64> {
        self.status.as_ref()?.observed_generation
    }
}

/// A Deployment whose rollout finished: the controller observed the current
/// generation, every desired replica runs the current template and is
/// available, no old replica is left, and `Available=True`.
///
/// `Available=True` alone is not enough during a rolling update because the
/// old ReplicaSet keeps the Deployment available until it is scaled down.
pub fn deployment_rollout_complete(deployment: &Deployment) -> bool {
    let Some(status) = deployment.status.as_ref() else {
        return false;
    };
    let generation = deployment.metadata.generation.unwrap_or(0);
    if status.observed_generation.unwrap_or(0) < generation {
        return false;
    }
    if !deployment
        .find_condition(CONDITION_AVAILABLE)
        .is_some_and(|c| c.is_true())
    {
        return false;
    }
    if let Some(progressing) = deployment.find_condition(CONDITION_PROGRESSING) {
        if progressing.reason != REASON_NEW_REPLICA_SET_AVAILABLE {
            return false;
        }
    }

    let desired = deployment
        .spec
        .as_ref()
        .and_then(|s| s.replicas)
        .unwrap_or(1);
    status.updated_replicas.unwrap_or(0) == desired
        && status.replicas.unwrap_or(0) == desired
        && status.available_replicas.unwrap_or(0) == desired
        && status.unavailable_replicas.unwrap_or(0) == 0
}

impl ConditionLookup for Pod {
    fn find_condition(&self, condition_type: &str) -> Option<Condition> {
        self.status
            .as_ref()?
            .conditions
            .as_ref()?
            .iter()
            .find(|c| c.type_ == condition_type)
            .map(|c| Condition {
                type_: c.type_.clone(),
                status: ConditionStatus::parse(&c.status),
                reason: c.reason.clone().unwrap_or_default(),
                message: c.message.clone().unwrap_or_default(),
                observed_generation: None,
                last_transition_time: c.last_transition_time.as_ref().map(|t| t.0.to_rfc3339()),
            })
    }
}

impl ConditionLookup for DynamicObject {
    fn find_condition(&self, condition_type: &str) -> Option<Condition> {
        self.data
            .pointer("/status/conditions")?
            .as_array()?
            .iter()
            .filter(|c| c.get("type").and_then(|t| t.as_str()) == Some(condition_type))
            .find_map(|c| serde_json::from_value::<Condition>(c.clone()).ok())
    }

    fn observed_generation(&self) -> Option<i64> {
        self.data.pointer("/status/observedGeneration")?.as_i64()
    }
}

/// Condition lookup for CRDs whose status carries a `Vec<Condition>`
#[macro_export]
macro_rules! impl_condition_lookup {
    ($kind:ty) => {
        impl $crate::conditions::ConditionLookup for $kind {
            fn find_condition(&self, condition_type: &str) -> Option<$crate::conditions::Condition> {
                let status = self.status.as_ref()?;
                $crate::conditions::find_condition(&status.conditions, condition_type).cloned()
            }

            fn observed_generation(&self) -> Option<i64> {
                self.status.as_ref()?.observed_generation
            }
        }
    };
}

type ConditionFn<K> = fn(&K, &str) -> Option<Condition>;
type GenerationFn<K> = fn(&K) -> Option<i64>;
type MatchFn<K> = Arc<dyn Fn(&K) -> bool + Send + Sync>;

/// What a wait is waiting for.
///
/// Each variant is evaluated explicitly against an observation; there is no
/// runtime downcast on the typed path because the accessor already decoded
/// the object into `K`.
pub enum Predicate<K> {
    /// The object exists
    Exists,
    /// The object does not exist
    Deleted,
    /// A condition of the given type exists with status `True`
    ConditionTrue {
        /// Condition type, e.g. `Ready`
        condition_type: String,
        /// Condition lookup captured from `K: ConditionLookup`
        lookup: ConditionFn<K>,
        /// Object-level observed generation captured from `K: ConditionLookup`
        observed_generation: GenerationFn<K>,
    },
    /// A caller supplied check
    Matches {
        /// Used in timeout reports
        description: String,
        /// The check itself
        check: MatchFn<K>,
    },
}

impl<K> Clone for Predicate<K> {
    fn clone(&self) -> Self {
        match self {
            Self::Exists => Self::Exists,
            Self::Deleted => Self::Deleted,
            Self::ConditionTrue {
                condition_type,
                lookup,
                observed_generation,
            } => Self::ConditionTrue {
                condition_type: condition_type.clone(),
                lookup: *lookup,
                observed_generation: *observed_generation,
            },
            Self::Matches { description, check } => Self::Matches {
                description: description.clone(),
                check: check.clone(),
            },
        }
    }
}

impl<K> fmt::Debug for Predicate<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}

impl<K> Predicate<K> {
    /// True once the object exists
    pub fn exists() -> Self {
        Self::Exists
    }

    /// True once the object is gone
    pub fn deleted() -> Self {
        Self::Deleted
    }

    /// True once `check` accepts the object
    pub fn matches(
        description: impl Into<String>,
        check: impl Fn(&K) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::Matches {
            description: description.into(),
            check: Arc::new(check),
        }
    }

    /// Whether absence of the object is the success state
    pub fn is_deletion(&self) -> bool {
        matches!(self, Self::Deleted)
    }

    /// Human-readable description for logs and timeout errors
    pub fn describe(&self) -> String {
        match self {
            Self::Exists => "existence".to_string(),
            Self::Deleted => "deletion".to_string(),
            Self::ConditionTrue { condition_type, .. } => format!("condition {}=True", condition_type),
            Self::Matches { description, .. } => description.clone(),
        }
    }

    /// Evaluate against an observation. `None` means the object is absent.
    pub fn evaluate(&self, observed: Option<&K>) -> bool {
        match (self, observed) {
            (Self::Deleted, observed) => observed.is_none(),
            (_, None) => false,
            (Self::Exists, Some(_)) => true,
            (Self::ConditionTrue { condition_type, lookup, .. }, Some(obj)) => {
                lookup(obj, condition_type).is_some_and(|c| c.is_true())
            }
            (Self::Matches { check, .. }, Some(obj)) => check(obj),
        }
    }
}

impl<K: kube::Resource> Predicate<K> {
    /// Evaluate with a generation gate.
    ///
    /// On top of [`Predicate::evaluate`], a present object must have
    /// `metadata.generation > baseline`, and for condition predicates the
    /// controller must have observed at least that generation (condition or
    /// object level, whichever the kind reports). Objects that report no
    /// observed generation at all are judged on `metadata.generation` only.
    pub fn evaluate_since(&self, observed: Option<&K>, baseline: i64) -> bool {
        if !self.evaluate(observed) {
            return false;
        }
        let Some(obj) = observed else {
            return true;
        };
        let generation = obj.meta().generation.unwrap_or(0);
        if generation <= baseline {
            return false;
        }
        match self {
            Self::ConditionTrue {
                condition_type,
                lookup,
                observed_generation,
            } => {
                let seen = lookup(obj, condition_type)
                    .and_then(|c| c.observed_generation)
                    .or_else(|| observed_generation(obj));
                seen.map_or(true, |seen| seen >= generation)
            }
            _ => true,
        }
    }
}

impl<K: ConditionLookup> Predicate<K> {
    /// True once a condition of `condition_type` has status `True`
    pub fn condition_true(condition_type: impl Into<String>) -> Self {
        Self::ConditionTrue {
            condition_type: condition_type.into(),
            lookup: |obj: &K, t: &str| obj.find_condition(t),
            observed_generation: |obj: &K| obj.observed_generation(),
        }
    }

    /// Shorthand for `condition_true("Ready")`
    pub fn ready() -> Self {
        Self::condition_true(CONDITION_READY)
    }
}

impl Predicate<DynamicObject> {
    /// Check an untyped object as a concrete kind.
    ///
    /// An object that cannot be read as `T` does not match; it is not an
    /// error.
    pub fn matches_as<T: KubeKind>(
        description: impl Into<String>,
        check: impl Fn(&T) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self::matches(description, move |obj: &DynamicObject| {
            decode::<T>(obj.clone()).is_ok_and(|typed| check(&typed))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::apps::v1::{DeploymentCondition, DeploymentSpec, DeploymentStatus};
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube::api::ApiResource;
    use serde_json::json;

    fn deployment(generation: i64, observed: i64, available: &str) -> Deployment {
        Deployment {
            metadata: ObjectMeta {
                name: Some("registry".to_string()),
                namespace: Some("ocm-system".to_string()),
                generation: Some(generation),
                ..Default::default()
            },
            status: Some(DeploymentStatus {
                observed_generation: Some(observed),
                conditions: Some(vec![DeploymentCondition {
                    type_: CONDITION_AVAILABLE.to_string(),
                    status: available.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn dynamic_sync(conditions: serde_json::Value) -> DynamicObject {
        let ar = ApiResource {
            group: "delivery.ocm.software".to_string(),
            version: "v1alpha1".to_string(),
            api_version: "delivery.ocm.software/v1alpha1".to_string(),
            kind: "Sync".to_string(),
            plural: "syncs".to_string(),
        };
        DynamicObject::new("git-sample", &ar)
            .within("ocm-system")
            .data(json!({ "status": { "conditions": conditions } }))
    }

    #[test]
    fn absent_object_satisfies_only_deletion() {
        assert!(Predicate::<Deployment>::deleted().evaluate(None));
        assert!(!Predicate::<Deployment>::exists().evaluate(None));
        assert!(!Predicate::<Deployment>::condition_true(CONDITION_AVAILABLE).evaluate(None));
        assert!(!Predicate::<Deployment>::matches("anything", |_| true).evaluate(None));
    }

    #[test]
    fn present_object_fails_deletion() {
        let d = deployment(1, 1, "True");
        assert!(!Predicate::deleted().evaluate(Some(&d)));
        assert!(Predicate::exists().evaluate(Some(&d)));
    }

    #[test]
    fn condition_true_requires_matching_type_and_true_status() {
        let available = deployment(1, 1, "True");
        let unavailable = deployment(1, 1, "False");
        let unknown = deployment(1, 1, "Progressing?");
        let p = Predicate::<Deployment>::condition_true(CONDITION_AVAILABLE);
        assert!(p.evaluate(Some(&available)));
        assert!(!p.evaluate(Some(&unavailable)));
        assert!(!p.evaluate(Some(&unknown)));
        assert!(!Predicate::<Deployment>::ready().evaluate(Some(&available)));
    }

    #[test]
    fn missing_status_or_condition_list_is_false_not_error() {
        let mut d = deployment(1, 1, "True");
        d.status = None;
        assert!(!Predicate::<Deployment>::condition_true(CONDITION_AVAILABLE).evaluate(Some(&d)));

        let empty = dynamic_sync(json!(null));
        assert!(!Predicate::<DynamicObject>::ready().evaluate(Some(&empty)));

        let malformed = dynamic_sync(json!("not-a-list"));
        assert!(!Predicate::<DynamicObject>::ready().evaluate(Some(&malformed)));
    }

    #[test]
    fn dynamic_objects_are_read_leniently() {
        let obj = dynamic_sync(json!([
            { "type": "Reconciling", "status": "True" },
            { "type": "Ready", "status": "True", "reason": "Succeeded", "observedGeneration": 2 }
        ]));
        assert!(Predicate::<DynamicObject>::ready().evaluate(Some(&obj)));
        let ready = obj.find_condition(CONDITION_READY).unwrap();
        assert_eq!(ready.reason, "Succeeded");
        assert_eq!(ready.observed_generation, Some(2));
    }

    /// Story: evaluating the same unchanged object twice gives the same
    /// answer; the predicate never mutates what it inspects.
    #[test]
    fn story_condition_evaluation_is_idempotent() {
        let obj = dynamic_sync(json!([{ "type": "Ready", "status": "False" }]));
        let before = serde_json::to_value(&obj).unwrap();
        let p = Predicate::<DynamicObject>::ready();
        let first = p.evaluate(Some(&obj));
        let second = p.evaluate(Some(&obj));
        assert_eq!(first, second);
        assert_eq!(serde_json::to_value(&obj).unwrap(), before);
    }

    #[test]
    fn typed_match_over_dynamic_object_is_false_on_cast_failure() {
        let not_a_secret = dynamic_sync(json!([])).data(json!({ "data": "not-a-map", "type": 7 }));
        assert!(decode::<Secret>(not_a_secret.clone()).is_err());

        let p = Predicate::<DynamicObject>::matches_as::<Secret>("any secret", |_: &Secret| true);
        assert!(!p.evaluate(Some(&not_a_secret)));
    }

    #[test]
    fn generation_gate_rejects_stale_ready() {
        let p = Predicate::<Deployment>::condition_true(CONDITION_AVAILABLE);

        // Still the pre-patch generation: stale Available=True
        let stale = deployment(3, 3, "True");
        assert!(p.evaluate(Some(&stale)));
        assert!(!p.evaluate_since(Some(&stale), 3));

        // Generation bumped but the controller has not caught up
        let lagging = deployment(4, 3, "True");
        assert!(!p.evaluate_since(Some(&lagging), 3));

        // Reconciled after the patch
        let fresh = deployment(4, 4, "True");
        assert!(p.evaluate_since(Some(&fresh), 3));
    }

    fn rolled_out(generation: i64) -> Deployment {
        let mut d = deployment(generation, generation, "True");
        d.spec = Some(DeploymentSpec {
            replicas: Some(2),
            ..Default::default()
        });
        let status = d.status.as_mut().unwrap();
        status.replicas = Some(2);
        status.updated_replicas = Some(2);
        status.available_replicas = Some(2);
        status.conditions.as_mut().unwrap().push(DeploymentCondition {
            type_: CONDITION_PROGRESSING.to_string(),
            status: "True".to_string(),
            reason: Some(REASON_NEW_REPLICA_SET_AVAILABLE.to_string()),
            ..Default::default()
        });
        d
    }

    #[test]
    fn finished_rollout_is_complete() {
        assert!(deployment_rollout_complete(&rolled_out(4)));
    }

    /// Story: after a restart the Deployment stays Available on its old
    /// ReplicaSet while the new pods come up. That is not a finished
    /// rollout, even though the generation was observed.
    #[test]
    fn story_mid_rollout_is_not_complete() {
        let mut d = rolled_out(4);
        let status = d.status.as_mut().unwrap();
        status.updated_replicas = Some(1);
        status.unavailable_replicas = Some(1);
        status.conditions.as_mut().unwrap()[1].reason = Some("ReplicaSetUpdated".to_string());
        assert!(Predicate::<Deployment>::condition_true(CONDITION_AVAILABLE).evaluate_since(Some(&d), 3));
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn old_replicas_still_running_keep_rollout_incomplete() {
        let mut d = rolled_out(4);
        d.status.as_mut().unwrap().replicas = Some(3);
        assert!(!deployment_rollout_complete(&d));
    }

    #[test]
    fn unobserved_generation_or_missing_status_is_incomplete() {
        let mut lagging = rolled_out(4);
        lagging.status.as_mut().unwrap().observed_generation = Some(3);
        assert!(!deployment_rollout_complete(&lagging));

        let mut bare = rolled_out(4);
        bare.status = None;
        assert!(!deployment_rollout_complete(&bare));
    }

    #[test]
    fn generation_gate_still_accepts_deletion() {
        assert!(Predicate::<Deployment>::deleted().evaluate_since(None, 10));
    }

    #[test]
    fn condition_status_round_trips_through_json() {
        let c = Condition::new("Ready", ConditionStatus::True, "Succeeded", "ok")
            .with_observed_generation(5);
        let v = serde_json::to_value(&c).unwrap();
        assert_eq!(v["type"], "Ready");
        assert_eq!(v["status"], "True");
        assert_eq!(v["observedGeneration"], 5);
        let back: Condition = serde_json::from_value(v).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn unrecognized_status_parses_as_unknown() {
        let c: Condition =
            serde_json::from_value(json!({ "type": "Ready", "status": "Maybe" })).unwrap();
        assert_eq!(c.status, ConditionStatus::Unknown);
        assert!(!c.is_true());
    }

    #[test]
    fn describe_names_the_expectation() {
        assert_eq!(
            Predicate::<DynamicObject>::ready().describe(),
            "condition Ready=True"
        );
        assert_eq!(Predicate::<DynamicObject>::deleted().describe(), "deletion");
    }
}
