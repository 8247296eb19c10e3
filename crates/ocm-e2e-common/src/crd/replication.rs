//! `delivery.ocm.software` ComponentSubscription, reconciled by the
//! replication-controller: copies matching component versions from a source
//! OCM repository into a destination one.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{LocalObjectReference, Verification};
use crate::conditions::Condition;

/// OCM repository a subscription reads from or replicates into
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OcmRepository {
    /// Registry URL including the repository prefix
    pub url: String,

    /// Pull or push credentials
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Keeps a component replicated from `source` into `destination`.
///
/// Example:
/// ```yaml
/// apiVersion: delivery.ocm.software/v1alpha1
/// kind: ComponentSubscription
/// metadata:
///   name: componentsubscription-sample
///   namespace: ocm-system
/// spec:
///   component: github.com/acme/podinfo
///   semver: ">=v1.0.0"
///   source:
///     url: registry.ocm-system.svc.cluster.local:5000/ocm-replication
///   interval: 10m
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "delivery.ocm.software",
    version = "v1alpha1",
    kind = "ComponentSubscription",
    plural = "componentsubscriptions",
    namespaced,
    status = "ComponentSubscriptionStatus",
    printcolumn = r#"{"name":"Replicated","type":"string","jsonPath":".status.lastAppliedVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSubscriptionSpec {
    /// Component name, e.g. `github.com/acme/podinfo`
    pub component: String,

    /// Semver constraint selecting the versions to replicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub semver: Option<String>,

    /// Repository the component versions are read from
    pub source: OcmRepository,

    /// Repository they are copied into; unset means the in-cluster registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<OcmRepository>,

    /// Reconcile interval, Go duration syntax
    pub interval: String,

    /// Signatures that must verify before a version is replicated
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<Verification>,

    /// Service account whose pull secrets are used for the source
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_account_name: Option<String>,
}

/// Observed state of a ComponentSubscription
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSubscriptionStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Newest version the controller tried to replicate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_attempted_version: Option<String>,

    /// Newest version replicated successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_version: Option<String>,

    /// Where the replicated component lives
    #[serde(default, rename = "replicatedRepositoryURL", skip_serializing_if = "Option::is_none")]
    pub replicated_repository_url: Option<String>,
}
