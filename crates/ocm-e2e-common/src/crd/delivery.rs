//! `delivery.ocm.software` kinds: ComponentVersion and Sync
//!
//! ComponentVersion is reconciled by the ocm-controller, Sync by the
//! git-controller. Both report readiness through a `Ready` condition.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::LocalObjectReference;
use crate::conditions::Condition;

/// Which versions of a component to reconcile
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionSelector {
    /// Semver constraint, e.g. `v6.0.0` or `>=v6.0.0`
    pub semver: String,
}

/// OCI repository holding component descriptors
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct OciRepositoryRef {
    /// Registry URL including the repository prefix
    pub url: String,

    /// Pull secret for the registry
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<LocalObjectReference>,
}

/// Signature verification entry
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Verification {
    /// Signature name in the component descriptor
    pub name: String,

    /// Secret holding the public key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key_secret_ref: Option<LocalObjectReference>,
}

/// A version of an OCM component the ocm-controller should fetch and verify.
///
/// Example:
/// ```yaml
/// apiVersion: delivery.ocm.software/v1alpha1
/// kind: ComponentVersion
/// metadata:
///   name: podinfo
///   namespace: ocm-system
/// spec:
///   component: github.com/acme/podinfo
///   version:
///     semver: v6.0.0
///   repository:
///     url: registry.ocm-system.svc.cluster.local:5000
///   interval: 10m
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "delivery.ocm.software",
    version = "v1alpha1",
    kind = "ComponentVersion",
    plural = "componentversions",
    namespaced,
    status = "ComponentVersionStatus",
    printcolumn = r#"{"name":"Version","type":"string","jsonPath":".status.reconciledVersion"}"#,
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionSpec {
    /// Component name, e.g. `github.com/acme/podinfo`
    pub component: String,

    /// Version constraint
    pub version: VersionSelector,

    /// Where the component descriptors live
    pub repository: OciRepositoryRef,

    /// Reconcile interval, Go duration syntax
    pub interval: String,

    /// Signatures that must verify before the version is accepted
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub verify: Vec<Verification>,
}

/// Observed state of a ComponentVersion
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ComponentVersionStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Version that was fetched and verified
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconciled_version: Option<String>,

    /// Whether all configured signatures verified
    #[serde(default)]
    pub verified: bool,
}

/// Commit metadata used by the git-controller
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommitTemplate {
    /// Author name
    pub name: String,
    /// Author email
    pub email: String,
    /// Commit message
    pub message: String,
    /// Branch the change is based on
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    /// Branch the change is pushed to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_branch: Option<String>,
}

/// Pull request metadata for syncs that open a PR instead of pushing
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PullRequestTemplate {
    /// PR title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// PR description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Base branch
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base: Option<String>,
}

/// Pushes the content of a snapshot into a git repository.
///
/// The generated struct is `GitSync`; the kind on the wire is `Sync`.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "delivery.ocm.software",
    version = "v1alpha1",
    kind = "Sync",
    root = "GitSync",
    plural = "syncs",
    namespaced,
    status = "SyncStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SyncSpec {
    /// Snapshot whose content is synced
    pub snapshot_ref: LocalObjectReference,

    /// Target `Repository` object
    pub repository_ref: LocalObjectReference,

    /// Reconcile interval, Go duration syntax
    pub interval: String,

    /// Commit metadata
    pub commit_template: CommitTemplate,

    /// Path inside the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub_path: Option<String>,

    /// Remove files no longer present in the snapshot
    #[serde(default)]
    pub prune: bool,

    /// Open a pull request instead of pushing to the target branch
    #[serde(default)]
    pub automatic_pull_request_creation: bool,

    /// Pull request metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_request_template: Option<PullRequestTemplate>,
}

/// Observed state of a Sync
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Digest of the synced snapshot
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,

    /// Number of the pull request that was opened, if any
    #[serde(default, rename = "pullRequestID", skip_serializing_if = "Option::is_none")]
    pub pull_request_id: Option<i64>,
}
