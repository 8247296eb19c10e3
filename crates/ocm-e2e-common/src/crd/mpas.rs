//! `mpas.ocm.software` Repository: a git repository managed by the
//! git-controller on a hosting provider.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::{CommitTemplate, LocalObjectReference};
use crate::conditions::Condition;

/// Provider credentials
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Credentials {
    /// Secret holding the provider token
    pub secret_ref: LocalObjectReference,
}

/// Git repository the git-controller creates and maintains
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "mpas.ocm.software",
    version = "v1alpha1",
    kind = "Repository",
    plural = "repositories",
    namespaced,
    status = "RepositoryStatus",
    printcolumn = r#"{"name":"Ready","type":"string","jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct RepositorySpec {
    /// Owner (user or organization) on the provider
    pub owner: String,

    /// Provider name: `gitea`, `github` or `gitlab`
    pub provider: String,

    /// Provider credentials
    pub credentials: Credentials,

    /// Reconcile interval, Go duration syntax
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,

    /// `public` or `private`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,

    /// Whether the owner is an organization
    #[serde(default)]
    pub is_organization: bool,

    /// Provider domain for self-hosted instances
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,

    /// Users listed in the generated CODEOWNERS
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub maintainers: Vec<String>,

    /// `adopt` or `fail` when the repository already exists
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_repository_policy: Option<String>,

    /// Commit metadata for the initial content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_template: Option<CommitTemplate>,
}

/// Observed state of a Repository
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RepositoryStatus {
    /// Status conditions
    #[serde(default)]
    pub conditions: Vec<Condition>,

    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Clone URL of the created repository
    #[serde(default, rename = "repositoryURL", skip_serializing_if = "Option::is_none")]
    pub repository_url: Option<String>,
}
