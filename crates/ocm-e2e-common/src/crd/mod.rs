//! Custom Resource Definitions of the controllers under test
//!
//! Only the fields the scenarios read or write are modeled; everything else
//! round-trips through the API server untouched because the harness never
//! updates these objects, it only creates them from test data and reads
//! their status.

mod delivery;
mod flux;
mod mpas;
mod replication;

pub use delivery::{
    CommitTemplate, ComponentVersion, ComponentVersionSpec, ComponentVersionStatus, GitSync,
    OciRepositoryRef, PullRequestTemplate, SyncSpec, SyncStatus, Verification, VersionSelector,
};
pub use flux::{
    CrossNamespaceSourceReference, GitRepository, GitRepositoryRef, GitRepositorySpec,
    GitRepositoryStatus, Kustomization, KustomizationSpec, KustomizationStatus, Receiver,
    ReceiverResource, ReceiverSpec, ReceiverStatus, SourceArtifact,
};
pub use mpas::{Credentials, Repository, RepositorySpec, RepositoryStatus};
pub use replication::{
    ComponentSubscription, ComponentSubscriptionSpec, ComponentSubscriptionStatus, OcmRepository,
};

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Reference to an object in the same namespace
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
pub struct LocalObjectReference {
    /// Object name
    pub name: String,
}

impl LocalObjectReference {
    /// Reference the named object
    pub fn new(name: impl Into<String>) -> Self {
        Self { name: name.into() }
    }
}

crate::impl_condition_lookup!(ComponentVersion);
crate::impl_condition_lookup!(GitSync);
crate::impl_condition_lookup!(Repository);
crate::impl_condition_lookup!(ComponentSubscription);
crate::impl_condition_lookup!(GitRepository);
crate::impl_condition_lookup!(Kustomization);
crate::impl_condition_lookup!(Receiver);
