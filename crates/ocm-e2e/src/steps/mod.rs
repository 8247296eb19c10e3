//! Reusable scenario steps
//!
//! Every function here returns a [`Step`](crate::harness::Step) ready to be
//! placed into a [`Feature`](crate::harness::Feature):
//!
//! - [`setup`]: create namespaces, test data, git repositories, components
//! - [`assess`]: wait for reconciliation and check cluster or git state
//! - [`teardown`]: dump state for debugging and clean up

pub mod assess;
pub mod setup;
pub mod teardown;

use kube::core::GroupVersionKind;

use ocm_e2e_common::accessor::{gvk_of, KubeKind};

use crate::oci::ComponentVersion;

/// An object expected in the cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectRef {
    /// Kind of the object
    pub gvk: GroupVersionKind,
    /// Namespace, empty for cluster-scoped kinds
    pub namespace: String,
    /// Name
    pub name: String,
}

impl ObjectRef {
    /// Reference an object of kind `K`
    pub fn of<K: KubeKind>(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            gvk: gvk_of::<K>(),
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

/// A file expected in a git repository
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct File {
    /// Repository name
    pub repository: String,
    /// Path on the default branch
    pub path: String,
}

impl File {
    /// `repository:path`
    pub fn new(repository: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            repository: repository.into(),
            path: path.into(),
        }
    }
}

/// A component version and the registry repository it is pushed to
#[derive(Debug)]
pub struct Component {
    /// Component to push
    pub component: ComponentVersion,
    /// Registry repository, e.g. `ocm-podinfo`
    pub repository: String,
}

impl Component {
    /// Push `component` into `repository`
    pub fn new(component: ComponentVersion, repository: impl Into<String>) -> Self {
        Self {
            component,
            repository: repository.into(),
        }
    }
}

/// A controller whose pods and logs are dumped on teardown
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Controller {
    /// Namespace of the controller pods
    pub namespace: String,
    /// Label selector matching the controller pods, e.g. `app=ocm-controller`
    pub label_selector: String,
}

impl Controller {
    /// Controller pods in `namespace` matching `label_selector`
    pub fn new(namespace: impl Into<String>, label_selector: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            label_selector: label_selector.into(),
        }
    }
}

/// Context key under which [`assess::wait_for_ready`] stores the final
/// status of an object
pub fn status_key(kind: &str, namespace: &str, name: &str) -> String {
    format!("status/{}/{}/{}", kind, namespace, name)
}
