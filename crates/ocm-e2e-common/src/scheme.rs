//! Type registry mapping group/version/kind to API resources
//!
//! The accessor only talks to kinds that were registered here. Core kinds
//! come pre-registered via [`Scheme::with_builtin_types`]; custom resources
//! of the controllers under test must be added by a setup step before any
//! get or list of that kind.

use std::collections::HashMap;

use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Pod, Secret, Service, ServiceAccount};
use kube::api::ApiResource;
use kube::core::GroupVersionKind;
use kube::Resource;

use crate::{Error, Result};

/// Registered kinds, keyed by group/version/kind
#[derive(Clone, Debug, Default)]
pub struct Scheme {
    types: HashMap<GroupVersionKind, ApiResource>,
}

impl Scheme {
    /// An empty scheme
    pub fn new() -> Self {
        Self::default()
    }

    /// A scheme with the core kinds the harness touches directly
    pub fn with_builtin_types() -> Self {
        let mut scheme = Self::new();
        scheme.register::<Namespace>();
        scheme.register::<Secret>();
        scheme.register::<ConfigMap>();
        scheme.register::<Pod>();
        scheme.register::<Service>();
        scheme.register::<ServiceAccount>();
        scheme.register::<Deployment>();
        scheme.register::<ReplicaSet>();
        scheme
    }

    /// Register a compile-time known kind
    pub fn register<K: Resource<DynamicType = ()>>(&mut self) {
        self.register_api_resource(ApiResource::erase::<K>(&()));
    }

    /// Register a kind known only at runtime
    pub fn register_api_resource(&mut self, ar: ApiResource) {
        let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
        self.types.insert(gvk, ar);
    }

    /// Whether the kind has been registered
    pub fn is_registered(&self, gvk: &GroupVersionKind) -> bool {
        self.types.contains_key(gvk)
    }

    /// Resolve a kind to its API resource, failing with `UnknownKind`
    pub fn resolve(&self, gvk: &GroupVersionKind) -> Result<ApiResource> {
        self.types
            .get(gvk)
            .cloned()
            .ok_or_else(|| Error::UnknownKind {
                kind: display_gvk(gvk),
            })
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.types.len()
    }

    /// True when nothing is registered
    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}

/// `group/version/Kind`, or `version/Kind` for the core group
pub fn display_gvk(gvk: &GroupVersionKind) -> String {
    if gvk.group.is_empty() {
        format!("{}/{}", gvk.version, gvk.kind)
    } else {
        format!("{}/{}/{}", gvk.group, gvk.version, gvk.kind)
    }
}
