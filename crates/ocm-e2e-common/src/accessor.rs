//! Resource Accessor: thin façade over the cluster API
//!
//! Every call is a single request. There is no caching and no retry: a
//! transport failure propagates to the caller on the first attempt, and
//! the poller decides what that means for a wait. Kinds must be registered
//! in the accessor's [`Scheme`] before they can be read or written.
//!
//! The trait is object safe and untyped (`DynamicObject`) so it can be
//! mocked; [`TypedAccess`] layers parametric `get::<K>`-style calls on top
//! so callers never downcast at runtime.

use std::fmt::Debug;
use std::sync::RwLock;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DeleteParams, DynamicObject, ListParams, PostParams};
use kube::core::{GroupVersionKind, TypeMeta};
use kube::{Client, Resource};
#[cfg(test)]
use mockall::automock;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, trace};

use crate::scheme::Scheme;
use crate::{Error, Result};

/// Bounds every typed kind handled by the harness satisfies
pub trait KubeKind:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> KubeKind for K where
    K: Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Group/version/kind of a compile-time known kind
pub fn gvk_of<K: KubeKind>() -> GroupVersionKind {
    GroupVersionKind::gvk(&K::group(&()), &K::version(&()), &K::kind(&()))
}

/// Decode an untyped object into `K`.
///
/// Missing type metadata is filled in from `K`, since list responses omit
/// it on items.
pub fn decode<K: KubeKind>(mut obj: DynamicObject) -> Result<K> {
    if obj.types.is_none() {
        obj.types = Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
    }
    let value = serde_json::to_value(&obj).map_err(|e| Error::decode(K::kind(&()), e.to_string()))?;
    serde_json::from_value(value).map_err(|e| Error::decode(K::kind(&()), e.to_string()))
}

/// Encode a typed object as a `DynamicObject`
pub fn encode<K: KubeKind>(obj: &K) -> Result<DynamicObject> {
    let value = serde_json::to_value(obj).map_err(|e| Error::decode(K::kind(&()), e.to_string()))?;
    let mut dynamic: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::decode(K::kind(&()), e.to_string()))?;
    if dynamic.types.is_none() {
        dynamic.types = Some(TypeMeta {
            api_version: K::api_version(&()).into_owned(),
            kind: K::kind(&()).into_owned(),
        });
    }
    Ok(dynamic)
}

/// Group/version/kind recorded in an untyped object's type metadata
pub fn gvk_of_object(obj: &DynamicObject) -> Result<GroupVersionKind> {
    let types = obj.types.as_ref().ok_or_else(|| {
        Error::decode(
            "DynamicObject",
            format!(
                "object {} has no apiVersion/kind",
                obj.metadata.name.as_deref().unwrap_or_default()
            ),
        )
    })?;
    GroupVersionKind::try_from(types).map_err(|e| Error::decode(types.kind.clone(), e.to_string()))
}

/// Single-object and collection access to the cluster API.
///
/// An empty namespace addresses cluster-scoped kinds (and, for `list`,
/// every namespace). An empty label selector lists everything.
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceAccessor: Send + Sync {
    /// Fetch one object; `NotFound` if it does not exist
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<DynamicObject>;

    /// List objects, optionally filtered by a label selector
    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>>;

    /// Create an object; `AlreadyExists` on collision
    async fn create(&self, obj: &DynamicObject) -> Result<()>;

    /// Delete an object; `NotFound` if it does not exist
    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()>;

    /// Extend the type registry with a kind known only at runtime
    fn register_api_resource(&self, ar: ApiResource);
}

/// Typed helpers over any [`ResourceAccessor`]
#[async_trait]
pub trait TypedAccess: ResourceAccessor {
    /// Register a compile-time known kind
    fn register<K: KubeKind>(&self) {
        self.register_api_resource(ApiResource::erase::<K>(&()));
    }

    /// Fetch and decode one object
    async fn get_as<K: KubeKind>(&self, namespace: &str, name: &str) -> Result<K> {
        let obj = self.get(&gvk_of::<K>(), namespace, name).await?;
        decode(obj)
    }

    /// List and decode objects
    async fn list_as<K: KubeKind>(&self, namespace: &str, label_selector: &str) -> Result<Vec<K>> {
        let items = self.list(&gvk_of::<K>(), namespace, label_selector).await?;
        items.into_iter().map(decode).collect()
    }

    /// Encode and create one object
    async fn create_typed<K: KubeKind>(&self, obj: &K) -> Result<()> {
        let dynamic = encode(obj)?;
        self.create(&dynamic).await
    }

    /// Delete one object of kind `K`
    async fn delete_as<K: KubeKind>(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(&gvk_of::<K>(), namespace, name).await
    }
}

impl<A: ResourceAccessor + ?Sized> TypedAccess for A {}

/// [`ResourceAccessor`] backed by a kube client
pub struct KubeAccessor {
    client: Client,
    scheme: RwLock<Scheme>,
}

impl KubeAccessor {
    /// Wrap a client with a scheme
    pub fn new(client: Client, scheme: Scheme) -> Self {
        Self {
            client,
            scheme: RwLock::new(scheme),
        }
    }

    /// Underlying client, for calls outside the accessor contract (logs,
    /// port-forward, patches)
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Whether a kind is currently registered
    pub fn is_registered(&self, gvk: &GroupVersionKind) -> bool {
        self.scheme
            .read()
            .map(|s| s.is_registered(gvk))
            .unwrap_or(false)
    }

    fn api(&self, gvk: &GroupVersionKind, namespace: &str) -> Result<Api<DynamicObject>> {
        let ar = self
            .scheme
            .read()
            .map_err(|_| Error::internal_with_context("scheme", "type registry lock poisoned"))?
            .resolve(gvk)?;
        Ok(if namespace.is_empty() {
            Api::all_with(self.client.clone(), &ar)
        } else {
            Api::namespaced_with(self.client.clone(), namespace, &ar)
        })
    }
}

#[async_trait]
impl ResourceAccessor for KubeAccessor {
    async fn get(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<DynamicObject> {
        trace!(kind = %gvk.kind, namespace, name, "get");
        self.api(gvk, namespace)?
            .get(name)
            .await
            .map_err(|e| Error::from_kube(e, &gvk.kind, namespace, name))
    }

    async fn list(
        &self,
        gvk: &GroupVersionKind,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<DynamicObject>> {
        trace!(kind = %gvk.kind, namespace, label_selector, "list");
        let mut lp = ListParams::default();
        if !label_selector.is_empty() {
            lp = lp.labels(label_selector);
        }
        let list = self
            .api(gvk, namespace)?
            .list(&lp)
            .await
            .map_err(|e| Error::from_kube(e, &gvk.kind, namespace, ""))?;
        Ok(list.items)
    }

    async fn create(&self, obj: &DynamicObject) -> Result<()> {
        let gvk = gvk_of_object(obj)?;
        let namespace = obj.metadata.namespace.as_deref().unwrap_or_default();
        let name = obj.metadata.name.as_deref().unwrap_or_default();
        self.api(&gvk, namespace)?
            .create(&PostParams::default(), obj)
            .await
            .map_err(|e| Error::from_kube(e, &gvk.kind, namespace, name))?;
        debug!(kind = %gvk.kind, namespace, name, "created");
        Ok(())
    }

    async fn delete(&self, gvk: &GroupVersionKind, namespace: &str, name: &str) -> Result<()> {
        self.api(gvk, namespace)?
            .delete(name, &DeleteParams::default())
            .await
            .map_err(|e| Error::from_kube(e, &gvk.kind, namespace, name))?;
        debug!(kind = %gvk.kind, namespace, name, "deleted");
        Ok(())
    }

    fn register_api_resource(&self, ar: ApiResource) {
        match self.scheme.write() {
            Ok(mut scheme) => {
                debug!(kind = %ar.kind, api_version = %ar.api_version, "registered kind");
                scheme.register_api_resource(ar);
            }
            Err(mut poisoned) => poisoned.get_mut().register_api_resource(ar),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crd::ComponentVersion;
    use k8s_openapi::api::core::v1::Secret;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use mockall::predicate::eq;
    use std::collections::BTreeMap;

    fn secret() -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some("creds".to_string()),
                namespace: Some("ocm-system".to_string()),
                ..Default::default()
            },
            string_data: Some(BTreeMap::from([("token".to_string(), "abc".to_string())])),
            ..Default::default()
        }
    }

    #[test]
    fn gvk_of_typed_kinds() {
        let gvk = gvk_of::<Secret>();
        assert_eq!((gvk.group.as_str(), gvk.version.as_str(), gvk.kind.as_str()), ("", "v1", "Secret"));
        let gvk = gvk_of::<ComponentVersion>();
        assert_eq!(gvk.group, "delivery.ocm.software");
    }

    #[test]
    fn encode_then_decode_keeps_payload() {
        let dynamic = encode(&secret()).unwrap();
        assert_eq!(gvk_of_object(&dynamic).unwrap(), gvk_of::<Secret>());
        assert_eq!(dynamic.data["stringData"]["token"], "abc");
        let back: Secret = decode(dynamic).unwrap();
        assert_eq!(back.metadata.name.as_deref(), Some("creds"));
    }

    #[test]
    fn decode_fills_missing_type_metadata() {
        let mut dynamic = encode(&secret()).unwrap();
        dynamic.types = None;
        let back: Secret = decode(dynamic).unwrap();
        assert_eq!(back.metadata.namespace.as_deref(), Some("ocm-system"));
    }

    #[test]
    fn decode_of_wrong_shape_is_a_decode_error() {
        let ar = ApiResource::erase::<ComponentVersion>(&());
        let broken = DynamicObject::new("podinfo", &ar).data(serde_json::json!({ "spec": "oops" }));
        let err = decode::<ComponentVersion>(broken).unwrap_err();
        assert!(matches!(err, Error::Decode { ref kind, .. } if kind == "ComponentVersion"));
    }

    #[test]
    fn object_without_types_has_no_gvk() {
        let mut dynamic = encode(&secret()).unwrap();
        dynamic.types = None;
        assert!(matches!(gvk_of_object(&dynamic), Err(Error::Decode { .. })));
    }

    #[tokio::test]
    async fn typed_get_decodes_through_the_untyped_call() {
        let mut accessor = MockResourceAccessor::new();
        let obj = encode(&secret()).unwrap();
        accessor
            .expect_get()
            .with(eq(gvk_of::<Secret>()), eq("ocm-system"), eq("creds"))
            .times(1)
            .returning(move |_, _, _| Ok(obj.clone()));

        let got: Secret = accessor.get_as("ocm-system", "creds").await.unwrap();
        assert_eq!(got.metadata.name.as_deref(), Some("creds"));
    }

    #[tokio::test]
    async fn typed_get_propagates_not_found() {
        let mut accessor = MockResourceAccessor::new();
        accessor
            .expect_get()
            .returning(|gvk, ns, name| Err(Error::not_found(gvk.kind.clone(), ns, name)));

        let err = accessor.get_as::<Secret>("ocm-system", "missing").await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn typed_create_sends_encoded_object() {
        let mut accessor = MockResourceAccessor::new();
        accessor
            .expect_create()
            .withf(|obj| obj.metadata.name.as_deref() == Some("creds") && obj.types.is_some())
            .times(1)
            .returning(|_| Ok(()));
        accessor.create_typed(&secret()).await.unwrap();
    }

    #[test]
    fn register_forwards_erased_resource() {
        let mut accessor = MockResourceAccessor::new();
        accessor
            .expect_register_api_resource()
            .withf(|ar| ar.kind == "ComponentVersion" && ar.plural == "componentversions")
            .times(1)
            .return_const(());
        accessor.register::<ComponentVersion>();
    }
}
