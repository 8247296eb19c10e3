//! Kubernetes client and manifest utilities
//!
//! Client construction with timeouts, manifest parsing into
//! `DynamicObject`s, test-data folder decoding, and server-side apply for
//! install bundles whose kinds are not in the harness scheme (Flux, Gitea).
//! Apply resolves each kind through API discovery.

use std::path::Path;
use std::time::Duration;

use kube::api::{Api, ApiResource, DynamicObject, GroupVersionKind, Patch, PatchParams};
use kube::discovery::{pinned_kind, Scope};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde_json::Value;
use tracing::{debug, info};

use crate::retry::{retry_with_backoff, RetryConfig};
use crate::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "ocm-e2e";

/// Default connection timeout for kube clients (5s is plenty for a local kind cluster)
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a kube client from optional kubeconfig path with default timeouts
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client> {
    let mut config = match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig {}: {}", path.display(), e),
                )
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|e| {
                    Error::internal_with_context(
                        "create_client",
                        format!("failed to load kubeconfig: {}", e),
                    )
                })?
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        })?,
    };
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}

/// Create a client, retrying while a freshly created cluster's API server
/// comes up
pub async fn create_client_with_retry(kubeconfig: Option<&Path>) -> Result<Client> {
    retry_with_backoff(&RetryConfig::default(), "create_client", || async move {
        let client = create_client(kubeconfig).await?;
        client
            .apiserver_version()
            .await
            .map_err(|e| Error::from_kube(e, "Version", "", "apiserver"))?;
        Ok::<_, Error>(client)
    })
    .await
}

// =============================================================================
// Manifests
// =============================================================================

/// Parsed manifest metadata for applying to Kubernetes
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// The parsed JSON value
    pub value: Value,
    /// Resource name
    pub name: String,
    /// Optional namespace
    pub namespace: Option<String>,
    /// API resource definition
    pub api_resource: ApiResource,
}

/// Extract metadata from a parsed manifest
pub fn parse_manifest_value(value: Value) -> Result<ManifestMetadata> {
    let api_version = value
        .get("apiVersion")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::internal_with_context("parse_manifest", "manifest missing apiVersion"))?
        .to_string();

    let kind = value
        .get("kind")
        .and_then(|v| v.as_str())
        .ok_or_else(|| Error::internal_with_context("parse_manifest", "manifest missing kind"))?
        .to_string();

    let name = value
        .pointer("/metadata/name")
        .and_then(|v| v.as_str())
        .ok_or_else(|| {
            Error::internal_with_context("parse_manifest", "manifest missing metadata.name")
        })?
        .to_string();

    let namespace = value
        .pointer("/metadata/namespace")
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    let api_resource = build_api_resource(&api_version, &kind);

    Ok(ManifestMetadata {
        value,
        name,
        namespace,
        api_resource,
    })
}

/// Parse a single JSON or YAML manifest
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata> {
    let value: Value = if manifest.trim().starts_with('{') {
        serde_json::from_str(manifest).map_err(|e| {
            Error::internal_with_context(
                "parse_manifest",
                format!("failed to parse manifest as JSON: {}", e),
            )
        })?
    } else {
        crate::yaml::parse_documents(manifest)?
            .into_iter()
            .next()
            .ok_or_else(|| Error::internal_with_context("parse_manifest", "empty manifest"))?
    };
    parse_manifest_value(value)
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use ocm_e2e_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("delivery.ocm.software/v1alpha1");
/// assert_eq!(group, "delivery.ocm.software");
/// assert_eq!(version, "v1alpha1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Build an ApiResource from an apiVersion and kind
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Kinds whose plural does not follow the simple rules
const KIND_PLURALS: &[(&str, &str)] = &[
    ("endpoints", "endpoints"),
    ("podsecuritypolicy", "podsecuritypolicies"),
];

/// Pluralize a Kubernetes resource kind
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    for (singular, plural) in KIND_PLURALS {
        if *singular == lower {
            return (*plural).to_string();
        }
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Kinds that never carry a namespace
const CLUSTER_SCOPED_KINDS: &[&str] = &[
    "Namespace",
    "CustomResourceDefinition",
    "ClusterRole",
    "ClusterRoleBinding",
    "PersistentVolume",
    "StorageClass",
];

/// Whether `kind` is one of the well-known cluster-scoped kinds
pub fn is_cluster_scoped(kind: &str) -> bool {
    CLUSTER_SCOPED_KINDS.contains(&kind)
}

/// Convert a parsed manifest into a `DynamicObject`.
///
/// With `namespace` set, every namespaced object is moved into it,
/// overriding whatever the manifest says.
pub fn to_dynamic_object(mut value: Value, namespace: Option<&str>) -> Result<DynamicObject> {
    let kind = value
        .get("kind")
        .and_then(|k| k.as_str())
        .unwrap_or_default()
        .to_string();
    if let Some(ns) = namespace {
        if !is_cluster_scoped(&kind) {
            match value.pointer_mut("/metadata") {
                Some(Value::Object(meta)) => {
                    meta.insert("namespace".to_string(), Value::String(ns.to_string()));
                }
                _ => {
                    return Err(Error::decode(kind, "manifest has no metadata object"));
                }
            }
        }
    }
    let obj: DynamicObject =
        serde_json::from_value(value).map_err(|e| Error::decode(kind.clone(), e.to_string()))?;
    if obj.types.is_none() {
        return Err(Error::decode(kind, "manifest missing apiVersion/kind"));
    }
    Ok(obj)
}

/// Decode every document of a multi-document YAML string into objects
pub fn decode_objects(yaml: &str, namespace: Option<&str>) -> Result<Vec<DynamicObject>> {
    crate::yaml::parse_documents(yaml)?
        .into_iter()
        .map(|v| to_dynamic_object(v, namespace))
        .collect()
}

/// Compile a shell-style file name pattern such as `*.yaml` or
/// `sync-[0-9].yml`
pub fn file_pattern(pattern: &str) -> Result<glob::Pattern> {
    glob::Pattern::new(pattern).map_err(|e| Error::invalid_pattern(pattern, e))
}

/// Match a file name against a shell-style pattern
pub fn matches_pattern(file_name: &str, pattern: &str) -> Result<bool> {
    Ok(file_pattern(pattern)?.matches(file_name))
}

/// Decode every file in `folder` whose name matches `pattern`.
///
/// Files are processed in name order so objects are created
/// deterministically.
pub fn decode_each_file(
    folder: &Path,
    pattern: &str,
    namespace: Option<&str>,
) -> Result<Vec<DynamicObject>> {
    let pattern = file_pattern(pattern)?;
    let mut files: Vec<_> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|t| t.is_file()).unwrap_or(false))
        .filter(|entry| pattern.matches(&entry.file_name().to_string_lossy()))
        .map(|entry| entry.path())
        .collect();
    files.sort();

    let mut objects = Vec::new();
    for path in files {
        let content = std::fs::read_to_string(&path)?;
        let decoded = decode_objects(&content, namespace).map_err(|e| {
            Error::internal_with_context("decode_each_file", format!("{}: {}", path.display(), e))
        })?;
        debug!(file = %path.display(), objects = decoded.len(), "decoded test data");
        objects.extend(decoded);
    }
    Ok(objects)
}

// =============================================================================
// Server-side apply
// =============================================================================

/// Apply ordering: CRDs and namespaces first, workloads last
pub fn kind_priority(kind: &str) -> u8 {
    match kind {
        "Namespace" => 0,
        "CustomResourceDefinition" => 1,
        "ServiceAccount" => 2,
        "ClusterRole" | "Role" => 3,
        "ClusterRoleBinding" | "RoleBinding" => 4,
        "ConfigMap" | "Secret" => 5,
        "PersistentVolumeClaim" => 6,
        "Service" => 7,
        "Deployment" | "DaemonSet" | "StatefulSet" => 8,
        _ => 10,
    }
}

/// Build the Api a manifest is written through.
///
/// The kind is resolved against the API server, so the plural and the scope
/// come from discovery rather than from the manifest. Namespaced objects
/// without a namespace land in the client's default namespace.
pub async fn manifest_api(client: &Client, manifest: &ManifestMetadata) -> Result<Api<DynamicObject>> {
    let ar = &manifest.api_resource;
    let gvk = GroupVersionKind::gvk(&ar.group, &ar.version, &ar.kind);
    let (resolved, caps) = pinned_kind(client, &gvk).await.map_err(|e| {
        Error::from_kube(
            e,
            &ar.kind,
            manifest.namespace.as_deref().unwrap_or_default(),
            &manifest.name,
        )
    })?;
    Ok(match (caps.scope, manifest.namespace.as_deref()) {
        (Scope::Cluster, _) => Api::all_with(client.clone(), &resolved),
        (Scope::Namespaced, Some(ns)) => Api::namespaced_with(client.clone(), ns, &resolved),
        (Scope::Namespaced, None) => Api::default_namespaced_with(client.clone(), &resolved),
    })
}

/// Server-side apply one parsed manifest
pub async fn apply_manifest(client: &Client, manifest: &ManifestMetadata) -> Result<()> {
    let params = PatchParams::apply(FIELD_MANAGER).force();
    let api = manifest_api(client, manifest).await?;
    api.patch(&manifest.name, &params, &Patch::Apply(&manifest.value))
        .await
        .map_err(|e| {
            Error::from_kube(
                e,
                &manifest.api_resource.kind,
                manifest.namespace.as_deref().unwrap_or_default(),
                &manifest.name,
            )
        })?;
    debug!(kind = %manifest.api_resource.kind, name = %manifest.name, "applied manifest");
    Ok(())
}

/// Server-side apply every document of a multi-document YAML bundle,
/// ordered by [`kind_priority`]
pub async fn apply_manifests(client: &Client, bundle: &str) -> Result<usize> {
    let mut manifests = crate::yaml::parse_documents(bundle)?
        .into_iter()
        .map(parse_manifest_value)
        .collect::<Result<Vec<_>>>()?;
    manifests.sort_by_key(|m| kind_priority(&m.api_resource.kind));

    for manifest in &manifests {
        apply_manifest(client, manifest).await?;
    }
    info!(count = manifests.len(), "applied manifests");
    Ok(manifests.len())
}

/// [`apply_manifests`] with backoff, for bundles whose CRDs may not be
/// established on the first pass
pub async fn apply_manifests_with_retry(client: &Client, bundle: &str, config: &RetryConfig) -> Result<usize> {
    retry_with_backoff(config, "apply_manifests", || apply_manifests(client, bundle)).await
}
