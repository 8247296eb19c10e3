//! Flux toolchain install and GitOps sync objects

use std::collections::BTreeMap;
use std::time::Duration;

use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::Client;
use tracing::info;

use ocm_e2e_common::accessor::ResourceAccessor;
use ocm_e2e_common::crd::{
    CrossNamespaceSourceReference, GitRepository, GitRepositoryRef, GitRepositorySpec,
    Kustomization, KustomizationSpec, LocalObjectReference,
};
use ocm_e2e_common::kube_utils::apply_manifests_with_retry;
use ocm_e2e_common::retry::RetryConfig;
use ocm_e2e_common::wait::wait_for_deployment_available;
use ocm_e2e_common::{FLUX_NAMESPACE, TIMEOUT_LONG};

use crate::gitea::{in_cluster_clone_url, DEFAULT_BRANCH};
use crate::{Error, Result};

/// Controllers of a default Flux install
pub const FLUX_CONTROLLERS: &[&str] = &[
    "source-controller",
    "kustomize-controller",
    "helm-controller",
    "notification-controller",
];

/// Key of the token in the git credentials Secret
pub const BEARER_TOKEN_KEY: &str = "bearerToken";

/// Reconcile interval of the sync objects
pub const SYNC_INTERVAL: &str = "1h";

const INSTALL_FETCH_TIMEOUT: Duration = Duration::from_secs(60);

/// Release URL of `install.yaml` for a Flux version
pub fn flux_install_url(version: &str) -> String {
    format!(
        "https://github.com/fluxcd/flux2/releases/download/{}/install.yaml",
        version
    )
}

/// Download the install bundle of a Flux release
pub async fn fetch_install_manifest(version: &str) -> Result<String> {
    let url = flux_install_url(version);
    let http = reqwest::Client::builder()
        .timeout(INSTALL_FETCH_TIMEOUT)
        .build()
        .map_err(|e| Error::http_transport("flux_install", e.to_string()))?;
    let resp = http
        .get(&url)
        .send()
        .await
        .map_err(|e| Error::http_transport("flux_install", e.to_string()))?;
    let status = resp.status();
    let body = resp
        .text()
        .await
        .map_err(|e| Error::http_transport("flux_install", e.to_string()))?;
    if !status.is_success() {
        return Err(Error::http(format!("flux_install {}", url), status.as_u16(), body));
    }
    Ok(body)
}

/// Apply the Flux install bundle and wait for every controller to be
/// Available
pub async fn install_flux<A>(client: &Client, accessor: &A, version: &str) -> Result<()>
where
    A: ResourceAccessor + ?Sized,
{
    info!(version, "[Flux] Installing");
    let bundle = fetch_install_manifest(version).await?;
    let applied = apply_manifests_with_retry(client, &bundle, &RetryConfig::with_max_attempts(10)).await?;
    info!(objects = applied, "[Flux] Install bundle applied");

    for controller in FLUX_CONTROLLERS {
        wait_for_deployment_available(accessor, FLUX_NAMESPACE, controller, TIMEOUT_LONG, None).await?;
    }
    info!(version, "[Flux] Controllers available");
    Ok(())
}

/// Objects that make Flux sync a Gitea repository into the cluster
#[derive(Clone, Debug)]
pub struct FluxSync {
    /// Git credentials, `bearerToken` key
    pub secret: Secret,
    /// Source pointing at the repository's default branch
    pub git_repository: GitRepository,
    /// Kustomization applying `path` from the source
    pub kustomization: Kustomization,
}

/// Build the Secret, GitRepository and Kustomization (all named `name` in
/// `flux-system`) syncing `path` of `owner/name` served by Gitea in
/// `gitea_namespace`
pub fn flux_sync_objects(name: &str, path: &str, gitea_namespace: &str, owner: &str, token: &str) -> FluxSync {
    let meta = ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(FLUX_NAMESPACE.to_string()),
        ..Default::default()
    };

    let secret = Secret {
        metadata: meta.clone(),
        string_data: Some(BTreeMap::from([(BEARER_TOKEN_KEY.to_string(), token.to_string())])),
        ..Default::default()
    };

    let mut git_repository = GitRepository::new(
        name,
        GitRepositorySpec {
            url: in_cluster_clone_url(gitea_namespace, owner, name),
            interval: SYNC_INTERVAL.to_string(),
            reference: Some(GitRepositoryRef {
                branch: Some(DEFAULT_BRANCH.to_string()),
                ..Default::default()
            }),
            secret_ref: Some(LocalObjectReference::new(name)),
            timeout: None,
        },
    );
    git_repository.metadata.namespace = Some(FLUX_NAMESPACE.to_string());

    let mut kustomization = Kustomization::new(
        name,
        KustomizationSpec {
            interval: SYNC_INTERVAL.to_string(),
            path: Some(path.to_string()),
            prune: true,
            source_ref: CrossNamespaceSourceReference {
                kind: "GitRepository".to_string(),
                name: name.to_string(),
                namespace: Some(FLUX_NAMESPACE.to_string()),
            },
            target_namespace: None,
        },
    );
    kustomization.metadata.namespace = Some(FLUX_NAMESPACE.to_string());

    FluxSync {
        secret,
        git_repository,
        kustomization,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_url_points_at_the_release_asset() {
        assert_eq!(
            flux_install_url("v2.1.2"),
            "https://github.com/fluxcd/flux2/releases/download/v2.1.2/install.yaml"
        );
    }

    #[test]
    fn story_sync_objects_point_at_the_gitea_repository() {
        let sync = flux_sync_objects("test", "./", "ocm-system", "e2e-tester", "s3cret");

        assert_eq!(sync.secret.metadata.name.as_deref(), Some("test"));
        assert_eq!(sync.secret.metadata.namespace.as_deref(), Some(FLUX_NAMESPACE));
        assert_eq!(
            sync.secret.string_data.as_ref().and_then(|d| d.get(BEARER_TOKEN_KEY)).map(String::as_str),
            Some("s3cret")
        );

        let repo = &sync.git_repository;
        assert_eq!(repo.metadata.namespace.as_deref(), Some(FLUX_NAMESPACE));
        assert_eq!(repo.spec.url, "http://gitea.ocm-system:3000/e2e-tester/test");
        assert_eq!(repo.spec.interval, "1h");
        assert_eq!(
            repo.spec.reference.as_ref().and_then(|r| r.branch.as_deref()),
            Some("main")
        );
        assert_eq!(repo.spec.secret_ref.as_ref().map(|r| r.name.as_str()), Some("test"));

        let kustomization = &sync.kustomization;
        assert_eq!(kustomization.spec.path.as_deref(), Some("./"));
        assert!(kustomization.spec.prune);
        assert_eq!(kustomization.spec.source_ref.kind, "GitRepository");
        assert_eq!(kustomization.spec.source_ref.name, "test");
        assert_eq!(kustomization.spec.source_ref.namespace.as_deref(), Some(FLUX_NAMESPACE));
    }

    #[test]
    fn sync_objects_encode_with_flux_field_names() {
        let sync = flux_sync_objects("test", "apps", "ocm-system", "e2e-tester", "s3cret");
        let repo = serde_json::to_value(&sync.git_repository).unwrap();
        assert_eq!(repo["spec"]["ref"]["branch"], "main");
        assert_eq!(repo["spec"]["secretRef"]["name"], "test");

        let kustomization = serde_json::to_value(&sync.kustomization).unwrap();
        assert_eq!(kustomization["spec"]["sourceRef"]["kind"], "GitRepository");
        assert_eq!(kustomization["apiVersion"], "kustomize.toolkit.fluxcd.io/v1");
    }
}
