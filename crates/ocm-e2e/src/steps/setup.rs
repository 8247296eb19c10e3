//! Setup steps: put cluster, git and registry state in place

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::ByteString;
use tracing::{debug, info};

use ocm_e2e_common::accessor::{gvk_of_object, KubeAccessor, ResourceAccessor, TypedAccess};
use ocm_e2e_common::conditions::Predicate;
use ocm_e2e_common::crd::{
    ComponentSubscription, ComponentVersion, GitRepository, GitSync, Kustomization, Receiver, Repository,
};
use ocm_e2e_common::kube_utils::decode_each_file;
use ocm_e2e_common::wait::{wait_for, wait_for_deletion, wait_for_existence, WaitRequest};
use ocm_e2e_common::{TIMEOUT_MEDIUM, TIMEOUT_SHORT};

use crate::environment::Environment;
use crate::flux::flux_sync_objects;
use crate::gitea::CreateHookOption;
use crate::harness::{step, Step, StepContext};
use crate::steps::Component;
use crate::Error;

/// Register the kinds of the controllers under test and of Flux
pub fn register_controller_kinds<A: ResourceAccessor + ?Sized>(accessor: &A) {
    accessor.register::<ComponentVersion>();
    accessor.register::<ComponentSubscription>();
    accessor.register::<GitSync>();
    accessor.register::<Repository>();
    accessor.register::<GitRepository>();
    accessor.register::<Kustomization>();
    accessor.register::<Receiver>();
}

/// Extend the accessor's type registry
pub fn add_scheme<F>(register: F) -> Step
where
    F: Fn(&KubeAccessor) + Send + Sync + 'static,
{
    let register = Arc::new(register);
    step(move |env: Arc<Environment>, ctx| {
        let register = register.clone();
        async move {
            register(env.accessor()?.as_ref());
            Ok(ctx)
        }
    })
}

/// Create a namespace
pub fn create_namespace(name: &str) -> Step {
    let name = name.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let name = name.clone();
        async move {
            let namespace = Namespace {
                metadata: ObjectMeta {
                    name: Some(name.clone()),
                    ..Default::default()
                },
                ..Default::default()
            };
            env.accessor()?.create_typed(&namespace).await?;
            info!(namespace = %name, "created namespace");
            Ok(ctx)
        }
    })
}

/// Create every object decoded from the files in `folder` matching
/// `pattern`, moved into `namespace`
pub fn apply_test_data(namespace: &str, folder: impl Into<PathBuf>, pattern: &str) -> Step {
    let namespace = namespace.to_string();
    let folder = folder.into();
    let pattern = pattern.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (namespace, folder, pattern) = (namespace.clone(), folder.clone(), pattern.clone());
        async move {
            info!(folder = %folder.display(), %pattern, "applying test data");
            let accessor = env.accessor()?;
            let objects = decode_each_file(&folder, &pattern, Some(&namespace))?;
            for obj in &objects {
                accessor.create(obj).await?;
            }
            info!(objects = objects.len(), "apply test data complete");
            Ok(ctx)
        }
    })
}

/// Delete every object decoded from the files in `folder` matching
/// `pattern`; objects already gone are skipped
pub fn delete_test_data(namespace: &str, folder: impl Into<PathBuf>, pattern: &str) -> Step {
    let namespace = namespace.to_string();
    let folder = folder.into();
    let pattern = pattern.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (namespace, folder, pattern) = (namespace.clone(), folder.clone(), pattern.clone());
        async move {
            info!(folder = %folder.display(), %pattern, "deleting test data");
            let accessor = env.accessor()?;
            let objects = decode_each_file(&folder, &pattern, Some(&namespace))?;
            for obj in objects.iter().rev() {
                let gvk = gvk_of_object(obj)?;
                let ns = obj.metadata.namespace.as_deref().unwrap_or_default();
                let name = obj.metadata.name.as_deref().unwrap_or_default();
                match accessor.delete(&gvk, ns, name).await {
                    Ok(()) => {}
                    Err(e) if e.is_not_found() => debug!(kind = %gvk.kind, ns, name, "already deleted"),
                    Err(e) => return Err(e),
                }
            }
            info!("delete test data complete");
            Ok(ctx)
        }
    })
}

/// Push component versions into the registry
pub fn add_component_versions(components: Vec<Component>) -> Step {
    let components = Arc::new(components);
    step(move |env: Arc<Environment>, ctx| {
        let components = components.clone();
        async move {
            for c in components.iter() {
                info!(
                    component = c.component.name(),
                    version = c.component.version(),
                    repository = %c.repository,
                    "adding component version"
                );
                env.push_component(&c.repository, &c.component).await?;
            }
            Ok(ctx)
        }
    })
}

/// Create a git repository initialised on `main`
pub fn add_git_repository(repo: &str) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            let created = env.gitea()?.create_repo(&repo).await?;
            info!(url = %created.clone_url, "created repository");
            Ok(ctx)
        }
    })
}

/// Delete a git repository
pub fn delete_git_repository(repo: &str) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            env.gitea()?.delete_repo(&repo).await?;
            info!(repo = %repo, "deleted repository");
            Ok(ctx)
        }
    })
}

/// Commit a local file into a repository at `dest_path`
pub fn add_file_to_git_repository(repo: &str, source: impl Into<PathBuf>, dest_path: &str) -> Step {
    let repo = repo.to_string();
    let source = source.into();
    let dest_path = dest_path.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (repo, source, dest_path) = (repo.clone(), source.clone(), dest_path.clone());
        async move {
            let data = tokio::fs::read(&source).await?;
            env.gitea()?.create_file(&repo, &dest_path, &data).await?;
            info!(repo = %repo, path = %dest_path, "added file to repository");
            Ok(ctx)
        }
    })
}

/// Make Flux sync `path` of repository `name` into the cluster
pub fn add_flux_sync_for_repo(name: &str, path: &str, gitea_namespace: &str) -> Step {
    let name = name.to_string();
    let path = path.to_string();
    let gitea_namespace = gitea_namespace.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (name, path, gitea_namespace) = (name.clone(), path.clone(), gitea_namespace.clone());
        async move {
            let gitea = env.gitea()?;
            let accessor = env.accessor()?;
            let sync = flux_sync_objects(&name, &path, &gitea_namespace, gitea.owner(), gitea.token());

            accessor.create_typed(&sync.secret).await?;
            info!(name = %name, "created token secret");
            accessor.create_typed(&sync.git_repository).await?;
            info!(name = %name, "created git repository");
            accessor.create_typed(&sync.kustomization).await?;
            info!(name = %name, "created kustomization");
            Ok(ctx)
        }
    })
}

/// Merge a pull request
pub fn merge_pull_request(repo: &str, number: i64) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            env.gitea()?.merge_pull_request(&repo, number).await?;
            info!(repo = %repo, number, "merged pull request");
            Ok(ctx)
        }
    })
}

/// Point a repository webhook at the Flux Receiver `<repo>/<repo>`, once
/// the Receiver has published its webhook path
pub fn create_git_repository_webhook(repo: &str, token: &str) -> Step {
    let repo = repo.to_string();
    let token = token.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (repo, token) = (repo.clone(), token.clone());
        async move {
            let accessor = env.accessor()?;
            info!(receiver = %repo, "waiting for receiver");
            let receiver = wait_for(
                accessor.as_ref(),
                WaitRequest::named(
                    &repo,
                    &repo,
                    Predicate::matches("status.webhookPath set", |r: &Receiver| {
                        webhook_path(r).is_some()
                    }),
                )
                .with_timeout(TIMEOUT_SHORT),
            )
            .await?;
            let path = receiver
                .as_ref()
                .and_then(webhook_path)
                .ok_or_else(|| Error::internal_with_context("create_webhook", "receiver has no webhook path"))?;

            env.gitea()?
                .create_hook(&repo, &CreateHookOption::flux_receiver(path, &token))
                .await?;
            info!(repo = %repo, webhook_path = %path, "created webhook");
            Ok(ctx)
        }
    })
}

fn webhook_path(receiver: &Receiver) -> Option<&str> {
    receiver
        .status
        .as_ref()?
        .webhook_path
        .as_deref()
        .filter(|p| !p.is_empty())
}

/// Create a Secret and wait until it can be read back. An empty
/// `namespace` means the environment's namespace.
pub fn create_secret(
    name: &str,
    data: BTreeMap<String, Vec<u8>>,
    string_data: BTreeMap<String, String>,
    namespace: &str,
) -> Step {
    let name = name.to_string();
    let namespace = namespace.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let name = name.clone();
        let namespace = if namespace.is_empty() {
            env.namespace().to_string()
        } else {
            namespace.clone()
        };
        let secret = build_secret(&name, &namespace, &data, &string_data);
        async move {
            let accessor = env.accessor()?;
            accessor.create_typed(&secret).await?;
            wait_for_existence::<_, Secret>(accessor.as_ref(), &namespace, &name, TIMEOUT_MEDIUM).await?;
            info!(namespace = %namespace, name = %name, "created secret");
            Ok(ctx)
        }
    })
}

fn build_secret(
    name: &str,
    namespace: &str,
    data: &BTreeMap<String, Vec<u8>>,
    string_data: &BTreeMap<String, String>,
) -> Secret {
    Secret {
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        },
        data: (!data.is_empty()).then(|| {
            data.iter()
                .map(|(k, v)| (k.clone(), ByteString(v.clone())))
                .collect()
        }),
        string_data: (!string_data.is_empty()).then(|| string_data.clone()),
        ..Default::default()
    }
}

/// Delete a Secret from the environment's namespace and wait until it is
/// gone
pub fn delete_secret(name: &str) -> Step {
    let name = name.to_string();
    step(move |env: Arc<Environment>, ctx: StepContext| {
        let name = name.clone();
        async move {
            let accessor = env.accessor()?;
            accessor.delete_as::<Secret>(env.namespace(), &name).await?;
            wait_for_deletion::<_, Secret>(accessor.as_ref(), env.namespace(), &name, TIMEOUT_MEDIUM).await?;
            info!(namespace = %env.namespace(), name = %name, "deleted secret");
            Ok(ctx)
        }
    })
}
