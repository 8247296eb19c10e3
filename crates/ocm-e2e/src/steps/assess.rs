//! Assess steps: wait for reconciliation, then check the outcome

use std::sync::Arc;
use std::time::Duration;

use tracing::info;

use ocm_e2e_common::accessor::{KubeKind, ResourceAccessor};
use ocm_e2e_common::conditions::{ConditionLookup, CONDITION_READY};
use ocm_e2e_common::wait::wait_for_condition_true;

use crate::environment::Environment;
use crate::harness::{step, Step};
use crate::steps::{status_key, File, ObjectRef};
use crate::Error;

/// Every object must exist
pub fn resource_was_created(objects: Vec<ObjectRef>) -> Step {
    let objects = Arc::new(objects);
    step(move |env: Arc<Environment>, ctx| {
        let objects = objects.clone();
        async move {
            info!("check if resources are created");
            let accessor = env.accessor()?;
            for obj in objects.iter() {
                accessor.get(&obj.gvk, &obj.namespace, &obj.name).await?;
            }
            info!(count = objects.len(), "resources successfully created");
            Ok(ctx)
        }
    })
}

/// Wait until `Ready=True` on an object of kind `K`. The final `status` is
/// stored in the context under [`status_key`].
pub fn wait_for_ready<K>(name: &str, namespace: &str, timeout: Duration) -> Step
where
    K: KubeKind + ConditionLookup,
{
    wait_for_condition::<K>(name, namespace, CONDITION_READY, timeout)
}

/// Wait until `condition_type` is `True` on an object of kind `K`
pub fn wait_for_condition<K>(name: &str, namespace: &str, condition_type: &str, timeout: Duration) -> Step
where
    K: KubeKind + ConditionLookup,
{
    let name = name.to_string();
    let namespace = namespace.to_string();
    let condition_type = condition_type.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (name, namespace, condition_type) = (name.clone(), namespace.clone(), condition_type.clone());
        async move {
            let accessor = env.accessor()?;
            let ready: K =
                wait_for_condition_true(accessor.as_ref(), &namespace, &name, &condition_type, timeout).await?;

            let status = serde_json::to_value(&ready)?
                .get("status")
                .cloned()
                .unwrap_or(serde_json::Value::Null);
            info!(kind = %K::kind(&()), namespace = %namespace, name = %name, %status, "object is ready");
            Ok(ctx.with(status_key(&K::kind(&()), &namespace, &name), status))
        }
    })
}

/// The repository must exist
pub fn check_repo_exists(repo: &str) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            env.gitea()?.get_repo(&repo).await?;
            Ok(ctx)
        }
    })
}

/// Every file must exist on the default branch
pub fn check_file_in_repo_exists(files: Vec<File>) -> Step {
    let files = Arc::new(files);
    step(move |env: Arc<Environment>, ctx| {
        let files = files.clone();
        async move {
            let gitea = env.gitea()?;
            for file in files.iter() {
                info!(owner = gitea.owner(), repository = %file.repository, path = %file.path, "checking file");
                gitea.get_file(&file.repository, &file.path).await?;
            }
            Ok(ctx)
        }
    })
}

/// A file on the default branch must have exactly `expected` as content
pub fn check_repo_file_content(repo: &str, filename: &str, expected: &str) -> Step {
    let repo = repo.to_string();
    let filename = filename.to_string();
    let expected = expected.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let (repo, filename, expected) = (repo.clone(), filename.clone(), expected.clone());
        async move {
            let content = env.gitea()?.get_file(&repo, &filename).await?;
            let actual = String::from_utf8_lossy(&content);
            if actual != expected {
                return Err(Error::assertion(
                    format!("content of {}/{}", repo, filename),
                    expected,
                    actual.into_owned(),
                ));
            }
            Ok(ctx)
        }
    })
}

/// The repository and pull request `number` in it must exist
pub fn check_pull_request_exists(repo: &str, number: i64) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            let gitea = env.gitea()?;
            gitea.get_repo(&repo).await?;
            let pr = gitea.get_pull_request(&repo, number).await?;
            info!(repo = %repo, number, title = %pr.title, state = %pr.state, "pull request exists");
            Ok(ctx)
        }
    })
}
