//! Syncs push component resources into git repositories managed by the
//! git-controller, directly or through a pull request. A Repository on its
//! own is initialised with the maintainers file and the folder skeleton.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use ocm_e2e::environment::Environment;
use ocm_e2e::harness::{step, Feature, Step};
use ocm_e2e::oci::{ComponentVersion as OcmComponent, Resource};
use ocm_e2e::steps::assess::{
    check_file_in_repo_exists, check_pull_request_exists, check_repo_exists, check_repo_file_content, wait_for_ready,
};
use ocm_e2e::steps::setup::{
    add_component_versions, add_scheme, apply_test_data, create_secret, delete_git_repository, delete_secret,
    delete_test_data, register_controller_kinds,
};
use ocm_e2e::steps::teardown::{dump_cluster_state, dump_repository_content};
use ocm_e2e::steps::{Component, Controller, File};
use ocm_e2e_common::accessor::KubeAccessor;
use ocm_e2e_common::crd::{GitSync, Repository};

use super::{standard_environment, testdata};

const CREDENTIALS: &str = "git-sync-credentials";

fn podinfo_component() -> Component {
    Component::new(
        OcmComponent::new("github.com/acme/podinfo", "v6.0.0")
            .provider("acme")
            .blob_resource(Resource::blob("deployment", "this is my deployment")),
        "ocm-podinfo",
    )
}

/// Secret with the Gitea credentials the git-controller pushes with
fn gitea_credentials() -> Step {
    step(|env: Arc<Environment>, ctx| async move {
        let gitea = env.gitea()?;
        let string_data = BTreeMap::from([
            ("username".to_string(), gitea.owner().to_string()),
            ("password".to_string(), gitea.token().to_string()),
            ("token".to_string(), gitea.token().to_string()),
        ]);
        create_secret(CREDENTIALS, BTreeMap::new(), string_data, "")(env.clone(), ctx).await
    })
}

fn controllers(namespace: &str) -> Vec<Controller> {
    vec![
        Controller::new(namespace, "app=ocm-controller"),
        Controller::new(namespace, "app=git-controller"),
    ]
}

#[tokio::test]
#[ignore = "requires docker, kind and network access"]
async fn story_sync_pushes_resource_into_repository() {
    let env = standard_environment();
    let namespace = env.namespace().to_string();
    let folder = testdata("git_sync");

    let setup = Feature::new("Setup Test System")
        .setup(add_scheme(|accessor: &KubeAccessor| register_controller_kinds(accessor)))
        .setup(add_component_versions(vec![podinfo_component()]))
        .setup(gitea_credentials())
        .setup(apply_test_data(&namespace, &folder, "*.yaml"));

    let verify = Feature::new("Verify System State")
        .assess(
            "wait for repository done condition",
            wait_for_ready::<Repository>("test", &namespace, Duration::from_secs(60)),
        )
        .assess("repository exists", check_repo_exists("test"))
        .assess(
            "wait for git sync done condition",
            wait_for_ready::<GitSync>("git-sample", &namespace, Duration::from_secs(60)),
        )
        .assess(
            "check if content exists in repo",
            check_repo_file_content("test", "deployment.yaml", "this is my deployment"),
        )
        .teardown(dump_repository_content("test"));

    let cleanup = Feature::new("Cleanup Test System")
        .teardown(dump_cluster_state(controllers(&namespace)))
        .teardown(delete_test_data(&namespace, &folder, "*.yaml"))
        .teardown(delete_secret(CREDENTIALS))
        .teardown(delete_git_repository("test"));

    env.run("git_sync", &[setup, verify, cleanup]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker, kind and network access"]
async fn story_sync_opens_pull_request() {
    let env = standard_environment();
    let namespace = env.namespace().to_string();
    let folder = testdata("pull_request");

    let setup = Feature::new("Apply Sync with Pull Request")
        .setup(add_scheme(|accessor: &KubeAccessor| register_controller_kinds(accessor)))
        .setup(add_component_versions(vec![podinfo_component()]))
        .setup(gitea_credentials())
        .setup(apply_test_data(&namespace, &folder, "*.yaml"));

    let verify = Feature::new("Verify Pull Request")
        .assess(
            "wait for git sync done condition",
            wait_for_ready::<GitSync>("git-sample-pr", &namespace, Duration::from_secs(60)),
        )
        .assess("pull request was opened", check_pull_request_exists("test-2", 1));

    let cleanup = Feature::new("Cleanup Test System")
        .teardown(dump_cluster_state(controllers(&namespace)))
        .teardown(delete_test_data(&namespace, &folder, "*.yaml"))
        .teardown(delete_secret(CREDENTIALS))
        .teardown(delete_git_repository("test-2"));

    env.run("git_sync_pull_request", &[setup, verify, cleanup]).await.unwrap();
}

#[tokio::test]
#[ignore = "requires docker, kind and network access"]
async fn story_repository_is_initialised_with_maintainers() {
    let env = standard_environment();
    let namespace = env.namespace().to_string();
    let folder = testdata("repository_only");

    let setup = Feature::new("Setup Test System")
        .setup(add_scheme(|accessor: &KubeAccessor| register_controller_kinds(accessor)))
        .setup(gitea_credentials())
        .setup(apply_test_data(&namespace, &folder, "*.yaml"));

    let verify = Feature::new("Verify System State")
        .assess(
            "wait for repository done condition",
            wait_for_ready::<Repository>("test-3", &namespace, Duration::from_secs(60)),
        )
        .assess("maintainers are code owners", check_repo_file_content("test-3", "CODEOWNERS", "@e2e-tester"))
        .assess(
            "check if files are in the repo",
            check_file_in_repo_exists(
                ["products", "targets", "subscriptions", "generators"]
                    .iter()
                    .map(|dir| File::new("test-3", format!("{}/.keep", dir)))
                    .collect(),
            ),
        )
        .teardown(dump_repository_content("test-3"));

    let cleanup = Feature::new("Cleanup Test System")
        .teardown(dump_cluster_state(vec![Controller::new(&namespace, "app=git-controller")]))
        .teardown(delete_test_data(&namespace, &folder, "*.yaml"))
        .teardown(delete_secret(CREDENTIALS))
        .teardown(delete_git_repository("test-3"));

    env.run("repository_only", &[setup, verify, cleanup]).await.unwrap();
}
