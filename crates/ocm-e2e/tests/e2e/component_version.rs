//! A ComponentVersion pointing at a pushed component reconciles to Ready

use std::sync::Arc;
use std::time::Duration;

use ocm_e2e::environment::Environment;
use ocm_e2e::harness::{step, Feature};
use ocm_e2e::oci::ComponentVersion as OcmComponent;
use ocm_e2e::steps::assess::{resource_was_created, wait_for_ready};
use ocm_e2e::steps::setup::{
    add_component_versions, add_scheme, apply_test_data, delete_test_data, register_controller_kinds,
};
use ocm_e2e::steps::teardown::dump_cluster_state;
use ocm_e2e::steps::{status_key, Component, Controller, ObjectRef};
use ocm_e2e::Error;
use ocm_e2e_common::accessor::KubeAccessor;
use ocm_e2e_common::crd::ComponentVersion;

use super::{standard_environment, testdata};

#[tokio::test]
#[ignore = "requires docker, kind and network access"]
async fn story_component_version_becomes_ready() {
    let env = standard_environment();
    let namespace = env.namespace().to_string();
    let status_namespace = namespace.clone();
    let folder = testdata("component_version");

    let feature = Feature::new("Custom ComponentVersion")
        .setup(add_scheme(|accessor: &KubeAccessor| register_controller_kinds(accessor)))
        .setup(add_component_versions(vec![Component::new(
            OcmComponent::new("github.com/acme/podinfo", "v6.0.0").provider("acme"),
            "ocm-podinfo",
        )]))
        .setup(apply_test_data(&namespace, &folder, "*"))
        .assess(
            "check if resource created",
            resource_was_created(vec![ObjectRef::of::<ComponentVersion>(&namespace, "podinfo")]),
        )
        .assess(
            "wait for condition to be successful",
            wait_for_ready::<ComponentVersion>("podinfo", &namespace, Duration::from_secs(120)),
        )
        .assess(
            "status is populated",
            step(move |_env: Arc<Environment>, ctx| {
                let key = status_key("ComponentVersion", &status_namespace, "podinfo");
                async move {
                    if ctx.require::<serde_json::Value>(&key)?.is_null() {
                        return Err(Error::assertion(key, "a status", "null"));
                    }
                    Ok(ctx)
                }
            }),
        )
        .teardown(dump_cluster_state(vec![Controller::new(env.namespace(), "app=ocm-controller")]))
        .teardown(delete_test_data(env.namespace(), &folder, "*"));

    env.run("component_version", &[feature]).await.unwrap();
}
