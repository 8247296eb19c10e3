//! A ComponentSubscription replicates a pushed component and turns Ready

use std::time::Duration;

use ocm_e2e::harness::Feature;
use ocm_e2e::oci::ComponentVersion as OcmComponent;
use ocm_e2e::steps::assess::{resource_was_created, wait_for_ready};
use ocm_e2e::steps::setup::{
    add_component_versions, add_scheme, apply_test_data, delete_test_data, register_controller_kinds,
};
use ocm_e2e::steps::teardown::dump_cluster_state;
use ocm_e2e::steps::{Component, Controller, ObjectRef};
use ocm_e2e_common::accessor::KubeAccessor;
use ocm_e2e_common::crd::ComponentSubscription;

use super::{standard_environment, testdata};

const SUBSCRIPTION: &str = "componentsubscription-sample";

#[tokio::test]
#[ignore = "requires docker, kind and network access"]
async fn story_subscription_replicates_component() {
    let env = standard_environment();
    let namespace = env.namespace().to_string();
    let folder = testdata("subscription");

    let feature = Feature::new("Custom ComponentSubscription")
        .setup(add_scheme(|accessor: &KubeAccessor| register_controller_kinds(accessor)))
        .setup(add_component_versions(vec![Component::new(
            OcmComponent::new("github.com/acme/podinfo", "v1.0.0").provider("acme"),
            "ocm-replication",
        )]))
        .setup(apply_test_data(&namespace, &folder, "*"))
        .assess(
            "check if resource was created",
            resource_was_created(vec![ObjectRef::of::<ComponentSubscription>(&namespace, SUBSCRIPTION)]),
        )
        .assess(
            "wait for condition to be successful",
            wait_for_ready::<ComponentSubscription>(SUBSCRIPTION, &namespace, Duration::from_secs(120)),
        )
        .teardown(dump_cluster_state(vec![
            Controller::new(&namespace, "app=ocm-controller"),
            Controller::new(&namespace, "app=replication-controller"),
        ]))
        .teardown(delete_test_data(&namespace, &folder, "*"));

    env.run("component_subscription", &[feature]).await.unwrap();
}
