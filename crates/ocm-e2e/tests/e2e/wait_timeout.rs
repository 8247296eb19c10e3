//! A wait on an object nobody creates ends in a timeout, not a hang

use std::time::Duration;

use k8s_openapi::api::core::v1::ConfigMap;
use ocm_e2e::config::EnvConfig;
use ocm_e2e::environment::{env_func, Environment};
use ocm_e2e::Error;
use ocm_e2e_common::conditions::Predicate;
use ocm_e2e_common::telemetry::{init_logging, LogConfig};
use ocm_e2e_common::wait::{wait_for, WaitRequest};
use ocm_e2e_common::DEFAULT_POLL_INTERVAL;

#[tokio::test]
#[ignore = "requires a reachable cluster in OCM_E2E_KUBECONFIG"]
async fn story_wait_on_missing_object_times_out() {
    let _ = init_logging(LogConfig::default());
    let config = EnvConfig::from_env().expect("invalid e2e configuration");
    let env = Environment::builder(config)
        .setup("connect", env_func(|env| async move { env.connect().await }))
        .build();
    env.setup().await.unwrap();

    let accessor = env.accessor().unwrap();
    let request = WaitRequest::named(
        env.namespace(),
        "never-created",
        Predicate::<ConfigMap>::exists(),
    )
    .with_timeout(DEFAULT_POLL_INTERVAL);

    let started = std::time::Instant::now();
    let err = wait_for(accessor.as_ref(), request).await.unwrap_err();

    assert!(matches!(err, Error::Timeout { .. }), "expected timeout, got {err:?}");
    assert!(started.elapsed() < DEFAULT_POLL_INTERVAL + Duration::from_secs(10));

    env.finish().await.unwrap();
}
