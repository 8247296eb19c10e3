//! End-to-end scenarios against a live cluster
//!
//! Each scenario brings up its own environment (kind cluster, Flux, Gitea and
//! the registry tunnel), runs its features and tears everything down again.
//! They are compiled only with the `e2e` feature and ignored by default:
//!
//! ```bash
//! cargo test -p ocm-e2e --features e2e --test e2e -- --ignored --test-threads=1
//! ```
//!
//! Set `OCM_E2E_KUBECONFIG` to reuse an existing cluster and
//! `OCM_E2E_CONTROLLER_MANIFESTS` to install the controllers under test.

#![cfg(feature = "e2e")]

mod component_version;
mod git_sync;
mod subscription;
mod wait_timeout;

use std::path::PathBuf;
use std::sync::Arc;

use ocm_e2e::config::EnvConfig;
use ocm_e2e::environment::Environment;
use ocm_e2e_common::telemetry::{init_logging, LogConfig};

/// Folder under `tests/e2e/testdata`
pub fn testdata(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("tests/e2e/testdata")
        .join(name)
}

/// Environment with the full bring-up and teardown
pub fn standard_environment() -> Arc<Environment> {
    let _ = init_logging(LogConfig::default());
    let config = EnvConfig::from_env().expect("invalid e2e configuration");
    Environment::builder(config).with_standard_lifecycle().build()
}
