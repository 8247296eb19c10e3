//! Harness configuration
//!
//! Everything the environment needs to know comes from `OCM_E2E_*`
//! variables, with defaults that work against a fresh kind cluster:
//!
//! ```bash
//! OCM_E2E_KUBECONFIG=/path/to/kubeconfig   # reuse a cluster instead of creating one
//! OCM_E2E_CLUSTER_NAME=ocm-e2e-dev
//! OCM_E2E_NAMESPACE=ocm-system
//! OCM_E2E_FLUX_VERSION=v2.1.2
//! OCM_E2E_GITEA_URL=http://127.0.0.1:3000
//! OCM_E2E_GITEA_TOKEN=<token>              # minted after install when unset
//! OCM_E2E_GITEA_OWNER=e2e-tester
//! OCM_E2E_GITEA_PASSWORD=<password>
//! OCM_E2E_REGISTRY_APP=registry
//! OCM_E2E_REGISTRY_PORT=5000
//! OCM_E2E_REGISTRY_SCHEME=http
//! OCM_E2E_CONTROLLER_MANIFESTS=/path/to/dir  # controllers and registry, applied after Flux
//! OCM_E2E_KEEP_CLUSTER=true
//! ```

use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;

use ocm_e2e_common::DEFAULT_NAMESPACE;

use crate::{Error, Result};

/// Flux release installed when none is configured
pub const DEFAULT_FLUX_VERSION: &str = "v2.1.2";

/// Gitea API endpoint as exposed through the kind port mapping
pub const DEFAULT_GITEA_URL: &str = "http://127.0.0.1:3000";

/// Gitea user owning every test repository
pub const DEFAULT_GITEA_OWNER: &str = "e2e-tester";

/// Password of the Gitea test user, seeded by the Gitea manifest
pub const DEFAULT_GITEA_PASSWORD: &str = "e2e-tester-password";

/// `app=` label of the in-cluster registry Deployment and its pod
pub const DEFAULT_REGISTRY_APP: &str = "registry";

/// Registry port, forwarded to the same local port
pub const DEFAULT_REGISTRY_PORT: u16 = 5000;

/// Harness configuration loaded from the environment
#[derive(Debug, Clone, PartialEq)]
pub struct EnvConfig {
    /// Existing cluster to run against; `None` provisions a kind cluster
    pub kubeconfig: Option<PathBuf>,
    /// Name of the kind cluster to create
    pub cluster_name: String,
    /// Namespace for the controllers under test and test objects
    pub namespace: String,
    /// Flux release tag
    pub flux_version: String,
    /// Base URL of the Gitea API
    pub gitea_url: String,
    /// API token of the Gitea test user
    pub gitea_token: Option<String>,
    /// Gitea test user
    pub gitea_owner: String,
    /// Password of the Gitea test user
    pub gitea_password: String,
    /// `app=` label of the registry pod
    pub registry_app: String,
    /// Registry port (remote and local)
    pub registry_port: u16,
    /// `http` or `https`
    pub registry_scheme: String,
    /// Folder of manifests installing the controllers under test and the
    /// registry; nothing is installed when unset
    pub controller_manifests: Option<PathBuf>,
    /// Leave the kind cluster running after the run
    pub keep_cluster: bool,
}

impl Default for EnvConfig {
    fn default() -> Self {
        Self {
            kubeconfig: None,
            cluster_name: random_cluster_name(),
            namespace: DEFAULT_NAMESPACE.to_string(),
            flux_version: DEFAULT_FLUX_VERSION.to_string(),
            gitea_url: DEFAULT_GITEA_URL.to_string(),
            gitea_token: None,
            gitea_owner: DEFAULT_GITEA_OWNER.to_string(),
            gitea_password: DEFAULT_GITEA_PASSWORD.to_string(),
            registry_app: DEFAULT_REGISTRY_APP.to_string(),
            registry_port: DEFAULT_REGISTRY_PORT,
            registry_scheme: "http".to_string(),
            controller_manifests: None,
            keep_cluster: false,
        }
    }
}

impl EnvConfig {
    /// Load from `OCM_E2E_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary variable source
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let registry_port = match var("OCM_E2E_REGISTRY_PORT") {
            Some(raw) => raw.parse::<u16>().map_err(|e| {
                Error::internal_with_context(
                    "config",
                    format!("OCM_E2E_REGISTRY_PORT={:?} is not a port: {}", raw, e),
                )
            })?,
            None => defaults.registry_port,
        };

        let registry_scheme = var("OCM_E2E_REGISTRY_SCHEME").unwrap_or(defaults.registry_scheme);
        if registry_scheme != "http" && registry_scheme != "https" {
            return Err(Error::internal_with_context(
                "config",
                format!("OCM_E2E_REGISTRY_SCHEME must be http or https, got {:?}", registry_scheme),
            ));
        }

        Ok(Self {
            kubeconfig: var("OCM_E2E_KUBECONFIG").map(PathBuf::from),
            cluster_name: var("OCM_E2E_CLUSTER_NAME").unwrap_or(defaults.cluster_name),
            namespace: var("OCM_E2E_NAMESPACE").unwrap_or(defaults.namespace),
            flux_version: var("OCM_E2E_FLUX_VERSION").unwrap_or(defaults.flux_version),
            gitea_url: var("OCM_E2E_GITEA_URL").unwrap_or(defaults.gitea_url),
            gitea_token: var("OCM_E2E_GITEA_TOKEN"),
            gitea_owner: var("OCM_E2E_GITEA_OWNER").unwrap_or(defaults.gitea_owner),
            gitea_password: var("OCM_E2E_GITEA_PASSWORD").unwrap_or(defaults.gitea_password),
            registry_app: var("OCM_E2E_REGISTRY_APP").unwrap_or(defaults.registry_app),
            registry_port,
            registry_scheme,
            controller_manifests: var("OCM_E2E_CONTROLLER_MANIFESTS").map(PathBuf::from),
            keep_cluster: var("OCM_E2E_KEEP_CLUSTER")
                .map(|v| parse_bool(&v))
                .unwrap_or(false),
        })
    }

    /// True when the harness owns the cluster and must create it
    pub fn provisions_cluster(&self) -> bool {
        self.kubeconfig.is_none()
    }

    /// Local registry URL reached through the tunnel
    pub fn registry_url(&self) -> String {
        format!("{}://127.0.0.1:{}", self.registry_scheme, self.registry_port)
    }
}

fn parse_bool(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

/// `ocm-e2e-<8 lowercase alphanumerics>`
pub fn random_cluster_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .map(|c| c.to_ascii_lowercase())
        .collect();
    format!("ocm-e2e-{}", suffix)
}
