//! Process-wide test environment
//!
//! One [`Environment`] is built per test run. Its setup funcs bring up the
//! shared infrastructure once, features borrow it through `Arc`, and its
//! finish funcs tear everything down again, in reverse order and on every
//! exit path.
//!
//! The standard lifecycle ([`EnvironmentBuilder::with_standard_lifecycle`]):
//!
//! | setup                      | finish (runs bottom-up)     |
//! |----------------------------|-----------------------------|
//! | create kind cluster        | delete kind cluster         |
//! | connect client + accessor  |                             |
//! | create namespace           | delete namespace            |
//! | install Flux               |                             |
//! | apply controller manifests |                             |
//! | install Gitea, mint token  | remove Gitea                |
//! | start registry tunnel      | stop registry tunnel        |

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use futures::future::BoxFuture;
use futures::FutureExt;
use k8s_openapi::api::apps::v1::{Deployment, ReplicaSet};
use k8s_openapi::api::core::v1::{Namespace, Pod};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use serde_json::json;
use tokio::sync::Mutex;
use tracing::{error, info, warn};

use ocm_e2e_common::accessor::{KubeAccessor, TypedAccess};
use ocm_e2e_common::conditions::{ConditionLookup, Predicate, CONDITION_READY};
use ocm_e2e_common::kube_utils::{apply_manifests_with_retry, create_client_with_retry, file_pattern};
use ocm_e2e_common::retry::RetryConfig;
use ocm_e2e_common::scheme::Scheme;
use ocm_e2e_common::wait::{wait_for, wait_for_deletion, wait_for_deployment_available, WaitRequest};
use ocm_e2e_common::{TIMEOUT_LONG, TIMEOUT_MEDIUM};

use crate::config::EnvConfig;
use crate::gitea::{install_gitea, remove_gitea, GiteaClient};
use crate::harness::{Feature, TestHarness};
use crate::kind::{create_kind_cluster, delete_kind_cluster};
use crate::oci::{ComponentDescriptor, ComponentVersion, RegistryClient};
use crate::port_forward::{PodConnector, PortForward};
use crate::{flux, Error, Result};

/// Lifecycle hook run against the environment
pub type EnvFunc = Arc<dyn Fn(Arc<Environment>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Wrap an async closure into an [`EnvFunc`]
pub fn env_func<F, Fut>(f: F) -> EnvFunc
where
    F: Fn(Arc<Environment>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    Arc::new(move |env| f(env).boxed())
}

/// Annotation whose change makes a Deployment roll its pods
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Strategic merge patch restarting a Deployment's pods
pub fn restart_patch(restarted_at: &str) -> serde_json::Value {
    json!({
        "spec": {
            "template": {
                "metadata": {
                    "annotations": {
                        RESTARTED_AT_ANNOTATION: restarted_at
                    }
                }
            }
        }
    })
}

/// Pod that can serve traffic: Running, Ready and not being deleted
pub fn serving_pod() -> Predicate<Pod> {
    Predicate::matches("Running and Ready", |pod: &Pod| {
        pod.metadata.deletion_timestamp.is_none()
            && pod.status.as_ref().and_then(|s| s.phase.as_deref()) == Some("Running")
            && pod.find_condition(CONDITION_READY).is_some_and(|c| c.is_true())
    })
}

/// Label carrying the template hash of the ReplicaSet that owns a pod
pub const POD_TEMPLATE_HASH_LABEL: &str = "pod-template-hash";

/// Annotation holding the rollout revision of Deployments and ReplicaSets
pub const REVISION_ANNOTATION: &str = "deployment.kubernetes.io/revision";

/// `pod-template-hash` of the ReplicaSet owned by `deployment` at its
/// current revision
pub fn new_replica_set_hash(deployment: &Deployment, replica_sets: &[ReplicaSet]) -> Option<String> {
    let revision = deployment.metadata.annotations.as_ref()?.get(REVISION_ANNOTATION)?;
    let uid = deployment.metadata.uid.as_deref();
    replica_sets
        .iter()
        .filter(|rs| {
            let owners = rs.metadata.owner_references.as_deref().unwrap_or_default();
            uid.map_or(true, |uid| owners.iter().any(|o| o.uid == uid))
        })
        .find(|rs| {
            rs.metadata
                .annotations
                .as_ref()
                .and_then(|a| a.get(REVISION_ANNOTATION))
                == Some(revision)
        })
        .and_then(|rs| rs.metadata.labels.as_ref()?.get(POD_TEMPLATE_HASH_LABEL).cloned())
}

// =============================================================================
// Builder
// =============================================================================

/// Collects lifecycle funcs before the environment is shared
pub struct EnvironmentBuilder {
    config: EnvConfig,
    setup_funcs: Vec<(String, EnvFunc)>,
    finish_funcs: Vec<(String, EnvFunc)>,
}

impl EnvironmentBuilder {
    /// Append a setup func; setup funcs run in order
    pub fn setup(mut self, name: impl Into<String>, f: EnvFunc) -> Self {
        self.setup_funcs.push((name.into(), f));
        self
    }

    /// Append a finish func; finish funcs run in reverse order
    pub fn finish(mut self, name: impl Into<String>, f: EnvFunc) -> Self {
        self.finish_funcs.push((name.into(), f));
        self
    }

    /// Register the full bring-up and teardown of a test run
    pub fn with_standard_lifecycle(mut self) -> Self {
        if self.config.provisions_cluster() {
            self = self
                .setup("create kind cluster", env_func(provision_cluster))
                .finish("delete kind cluster", env_func(destroy_cluster));
        }
        self.setup("connect", env_func(|env: Arc<Environment>| async move { env.connect().await }))
            .setup("create namespace", env_func(create_test_namespace))
            .finish("delete namespace", env_func(delete_test_namespace))
            .setup("install flux", env_func(install_flux))
            .setup("apply controller manifests", env_func(apply_controller_manifests))
            .setup("install gitea", env_func(start_gitea))
            .finish("remove gitea", env_func(stop_gitea))
            .setup(
                "start registry tunnel",
                env_func(|env: Arc<Environment>| async move { env.start_registry_tunnel().await.map(|_| ()) }),
            )
            .finish("stop registry tunnel", env_func(stop_registry_tunnel_if_running))
    }

    /// Freeze the environment
    pub fn build(self) -> Arc<Environment> {
        let kubeconfig = self
            .config
            .kubeconfig
            .clone()
            .unwrap_or_else(|| std::env::temp_dir().join(format!("{}.kubeconfig", self.config.cluster_name)));
        Arc::new(Environment {
            config: self.config,
            kubeconfig,
            setup_funcs: self.setup_funcs,
            finish_funcs: self.finish_funcs,
            accessor: OnceLock::new(),
            gitea: OnceLock::new(),
            tunnel: Mutex::new(None),
        })
    }
}

// =============================================================================
// Environment
// =============================================================================

/// Shared handle to the cluster, Gitea and the registry tunnel
pub struct Environment {
    config: EnvConfig,
    kubeconfig: PathBuf,
    setup_funcs: Vec<(String, EnvFunc)>,
    finish_funcs: Vec<(String, EnvFunc)>,
    accessor: OnceLock<Arc<KubeAccessor>>,
    gitea: OnceLock<GiteaClient>,
    tunnel: Mutex<Option<PortForward>>,
}

impl Environment {
    /// Start building an environment
    pub fn builder(config: EnvConfig) -> EnvironmentBuilder {
        EnvironmentBuilder {
            config,
            setup_funcs: Vec::new(),
            finish_funcs: Vec::new(),
        }
    }

    /// Configuration the environment was built with
    pub fn config(&self) -> &EnvConfig {
        &self.config
    }

    /// Namespace of the controllers and test objects
    pub fn namespace(&self) -> &str {
        &self.config.namespace
    }

    /// Kubeconfig in use: the configured one or the one exported for the
    /// provisioned kind cluster
    pub fn kubeconfig_path(&self) -> &Path {
        &self.kubeconfig
    }

    /// Build the client and accessor; fails when already connected
    pub async fn connect(&self) -> Result<()> {
        let client = create_client_with_retry(Some(self.kubeconfig.as_path())).await?;
        self.connect_with(client)
    }

    /// Use an existing client
    pub fn connect_with(&self, client: Client) -> Result<()> {
        let accessor = Arc::new(KubeAccessor::new(client, Scheme::with_builtin_types()));
        self.accessor
            .set(accessor)
            .map_err(|_| Error::lifecycle("environment", "already connected"))?;
        info!(kubeconfig = %self.kubeconfig.display(), "[Environment] Connected");
        Ok(())
    }

    /// Resource accessor; fails before [`connect`](Self::connect)
    pub fn accessor(&self) -> Result<Arc<KubeAccessor>> {
        self.accessor
            .get()
            .cloned()
            .ok_or_else(|| Error::lifecycle("environment", "not connected to a cluster"))
    }

    /// Kube client; fails before [`connect`](Self::connect)
    pub fn client(&self) -> Result<Client> {
        Ok(self.accessor()?.client().clone())
    }

    /// Install the Gitea client; fails when one is already set
    pub fn set_gitea(&self, client: GiteaClient) -> Result<()> {
        self.gitea
            .set(client)
            .map_err(|_| Error::lifecycle("environment", "gitea client already set"))
    }

    /// Gitea client; fails before Gitea is installed
    pub fn gitea(&self) -> Result<&GiteaClient> {
        self.gitea
            .get()
            .ok_or_else(|| Error::lifecycle("environment", "gitea is not set up"))
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Run setup funcs in order, stopping at the first failure
    pub async fn setup(self: &Arc<Self>) -> Result<()> {
        for (name, f) in &self.setup_funcs {
            info!(step = %name, "[Environment] Setup");
            if let Err(e) = f(self.clone()).await {
                error!(step = %name, error = %e, "[Environment] Setup failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Run every finish func in reverse order. Errors are logged; the first
    /// one is returned after all funcs ran.
    pub async fn finish(self: &Arc<Self>) -> Result<()> {
        let mut first_error = None;
        for (name, f) in self.finish_funcs.iter().rev() {
            info!(step = %name, "[Environment] Finish");
            if let Err(e) = f(self.clone()).await {
                warn!(step = %name, error = %e, "[Environment] Finish step failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Run features one after another and summarise them
    pub async fn test(self: &Arc<Self>, suite: &str, features: &[Feature]) -> Result<()> {
        let harness = TestHarness::new(suite);
        for feature in features {
            harness.run_feature(feature, self.clone()).await;
        }
        harness.finish()
    }

    /// Setup, test and finish. Finish always runs; the earliest error wins.
    pub async fn run(self: &Arc<Self>, suite: &str, features: &[Feature]) -> Result<()> {
        let outcome = match self.setup().await {
            Ok(()) => self.test(suite, features).await,
            Err(e) => Err(e),
        };
        let finished = self.finish().await;
        outcome.and(finished)
    }

    // =========================================================================
    // Registry
    // =========================================================================

    /// Forward the registry port to the single registry pod
    pub async fn start_registry_tunnel(&self) -> Result<u16> {
        let mut slot = self.tunnel.lock().await;
        if slot.is_some() {
            return Err(Error::lifecycle("registry_tunnel", "already running"));
        }

        let accessor = self.accessor()?;
        let selector = self.registry_selector();
        wait_for(
            accessor.as_ref(),
            WaitRequest::selected(self.namespace(), &selector, serving_pod()).with_timeout(TIMEOUT_MEDIUM),
        )
        .await?;

        let pods: Vec<Pod> = accessor.list_as(self.namespace(), &selector).await?;
        if pods.len() != 1 {
            return Err(Error::lifecycle(
                "registry_tunnel",
                format!("expected exactly one pod matching {}, found {}", selector, pods.len()),
            ));
        }
        let pod = pods[0].metadata.name.clone().unwrap_or_default();

        let tunnel = self.forward_to(&pod).await?;
        let port = tunnel.port();
        *slot = Some(tunnel);
        Ok(port)
    }

    /// Stop the registry tunnel; errors when none is running
    pub async fn stop_registry_tunnel(&self) -> Result<()> {
        let tunnel = self
            .tunnel
            .lock()
            .await
            .take()
            .ok_or_else(|| Error::lifecycle("registry_tunnel", "not running"))?;
        tunnel.shutdown().await
    }

    /// Whether a registry tunnel is currently held
    pub async fn has_registry_tunnel(&self) -> bool {
        self.tunnel.lock().await.is_some()
    }

    /// Fail with the tunnel's recorded error, if any
    pub async fn ensure_registry_healthy(&self) -> Result<()> {
        match self.tunnel.lock().await.as_ref() {
            Some(tunnel) => tunnel.ensure_healthy(),
            None => Err(Error::lifecycle("registry_tunnel", "not running")),
        }
    }

    /// Push a component version into `<registry>/<repository>`
    pub async fn push_component(&self, repository: &str, component: &ComponentVersion) -> Result<ComponentDescriptor> {
        self.ensure_registry_healthy().await?;
        RegistryClient::new(self.config.registry_url())?
            .push(repository, component)
            .await
    }

    /// Restart the registry Deployment and re-forward to its new pod
    pub async fn reset_registry(&self) -> Result<()> {
        let pod = self.restart_registry().await?;
        let mut slot = self.tunnel.lock().await;
        if let Some(old) = slot.take() {
            old.shutdown().await?;
        }
        *slot = Some(self.forward_to(&pod).await?);
        Ok(())
    }

    /// Roll the registry Deployment and return the name of a serving pod of
    /// its new ReplicaSet. Pods of the previous ReplicaSet are never picked,
    /// even while they are still terminating.
    pub async fn restart_registry(&self) -> Result<String> {
        let accessor = self.accessor()?;
        let app = &self.config.registry_app;
        info!(registry = %app, "[Environment] Resetting registry");

        let current: Deployment = accessor.get_as(self.namespace(), app).await?;
        let generation = current.metadata.generation.unwrap_or_default();

        let restarted_at = chrono::Utc::now().to_rfc3339();
        Api::<Deployment>::namespaced(accessor.client().clone(), self.namespace())
            .patch(app, &PatchParams::default(), &Patch::Strategic(restart_patch(&restarted_at)))
            .await
            .map_err(|e| Error::from_kube(e, "Deployment", self.namespace(), app))?;

        let rolled =
            wait_for_deployment_available(accessor.as_ref(), self.namespace(), app, TIMEOUT_MEDIUM, Some(generation))
                .await?;

        let replica_sets: Vec<ReplicaSet> = accessor.list_as(self.namespace(), &self.registry_selector()).await?;
        let hash = new_replica_set_hash(&rolled, &replica_sets).ok_or_else(|| {
            Error::internal_with_context("reset_registry", format!("no ReplicaSet for revision of {}", app))
        })?;

        let selector = format!("{},{}={}", self.registry_selector(), POD_TEMPLATE_HASH_LABEL, hash);
        let pod = wait_for(
            accessor.as_ref(),
            WaitRequest::selected(self.namespace(), &selector, serving_pod()).with_timeout(TIMEOUT_MEDIUM),
        )
        .await?
        .and_then(|pod| pod.metadata.name)
        .ok_or_else(|| Error::internal_with_context("reset_registry", "no registry pod selected"))?;
        info!(pod = %pod, hash = %hash, "[Environment] Registry restarted");
        Ok(pod)
    }

    fn registry_selector(&self) -> String {
        format!("app={}", self.config.registry_app)
    }

    async fn forward_to(&self, pod: &str) -> Result<PortForward> {
        let port = self.config.registry_port;
        let connector = PodConnector::new(self.client()?, self.namespace(), pod, port);
        PortForward::start(connector, port).await
    }
}

// =============================================================================
// Standard lifecycle funcs
// =============================================================================

async fn provision_cluster(env: Arc<Environment>) -> Result<()> {
    create_kind_cluster(&env.config.cluster_name, env.kubeconfig_path()).await
}

async fn destroy_cluster(env: Arc<Environment>) -> Result<()> {
    if env.config.keep_cluster {
        info!(cluster = %env.config.cluster_name, "[Environment] Keeping kind cluster");
        return Ok(());
    }
    delete_kind_cluster(&env.config.cluster_name).await
}

async fn create_test_namespace(env: Arc<Environment>) -> Result<()> {
    let namespace = Namespace {
        metadata: ObjectMeta {
            name: Some(env.namespace().to_string()),
            ..Default::default()
        },
        ..Default::default()
    };
    match env.accessor()?.create_typed(&namespace).await {
        Ok(()) => Ok(()),
        Err(Error::AlreadyExists { .. }) => {
            info!(namespace = %env.namespace(), "[Environment] Namespace already exists");
            Ok(())
        }
        Err(e) => Err(e),
    }
}

async fn delete_test_namespace(env: Arc<Environment>) -> Result<()> {
    let accessor = env.accessor()?;
    match accessor.delete_as::<Namespace>("", env.namespace()).await {
        Ok(()) => wait_for_deletion::<_, Namespace>(accessor.as_ref(), "", env.namespace(), TIMEOUT_LONG).await,
        Err(e) if e.is_not_found() => Ok(()),
        Err(e) => Err(e),
    }
}

async fn install_flux(env: Arc<Environment>) -> Result<()> {
    let accessor = env.accessor()?;
    flux::install_flux(accessor.client(), accessor.as_ref(), &env.config.flux_version).await
}

async fn apply_controller_manifests(env: Arc<Environment>) -> Result<()> {
    let Some(folder) = env.config.controller_manifests.as_deref() else {
        info!("[Environment] No controller manifests configured");
        return Ok(());
    };
    let bundle = read_manifest_folder(folder)?;
    let accessor = env.accessor()?;
    let applied = apply_manifests_with_retry(accessor.client(), &bundle, &RetryConfig::with_max_attempts(10)).await?;
    info!(folder = %folder.display(), objects = applied, "[Environment] Controller manifests applied");
    Ok(())
}

/// Concatenate every `*.yaml` / `*.yml` file of a folder, in name order
pub fn read_manifest_folder(folder: &Path) -> Result<String> {
    let patterns = [file_pattern("*.yaml")?, file_pattern("*.yml")?];
    let mut files: Vec<_> = std::fs::read_dir(folder)?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            let name = path.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            patterns.iter().any(|p| p.matches(&name))
        })
        .collect();
    files.sort();

    let mut bundle = String::new();
    for path in files {
        bundle.push_str(&std::fs::read_to_string(&path)?);
        bundle.push_str("\n---\n");
    }
    Ok(bundle)
}

async fn start_gitea(env: Arc<Environment>) -> Result<()> {
    let config = &env.config;
    let accessor = env.accessor()?;
    install_gitea(accessor.as_ref(), env.namespace(), &config.gitea_owner, &config.gitea_password).await?;

    let token = match &config.gitea_token {
        Some(token) => token.clone(),
        None => {
            GiteaClient::create_access_token(
                &config.gitea_url,
                &config.gitea_owner,
                &config.gitea_password,
                &config.cluster_name,
            )
            .await?
        }
    };
    env.set_gitea(GiteaClient::new(&config.gitea_url, &config.gitea_owner, token)?)
}

async fn stop_gitea(env: Arc<Environment>) -> Result<()> {
    remove_gitea(env.accessor()?.as_ref(), env.namespace()).await
}

async fn stop_registry_tunnel_if_running(env: Arc<Environment>) -> Result<()> {
    if env.has_registry_tunnel().await {
        env.stop_registry_tunnel().await
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{PodCondition, PodStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use std::sync::Mutex as StdMutex;

    use crate::harness::step;

    fn config() -> EnvConfig {
        EnvConfig {
            cluster_name: "ocm-e2e-test".to_string(),
            ..Default::default()
        }
    }

    fn recorder(journal: &Arc<StdMutex<Vec<String>>>, entry: &'static str, ok: bool) -> EnvFunc {
        let journal = journal.clone();
        env_func(move |_env| {
            let journal = journal.clone();
            async move {
                journal.lock().unwrap().push(entry.to_string());
                if ok {
                    Ok(())
                } else {
                    Err(Error::lifecycle(entry, "failed"))
                }
            }
        })
    }

    fn pod(phase: &str, ready: &str, deleting: bool) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some("registry-abc".to_string()),
                deletion_timestamp: deleting.then(|| Time(chrono::Utc::now())),
                ..Default::default()
            },
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: CONDITION_READY.to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn restart_patch_sets_the_restarted_at_annotation() {
        let patch = restart_patch("2024-01-01T00:00:00Z");
        assert_eq!(
            patch["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2024-01-01T00:00:00Z"
        );
    }

    #[test]
    fn serving_pod_requires_running_ready_and_alive() {
        let predicate = serving_pod();
        assert!(predicate.evaluate(Some(&pod("Running", "True", false))));
        assert!(!predicate.evaluate(Some(&pod("Running", "False", false))));
        assert!(!predicate.evaluate(Some(&pod("Pending", "True", false))));
        assert!(!predicate.evaluate(Some(&pod("Running", "True", true))));
        assert!(!predicate.evaluate(None));
    }

    #[test]
    fn provisioned_cluster_exports_kubeconfig_to_temp_dir() {
        let env = Environment::builder(config()).build();
        assert_eq!(
            env.kubeconfig_path(),
            std::env::temp_dir().join("ocm-e2e-test.kubeconfig")
        );
    }

    #[test]
    fn configured_kubeconfig_is_used_as_is() {
        let env = Environment::builder(EnvConfig {
            kubeconfig: Some(PathBuf::from("/tmp/kc")),
            ..config()
        })
        .build();
        assert_eq!(env.kubeconfig_path(), Path::new("/tmp/kc"));
    }

    #[test]
    fn handles_fail_before_setup() {
        let env = Environment::builder(config()).build();
        assert!(matches!(env.accessor(), Err(Error::Lifecycle { .. })));
        assert!(matches!(env.client(), Err(Error::Lifecycle { .. })));
        assert!(matches!(env.gitea(), Err(Error::Lifecycle { .. })));
    }

    #[test]
    fn gitea_client_can_only_be_set_once() {
        let env = Environment::builder(config()).build();
        let client = GiteaClient::new("http://127.0.0.1:3000", "e2e-tester", "token").unwrap();
        env.set_gitea(client.clone()).unwrap();
        assert_eq!(env.gitea().unwrap().owner(), "e2e-tester");
        assert!(env.set_gitea(client).is_err());
    }

    #[tokio::test]
    async fn stopping_a_tunnel_that_never_started_is_an_error() {
        let env = Environment::builder(config()).build();
        assert!(!env.has_registry_tunnel().await);
        let err = env.stop_registry_tunnel().await.unwrap_err();
        assert!(err.to_string().contains("not running"));
        assert!(env.ensure_registry_healthy().await.is_err());
    }

    #[tokio::test]
    async fn push_without_tunnel_fails_before_any_request() {
        let env = Environment::builder(config()).build();
        let err = env
            .push_component("ocm-podinfo", &ComponentVersion::new("github.com/acme/podinfo", "v6.0.0"))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Lifecycle { .. }));
    }

    #[tokio::test]
    async fn story_setup_in_order_finish_in_reverse() {
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let env = Environment::builder(config())
            .setup("cluster", recorder(&journal, "create cluster", true))
            .finish("cluster", recorder(&journal, "delete cluster", true))
            .setup("namespace", recorder(&journal, "create namespace", true))
            .finish("namespace", recorder(&journal, "delete namespace", true))
            .build();

        let feature = Feature::new("noop").assess(
            "noop",
            step({
                let journal = journal.clone();
                move |_env: Arc<Environment>, ctx| {
                    let journal = journal.clone();
                    async move {
                        journal.lock().unwrap().push("assess".to_string());
                        Ok(ctx)
                    }
                }
            }),
        );

        env.run("lifecycle", &[feature]).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec![
                "create cluster",
                "create namespace",
                "assess",
                "delete namespace",
                "delete cluster"
            ]
        );
    }

    #[tokio::test]
    async fn failed_setup_skips_features_but_finish_runs() {
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let env = Environment::builder(config())
            .setup("cluster", recorder(&journal, "create cluster", true))
            .finish("cluster", recorder(&journal, "delete cluster", true))
            .setup("flux", recorder(&journal, "install flux", false))
            .setup("gitea", recorder(&journal, "install gitea", true))
            .build();

        let err = env.run("lifecycle", &[]).await.unwrap_err();

        assert!(err.to_string().contains("install flux"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["create cluster", "install flux", "delete cluster"]
        );
    }

    #[tokio::test]
    async fn finish_errors_do_not_stop_later_finish_funcs() {
        let journal = Arc::new(StdMutex::new(Vec::new()));
        let env = Environment::builder(config())
            .finish("cluster", recorder(&journal, "delete cluster", true))
            .finish("namespace", recorder(&journal, "delete namespace", false))
            .build();

        let err = env.finish().await.unwrap_err();

        assert!(err.to_string().contains("delete namespace"));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["delete namespace", "delete cluster"]
        );
    }

    #[tokio::test]
    async fn failing_feature_fails_the_run() {
        let env = Environment::builder(config()).build();
        let feature = Feature::new("broken").assess(
            "always fails",
            step(|_env: Arc<Environment>, _ctx| async move {
                Err(Error::assertion("file content", "a", "b"))
            }),
        );

        let err = env.run("suite", &[feature]).await.unwrap_err();
        assert!(err.to_string().contains("broken"));
    }

    #[test]
    fn manifest_folder_is_concatenated_in_name_order() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("b.yaml"), "kind: B").unwrap();
        std::fs::write(dir.path().join("a.yml"), "kind: A").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let bundle = read_manifest_folder(dir.path()).unwrap();

        assert_eq!(bundle, "kind: A\n---\nkind: B\n---\n");
    }

    #[test]
    fn standard_lifecycle_skips_kind_for_existing_clusters() {
        let own = Environment::builder(config()).with_standard_lifecycle().build();
        let existing = Environment::builder(EnvConfig {
            kubeconfig: Some(PathBuf::from("/tmp/kc")),
            ..config()
        })
        .with_standard_lifecycle()
        .build();

        let names = |env: &Environment| env.setup_funcs.iter().map(|(n, _)| n.clone()).collect::<Vec<_>>();
        assert_eq!(names(&own)[0], "create kind cluster");
        assert_eq!(names(&existing)[0], "connect");
        assert_eq!(own.finish_funcs.len(), existing.finish_funcs.len() + 1);
    }

    fn replica_set(owner: &str, revision: &str, hash: &str) -> ReplicaSet {
        serde_json::from_value(json!({
            "metadata": {
                "name": format!("registry-{}", hash),
                "labels": {"app": "registry", POD_TEMPLATE_HASH_LABEL: hash},
                "annotations": {REVISION_ANNOTATION: revision},
                "ownerReferences": [{
                    "apiVersion": "apps/v1", "kind": "Deployment", "name": "registry", "uid": owner
                }]
            }
        }))
        .unwrap()
    }

    fn registry_deployment(generation: i64, revision: &str) -> serde_json::Value {
        json!({
            "apiVersion": "apps/v1",
            "kind": "Deployment",
            "metadata": {
                "name": "registry",
                "namespace": "ocm-system",
                "uid": "d-1",
                "generation": generation,
                "annotations": {REVISION_ANNOTATION: revision}
            },
            "spec": {
                "replicas": 1,
                "selector": {"matchLabels": {"app": "registry"}},
                "template": {"metadata": {"labels": {"app": "registry"}}}
            },
            "status": {
                "observedGeneration": generation,
                "replicas": 1,
                "updatedReplicas": 1,
                "availableReplicas": 1,
                "conditions": [
                    {"type": "Available", "status": "True"},
                    {"type": "Progressing", "status": "True", "reason": "NewReplicaSetAvailable"}
                ]
            }
        })
    }

    fn serving_pod_json(name: &str, hash: &str) -> serde_json::Value {
        json!({
            "metadata": {
                "name": name,
                "namespace": "ocm-system",
                "labels": {"app": "registry", POD_TEMPLATE_HASH_LABEL: hash}
            },
            "status": {"phase": "Running", "conditions": [{"type": "Ready", "status": "True"}]}
        })
    }

    #[test]
    fn new_replica_set_is_picked_by_revision_and_owner() {
        let deployment: Deployment = serde_json::from_value(registry_deployment(2, "2")).unwrap();
        let sets = vec![
            replica_set("other-uid", "2", "foreign"),
            replica_set("d-1", "1", "old"),
            replica_set("d-1", "2", "new"),
        ];
        assert_eq!(new_replica_set_hash(&deployment, &sets).as_deref(), Some("new"));
        assert_eq!(new_replica_set_hash(&deployment, &sets[..2]), None);
    }

    #[test]
    fn deployment_without_revision_has_no_new_replica_set() {
        let sets = vec![replica_set("d-1", "1", "old")];
        assert_eq!(new_replica_set_hash(&Deployment::default(), &sets), None);
    }

    async fn mount_rollout(server: &wiremock::MockServer) {
        use wiremock::matchers::{method, path, query_param};
        use wiremock::{Mock, ResponseTemplate};

        let deployment_path = "/apis/apps/v1/namespaces/ocm-system/deployments/registry";
        Mock::given(method("GET"))
            .and(path(deployment_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(registry_deployment(1, "1")))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(deployment_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(registry_deployment(2, "2")))
            .mount(server)
            .await;
        Mock::given(method("PATCH"))
            .and(path(deployment_path))
            .respond_with(ResponseTemplate::new(200).set_body_json(registry_deployment(2, "1")))
            .expect(1)
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/apis/apps/v1/namespaces/ocm-system/replicasets"))
            .and(query_param("labelSelector", "app=registry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "apps/v1",
                "kind": "ReplicaSetList",
                "metadata": {},
                "items": [
                    serde_json::to_value(replica_set("d-1", "1", "old")).unwrap(),
                    serde_json::to_value(replica_set("d-1", "2", "new")).unwrap()
                ]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/ocm-system/pods"))
            .and(query_param("labelSelector", "app=registry,pod-template-hash=new"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [serving_pod_json("registry-new-x", "new")]
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/v1/namespaces/ocm-system/pods"))
            .and(query_param("labelSelector", "app=registry"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "apiVersion": "v1",
                "kind": "PodList",
                "metadata": {},
                "items": [serving_pod_json("registry-old-y", "old")]
            })))
            .expect(0)
            .mount(server)
            .await;
    }

    /// Story: while the old registry pod is still Running and Ready next to
    /// the new one, the restart hands back only the new ReplicaSet's pod.
    #[tokio::test]
    async fn story_restart_selects_the_pod_of_the_new_replica_set() {
        let server = wiremock::MockServer::start().await;
        mount_rollout(&server).await;
        let env = crate::steps::testing::kube_env(&server);

        let pod = env.restart_registry().await.unwrap();

        assert_eq!(pod, "registry-new-x");
    }

    #[tokio::test]
    async fn failed_forward_after_reset_leaves_no_tunnel() {
        let server = wiremock::MockServer::start().await;
        mount_rollout(&server).await;
        let env = crate::steps::testing::kube_env(&server);

        assert!(env.reset_registry().await.is_err());
        assert!(!env.has_registry_tunnel().await);
    }

    #[tokio::test]
    async fn restart_of_a_missing_registry_is_not_found() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("GET"))
            .and(wiremock::matchers::path("/apis/apps/v1/namespaces/ocm-system/deployments/registry"))
            .respond_with(
                wiremock::ResponseTemplate::new(404)
                    .set_body_json(crate::steps::testing::status(404, "NotFound")),
            )
            .mount(&server)
            .await;
        let env = crate::steps::testing::kube_env(&server);

        let err = env.restart_registry().await.unwrap_err();
        assert!(err.is_not_found());
    }
}
