//! Teardown steps: dump state for debugging

use std::sync::Arc;

use k8s_openapi::api::core::v1::{Namespace, Pod};
use kube::api::{Api, ListParams, LogParams};
use tracing::{info, warn};

use crate::environment::Environment;
use crate::harness::{step, Step};
use crate::steps::Controller;
use crate::Error;

/// Log the pods and logs of each controller, then every pod in the cluster
pub fn dump_cluster_state(controllers: Vec<Controller>) -> Step {
    let controllers = Arc::new(controllers);
    step(move |env: Arc<Environment>, ctx| {
        let controllers = controllers.clone();
        async move {
            let client = env.client()?;

            for controller in controllers.iter() {
                let pods: Api<Pod> = Api::namespaced(client.clone(), &controller.namespace);
                let list = pods
                    .list(&ListParams::default().labels(&controller.label_selector))
                    .await
                    .map_err(|e| Error::from_kube(e, "Pod", &controller.namespace, &controller.label_selector))?;

                for pod in list.items {
                    let name = pod.metadata.name.unwrap_or_default();
                    match pods.logs(&name, &LogParams::default()).await {
                        Ok(logs) => info!(pod = %name, namespace = %controller.namespace, "controller logs:\n{}", logs),
                        Err(e) => warn!(pod = %name, error = %e, "failed to fetch controller logs"),
                    }
                }
            }

            let namespaces: Api<Namespace> = Api::all(client.clone());
            let list = namespaces
                .list(&ListParams::default())
                .await
                .map_err(|e| Error::from_kube(e, "Namespace", "", ""))?;
            for ns in list.items {
                let ns_name = ns.metadata.name.unwrap_or_default();
                let pods: Api<Pod> = Api::namespaced(client.clone(), &ns_name);
                let pod_list = pods
                    .list(&ListParams::default())
                    .await
                    .map_err(|e| Error::from_kube(e, "Pod", &ns_name, ""))?;
                for pod in pod_list.items {
                    info!("{}", pod_line(&pod));
                }
            }
            Ok(ctx)
        }
    })
}

/// Log every entry on the default branch of a repository
pub fn dump_repository_content(repo: &str) -> Step {
    let repo = repo.to_string();
    step(move |env: Arc<Environment>, ctx| {
        let repo = repo.clone();
        async move {
            let gitea = env.gitea()?;
            for entry in gitea.list_tree(&repo).await? {
                info!(repo = %repo, "Type: {} | Path: {}", entry.type_, entry.path);
            }
            Ok(ctx)
        }
    })
}

fn pod_line(pod: &Pod) -> String {
    let phase = pod
        .status
        .as_ref()
        .and_then(|s| s.phase.as_deref())
        .unwrap_or("Unknown");
    format!(
        "Name: {} | Namespace: {} | Phase: {}",
        pod.metadata.name.as_deref().unwrap_or_default(),
        pod.metadata.namespace.as_deref().unwrap_or_default(),
        phase
    )
}
