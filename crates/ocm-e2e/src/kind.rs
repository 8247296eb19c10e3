//! kind cluster provisioning

use std::path::Path;
use std::process::Stdio;

use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{info, warn};

use crate::gitea::GITEA_NODE_PORT;
use crate::{Error, Result};

/// Host port the Gitea NodePort is published on
pub const GITEA_HOST_PORT: u16 = 3000;

/// kind cluster config.
///
/// The Gitea NodePort is mapped onto the host so the API is reachable at
/// `127.0.0.1:3000` without a second tunnel.
pub fn kind_config() -> String {
    format!(
        r#"kind: Cluster
apiVersion: kind.x-k8s.io/v1alpha4
nodes:
- role: control-plane
  extraPortMappings:
  - containerPort: {node_port}
    hostPort: {host_port}
    listenAddress: "127.0.0.1"
    protocol: TCP
"#,
        node_port = GITEA_NODE_PORT,
        host_port = GITEA_HOST_PORT,
    )
}

/// Create a kind cluster and export its kubeconfig.
///
/// A leftover cluster with the same name is removed first.
pub async fn create_kind_cluster(name: &str, kubeconfig_path: &Path) -> Result<()> {
    if kind(&["delete", "cluster", "--name", name], None).await.is_ok() {
        info!(cluster = name, "removed leftover kind cluster");
    }

    info!(cluster = name, "creating kind cluster");
    let config = kind_config();
    kind(
        &["create", "cluster", "--name", name, "--config", "-"],
        Some(config.as_bytes()),
    )
    .await?;

    let kubeconfig = kubeconfig_path
        .to_str()
        .ok_or_else(|| Error::command_failed("kubeconfig path contains invalid UTF-8"))?;
    kind(&["export", "kubeconfig", "--name", name, "--kubeconfig", kubeconfig], None).await?;

    info!(cluster = name, kubeconfig = %kubeconfig_path.display(), "kind cluster ready");
    Ok(())
}

/// Delete a kind cluster
pub async fn delete_kind_cluster(name: &str) -> Result<()> {
    info!(cluster = name, "deleting kind cluster");
    kind(&["delete", "cluster", "--name", name], None)
        .await
        .inspect_err(|e| warn!(cluster = name, error = %e, "kind delete failed"))
}

/// Run `kind <args>`, feeding `stdin` when given. A non-zero exit becomes
/// `CommandFailed` carrying stderr.
async fn kind(args: &[&str], stdin: Option<&[u8]>) -> Result<()> {
    let mut child = Command::new("kind")
        .args(args)
        .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;

    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
    }

    let output = child.wait_with_output().await?;
    if output.status.success() {
        return Ok(());
    }
    Err(Error::command_failed(format!(
        "kind {} failed: {}",
        args.iter().take(2).copied().collect::<Vec<_>>().join(" "),
        String::from_utf8_lossy(&output.stderr).trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_maps_gitea_node_port_to_localhost() {
        let config = kind_config();
        assert!(config.contains("kind: Cluster"));
        assert!(config.contains(&format!("containerPort: {}", GITEA_NODE_PORT)));
        assert!(config.contains("hostPort: 3000"));
        assert!(config.contains("listenAddress: \"127.0.0.1\""));
    }
}
