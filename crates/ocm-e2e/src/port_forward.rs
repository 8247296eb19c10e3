//! Port-forward tunnel to the in-cluster registry
//!
//! A local TCP listener on `127.0.0.1:<port>` whose connections are each
//! carried over their own kube port-forward session to the registry pod.
//! The accept loop runs as a supervised task:
//!
//! - readiness is signalled once, after the listener is bound and a trial
//!   session to the pod succeeded
//! - failures are recorded instead of panicking and surface through
//!   [`PortForward::ensure_healthy`]
//! - [`PortForward::stop`] sends the one-shot stop signal and errors when
//!   called twice; `Drop` stops a tunnel that was never stopped explicitly

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::Client;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Error, Result};

/// Maximum time to wait for the tunnel to report readiness
pub const PORT_FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Byte stream to the forwarded port
pub trait UpstreamStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> UpstreamStream for T {}

/// Opens streams to the forwarded target
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open one stream to the target port
    async fn connect(&self) -> Result<Box<dyn UpstreamStream>>;

    /// Human readable target, for logs
    fn target(&self) -> String;
}

/// Forwards to a pod port through the kube API
pub struct PodConnector {
    pods: Api<Pod>,
    pod: String,
    port: u16,
}

impl PodConnector {
    /// Connector for `namespace/pod:port`
    pub fn new(client: Client, namespace: &str, pod: impl Into<String>, port: u16) -> Self {
        Self {
            pods: Api::namespaced(client, namespace),
            pod: pod.into(),
            port,
        }
    }
}

#[async_trait]
impl Connector for PodConnector {
    async fn connect(&self) -> Result<Box<dyn UpstreamStream>> {
        let mut forwarder = self
            .pods
            .portforward(&self.pod, &[self.port])
            .await
            .map_err(|e| Error::from_kube(e, "Pod", "", &self.pod))?;
        let stream = forwarder.take_stream(self.port).ok_or_else(|| {
            Error::lifecycle(
                "port_forward",
                format!("no stream for port {} on pod {}", self.port, self.pod),
            )
        })?;
        // The forwarder finishes on its own once the stream is closed
        tokio::spawn(async move {
            if let Err(e) = forwarder.join().await {
                debug!(error = %e, "port-forward session ended with error");
            }
        });
        Ok(Box::new(stream))
    }

    fn target(&self) -> String {
        format!("pod/{}:{}", self.pod, self.port)
    }
}

type FailureSlot = Arc<Mutex<Option<String>>>;

fn record_failure(slot: &FailureSlot, message: String) {
    let mut guard = slot.lock().unwrap_or_else(|e| e.into_inner());
    if guard.is_none() {
        *guard = Some(message);
    }
}

/// A running local tunnel
pub struct PortForward {
    port: u16,
    target: String,
    stop_tx: Option<oneshot::Sender<()>>,
    failure: FailureSlot,
    handle: Option<JoinHandle<()>>,
}

impl PortForward {
    /// Bind `127.0.0.1:<local_port>` and forward every connection through
    /// `connector`. Port `0` lets the OS pick a free port.
    pub async fn start<C: Connector>(connector: C, local_port: u16) -> Result<Self> {
        let target = connector.target();
        let (ready_tx, ready_rx) = oneshot::channel::<Result<u16>>();
        let (stop_tx, stop_rx) = oneshot::channel::<()>();
        let failure: FailureSlot = Arc::new(Mutex::new(None));

        let handle = tokio::spawn(run_tunnel(
            Arc::new(connector),
            local_port,
            ready_tx,
            stop_rx,
            failure.clone(),
        ));

        let port = match tokio::time::timeout(PORT_FORWARD_READY_TIMEOUT, ready_rx).await {
            Ok(Ok(Ok(port))) => port,
            Ok(Ok(Err(e))) => {
                handle.abort();
                return Err(e);
            }
            Ok(Err(_)) => {
                handle.abort();
                return Err(Error::lifecycle(
                    "port_forward",
                    format!("tunnel to {} exited before becoming ready", target),
                ));
            }
            Err(_) => {
                handle.abort();
                return Err(Error::lifecycle(
                    "port_forward",
                    format!(
                        "tunnel to {} not ready after {:?}",
                        target, PORT_FORWARD_READY_TIMEOUT
                    ),
                ));
            }
        };

        info!(port, %target, "[PortForward] Started");
        Ok(Self {
            port,
            target,
            stop_tx: Some(stop_tx),
            failure,
            handle: Some(handle),
        })
    }

    /// Local port being forwarded
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Forwarding target
    pub fn target(&self) -> &str {
        &self.target
    }

    /// True until stopped or failed
    pub fn is_healthy(&self) -> bool {
        self.ensure_healthy().is_ok()
    }

    /// Surface a recorded background failure, or a tunnel that is gone
    pub fn ensure_healthy(&self) -> Result<()> {
        if let Some(message) = self
            .failure
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            return Err(Error::lifecycle("port_forward", message));
        }
        if self.stop_tx.is_none() {
            return Err(Error::lifecycle(
                "port_forward",
                format!("tunnel to {} was stopped", self.target),
            ));
        }
        if self.handle.as_ref().map(|h| h.is_finished()).unwrap_or(true) {
            return Err(Error::lifecycle(
                "port_forward",
                format!("tunnel to {} exited", self.target),
            ));
        }
        Ok(())
    }

    /// Send the stop signal; a second call is an error
    pub fn stop(&mut self) -> Result<()> {
        let stop_tx = self.stop_tx.take().ok_or_else(|| {
            Error::lifecycle(
                "port_forward",
                format!("tunnel to {} already stopped", self.target),
            )
        })?;
        info!(port = self.port, target = %self.target, "[PortForward] Stopping");
        // The loop may already have exited after a failure
        let _ = stop_tx.send(());
        Ok(())
    }

    /// Stop and wait for the accept loop to exit
    pub async fn shutdown(mut self) -> Result<()> {
        self.stop()?;
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "port-forward task did not exit cleanly");
            }
        }
        Ok(())
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        if let Some(stop_tx) = self.stop_tx.take() {
            debug!(port = self.port, "[PortForward] Stopping on drop");
            let _ = stop_tx.send(());
        }
    }
}

async fn run_tunnel<C: Connector>(
    connector: Arc<C>,
    local_port: u16,
    ready_tx: oneshot::Sender<Result<u16>>,
    mut stop_rx: oneshot::Receiver<()>,
    failure: FailureSlot,
) {
    let listener = match TcpListener::bind(("127.0.0.1", local_port)).await {
        Ok(listener) => listener,
        Err(e) => {
            let _ = ready_tx.send(Err(Error::lifecycle(
                "port_forward",
                format!("failed to bind 127.0.0.1:{}: {}", local_port, e),
            )));
            return;
        }
    };
    let port = match listener.local_addr() {
        Ok(addr) => addr.port(),
        Err(e) => {
            let _ = ready_tx.send(Err(Error::Io(e)));
            return;
        }
    };

    // One trial session so readiness means the target is reachable
    match connector.connect().await {
        Ok(session) => drop(session),
        Err(e) => {
            let _ = ready_tx.send(Err(e));
            return;
        }
    }
    if ready_tx.send(Ok(port)).is_err() {
        return;
    }

    loop {
        tokio::select! {
            _ = &mut stop_rx => {
                debug!(port, "port-forward stop signal received");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((conn, peer)) => {
                    debug!(port, %peer, "accepted connection");
                    tokio::spawn(forward_connection(connector.clone(), conn, failure.clone()));
                }
                Err(e) => {
                    warn!(port, error = %e, "port-forward accept failed");
                    record_failure(&failure, format!("accept on 127.0.0.1:{} failed: {}", port, e));
                    break;
                }
            }
        }
    }
}

async fn forward_connection<C: Connector>(connector: Arc<C>, mut conn: TcpStream, failure: FailureSlot) {
    let mut upstream = match connector.connect().await {
        Ok(upstream) => upstream,
        Err(e) => {
            warn!(target = %connector.target(), error = %e, "port-forward session failed");
            record_failure(
                &failure,
                format!("forwarding to {} failed: {}", connector.target(), e),
            );
            return;
        }
    };
    if let Err(e) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await {
        debug!(error = %e, "forwarded connection closed with error");
    }
}
