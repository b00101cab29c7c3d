//! User-space tunnel from a local ephemeral port to a pod port

use crate::Result;
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::net::SocketAddr;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Running port-forward. Dropping it tears the tunnel down.
pub struct PortForward {
    local_addr: SocketAddr,
    remote_port: u16,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

impl PortForward {
    /// Listen on `127.0.0.1:0` and forward every accepted connection to
    /// `remote_port` of `pod`. The tunnel stops when `parent` is cancelled.
    pub async fn start(
        pods: Api<Pod>,
        pod: &str,
        remote_port: u16,
        parent: &CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(("127.0.0.1", 0)).await?;
        let local_addr = listener.local_addr()?;
        let cancel = parent.child_token();

        debug!("Forwarding {} to {}:{}", local_addr, pod, remote_port);

        let task = tokio::spawn(accept_loop(
            listener,
            pods,
            pod.to_string(),
            remote_port,
            cancel.clone(),
        ));

        Ok(Self {
            local_addr,
            remote_port,
            cancel,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn remote_port(&self) -> u16 {
        self.remote_port
    }

    pub async fn stop(mut self) {
        self.cancel.cancel();
        if let Err(e) = (&mut self.task).await {
            if !e.is_cancelled() {
                warn!("Port-forward task failed: {}", e);
            }
        }
    }
}

impl Drop for PortForward {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pods: Api<Pod>,
    pod: String,
    port: u16,
    cancel: CancellationToken,
) {
    loop {
        let (conn, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("Port-forward accept failed: {}", e);
                    continue;
                }
            },
        };

        debug!("Port-forward connection from {}", peer);
        let pods = pods.clone();
        let pod = pod.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {}
                res = forward(conn, &pods, &pod, port) => {
                    if let Err(e) = res {
                        warn!("Port-forward to {}:{} failed: {}", pod, port, e);
                    }
                }
            }
        });
    }
    debug!("Port-forward to {}:{} stopped", pod, port);
}

async fn forward(mut conn: TcpStream, pods: &Api<Pod>, pod: &str, port: u16) -> Result<()> {
    let mut forwarder = pods.portforward(pod, &[port]).await?;
    let mut upstream = forwarder.take_stream(port).ok_or_else(|| {
        std::io::Error::new(
            std::io::ErrorKind::NotConnected,
            format!("no stream for port {}", port),
        )
    })?;

    let (sent, received) = tokio::io::copy_bidirectional(&mut conn, &mut upstream).await?;
    debug!("Port-forward closed ({} bytes out, {} bytes in)", sent, received);

    drop(upstream);
    if let Err(e) = forwarder.join().await {
        debug!("Port-forward session ended with error: {}", e);
    }
    Ok(())
}
