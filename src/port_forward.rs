use anyhow::{Context, Result};
use k8s_openapi::api::core::v1::Pod;
use kube::Api;
use std::future::{Future, pending};
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, copy_bidirectional};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::k8s::KubeGateway;

const ACCEPT_BACKOFF_START: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

pub trait Tunnel: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> Tunnel for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

pub trait ForwardConnector: Send + Sync + 'static {
    fn connect(&self) -> impl Future<Output = Result<Box<dyn Tunnel>>> + Send;
}

pub struct PodPortConnector {
    api: Api<Pod>,
    pod: String,
    port: u16,
}

impl ForwardConnector for PodPortConnector {
    async fn connect(&self) -> Result<Box<dyn Tunnel>> {
        let mut forwarder = self
            .api
            .portforward(&self.pod, &[self.port])
            .await
            .with_context(|| format!("failed to forward to {}:{}", self.pod, self.port))?;
        let stream = forwarder
            .take_stream(self.port)
            .with_context(|| format!("no stream for port {} on {}", self.port, self.pod))?;

        let pod = self.pod.clone();
        tokio::spawn(async move {
            if let Err(error) = forwarder.join().await {
                debug!(pod, error = %error, "forwarded stream closed with error");
            }
        });
        Ok(Box::new(stream))
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForwardOptions {
    pub cancel: CancellationToken,
    pub trap_interrupt: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BridgeState {
    Idle,
    Listening,
    Draining,
    Closed,
}

fn advance(state: &mut BridgeState, next: BridgeState) {
    debug!(from = ?*state, to = ?next, "port forward state");
    *state = next;
}

impl KubeGateway {
    pub async fn port_forward(
        &self,
        namespace: &str,
        pod: &str,
        local_port: u16,
        remote_port: u16,
        options: ForwardOptions,
        ready: impl FnOnce(SocketAddr),
    ) -> Result<()> {
        let connector = Arc::new(PodPortConnector {
            api: self.api::<Pod>(namespace),
            pod: pod.to_string(),
            port: remote_port,
        });
        info!(namespace, pod, local_port, remote_port, "starting port forward");
        serve(
            connector,
            SocketAddr::from((Ipv4Addr::LOCALHOST, local_port)),
            options,
            ready,
        )
        .await
    }
}

/// Accepts local connections and bridges each to its own tunnel. When the
/// bridge stops, the listener closes first and open relays are then aborted.
pub async fn serve<C>(
    connector: Arc<C>,
    address: SocketAddr,
    options: ForwardOptions,
    ready: impl FnOnce(SocketAddr),
) -> Result<()>
where
    C: ForwardConnector,
{
    let mut state = BridgeState::Idle;
    let listener = TcpListener::bind(address)
        .await
        .with_context(|| format!("failed to listen on {address}"))?;
    let local = listener
        .local_addr()
        .context("failed to read listener address")?;
    advance(&mut state, BridgeState::Listening);
    ready(local);

    let mut interrupt = pin!(async {
        if options.trap_interrupt {
            tokio::signal::ctrl_c().await
        } else {
            pending().await
        }
    });
    let mut connections = JoinSet::new();
    let mut backoff = None;
    let mut resume_at = None;

    loop {
        tokio::select! {
            biased;
            _ = options.cancel.cancelled() => {
                debug!("port forward cancelled");
                break;
            }
            signal = &mut interrupt => {
                signal.context("failed to listen for interrupt")?;
                debug!("port forward interrupted");
                break;
            }
            _ = sleep_until(resume_at.unwrap_or_else(Instant::now)), if resume_at.is_some() => {
                resume_at = None;
            }
            accepted = listener.accept(), if resume_at.is_none() => match accepted {
                Ok((socket, peer)) => {
                    backoff = None;
                    debug!(%peer, "accepted local connection");
                    connections.spawn(relay(connector.clone(), socket, peer));
                }
                Err(error) => {
                    let delay = accept_backoff(backoff);
                    warn!(
                        error = %error,
                        retry_in_ms = delay.as_millis() as u64,
                        "failed to accept local connection"
                    );
                    backoff = Some(delay);
                    resume_at = Some(Instant::now() + delay);
                }
            },
            Some(joined) = connections.join_next(), if !connections.is_empty() => {
                if let Err(error) = joined {
                    warn!(error = %error, "connection relay panicked");
                }
            }
        }
    }

    drop(listener);
    advance(&mut state, BridgeState::Draining);
    let open = connections.len();
    connections.shutdown().await;
    advance(&mut state, BridgeState::Closed);
    info!(%local, aborted = open, "port forward closed");
    Ok(())
}

fn accept_backoff(previous: Option<Duration>) -> Duration {
    previous.map_or(ACCEPT_BACKOFF_START, |delay| (delay * 2).min(ACCEPT_BACKOFF_MAX))
}

async fn relay<C: ForwardConnector>(connector: Arc<C>, mut socket: TcpStream, peer: SocketAddr) {
    let mut tunnel = match connector.connect().await {
        Ok(tunnel) => tunnel,
        Err(error) => {
            warn!(%peer, "{error:#}");
            return;
        }
    };

    match copy_bidirectional(&mut socket, &mut tunnel).await {
        Ok((sent, received)) => debug!(%peer, sent, received, "local connection closed"),
        Err(error) => debug!(%peer, error = %error, "local connection dropped"),
    }
}
