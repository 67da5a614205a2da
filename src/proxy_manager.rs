use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::dns::DnsResolver;
use crate::metrics::MetricsSink;
use crate::registry::UserRegistry;
use crate::relay::{tcp, udp};
use crate::replay::ReplayGuard;

struct PortListener {
    cancel: CancellationToken,
    tcp_task: JoinHandle<()>,
    udp_task: JoinHandle<()>,
}

/// Owns the live `port -> listener` set and keeps it in sync with the
/// registry's enabled ports: opens a TCP+UDP pair for any newly-enabled
/// port, closes the pair for any port no enabled user references anymore.
/// A bind failure is logged and that port is skipped, not fatal to the
/// process — the next `reconcile` call retries it.
pub struct ProxyManager {
    listen_host: String,
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    resolver: Arc<dyn DnsResolver>,
    idle_timeout: Duration,
    tcp_conn_limit: u32,
    metrics: Arc<dyn MetricsSink>,
    active: DashMap<u16, PortListener>,
}

impl ProxyManager {
    pub fn new(
        listen_host: String,
        registry: Arc<UserRegistry>,
        replay_guard: Arc<ReplayGuard>,
        resolver: Arc<dyn DnsResolver>,
        idle_timeout: Duration,
        tcp_conn_limit: u32,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        Self {
            listen_host,
            registry,
            replay_guard,
            resolver,
            idle_timeout,
            tcp_conn_limit,
            metrics,
            active: DashMap::new(),
        }
    }

    /// Diffs the registry's current enabled-port set against what is
    /// listening and opens/closes the difference.
    pub async fn reconcile(&self) {
        let wanted: HashSet<u16> = self.registry.enabled_ports().into_iter().collect();

        let to_close: Vec<u16> = self
            .active
            .iter()
            .map(|e| *e.key())
            .filter(|port| !wanted.contains(port))
            .collect();
        for port in to_close {
            self.close_port(port).await;
        }

        for port in wanted {
            if !self.active.contains_key(&port) {
                self.open_port(port).await;
            }
        }
    }

    async fn open_port(&self, port: u16) {
        let bind_addr = format!("{}:{}", self.listen_host, port);

        let tcp_listener = match TcpListener::bind(&bind_addr).await {
            Ok(l) => l,
            Err(e) => {
                warn!(addr = bind_addr, error = %e, "failed to bind tcp listener");
                return;
            }
        };
        let udp_socket = match UdpSocket::bind(&bind_addr).await {
            Ok(s) => Arc::new(s),
            Err(e) => {
                warn!(addr = bind_addr, error = %e, "failed to bind udp socket");
                return;
            }
        };

        info!(addr = bind_addr, "shadowsocks port opened");

        let cancel = CancellationToken::new();

        let tcp_task = {
            let registry = self.registry.clone();
            let replay_guard = self.replay_guard.clone();
            let resolver = self.resolver.clone();
            let idle_timeout = self.idle_timeout;
            let tcp_conn_limit = self.tcp_conn_limit;
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        result = tcp_listener.accept() => {
                            let (stream, peer) = match result {
                                Ok(v) => v,
                                Err(e) => {
                                    error!(port, error = %e, "tcp accept failed");
                                    continue;
                                }
                            };
                            let registry = registry.clone();
                            let replay_guard = replay_guard.clone();
                            let resolver = resolver.clone();
                            let metrics = metrics.clone();
                            tokio::spawn(async move {
                                if let Err(e) = tcp::handle(
                                    stream,
                                    peer,
                                    port,
                                    registry,
                                    replay_guard,
                                    resolver,
                                    idle_timeout,
                                    tcp_conn_limit,
                                    metrics,
                                )
                                .await
                                {
                                    debug_log_relay_error(port, peer, &e);
                                }
                            });
                        }
                    }
                }
            })
        };

        let udp_task = {
            let registry = self.registry.clone();
            let replay_guard = self.replay_guard.clone();
            let resolver = self.resolver.clone();
            let idle_timeout = self.idle_timeout;
            let metrics = self.metrics.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = udp::handle(
                    udp_socket,
                    port,
                    registry,
                    replay_guard,
                    resolver,
                    idle_timeout,
                    cancel,
                    metrics,
                )
                .await
                {
                    error!(port, error = %e, "udp listener exited with error");
                }
            })
        };

        self.active.insert(
            port,
            PortListener {
                cancel,
                tcp_task,
                udp_task,
            },
        );
    }

    async fn close_port(&self, port: u16) {
        if let Some((_, listener)) = self.active.remove(&port) {
            listener.cancel.cancel();
            listener.tcp_task.abort();
            let _ = listener.udp_task.await;
            info!(port, "shadowsocks port closed");
        }
    }

    /// Tears down every currently-open port. Called once during graceful
    /// shutdown.
    pub async fn shutdown(&self) {
        let ports: Vec<u16> = self.active.iter().map(|e| *e.key()).collect();
        for port in ports {
            self.close_port(port).await;
        }
    }
}

fn debug_log_relay_error(port: u16, peer: std::net::SocketAddr, err: &crate::error::Error) {
    tracing::debug!(port, %peer, error = %err, "tcp relay connection ended");
}
