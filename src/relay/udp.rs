use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::addr::Address;
use crate::cipher_manager::{encrypt_udp_reply, identify_udp};
use crate::dns::DnsResolver;
use crate::error::Result;
use crate::metrics::MetricsSink;
use crate::registry::{User, UserRegistry};
use crate::replay::ReplayGuard;

const MAX_DATAGRAM: usize = 64 * 1024;
const REAP_INTERVAL: Duration = Duration::from_secs(1);

/// One subhandler per distinct client peer on a shared inbound socket.
/// Shadowsocks UDP is request/reply, not connection-oriented, so "a
/// connection" here is really just an entry that outlives a single
/// datagram long enough to relay its reply and then its idle timeout.
struct UdpPeer {
    user: Arc<User>,
    outbound: Arc<UdpSocket>,
    last_used: AtomicU64,
    started: Instant,
}

impl UdpPeer {
    fn touch(&self) {
        self.last_used.store(
            self.started.elapsed().as_secs(),
            Ordering::Relaxed,
        );
    }

    fn idle_for(&self) -> Duration {
        let last = self.last_used.load(Ordering::Relaxed);
        self.started.elapsed().saturating_sub(Duration::from_secs(last))
    }
}

/// Drives one shared inbound UDP socket for `port`. Every inbound datagram
/// is identified independently (there is no persistent cipher state across
/// datagrams, unlike TCP's streaming frame format) and fanned out to a
/// per-peer outbound socket that is reaped once idle.
pub async fn handle(
    inbound: Arc<UdpSocket>,
    port: u16,
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    resolver: Arc<dyn DnsResolver>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) -> Result<()> {
    let peers: Arc<DashMap<SocketAddr, Arc<UdpPeer>>> = Arc::new(DashMap::new());

    let reaper = {
        let peers = peers.clone();
        let cancel = cancel.clone();
        let metrics = metrics.clone();
        tokio::spawn(async move {
            let mut ticker = interval(REAP_INTERVAL);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        peers.retain(|_, peer| {
                            let expired = peer.idle_for() >= idle_timeout;
                            if expired {
                                debug!(user_id = peer.user.user_id, port, "udp peer reaped");
                                metrics.observe_connection_closed(port);
                            }
                            !expired
                        });
                    }
                }
            }
        })
    };

    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (n, peer_addr) = tokio::select! {
            _ = cancel.cancelled() => break,
            res = inbound.recv_from(&mut buf) => match res {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(port, error = %e, "udp recv_from failed");
                    continue;
                }
            },
        };

        let identify_start = Instant::now();
        let (user, plain) = match identify_udp(&registry, &replay_guard, port, peer_addr.ip(), &buf[..n]) {
            Ok(pair) => pair,
            Err(e) => {
                debug!(port, %peer_addr, error = %e, "udp datagram rejected");
                continue;
            }
        };
        metrics.observe_cipher_latency("decrypt", identify_start.elapsed().as_nanos() as u64);

        let (dest, payload) = match Address::parse_header(&plain) {
            Ok((addr, hdr_len)) => (addr, plain[hdr_len..].to_vec()),
            Err(e) => {
                debug!(port, %peer_addr, error = %e, "udp header parse failed");
                continue;
            }
        };
        let dest_addr = match dest.resolve(resolver.as_ref()).await {
            Ok(a) => a,
            Err(e) => {
                debug!(port, %peer_addr, %dest, error = %e, "udp destination resolve failed");
                continue;
            }
        };

        registry.record_traffic(user.user_id, payload.len() as u64, 0);

        let peer_state = match peers.get(&peer_addr) {
            Some(existing) => existing.clone(),
            None => {
                // Unconnected: this socket will accept replies from any
                // source address, not just `dest_addr`.
                let socket = match UdpSocket::bind("0.0.0.0:0").await {
                    Ok(s) => Arc::new(s),
                    Err(e) => {
                        warn!(port, error = %e, "failed to bind outbound udp socket");
                        continue;
                    }
                };
                let state = Arc::new(UdpPeer {
                    user: user.clone(),
                    outbound: socket,
                    last_used: AtomicU64::new(0),
                    started: Instant::now(),
                });
                peers.insert(peer_addr, state.clone());
                metrics.observe_connection_opened(port);

                spawn_reply_pump(
                    state.clone(),
                    inbound.clone(),
                    peer_addr,
                    registry.clone(),
                    cancel.clone(),
                    metrics.clone(),
                );
                state
            }
        };
        peer_state.touch();

        if let Err(e) = peer_state.outbound.send_to(&payload, dest_addr).await {
            warn!(port, %dest_addr, error = %e, "udp send_to upstream failed");
        }
    }

    reaper.abort();
    Ok(())
}

/// One task per peer, reading upstream replies and re-encrypting them back
/// to the original client. Runs until the peer's outbound socket errors out
/// or the listener is cancelled; the reaper removes the peer map entry
/// independently once it has been idle past the timeout.
fn spawn_reply_pump(
    peer: Arc<UdpPeer>,
    inbound: Arc<UdpSocket>,
    client_addr: SocketAddr,
    registry: Arc<UserRegistry>,
    cancel: CancellationToken,
    metrics: Arc<dyn MetricsSink>,
) {
    tokio::spawn(async move {
        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let (n, from) = tokio::select! {
                _ = cancel.cancelled() => break,
                res = peer.outbound.recv_from(&mut buf) => match res {
                    Ok(pair) => pair,
                    Err(_) => break,
                },
            };
            peer.touch();

            let mut envelope = Address::Ip(from).encode_header();
            envelope.extend_from_slice(&buf[..n]);

            let encrypt_start = Instant::now();
            let packet = match encrypt_udp_reply(&peer.user, &envelope) {
                Ok(p) => p,
                Err(e) => {
                    warn!(error = %e, "udp reply encrypt failed");
                    continue;
                }
            };
            metrics.observe_cipher_latency("encrypt", encrypt_start.elapsed().as_nanos() as u64);

            registry.record_traffic(peer.user.user_id, 0, n as u64);

            if inbound.send_to(&packet, client_addr).await.is_err() {
                break;
            }
        }
    });
}
