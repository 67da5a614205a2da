use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

use crate::addr::Address;
use crate::cipher_manager::{decrypt_with, encrypt_with, CipherManager};
use crate::dns::DnsResolver;
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::registry::UserRegistry;
use crate::replay::ReplayGuard;

const DIAL_TIMEOUT: Duration = Duration::from_secs(5);
const INIT_READ_SIZE: usize = 16 * 1024;

/// Drives one inbound TCP connection through
/// `INIT -> CONNECT -> STREAM -> DESTROY/ERROR`. Returns once the
/// connection is fully torn down; accounting (`tcp_conn_num`) has already
/// been decremented by the time this returns.
pub async fn handle(
    mut inbound: TcpStream,
    peer: SocketAddr,
    port: u16,
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    resolver: Arc<dyn DnsResolver>,
    idle_timeout: Duration,
    tcp_conn_limit: u32,
    metrics: Arc<dyn MetricsSink>,
) -> Result<()> {
    let mut cipher = CipherManager::new(registry.clone(), replay_guard, metrics.clone(), port);
    let mut buf = vec![0u8; INIT_READ_SIZE];

    // INIT: accumulate until find-access-user completes and the address
    // header has been fully parsed.
    let (dest, mut initial_payload) = loop {
        let n = match timeout(idle_timeout, inbound.read(&mut buf)).await {
            Ok(Ok(0)) => return Ok(()), // peer closed before completing the handshake
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Io(e)),
            Err(_) => return Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "idle timeout during handshake",
            ))),
        };
        let plain = cipher.on_tcp_data(&buf[..n], peer.ip())?;
        if plain.is_empty() {
            continue;
        }
        match Address::parse_header(&plain) {
            Ok((addr, hdr_len)) => break (addr, plain[hdr_len..].to_vec()),
            // `on_tcp_data` above has already bound the cipher to a user and
            // bumped tcp_conn_num; undo that before bailing out.
            Err(e) => {
                if let Some(u) = cipher.bound_user() {
                    registry.incr_tcp(u.user_id, -1);
                    metrics.observe_connection_closed(port);
                }
                return Err(e);
            }
        }
    };

    // CONNECT: resolve and dial with a hard 5s timeout. The cipher is bound
    // by this point, so every early return below must undo that increment.
    let bound = cipher
        .bound_user()
        .expect("INIT only completes once the cipher manager is bound");
    let user_id = bound.user_id;

    // Soft cap: reject once this user is already at/over its concurrent
    // TCP connection limit. `bind()` has already counted this connection,
    // so the live count includes it.
    let live = bound.tcp_conn_num.load(std::sync::atomic::Ordering::Relaxed);
    if live > tcp_conn_limit as i64 {
        registry.incr_tcp(user_id, -1);
        metrics.observe_connection_closed(port);
        return Err(Error::ConnLimit {
            user_id,
            limit: tcp_conn_limit,
        });
    }

    let dest_addr = match dest.resolve(resolver.as_ref()).await {
        Ok(a) => a,
        Err(e) => {
            registry.incr_tcp(user_id, -1);
            metrics.observe_connection_closed(port);
            return Err(e);
        }
    };
    let outbound = match timeout(DIAL_TIMEOUT, TcpStream::connect(dest_addr)).await {
        Ok(Ok(sock)) => sock,
        Ok(Err(e)) => {
            registry.incr_tcp(user_id, -1);
            metrics.observe_connection_closed(port);
            return Err(Error::Dial(format!("connect to {dest_addr}: {e}")));
        }
        Err(_) => {
            registry.incr_tcp(user_id, -1);
            metrics.observe_connection_closed(port);
            return Err(Error::Dial(format!("connect to {dest_addr} timed out")));
        }
    };
    debug!(%peer, %dest_addr, "shadowsocks tcp connected");

    let (method, user, decryptor) = cipher
        .into_bound()
        .expect("INIT only completes once the cipher manager is bound");
    debug_assert_eq!(user.user_id, user_id);

    let (mut in_read, mut in_write) = inbound.into_split();
    let (mut out_read, mut out_write) = outbound.into_split();

    if !initial_payload.is_empty() {
        if let Err(e) = out_write.write_all(&initial_payload).await {
            registry.incr_tcp(user_id, -1);
            metrics.observe_connection_closed(port);
            return Err(Error::Io(e));
        }
        registry.record_traffic(user_id, initial_payload.len() as u64, 0);
        initial_payload.clear();
    }

    // STREAM: two independent directions, each its own task so inbound
    // decrypt state and outbound encrypt state never contend for a lock.
    let up_registry = registry.clone();
    let up_metrics = metrics.clone();
    let mut up_decryptor = decryptor;
    let mut up_task = tokio::spawn(async move {
        let mut buf = vec![0u8; INIT_READ_SIZE];
        loop {
            let n = match timeout(idle_timeout, in_read.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
            };
            let start = Instant::now();
            let plain = match decrypt_with(method, &mut up_decryptor, &buf[..n]) {
                Ok(p) => p,
                Err(_) => break,
            };
            up_metrics.observe_cipher_latency("decrypt", start.elapsed().as_nanos() as u64);
            if plain.is_empty() {
                continue;
            }
            if out_write.write_all(&plain).await.is_err() {
                break;
            }
            up_registry.record_traffic(user_id, plain.len() as u64, 0);
        }
        let _ = out_write.shutdown().await;
    });

    let down_registry = registry.clone();
    let down_metrics = metrics.clone();
    let down_user = user;
    let mut down_task = tokio::spawn(async move {
        let mut encryptor = None;
        let mut buf = vec![0u8; INIT_READ_SIZE];
        loop {
            let n = match timeout(idle_timeout, out_read.read(&mut buf)).await {
                Ok(Ok(0)) | Err(_) => break,
                Ok(Ok(n)) => n,
                Ok(Err(_)) => break,
            };
            let start = Instant::now();
            let cipher_bytes = match encrypt_with(method, &down_user, &mut encryptor, &buf[..n]) {
                Ok(c) => c,
                Err(_) => break,
            };
            down_metrics.observe_cipher_latency("encrypt", start.elapsed().as_nanos() as u64);
            if in_write.write_all(&cipher_bytes).await.is_err() {
                break;
            }
            down_registry.record_traffic(user_id, 0, n as u64);
        }
        let _ = in_write.shutdown().await;
    });

    // Whichever direction ends first (EOF, error, or idle timeout) drives
    // teardown of the other: each loop already shuts down its write half
    // before returning, but we also abort the still-running task rather
    // than waiting on the remote end to notice the half-close.
    tokio::select! {
        _ = &mut up_task => { down_task.abort(); }
        _ = &mut down_task => { up_task.abort(); }
    }

    registry.incr_tcp(user_id, -1);
    metrics.observe_connection_closed(port);
    Ok(())
}
