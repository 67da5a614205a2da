//! End-to-end tests against the live relay stack: real `TcpListener`s and
//! `UdpSocket`s opened by `ProxyManager`, a hand-rolled Shadowsocks client
//! using the crate's own cipher primitives, and a real echo server on the
//! other side.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};

use ssmgr::addr::Address;
use ssmgr::cipher::aead::{StreamDecryptor, StreamEncryptor};
use ssmgr::cipher::kdf::{derive_subkey, evp_bytes_to_key};
use ssmgr::cipher::udp as udp_cipher;
use ssmgr::cipher::Method;
use ssmgr::dns::SystemResolver;
use ssmgr::metrics::NoopMetrics;
use ssmgr::proxy_manager::ProxyManager;
use ssmgr::registry::{UserRecord, UserRegistry};
use ssmgr::replay::ReplayGuard;

async fn free_port() -> u16 {
    let l = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = l.local_addr().unwrap().port();
    drop(l);
    port
}

async fn start_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let (mut stream, _) = match listener.accept().await {
                Ok(s) => s,
                Err(_) => break,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    let n = match stream.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => n,
                    };
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
            });
        }
    });
    addr
}

fn user_record(id: i64, port: u16, method: &str, password: &str) -> UserRecord {
    UserRecord {
        user_id: id,
        port,
        method: method.to_string(),
        password: password.to_string(),
        enable: true,
    }
}

fn new_proxy_manager(registry: Arc<UserRegistry>, replay_guard: Arc<ReplayGuard>) -> Arc<ProxyManager> {
    Arc::new(ProxyManager::new(
        "127.0.0.1".to_string(),
        registry,
        replay_guard,
        Arc::new(SystemResolver),
        Duration::from_secs(30),
        60,
        Arc::new(NoopMetrics),
    ))
}

/// Builds the raw bytes of one client-initiated Shadowsocks TCP connection:
/// `salt || AEAD(header || payload)`, chunked per `StreamEncryptor`.
fn client_first_frame(method: Method, password: &str, dest: &Address, payload: &[u8]) -> Vec<u8> {
    let master = evp_bytes_to_key(password.as_bytes(), method.key_len());
    let mut salt = vec![0u8; method.salt_len()];
    rand::thread_rng().fill_bytes(&mut salt);
    let subkey = derive_subkey(&master, &salt, method.key_len()).unwrap();
    let mut enc = StreamEncryptor::new(method, subkey);

    let mut plaintext = dest.encode_header();
    plaintext.extend_from_slice(payload);

    let mut out = salt;
    out.extend(enc.encrypt(&plaintext).unwrap());
    out
}

/// Reads and decrypts the server's reply stream until `want_len` plaintext
/// bytes have been recovered.
async fn read_and_decrypt_reply(
    stream: &mut TcpStream,
    method: Method,
    password: &str,
    want_len: usize,
) -> Vec<u8> {
    let master = evp_bytes_to_key(password.as_bytes(), method.key_len());
    let salt_len = method.salt_len();

    let mut salt = vec![0u8; salt_len];
    stream.read_exact(&mut salt).await.unwrap();
    let subkey = derive_subkey(&master, &salt, method.key_len()).unwrap();
    let mut dec = StreamDecryptor::new(method, subkey);

    let mut plain = Vec::new();
    let mut buf = [0u8; 4096];
    while plain.len() < want_len {
        let n = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("reply read timed out")
            .unwrap();
        if n == 0 {
            break;
        }
        plain.extend_from_slice(&dec.decrypt(&buf[..n]).unwrap());
    }
    plain
}

#[tokio::test]
async fn unique_port_aead_tcp_relay() {
    let echo_addr = start_echo_server().await;
    let port = free_port().await;

    let registry = Arc::new(UserRegistry::new());
    registry
        .upsert(user_record(1, port, "aes-256-gcm", "correct horse battery staple"))
        .unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry.clone(), replay_guard);
    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dest = Address::Ip(echo_addr);
    let payload = b"hello through the relay";
    let frame = client_first_frame(Method::Aes256Gcm, "correct horse battery staple", &dest, payload);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&frame).await.unwrap();

    let echoed = read_and_decrypt_reply(
        &mut stream,
        Method::Aes256Gcm,
        "correct horse battery staple",
        payload.len(),
    )
    .await;
    assert_eq!(echoed, payload);

    // the connection is torn down once the TCP stream closes; tcp_conn_num
    // must settle back to zero, not leak.
    drop(stream);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(
        registry.get(1).unwrap().tcp_conn_num.load(std::sync::atomic::Ordering::Relaxed),
        0
    );

    proxy_manager.shutdown().await;
}

#[tokio::test]
async fn shared_port_identification_promotes_access_order() {
    let echo_addr = start_echo_server().await;
    let port = free_port().await;

    let registry = Arc::new(UserRegistry::new());
    registry.upsert(user_record(1, port, "aes-128-gcm", "pw-a")).unwrap();
    registry.upsert(user_record(2, port, "aes-128-gcm", "pw-b")).unwrap();
    registry.upsert(user_record(3, port, "aes-128-gcm", "pw-c")).unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry.clone(), replay_guard);
    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dest = Address::Ip(echo_addr);
    let payload = b"attributed to user 2";
    let frame = client_first_frame(Method::Aes128Gcm, "pw-b", &dest, payload);

    let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    stream.write_all(&frame).await.unwrap();
    let echoed = read_and_decrypt_reply(&mut stream, Method::Aes128Gcm, "pw-b", payload.len()).await;
    assert_eq!(echoed, payload);

    let ordered = registry.list_by_port(port);
    assert_eq!(ordered[0].user_id, 2, "user 2 should now rank first by access_order");

    proxy_manager.shutdown().await;
}

#[tokio::test]
async fn replayed_first_frame_is_rejected() {
    let echo_addr = start_echo_server().await;
    let port = free_port().await;

    let registry = Arc::new(UserRegistry::new());
    registry.upsert(user_record(1, port, "aes-256-gcm", "pw")).unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry, replay_guard);
    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let dest = Address::Ip(echo_addr);
    let frame = client_first_frame(Method::Aes256Gcm, "pw", &dest, b"first");

    let mut first = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    first.write_all(&frame).await.unwrap();
    let _ = read_and_decrypt_reply(&mut first, Method::Aes256Gcm, "pw", 5).await;
    drop(first);

    // Resending the exact same salt+ciphertext bytes on a fresh connection
    // must be rejected by the replay guard; the server closes without
    // ever echoing anything back.
    let mut replay = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    replay.write_all(&frame).await.unwrap();
    let mut buf = [0u8; 16];
    let n = tokio::time::timeout(Duration::from_secs(2), replay.read(&mut buf))
        .await
        .expect("server should close promptly on a replayed frame")
        .unwrap();
    assert_eq!(n, 0, "replayed connection must be closed without a reply");

    proxy_manager.shutdown().await;
}

#[tokio::test]
async fn udp_roundtrip_through_proxy_manager() {
    let port = free_port().await;

    // a UDP echo server standing in for the resolved remote
    let remote = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let remote_addr = remote.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 2048];
        loop {
            let (n, from) = match remote.recv_from(&mut buf).await {
                Ok(v) => v,
                Err(_) => break,
            };
            let _ = remote.send_to(&buf[..n], from).await;
        }
    });

    let registry = Arc::new(UserRegistry::new());
    registry
        .upsert(user_record(1, port, "chacha20-ietf-poly1305", "udp pw"))
        .unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry, replay_guard);
    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;

    let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let master = evp_bytes_to_key(b"udp pw", Method::ChaCha20IetfPoly1305.key_len());

    let mut plaintext = Address::Ip(remote_addr).encode_header();
    plaintext.extend_from_slice(b"dns-ish query");
    let datagram = udp_cipher::pack(Method::ChaCha20IetfPoly1305, &master, &plaintext).unwrap();
    client.send_to(&datagram, ("127.0.0.1", port)).await.unwrap();

    let mut buf = [0u8; 2048];
    let (n, _) = tokio::time::timeout(Duration::from_secs(5), client.recv_from(&mut buf))
        .await
        .expect("udp reply timed out")
        .unwrap();
    let reply_plain = udp_cipher::unpack(Method::ChaCha20IetfPoly1305, &master, &buf[..n]).unwrap();

    // the reply envelope is ATYP||addr||port||payload, addr is the origin
    // (the simulated remote), payload is whatever it echoed back.
    let (origin, hdr_len) = Address::parse_header(&reply_plain).unwrap();
    assert_eq!(origin, Address::Ip(remote_addr));
    assert_eq!(&reply_plain[hdr_len..], b"dns-ish query");

    proxy_manager.shutdown().await;
}

#[tokio::test]
async fn reconcile_closes_port_once_its_last_user_is_disabled() {
    let port = free_port().await;
    let registry = Arc::new(UserRegistry::new());
    registry.upsert(user_record(1, port, "aes-128-gcm", "pw")).unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry.clone(), replay_guard);

    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", port)).await.is_ok());

    // disabling the sole user on the port should make it disappear from
    // enabled_ports, and reconcile should close the listener.
    registry
        .upsert(user_record(1, port, "aes-128-gcm", "pw"))
        .unwrap();
    let mut disabled = user_record(1, port, "aes-128-gcm", "pw");
    disabled.enable = false;
    registry.upsert(disabled).unwrap();

    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(
        TcpStream::connect(("127.0.0.1", port)).await.is_err(),
        "port should be closed once no enabled user references it"
    );

    proxy_manager.shutdown().await;
}

#[tokio::test]
async fn shutdown_tears_down_every_open_listener() {
    let port_a = free_port().await;
    let port_b = free_port().await;
    let registry = Arc::new(UserRegistry::new());
    registry.upsert(user_record(1, port_a, "aes-128-gcm", "pw-a")).unwrap();
    registry.upsert(user_record(2, port_b, "aes-128-gcm", "pw-b")).unwrap();
    let replay_guard = Arc::new(ReplayGuard::new());
    let proxy_manager = new_proxy_manager(registry, replay_guard);

    proxy_manager.reconcile().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_ok());
    assert!(TcpStream::connect(("127.0.0.1", port_b)).await.is_ok());

    proxy_manager.shutdown().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(TcpStream::connect(("127.0.0.1", port_a)).await.is_err());
    assert!(TcpStream::connect(("127.0.0.1", port_b)).await.is_err());
}
