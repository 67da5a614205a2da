use std::cell::Cell;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Instant;

use rand::RngCore;

use crate::cipher::aead::{DirectionState, StreamDecryptor, StreamEncryptor};
use crate::cipher::kdf::{derive_subkey, evp_bytes_to_key};
use crate::cipher::{udp, Method};
use crate::error::{Error, Result};
use crate::metrics::MetricsSink;
use crate::registry::{User, UserRegistry};
use crate::replay::ReplayGuard;

/// Binds one inbound TCP connection (or UDP peer) to a user, performing
/// find-access-user on the first frame when the port is shared. A
/// unique-owner port degenerates to a one-candidate scan of the same code
/// path, so there is no separate "eager" branch.
pub struct CipherManager {
    registry: Arc<UserRegistry>,
    replay_guard: Arc<ReplayGuard>,
    metrics: Arc<dyn MetricsSink>,
    port: u16,
    user: Option<Arc<User>>,
    method: Option<Method>,
    decryptor: Option<StreamDecryptor>,
    encryptor: Option<StreamEncryptor>,
    pending: Vec<u8>,
    closed: Cell<bool>,
}

impl CipherManager {
    pub fn new(
        registry: Arc<UserRegistry>,
        replay_guard: Arc<ReplayGuard>,
        metrics: Arc<dyn MetricsSink>,
        port: u16,
    ) -> Self {
        Self {
            registry,
            replay_guard,
            metrics,
            port,
            user: None,
            method: None,
            decryptor: None,
            encryptor: None,
            pending: Vec::new(),
            closed: Cell::new(false),
        }
    }

    pub fn bound_user(&self) -> Option<Arc<User>> {
        self.user.clone()
    }

    /// Feeds inbound ciphertext. Before the access user is identified this
    /// buffers until there is enough to attempt the first frame; once
    /// bound it streams straight through the persistent decryptor.
    pub fn on_tcp_data(&mut self, data: &[u8], peer_ip: IpAddr) -> Result<Vec<u8>> {
        if self.user.is_none() {
            self.pending.extend_from_slice(data);
            self.try_bind(peer_ip, true)?;
            if self.user.is_none() {
                return Ok(Vec::new());
            }
            let rest = std::mem::take(&mut self.pending);
            return self.decrypt_bound(&rest);
        }
        self.decrypt_bound(data)
    }

    fn decrypt_bound(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let method = self.method.expect("bound connection has a method");
        if !method.is_aead() {
            return Ok(crate::cipher::stream_none::decrypt(data));
        }
        let start = Instant::now();
        let out = self
            .decryptor
            .as_mut()
            .expect("bound connection has a decryptor")
            .decrypt(data);
        self.metrics
            .observe_cipher_latency("decrypt", start.elapsed().as_nanos() as u64);
        out
    }

    /// Attempts to identify the access user from `self.pending`. Leaves
    /// `self.user` unset (and returns `Ok(())`) if more bytes are needed.
    fn try_bind(&mut self, peer_ip: IpAddr, is_tcp: bool) -> Result<()> {
        // Disabled users stay in the candidate set for trial-decryption:
        // they must still be identified (and then rejected with
        // `UserDisabled`) rather than folded into the generic
        // "no matching user" bucket a wrong password produces.
        let candidates: Vec<Arc<User>> = self.registry.list_by_port(self.port);
        if candidates.is_empty() {
            return Err(Error::NoMatchingUser(self.port));
        }
        let method = candidates[0].method();

        if !method.is_aead() {
            // "none" only makes sense with a single owner: there is no
            // secret to trial-decrypt against.
            let user = candidates.into_iter().next().unwrap();
            if !user.enabled() {
                return Err(Error::UserDisabled(user.user_id));
            }
            self.bind(user, method, peer_ip, is_tcp, None);
            return Ok(());
        }

        let first_len = method.first_data_len();
        if self.pending.len() < first_len {
            return Ok(());
        }

        let salt = self.pending[..method.salt_len()].to_vec();
        if self.replay_guard.contains(&salt) {
            return Err(Error::Replayed);
        }
        self.replay_guard.add(&salt);

        let len_frame = &self.pending[method.salt_len()..first_len];
        for candidate in candidates {
            let master = evp_bytes_to_key(candidate.password().as_bytes(), method.key_len());
            let subkey = match derive_subkey(&master, &salt, method.key_len()) {
                Ok(k) => k,
                Err(_) => continue,
            };
            let mut trial = DirectionState::new(method, subkey.clone());
            if trial.open(len_frame).is_ok() {
                if !candidate.enabled() {
                    return Err(Error::UserDisabled(candidate.user_id));
                }
                self.bind(candidate, method, peer_ip, is_tcp, Some(subkey));
                return Ok(());
            }
        }
        Err(Error::NoMatchingUser(self.port))
    }

    fn bind(
        &mut self,
        user: Arc<User>,
        method: Method,
        peer_ip: IpAddr,
        is_tcp: bool,
        subkey: Option<Vec<u8>>,
    ) {
        self.registry.promote_access_order(self.port, user.user_id);
        self.registry.record_ip(user.user_id, peer_ip);
        if is_tcp {
            self.registry.incr_tcp(user.user_id, 1);
            self.metrics.observe_connection_opened(self.port);
        }
        if let Some(subkey) = subkey {
            self.decryptor = Some(StreamDecryptor::new(method, subkey));
        }
        self.method = Some(method);
        self.user = Some(user);
    }

    /// Encrypts plaintext for the outbound direction. The first call (for
    /// AEAD methods) generates a fresh salt and prepends it; subsequent
    /// calls stream through the same persistent encryptor.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let user = self
            .user
            .clone()
            .ok_or_else(|| Error::Cipher("cipher manager not yet bound".to_string()))?;
        let method = self.method.expect("bound connection has a method");
        encrypt_with(method, &user, &mut self.encryptor, plaintext)
    }

    /// Idempotent: decrements the user's live TCP count at most once.
    pub fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        if let Some(user) = &self.user {
            self.registry.incr_tcp(user.user_id, -1);
            self.metrics.observe_connection_closed(self.port);
        }
    }

    /// Consumes a bound manager into its pieces so the relay layer can run
    /// the two directions as independent tasks: the method, the bound
    /// user (for traffic accounting and the encrypt-side password), and
    /// the decryptor (if any — `none` has no persistent state).
    pub fn into_bound(self) -> Option<(Method, Arc<User>, Option<StreamDecryptor>)> {
        let method = self.method?;
        let user = self.user?;
        Some((method, user, self.decryptor))
    }
}

/// Decrypts one chunk through a possibly-not-yet-existing decryptor state
/// (only "none" has no decryptor at all; AEAD always has one once bound).
pub fn decrypt_with(
    method: Method,
    decryptor: &mut Option<StreamDecryptor>,
    data: &[u8],
) -> Result<Vec<u8>> {
    if !method.is_aead() {
        return Ok(crate::cipher::stream_none::decrypt(data));
    }
    decryptor
        .as_mut()
        .expect("AEAD connection has a decryptor once bound")
        .decrypt(data)
}

/// Encrypts one chunk, lazily creating the persistent encryptor (with a
/// fresh salt) on first use.
pub fn encrypt_with(
    method: Method,
    user: &User,
    encryptor: &mut Option<StreamEncryptor>,
    plaintext: &[u8],
) -> Result<Vec<u8>> {
    if !method.is_aead() {
        return Ok(crate::cipher::stream_none::encrypt(plaintext));
    }

    if encryptor.is_none() {
        let master = evp_bytes_to_key(user.password().as_bytes(), method.key_len());
        let mut salt = vec![0u8; method.salt_len()];
        rand::thread_rng().fill_bytes(&mut salt);
        let subkey = derive_subkey(&master, &salt, method.key_len())?;
        let mut enc = StreamEncryptor::new(method, subkey);
        let mut out = salt;
        out.extend(enc.encrypt(plaintext)?);
        *encryptor = Some(enc);
        return Ok(out);
    }

    encryptor.as_mut().unwrap().encrypt(plaintext)
}

/// One-shot UDP identification: tries each port candidate's master key
/// against the datagram until one verifies, promoting `access_order` and
/// recording accounting exactly as the TCP path does (minus the
/// persistent connection count, which UDP does not keep).
pub fn identify_udp(
    registry: &UserRegistry,
    replay_guard: &ReplayGuard,
    port: u16,
    peer_ip: IpAddr,
    datagram: &[u8],
) -> Result<(Arc<User>, Vec<u8>)> {
    let candidates: Vec<Arc<User>> = registry.list_by_port(port);
    if candidates.is_empty() {
        return Err(Error::NoMatchingUser(port));
    }
    let method = candidates[0].method();

    if !method.is_aead() {
        let user = candidates.into_iter().next().unwrap();
        if !user.enabled() {
            return Err(Error::UserDisabled(user.user_id));
        }
        registry.promote_access_order(port, user.user_id);
        registry.record_ip(user.user_id, peer_ip);
        let plain = crate::cipher::stream_none::decrypt(datagram);
        return Ok((user, plain));
    }

    if datagram.len() < method.salt_len() + method.tag_len() {
        return Err(Error::Cipher("datagram shorter than salt+tag".to_string()));
    }
    let salt = &datagram[..method.salt_len()];
    if replay_guard.contains(salt) {
        return Err(Error::Replayed);
    }
    replay_guard.add(salt);

    for candidate in candidates {
        let master = evp_bytes_to_key(candidate.password().as_bytes(), method.key_len());
        match udp::unpack(method, &master, datagram) {
            Ok(plain) => {
                if !candidate.enabled() {
                    return Err(Error::UserDisabled(candidate.user_id));
                }
                registry.promote_access_order(port, candidate.user_id);
                registry.record_ip(candidate.user_id, peer_ip);
                return Ok((candidate, plain));
            }
            Err(_) => continue,
        }
    }
    Err(Error::NoMatchingUser(port))
}

pub fn encrypt_udp_reply(user: &User, plaintext: &[u8]) -> Result<Vec<u8>> {
    let method = user.method();
    let master = evp_bytes_to_key(user.password().as_bytes(), method.key_len());
    udp::pack(method, &master, plaintext)
}

/// Which framing `find_access_user` should expect `first_data` in: UDP's
/// one-shot `salt||ciphertext||tag`, or TCP's chunked `salt||len-frame`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Tcp,
    Udp,
}

/// The control-plane `FindAccessUser(port, method, transport, first_data)`
/// operation from the RPC surface: identifies the access user from a raw
/// first frame without opening a real connection. Has the same side
/// effects as the live relay path (replay-guard insertion, access_order
/// promotion) since it performs the same trial-decryption.
pub fn find_access_user(
    registry: &UserRegistry,
    replay_guard: &ReplayGuard,
    port: u16,
    transport: Transport,
    first_data: &[u8],
) -> Result<Arc<User>> {
    match transport {
        Transport::Udp => {
            // No real peer is involved in a control-plane probe; record_ip
            // is skipped rather than attributing an address to nobody.
            let candidates: Vec<Arc<User>> = registry.list_by_port(port);
            if candidates.is_empty() {
                return Err(Error::NoMatchingUser(port));
            }
            let method = candidates[0].method();
            if !method.is_aead() {
                let user = candidates.into_iter().next().unwrap();
                if !user.enabled() {
                    return Err(Error::UserDisabled(user.user_id));
                }
                registry.promote_access_order(port, user.user_id);
                return Ok(user);
            }
            if first_data.len() < method.salt_len() + method.tag_len() {
                return Err(Error::Cipher("datagram shorter than salt+tag".to_string()));
            }
            let salt = &first_data[..method.salt_len()];
            if replay_guard.contains(salt) {
                return Err(Error::Replayed);
            }
            replay_guard.add(salt);
            for candidate in candidates {
                let master = evp_bytes_to_key(candidate.password().as_bytes(), method.key_len());
                if udp::unpack(method, &master, first_data).is_ok() {
                    if !candidate.enabled() {
                        return Err(Error::UserDisabled(candidate.user_id));
                    }
                    registry.promote_access_order(port, candidate.user_id);
                    return Ok(candidate);
                }
            }
            Err(Error::NoMatchingUser(port))
        }
        Transport::Tcp => {
            let candidates: Vec<Arc<User>> = registry.list_by_port(port);
            if candidates.is_empty() {
                return Err(Error::NoMatchingUser(port));
            }
            let method = candidates[0].method();
            if !method.is_aead() {
                let user = candidates.into_iter().next().unwrap();
                if !user.enabled() {
                    return Err(Error::UserDisabled(user.user_id));
                }
                registry.promote_access_order(port, user.user_id);
                return Ok(user);
            }
            let first_len = method.first_data_len();
            if first_data.len() < first_len {
                return Err(Error::Cipher("not enough bytes for trial decryption".to_string()));
            }
            let salt = &first_data[..method.salt_len()];
            if replay_guard.contains(salt) {
                return Err(Error::Replayed);
            }
            replay_guard.add(salt);
            let len_frame = &first_data[method.salt_len()..first_len];
            for candidate in candidates {
                let master = evp_bytes_to_key(candidate.password().as_bytes(), method.key_len());
                let subkey = match derive_subkey(&master, salt, method.key_len()) {
                    Ok(k) => k,
                    Err(_) => continue,
                };
                let mut trial = DirectionState::new(method, subkey);
                if trial.open(len_frame).is_ok() {
                    if !candidate.enabled() {
                        return Err(Error::UserDisabled(candidate.user_id));
                    }
                    registry.promote_access_order(port, candidate.user_id);
                    return Ok(candidate);
                }
            }
            Err(Error::NoMatchingUser(port))
        }
    }
}
