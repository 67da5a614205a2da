use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use chacha20poly1305::ChaCha20Poly1305;

use crate::error::{Error, Result};

use super::{Method, MAX_PAYLOAD_SIZE};

/// One AEAD seal/open against a 12-byte nonce, dispatching over the three
/// supported methods. `buffer` holds the plaintext/ciphertext in place and
/// grows/shrinks by the tag length.
fn seal_in_place(method: Method, key: &[u8], nonce: &[u8; 12], buffer: &mut Vec<u8>) -> Result<()> {
    let tag = match method {
        Method::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher
                .encrypt_in_place_detached(nonce.into(), b"", buffer)
                .map_err(|e| Error::Cipher(format!("seal failed: {e}")))?
        }
        Method::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher
                .encrypt_in_place_detached(nonce.into(), b"", buffer)
                .map_err(|e| Error::Cipher(format!("seal failed: {e}")))?
        }
        Method::ChaCha20IetfPoly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher
                .encrypt_in_place_detached(nonce.into(), b"", buffer)
                .map_err(|e| Error::Cipher(format!("seal failed: {e}")))?
        }
        Method::None => return Ok(()),
    };
    buffer.extend_from_slice(&tag);
    Ok(())
}

fn open_in_place(method: Method, key: &[u8], nonce: &[u8; 12], buffer: &mut Vec<u8>) -> Result<()> {
    let tag_len = method.tag_len();
    if buffer.len() < tag_len {
        return Err(Error::Cipher("ciphertext shorter than tag".to_string()));
    }
    let split_at = buffer.len() - tag_len;
    let tag_bytes = buffer.split_off(split_at);

    let result = match method {
        Method::Aes128Gcm => {
            let cipher = Aes128Gcm::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher.decrypt_in_place_detached(nonce.into(), b"", buffer, (&tag_bytes[..]).into())
        }
        Method::Aes256Gcm => {
            let cipher = Aes256Gcm::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher.decrypt_in_place_detached(nonce.into(), b"", buffer, (&tag_bytes[..]).into())
        }
        Method::ChaCha20IetfPoly1305 => {
            let cipher = ChaCha20Poly1305::new_from_slice(key)
                .map_err(|e| Error::Cipher(format!("bad key: {e}")))?;
            cipher.decrypt_in_place_detached(nonce.into(), b"", buffer, (&tag_bytes[..]).into())
        }
        Method::None => return Ok(()),
    };
    result.map_err(|_| Error::Cipher("AEAD tag mismatch".to_string()))
}

/// Turns a little-endian u64 counter into a 12-byte nonce (the remaining 4
/// bytes are zero, matching the Shadowsocks AEAD nonce convention).
fn nonce_bytes(counter: u64) -> [u8; 12] {
    let mut n = [0u8; 12];
    n[..8].copy_from_slice(&counter.to_le_bytes());
    n
}

/// One direction's persistent AEAD state: a subkey and a monotonically
/// incrementing nonce counter, shared between the length sub-chunk and the
/// payload sub-chunk of every frame.
pub struct DirectionState {
    method: Method,
    key: Vec<u8>,
    counter: u64,
}

impl DirectionState {
    pub fn new(method: Method, key: Vec<u8>) -> Self {
        Self {
            method,
            key,
            counter: 0,
        }
    }

    fn next_nonce(&mut self) -> [u8; 12] {
        let n = nonce_bytes(self.counter);
        self.counter = self.counter.wrapping_add(1);
        n
    }

    pub(crate) fn seal(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = plaintext.to_vec();
        let nonce = self.next_nonce();
        seal_in_place(self.method, &self.key, &nonce, &mut buf)?;
        Ok(buf)
    }

    pub(crate) fn open(&mut self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = ciphertext.to_vec();
        let nonce = self.next_nonce();
        open_in_place(self.method, &self.key, &nonce, &mut buf)?;
        Ok(buf)
    }
}

/// Encrypts plaintext into the chunked AEAD TCP stream format:
/// `[len][len-tag][payload][payload-tag]` per chunk, splitting payloads
/// larger than `MAX_PAYLOAD_SIZE` across multiple chunks.
pub struct StreamEncryptor {
    state: DirectionState,
}

impl StreamEncryptor {
    pub fn new(method: Method, subkey: Vec<u8>) -> Self {
        Self {
            state: DirectionState::new(method, subkey),
        }
    }

    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        for chunk in plaintext.chunks(MAX_PAYLOAD_SIZE) {
            let len_bytes = (chunk.len() as u16).to_be_bytes();
            out.extend_from_slice(&self.state.seal(&len_bytes)?);
            out.extend_from_slice(&self.state.seal(chunk)?);
        }
        Ok(out)
    }
}

enum ReadState {
    Length,
    Payload(usize),
}

/// Decrypts the chunked AEAD TCP stream format. Stateful and tolerant of
/// arbitrary byte boundaries: feed it however many bytes arrived and it
/// returns whatever complete chunks it could assemble, buffering the rest.
pub struct StreamDecryptor {
    state: DirectionState,
    buf: Vec<u8>,
    read_state: ReadState,
    tag_len: usize,
}

impl StreamDecryptor {
    pub fn new(method: Method, subkey: Vec<u8>) -> Self {
        Self {
            tag_len: method.tag_len(),
            state: DirectionState::new(method, subkey),
            buf: Vec::new(),
            read_state: ReadState::Length,
        }
    }

    pub fn decrypt(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        self.buf.extend_from_slice(data);
        let mut out = Vec::new();
        loop {
            match self.read_state {
                ReadState::Length => {
                    let need = 2 + self.tag_len;
                    if self.buf.len() < need {
                        break;
                    }
                    let frame: Vec<u8> = self.buf.drain(..need).collect();
                    let plain = self.state.open(&frame)?;
                    let len = u16::from_be_bytes([plain[0], plain[1]]) as usize;
                    if len > MAX_PAYLOAD_SIZE {
                        return Err(Error::Cipher(format!(
                            "chunk length {len} exceeds maximum {MAX_PAYLOAD_SIZE}"
                        )));
                    }
                    self.read_state = ReadState::Payload(len);
                }
                ReadState::Payload(len) => {
                    let need = len + self.tag_len;
                    if self.buf.len() < need {
                        break;
                    }
                    let frame: Vec<u8> = self.buf.drain(..need).collect();
                    let plain = self.state.open(&frame)?;
                    out.extend_from_slice(&plain);
                    self.read_state = ReadState::Length;
                }
            }
        }
        Ok(out)
    }
}
