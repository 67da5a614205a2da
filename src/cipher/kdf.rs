use hkdf::Hkdf;
use md5::{Digest, Md5};
use sha1::Sha1;

use crate::error::{Error, Result};

const SUBKEY_INFO: &[u8] = b"ss-subkey";

/// OpenSSL's `EVP_BytesToKey` with no salt and iteration count 1: block 0 is
/// `MD5(password)`, block i is `MD5(block[i-1] || password)`, concatenated
/// and truncated to `key_len`.
pub fn evp_bytes_to_key(password: &[u8], key_len: usize) -> Vec<u8> {
    let mut key = Vec::with_capacity(key_len + Md5::output_size());
    let mut prev: Vec<u8> = Vec::new();
    while key.len() < key_len {
        let mut hasher = Md5::new();
        hasher.update(&prev);
        hasher.update(password);
        let block = hasher.finalize();
        key.extend_from_slice(&block);
        prev = block.to_vec();
    }
    key.truncate(key_len);
    key
}

/// HKDF-SHA1 subkey derivation, info = `ss-subkey`.
pub fn derive_subkey(master_key: &[u8], salt: &[u8], key_len: usize) -> Result<Vec<u8>> {
    let hk = Hkdf::<Sha1>::new(Some(salt), master_key);
    let mut subkey = vec![0u8; key_len];
    hk.expand(SUBKEY_INFO, &mut subkey)
        .map_err(|e| Error::Cipher(format!("HKDF expand failed: {e}")))?;
    Ok(subkey)
}
