use rand::RngCore;

use crate::error::{Error, Result};

use super::aead::DirectionState;
use super::kdf::derive_subkey;
use super::Method;

/// Packs one UDP datagram: `salt || ciphertext || tag`, fresh random salt,
/// nonce all-zero (a single seal per datagram never reuses a nonce under a
/// given subkey because the subkey itself is fresh).
pub fn pack(method: Method, master_key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if !method.is_aead() {
        return Ok(plaintext.to_vec());
    }
    let mut salt = vec![0u8; method.salt_len()];
    rand::thread_rng().fill_bytes(&mut salt);
    let subkey = derive_subkey(master_key, &salt, method.key_len())?;
    let mut state = DirectionState::new(method, subkey);
    let sealed = state.seal(plaintext)?;

    let mut out = Vec::with_capacity(salt.len() + sealed.len());
    out.extend_from_slice(&salt);
    out.extend_from_slice(&sealed);
    Ok(out)
}

/// Unpacks one UDP datagram, deriving the subkey from the leading salt.
pub fn unpack(method: Method, master_key: &[u8], datagram: &[u8]) -> Result<Vec<u8>> {
    if !method.is_aead() {
        return Ok(datagram.to_vec());
    }
    let salt_len = method.salt_len();
    if datagram.len() < salt_len + method.tag_len() {
        return Err(Error::Cipher("datagram shorter than salt+tag".to_string()));
    }
    let (salt, sealed) = datagram.split_at(salt_len);
    let subkey = derive_subkey(master_key, salt, method.key_len())?;
    let mut state = DirectionState::new(method, subkey);
    state.open(sealed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::kdf::evp_bytes_to_key;

    #[test]
    fn udp_pack_unpack_roundtrip() {
        let master = evp_bytes_to_key(b"udp pw", Method::ChaCha20IetfPoly1305.key_len());
        let datagram = pack(Method::ChaCha20IetfPoly1305, &master, b"dns query bytes").unwrap();
        let plain = unpack(Method::ChaCha20IetfPoly1305, &master, &datagram).unwrap();
        assert_eq!(plain, b"dns query bytes");
    }

    #[test]
    fn udp_each_datagram_has_fresh_salt() {
        let master = evp_bytes_to_key(b"udp pw", Method::Aes128Gcm.key_len());
        let a = pack(Method::Aes128Gcm, &master, b"x").unwrap();
        let b = pack(Method::Aes128Gcm, &master, b"x").unwrap();
        assert_ne!(&a[..Method::Aes128Gcm.salt_len()], &b[..Method::Aes128Gcm.salt_len()]);
    }

    #[test]
    fn udp_unpack_too_short_fails() {
        let master = evp_bytes_to_key(b"udp pw", Method::Aes256Gcm.key_len());
        assert!(unpack(Method::Aes256Gcm, &master, &[0u8; 4]).is_err());
    }

    #[test]
    fn udp_none_is_identity() {
        let out = pack(Method::None, b"", b"raw").unwrap();
        assert_eq!(out, b"raw");
        assert_eq!(unpack(Method::None, b"", &out).unwrap(), b"raw");
    }
}
