pub mod aead;
pub mod kdf;
pub mod stream_none;
pub mod udp;

use crate::error::{Error, Result};

/// The maximum plaintext length of a single AEAD TCP chunk.
pub const MAX_PAYLOAD_SIZE: usize = 0x3FFF;

/// Cipher method identifiers from the Shadowsocks legacy AEAD suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    None,
    Aes128Gcm,
    Aes256Gcm,
    ChaCha20IetfPoly1305,
}

impl Method {
    pub fn parse(name: &str) -> Result<Self> {
        match name {
            "none" => Ok(Method::None),
            "aes-128-gcm" => Ok(Method::Aes128Gcm),
            "aes-256-gcm" => Ok(Method::Aes256Gcm),
            "chacha20-ietf-poly1305" => Ok(Method::ChaCha20IetfPoly1305),
            other => Err(Error::UnsupportedMethod(other.to_string())),
        }
    }

    pub fn key_len(self) -> usize {
        match self {
            Method::None => 0,
            Method::Aes128Gcm => 16,
            Method::Aes256Gcm => 32,
            Method::ChaCha20IetfPoly1305 => 32,
        }
    }

    pub fn salt_len(self) -> usize {
        // Salt size equals key size for the AEAD methods; "none" has none.
        self.key_len()
    }

    pub fn tag_len(self) -> usize {
        match self {
            Method::None => 0,
            _ => 16,
        }
    }

    pub fn nonce_len(self) -> usize {
        match self {
            Method::None => 0,
            _ => 12,
        }
    }

    pub fn is_aead(self) -> bool {
        !matches!(self, Method::None)
    }

    /// Minimum byte count any first-frame decryption attempt needs: the
    /// salt plus one AEAD-sealed length chunk.
    pub fn first_data_len(self) -> usize {
        if self.is_aead() {
            self.salt_len() + 2 + self.tag_len()
        } else {
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn method_parse_known() {
        assert_eq!(Method::parse("none").unwrap(), Method::None);
        assert_eq!(Method::parse("aes-128-gcm").unwrap(), Method::Aes128Gcm);
        assert_eq!(Method::parse("aes-256-gcm").unwrap(), Method::Aes256Gcm);
        assert_eq!(
            Method::parse("chacha20-ietf-poly1305").unwrap(),
            Method::ChaCha20IetfPoly1305
        );
    }

    #[test]
    fn method_parse_unknown() {
        assert!(Method::parse("rc4-md5").is_err());
    }

    #[test]
    fn method_lengths() {
        assert_eq!(Method::Aes128Gcm.key_len(), 16);
        assert_eq!(Method::Aes128Gcm.salt_len(), 16);
        assert_eq!(Method::Aes256Gcm.key_len(), 32);
        assert_eq!(Method::ChaCha20IetfPoly1305.key_len(), 32);
        for m in [Method::Aes128Gcm, Method::Aes256Gcm, Method::ChaCha20IetfPoly1305] {
            assert_eq!(m.tag_len(), 16);
            assert_eq!(m.nonce_len(), 12);
        }
    }

    #[test]
    fn first_data_len_matches_salt_plus_length_chunk() {
        assert_eq!(Method::Aes256Gcm.first_data_len(), 32 + 2 + 16);
        assert_eq!(Method::None.first_data_len(), 0);
    }
}
