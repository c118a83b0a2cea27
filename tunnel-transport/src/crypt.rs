//! Per-datagram AEAD encryption for the encrypted-datagram transport
//! variant, applied below KCP the same way `kcp.BlockCrypt` wraps raw UDP
//! datagrams in the original: each outbound packet is encrypted whole
//! before hitting the wire, each inbound packet decrypted whole before
//! being fed to `kcp::Kcp::input`.

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use rand::RngCore;
use sha2::{Digest, Sha256};

use crate::error::TransportError;

const NONCE_LEN: usize = 12;

/// Derives a 32-byte AES-256 key by SHA-256-hashing a passphrase, matching
/// the original's `kcp.NewAESBlockCrypt([]byte(passphrase)[:32])` approach
/// of deriving a fixed-length key from operator-supplied text.
pub struct DatagramCrypt {
    cipher: Aes256Gcm,
}

impl DatagramCrypt {
    pub fn from_passphrase(passphrase: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(passphrase.as_bytes());
        let key_bytes = hasher.finalize();
        let key = Key::<Aes256Gcm>::from_slice(&key_bytes);
        Self {
            cipher: Aes256Gcm::new(key),
        }
    }

    /// Encrypts `plaintext`, returning `nonce || ciphertext || tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::thread_rng().fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);
        let mut out = Vec::with_capacity(NONCE_LEN + plaintext.len() + 16);
        out.extend_from_slice(&nonce_bytes);
        // Constructing the key from a hash output never fails.
        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .expect("aes-gcm encryption is infallible for in-memory buffers");
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Reverses [`encrypt`]. A corrupt or truncated packet, or one
    /// encrypted under a different key, yields [`TransportError::DecryptionFailed`];
    /// callers drop the whole session on this error per spec.
    pub fn decrypt(&self, packet: &[u8]) -> Result<Vec<u8>, TransportError> {
        if packet.len() < NONCE_LEN {
            return Err(TransportError::DecryptionFailed);
        }
        let (nonce_bytes, ciphertext) = packet.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);
        self.cipher
            .decrypt(nonce, ciphertext)
            .map_err(|_| TransportError::DecryptionFailed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_a_datagram() {
        let crypt = DatagramCrypt::from_passphrase("correct horse battery staple");
        let plaintext = b"kcp segment payload bytes";
        let packet = crypt.encrypt(plaintext);
        let decrypted = crypt.decrypt(&packet).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn rejects_tampered_packets() {
        let crypt = DatagramCrypt::from_passphrase("correct horse battery staple");
        let mut packet = crypt.encrypt(b"hello");
        let last = packet.len() - 1;
        packet[last] ^= 0xFF;
        assert!(matches!(
            crypt.decrypt(&packet),
            Err(TransportError::DecryptionFailed)
        ));
    }

    #[test]
    fn rejects_packets_from_a_different_passphrase() {
        let a = DatagramCrypt::from_passphrase("passphrase-a");
        let b = DatagramCrypt::from_passphrase("passphrase-b");
        let packet = a.encrypt(b"hello");
        assert!(matches!(
            b.decrypt(&packet),
            Err(TransportError::DecryptionFailed)
        ));
    }
}
