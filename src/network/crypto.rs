//! Session encryption
//!
//! Both peers hold a long-lived x25519 identity and generate a fresh ephemeral
//! key per handshake. The session secret mixes three Diffie-Hellman results so
//! that each side implicitly authenticates the other's identity:
//!
//! ```text
//! ikm = DH(client_eph, host_eph) || DH(client_static, host_eph) || DH(client_eph, host_static)
//! ```
//!
//! HKDF-SHA256 expands it into one AES-256-GCM key and nonce prefix per
//! direction. The 12-byte packet header is authenticated as associated data
//! and the nonce is `prefix(8) || sequence(4)`.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use hkdf::Hkdf;
use rand::rngs::OsRng;
use sha2::Sha256;
use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};

use crate::protocol::Packet;

use super::error::NetworkError;

/// Size of the nonce (96 bits for AES-GCM)
const NONCE_SIZE: usize = 12;

const NONCE_PREFIX_SIZE: usize = 8;

/// Which end of the handshake we are
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    Client,
    Host,
}

/// Key material for one handshake attempt
pub struct HandshakeKeys {
    identity: StaticSecret,
    ephemeral: StaticSecret,
}

impl HandshakeKeys {
    /// Pair a long-lived identity with a freshly generated ephemeral key
    pub fn new(identity: StaticSecret) -> Self {
        Self {
            identity,
            ephemeral: StaticSecret::random_from_rng(OsRng),
        }
    }

    pub fn identity_public(&self) -> [u8; 32] {
        PublicKey::from(&self.identity).to_bytes()
    }

    pub fn ephemeral_public(&self) -> [u8; 32] {
        PublicKey::from(&self.ephemeral).to_bytes()
    }

    /// Derive the session crypto from the peer's public keys
    pub fn derive(
        &self,
        role: HandshakeRole,
        peer_identity: &[u8; 32],
        peer_ephemeral: &[u8; 32],
    ) -> Result<SessionCrypto, NetworkError> {
        let peer_identity = PublicKey::from(*peer_identity);
        let peer_ephemeral = PublicKey::from(*peer_ephemeral);

        let ee = self.ephemeral.diffie_hellman(&peer_ephemeral);
        // Client static with host ephemeral, then client ephemeral with host static
        let (se, es) = match role {
            HandshakeRole::Client => (
                self.identity.diffie_hellman(&peer_ephemeral),
                self.ephemeral.diffie_hellman(&peer_identity),
            ),
            HandshakeRole::Host => (
                self.ephemeral.diffie_hellman(&peer_identity),
                self.identity.diffie_hellman(&peer_ephemeral),
            ),
        };
        check_contributory(&[&ee, &se, &es])?;

        let mut ikm = [0u8; 96];
        ikm[..32].copy_from_slice(ee.as_bytes());
        ikm[32..64].copy_from_slice(se.as_bytes());
        ikm[64..].copy_from_slice(es.as_bytes());

        let (client_eph, host_eph) = match role {
            HandshakeRole::Client => (self.ephemeral_public(), peer_ephemeral.to_bytes()),
            HandshakeRole::Host => (peer_ephemeral.to_bytes(), self.ephemeral_public()),
        };
        let mut salt = [0u8; 64];
        salt[..32].copy_from_slice(&client_eph);
        salt[32..].copy_from_slice(&host_eph);

        let hk = Hkdf::<Sha256>::new(Some(&salt), &ikm);
        let c2s = DirectionKeys::expand(&hk, b"castline c2s key", b"castline c2s nonce")?;
        let s2c = DirectionKeys::expand(&hk, b"castline s2c key", b"castline s2c nonce")?;

        let (send, recv) = match role {
            HandshakeRole::Client => (c2s, s2c),
            HandshakeRole::Host => (s2c, c2s),
        };
        Ok(SessionCrypto { send, recv })
    }
}

fn check_contributory(secrets: &[&SharedSecret]) -> Result<(), NetworkError> {
    if secrets.iter().all(|s| s.was_contributory()) {
        Ok(())
    } else {
        Err(NetworkError::Encryption(
            "peer sent a low-order public key".to_string(),
        ))
    }
}

struct DirectionKeys {
    cipher: Aes256Gcm,
    nonce_prefix: [u8; NONCE_PREFIX_SIZE],
}

impl DirectionKeys {
    fn expand(hk: &Hkdf<Sha256>, key_info: &[u8], nonce_info: &[u8]) -> Result<Self, NetworkError> {
        let mut key_bytes = [0u8; 32];
        hk.expand(key_info, &mut key_bytes)
            .map_err(|e| NetworkError::Encryption(e.to_string()))?;
        let mut nonce_prefix = [0u8; NONCE_PREFIX_SIZE];
        hk.expand(nonce_info, &mut nonce_prefix)
            .map_err(|e| NetworkError::Encryption(e.to_string()))?;

        Ok(Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key_bytes)),
            nonce_prefix,
        })
    }

    fn nonce(&self, sequence: u32) -> [u8; NONCE_SIZE] {
        let mut nonce = [0u8; NONCE_SIZE];
        nonce[..NONCE_PREFIX_SIZE].copy_from_slice(&self.nonce_prefix);
        nonce[NONCE_PREFIX_SIZE..].copy_from_slice(&sequence.to_be_bytes());
        nonce
    }
}

/// Per-session packet encryption
pub struct SessionCrypto {
    send: DirectionKeys,
    recv: DirectionKeys,
}

impl SessionCrypto {
    /// Encrypt a packet payload in place and mark it encrypted
    pub fn seal(&self, packet: &mut Packet) -> Result<(), NetworkError> {
        packet.flags.encrypted = true;
        let aad = packet.header_bytes();
        let nonce = self.send.nonce(packet.sequence);

        packet.payload = self
            .send
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &packet.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| NetworkError::Encryption("Encryption failed".to_string()))?;
        Ok(())
    }

    /// Verify and decrypt a packet payload in place
    pub fn open(&self, packet: &mut Packet) -> Result<(), NetworkError> {
        if !packet.flags.encrypted {
            return Err(NetworkError::Encryption(
                "Unencrypted packet on a secured session".to_string(),
            ));
        }
        let aad = packet.header_bytes();
        let nonce = self.recv.nonce(packet.sequence);

        packet.payload = self
            .recv
            .cipher
            .decrypt(
                Nonce::from_slice(&nonce),
                Payload {
                    msg: &packet.payload,
                    aad: &aad,
                },
            )
            .map_err(|_| NetworkError::Encryption("Decryption failed".to_string()))?;
        packet.flags.encrypted = false;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::PacketType;

    fn pair() -> (SessionCrypto, SessionCrypto) {
        let client = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let host = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));

        let client_crypto = client
            .derive(
                HandshakeRole::Client,
                &host.identity_public(),
                &host.ephemeral_public(),
            )
            .unwrap();
        let host_crypto = host
            .derive(
                HandshakeRole::Host,
                &client.identity_public(),
                &client.ephemeral_public(),
            )
            .unwrap();
        (client_crypto, host_crypto)
    }

    #[test]
    fn test_both_directions() {
        let (client, host) = pair();

        let mut packet = Packet::new(PacketType::Input, 7, 0, b"click".to_vec());
        client.seal(&mut packet).unwrap();
        assert_ne!(packet.payload, b"click");

        let mut received = Packet::from_bytes(&packet.to_bytes()).unwrap();
        host.open(&mut received).unwrap();
        assert_eq!(received.payload, b"click");
        assert!(!received.flags.encrypted);

        let mut reply = Packet::new(PacketType::Control, 1, 0, b"pong".to_vec());
        host.seal(&mut reply).unwrap();
        client.open(&mut reply).unwrap();
        assert_eq!(reply.payload, b"pong");
    }

    #[test]
    fn test_tampered_header_rejected() {
        let (client, host) = pair();

        let mut packet = Packet::new(PacketType::Video, 3, 0, vec![1, 2, 3]);
        client.seal(&mut packet).unwrap();
        packet.sequence = 4;

        assert!(host.open(&mut packet).is_err());
    }

    #[test]
    fn test_own_direction_cannot_open() {
        let (client, _host) = pair();

        let mut packet = Packet::new(PacketType::Control, 1, 0, vec![9; 16]);
        client.seal(&mut packet).unwrap();

        assert!(client.open(&mut packet).is_err());
    }

    #[test]
    fn test_wrong_identity_cannot_open() {
        let client = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let host = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let impostor = StaticSecret::random_from_rng(OsRng);

        // Client believes it talks to `impostor`, host derives with its real identity
        let client_crypto = client
            .derive(
                HandshakeRole::Client,
                &PublicKey::from(&impostor).to_bytes(),
                &host.ephemeral_public(),
            )
            .unwrap();
        let host_crypto = host
            .derive(
                HandshakeRole::Host,
                &client.identity_public(),
                &client.ephemeral_public(),
            )
            .unwrap();

        let mut packet = Packet::new(PacketType::Control, 1, 0, vec![1; 8]);
        client_crypto.seal(&mut packet).unwrap();
        assert!(host_crypto.open(&mut packet).is_err());
    }

    #[test]
    fn test_low_order_key_rejected() {
        let keys = HandshakeKeys::new(StaticSecret::random_from_rng(OsRng));
        let result = keys.derive(HandshakeRole::Client, &[0u8; 32], &[0u8; 32]);
        assert!(matches!(result, Err(NetworkError::Encryption(_))));
    }

    #[test]
    fn test_unencrypted_packet_rejected() {
        let (_client, host) = pair();
        let mut packet = Packet::new(PacketType::Control, 1, 0, vec![1]);
        assert!(host.open(&mut packet).is_err());
    }
}
