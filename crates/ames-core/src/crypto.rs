//! Key material, packet sealing, and comet attestation.
//!
//! Every keyed pair of peers shares a symmetric key derived by ECDH and
//! widened to the 64 bytes AES-SIV wants. SIV is deliberate: it is
//! deterministic, so no nonce travels on the wire, and misuse (the same
//! plaintext twice) degrades to detectability rather than key recovery.
//! Identity binding comes from the associated data: both ships and both
//! full life values are mixed into every seal, so a ciphertext replayed
//! across identities or key epochs will not open.
//!
//! Comets have no PKI entry; their address *is* their key. A comet proves
//! itself with a signed [`Attestation`] whose key fingerprint must equal
//! the comet's ship address.

use ames_proto::{Attestation, OpenPacket, Ship};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha512};
use thiserror::Error;
use x25519_dalek::StaticSecret;

/// Errors from sealing, opening, or attestation checks.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CryptoError {
    /// AES-SIV encryption failed
    #[error("failed to seal payload")]
    SealFailed,

    /// AES-SIV authentication failed: wrong key, tampered bytes, or
    /// mismatched associated data
    #[error("failed to open payload")]
    OpenFailed,

    /// Attestation signature did not verify
    #[error("bad attestation signature from {0}")]
    BadSignature(Ship),

    /// Attestation key does not hash to the claimed comet address
    #[error("attestation key fingerprint does not match {0}")]
    FingerprintMismatch(Ship),

    /// Self-attestation from a ship that is not a comet
    #[error("{0} is not a comet and cannot self-attest")]
    NotAComet(Ship),

    /// A comet attested with a life other than 1
    #[error("comet attested life {0}, comets are always life 1")]
    CometLife(u32),
}

/// A ship's published keys: one for signatures, one for key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeys {
    /// Ed25519 verifying key
    pub sign: [u8; 32],
    /// X25519 public key
    pub exchange: [u8; 32],
}

/// A ship's private keys for one life, derived from a 32-byte seed.
#[derive(Clone)]
pub struct KeyPair {
    sign: SigningKey,
    exchange: StaticSecret,
    seed: [u8; 32],
}

impl KeyPair {
    /// Derive the signing and exchange keys for one life from a seed.
    ///
    /// The exchange secret is domain-separated from the signing key so the
    /// same seed never serves two primitives directly.
    #[must_use]
    pub fn from_seed(seed: [u8; 32]) -> Self {
        let sign = SigningKey::from_bytes(&seed);

        let mut hasher = Sha512::new();
        hasher.update(b"ames/exchange/v1");
        hasher.update(seed);
        let digest = hasher.finalize();
        let mut exchange = [0u8; 32];
        exchange.copy_from_slice(&digest[..32]);

        Self {
            sign,
            exchange: StaticSecret::from(exchange),
            seed,
        }
    }

    /// The seed this pair was derived from (for snapshots).
    #[must_use]
    pub fn seed(&self) -> [u8; 32] {
        self.seed
    }

    /// The published half of this pair.
    #[must_use]
    pub fn public(&self) -> PublicKeys {
        PublicKeys {
            sign: self.sign.verifying_key().to_bytes(),
            exchange: x25519_dalek::PublicKey::from(&self.exchange).to_bytes(),
        }
    }

    /// Sign a message with the Ed25519 half.
    #[must_use]
    pub fn sign(&self, msg: &[u8]) -> [u8; 64] {
        self.sign.sign(msg).to_bytes()
    }

    /// The symmetric key shared with a peer publishing `her`.
    ///
    /// Purely a function of our exchange secret and her exchange key; it is
    /// recomputed whenever either side's keys change, never stored per
    /// substructure.
    #[must_use]
    pub fn shared_key(&self, her: &PublicKeys) -> SymmetricKey {
        let shared = self
            .exchange
            .diffie_hellman(&x25519_dalek::PublicKey::from(her.exchange));
        SymmetricKey::derive(shared.as_bytes())
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // never print secrets
        f.debug_struct("KeyPair").finish_non_exhaustive()
    }
}

/// 64-byte AES-SIV key shared between two peers.
#[derive(Clone, PartialEq, Eq)]
pub struct SymmetricKey([u8; 64]);

impl SymmetricKey {
    /// Widen an ECDH shared secret to the SIV key size.
    #[must_use]
    pub fn derive(shared: &[u8; 32]) -> Self {
        let mut hasher = Sha512::new();
        hasher.update(b"ames/flow-key/v1");
        hasher.update(shared);
        let digest = hasher.finalize();
        let mut key = [0u8; 64];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Seal a plaintext under this key with the given associated data.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::SealFailed`] if the cipher rejects the input
    /// (only possible for pathological plaintext sizes).
    pub fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut cipher = self.cipher()?;
        cipher
            .encrypt([aad], plaintext)
            .map_err(|_| CryptoError::SealFailed)
    }

    /// Open a ciphertext sealed with [`SymmetricKey::seal`].
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::OpenFailed`] when authentication fails for
    /// any reason: wrong key, tampering, or different associated data.
    pub fn open(&self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut cipher = self.cipher()?;
        cipher
            .decrypt([aad], ciphertext)
            .map_err(|_| CryptoError::OpenFailed)
    }

    fn cipher(&self) -> Result<aes_siv::siv::Aes256Siv, CryptoError> {
        use aes_siv::KeyInit;
        aes_siv::siv::Aes256Siv::new_from_slice(&self.0).map_err(|_| CryptoError::SealFailed)
    }

    /// Raw key bytes (for snapshots only).
    #[must_use]
    pub fn to_bytes(&self) -> [u8; 64] {
        self.0
    }

    /// Rebuild from snapshot bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 64]) -> Self {
        Self(bytes)
    }
}

impl std::fmt::Debug for SymmetricKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SymmetricKey").finish_non_exhaustive()
    }
}

/// Associated data binding a seal to both identities and both key epochs:
/// `[sndr, rcvr, sndr_life, rcvr_life]`, fixed-width little-endian.
#[must_use]
pub fn associated_data(sndr: Ship, rcvr: Ship, sndr_life: u32, rcvr_life: u32) -> [u8; 40] {
    let mut aad = [0u8; 40];
    aad[..16].copy_from_slice(&sndr.0.to_le_bytes());
    aad[16..32].copy_from_slice(&rcvr.0.to_le_bytes());
    aad[32..36].copy_from_slice(&sndr_life.to_le_bytes());
    aad[36..40].copy_from_slice(&rcvr_life.to_le_bytes());
    aad
}

/// The comet address owned by a key set: the low 128 bits of
/// `sha256(sign_key ++ exchange_key)`, with the top bit forced so every
/// fingerprint lands in comet space and bit 8 forced so the address
/// truncates to a star — only stars sponsor comets, and the sponsor is
/// read straight out of the address.
#[must_use]
pub fn comet_address(keys: &PublicKeys) -> Ship {
    let mut hasher = Sha256::new();
    hasher.update(b"ames/comet/v1");
    hasher.update(keys.sign);
    hasher.update(keys.exchange);
    let digest = hasher.finalize();
    let mut low = [0u8; 16];
    low.copy_from_slice(&digest[..16]);
    Ship(u128::from_le_bytes(low) | 1 << 127 | 1 << 8)
}

/// Build a signed self-attestation for a comet.
///
/// # Errors
///
/// Returns a [`CryptoError`] if the keypair's fingerprint is not `sndr`
/// (callers must pass the comet's own pair), or a wire error if the
/// attestation fails to encode.
pub fn attest(
    pair: &KeyPair,
    sndr: Ship,
    rcvr: Ship,
    rcvr_life: u32,
) -> Result<OpenPacket, crate::error::AmesError> {
    let public = pair.public();
    if comet_address(&public) != sndr {
        return Err(CryptoError::FingerprintMismatch(sndr).into());
    }

    let attestation = Attestation {
        sign_key: public.sign,
        exchange_key: public.exchange,
        sndr,
        sndr_life: 1,
        rcvr,
        rcvr_life,
    };
    let signature = pair.sign(&attestation.signed_bytes()?);
    Ok(OpenPacket {
        signature,
        attestation,
    })
}

/// Verify a comet's self-attestation and return its published keys.
///
/// Checks, in order: the claimed sender is a comet, its life is 1, the
/// key fingerprint equals the sender address, and the signature covers the
/// attestation bytes.
///
/// # Errors
///
/// Returns the specific [`CryptoError`] for whichever check fails first.
pub fn verify_attestation(open: &OpenPacket) -> Result<PublicKeys, crate::error::AmesError> {
    let att = &open.attestation;

    if att.sndr.rank() != ames_proto::Rank::Comet {
        return Err(CryptoError::NotAComet(att.sndr).into());
    }
    if att.sndr_life != 1 {
        return Err(CryptoError::CometLife(att.sndr_life).into());
    }

    let keys = PublicKeys {
        sign: att.sign_key,
        exchange: att.exchange_key,
    };
    if comet_address(&keys) != att.sndr {
        return Err(CryptoError::FingerprintMismatch(att.sndr).into());
    }

    let verifying = VerifyingKey::from_bytes(&att.sign_key)
        .map_err(|_| CryptoError::BadSignature(att.sndr))?;
    let signature = Signature::from_bytes(&open.signature);
    verifying
        .verify(&att.signed_bytes()?, &signature)
        .map_err(|_| CryptoError::BadSignature(att.sndr))?;

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(tag: u8) -> KeyPair {
        KeyPair::from_seed([tag; 32])
    }

    #[test]
    fn shared_key_is_symmetric() {
        let a = pair(1);
        let b = pair(2);
        assert_eq!(a.shared_key(&b.public()), b.shared_key(&a.public()));
        assert_ne!(a.shared_key(&b.public()), a.shared_key(&pair(3).public()));
    }

    #[test]
    fn seal_open_round_trip() {
        let key = pair(1).shared_key(&pair(2).public());
        let aad = associated_data(Ship(10), Ship(20), 3, 4);

        let sealed = key.seal(&aad, b"secret payload").unwrap();
        assert_ne!(&sealed[..], b"secret payload");
        assert_eq!(key.open(&aad, &sealed).unwrap(), b"secret payload");
    }

    #[test]
    fn open_rejects_wrong_associated_data() {
        let key = pair(1).shared_key(&pair(2).public());
        let sealed = key
            .seal(&associated_data(Ship(10), Ship(20), 3, 4), b"hi")
            .unwrap();

        // different life in the binding
        let result = key.open(&associated_data(Ship(10), Ship(20), 3, 5), &sealed);
        assert_eq!(result, Err(CryptoError::OpenFailed));
    }

    #[test]
    fn open_rejects_wrong_key() {
        let key = pair(1).shared_key(&pair(2).public());
        let other = pair(1).shared_key(&pair(3).public());
        let aad = associated_data(Ship(10), Ship(20), 1, 1);

        let sealed = key.seal(&aad, b"hi").unwrap();
        assert_eq!(other.open(&aad, &sealed), Err(CryptoError::OpenFailed));
    }

    #[test]
    fn sealing_is_deterministic() {
        // SIV: no nonce, same inputs seal to the same bytes
        let key = pair(1).shared_key(&pair(2).public());
        let aad = associated_data(Ship(1), Ship(2), 1, 1);
        assert_eq!(key.seal(&aad, b"x").unwrap(), key.seal(&aad, b"x").unwrap());
    }

    #[test]
    fn comet_addresses_are_comets_sponsored_by_stars() {
        let address = comet_address(&pair(9).public());
        assert_eq!(address.rank(), ames_proto::Rank::Comet);
        assert_eq!(address.parent().rank(), ames_proto::Rank::Star);
    }

    #[test]
    fn attestation_round_trip() {
        let comet_pair = pair(7);
        let comet = comet_address(&comet_pair.public());

        let open = attest(&comet_pair, comet, Ship(0xbeef), 5).unwrap();
        let keys = verify_attestation(&open).unwrap();
        assert_eq!(keys, comet_pair.public());
    }

    #[test]
    fn attestation_rejects_tampered_signature() {
        let comet_pair = pair(7);
        let comet = comet_address(&comet_pair.public());

        let mut open = attest(&comet_pair, comet, Ship(0xbeef), 5).unwrap();
        open.signature[0] ^= 1;
        assert!(verify_attestation(&open).is_err());
    }

    #[test]
    fn attestation_rejects_stolen_key() {
        // attacker signs a claim to someone else's comet address
        let victim = comet_address(&pair(7).public());
        let attacker = pair(8);

        let attestation = Attestation {
            sign_key: attacker.public().sign,
            exchange_key: attacker.public().exchange,
            sndr: victim,
            sndr_life: 1,
            rcvr: Ship(0xbeef),
            rcvr_life: 5,
        };
        let signature = attacker.sign(&attestation.signed_bytes().unwrap());
        let open = OpenPacket {
            signature,
            attestation,
        };

        assert!(matches!(
            verify_attestation(&open),
            Err(crate::error::AmesError::Crypto(
                CryptoError::FingerprintMismatch(_)
            ))
        ));
    }

    #[test]
    fn attestation_rejects_non_comet_claim() {
        let p = pair(7);
        let attestation = Attestation {
            sign_key: p.public().sign,
            exchange_key: p.public().exchange,
            sndr: Ship(0xbeef), // a star, not a comet
            sndr_life: 1,
            rcvr: Ship(0xdead_beef),
            rcvr_life: 1,
        };
        let signature = p.sign(&attestation.signed_bytes().unwrap());
        let open = OpenPacket {
            signature,
            attestation,
        };

        assert!(matches!(
            verify_attestation(&open),
            Err(crate::error::AmesError::Crypto(CryptoError::NotAComet(_)))
        ));
    }
}
