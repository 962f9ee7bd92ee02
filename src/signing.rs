//! Signature verification used to authorize mutable records.
//!
//! Peers verify records on behalf of arbitrary third parties, so a verifier
//! never needs key material of its own.

use std::fmt::Debug;

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::Rng;

/// Prefix every signature token starts with.
pub const SIGNATURE_PREFIX: &str = "Sig";

const SALT_SIZE: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Shape of a well-formed signature token, checked before any cryptography runs.
pub struct SignatureFormat {
    pub prefix: &'static str,
    pub length: usize,
}

impl SignatureFormat {
    pub fn matches(&self, signature: &str) -> bool {
        signature.len() == self.length && signature.starts_with(self.prefix)
    }
}

/// Verify-only signing service backing record validation.
pub trait SignatureVerifier: Send + Sync + Debug {
    /// Returns `true` if `address` is a well formed signing address.
    fn is_valid_address(&self, address: &str) -> bool;

    /// Returns `true` if `signature` is a valid signature of `message` by `address`.
    fn verify(&self, message: &str, address: &str, signature: &str) -> bool;

    fn signature_format(&self) -> SignatureFormat;
}

#[derive(Debug, Clone, Copy, Default)]
/// Ed25519 verifier.
///
/// Addresses are hex encoded verifying keys. Signatures are
/// `"Sig" + hex(salt) + hex(ed25519(salt || message))`, the random salt making
/// every re-signature of the same message a fresh token.
pub struct Ed25519Verifier;

impl Ed25519Verifier {
    pub const FORMAT: SignatureFormat = SignatureFormat {
        prefix: SIGNATURE_PREFIX,
        length: SIGNATURE_PREFIX.len() + SALT_SIZE * 2 + Signature::BYTE_SIZE * 2,
    };
}

impl SignatureVerifier for Ed25519Verifier {
    fn is_valid_address(&self, address: &str) -> bool {
        verifying_key(address).is_some()
    }

    fn verify(&self, message: &str, address: &str, signature: &str) -> bool {
        let Some(key) = verifying_key(address) else {
            return false;
        };

        if !Self::FORMAT.matches(signature) {
            return false;
        }

        let Ok(body) = hex::decode(&signature[SIGNATURE_PREFIX.len()..]) else {
            return false;
        };
        let (salt, signature) = body.split_at(SALT_SIZE);

        let Ok(signature) = <[u8; Signature::BYTE_SIZE]>::try_from(signature) else {
            return false;
        };

        key.verify(&salted(salt, message), &Signature::from_bytes(&signature))
            .is_ok()
    }

    fn signature_format(&self) -> SignatureFormat {
        Self::FORMAT
    }
}

#[derive(Debug, Clone)]
/// Produces signatures accepted by [Ed25519Verifier].
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    pub fn from_bytes(secret_key: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(secret_key),
        }
    }

    pub fn random() -> Self {
        Self::from_bytes(&rand::thread_rng().gen())
    }

    /// The address other peers verify this signer's records against.
    pub fn address(&self) -> String {
        hex::encode(self.signing_key.verifying_key().as_bytes())
    }

    pub fn sign(&self, message: &str) -> String {
        let salt: [u8; SALT_SIZE] = rand::thread_rng().gen();
        let signature = self.signing_key.sign(&salted(&salt, message));

        format!(
            "{SIGNATURE_PREFIX}{}{}",
            hex::encode(salt),
            hex::encode(signature.to_bytes())
        )
    }
}

fn verifying_key(address: &str) -> Option<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(address).ok()?.try_into().ok()?;

    VerifyingKey::from_bytes(&bytes).ok()
}

fn salted(salt: &[u8], message: &str) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(salt.len() + message.len());
    bytes.extend_from_slice(salt);
    bytes.extend_from_slice(message.as_bytes());
    bytes
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn sign_and_verify() {
        let signer = Ed25519Signer::random();
        let verifier = Ed25519Verifier;

        let signature = signer.sign("hello");

        assert!(verifier.signature_format().matches(&signature));
        assert!(verifier.is_valid_address(&signer.address()));
        assert!(verifier.verify("hello", &signer.address(), &signature));
    }

    #[test]
    fn resigning_yields_fresh_token() {
        let signer = Ed25519Signer::random();

        assert_ne!(signer.sign("hello"), signer.sign("hello"));
    }

    #[test]
    fn reject_wrong_message_or_signer() {
        let signer = Ed25519Signer::random();
        let other = Ed25519Signer::random();
        let verifier = Ed25519Verifier;

        let signature = signer.sign("hello");

        assert!(!verifier.verify("hullo", &signer.address(), &signature));
        assert!(!verifier.verify("hello", &other.address(), &signature));
    }

    #[test]
    fn reject_malformed() {
        let signer = Ed25519Signer::random();
        let verifier = Ed25519Verifier;
        let signature = signer.sign("hello");

        let unprefixed = format!("Abc{}", &signature[3..]);
        assert!(!verifier.verify("hello", &signer.address(), &unprefixed));
        assert!(!verifier.verify("hello", &signer.address(), &signature[..100]));

        assert!(!verifier.is_valid_address("not-an-address"));
        assert!(!verifier.is_valid_address(&"ab".repeat(31)));
    }

    #[test]
    fn reject_non_ascii_of_the_right_length() {
        let signer = Ed25519Signer::random();
        let verifier = Ed25519Verifier;

        // 'é' is two bytes wide and straddles the salt/signature boundary.
        let signature = format!("Sig{}é{}", "a".repeat(31), "b".repeat(127));

        assert_eq!(signature.len(), Ed25519Verifier::FORMAT.length);
        assert!(verifier.signature_format().matches(&signature));
        assert!(!verifier.verify("hello", &signer.address(), &signature));
    }
}
