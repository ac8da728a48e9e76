//! Client identity and proof-of-possession.
//!
//! Every client owns one RSA key pair. Jobs carry an [`AuthProof`]: a message
//! plus an RSA-PKCS#1 v1.5 signature over `SHA-256(message)`. The server keeps
//! only the public half and checks proofs against it.

use rand::Rng;
use rand::distributions::Alphanumeric;
use rsa::pkcs1::DecodeRsaPublicKey;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rsa::signature::{SignatureEncoding, Signer, Verifier};
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use std::fmt;

/// Key size used when a client bootstraps a fresh identity.
pub const DEFAULT_KEY_BITS: usize = 2048;

/// A signed message proving possession of a private key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthProof {
    pub message: String,
    pub hex_signature: String,
}

/// PEM-encoded RSA key pair.
#[derive(Clone, PartialEq, Eq)]
pub struct KeyPair {
    public_pem: String,
    private_pem: String,
}

impl KeyPair {
    /// Wrap already-encoded keys, checking that both halves parse.
    pub fn from_pem(
        public_pem: impl Into<String>,
        private_pem: impl Into<String>,
    ) -> Result<Self, KeyError> {
        let pair = Self {
            public_pem: public_pem.into(),
            private_pem: private_pem.into(),
        };
        parse_public(&pair.public_pem)?;
        parse_private(&pair.private_pem)?;
        Ok(pair)
    }

    /// Generate a fresh key pair of the given modulus size.
    pub fn generate(bits: usize) -> Result<Self, KeyError> {
        let private = RsaPrivateKey::new(&mut rand::rngs::OsRng, bits)
            .map_err(|e| KeyError::Generate(e.to_string()))?;
        let public = RsaPublicKey::from(&private);

        let private_pem = private
            .to_pkcs8_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encode(e.to_string()))?;
        let public_pem = public
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| KeyError::Encode(e.to_string()))?;

        Ok(Self {
            public_pem,
            private_pem: private_pem.to_string(),
        })
    }

    pub fn public_pem(&self) -> &str {
        &self.public_pem
    }

    pub fn private_pem(&self) -> &str {
        &self.private_pem
    }
}

impl fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_pem", &self.public_pem)
            .field("private_pem", &"<redacted>")
            .finish()
    }
}

/// A named client holding its key pair.
#[derive(Debug, Clone)]
pub struct Identity {
    name: String,
    keys: KeyPair,
    nonce_len: usize,
}

impl Identity {
    pub fn new(name: impl Into<String>, keys: KeyPair, nonce_len: usize) -> Self {
        Self {
            name: name.into(),
            keys,
            nonce_len,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn public_pem(&self) -> &str {
        self.keys.public_pem()
    }

    /// Sign `message`, or a fresh random nonce when none is given.
    pub fn prove(&self, message: Option<&str>) -> Result<AuthProof, KeyError> {
        match message {
            Some(m) => sign(m, self.keys.private_pem()),
            None => sign(&random_message(self.nonce_len), self.keys.private_pem()),
        }
    }
}

/// Sign `message` with a PEM private key.
pub fn sign(message: &str, private_pem: &str) -> Result<AuthProof, KeyError> {
    let private = parse_private(private_pem)?;
    let signer = SigningKey::<Sha256>::new(private);
    let signature = signer
        .try_sign(message.as_bytes())
        .map_err(|e| KeyError::Sign(e.to_string()))?;

    Ok(AuthProof {
        message: message.to_string(),
        hex_signature: hex::encode(signature.to_bytes()),
    })
}

/// Check a proof against a PEM public key.
///
/// Any failure (unparseable key, bad hex, wrong signature) yields `false`.
pub fn verify(auth: &AuthProof, public_pem: &str) -> bool {
    let Ok(public) = parse_public(public_pem) else {
        return false;
    };
    let Ok(raw) = hex::decode(&auth.hex_signature) else {
        return false;
    };
    let Ok(signature) = Signature::try_from(raw.as_slice()) else {
        return false;
    };

    VerifyingKey::<Sha256>::new(public)
        .verify(auth.message.as_bytes(), &signature)
        .is_ok()
}

/// Random alphanumeric string used as a heartbeat challenge.
pub fn random_message(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn parse_private(pem: &str) -> Result<RsaPrivateKey, KeyError> {
    RsaPrivateKey::from_pkcs8_pem(pem).map_err(|e| KeyError::Malformed(e.to_string()))
}

fn parse_public(pem: &str) -> Result<RsaPublicKey, KeyError> {
    RsaPublicKey::from_public_key_pem(pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(pem))
        .map_err(|e| KeyError::Malformed(e.to_string()))
}

/// Error producing or loading key material.
#[derive(Debug, Clone, thiserror::Error)]
pub enum KeyError {
    #[error("malformed key: {0}")]
    Malformed(String),
    #[error("key generation failed: {0}")]
    Generate(String),
    #[error("key encoding failed: {0}")]
    Encode(String),
    #[error("signing failed: {0}")]
    Sign(String),
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::OnceLock;

    /// Two cached small key pairs; generation dominates test time otherwise.
    pub(crate) fn keys(i: usize) -> KeyPair {
        static KEYS: OnceLock<Vec<KeyPair>> = OnceLock::new();
        KEYS.get_or_init(|| (0..2).map(|_| KeyPair::generate(1024).unwrap()).collect())[i]
            .clone()
    }

    #[test]
    fn sign_then_verify() {
        let pair = keys(0);
        let auth = sign("alice", pair.private_pem()).unwrap();
        assert_eq!(auth.message, "alice");
        assert!(verify(&auth, pair.public_pem()));
    }

    #[test]
    fn single_bit_flip_fails() {
        let pair = keys(0);
        let auth = sign("heartbeat", pair.private_pem()).unwrap();
        let mut raw = hex::decode(&auth.hex_signature).unwrap();
        for byte in [0, raw.len() / 2, raw.len() - 1] {
            raw[byte] ^= 0x01;
            let forged = AuthProof {
                message: auth.message.clone(),
                hex_signature: hex::encode(&raw),
            };
            assert!(!verify(&forged, pair.public_pem()));
            raw[byte] ^= 0x01;
        }
    }

    #[test]
    fn other_key_rejected() {
        let auth = sign("alice", keys(0).private_pem()).unwrap();
        assert!(!verify(&auth, keys(1).public_pem()));
    }

    #[test]
    fn garbage_never_panics() {
        let auth = AuthProof {
            message: "x".into(),
            hex_signature: "not hex".into(),
        };
        assert!(!verify(&auth, keys(0).public_pem()));
        assert!(!verify(&auth, "-----BEGIN PUBLIC KEY-----\nnope\n"));
        let short = AuthProof {
            message: "x".into(),
            hex_signature: "abcd".into(),
        };
        assert!(!verify(&short, keys(0).public_pem()));
    }

    #[test]
    fn malformed_private_key() {
        assert!(matches!(sign("x", "garbage"), Err(KeyError::Malformed(_))));
    }

    #[test]
    fn prove_mints_fresh_nonces() {
        let id = Identity::new("alice", keys(0), 24);
        let a = id.prove(None).unwrap();
        let b = id.prove(None).unwrap();
        assert_eq!(a.message.len(), 24);
        assert_ne!(a.message, b.message);
        assert!(verify(&a, id.public_pem()));
    }

    #[test]
    fn keypair_debug_redacts_private_half() {
        let shown = format!("{:?}", keys(0));
        assert!(shown.contains("<redacted>"));
        assert!(!shown.contains("PRIVATE KEY"));
    }
}
