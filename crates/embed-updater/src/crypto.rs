//! Digest and signature primitives, plus the trusted-key check built on them.

use std::sync::Arc;

use anyhow::{anyhow, Context};
use libsecp256k1::{Message, RecoveryId, Signature};
use sha2::{Digest, Sha256};

use crate::error::{EmbedError, Result};

/// Hash function producing lower-case hex digests.
pub trait Digester: Send + Sync {
    fn digest(&self, bytes: &[u8]) -> String;
}

/// Recovers the identity of whoever signed `digest`.
pub trait SignerRecovery: Send + Sync {
    fn recover(&self, digest: &str, signature: &str) -> anyhow::Result<String>;
}

/// SHA-256 [`Digester`].
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256Digester;

impl Digester for Sha256Digester {
    fn digest(&self, bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }
}

/// secp256k1 public-key recovery over a hex SHA-256 digest.
///
/// Signatures are 65 bytes `r || s || v`, hex encoded, where `v` is the
/// recovery id either raw (`0..=3`) or Ethereum-style offset (`27..=30`).
/// The recovered identity is the hex encoding of the compressed public key.
#[derive(Debug, Clone, Copy, Default)]
pub struct Secp256k1Recovery;

impl SignerRecovery for Secp256k1Recovery {
    fn recover(&self, digest: &str, signature: &str) -> anyhow::Result<String> {
        let digest = hex::decode(digest.trim()).context("digest is not hex")?;
        let digest: [u8; 32] = digest
            .try_into()
            .map_err(|_| anyhow!("digest must be 32 bytes"))?;

        let raw = hex::decode(signature.trim().trim_start_matches("0x"))
            .context("signature is not hex")?;
        if raw.len() != 65 {
            return Err(anyhow!("signature must be 65 bytes, got {}", raw.len()));
        }
        let v = match raw[64] {
            v @ 0..=3 => v,
            v @ 27..=30 => v - 27,
            other => return Err(anyhow!("invalid recovery id {other}")),
        };

        let signature = Signature::parse_standard_slice(&raw[..64])
            .map_err(|err| anyhow!("malformed signature: {err:?}"))?;
        let recovery_id =
            RecoveryId::parse(v).map_err(|err| anyhow!("malformed recovery id: {err:?}"))?;
        let public = libsecp256k1::recover(&Message::parse(&digest), &signature, &recovery_id)
            .map_err(|err| anyhow!("recovery failed: {err:?}"))?;
        Ok(hex::encode(public.serialize_compressed()))
    }
}

/// Ordered set of public keys whose signatures are accepted. Fixed for the
/// lifetime of the process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrustedKeySet {
    keys: Vec<String>,
}

impl TrustedKeySet {
    /// Normalise `keys` (trimmed, lower-case, no `0x`). Fails when none remain.
    pub fn new<I, S>(keys: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let keys: Vec<String> = keys
            .into_iter()
            .map(|key| normalize_key(key.as_ref()))
            .filter(|key| !key.is_empty())
            .collect();
        if keys.is_empty() {
            return Err(EmbedError::configuration(
                "at least one trusted proof key is required",
            ));
        }
        Ok(Self { keys })
    }

    /// Whether `identity` is one of the trusted keys.
    pub fn contains(&self, identity: &str) -> bool {
        let identity = normalize_key(identity);
        self.keys.iter().any(|key| *key == identity)
    }

    /// Number of trusted keys.
    pub fn len(&self) -> usize {
        self.keys.len()
    }

    /// Always false for a constructed set.
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

fn normalize_key(key: &str) -> String {
    key.trim().trim_start_matches("0x").to_ascii_lowercase()
}

/// Accepts a signature only when it recovers to a member of the trusted key set.
#[derive(Clone)]
pub struct SignatureVerifier {
    keys: TrustedKeySet,
    recovery: Arc<dyn SignerRecovery>,
}

impl SignatureVerifier {
    /// Verifier accepting signatures that `recovery` maps onto `keys`.
    pub fn new(keys: TrustedKeySet, recovery: Arc<dyn SignerRecovery>) -> Self {
        Self { keys, recovery }
    }

    /// Whether `signature` over `digest` comes from a trusted key. Malformed
    /// input is rejected, never raised.
    pub fn verify(&self, digest: &str, signature: &str) -> bool {
        let recovered = match self.recovery.recover(digest, signature) {
            Ok(identity) => identity,
            Err(err) => {
                tracing::warn!(error = %err, "signature recovery failed");
                return false;
            }
        };

        let trusted = self.keys.contains(&recovered);
        if !trusted {
            tracing::warn!(signer = %recovered, "signature recovered to an untrusted key");
        }
        trusted
    }

    /// The trusted key set.
    pub fn keys(&self) -> &TrustedKeySet {
        &self.keys
    }
}
