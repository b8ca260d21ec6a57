//! Detached ed25519 signatures over summaries and commits.
//!
//! A signature blob is an `a{sv}` whose `ostree.sign.ed25519` entry is an
//! `aay` of 64-byte signatures.

use base64::prelude::{Engine as _, BASE64_STANDARD};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use refdeploy_domain::{VarDict, Variant, VariantType};

use crate::error::{StoreError, StoreResult};

pub const SIGN_KEY_ED25519: &str = "ostree.sign.ed25519";

pub trait SignatureVerifier: Send + Sync {
    /// Succeeds when at least one signature in `signatures` validates `data`.
    fn verify(&self, data: &[u8], signatures: &VarDict) -> StoreResult<()>;
}

/// Whether the blob carries any signature this crate understands.
#[must_use]
pub fn has_signatures(signatures: &VarDict) -> bool {
    signatures
        .get(SIGN_KEY_ED25519)
        .and_then(Variant::as_array)
        .is_some_and(|sigs| !sigs.is_empty())
}

pub fn decode_signatures(data: &[u8]) -> StoreResult<VarDict> {
    Variant::parse("a{sv}", data)
        .and_then(|value| value.to_vardict())
        .map_err(|source| StoreError::Decode {
            checksum: "signature".into(),
            source,
        })
}

#[must_use]
pub fn encode_signatures(signatures: &VarDict) -> Vec<u8> {
    Variant::vardict(signatures).to_bytes()
}

#[derive(Clone, Debug)]
pub struct Ed25519Verifier {
    keys: Vec<VerifyingKey>,
}

impl Ed25519Verifier {
    pub fn new(keys: Vec<VerifyingKey>) -> Self {
        Self { keys }
    }

    /// Keys as stored in a remote's `xa.sign-keys`.
    pub fn from_base64_keys<S: AsRef<str>>(keys: &[S]) -> StoreResult<Self> {
        let mut parsed = Vec::new();
        for key in keys {
            let raw = BASE64_STANDARD
                .decode(key.as_ref().trim())
                .map_err(|err| StoreError::Signature(format!("invalid public key: {err}")))?;
            let bytes: [u8; 32] = raw
                .as_slice()
                .try_into()
                .map_err(|_| StoreError::Signature("public key must be 32 bytes".into()))?;
            let key = VerifyingKey::from_bytes(&bytes)
                .map_err(|err| StoreError::Signature(format!("invalid public key: {err}")))?;
            parsed.push(key);
        }
        Ok(Self::new(parsed))
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }
}

impl SignatureVerifier for Ed25519Verifier {
    fn verify(&self, data: &[u8], signatures: &VarDict) -> StoreResult<()> {
        if self.keys.is_empty() {
            return Err(StoreError::Signature("no trusted keys configured".into()));
        }
        let candidates = signatures
            .get(SIGN_KEY_ED25519)
            .and_then(Variant::as_array)
            .unwrap_or_default();
        if candidates.is_empty() {
            return Err(StoreError::Signature("no ed25519 signatures found".into()));
        }
        for candidate in candidates {
            let Some(bytes) = candidate.as_bytes() else {
                continue;
            };
            let Ok(bytes) = <[u8; 64]>::try_from(bytes.as_slice()) else {
                continue;
            };
            let signature = Signature::from_bytes(&bytes);
            if self.keys.iter().any(|key| key.verify(data, &signature).is_ok()) {
                return Ok(());
            }
        }
        Err(StoreError::Signature(
            "no signature matched a trusted key".into(),
        ))
    }
}

/// Produces signatures for generated summaries and commits.
#[derive(Clone, Debug)]
pub struct Ed25519Signer {
    key: SigningKey,
}

impl Ed25519Signer {
    #[must_use]
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self {
            key: SigningKey::from_bytes(seed),
        }
    }

    #[must_use]
    pub fn public_key_base64(&self) -> String {
        BASE64_STANDARD.encode(self.key.verifying_key().to_bytes())
    }

    #[must_use]
    pub fn verifier(&self) -> Ed25519Verifier {
        Ed25519Verifier::new(vec![self.key.verifying_key()])
    }

    /// Signature blob for `data`, ready to be written as a `.sig` file.
    #[must_use]
    pub fn sign(&self, data: &[u8]) -> VarDict {
        let signature = self.key.sign(data).to_bytes();
        let mut dict = VarDict::new();
        dict.insert(
            SIGN_KEY_ED25519.to_string(),
            Variant::Array(
                VariantType::Array(Box::new(VariantType::Byte)),
                vec![Variant::bytes(&signature)],
            ),
        );
        dict
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signatures_verify_against_configured_keys() {
        let signer = Ed25519Signer::from_seed(&[7u8; 32]);
        let blob = encode_signatures(&signer.sign(b"summary"));
        let dict = decode_signatures(&blob).unwrap();
        assert!(has_signatures(&dict));

        let verifier = Ed25519Verifier::from_base64_keys(&[signer.public_key_base64()]).unwrap();
        assert!(verifier.verify(b"summary", &dict).is_ok());
        assert!(verifier.verify(b"tampered", &dict).is_err());

        let stranger = Ed25519Signer::from_seed(&[9u8; 32]).verifier();
        assert!(stranger.verify(b"summary", &dict).is_err());
    }

    #[test]
    fn empty_blob_has_no_signatures() {
        let verifier = Ed25519Signer::from_seed(&[1u8; 32]).verifier();
        assert!(!has_signatures(&VarDict::new()));
        assert!(verifier.verify(b"x", &VarDict::new()).is_err());
    }

    #[test]
    fn rejects_malformed_keys() {
        assert!(Ed25519Verifier::from_base64_keys(&["not base64!"]).is_err());
        assert!(Ed25519Verifier::from_base64_keys(&[BASE64_STANDARD.encode([1u8; 5])]).is_err());
    }
}
