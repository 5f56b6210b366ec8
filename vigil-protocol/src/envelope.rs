//! Wire envelope: the same pipeline for every payload, single sample or batch.
//!
//! Encode: serialize → HMAC over the plaintext → RSA encrypt → gzip.
//! Decode: gunzip → RSA decrypt (if flagged) → verify HMAC (if present) → deserialize.
//!
//! The signature always covers the serialized plaintext, never the compressed or
//! encrypted bytes, so signing and encryption can be toggled independently.
//! Whether an unsigned envelope is acceptable is the receiver's policy; the codec
//! only skips verification when no signature is attached.

use crate::crypto;
use crate::signature;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use rsa::{RsaPrivateKey, RsaPublicKey};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{Read, Write};
use tracing::debug;

/// Largest plaintext an envelope may expand to, compressed or not.
pub const MAX_PLAINTEXT: usize = 8 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("failed to serialize payload: {0}")]
    Serialize(#[source] serde_json::Error),
    #[error("malformed payload: {0}")]
    Deserialize(#[source] serde_json::Error),
    #[error("gzip error: {0}")]
    Compression(#[from] std::io::Error),
    #[error("encryption failed: {0}")]
    Encryption(#[source] rsa::Error),
    #[error("decryption failed: {0}")]
    Decryption(#[source] rsa::Error),
    #[error("payload is encrypted but no private key is configured")]
    NoPrivateKey,
    #[error("signature mismatch")]
    AuthenticationFailed,
    #[error("payload exceeds {limit} bytes")]
    TooLarge { limit: usize },
}

/// Key material injected at construction; every field is optional and a
/// missing key disables its step.
#[derive(Debug, Clone, Default)]
pub struct EnvelopeKeys {
    pub signing_key: Option<Vec<u8>>,
    /// Sender side.
    pub public_key: Option<RsaPublicKey>,
    /// Receiver side.
    pub private_key: Option<RsaPrivateKey>,
}

/// One delivery attempt's worth of bytes plus the flags that travel as headers.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub body: Vec<u8>,
    /// Hex HMAC-SHA256 of the plaintext.
    pub signature: Option<String>,
    pub encrypted: bool,
    pub compressed: bool,
}

impl Envelope {
    /// Rebuilds an envelope from transport headers. Empty header values count
    /// as absent.
    pub fn from_parts(
        body: Vec<u8>,
        content_encoding: Option<&str>,
        encryption: Option<&str>,
        signature: Option<&str>,
    ) -> Self {
        Self {
            body,
            signature: signature
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string),
            encrypted: encryption.is_some_and(|e| e.eq_ignore_ascii_case(crate::ENCRYPTION_RSA)),
            compressed: content_encoding
                .is_some_and(|e| e.eq_ignore_ascii_case(crate::GZIP_ENCODING)),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    keys: EnvelopeKeys,
}

impl EnvelopeCodec {
    pub fn new(keys: EnvelopeKeys) -> Self {
        Self { keys }
    }

    /// Plain JSON + gzip, no signing, no encryption.
    pub fn plain() -> Self {
        Self::default()
    }

    pub fn signs(&self) -> bool {
        self.keys.signing_key.is_some()
    }

    pub fn encode<T: Serialize + ?Sized>(&self, payload: &T) -> Result<Envelope, CodecError> {
        let plaintext = serde_json::to_vec(payload).map_err(CodecError::Serialize)?;

        let signature = self
            .keys
            .signing_key
            .as_deref()
            .map(|key| signature::sign(&plaintext, key));

        let (bytes, encrypted) = match &self.keys.public_key {
            Some(key) => (crypto::encrypt(key, &plaintext).map_err(CodecError::Encryption)?, true),
            None => (plaintext, false),
        };

        let mut gz = GzEncoder::new(Vec::with_capacity(bytes.len() / 2), Compression::default());
        gz.write_all(&bytes)?;
        let body = gz.finish()?;

        Ok(Envelope { body, signature, encrypted, compressed: true })
    }

    /// Recovers and authenticates the plaintext without deserializing it.
    pub fn open(&self, envelope: &Envelope) -> Result<Vec<u8>, CodecError> {
        let bytes = if envelope.compressed {
            let mut out = Vec::with_capacity((envelope.body.len() * 2).min(MAX_PLAINTEXT));
            GzDecoder::new(envelope.body.as_slice())
                .take(MAX_PLAINTEXT as u64 + 1)
                .read_to_end(&mut out)?;
            out
        } else {
            envelope.body.clone()
        };
        if bytes.len() > MAX_PLAINTEXT {
            return Err(CodecError::TooLarge { limit: MAX_PLAINTEXT });
        }

        let plaintext = if envelope.encrypted {
            let key = self.keys.private_key.as_ref().ok_or(CodecError::NoPrivateKey)?;
            crypto::decrypt(key, &bytes).map_err(CodecError::Decryption)?
        } else {
            bytes
        };

        match (&envelope.signature, &self.keys.signing_key) {
            (Some(sig), Some(key)) => {
                if !signature::verify(&plaintext, key, sig) {
                    return Err(CodecError::AuthenticationFailed);
                }
            }
            (Some(_), None) => debug!("signature present but no signing key configured, skipping check"),
            (None, _) => {}
        }

        Ok(plaintext)
    }

    pub fn decode<T: DeserializeOwned>(&self, envelope: &Envelope) -> Result<T, CodecError> {
        let plaintext = self.open(envelope)?;
        serde_json::from_slice(&plaintext).map_err(CodecError::Deserialize)
    }
}
