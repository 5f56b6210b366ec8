//! RSA key loading and block-wise PKCS#1 v1.5 encryption.
//!
//! One PKCS#1 v1.5 block carries at most `k - 11` bytes of plaintext, where `k`
//! is the modulus size in bytes. Payloads longer than that (batches) are cut into
//! blocks, each encrypted on its own; the ciphertext is the concatenation of the
//! resulting `k`-byte blocks.

use rand::rngs::OsRng;
use rsa::pkcs1::{DecodeRsaPrivateKey, DecodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, DecodePublicKey};
use rsa::traits::PublicKeyParts;
use rsa::Pkcs1v15Encrypt;
use std::path::{Path, PathBuf};

pub use rsa::{RsaPrivateKey, RsaPublicKey};

const PKCS1_V15_OVERHEAD: usize = 11;

#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    #[error("failed to read key file {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid key in {0:?}: expected a PEM encoded PKCS#1 or PKCS#8 RSA key")]
    Invalid(PathBuf),
}

/// Loads a PEM public key (SPKI `PUBLIC KEY` or PKCS#1 `RSA PUBLIC KEY`).
pub fn load_public_key(path: &Path) -> Result<RsaPublicKey, KeyError> {
    let pem = read_pem(path)?;
    RsaPublicKey::from_public_key_pem(&pem)
        .or_else(|_| RsaPublicKey::from_pkcs1_pem(&pem))
        .map_err(|_| KeyError::Invalid(path.to_path_buf()))
}

/// Loads a PEM private key (PKCS#8 `PRIVATE KEY` or PKCS#1 `RSA PRIVATE KEY`).
pub fn load_private_key(path: &Path) -> Result<RsaPrivateKey, KeyError> {
    let pem = read_pem(path)?;
    RsaPrivateKey::from_pkcs8_pem(&pem)
        .or_else(|_| RsaPrivateKey::from_pkcs1_pem(&pem))
        .map_err(|_| KeyError::Invalid(path.to_path_buf()))
}

fn read_pem(path: &Path) -> Result<String, KeyError> {
    std::fs::read_to_string(path).map_err(|source| KeyError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Plaintext bytes one padded block can carry for a `modulus_len`-byte key.
fn block_capacity(modulus_len: usize) -> rsa::Result<usize> {
    modulus_len
        .checked_sub(PKCS1_V15_OVERHEAD)
        .filter(|n| *n > 0)
        .ok_or(rsa::Error::MessageTooLong)
}

pub fn encrypt(key: &RsaPublicKey, plaintext: &[u8]) -> rsa::Result<Vec<u8>> {
    let block = block_capacity(key.size())?;
    let mut out = Vec::with_capacity(plaintext.len().div_ceil(block) * key.size());
    let mut rng = OsRng;
    for chunk in plaintext.chunks(block) {
        out.extend(key.encrypt(&mut rng, Pkcs1v15Encrypt, chunk)?);
    }
    Ok(out)
}

pub fn decrypt(key: &RsaPrivateKey, ciphertext: &[u8]) -> rsa::Result<Vec<u8>> {
    let block = key.size();
    if ciphertext.is_empty() || ciphertext.len() % block != 0 {
        return Err(rsa::Error::Decryption);
    }
    let mut out = Vec::with_capacity(ciphertext.len());
    for chunk in ciphertext.chunks(block) {
        out.extend(key.decrypt(Pkcs1v15Encrypt, chunk)?);
    }
    Ok(out)
}
