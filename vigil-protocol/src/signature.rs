//! HMAC-SHA256 body signatures carried in the `HashSHA256` header.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

fn keyed(key: &[u8]) -> HmacSha256 {
    match HmacSha256::new_from_slice(key) {
        Ok(mac) => mac,
        Err(_) => unreachable!("HMAC accepts keys of any length"),
    }
}

/// Hex-encoded HMAC-SHA256 of `data` under `key`.
pub fn sign(data: &[u8], key: &[u8]) -> String {
    let mut mac = keyed(key);
    mac.update(data);
    hex::encode(mac.finalize().into_bytes())
}

/// Constant-time check of a hex signature against `data`.
pub fn verify(data: &[u8], key: &[u8], signature: &str) -> bool {
    let Ok(received) = hex::decode(signature.trim()) else {
        return false;
    };
    let mut mac = keyed(key);
    mac.update(data);
    let expected = mac.finalize().into_bytes();
    expected.as_slice().ct_eq(&received).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sign_is_stable() {
        // RFC 4231 test case 2
        let sig = sign(b"what do ya want for nothing?", b"Jefe");
        assert_eq!(sig, "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843");
    }

    #[test]
    fn test_verify_roundtrip_and_tamper() {
        let sig = sign(b"payload", b"secret");
        assert!(verify(b"payload", b"secret", &sig));
        assert!(!verify(b"payloaD", b"secret", &sig));
        assert!(!verify(b"payload", b"other", &sig));
        assert!(!verify(b"payload", b"secret", "not-hex"));
        assert!(!verify(b"payload", b"secret", ""));
    }
}
