/*!
# Vigil Protocol - metric model and wire envelope

Shared by the agent (encode side) and the collector (decode side):
- `MetricSample`: one gauge or counter observation, with the wire record it travels as
- `EnvelopeCodec`: serialize → sign → encrypt → compress, and the inverse
- key loading helpers for the RSA envelope encryption
*/

pub mod crypto;
pub mod envelope;
pub mod model;
pub mod signature;

pub use envelope::{CodecError, Envelope, EnvelopeCodec, EnvelopeKeys, MAX_PLAINTEXT};
pub use model::{MetricKind, MetricSample, MetricValue, ValidationError, WireMetric};

/// Header carrying the hex HMAC-SHA256 of the plaintext body.
pub const HASH_HEADER: &str = "HashSHA256";
/// Header flagging an RSA-encrypted body.
pub const ENCRYPTION_HEADER: &str = "Content-Encryption";
/// Only value ever written to [`ENCRYPTION_HEADER`].
pub const ENCRYPTION_RSA: &str = "RSA";
/// `Content-Encoding` value for compressed bodies.
pub const GZIP_ENCODING: &str = "gzip";
