//! HMAC-SHA256 signing of delivery bodies.
//!
//! The signature is computed over the exact bytes sent as the request body, keyed with the
//! endpoint secret, and carried hex-encoded in the [`SIGNATURE_HEADER`]. Receivers recompute it
//! over the raw body they received; the platform's own test receiver uses [`verify`] too.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64_STANDARD};
use hmac::{Hmac, Mac};
use rand::prelude::RngExt;
use rand::rng;
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Prefix for generated webhook secrets
pub const SECRET_PREFIX: &str = "whsec_";

/// Header carrying the hex digest of the body
pub const SIGNATURE_HEADER: &str = "X-Webhook-Signature";

/// Generate a new webhook secret.
///
/// Returns a `whsec_` prefixed base64-encoded 32-byte random secret.
pub fn generate_secret() -> String {
    let secret_bytes: [u8; 32] = rng().random();
    format!("{}{}", SECRET_PREFIX, BASE64_STANDARD.encode(secret_bytes))
}

fn keyed_mac(secret: &str) -> HmacSha256 {
    HmacSha256::new_from_slice(secret.as_bytes()).expect("HMAC accepts keys of any length")
}

/// Sign a raw body, returning the lowercase hex HMAC-SHA256 digest.
pub fn sign(body: &[u8], secret: &str) -> String {
    let mut mac = keyed_mac(secret);
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a hex digest against a raw body.
///
/// The comparison is constant-time. A digest that is not valid hex never verifies.
pub fn verify(body: &[u8], supplied_digest: &str, secret: &str) -> bool {
    let Ok(supplied) = hex::decode(supplied_digest.trim()) else {
        return false;
    };

    let mut mac = keyed_mac(secret);
    mac.update(body);
    mac.verify_slice(&supplied).is_ok()
}
