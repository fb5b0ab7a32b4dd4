//! Webhook payload signing.
//!
//! Subscribers verify `X-Signature` by recomputing HMAC-SHA256 over
//! `"{ts}.{body}"` with the shared secret; `X-Timestamp` carries `ts` so
//! stale signatures can be rejected.

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Hex-encoded HMAC-SHA256 of `"{ts}.{body}"`.
pub fn sign_payload(secret: &str, ts: i64, body: &str) -> String {
    let payload = format!("{}.{}", ts, body);
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .expect("HMAC can take any key length");
    mac.update(payload.as_bytes());
    hex::encode(mac.finalize().into_bytes())
}
