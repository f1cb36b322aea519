//! `X-Hub-Signature-256` verification.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::error::WebhookError;

type HmacSha256 = Hmac<Sha256>;

const PREFIX: &str = "sha256=";

/// Check `header` against the HMAC-SHA256 of `body` under `secret`.
///
/// The comparison is constant-time.
///
/// # Errors
///
/// [`WebhookError::MissingSignature`] without a header,
/// [`WebhookError::InvalidSignatureFormat`] when it is not `sha256=<hex>`,
/// [`WebhookError::InvalidSignature`] when the digest does not match.
///
/// # Examples
///
/// ```
/// use veritas_server::signature::{sign, verify_signature};
///
/// let header = sign(b"s3cret", b"{}").unwrap();
/// assert!(verify_signature(b"s3cret", b"{}", Some(&header)).is_ok());
/// assert!(verify_signature(b"other", b"{}", Some(&header)).is_err());
/// ```
pub fn verify_signature(
    secret: &[u8],
    body: &[u8],
    header: Option<&str>,
) -> Result<(), WebhookError> {
    let header = header.ok_or(WebhookError::MissingSignature)?;
    let digest = header
        .trim()
        .strip_prefix(PREFIX)
        .ok_or_else(|| WebhookError::InvalidSignatureFormat("expected sha256= prefix".into()))?;
    let expected = hex::decode(digest)
        .map_err(|e| WebhookError::InvalidSignatureFormat(format!("digest is not hex: {e}")))?;

    let mut mac = mac(secret)?;
    mac.update(body);
    mac.verify_slice(&expected)
        .map_err(|_| WebhookError::InvalidSignature)
}

/// The `sha256=<hex>` header value GitHub would send for `body`.
///
/// # Errors
///
/// Returns [`WebhookError::Internal`] if the key is rejected.
pub fn sign(secret: &[u8], body: &[u8]) -> Result<String, WebhookError> {
    let mut mac = mac(secret)?;
    mac.update(body);
    Ok(format!("{PREFIX}{}", hex::encode(mac.finalize().into_bytes())))
}

fn mac(secret: &[u8]) -> Result<HmacSha256, WebhookError> {
    HmacSha256::new_from_slice(secret)
        .map_err(|e| WebhookError::Internal(format!("invalid webhook secret: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        // Example delivery from GitHub's webhook documentation.
        let header = sign(b"It's a Secret to Everybody", b"Hello, World!").unwrap();
        assert_eq!(
            header,
            "sha256=757107ea0eb2509fc211221cce984b8a37570b6d7586c22c46f4379c8b043e17"
        );
    }

    #[test]
    fn missing_header() {
        assert!(matches!(
            verify_signature(b"k", b"body", None),
            Err(WebhookError::MissingSignature)
        ));
    }

    #[test]
    fn wrong_prefix_or_encoding() {
        assert!(matches!(
            verify_signature(b"k", b"body", Some("sha1=abcd")),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
        assert!(matches!(
            verify_signature(b"k", b"body", Some("sha256=zz")),
            Err(WebhookError::InvalidSignatureFormat(_))
        ));
    }

    #[test]
    fn tampered_body_is_rejected() {
        let header = sign(b"k", b"original").unwrap();
        assert!(matches!(
            verify_signature(b"k", b"tampered", Some(&header)),
            Err(WebhookError::InvalidSignature)
        ));
        let truncated = &header[..header.len() - 2];
        assert!(matches!(
            verify_signature(b"k", b"original", Some(truncated)),
            Err(WebhookError::InvalidSignature)
        ));
    }
}
