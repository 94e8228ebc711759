//! Signed, expiring URLs for direct part writes.
//!
//! Signature = base64url(HMAC-SHA256(secret, "{storage_upload_id}:{part_number}:{max}:{expires}")),
//! where `max` is the largest body the URL accepts.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::time::Duration;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignatureError {
    #[error("signature does not match")]
    Invalid,
    #[error("signed URL expired")]
    Expired,
}

/// Signs and verifies part upload URLs.
#[derive(Clone)]
pub struct PartUrlSigner {
    secret: Vec<u8>,
    base_url: String,
}

impl std::fmt::Debug for PartUrlSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartUrlSigner")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl PartUrlSigner {
    pub fn new(secret: impl Into<Vec<u8>>, base_url: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn mac(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires: i64,
    ) -> HmacSha256 {
        // HMAC-SHA256 takes keys of any length.
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key size"));
        mac.update(
            format!("{}:{}:{}:{}", storage_upload_id, part_number, max_bytes, expires).as_bytes(),
        );
        mac
    }

    pub fn sign(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires: i64,
    ) -> String {
        let tag = self
            .mac(storage_upload_id, part_number, max_bytes, expires)
            .finalize()
            .into_bytes();
        URL_SAFE_NO_PAD.encode(tag)
    }

    /// Build the URL a client PUTs one part to.
    pub fn part_url(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires_in: Duration,
        now: DateTime<Utc>,
    ) -> String {
        let expires = now.timestamp() + expires_in.as_secs() as i64;
        let signature = self.sign(storage_upload_id, part_number, max_bytes, expires);
        format!(
            "{}/storage/multipart/{}/{}?max={}&expires={}&signature={}",
            self.base_url, storage_upload_id, part_number, max_bytes, expires, signature
        )
    }

    pub fn verify(
        &self,
        storage_upload_id: &str,
        part_number: u32,
        max_bytes: u64,
        expires: i64,
        signature: &str,
        now: DateTime<Utc>,
    ) -> Result<(), SignatureError> {
        let tag = URL_SAFE_NO_PAD
            .decode(signature)
            .map_err(|_| SignatureError::Invalid)?;
        self.mac(storage_upload_id, part_number, max_bytes, expires)
            .verify_slice(&tag)
            .map_err(|_| SignatureError::Invalid)?;
        if now.timestamp() > expires {
            return Err(SignatureError::Expired);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_param<'a>(url: &'a str, name: &str) -> &'a str {
        url.split(['?', '&'])
            .find_map(|pair| pair.strip_prefix(&format!("{}=", name)))
            .unwrap()
    }

    #[test]
    fn signed_url_verifies_until_expiry() {
        let signer = PartUrlSigner::new(b"secret".to_vec(), "http://localhost:3000/");
        let now = Utc::now();
        let url = signer.part_url("abc", 3, 4096, Duration::from_secs(60), now);
        assert!(url.starts_with("http://localhost:3000/storage/multipart/abc/3?"));

        let max: u64 = query_param(&url, "max").parse().unwrap();
        assert_eq!(max, 4096);
        let expires: i64 = query_param(&url, "expires").parse().unwrap();
        let signature = query_param(&url, "signature");
        assert_eq!(signer.verify("abc", 3, max, expires, signature, now), Ok(()));
        assert_eq!(
            signer.verify("abc", 3, max, expires, signature, now + chrono::Duration::seconds(61)),
            Err(SignatureError::Expired)
        );
    }

    #[test]
    fn signature_is_bound_to_part_and_secret() {
        let signer = PartUrlSigner::new(b"secret".to_vec(), "http://h");
        let other = PartUrlSigner::new(b"other".to_vec(), "http://h");
        let now = Utc::now();
        let expires = now.timestamp() + 60;
        let signature = signer.sign("abc", 1, 100, expires);

        assert_eq!(
            signer.verify("abc", 2, 100, expires, &signature, now),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            signer.verify("abc", 1, 100, expires + 1, &signature, now),
            Err(SignatureError::Invalid)
        );
        // Raising the ceiling invalidates the signature.
        assert_eq!(
            signer.verify("abc", 1, 101, expires, &signature, now),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            other.verify("abc", 1, 100, expires, &signature, now),
            Err(SignatureError::Invalid)
        );
        assert_eq!(
            signer.verify("abc", 1, 100, expires, "not base64!", now),
            Err(SignatureError::Invalid)
        );
    }
}
