//! Expiring file references
//!
//! A reference is the bucket URL of a file plus three query parameters:
//! `X-Access-Key`, `X-Expires` (unix seconds) and `X-Signature`, a keyed
//! BLAKE3 MAC over the access key, expiry and path.

use crate::config::SignerConfig;
use crate::error::{Result, StoreError};
use chrono::{DateTime, Duration, Utc};
use url::Url;

const KEY_DERIVATION_CONTEXT: &str = "easystore 2024 file reference signing";

const ACCESS_KEY_PARAM: &str = "X-Access-Key";
const EXPIRES_PARAM: &str = "X-Expires";
const SIGNATURE_PARAM: &str = "X-Signature";

#[derive(Clone)]
pub struct ReferenceSigner {
    access_key: String,
    key: [u8; 32],
    expiry: Duration,
}

impl std::fmt::Debug for ReferenceSigner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceSigner")
            .field("access_key", &self.access_key)
            .field("expiry", &self.expiry)
            .finish_non_exhaustive()
    }
}

impl ReferenceSigner {
    pub fn new(config: &SignerConfig) -> Self {
        Self {
            access_key: config.access_key.clone(),
            key: blake3::derive_key(KEY_DERIVATION_CONTEXT, config.secret_key.as_bytes()),
            expiry: Duration::minutes(config.expiry_minutes as i64),
        }
    }

    fn mac(&self, expires: i64, path: &str) -> String {
        let message = format!("{}\n{}\n{}", self.access_key, expires, path);
        hex::encode(blake3::keyed_hash(&self.key, message.as_bytes()).as_bytes())
    }

    /// Signed reference to `object_url`, valid until `now + expiry`
    pub fn sign(&self, object_url: &str, now: DateTime<Utc>) -> Result<String> {
        let mut url = Url::parse(object_url).map_err(|e| {
            StoreError::Serialize(format!("cannot sign '{}': {}", object_url, e))
        })?;
        let expires = (now + self.expiry).timestamp();
        let signature = self.mac(expires, url.path());
        url.query_pairs_mut()
            .append_pair(ACCESS_KEY_PARAM, &self.access_key)
            .append_pair(EXPIRES_PARAM, &expires.to_string())
            .append_pair(SIGNATURE_PARAM, &signature);
        Ok(url.to_string())
    }

    /// True when `reference` was signed by this key and has not expired
    pub fn verify(&self, reference: &str, now: DateTime<Utc>) -> bool {
        let Ok(url) = Url::parse(reference) else {
            return false;
        };
        let param = |name: &str| {
            url.query_pairs()
                .find(|(key, _)| key == name)
                .map(|(_, value)| value.into_owned())
        };

        let (Some(access_key), Some(expires), Some(signature)) = (
            param(ACCESS_KEY_PARAM),
            param(EXPIRES_PARAM).and_then(|e| e.parse::<i64>().ok()),
            param(SIGNATURE_PARAM),
        ) else {
            return false;
        };

        access_key == self.access_key
            && expires >= now.timestamp()
            && signature == self.mac(expires, url.path())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer(secret: &str) -> ReferenceSigner {
        ReferenceSigner::new(&SignerConfig {
            access_key: "AK".to_string(),
            secret_key: secret.to_string(),
            expiry_minutes: 10,
        })
    }

    #[test]
    fn test_signed_reference_verifies_until_expiry() {
        let signer = signer("secret");
        let now = Utc::now();
        let reference = signer.sign("file:///bucket/ns/a/files/x.bin", now).unwrap();

        assert!(reference.starts_with("file:///bucket/ns/a/files/x.bin?"));
        assert!(signer.verify(&reference, now));
        assert!(!signer.verify(&reference, now + Duration::minutes(11)));
    }

    #[test]
    fn test_reference_is_bound_to_key_and_path() {
        let now = Utc::now();
        let reference = signer("secret").sign("file:///bucket/a", now).unwrap();

        assert!(!signer("other").verify(&reference, now));
        let moved = reference.replace("/bucket/a", "/bucket/b");
        assert!(!signer("secret").verify(&moved, now));
    }
}
