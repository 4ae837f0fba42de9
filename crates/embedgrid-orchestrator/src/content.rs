//! Content factory: synthetic URLs and content imprints.
//!
//! Bulk embeds hand unparsable input here instead of failing it (unless the
//! request asks for `reject`). Every derived value is a salted hash of the
//! input, so the same input always maps to the same placeholder.

use sha2::{Digest, Sha256};

/// Derives stand-in content for inputs the orchestrator cannot use directly.
pub trait ContentFactory: Send + Sync {
    /// Placeholder URL for `input` under the `synthesize` strategy.
    fn synthetic_url(&self, input: &str) -> String;

    /// Loopback URL for `input` under the `loopback` strategy.
    fn loopback_url(&self, input: &str) -> String;

    /// Stable fingerprint of `input`, stored in session metadata.
    fn imprint(&self, input: &str) -> String;

    /// URL of the `index`-th session created by scale-out.
    fn sequence_url(&self, index: u64) -> String;
}

/// [`ContentFactory`] keyed by `SHA-256(salt ":" input)`.
#[derive(Debug, Clone)]
pub struct SaltedContentFactory {
    salt: String,
}

impl SaltedContentFactory {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    fn digest(&self, input: &str) -> [u8; 32] {
        let mut hasher = Sha256::new();
        hasher.update(self.salt.as_bytes());
        hasher.update(b":");
        hasher.update(input.as_bytes());
        hasher.finalize().into()
    }
}

impl ContentFactory for SaltedContentFactory {
    fn synthetic_url(&self, input: &str) -> String {
        let digest = self.digest(input);
        format!("https://synthetic.embedgrid.net/content/{}", hex::encode(&digest[..8]))
    }

    fn loopback_url(&self, input: &str) -> String {
        let digest = self.digest(input);
        format!("http://127.0.0.1/embed/{}", hex::encode(&digest[..8]))
    }

    fn imprint(&self, input: &str) -> String {
        hex::encode(&self.digest(input)[..16])
    }

    fn sequence_url(&self, index: u64) -> String {
        let digest = self.digest(&format!("sequence:{index}"));
        format!(
            "https://scale.embedgrid.net/session/{index:07}?sig={}",
            hex::encode(&digest[..4])
        )
    }
}
