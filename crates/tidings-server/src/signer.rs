//! Time-limited attachment URLs.
//!
//! Stored attachments carry an opaque reference. On the way out each one is
//! rewritten to `<base>/<ref>?expires=<unix>&signature=<hex>`, where the
//! signature is HMAC-SHA256 over `<ref>:<expires>`. When signing is not
//! possible the original reference is returned and the message still goes
//! out.

use std::time::Duration;

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use tidings_shared::MessageView;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignError {
    #[error("no signing secret configured")]
    MissingSecret,

    #[error("reference {0:?} cannot be signed")]
    InvalidReference(String),

    #[error("reference is already an absolute URL")]
    External,

    #[error("invalid HMAC key")]
    Key,
}

pub trait UrlSigner: Send + Sync {
    fn sign(&self, reference: &str) -> Result<String, SignError>;
}

pub struct HmacSigner {
    secret: Option<Vec<u8>>,
    base_url: String,
    ttl: Duration,
}

impl HmacSigner {
    pub fn new(secret: Option<String>, base_url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            secret: secret.map(String::into_bytes),
            base_url: base_url.into(),
            ttl,
        }
    }

    pub fn sign_at(&self, reference: &str, now: DateTime<Utc>) -> Result<String, SignError> {
        if reference.starts_with("http://") || reference.starts_with("https://") {
            return Err(SignError::External);
        }
        let reference = reference.trim_start_matches('/');
        check_reference(reference)?;

        let expires = now.timestamp() + self.ttl.as_secs() as i64;
        let signature = self.mac(reference, expires)?;
        Ok(format!(
            "{}/{reference}?expires={expires}&signature={signature}",
            self.base_url
        ))
    }

    /// Check a signature produced by [`HmacSigner::sign_at`].
    pub fn verify(&self, reference: &str, expires: i64, signature: &str, now: DateTime<Utc>) -> bool {
        let reference = reference.trim_start_matches('/');
        if expires < now.timestamp() || check_reference(reference).is_err() {
            return false;
        }
        match self.mac(reference, expires) {
            Ok(expected) => expected.as_bytes().ct_eq(signature.as_bytes()).into(),
            Err(_) => false,
        }
    }

    fn mac(&self, reference: &str, expires: i64) -> Result<String, SignError> {
        let secret = self.secret.as_deref().ok_or(SignError::MissingSecret)?;
        let mut mac = HmacSha256::new_from_slice(secret).map_err(|_| SignError::Key)?;
        mac.update(format!("{reference}:{expires}").as_bytes());
        Ok(hex::encode(mac.finalize().into_bytes()))
    }
}

impl UrlSigner for HmacSigner {
    fn sign(&self, reference: &str) -> Result<String, SignError> {
        self.sign_at(reference, Utc::now())
    }
}

fn check_reference(reference: &str) -> Result<(), SignError> {
    let acceptable = !reference.is_empty()
        && !reference.split('/').any(|seg| seg.is_empty() || seg == "..")
        && reference
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/' | '~'));
    if acceptable {
        Ok(())
    } else {
        Err(SignError::InvalidReference(reference.to_string()))
    }
}

/// Sign `reference`, or hand it back unchanged.
pub fn sign_or_original(signer: &dyn UrlSigner, reference: &str) -> String {
    match signer.sign(reference) {
        Ok(url) => url,
        Err(SignError::External) => reference.to_string(),
        Err(e) => {
            tracing::warn!(error = %e, "attachment left unsigned");
            reference.to_string()
        }
    }
}

/// Rewrite every attachment URL in `views` for delivery.
pub fn sign_views(signer: &dyn UrlSigner, views: &mut [MessageView]) {
    for view in views {
        for attachment in &mut view.attachments {
            attachment.url = sign_or_original(signer, &attachment.url);
        }
    }
}
