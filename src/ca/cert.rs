//! Signed certificates.
//!
//! Encoded form: `<base64url(body json)>.<base64url(signature)>`. The
//! signature covers a domain prefix followed by the exact body bytes, so the
//! body is never re-serialized before verification.

use chrono::{DateTime, Utc};
use ed25519_dalek::{SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::{CaDomain, keys};
use crate::auth::Role;
use crate::{Error, Result};

const SIGNING_PREFIX: &[u8] = b"custos-cert-v1:";

/// What a certificate attests to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertificateBody {
    pub serial: Uuid,
    pub domain: CaDomain,
    pub public_key: String,
    pub principal: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub role: Role,
    pub valid_after: DateTime<Utc>,
    /// `None` means the certificate never expires.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_before: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Certificate {
    body: CertificateBody,
    raw_body: Vec<u8>,
    signature: String,
}

fn signing_message(raw_body: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(SIGNING_PREFIX.len() + raw_body.len());
    message.extend_from_slice(SIGNING_PREFIX);
    message.extend_from_slice(raw_body);
    message
}

impl Certificate {
    pub(crate) fn sign(body: CertificateBody, ca_key: &SigningKey) -> Result<Self> {
        let raw_body = serde_json::to_vec(&body).map_err(Error::storage)?;
        let signature = keys::sign(ca_key, &signing_message(&raw_body));
        Ok(Self {
            body,
            raw_body,
            signature,
        })
    }

    /// Decode a certificate without checking its signature.
    ///
    /// # Errors
    /// Returns `BadParameter` if the encoding or the body is malformed.
    pub fn parse(encoded: &str) -> Result<Self> {
        let (body, signature) = encoded
            .trim()
            .split_once('.')
            .ok_or_else(|| Error::bad_parameter("certificate: missing signature"))?;
        let raw_body = keys::decode(body, "certificate body")?;
        let parsed = serde_json::from_slice(&raw_body)
            .map_err(|e| Error::bad_parameter(format!("certificate body: {e}")))?;
        Ok(Self {
            body: parsed,
            raw_body,
            signature: signature.to_string(),
        })
    }

    /// Check the signature against `ca_key` and the validity window at `now`.
    ///
    /// # Errors
    /// Returns `InvalidCredentials` for a bad signature and `Expired` when
    /// `now` is outside the validity window.
    pub fn verify(&self, ca_key: &VerifyingKey, now: DateTime<Utc>) -> Result<()> {
        keys::verify(ca_key, &signing_message(&self.raw_body), &self.signature)?;
        if now < self.body.valid_after {
            return Err(Error::Expired("certificate (not yet valid)".to_string()));
        }
        if self.body.valid_before.is_some_and(|before| now >= before) {
            return Err(Error::Expired("certificate".to_string()));
        }
        Ok(())
    }

    #[must_use]
    pub fn body(&self) -> &CertificateBody {
        &self.body
    }

    /// # Errors
    /// Returns `BadParameter` if the embedded key is malformed.
    pub fn subject_key(&self) -> Result<VerifyingKey> {
        keys::verifying_key(&self.body.public_key)
    }
}

impl fmt::Display for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", keys::encode(&self.raw_body), self.signature)
    }
}
