//! Ed25519 key material and its string encoding.
//!
//! Keys, signatures and certificate parts travel as unpadded base64url.

use base64ct::{Base64UrlUnpadded, Encoding};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

#[must_use]
pub fn encode(bytes: &[u8]) -> String {
    Base64UrlUnpadded::encode_string(bytes)
}

pub fn decode(value: &str, what: &str) -> Result<Vec<u8>> {
    Base64UrlUnpadded::decode_vec(value.trim())
        .map_err(|_| Error::bad_parameter(format!("{what}: invalid base64url")))
}

fn decode_array<const N: usize>(value: &str, what: &str) -> Result<[u8; N]> {
    decode(value, what)?
        .try_into()
        .map_err(|_| Error::bad_parameter(format!("{what}: expected {N} bytes")))
}

pub fn signing_key(value: &str) -> Result<SigningKey> {
    Ok(SigningKey::from_bytes(&decode_array::<32>(value, "private key")?))
}

pub fn verifying_key(value: &str) -> Result<VerifyingKey> {
    VerifyingKey::from_bytes(&decode_array::<32>(value, "public key")?)
        .map_err(|_| Error::bad_parameter("public key: not a valid ed25519 point"))
}

/// Sign `message` and return the encoded signature.
#[must_use]
pub fn sign(key: &SigningKey, message: &[u8]) -> String {
    encode(&key.sign(message).to_bytes())
}

/// Check an encoded signature made by the holder of `public_key`.
///
/// # Errors
/// Returns `InvalidCredentials` if the signature does not verify.
pub fn verify(public_key: &VerifyingKey, message: &[u8], signature: &str) -> Result<()> {
    let signature = Signature::from_bytes(&decode_array::<64>(signature, "signature")?);
    public_key
        .verify(message, &signature)
        .map_err(|_| Error::InvalidCredentials)
}

/// A freshly generated keypair for a future certificate holder.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeyPair {
    #[serde(with = "crate::secret::string")]
    pub private_key: SecretString,
    pub public_key: String,
}

impl KeyPair {
    #[must_use]
    pub fn generate() -> Self {
        let key = SigningKey::generate(&mut OsRng);
        Self {
            private_key: SecretString::from(encode(&key.to_bytes())),
            public_key: encode(key.verifying_key().as_bytes()),
        }
    }

    /// # Errors
    /// Returns `BadParameter` if the private key is malformed.
    pub fn signing_key(&self) -> Result<SigningKey> {
        signing_key(self.private_key.expose_secret())
    }
}
