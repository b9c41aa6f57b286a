//! Counter-based one-time passwords (HOTP, RFC 4226).
//!
//! Codes are produced with `totp-rs` using a one-second step, which makes
//! the "time" argument the HOTP counter. A code is accepted only at the
//! current counter (no look-ahead window); the caller advances the counter
//! after a successful check so each code works at most once.

use rand::{RngCore, rngs::OsRng};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use subtle::ConstantTimeEq;
use totp_rs::{Algorithm, Secret, TOTP};
use url::Url;

use crate::{Error, Result};

pub const DIGITS: usize = 6;
const SECRET_LEN: usize = 20;
const SCHEME: &str = "otpauth";
const KIND: &str = "hotp";

/// Shared secret plus the counter of the next acceptable code.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Hotp {
    /// Base32, unpadded.
    #[serde(with = "crate::secret::string")]
    secret: SecretString,
    counter: u64,
}

impl Hotp {
    /// New random secret with the counter at zero.
    ///
    /// # Errors
    /// Returns `Storage` if the system RNG fails.
    pub fn generate() -> Result<Self> {
        let mut bytes = vec![0u8; SECRET_LEN];
        OsRng
            .try_fill_bytes(&mut bytes)
            .map_err(|e| Error::storage(format!("failed to generate otp secret: {e}")))?;
        let secret = generator(bytes)?.get_secret_base32();
        Ok(Self {
            secret: SecretString::from(secret),
            counter: 0,
        })
    }

    /// # Errors
    /// Returns `BadParameter` if `secret` is not valid base32 of sufficient length.
    pub fn from_base32(secret: &str, counter: u64) -> Result<Self> {
        let hotp = Self {
            secret: SecretString::from(secret.trim().to_string()),
            counter,
        };
        hotp.totp()?;
        Ok(hotp)
    }

    #[must_use]
    pub fn counter(&self) -> u64 {
        self.counter
    }

    #[must_use]
    pub fn secret_base32(&self) -> &str {
        self.secret.expose_secret()
    }

    fn totp(&self) -> Result<TOTP> {
        let bytes = Secret::Encoded(self.secret.expose_secret().to_string())
            .to_bytes()
            .map_err(|e| Error::bad_parameter(format!("otp secret: {e:?}")))?;
        generator(bytes)
    }

    /// Code valid at `counter`.
    ///
    /// # Errors
    /// Returns `BadParameter` if the stored secret is unusable.
    pub fn code_at(&self, counter: u64) -> Result<String> {
        Ok(self.totp()?.generate(counter))
    }

    /// Code valid at the current counter.
    ///
    /// # Errors
    /// See [`Hotp::code_at`].
    pub fn code(&self) -> Result<String> {
        self.code_at(self.counter)
    }

    /// Return the current code and move to the next one, the way an
    /// authenticator app does when the user asks for a code.
    ///
    /// # Errors
    /// See [`Hotp::code_at`].
    pub fn next_code(&mut self) -> Result<String> {
        let code = self.code()?;
        self.advance();
        Ok(code)
    }

    pub fn advance(&mut self) {
        self.counter = self.counter.saturating_add(1);
    }

    /// Whether `code` is the code at the current counter. Does not advance.
    #[must_use]
    pub fn check(&self, code: &str) -> bool {
        let Ok(expected) = self.code() else {
            return false;
        };
        let code = code.trim();
        code.len() == expected.len() && bool::from(code.as_bytes().ct_eq(expected.as_bytes()))
    }

    /// Provisioning URL for authenticator apps.
    ///
    /// # Errors
    /// Returns `BadParameter` if the label cannot be placed in a URL.
    pub fn url(&self, issuer: &str, label: &str) -> Result<String> {
        let mut url = Url::parse(&format!("{SCHEME}://{KIND}/"))
            .map_err(|e| Error::bad_parameter(format!("otp url: {e}")))?;
        url.set_path(&format!("{issuer}:{label}"));
        url.query_pairs_mut()
            .append_pair("secret", self.secret.expose_secret())
            .append_pair("issuer", issuer)
            .append_pair("counter", &self.counter.to_string())
            .append_pair("digits", &DIGITS.to_string())
            .append_pair("algorithm", "SHA1");
        Ok(url.to_string())
    }

    /// Parse a provisioning URL back into a generator and its account label.
    ///
    /// # Errors
    /// Returns `BadParameter` if this is not an `otpauth://hotp` URL with a
    /// valid secret.
    pub fn from_url(value: &str) -> Result<(Self, String)> {
        let url = Url::parse(value).map_err(|e| Error::bad_parameter(format!("otp url: {e}")))?;
        if url.scheme() != SCHEME || url.host_str() != Some(KIND) {
            return Err(Error::bad_parameter("otp url: not an otpauth://hotp url"));
        }

        let path = url.path().trim_start_matches('/');
        let label = path
            .split_once(':')
            .map_or(path, |(_, account)| account)
            .to_string();

        let mut secret = None;
        let mut counter = 0;
        for (key, val) in url.query_pairs() {
            match key.as_ref() {
                "secret" => secret = Some(val.into_owned()),
                "counter" => {
                    counter = val
                        .parse()
                        .map_err(|_| Error::bad_parameter("otp url: invalid counter"))?;
                }
                _ => {}
            }
        }
        let secret = secret.ok_or_else(|| Error::bad_parameter("otp url: missing secret"))?;
        Ok((Self::from_base32(&secret, counter)?, label))
    }
}

fn generator(secret: Vec<u8>) -> Result<TOTP> {
    TOTP::new(
        Algorithm::SHA1,
        DIGITS,
        0,
        1,
        secret,
        None,
        "custos".to_string(),
    )
    .map_err(|e| Error::bad_parameter(format!("otp init: {e}")))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    // RFC 4226 appendix D test secret.
    const RFC_SECRET: &[u8] = b"12345678901234567890";

    fn rfc_hotp() -> Hotp {
        let secret = generator(RFC_SECRET.to_vec()).unwrap().get_secret_base32();
        Hotp::from_base32(&secret, 0).unwrap()
    }

    #[test]
    fn matches_rfc4226_vectors() {
        let hotp = rfc_hotp();
        let expected = [
            "755224", "287082", "359152", "969429", "338314", "254676", "287922", "162583",
            "399871", "520489",
        ];
        for (counter, code) in expected.iter().enumerate() {
            assert_eq!(hotp.code_at(counter as u64).unwrap(), *code);
        }
    }

    #[test]
    fn check_accepts_only_current_counter() {
        let mut hotp = rfc_hotp();
        assert!(hotp.check("755224"));
        assert!(!hotp.check("287082"));
        hotp.advance();
        assert!(!hotp.check("755224"));
        assert!(hotp.check("287082"));
        assert!(!hotp.check(""));
        assert!(!hotp.check("2870820"));
    }

    #[test]
    fn next_code_walks_the_counter() {
        let mut hotp = rfc_hotp();
        assert_eq!(hotp.next_code().unwrap(), "755224");
        assert_eq!(hotp.next_code().unwrap(), "287082");
        assert_eq!(hotp.counter(), 2);
    }

    #[test]
    fn url_round_trip_keeps_secret_counter_and_label() {
        let mut hotp = Hotp::generate().unwrap();
        hotp.advance();
        let url = hotp.url("custos", "alice").unwrap();
        assert!(url.starts_with("otpauth://hotp/custos:alice?"));

        let (parsed, label) = Hotp::from_url(&url).unwrap();
        assert_eq!(label, "alice");
        assert_eq!(parsed.counter(), 1);
        assert_eq!(parsed.code().unwrap(), hotp.code().unwrap());
    }

    #[test]
    fn from_url_rejects_other_schemes() {
        assert!(Hotp::from_url("https://example.com/?secret=abc").is_err());
        assert!(Hotp::from_url("otpauth://totp/custos:a?secret=GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ").is_err());
        assert!(Hotp::from_url("otpauth://hotp/custos:a").is_err());
    }

    #[test]
    fn debug_hides_secret() {
        let hotp = Hotp::generate().unwrap();
        assert!(!format!("{hotp:?}").contains(hotp.secret_base32()));
    }
}
