//! One-time password codes.
//!
//! HOTP (RFC 4226) and TOTP (RFC 6238) over HMAC-SHA1/256/512. Seeds are
//! base32 strings as used by authenticator apps. Every entry point validates
//! the seed and settings before computing a code.

use chrono::{DateTime, TimeZone, Utc};
use data_encoding::BASE32_NOPAD;
use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use sha2::{Sha256, Sha512};
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};
use crate::types::{OtpAlgorithm, OtpKind, OtpSettings};

/// A generated TOTP code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpCode {
    /// Zero-padded decimal code.
    pub code: String,
    /// End of the time step the code belongs to.
    pub expires_at: DateTime<Utc>,
    /// Seconds until `expires_at`.
    pub remaining_seconds: u64,
}

/// A generated HOTP code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotpCode {
    /// Zero-padded decimal code.
    pub code: String,
    /// Counter the code was computed for.
    pub counter: u64,
}

/// Result of a TOTP verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TotpVerification {
    /// Whether a step in the skew window matched.
    pub valid: bool,
    /// Offset in steps of the matching code from the current step.
    pub drift: Option<i64>,
}

/// Result of an HOTP verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HotpVerification {
    /// Whether a counter in the lookahead window matched.
    pub valid: bool,
    /// Counter to persist: the matched counter plus one.
    pub new_counter: Option<u64>,
}

/// Decodes a base32 seed, ignoring spaces, case and padding.
///
/// # Errors
///
/// Returns [`Error::InvalidOtpConfig`] if the seed is empty or not base32.
pub fn decode_seed(seed: &str) -> Result<Vec<u8>> {
    let normalized: String = seed
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '=' && *c != '-')
        .map(|c| c.to_ascii_uppercase())
        .collect();
    if normalized.is_empty() {
        return Err(Error::otp_config("seed cannot be empty"));
    }
    BASE32_NOPAD
        .decode(normalized.as_bytes())
        .map_err(|_| Error::otp_config("seed is not valid base32"))
}

/// Encodes seed bytes as unpadded base32.
#[must_use]
pub fn encode_seed(bytes: &[u8]) -> String {
    BASE32_NOPAD.encode(bytes)
}

/// Generates a random seed sized for the algorithm's block.
#[must_use]
pub fn generate_seed(algorithm: OtpAlgorithm) -> String {
    let len = match algorithm {
        OtpAlgorithm::Sha1 => 20,
        OtpAlgorithm::Sha256 => 32,
        OtpAlgorithm::Sha512 => 64,
    };
    let mut bytes = zeroize::Zeroizing::new(vec![0u8; len]);
    rand::thread_rng().fill_bytes(&mut bytes);
    encode_seed(&bytes)
}

fn hmac_digest(algorithm: OtpAlgorithm, key: &[u8], message: &[u8]) -> Result<Vec<u8>> {
    let invalid = |_| Error::otp_config("seed length rejected by hmac");
    let digest = match algorithm {
        OtpAlgorithm::Sha1 => {
            let mut mac = Hmac::<Sha1>::new_from_slice(key).map_err(invalid)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        OtpAlgorithm::Sha256 => {
            let mut mac = Hmac::<Sha256>::new_from_slice(key).map_err(invalid)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
        OtpAlgorithm::Sha512 => {
            let mut mac = Hmac::<Sha512>::new_from_slice(key).map_err(invalid)?;
            mac.update(message);
            mac.finalize().into_bytes().to_vec()
        }
    };
    Ok(digest)
}

/// RFC 4226 dynamic truncation.
fn hotp_code(key: &[u8], counter: u64, algorithm: OtpAlgorithm, digits: u32) -> Result<String> {
    let digest = hmac_digest(algorithm, key, &counter.to_be_bytes())?;
    let offset = usize::from(digest[digest.len() - 1] & 0x0f);
    let binary = (u32::from(digest[offset] & 0x7f) << 24)
        | (u32::from(digest[offset + 1]) << 16)
        | (u32::from(digest[offset + 2]) << 8)
        | u32::from(digest[offset + 3]);
    let modulus = 10u32.pow(digits);
    Ok(format!("{:0width$}", binary % modulus, width = digits as usize))
}

fn codes_equal(expected: &str, presented: &str) -> bool {
    expected.as_bytes().ct_eq(presented.as_bytes()).into()
}

fn well_formed(code: &str, digits: u32) -> bool {
    code.len() == digits as usize && code.bytes().all(|b| b.is_ascii_digit())
}

fn validate_digits(digits: u32) -> Result<()> {
    if (OtpSettings::MIN_DIGITS..=OtpSettings::MAX_DIGITS).contains(&digits) {
        Ok(())
    } else {
        Err(Error::otp_config(format!(
            "digits must be between {} and {}, got {digits}",
            OtpSettings::MIN_DIGITS,
            OtpSettings::MAX_DIGITS
        )))
    }
}

fn validate_period(period: u64) -> Result<()> {
    if period == 0 {
        return Err(Error::otp_config("period must be greater than zero"));
    }
    Ok(())
}

fn unix_seconds(at: DateTime<Utc>) -> Result<u64> {
    u64::try_from(at.timestamp()).map_err(|_| Error::validation("time is before the unix epoch"))
}

/// TOTP/HOTP generator and verifier.
#[derive(Debug, Clone, Copy)]
pub struct OtpEngine {
    skew_steps: u32,
    lookahead: u64,
}

impl Default for OtpEngine {
    fn default() -> Self {
        Self::new(1, 10)
    }
}

impl OtpEngine {
    /// Creates an engine.
    ///
    /// `skew_steps` is clamped to at least one step.
    #[must_use]
    pub fn new(skew_steps: u32, lookahead: u64) -> Self {
        Self {
            skew_steps: skew_steps.max(1),
            lookahead,
        }
    }

    /// Default HOTP lookahead window.
    #[must_use]
    pub const fn lookahead(&self) -> u64 {
        self.lookahead
    }

    /// Computes the TOTP code for the step containing `at`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for a bad seed, digits or period.
    pub fn totp_generate(&self, seed: &str, settings: &OtpSettings, at: DateTime<Utc>) -> Result<TotpCode> {
        let key = zeroize::Zeroizing::new(decode_seed(seed)?);
        validate_digits(settings.digits)?;
        validate_period(settings.period)?;

        let now = unix_seconds(at)?;
        let counter = now / settings.period;
        let code = hotp_code(&key, counter, settings.algorithm, settings.digits)?;
        let expires = (counter + 1) * settings.period;
        let expires_at = i64::try_from(expires)
            .ok()
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .ok_or_else(|| Error::validation("time step out of range"))?;

        Ok(TotpCode {
            code,
            expires_at,
            remaining_seconds: expires - now,
        })
    }

    /// Verifies a TOTP code, trying steps `-skew..=+skew` in order.
    ///
    /// A code of the wrong length or with non-digits is invalid, not an error.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for a bad seed, digits or period.
    pub fn totp_verify(
        &self,
        seed: &str,
        code: &str,
        settings: &OtpSettings,
        at: DateTime<Utc>,
    ) -> Result<TotpVerification> {
        let key = zeroize::Zeroizing::new(decode_seed(seed)?);
        validate_digits(settings.digits)?;
        validate_period(settings.period)?;

        let code = code.trim();
        let invalid = TotpVerification {
            valid: false,
            drift: None,
        };
        if !well_formed(code, settings.digits) {
            return Ok(invalid);
        }

        let counter = unix_seconds(at)? / settings.period;
        let skew = i64::from(self.skew_steps);
        for drift in -skew..=skew {
            let Some(step) = counter.checked_add_signed(drift) else {
                continue;
            };
            let expected = hotp_code(&key, step, settings.algorithm, settings.digits)?;
            if codes_equal(&expected, code) {
                return Ok(TotpVerification {
                    valid: true,
                    drift: Some(drift),
                });
            }
        }
        Ok(invalid)
    }

    /// Computes the HOTP code for `counter`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for a bad seed or digits.
    pub fn hotp_generate(
        &self,
        seed: &str,
        counter: u64,
        algorithm: OtpAlgorithm,
        digits: u32,
    ) -> Result<HotpCode> {
        let key = zeroize::Zeroizing::new(decode_seed(seed)?);
        validate_digits(digits)?;
        Ok(HotpCode {
            code: hotp_code(&key, counter, algorithm, digits)?,
            counter,
        })
    }

    /// Verifies an HOTP code against `counter..=counter + lookahead`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for a bad seed or digits.
    pub fn hotp_verify(
        &self,
        seed: &str,
        code: &str,
        counter: u64,
        algorithm: OtpAlgorithm,
        digits: u32,
        lookahead: u64,
    ) -> Result<HotpVerification> {
        let key = zeroize::Zeroizing::new(decode_seed(seed)?);
        validate_digits(digits)?;

        let code = code.trim();
        let invalid = HotpVerification {
            valid: false,
            new_counter: None,
        };
        if !well_formed(code, digits) {
            return Ok(invalid);
        }

        for candidate in counter..=counter.saturating_add(lookahead) {
            let expected = hotp_code(&key, candidate, algorithm, digits)?;
            if codes_equal(&expected, code) {
                return Ok(HotpVerification {
                    valid: true,
                    new_counter: Some(candidate.saturating_add(1)),
                });
            }
        }
        Ok(invalid)
    }

    /// Builds an `otpauth://` URI for enrolling the seed in an authenticator.
    ///
    /// # Errors
    ///
    /// Returns [`Error::InvalidOtpConfig`] for a bad seed or settings, or if
    /// `kind` is [`OtpKind::None`].
    pub fn provisioning_uri(
        &self,
        seed: &str,
        kind: OtpKind,
        settings: &OtpSettings,
        account: &str,
        counter: u64,
    ) -> Result<String> {
        let key = zeroize::Zeroizing::new(decode_seed(seed)?);
        validate_digits(settings.digits)?;
        let scheme = match kind {
            OtpKind::Totp => {
                validate_period(settings.period)?;
                "totp"
            }
            OtpKind::Hotp => "hotp",
            OtpKind::None => return Err(Error::otp_config("secret has no otp generator")),
        };

        let label = match &settings.issuer {
            Some(issuer) => format!(
                "{}:{}",
                urlencoding::encode(issuer),
                urlencoding::encode(account)
            ),
            None => urlencoding::encode(account).into_owned(),
        };
        let mut uri = format!(
            "otpauth://{scheme}/{label}?secret={}&algorithm={}&digits={}",
            encode_seed(&key),
            settings.algorithm.uri_name(),
            settings.digits
        );
        match kind {
            OtpKind::Totp => uri.push_str(&format!("&period={}", settings.period)),
            OtpKind::Hotp => uri.push_str(&format!("&counter={counter}")),
            OtpKind::None => {}
        }
        if let Some(issuer) = &settings.issuer {
            uri.push_str(&format!("&issuer={}", urlencoding::encode(issuer)));
        }
        Ok(uri)
    }
}
