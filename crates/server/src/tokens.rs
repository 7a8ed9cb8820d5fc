//! Random identifiers and one-time codes.

use crate::error::VerificationError;
use crate::session::TokenId;
use base64::Engine;

/// Number of digits in a one-time code.
pub const OTP_DIGITS: usize = 6;

const OTP_MODULUS: u32 = 1_000_000;

fn random_url_safe<const N: usize>() -> Result<String, VerificationError> {
    let mut bytes = [0u8; N];
    getrandom::fill(&mut bytes).map_err(|_| VerificationError::RandomUnavailable)?;
    Ok(base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes))
}

/// Generate an unguessable token id: 32 bytes from the OS RNG, base64url.
pub fn generate_token_id() -> Result<TokenId, VerificationError> {
    random_url_safe::<32>().map(TokenId::new)
}

/// Opaque browser context id for the relying side's flow markers.
pub fn generate_context_id() -> Result<String, VerificationError> {
    random_url_safe::<24>()
}

/// Generate a uniformly distributed zero-padded 6-digit code.
pub fn generate_otp() -> Result<String, VerificationError> {
    // Reject the top partial bucket so every code is equally likely.
    let limit = u32::MAX - (u32::MAX % OTP_MODULUS);
    loop {
        let mut bytes = [0u8; 4];
        getrandom::fill(&mut bytes).map_err(|_| VerificationError::RandomUnavailable)?;
        let value = u32::from_le_bytes(bytes);
        if value < limit {
            return Ok(format!("{:06}", value % OTP_MODULUS));
        }
    }
}

/// Whether `code` looks like a one-time code at all.
pub fn is_well_formed_otp(code: &str) -> bool {
    code.len() == OTP_DIGITS && code.bytes().all(|b| b.is_ascii_digit())
}
