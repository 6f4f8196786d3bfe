//! Token authentication helpers.
//!
//! Tokens are opaque byte strings shared between server and clients. The
//! comparison is constant-time so an attacker cannot learn the position of
//! the first differing byte from response latency.

use rand::Rng;
use subtle::ConstantTimeEq;

use crate::error::{Error, Result};

/// Minimum accepted token length in bytes.
pub const MIN_TOKEN_LEN: usize = 16;

const TOKEN_CHARSET: &[u8] = b"0123456789abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ";

/// Compare two tokens in constant time.
///
/// Tokens of different lengths compare unequal; `ConstantTimeEq` still
/// touches every byte of equal-length inputs.
pub fn token_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

/// Reject tokens shorter than [`MIN_TOKEN_LEN`].
pub fn validate_token(token: &[u8]) -> Result<()> {
    if token.len() < MIN_TOKEN_LEN {
        return Err(Error::Config(format!(
            "token too short: {} bytes, minimum is {}",
            token.len(),
            MIN_TOKEN_LEN
        )));
    }
    Ok(())
}

/// Generate a random alphanumeric token.
///
/// Alphanumeric only, so the result can be pasted into a shell without
/// escaping. Lengths below [`MIN_TOKEN_LEN`] are raised to the minimum.
pub fn generate_token(length: usize) -> String {
    let length = length.max(MIN_TOKEN_LEN);
    let mut rng = rand::thread_rng();

    (0..length)
        .map(|_| TOKEN_CHARSET[rng.gen_range(0..TOKEN_CHARSET.len())] as char)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_eq() {
        assert!(token_eq(b"secret-token-value", b"secret-token-value"));
        assert!(!token_eq(b"secret-token-value", b"secret-token-other"));
        assert!(!token_eq(b"short", b"longer-token"));
        assert!(token_eq(b"", b""));
    }

    #[test]
    fn test_validate_token() {
        assert!(validate_token(b"0123456789abcdef").is_ok());
        assert!(validate_token(b"0123456789abcde").is_err());
        assert!(validate_token(b"").is_err());
    }

    #[test]
    fn test_generate_token_length() {
        assert_eq!(generate_token(16).len(), 16);
        assert_eq!(generate_token(32).len(), 32);

        // Requests below the minimum are raised to it
        assert_eq!(generate_token(4).len(), MIN_TOKEN_LEN);
    }

    #[test]
    fn test_generate_token_charset() {
        let token = generate_token(64);
        assert!(token.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generate_token_unique() {
        assert_ne!(generate_token(32), generate_token(32));
    }
}
