//! Account token validation and log-safe masking.
//!
//! Tokens end up inside backend URL paths, so anything that would change the
//! shape of the path is rejected before a session starts.

use crate::error::LinkError;

/// Characters that would alter the request path if interpolated.
const PATH_BREAKING: &[char] = &['/', '?', '#'];

/// Validate an account token. Returns the trimmed token on success.
pub fn validate_token(token: &str) -> Result<&str, LinkError> {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return Err(LinkError::InvalidToken("token is empty".into()));
    }
    if let Some(c) = trimmed
        .chars()
        .find(|c| c.is_whitespace() || c.is_control() || PATH_BREAKING.contains(c))
    {
        return Err(LinkError::InvalidToken(format!(
            "token contains forbidden character {c:?}"
        )));
    }
    Ok(trimmed)
}

/// Render a token as `first8...last4` for logs and compact displays.
///
/// Tokens of 12 characters or fewer are fully masked.
pub fn mask_token(token: &str) -> String {
    let chars: Vec<char> = token.chars().collect();
    if chars.len() <= 12 {
        return "*".repeat(chars.len().max(3));
    }
    let head: String = chars[..8].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{head}...{tail}")
}
