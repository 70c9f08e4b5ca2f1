//! Wire form of bearer tokens.
//!
//! A raw token is `token_<uuid>_<millis>`. On the wire it travels as
//! unpadded URL-safe base64 so it survives query strings and cookies
//! without escaping. Decoding is lenient: the input may be percent-encoded
//! and may use the standard base64 alphabet with padding.

use base64::Engine as _;
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use percent_encoding::percent_decode_str;

use crate::errors::TokenError;

/// Prefix every raw token starts with.
pub const TOKEN_PREFIX: &str = "token_";

/// Encode a raw token for transport.
pub fn encode_token(raw: &str) -> String {
    URL_SAFE_NO_PAD.encode(raw.as_bytes())
}

/// Recover the raw token from its transported form.
pub fn decode_token(encoded: &str) -> Result<String, TokenError> {
    let encoded = encoded.trim();
    if encoded.is_empty() {
        return Err(TokenError::Empty);
    }

    let unescaped = percent_decode_str(encoded).decode_utf8()?;
    let bytes = match URL_SAFE_NO_PAD.decode(unescaped.trim_end_matches('=')) {
        Ok(bytes) => bytes,
        Err(_) => STANDARD.decode(unescaped.as_bytes())?,
    };
    let raw = String::from_utf8(bytes).map_err(|_| TokenError::NotUtf8)?;

    if !raw.starts_with(TOKEN_PREFIX) {
        return Err(TokenError::BadPrefix);
    }
    Ok(raw)
}

/// Whether `encoded` decodes to something shaped like a token, without
/// consulting any store.
pub fn is_token_format_valid(encoded: &str) -> bool {
    decode_token(encoded).is_ok()
}
