//! Token decoding errors.

/// Why an encoded token could not be turned back into its raw form.
#[derive(Debug, thiserror::Error)]
pub enum TokenError {
    /// Nothing to decode.
    #[error("empty token")]
    Empty,

    /// Percent-decoding produced invalid UTF-8.
    #[error("token is not valid percent-encoded UTF-8: {0}")]
    PercentDecode(#[from] std::str::Utf8Error),

    /// Neither base64 alphabet accepted the token.
    #[error("token is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    /// The decoded bytes are not UTF-8.
    #[error("decoded token is not UTF-8")]
    NotUtf8,

    /// The decoded token lacks the issuer prefix.
    #[error("decoded token has an unknown prefix")]
    BadPrefix,
}
