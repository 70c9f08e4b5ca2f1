//! # chatwire-auth
//!
//! The credential capability used by the WebSocket handshake and the
//! `AUTH` message: [`TokenValidator::validate`] turns an opaque bearer token
//! into a [`Principal`], or nothing.
//!
//! [`InMemoryTokenStore`] is the bundled implementation. It issues tokens of
//! the form `base64url("token_<uuid>_<millis>")` with a fixed lifetime and
//! evicts expired entries on lookup. The store is constructed once by the
//! application and shared by reference; there is no process-wide token map.

#![deny(unsafe_code)]

pub mod errors;
pub mod store;
pub mod token;

pub use chatwire_core::Principal;
pub use errors::TokenError;
pub use store::{InMemoryTokenStore, TokenRecord};
pub use token::{TOKEN_PREFIX, decode_token, encode_token, is_token_format_valid};

/// Validates bearer credentials.
///
/// Implementations must be cheap to call from any connection task.
pub trait TokenValidator: Send + Sync {
    /// Resolve `token` to the identity it was issued for, if it is known
    /// and unexpired.
    fn validate(&self, token: &str) -> Option<Principal>;
}

impl<T: TokenValidator + ?Sized> TokenValidator for std::sync::Arc<T> {
    fn validate(&self, token: &str) -> Option<Principal> {
        (**self).validate(token)
    }
}
