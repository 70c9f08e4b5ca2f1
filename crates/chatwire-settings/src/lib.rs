//! # chatwire-settings
//!
//! Configuration for the chatwire server, loaded from three layers (in
//! priority order):
//! 1. **Compiled defaults**: [`ChatwireSettings::default()`]
//! 2. **Settings file**: `$CHATWIRE_SETTINGS` or `~/.chatwire/settings.json`
//!    (deep-merged over defaults)
//! 3. **Environment variables**: `CHATWIRE_*` overrides (highest priority)
//!
//! Settings are loaded once by the binary and passed down explicitly; no
//! crate reads a process-wide settings global.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, apply_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
