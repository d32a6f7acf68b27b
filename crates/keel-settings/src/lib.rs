//! # keel-settings
//!
//! Settings are loaded from three layers (in priority order):
//! 1. **Compiled defaults**: [`KeelSettings::default()`]
//! 2. **Settings file**: `~/.keel/settings.json` or an explicit path (deep-merged over defaults)
//! 3. **Environment variables**: `KEEL_*` overrides (highest priority)
//!
//! There is no process-wide singleton: the binary loads settings once at
//! startup and hands them to the components it constructs.

#![deny(unsafe_code)]

pub mod errors;
pub mod loader;
pub mod types;

pub use errors::{Result, SettingsError};
pub use loader::{apply_env_overrides, deep_merge, load_settings, load_settings_from_path, settings_path};
pub use types::*;
