//! Configuration module for Quiver.
//!
//! Handles compile defaults, the model cache switch, and connections.

mod settings;

pub use settings::{
    expand_env_vars, CacheSettings, CompileSettings, ConnectionSettings, Settings, SettingsError,
};
