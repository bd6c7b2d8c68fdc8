//! Configuration module for ffbin.
//!
//! Manages the JSON settings file and its environment overrides.

mod settings;

pub use settings::{
    MissingFilePolicy, Settings, DEFAULT_ALLOWED_DOMAINS, DEFAULT_DOWNLOAD_TIMEOUT_SECS,
};
