//! Persistence layer for the spec coordination engine.
//!
//! Owns the on-disk data model (`collaboration.json`, `lifecycle.json`),
//! the atomic file-backed [`store::MetadataStore`], and configuration
//! loading for `.sce/config/`.

pub mod config;
pub mod models;
pub mod store;

pub use config::{
    ConfigError, MultiAgentConfig, OrchestratorConfig, OrchestratorOverrides, RateLimitProfile,
    RateLimitSettings,
};
pub use store::{MetadataStore, StoreError};
