//! Configuration for Reelcast processes.
//!
//! Resolves the core's runtime configuration from built-in defaults, an
//! optional TOML file, a `.env` file and the process environment (in that
//! order of precedence), applies guard rails, and installs the tracing
//! subscriber. The resulting [`Config::core`] feeds
//! `reelcast_core::Runtime::connect`.

pub mod loader;
pub mod models;
pub mod telemetry;
pub mod util;
pub mod validation;

pub use loader::{ConfigLoad, ConfigLoader, ConfigLoaderOptions, error::ConfigLoadError};
pub use models::{
    Config, ConfigMetadata, LoggingConfig,
    sources::{EnvConfig, FileConfig},
};
pub use validation::{ConfigGuardRailError, ConfigWarning, ConfigWarnings};
