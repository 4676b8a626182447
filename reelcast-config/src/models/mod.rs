pub mod sources;

use std::path::PathBuf;

use reelcast_core::CoreConfig;

/// Fully resolved configuration of one process.
#[derive(Debug, Clone, Default)]
pub struct Config {
    pub core: CoreConfig,
    pub logging: LoggingConfig,
    pub metadata: ConfigMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,jobs::dispatch=info,stream::heartbeat=warn".to_string(),
        }
    }
}

/// Where the configuration came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigMetadata {
    pub config_path: Option<PathBuf>,
    pub env_file_loaded: bool,
}
