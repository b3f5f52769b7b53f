use std::path::{Path, PathBuf};

use thiserror::Error;

use super::Config;

const DEFAULT_CONFIG_LOCATIONS: &[&str] = &["wa-hub.toml", "config/wa-hub.toml"];
const ENV_PREFIX: &str = "WA_HUB";

#[derive(Debug, Error)]
pub enum ConfigLoadError {
    #[error("failed to build layered config: {0}")]
    Build(#[from] config::ConfigError),
}

/// Load config from defaults, an optional TOML file (explicit `config_path`
/// or the first of `DEFAULT_CONFIG_LOCATIONS` that exists), then
/// `WA_HUB_*` environment variables, in ascending precedence. CLI flags are
/// applied by the caller afterward (`main.rs`), since they need `clap`'s
/// already-parsed `Args` rather than another config-crate source.
pub fn load(config_path: Option<&Path>) -> Result<Config, ConfigLoadError> {
    let defaults = Config::default();
    let defaults_value = config::Config::try_from(&defaults)?;

    let mut builder = config::Config::builder().add_source(defaults_value);

    let file_path = config_path
        .map(PathBuf::from)
        .or_else(|| {
            DEFAULT_CONFIG_LOCATIONS
                .iter()
                .map(PathBuf::from)
                .find(|p| p.exists())
        });
    if let Some(path) = file_path {
        builder = builder.add_source(config::File::from(path).required(false));
    }

    builder = builder.add_source(
        config::Environment::with_prefix(ENV_PREFIX)
            .try_parsing(true)
            .separator("__")
            .list_separator(","),
    );

    builder.build()?.try_deserialize()
}
