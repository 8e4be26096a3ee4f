use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

/// Resolve `<service>/config` whether the process runs from the workspace
/// root or from inside the service directory.
pub fn configuration_directory(base_path: &Path, service_dir: &str) -> PathBuf {
    if base_path.ends_with(service_dir) {
        base_path.join("config")
    } else {
        base_path.join(service_dir).join("config")
    }
}

/// Load settings from `config/base.yaml`, overridden by `APP_`-prefixed
/// environment variables (`APP_SERVER__PORT=9000`).
pub fn load_settings<T: DeserializeOwned>(service_dir: &str) -> Result<T, config::ConfigError> {
    dotenvy::dotenv().ok();

    let base_path = std::env::current_dir()
        .map_err(|e| config::ConfigError::Message(format!("cannot read current dir: {}", e)))?;
    let configuration_directory = configuration_directory(&base_path, service_dir);

    let settings = config::Config::builder()
        .add_source(config::File::from(configuration_directory.join("base.yaml")).required(true))
        .add_source(
            config::Environment::with_prefix("APP")
                .prefix_separator("_")
                .separator("__"),
        )
        .build()?;

    settings.try_deserialize::<T>()
}
