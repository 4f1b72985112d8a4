use std::{collections::HashMap, fs::File, path::PathBuf};

use anyhow::{Context, Result, bail};
use tracking_core::config::{ModuleConfig, TRACKING_SECTION, TrackerConfig};

const DEFAULT_CONFIG_FILE: &str = "/var/lib/ec-sensor/ec-sensor.ini";

/// Sensor configuration, one [`ModuleConfig`] per section.
///
/// It is backed by an `INI` file from which parses the data on its creation.
#[derive(Debug, Clone, Default)]
pub struct SensorConfig {
    configs: HashMap<String, ModuleConfig>,
}

impl SensorConfig {
    /// Construct a new [`SensorConfig`] using the default file, created
    /// empty if missing.
    pub fn new() -> Result<Self> {
        let config_file = PathBuf::from(DEFAULT_CONFIG_FILE);
        if !config_file.exists() {
            if let Some(prefix) = config_file.parent() {
                std::fs::create_dir_all(prefix)
                    .with_context(|| format!("Error creating {prefix:?}"))?;
            }
            File::create(&config_file)
                .with_context(|| format!("Error creating {config_file:?}"))?;
        }
        Self::from_config_file(config_file)
    }

    /// Construct a new [`SensorConfig`] using a custom file.
    pub fn with_custom_file(config_file: &str) -> Result<Self> {
        let config_file = PathBuf::from(config_file);
        if !config_file.exists() {
            bail!("Configuration file {} not found", config_file.display());
        }
        Self::from_config_file(config_file)
    }

    fn from_config_file(config_file: PathBuf) -> Result<Self> {
        let conf = ini::Ini::load_from_file(&config_file)
            .with_context(|| format!("Error loading configuration from {config_file:?}"))?;
        Ok(Self::from_ini(&conf))
    }

    pub fn from_ini(conf: &ini::Ini) -> Self {
        let mut configs: HashMap<String, ModuleConfig> = HashMap::new();

        for (section, prop) in conf {
            if let Some(section) = section {
                let mod_config = configs.entry(section.to_string()).or_default();
                for (key, value) in prop.iter() {
                    log::debug!("{}.{}={}", section, key, value);
                    mod_config.insert(key.to_string(), value.to_string());
                }
            }
        }

        Self { configs }
    }

    /// Get the configuration of a section, if present in the file.
    pub fn get_module_config(&self, module: &str) -> Option<ModuleConfig> {
        self.configs.get(module).cloned()
    }

    /// Typed engine configuration from the `[tracking]` section. A missing
    /// section means defaults.
    pub fn tracker_config(&self) -> Result<TrackerConfig> {
        let section = self.get_module_config(TRACKING_SECTION).unwrap_or_default();
        TrackerConfig::try_from(&section)
            .with_context(|| format!("Invalid [{TRACKING_SECTION}] configuration"))
    }
}
