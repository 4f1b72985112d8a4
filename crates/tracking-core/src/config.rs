use std::{
    collections::{HashMap, hash_map::Iter},
    fmt::Display,
    str::FromStr,
};

use thiserror::Error;

/// Name of the configuration section read by the tracking engine.
pub const TRACKING_SECTION: &str = "tracking";

/// Process tables are created with room for this many entries.
pub const DEFAULT_TABLE_SIZE: usize = 8192;

/// Executables whose process name starts with one of these are flagged as
/// interpreters.
pub const DEFAULT_INTERPRETERS: [&str; 19] = [
    "bash", "sh", "csh", "zsh", "ksh", "perl", "python", "ruby", "java", "js", "node", "firefox",
    "chrome", "lua", "php", "tcl", "dash", "pwsh", "env",
];

/// Raw key/value configuration of one section
#[derive(Debug, Clone, Default)]
pub struct ModuleConfig {
    inner: HashMap<String, String>,
}

#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    #[error("field {field} is required")]
    RequiredValue { field: String },
    #[error("{value} is not a valid value for field {field}: {err}")]
    InvalidValue {
        field: String,
        value: String,
        err: String,
    },
}

impl ModuleConfig {
    pub fn insert(&mut self, key: String, value: String) -> Option<String> {
        self.inner.insert(key, value)
    }

    pub fn get_raw(&self, config_name: &str) -> Option<&str> {
        self.inner.get(config_name).map(String::as_str)
    }

    pub fn required<T>(&self, config_name: &str) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        match self.inner.get(config_name) {
            None => Err(ConfigError::RequiredValue {
                field: config_name.to_string(),
            }),
            Some(value) => parse(value, config_name),
        }
    }

    pub fn optional<T>(&self, config_name: &str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .map(|value| parse(value, config_name))
            .transpose()
    }

    /// Typed value, or `default` when the field is missing.
    pub fn with_default<T>(&self, config_name: &str, default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        Ok(self.optional(config_name)?.unwrap_or(default))
    }

    /// Comma separated list of values. Empty when the field is missing.
    pub fn get_list<T>(&self, config_name: &str) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        self.inner
            .get(config_name)
            .iter()
            .flat_map(|config| config.split(','))
            .filter(|item| !item.is_empty())
            .map(|item| parse(item.trim(), config_name))
            .collect()
    }

    pub fn get_list_with_default<T>(
        &self,
        config_name: &str,
        default: Vec<T>,
    ) -> Result<Vec<T>, ConfigError>
    where
        T: FromStr,
        <T as FromStr>::Err: Display,
    {
        if self.inner.contains_key(config_name) {
            self.get_list(config_name)
        } else {
            Ok(default)
        }
    }

    pub fn iter(&self) -> Iter<'_, String, String> {
        self.inner.iter()
    }
}

fn parse<T>(value: &str, config_name: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    <T as FromStr>::Err: Display,
{
    T::from_str(value).map_err(|err| ConfigError::InvalidValue {
        field: config_name.to_string(),
        value: value.to_string(),
        err: err.to_string(),
    })
}

/// Typed configuration of the tracking engine.
#[derive(Debug, Clone)]
pub struct TrackerConfig {
    /// Initial capacity of the process and file tables
    pub table_size: usize,
    /// Process names considered interpreters
    pub interpreters: Vec<String>,
    /// When false, start events carry no user id
    pub report_process_user: bool,
    /// Log every entry still alive when the tracker shuts down
    pub print_proc_on_delete: bool,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            table_size: DEFAULT_TABLE_SIZE,
            interpreters: DEFAULT_INTERPRETERS.iter().map(|s| s.to_string()).collect(),
            report_process_user: false,
            print_proc_on_delete: false,
        }
    }
}

impl TryFrom<&ModuleConfig> for TrackerConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        let defaults = TrackerConfig::default();
        Ok(TrackerConfig {
            table_size: config.with_default("table_size", defaults.table_size)?,
            interpreters: config.get_list_with_default("interpreters", defaults.interpreters)?,
            report_process_user: config
                .with_default("report_process_user", defaults.report_process_user)?,
            print_proc_on_delete: config
                .with_default("print_proc_on_delete", defaults.print_proc_on_delete)?,
        })
    }
}

impl TrackerConfig {
    /// Does the process name of `path` start with an interpreter name?
    /// This matches `python3` or `perl5`, but not every name containing
    /// `sh` (like `ssh`).
    pub fn is_interpreter(&self, path: &str) -> bool {
        let name = proc_name(path);
        self.interpreters
            .iter()
            .any(|interpreter| name.starts_with(interpreter.as_str()))
    }
}

/// Last component of an executable path.
pub fn proc_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}
