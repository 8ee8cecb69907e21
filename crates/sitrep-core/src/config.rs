//! Layered configuration registry
//!
//! A flat, string-keyed store of typed entries. Every key has a kind, a
//! default, a description and three origins: a CLI flag, an environment
//! variable and an entry in a JSON or TOML file. Resolution precedence is
//! CLI > environment > file > default, independent of load order.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;

use clap::{Arg, ArgAction, ArgMatches, Command};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ConfigError;

/// Default prefix of environment variables
pub const ENV_PREFIX: &str = "SITREP";

/// Declared type of a configuration entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConfigKind {
    Bool,
    Int,
    Uint,
    Float,
    String,
    List,
}

/// A configuration value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConfigValue {
    Bool(bool),
    Int(i64),
    Uint(u64),
    Float(f64),
    String(String),
    List(Vec<String>),
}

impl ConfigValue {
    #[must_use]
    pub fn kind(&self) -> ConfigKind {
        match self {
            ConfigValue::Bool(_) => ConfigKind::Bool,
            ConfigValue::Int(_) => ConfigKind::Int,
            ConfigValue::Uint(_) => ConfigKind::Uint,
            ConfigValue::Float(_) => ConfigKind::Float,
            ConfigValue::String(_) => ConfigKind::String,
            ConfigValue::List(_) => ConfigKind::List,
        }
    }
}

impl fmt::Display for ConfigValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigValue::Bool(v) => write!(f, "{v}"),
            ConfigValue::Int(v) => write!(f, "{v}"),
            ConfigValue::Uint(v) => write!(f, "{v}"),
            ConfigValue::Float(v) => write!(f, "{v}"),
            ConfigValue::String(v) => f.write_str(v),
            ConfigValue::List(v) => f.write_str(&v.join(",")),
        }
    }
}

impl From<bool> for ConfigValue {
    fn from(v: bool) -> Self {
        ConfigValue::Bool(v)
    }
}

impl From<i64> for ConfigValue {
    fn from(v: i64) -> Self {
        ConfigValue::Int(v)
    }
}

impl From<u64> for ConfigValue {
    fn from(v: u64) -> Self {
        ConfigValue::Uint(v)
    }
}

impl From<f64> for ConfigValue {
    fn from(v: f64) -> Self {
        ConfigValue::Float(v)
    }
}

impl From<&str> for ConfigValue {
    fn from(v: &str) -> Self {
        ConfigValue::String(v.to_string())
    }
}

impl From<String> for ConfigValue {
    fn from(v: String) -> Self {
        ConfigValue::String(v)
    }
}

impl From<Vec<String>> for ConfigValue {
    fn from(v: Vec<String>) -> Self {
        ConfigValue::List(v)
    }
}

impl From<&[&str]> for ConfigValue {
    fn from(v: &[&str]) -> Self {
        ConfigValue::List(v.iter().map(ToString::to_string).collect())
    }
}

impl ConfigKind {
    /// Parse textual input (flag or environment variable)
    ///
    /// # Errors
    /// Returns `InvalidValue` when `raw` is not a valid value of this kind.
    pub fn parse(&self, key: &str, raw: &str) -> Result<ConfigValue, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            kind: *self,
            value: raw.to_string(),
        };
        let trimmed = raw.trim();
        match self {
            ConfigKind::Bool => match trimmed.to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(ConfigValue::Bool(true)),
                "0" | "false" | "no" | "off" | "" => Ok(ConfigValue::Bool(false)),
                _ => Err(invalid()),
            },
            ConfigKind::Int => trimmed.parse().map(ConfigValue::Int).map_err(|_| invalid()),
            ConfigKind::Uint => trimmed.parse().map(ConfigValue::Uint).map_err(|_| invalid()),
            ConfigKind::Float => trimmed.parse().map(ConfigValue::Float).map_err(|_| invalid()),
            ConfigKind::String => Ok(ConfigValue::String(raw.to_string())),
            ConfigKind::List => Ok(ConfigValue::List(
                raw.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(ToString::to_string)
                    .collect(),
            )),
        }
    }

    /// Convert a JSON file entry, accepting strings for any kind
    ///
    /// # Errors
    /// Returns `InvalidValue` when the JSON value does not fit this kind.
    pub fn from_json(&self, key: &str, value: &Value) -> Result<ConfigValue, ConfigError> {
        let invalid = || ConfigError::InvalidValue {
            key: key.to_string(),
            kind: *self,
            value: value.to_string(),
        };
        match (self, value) {
            (_, Value::String(raw)) => self.parse(key, raw),
            (ConfigKind::Bool, Value::Bool(v)) => Ok(ConfigValue::Bool(*v)),
            (ConfigKind::Int, Value::Number(n)) => n.as_i64().map(ConfigValue::Int).ok_or_else(invalid),
            (ConfigKind::Uint, Value::Number(n)) => {
                n.as_u64().map(ConfigValue::Uint).ok_or_else(invalid)
            }
            (ConfigKind::Float, Value::Number(n)) => {
                n.as_f64().map(ConfigValue::Float).ok_or_else(invalid)
            }
            (ConfigKind::List, Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::String(s) => Ok(s.clone()),
                    Value::Number(_) | Value::Bool(_) => Ok(item.to_string()),
                    _ => Err(invalid()),
                })
                .collect::<Result<Vec<_>, _>>()
                .map(ConfigValue::List),
            _ => Err(invalid()),
        }
    }
}

/// Types readable with [`ConfigRegistry::get`]
pub trait FromConfigValue: Sized {
    const KIND: ConfigKind;

    fn from_config(value: &ConfigValue) -> Option<Self>;
}

impl FromConfigValue for bool {
    const KIND: ConfigKind = ConfigKind::Bool;

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromConfigValue for i64 {
    const KIND: ConfigKind = ConfigKind::Int;

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Int(v) => Some(*v),
            _ => None,
        }
    }
}

macro_rules! uint_from_config {
    ($($ty:ty),*) => {
        $(
            impl FromConfigValue for $ty {
                const KIND: ConfigKind = ConfigKind::Uint;

                fn from_config(value: &ConfigValue) -> Option<Self> {
                    match value {
                        ConfigValue::Uint(v) => <$ty>::try_from(*v).ok(),
                        _ => None,
                    }
                }
            }
        )*
    };
}

uint_from_config!(u64, u32, u16, u8, usize);

impl FromConfigValue for f64 {
    const KIND: ConfigKind = ConfigKind::Float;

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::Float(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromConfigValue for String {
    const KIND: ConfigKind = ConfigKind::String;

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::String(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromConfigValue for Vec<String> {
    const KIND: ConfigKind = ConfigKind::List;

    fn from_config(value: &ConfigValue) -> Option<Self> {
        match value {
            ConfigValue::List(v) => Some(v.clone()),
            _ => None,
        }
    }
}

/// One declared key with its resolved layers
#[derive(Debug, Clone)]
pub struct ConfigEntry {
    pub key: String,
    pub kind: ConfigKind,
    pub default: ConfigValue,
    pub description: String,
    /// Long CLI flag, without dashes
    pub flag: String,
    /// Environment variable name
    pub env: String,
    file: Option<ConfigValue>,
    env_value: Option<ConfigValue>,
    cli: Option<ConfigValue>,
}

impl ConfigEntry {
    /// Effective value after precedence
    #[must_use]
    pub fn value(&self) -> &ConfigValue {
        self.cli
            .as_ref()
            .or(self.env_value.as_ref())
            .or(self.file.as_ref())
            .unwrap_or(&self.default)
    }

    /// Which layer supplied the effective value
    #[must_use]
    pub fn origin(&self) -> &'static str {
        if self.cli.is_some() {
            "cli"
        } else if self.env_value.is_some() {
            "env"
        } else if self.file.is_some() {
            "file"
        } else {
            "default"
        }
    }
}

/// Flat typed configuration store
#[derive(Debug, Clone)]
pub struct ConfigRegistry {
    env_prefix: String,
    entries: BTreeMap<String, ConfigEntry>,
}

impl Default for ConfigRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::with_env_prefix(ENV_PREFIX)
    }

    #[must_use]
    pub fn with_env_prefix(prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: prefix.into(),
            entries: BTreeMap::new(),
        }
    }

    /// Declare a key; its kind is the kind of `default`
    ///
    /// # Errors
    /// Returns `DuplicateKey` if the key already exists.
    pub fn define(
        &mut self,
        key: impl Into<String>,
        default: impl Into<ConfigValue>,
        description: impl Into<String>,
    ) -> Result<(), ConfigError> {
        let key = key.into();
        if self.entries.contains_key(&key) {
            return Err(ConfigError::DuplicateKey(key));
        }
        let default = default.into();
        let entry = ConfigEntry {
            kind: default.kind(),
            flag: flag_name(&key),
            env: env_name(&self.env_prefix, &key),
            key: key.clone(),
            default,
            description: description.into(),
            file: None,
            env_value: None,
            cli: None,
        };
        self.entries.insert(key, entry);
        Ok(())
    }

    #[must_use]
    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Declared entries in key order
    pub fn entries(&self) -> impl Iterator<Item = &ConfigEntry> {
        self.entries.values()
    }

    /// Typed read of the effective value
    ///
    /// # Errors
    /// Returns `UnknownKey` for undeclared keys and `TypeMismatch` when `T`
    /// does not match the declared kind.
    pub fn get<T: FromConfigValue>(&self, key: &str) -> Result<T, ConfigError> {
        let entry = self
            .entries
            .get(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))?;
        let mismatch = || ConfigError::TypeMismatch {
            key: key.to_string(),
            expected: T::KIND,
            actual: entry.kind,
        };
        if entry.kind != T::KIND {
            return Err(mismatch());
        }
        T::from_config(entry.value()).ok_or_else(|| ConfigError::InvalidValue {
            key: key.to_string(),
            kind: entry.kind,
            value: entry.value().to_string(),
        })
    }

    /// Set the highest-precedence (CLI) layer programmatically
    ///
    /// # Errors
    /// Returns `UnknownKey` or `TypeMismatch`.
    pub fn set(&mut self, key: &str, value: impl Into<ConfigValue>) -> Result<(), ConfigError> {
        let value = value.into();
        let entry = self.entry_mut(key)?;
        if value.kind() != entry.kind {
            return Err(ConfigError::TypeMismatch {
                key: key.to_string(),
                expected: entry.kind,
                actual: value.kind(),
            });
        }
        entry.cli = Some(value);
        Ok(())
    }

    fn entry_mut(&mut self, key: &str) -> Result<&mut ConfigEntry, ConfigError> {
        self.entries
            .get_mut(key)
            .ok_or_else(|| ConfigError::UnknownKey(key.to_string()))
    }

    // ========================================================================
    // Environment
    // ========================================================================

    /// Read every declared key's variable from the process environment
    ///
    /// # Errors
    /// Returns `InvalidValue` for unparsable variables.
    pub fn load_env(&mut self) -> Result<(), ConfigError> {
        self.load_env_from(std::env::vars())
    }

    /// Read variables from an explicit list
    ///
    /// Variables that match no declared key are ignored.
    ///
    /// # Errors
    /// Returns `InvalidValue` for unparsable variables.
    pub fn load_env_from(
        &mut self,
        vars: impl IntoIterator<Item = (String, String)>,
    ) -> Result<(), ConfigError> {
        let vars: BTreeMap<String, String> = vars.into_iter().collect();
        for entry in self.entries.values_mut() {
            if let Some(raw) = vars.get(&entry.env) {
                entry.env_value = Some(entry.kind.parse(&entry.key, raw)?);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Files
    // ========================================================================

    /// Load a JSON or TOML file, chosen by extension (JSON otherwise)
    ///
    /// # Errors
    /// Returns `File` if the file cannot be read or parsed, `UnknownKey` for
    /// keys that were never declared.
    pub fn load_file(&mut self, path: &Path) -> Result<(), ConfigError> {
        let file_error = |message: String| ConfigError::File {
            path: path.to_path_buf(),
            message,
        };
        let text = std::fs::read_to_string(path).map_err(|e| file_error(e.to_string()))?;
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let value = if is_toml {
            let table: toml::Table = toml::from_str(&text).map_err(|e| file_error(e.to_string()))?;
            serde_json::to_value(table).map_err(|e| file_error(e.to_string()))?
        } else {
            serde_json::from_str(&text).map_err(|e| file_error(e.to_string()))?
        };
        self.load_json_value(&value)
    }

    /// Load a JSON document
    ///
    /// # Errors
    /// See [`ConfigRegistry::load_file`].
    pub fn load_json_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let value: Value = serde_json::from_str(text).map_err(|e| ConfigError::File {
            path: "<inline>".into(),
            message: e.to_string(),
        })?;
        self.load_json_value(&value)
    }

    /// Load a TOML document
    ///
    /// # Errors
    /// See [`ConfigRegistry::load_file`].
    pub fn load_toml_str(&mut self, text: &str) -> Result<(), ConfigError> {
        let file_error = |message: String| ConfigError::File {
            path: "<inline>".into(),
            message,
        };
        let table: toml::Table = toml::from_str(text).map_err(|e| file_error(e.to_string()))?;
        let value = serde_json::to_value(table).map_err(|e| file_error(e.to_string()))?;
        self.load_json_value(&value)
    }

    /// Load an object; nested objects are flattened with `.`
    ///
    /// Unknown keys are rejected before any value is applied.
    ///
    /// # Errors
    /// Returns `UnknownKey` or `InvalidValue`.
    pub fn load_json_value(&mut self, value: &Value) -> Result<(), ConfigError> {
        let mut flat = BTreeMap::new();
        flatten("", value, &mut flat);

        let mut parsed = Vec::with_capacity(flat.len());
        for (key, raw) in &flat {
            let entry = self
                .entries
                .get(key)
                .ok_or_else(|| ConfigError::UnknownKey(key.clone()))?;
            parsed.push((key.clone(), entry.kind.from_json(key, raw)?));
        }
        for (key, value) in parsed {
            self.entry_mut(&key)?.file = Some(value);
        }
        Ok(())
    }

    // ========================================================================
    // CLI
    // ========================================================================

    /// Add one long flag per key to `command`
    #[must_use]
    pub fn augment_command(&self, mut command: Command) -> Command {
        for entry in self.entries.values() {
            let help = format!("{} [default: {}]", entry.description, entry.default);
            let mut arg = Arg::new(entry.key.clone())
                .long(entry.flag.clone())
                .help(help)
                .action(ArgAction::Set)
                .value_name(value_name(entry.kind));
            if entry.kind == ConfigKind::Bool {
                arg = arg
                    .num_args(0..=1)
                    .require_equals(true)
                    .default_missing_value("true");
            }
            command = command.arg(arg);
        }
        command
    }

    /// Read back flags added by [`ConfigRegistry::augment_command`]
    ///
    /// # Errors
    /// Returns `InvalidValue` for unparsable flag values.
    pub fn apply_matches(&mut self, matches: &ArgMatches) -> Result<(), ConfigError> {
        for entry in self.entries.values_mut() {
            let raw = matches
                .try_get_one::<String>(&entry.key)
                .ok()
                .flatten();
            if let Some(raw) = raw {
                entry.cli = Some(entry.kind.parse(&entry.key, raw)?);
            }
        }
        Ok(())
    }

    // ========================================================================
    // Output
    // ========================================================================

    /// Effective configuration as a flat JSON object
    #[must_use]
    pub fn to_json(&self) -> Value {
        let map = self
            .entries
            .values()
            .map(|entry| {
                let value = serde_json::to_value(entry.value()).unwrap_or(Value::Null);
                (entry.key.clone(), value)
            })
            .collect();
        Value::Object(map)
    }
}

// ============================================================================
// Global keys
// ============================================================================

pub const LOG_LEVEL: &str = "log-level";
pub const LOG_FORMAT: &str = "log-format";
pub const IGNORE_MISSING_DEPS: &str = "ignore-missing-deps";
pub const PARALLEL_MODULES: &str = "parallel-modules";
pub const BACKEND_CONCURRENCY: &str = "backend-concurrency";
pub const STORE: &str = "store";
pub const DB: &str = "db";
pub const NO_MIGRATE: &str = "no-migrate";
pub const AGENT: &str = "agent";
pub const RUN_TIMEOUT: &str = "run-timeout";

/// Declare the keys every run reads
///
/// # Errors
/// Returns `DuplicateKey` if called twice on the same registry.
pub fn define_core_keys(config: &mut ConfigRegistry) -> Result<(), ConfigError> {
    config.define(LOG_LEVEL, 4u64, "Log level, 0 (panic) to 5 (debug)")?;
    config.define(LOG_FORMAT, "text", "Log format: text or json")?;
    config.define(
        IGNORE_MISSING_DEPS,
        false,
        "Skip modules whose dependencies are missing instead of failing",
    )?;
    config.define(
        PARALLEL_MODULES,
        false,
        "Run independent modules of the same dependency layer concurrently",
    )?;
    config.define(BACKEND_CONCURRENCY, 1u64, "Maximum backend writes in flight")?;
    config.define(STORE, "memory", "Inventory store: memory or sqlite")?;
    config.define(DB, "", "SQLite database path (in-memory when empty)")?;
    config.define(NO_MIGRATE, false, "Do not apply database migrations on open")?;
    config.define(AGENT, "", "Agent id override (uuid)")?;
    config.define(RUN_TIMEOUT, 0u64, "Cancel the run after this many seconds, 0 for none")?;
    Ok(())
}

fn flatten(prefix: &str, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) => {
            for (key, child) in map {
                let key = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{prefix}.{key}")
                };
                flatten(&key, child, out);
            }
        }
        leaf => {
            out.insert(prefix.to_string(), leaf.clone());
        }
    }
}

/// `http.url` -> `http-url`
fn flag_name(key: &str) -> String {
    key.replace('.', "-")
}

/// `http.url` -> `SITREP_HTTP_URL`
fn env_name(prefix: &str, key: &str) -> String {
    let key = key.replace(['.', '-'], "_").to_ascii_uppercase();
    if prefix.is_empty() {
        key
    } else {
        format!("{prefix}_{key}")
    }
}

fn value_name(kind: ConfigKind) -> &'static str {
    match kind {
        ConfigKind::Bool => "BOOL",
        ConfigKind::Int => "INT",
        ConfigKind::Uint => "UINT",
        ConfigKind::Float => "FLOAT",
        ConfigKind::String => "STRING",
        ConfigKind::List => "LIST",
    }
}
