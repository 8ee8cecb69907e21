//! Payload encodings shared by the backends

use std::fmt;
use std::str::FromStr;

use sitrep_api::Payload;
use sitrep_core::{BackendError, ConfigError, ConfigKind};

/// Serialization format of a delivered payload
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Format {
    #[default]
    Json,
    Yaml,
}

impl Format {
    /// Parse the value of a `<backend>.format` option
    ///
    /// # Errors
    /// Returns `InvalidValue` naming `key` for anything but json or yaml.
    pub fn from_option(key: &str, value: &str) -> Result<Self, ConfigError> {
        value.parse().map_err(|()| ConfigError::InvalidValue {
            key: key.to_string(),
            kind: ConfigKind::String,
            value: value.to_string(),
        })
    }

    #[must_use]
    pub fn content_type(&self) -> &'static str {
        match self {
            Format::Json => "application/json",
            Format::Yaml => "application/yaml",
        }
    }

    /// Encode the payload, JSON optionally indented
    ///
    /// # Errors
    /// Returns `Serialize` if the payload cannot be encoded.
    pub fn encode(&self, payload: &Payload, pretty: bool) -> Result<Vec<u8>, BackendError> {
        let encoded = match self {
            Format::Json if pretty => serde_json::to_vec_pretty(payload).map_err(serialize)?,
            Format::Json => serde_json::to_vec(payload).map_err(serialize)?,
            Format::Yaml => serde_yaml::to_string(payload)
                .map_err(serialize)?
                .into_bytes(),
        };
        Ok(encoded)
    }
}

fn serialize(err: impl fmt::Display) -> BackendError {
    BackendError::Serialize(err.to_string())
}

impl FromStr for Format {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "json" => Ok(Format::Json),
            "yaml" | "yml" => Ok(Format::Yaml),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Json => f.write_str("json"),
            Format::Yaml => f.write_str("yaml"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_format_option() {
        assert_eq!(Format::from_option("file.format", "YAML").unwrap(), Format::Yaml);
        assert!(matches!(
            Format::from_option("file.format", "xml"),
            Err(ConfigError::InvalidValue { key, .. }) if key == "file.format"
        ));
    }

    #[test]
    fn test_encode_empty_payload() {
        let payload = Payload::default();
        let json: serde_json::Value =
            serde_json::from_slice(&Format::Json.encode(&payload, false).unwrap()).unwrap();
        assert!(json["machines"].as_array().unwrap().is_empty());

        let yaml = String::from_utf8(Format::Yaml.encode(&payload, false).unwrap()).unwrap();
        assert!(yaml.contains("machines: []"));
    }
}
