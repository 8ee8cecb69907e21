//! Print the payload on standard output

use async_trait::async_trait;
use sitrep_api::Payload;
use sitrep_core::{Backend, BackendError, ConfigError, ConfigRegistry, Configurable};
use tokio::io::{AsyncWriteExt, stdout};
use tracing::debug;

use crate::format::Format;

pub const STDOUT: &str = "stdout";

const FORMAT: &str = "stdout.format";
const PRETTY: &str = "stdout.pretty";

/// Writes the encoded payload followed by a newline to stdout
#[derive(Debug)]
pub struct StdoutBackend {
    format: Format,
    pretty: bool,
}

impl Default for StdoutBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl StdoutBackend {
    #[must_use]
    pub fn new() -> Self {
        Self {
            format: Format::Json,
            pretty: true,
        }
    }
}

#[async_trait]
impl Backend for StdoutBackend {
    fn name(&self) -> &'static str {
        STDOUT
    }

    async fn init(&mut self) -> Result<(), BackendError> {
        debug!(format = %self.format, "stdout backend ready");
        Ok(())
    }

    async fn write(&self, payload: &Payload) -> Result<(), BackendError> {
        let mut encoded = self.format.encode(payload, self.pretty)?;
        if encoded.last() != Some(&b'\n') {
            encoded.push(b'\n');
        }
        let mut out = stdout();
        out.write_all(&encoded).await?;
        out.flush().await?;
        Ok(())
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for StdoutBackend {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(FORMAT, "json", "Payload format on stdout: json or yaml")?;
        config.define(PRETTY, true, "Indent JSON printed on stdout")?;
        Ok(())
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        self.format = Format::from_option(FORMAT, &config.get::<String>(FORMAT)?)?;
        self.pretty = config.get(PRETTY)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_configured_yaml() {
        let mut backend = StdoutBackend::new();
        let mut config = ConfigRegistry::new();
        backend.bind(&mut config).unwrap();
        config.set(FORMAT, "yaml").unwrap();
        backend.configure(&config).unwrap();
        assert_eq!(backend.format, Format::Yaml);

        backend.init().await.unwrap();
        backend.write(&Payload::default()).await.unwrap();
    }

    #[test]
    fn test_rejects_unknown_format() {
        let mut backend = StdoutBackend::new();
        let mut config = ConfigRegistry::new();
        backend.bind(&mut config).unwrap();
        config.set(FORMAT, "csv").unwrap();
        assert!(backend.configure(&config).is_err());
    }
}
