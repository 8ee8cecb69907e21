//! Write the payload to a file

use std::path::PathBuf;

use async_trait::async_trait;
use sitrep_api::Payload;
use sitrep_core::{Backend, BackendError, ConfigError, ConfigRegistry, Configurable};
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::format::Format;

pub const FILE: &str = "file";

const PATH: &str = "file.path";
const FORMAT: &str = "file.format";
const PRETTY: &str = "file.pretty";

const DEFAULT_PATH: &str = "situation.json";

/// Truncates the target on `init` and writes the encoded payload on `write`
#[derive(Debug)]
pub struct FileBackend {
    path: PathBuf,
    format: Format,
    pretty: bool,
    file: Mutex<Option<File>>,
}

impl Default for FileBackend {
    fn default() -> Self {
        Self::new(DEFAULT_PATH)
    }
}

impl FileBackend {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            format: Format::Json,
            pretty: false,
            file: Mutex::new(None),
        }
    }

    #[must_use]
    pub fn with_format(mut self, format: Format) -> Self {
        self.format = format;
        self
    }
}

#[async_trait]
impl Backend for FileBackend {
    fn name(&self) -> &'static str {
        FILE
    }

    async fn init(&mut self) -> Result<(), BackendError> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent).await?;
        }
        let file = File::create(&self.path).await?;
        *self.file.get_mut() = Some(file);
        debug!(path = %self.path.display(), "output file opened");
        Ok(())
    }

    async fn write(&self, payload: &Payload) -> Result<(), BackendError> {
        let encoded = self.format.encode(payload, self.pretty)?;
        let mut guard = self.file.lock().await;
        let file = guard.as_mut().ok_or(BackendError::NotInitialized)?;
        file.write_all(&encoded).await?;
        file.flush().await?;
        info!(path = %self.path.display(), bytes = encoded.len(), "payload written");
        Ok(())
    }

    async fn close(&mut self) -> Result<(), BackendError> {
        if let Some(file) = self.file.get_mut().take() {
            file.sync_all().await?;
        }
        Ok(())
    }

    fn as_configurable(&mut self) -> Option<&mut dyn Configurable> {
        Some(self)
    }
}

impl Configurable for FileBackend {
    fn bind(&self, config: &mut ConfigRegistry) -> Result<(), ConfigError> {
        config.define(PATH, DEFAULT_PATH, "Output file path")?;
        config.define(FORMAT, "json", "Output file format: json or yaml")?;
        config.define(PRETTY, false, "Indent JSON written to the file")?;
        Ok(())
    }

    fn configure(&mut self, config: &ConfigRegistry) -> Result<(), ConfigError> {
        self.path = PathBuf::from(config.get::<String>(PATH)?);
        self.format = Format::from_option(FORMAT, &config.get::<String>(FORMAT)?)?;
        self.pretty = config.get(PRETTY)?;
        Ok(())
    }
}
