//! Persistent agent id

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use eyre::WrapErr;
use sitrep_core::config::AGENT;
use sitrep_core::{ConfigError, ConfigKind, ConfigRegistry};
use tracing::{debug, info, warn};
use uuid::Uuid;

const ID_FILE: &str = "agent-id";

/// `<data dir>/sitrep/agent-id`
#[must_use]
pub fn default_path() -> Option<PathBuf> {
    dirs::data_dir().map(|dir| dir.join("sitrep").join(ID_FILE))
}

/// The `agent` override if set, otherwise the persisted id
///
/// # Errors
/// Returns an error for a malformed override or an unreadable id file.
pub fn resolve(config: &ConfigRegistry) -> eyre::Result<Uuid> {
    let raw: String = config.get(AGENT)?;
    if !raw.is_empty() {
        return parse_override(&raw).map_err(Into::into);
    }
    match default_path() {
        Some(path) => load_or_create(&path),
        None => {
            warn!("no data directory, using a temporary agent id");
            Ok(Uuid::new_v4())
        }
    }
}

fn parse_override(raw: &str) -> Result<Uuid, ConfigError> {
    Uuid::parse_str(raw.trim()).map_err(|_| ConfigError::InvalidValue {
        key: AGENT.to_string(),
        kind: ConfigKind::String,
        value: raw.to_string(),
    })
}

/// Read the id stored at `path`, generating and storing one if absent
///
/// # Errors
/// Returns an error if the file cannot be read, parsed or written.
pub fn load_or_create(path: &Path) -> eyre::Result<Uuid> {
    match fs::read_to_string(path) {
        Ok(content) => {
            let id = Uuid::parse_str(content.trim())
                .wrap_err_with(|| format!("malformed agent id in {}", path.display()))?;
            debug!(%id, path = %path.display(), "agent id loaded");
            Ok(id)
        }
        Err(e) if e.kind() == ErrorKind::NotFound => {
            let id = Uuid::new_v4();
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .wrap_err_with(|| format!("cannot create {}", parent.display()))?;
            }
            fs::write(path, format!("{id}\n"))
                .wrap_err_with(|| format!("cannot write {}", path.display()))?;
            info!(%id, path = %path.display(), "new agent id generated");
            Ok(id)
        }
        Err(e) => Err(e).wrap_err_with(|| format!("cannot read {}", path.display())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::define_core_keys;

    #[test]
    fn test_id_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/agent-id");
        let first = load_or_create(&path).unwrap();
        let second = load_or_create(&path).unwrap();
        assert_eq!(first, second);
        assert_eq!(fs::read_to_string(&path).unwrap().trim(), first.to_string());
    }

    #[test]
    fn test_malformed_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent-id");
        fs::write(&path, "not-a-uuid").unwrap();
        assert!(load_or_create(&path).is_err());
    }

    #[test]
    fn test_override() {
        let mut config = ConfigRegistry::new();
        define_core_keys(&mut config).unwrap();
        let id = Uuid::new_v4();
        config.set(AGENT, id.to_string()).unwrap();
        assert_eq!(resolve(&config).unwrap(), id);

        config.set(AGENT, "host-1").unwrap();
        let err = resolve(&config).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }
}
