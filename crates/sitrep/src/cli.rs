//! Command line definition
//!
//! The static part is derived; every configuration key is attached as a long
//! flag at runtime, both on the root command and on `run`.

use std::path::PathBuf;

use clap::{ArgMatches, CommandFactory, FromArgMatches, Parser, Subcommand};
use sitrep_core::{ConfigError, ConfigRegistry};

#[derive(Debug, Parser)]
#[command(name = "sitrep")]
#[command(about = "One-shot host inventory agent", long_about = None)]
#[command(version)]
pub struct Cli {
    /// Configuration file (JSON or TOML)
    #[arg(long, global = true, value_name = "FILE")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Subcommand)]
pub enum Commands {
    /// Collect the inventory and deliver it to the enabled backends (default)
    Run,
    /// Print the version
    Version,
    /// Print the agent id
    Id,
    /// Print the effective configuration as JSON
    Defaults,
}

/// Full command with one flag per configuration key
#[must_use]
pub fn command(config: &ConfigRegistry) -> clap::Command {
    let root = config.augment_command(Cli::command());
    root.mut_subcommand("run", |run| config.augment_command(run))
}

/// Parse the derived part of already matched arguments
///
/// # Errors
/// Returns a clap error if the matches do not fit [`Cli`].
pub fn parse(matches: &ArgMatches) -> Result<Cli, clap::Error> {
    Cli::from_arg_matches(matches)
}

/// Apply configuration flags given on the root command and on `run`
///
/// # Errors
/// Returns `InvalidValue` for a flag that does not parse as its key's kind.
pub fn apply(config: &mut ConfigRegistry, matches: &ArgMatches) -> Result<(), ConfigError> {
    config.apply_matches(matches)?;
    if let Some(("run", run)) = matches.subcommand() {
        config.apply_matches(run)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitrep_core::define_core_keys;

    fn registry() -> ConfigRegistry {
        let mut config = ConfigRegistry::new();
        define_core_keys(&mut config).unwrap();
        config
    }

    #[test]
    fn test_run_is_the_default() {
        let config = registry();
        let matches = command(&config).try_get_matches_from(["sitrep"]).unwrap();
        assert_eq!(parse(&matches).unwrap().command, None);
    }

    #[test]
    fn test_flags_on_root_and_run() {
        let mut config = registry();
        let matches = command(&config)
            .try_get_matches_from([
                "sitrep",
                "--log-level",
                "2",
                "run",
                "--parallel-modules",
                "--backend-concurrency",
                "3",
            ])
            .unwrap();
        let cli = parse(&matches).unwrap();
        assert_eq!(cli.command, Some(Commands::Run));
        apply(&mut config, &matches).unwrap();
        assert_eq!(config.get::<u64>("log-level").unwrap(), 2);
        assert!(config.get::<bool>("parallel-modules").unwrap());
        assert_eq!(config.get::<u64>("backend-concurrency").unwrap(), 3);
    }

    #[test]
    fn test_global_config_path() {
        let config = registry();
        let matches = command(&config)
            .try_get_matches_from(["sitrep", "defaults", "--config", "sitrep.toml"])
            .unwrap();
        let cli = parse(&matches).unwrap();
        assert_eq!(cli.command, Some(Commands::Defaults));
        assert_eq!(cli.config, Some(PathBuf::from("sitrep.toml")));
    }

    #[test]
    fn test_config_flags_are_not_on_other_subcommands() {
        let config = registry();
        assert!(
            command(&config)
                .try_get_matches_from(["sitrep", "id", "--log-level", "5"])
                .is_err()
        );
    }

    #[test]
    fn test_invalid_flag_value() {
        let mut config = registry();
        let matches = command(&config)
            .try_get_matches_from(["sitrep", "--log-level", "loud"])
            .unwrap();
        assert!(matches!(
            apply(&mut config, &matches),
            Err(ConfigError::InvalidValue { .. })
        ));
    }
}
