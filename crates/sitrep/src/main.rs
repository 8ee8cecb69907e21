//! sitrep agent
//!
//! One invocation runs the enabled collectors once and hands the resulting
//! inventory to the enabled backends.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use clap::ArgMatches;
use color_eyre::Result;
use sitrep_core::config::RUN_TIMEOUT;
use sitrep_core::{
    Agent, BackendRegistry, ConfigError, ConfigRegistry, ModuleRegistry, RunError, TracingSupervisor,
    define_core_keys,
};
use sitrep_exec::{CommandRunner, LocalExecutor};
use tokio_util::sync::CancellationToken;
use tracing::{Span, info, warn};

mod cli;
mod identity;
mod logging;

use cli::Commands;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    if let Err(report) = app().await {
        if let Some(err) = report.downcast_ref::<RunError>() {
            let code = err.exit_code();
            eprintln!("Error: {report:?}");
            std::process::exit(code);
        }
        return Err(report);
    }
    Ok(())
}

/// Define the core keys and register every built-in module and backend
fn setup(
    runner: Arc<dyn CommandRunner>,
) -> std::result::Result<(ConfigRegistry, ModuleRegistry, BackendRegistry), RunError> {
    let mut config = ConfigRegistry::new();
    define_core_keys(&mut config)?;

    let mut modules = ModuleRegistry::builder();
    sitrep_modules::register_builtin(&mut modules, runner)?;
    let modules = modules.seal(&mut config)?;

    let mut backends = BackendRegistry::builder();
    sitrep_backends::register_builtin(&mut backends)?;
    let backends = backends.seal(&mut config)?;
    Ok((config, modules, backends))
}

async fn app() -> Result<()> {
    let (mut config, modules, backends) = setup(Arc::new(LocalExecutor::new()))?;

    let matches = cli::command(&config).get_matches();
    let args = cli::parse(&matches)?;
    load_layers(&mut config, args.config.as_deref(), &matches).map_err(RunError::from)?;

    let settings = logging::LogSettings::from_config(&config).map_err(RunError::from)?;
    logging::init(settings)?;

    match args.command.unwrap_or(Commands::Run) {
        Commands::Version => {
            println!("sitrep {}", env!("CARGO_PKG_VERSION"));
        }
        Commands::Id => {
            println!("{}", identity::resolve(&config)?);
        }
        Commands::Defaults => {
            println!("{}", serde_json::to_string_pretty(&config.to_json())?);
        }
        Commands::Run => run(config, modules, backends).await?,
    }
    Ok(())
}

/// Layer the config file, the environment and the flags over the defaults
fn load_layers(
    config: &mut ConfigRegistry,
    file: Option<&Path>,
    matches: &ArgMatches,
) -> std::result::Result<(), ConfigError> {
    if let Some(path) = file {
        config.load_file(path)?;
    }
    config.load_env()?;
    cli::apply(config, matches)
}

async fn run(
    config: ConfigRegistry,
    modules: ModuleRegistry,
    backends: BackendRegistry,
) -> Result<()> {
    let agent = identity::resolve(&config)?;
    let timeout: u64 = config.get(RUN_TIMEOUT).map_err(RunError::from)?;

    let cancel = CancellationToken::new();
    spawn_interrupt_handler(cancel.clone());
    if timeout > 0 {
        spawn_deadline(cancel.clone(), Duration::from_secs(timeout));
    }

    let summary = Agent::new(config, modules, backends, agent)
        .with_supervisor(Arc::new(TracingSupervisor::new(Span::current())))
        .run(cancel)
        .await?;

    for failure in &summary.backend_failures {
        warn!(backend = %failure.backend, error = %failure.error, "payload not delivered");
    }
    info!(
        machines = summary.payload.machines.len(),
        module_errors = summary.payload.extra.module_errors.len(),
        "inventory complete"
    );
    Ok(())
}

fn spawn_interrupt_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupted, cancelling run");
            cancel.cancel();
        }
    });
}

fn spawn_deadline(cancel: CancellationToken, after: Duration) {
    tokio::spawn(async move {
        tokio::select! {
            () = tokio::time::sleep(after) => {
                warn!(timeout_secs = after.as_secs(), "run timeout reached, cancelling");
                cancel.cancel();
            }
            () = cancel.cancelled() => {}
        }
    });
}
