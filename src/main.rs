mod commands;
mod errors;
mod logging;
mod models;
mod services;
mod utils;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;

use crate::errors::{LauncherError, Result};
use crate::models::LauncherConfig;
use crate::services::{ConfigStore, Orchestrator, PlatformCapabilities, SystemCapabilities};
use crate::utils::paths::LauncherPaths;

pub struct AppState {
    pub config_store: ConfigStore,
    pub config: Arc<LauncherConfig>,
    pub paths: LauncherPaths,
    pub orchestrator: Orchestrator,
}

#[derive(Parser)]
#[command(name = "bootstrap-launcher", version)]
#[command(about = "Provisions git, python, an isolated environment and dependencies, then starts the application")]
struct Cli {
    /// Base directory for config, logs, the working copy and environments
    #[arg(long, global = true)]
    root: Option<PathBuf>,
    /// Overrides the configured log level
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// First-run setup if needed, then start the application (default)
    Run,
    /// Run the full provisioning sequence without starting the application
    Setup,
    /// Start the application with the resolved interpreter
    Launch,
    /// Working-copy operations
    #[command(subcommand)]
    Repo(RepoCommand),
    /// Check the release feed for a newer launcher
    CheckUpdate,
    /// Download and apply the latest launcher release
    Update {
        /// Apply a local package instead of downloading
        #[arg(long, requires = "package_version")]
        package: Option<PathBuf>,
        /// Version recorded for a local package
        #[arg(long)]
        package_version: Option<String>,
    },
    /// Restore the install directory from the last update backup
    Rollback,
    /// Show the update history
    History,
    /// Delete rotated update backups
    CleanupBackups {
        #[arg(long)]
        keep: Option<usize>,
    },
    /// Isolated environment and runtime operations
    #[command(subcommand)]
    Env(EnvCommand),
    /// Dependency operations
    #[command(subcommand)]
    Deps(DepsCommand),
    /// Configuration file operations
    #[command(subcommand)]
    Config(ConfigCommand),
}

#[derive(Subcommand)]
enum RepoCommand {
    /// Clone or repair the working copy
    Sync {
        #[arg(long)]
        branch: Option<String>,
    },
    Status,
}

#[derive(Subcommand)]
enum EnvCommand {
    List,
    Show { name: String },
    Create {
        name: Option<String>,
        #[arg(long)]
        conda: bool,
    },
    Remove { name: String },
    Freeze { name: String },
    /// Python interpreters found on this machine
    Runtimes,
    /// Install the embeddable python runtime
    InstallRuntime { version: Option<String> },
}

#[derive(Subcommand)]
enum DepsCommand {
    /// Install every requirement of a manifest
    Install {
        #[arg(long)]
        manifest: Option<PathBuf>,
        #[arg(long)]
        env: Option<String>,
    },
    /// Install a single requirement
    Add {
        requirement: String,
        #[arg(long)]
        env: Option<String>,
    },
    UpgradePip {
        #[arg(long)]
        env: Option<String>,
    },
    List {
        #[arg(long)]
        env: Option<String>,
    },
    Conflicts {
        #[arg(long)]
        env: Option<String>,
        /// Uninstall the conflicting packages
        #[arg(long)]
        fix: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    Show,
    Validate,
    /// Set a dotted key, e.g. `advanced_settings.max_retries 5`
    Set { key: String, value: String },
    Reset,
    Export { path: PathBuf },
    Import { path: PathBuf },
    Backup,
    Restore,
}

fn build_state(cli: &Cli) -> Result<AppState> {
    let paths = cli
        .root
        .clone()
        .map(LauncherPaths::with_root)
        .unwrap_or_else(LauncherPaths::resolve);

    let config_store = ConfigStore::new(paths.config_file());
    let config = config_store.load()?;

    let level = cli
        .log_level
        .clone()
        .unwrap_or_else(|| config.advanced_settings.log_level.clone());
    logging::init(&paths.log_dir, &level)?;
    tracing::info!(
        "bootstrap launcher {} starting in {}",
        env!("CARGO_PKG_VERSION"),
        paths.root.display()
    );

    let config = Arc::new(config);
    let capabilities: Arc<dyn PlatformCapabilities> = Arc::new(SystemCapabilities);
    let orchestrator = Orchestrator::new(config.clone(), paths.clone(), capabilities);

    Ok(AppState {
        config_store,
        config,
        paths,
        orchestrator,
    })
}

fn emit<T: Serialize>(value: &T) -> std::result::Result<bool, String> {
    let rendered = serde_json::to_string_pretty(value).map_err(|err| err.to_string())?;
    println!("{rendered}");
    Ok(true)
}

fn report(success: bool, done: &str, failed: &str) -> std::result::Result<bool, String> {
    println!("{}", if success { done } else { failed });
    Ok(success)
}

async fn dispatch(command: Command, state: Arc<AppState>) -> std::result::Result<bool, String> {
    match command {
        Command::Run => commands::provision::run_launcher(state).await,
        Command::Setup => {
            let outcome = commands::provision::run_setup(state).await?;
            report(outcome.success, &outcome.status, &outcome.status)
        }
        Command::Launch => emit(&commands::provision::launch_app(state).await?),
        Command::Repo(RepoCommand::Sync { branch }) => {
            emit(&commands::provision::sync_repository(state, branch).await?)
        }
        Command::Repo(RepoCommand::Status) => emit(&commands::provision::repo_status(state).await?),
        Command::CheckUpdate => emit(&commands::update::check_update(state).await?),
        Command::Update {
            package: Some(package),
            package_version,
        } => {
            let version = package_version
                .ok_or_else(|| "--package-version is required with --package".to_string())?;
            commands::update::apply_local_package(state, package, version).await?;
            report(true, "update applied", "")
        }
        Command::Update { package: None, .. } => {
            let outcome = commands::update::perform_update(state).await?;
            let message = outcome.message();
            report(outcome.succeeded(), &message, &message)
        }
        Command::Rollback => report(
            commands::update::rollback_update(state).await?,
            "rollback complete",
            "rollback failed, see the log",
        ),
        Command::History => emit(&commands::update::update_history(state).await?),
        Command::CleanupBackups { keep } => {
            let removed = commands::update::cleanup_backups(state, keep).await?;
            report(true, &format!("removed {removed} old backups"), "")
        }
        Command::Env(command) => match command {
            EnvCommand::List => emit(&commands::environment::list_environments(state).await?),
            EnvCommand::Show { name } => {
                emit(&commands::environment::describe_environment(state, name).await?)
            }
            EnvCommand::Create { name, conda } => {
                emit(&commands::environment::create_environment(state, name, conda).await?)
            }
            EnvCommand::Remove { name } => report(
                commands::environment::remove_environment(state, name).await?,
                "environment removed",
                "environment could not be removed",
            ),
            EnvCommand::Freeze { name } => {
                for line in commands::environment::freeze_environment(state, name).await? {
                    println!("{line}");
                }
                Ok(true)
            }
            EnvCommand::Runtimes => emit(&commands::environment::list_runtimes(state).await?),
            EnvCommand::InstallRuntime { version } => report(
                commands::environment::install_runtime(state, version).await?,
                "python runtime installed",
                "python installation failed, install it manually and retry",
            ),
        },
        Command::Deps(command) => match command {
            DepsCommand::Install { manifest, env } => report(
                commands::dependencies::install_dependencies(state, manifest, env).await?,
                "dependencies installed",
                "dependency install failed, see the log",
            ),
            DepsCommand::Add { requirement, env } => report(
                commands::dependencies::install_package(state, requirement, env).await?,
                "package installed",
                "package install failed, see the log",
            ),
            DepsCommand::UpgradePip { env } => report(
                commands::dependencies::upgrade_pip(state, env).await?,
                "pip is up to date",
                "pip upgrade failed, see the log",
            ),
            DepsCommand::List { env } => emit(&commands::dependencies::list_packages(state, env).await?),
            DepsCommand::Conflicts { env, fix } => {
                let conflicts = commands::dependencies::check_conflicts(state, env, fix).await?;
                emit(&conflicts)?;
                Ok(conflicts.resolved.unwrap_or(true))
            }
        },
        Command::Config(command) => match command {
            ConfigCommand::Show => emit(&commands::config::show_config(state).await?),
            ConfigCommand::Validate => {
                let problems = commands::config::validate_config(state).await?;
                for problem in &problems {
                    println!("{problem}");
                }
                report(problems.is_empty(), "configuration is valid", "configuration has problems")
            }
            ConfigCommand::Set { key, value } => {
                emit(&commands::config::set_config_value(state, key, value).await?)
            }
            ConfigCommand::Reset => emit(&commands::config::reset_config(state).await?),
            ConfigCommand::Export { path } => {
                commands::config::export_config(state, path.clone()).await?;
                report(true, &format!("exported to {}", path.display()), "")
            }
            ConfigCommand::Import { path } => emit(&commands::config::import_config(state, path).await?),
            ConfigCommand::Backup => {
                let path = commands::config::backup_config(state).await?;
                report(true, &format!("backed up to {}", path.display()), "")
            }
            ConfigCommand::Restore => emit(&commands::config::restore_config(state).await?),
        },
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    let state = match build_state(&cli) {
        Ok(state) => Arc::new(state),
        Err(err) => {
            eprintln!("failed to initialize launcher: {err}");
            return ExitCode::FAILURE;
        }
    };

    // Blocking HTTP clients live in `state`, so the runtime is dropped before it.
    let runtime = match tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(LauncherError::from)
    {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start async runtime: {err}");
            return ExitCode::FAILURE;
        }
    };
    let command = cli.command.unwrap_or(Command::Run);
    let result = runtime.block_on(dispatch(command, state));
    drop(runtime);

    match result {
        Ok(true) => ExitCode::SUCCESS,
        Ok(false) => ExitCode::FAILURE,
        Err(err) => {
            tracing::error!("{}", err);
            eprintln!("{err}");
            ExitCode::FAILURE
        }
    }
}
