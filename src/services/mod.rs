pub mod config_store;
pub mod dependency_installer;
pub mod environment_manager;
pub mod network_fetcher;
pub mod orchestrator;
pub mod platform;
pub mod remote_identity;
pub mod repo_sync;
pub mod runtime_provisioner;
pub mod self_updater;

pub use config_store::ConfigStore;
pub use dependency_installer::{InstalledPackage, PackageConflict};
pub use environment_manager::{EnvironmentDetails, IsolatedEnvironment};
pub use orchestrator::{LaunchOutcome, Orchestrator, SetupOutcome};
pub use platform::{PlatformCapabilities, SystemCapabilities};
pub use repo_sync::WorkingCopyState;
pub use runtime_provisioner::RuntimeInstallation;
pub use self_updater::{HistoryEntry, UpdateInfo, UpdateOutcome};
