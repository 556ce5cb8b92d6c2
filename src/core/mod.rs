pub mod archive;
pub mod backup;
pub mod config;
pub mod crypto;
pub mod health;
pub mod restore;
pub mod runtime;
pub mod secrets;

pub use backup::BackupEngine;
pub use config::OpsConfig;
pub use crypto::GpgCipher;
pub use health::HealthChecker;
pub use restore::RestoreOrchestrator;
pub use runtime::DockerRuntime;
pub use secrets::SecretStore;
