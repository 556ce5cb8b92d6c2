/// Backup engine
///
/// Produces encrypted backup generations for each deployed service: a live
/// database dump, an archive of the data directory, an optional log snapshot,
/// and one shared archive of the secret store. Artifact names are fixed for
/// interoperability with previously taken backups:
///
///   {service}_db_{token}.sql.gz.gpg
///   {service}_data_{token}.tar.gz.gpg
///   {service}_logs_{token}.log.gpg
///   secrets_{token}.tar.gz.gpg

use anyhow::{bail, Context, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::core::archive::{gzip, tar_directory};
use crate::core::crypto::ArtifactCipher;
use crate::core::runtime::{ContainerRuntime, RuntimeStatus};
use crate::core::secrets::SecretStore;
use crate::utils::ServiceKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ArtifactKind {
    Database,
    Data,
    Logs,
    Secrets,
}

impl ArtifactKind {
    pub fn label(&self) -> &'static str {
        match self {
            ArtifactKind::Database => "db",
            ArtifactKind::Data => "data",
            ArtifactKind::Logs => "logs",
            ArtifactKind::Secrets => "secrets",
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ArtifactKind::Database => "sql.gz.gpg",
            ArtifactKind::Data => "tar.gz.gpg",
            ArtifactKind::Logs => "log.gpg",
            ArtifactKind::Secrets => "tar.gz.gpg",
        }
    }
}

/// One encrypted artifact on disk. `service` is None for the shared secrets
/// artifact.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub path: PathBuf,
    pub service: Option<ServiceKind>,
    pub kind: ArtifactKind,
    pub token: String,
    pub size: u64,
}

/// All artifacts sharing one timestamp token
#[derive(Debug, Clone)]
pub struct Generation {
    pub token: String,
    pub artifacts: Vec<Artifact>,
}

impl Generation {
    pub fn find(&self, service: Option<ServiceKind>, kind: ArtifactKind) -> Option<&Artifact> {
        self.artifacts
            .iter()
            .find(|a| a.service == service && a.kind == kind)
    }
}

/// Build the fixed artifact file name
pub fn artifact_file_name(service: Option<ServiceKind>, kind: ArtifactKind, token: &str) -> String {
    match service {
        Some(service) => format!("{}_{}_{}.{}", service, kind.label(), token, kind.extension()),
        None => format!("secrets_{}.{}", token, ArtifactKind::Secrets.extension()),
    }
}

/// Parse an artifact file name; returns None for files that are not artifacts
pub fn parse_artifact_name(name: &str) -> Option<(Option<ServiceKind>, ArtifactKind, String)> {
    // Both patterns are anchored; tokens are fixed-width second-precision
    let service_re =
        Regex::new(r"^([a-z]+)_(db|data|logs)_(\d{8}_\d{6})\.(sql\.gz|tar\.gz|log)\.gpg$").ok()?;
    let secrets_re = Regex::new(r"^secrets_(\d{8}_\d{6})\.tar\.gz\.gpg$").ok()?;

    if let Some(caps) = secrets_re.captures(name) {
        return Some((None, ArtifactKind::Secrets, caps[1].to_string()));
    }

    let caps = service_re.captures(name)?;
    let service: ServiceKind = caps[1].parse().ok()?;
    let (kind, expected_ext) = match &caps[2] {
        "db" => (ArtifactKind::Database, "sql.gz"),
        "data" => (ArtifactKind::Data, "tar.gz"),
        "logs" => (ArtifactKind::Logs, "log"),
        _ => return None,
    };
    if &caps[4] != expected_ext {
        return None;
    }

    Some((Some(service), kind, caps[3].to_string()))
}

/// Scan the backup directory for artifacts
pub fn scan_artifacts(backup_dir: &Path) -> Result<Vec<Artifact>> {
    let mut artifacts = Vec::new();

    if !backup_dir.exists() {
        return Ok(artifacts);
    }

    for entry in fs::read_dir(backup_dir)
        .with_context(|| format!("Failed to read backup directory {}", backup_dir.display()))?
    {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };

        if let Some((service, kind, token)) = parse_artifact_name(name) {
            let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
            artifacts.push(Artifact {
                path: entry.path(),
                service,
                kind,
                token,
                size,
            });
        }
    }

    Ok(artifacts)
}

/// True when an artifact written at `modified` is past the retention window
pub fn is_expired(modified: SystemTime, now: SystemTime, retention_days: u64) -> bool {
    match now.duration_since(modified) {
        Ok(age) => age.as_secs() > retention_days * 86400,
        // Clock skew: a file "from the future" is never expired
        Err(_) => false,
    }
}

pub struct BackupEngine {
    runtime: Arc<dyn ContainerRuntime>,
    cipher: Arc<dyn ArtifactCipher>,
    secrets: SecretStore,
    backup_dir: PathBuf,
    deploy_root: PathBuf,
    retention_days: u64,
}

impl BackupEngine {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cipher: Arc<dyn ArtifactCipher>,
        secrets: SecretStore,
        backup_dir: PathBuf,
        deploy_root: PathBuf,
        retention_days: u64,
    ) -> Self {
        Self {
            runtime,
            cipher,
            secrets,
            backup_dir,
            deploy_root,
            retention_days,
        }
    }

    fn artifact_path(&self, service: Option<ServiceKind>, kind: ArtifactKind, token: &str) -> PathBuf {
        self.backup_dir.join(artifact_file_name(service, kind, token))
    }

    /// Back up one service under the given generation token.
    ///
    /// The dump is taken against the running database, so no downtime is
    /// required. The passphrase is supplied by the caller and never persisted.
    pub async fn create_backup(
        &self,
        service: ServiceKind,
        token: &str,
        passphrase: &str,
    ) -> Result<Generation> {
        let spec = service.spec();

        // Preconditions: fail before producing anything
        if !self.secrets.bundle_exists(service) {
            bail!(
                "No secret bundle for {} in {}; run initial provisioning first",
                service,
                self.secrets.root().display()
            );
        }
        match self.runtime.container_status(spec.db_container).await? {
            RuntimeStatus::Running => {}
            other => bail!(
                "Database container {} is not running ({:?}); cannot take a backup",
                spec.db_container,
                other
            ),
        }

        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create {}", self.backup_dir.display()))?;

        let mut artifacts = Vec::new();

        // Database dump, compressed and encrypted
        let dump = self
            .runtime
            .exec(spec.db_container, &["pg_dump", "-U", spec.db_role, spec.db_name])
            .await
            .with_context(|| format!("pg_dump failed for {}", service))?;
        let db_path = self.artifact_path(Some(service), ArtifactKind::Database, token);
        self.cipher
            .encrypt_to_file(&gzip(&dump)?, &db_path, passphrase)
            .await?;
        artifacts.push(Artifact {
            size: file_size(&db_path),
            path: db_path,
            service: Some(service),
            kind: ArtifactKind::Database,
            token: token.to_string(),
        });

        // Data directory archive
        let data_dir = self.deploy_root.join(spec.data_dir);
        if !data_dir.is_dir() {
            bail!(
                "Data directory {} does not exist for {}",
                data_dir.display(),
                service
            );
        }
        let data_path = self.artifact_path(Some(service), ArtifactKind::Data, token);
        self.cipher
            .encrypt_to_file(&tar_directory(&data_dir)?, &data_path, passphrase)
            .await?;
        artifacts.push(Artifact {
            size: file_size(&data_path),
            path: data_path,
            service: Some(service),
            kind: ArtifactKind::Data,
            token: token.to_string(),
        });

        // Optional log snapshot; the live log is read, never modified
        let log_file = self.deploy_root.join(spec.log_file);
        if log_file.is_file() {
            let logs = fs::read(&log_file)
                .with_context(|| format!("Failed to read {}", log_file.display()))?;
            let logs_path = self.artifact_path(Some(service), ArtifactKind::Logs, token);
            self.cipher
                .encrypt_to_file(&logs, &logs_path, passphrase)
                .await?;
            artifacts.push(Artifact {
                size: file_size(&logs_path),
                path: logs_path,
                service: Some(service),
                kind: ArtifactKind::Logs,
                token: token.to_string(),
            });
        }

        Ok(Generation {
            token: token.to_string(),
            artifacts,
        })
    }

    /// Archive the whole secret store (all services) once per run. Skipped
    /// when a secrets artifact for this token already exists.
    pub async fn backup_secrets(&self, token: &str, passphrase: &str) -> Result<Option<Artifact>> {
        let path = self.artifact_path(None, ArtifactKind::Secrets, token);
        if path.exists() {
            return Ok(None);
        }

        if !self.secrets.root().is_dir() {
            bail!(
                "Secret store {} does not exist",
                self.secrets.root().display()
            );
        }

        fs::create_dir_all(&self.backup_dir)
            .with_context(|| format!("Failed to create {}", self.backup_dir.display()))?;

        self.cipher
            .encrypt_to_file(&tar_directory(self.secrets.root())?, &path, passphrase)
            .await?;

        Ok(Some(Artifact {
            size: file_size(&path),
            path,
            service: None,
            kind: ArtifactKind::Secrets,
            token: token.to_string(),
        }))
    }

    /// Delete artifacts older than the retention window, per artifact,
    /// regardless of service or generation completeness. Returns the paths
    /// that were removed.
    pub fn apply_retention(&self) -> Result<Vec<PathBuf>> {
        let now = SystemTime::now();
        let mut removed = Vec::new();

        for artifact in scan_artifacts(&self.backup_dir)? {
            let modified = fs::metadata(&artifact.path).and_then(|m| m.modified());
            let Ok(modified) = modified else { continue };

            if is_expired(modified, now, self.retention_days) {
                fs::remove_file(&artifact.path).with_context(|| {
                    format!("Failed to delete expired artifact {}", artifact.path.display())
                })?;
                removed.push(artifact.path);
            }
        }

        Ok(removed)
    }

    /// All generations on disk, oldest first
    pub fn list_generations(&self) -> Result<Vec<Generation>> {
        let mut by_token: BTreeMap<String, Vec<Artifact>> = BTreeMap::new();
        for artifact in scan_artifacts(&self.backup_dir)? {
            by_token
                .entry(artifact.token.clone())
                .or_default()
                .push(artifact);
        }

        Ok(by_token
            .into_iter()
            .map(|(token, artifacts)| Generation { token, artifacts })
            .collect())
    }
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::gunzip;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use tempfile::TempDir;

    /// Runtime fake: records calls, serves a canned dump
    struct FakeRuntime {
        calls: Mutex<Vec<String>>,
        db_running: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn exec(&self, container: &str, cmd: &[&str]) -> Result<Vec<u8>> {
            self.calls
                .lock()
                .unwrap()
                .push(format!("exec {} {}", container, cmd.join(" ")));
            Ok(b"-- PostgreSQL dump\nCREATE TABLE posts (id int);\n".to_vec())
        }

        async fn exec_with_stdin(&self, _: &str, _: &[&str], _: &[u8]) -> Result<()> {
            Ok(())
        }

        async fn container_status(&self, _: &str) -> Result<RuntimeStatus> {
            Ok(if self.db_running {
                RuntimeStatus::Running
            } else {
                RuntimeStatus::Exited
            })
        }

        async fn stop_components(&self, _: &[&str]) -> Result<()> {
            Ok(())
        }

        async fn start_components(&self, _: &[&str]) -> Result<()> {
            Ok(())
        }
    }

    /// Cipher fake: "encrypts" by writing the plaintext, so tests can inspect
    /// artifact content without gpg
    struct PlainCipher {
        fail: bool,
    }

    #[async_trait]
    impl ArtifactCipher for PlainCipher {
        async fn encrypt_to_file(&self, plaintext: &[u8], dest: &Path, _: &str) -> Result<()> {
            if self.fail {
                return Err(anyhow!("simulated encryption failure"));
            }
            fs::write(dest, plaintext)?;
            Ok(())
        }

        async fn decrypt_file(&self, src: &Path, _: &str) -> Result<Vec<u8>> {
            Ok(fs::read(src)?)
        }
    }

    fn engine(dir: &TempDir, db_running: bool, cipher_fails: bool) -> BackupEngine {
        let root = dir.path().to_path_buf();
        let secrets = SecretStore::new(root.join("secrets"));
        secrets.ensure_bundle(ServiceKind::Chat).unwrap();
        secrets.ensure_bundle(ServiceKind::Forum).unwrap();
        fs::create_dir_all(root.join("data/chat/media")).unwrap();
        fs::write(root.join("data/chat/media/item.bin"), b"media bytes").unwrap();

        BackupEngine::new(
            Arc::new(FakeRuntime {
                calls: Mutex::new(Vec::new()),
                db_running,
            }),
            Arc::new(PlainCipher { fail: cipher_fails }),
            secrets,
            root.join("backups"),
            root,
            30,
        )
    }

    #[test]
    fn test_artifact_names() {
        assert_eq!(
            artifact_file_name(Some(ServiceKind::Chat), ArtifactKind::Database, "20250830_120000"),
            "chat_db_20250830_120000.sql.gz.gpg"
        );
        assert_eq!(
            artifact_file_name(Some(ServiceKind::Forum), ArtifactKind::Logs, "20250830_120000"),
            "forum_logs_20250830_120000.log.gpg"
        );
        assert_eq!(
            artifact_file_name(None, ArtifactKind::Secrets, "20250830_120000"),
            "secrets_20250830_120000.tar.gz.gpg"
        );
    }

    #[test]
    fn test_parse_artifact_name() {
        let (service, kind, token) =
            parse_artifact_name("chat_db_20250830_120000.sql.gz.gpg").unwrap();
        assert_eq!(service, Some(ServiceKind::Chat));
        assert_eq!(kind, ArtifactKind::Database);
        assert_eq!(token, "20250830_120000");

        let (service, kind, _) = parse_artifact_name("secrets_20250830_120000.tar.gz.gpg").unwrap();
        assert_eq!(service, None);
        assert_eq!(kind, ArtifactKind::Secrets);

        // Wrong extension for the type, unknown service, stray files
        assert!(parse_artifact_name("chat_db_20250830_120000.tar.gz.gpg").is_none());
        assert!(parse_artifact_name("mail_db_20250830_120000.sql.gz.gpg").is_none());
        assert!(parse_artifact_name("notes.txt").is_none());
    }

    #[test]
    fn test_retention_boundary() {
        let now = SystemTime::now();
        let day = Duration::from_secs(86400);

        let ages: Vec<(u64, bool)> = vec![(10, false), (29, false), (31, true), (45, true)];
        for (age_days, expect_expired) in ages {
            let modified = now - day * age_days as u32;
            assert_eq!(
                is_expired(modified, now, 30),
                expect_expired,
                "age {} days",
                age_days
            );
        }
    }

    #[tokio::test]
    async fn test_create_backup_produces_round_trippable_artifacts() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, true, false);

        let generation = engine
            .create_backup(ServiceKind::Chat, "20250830_120000", "hunter2")
            .await
            .unwrap();

        let db = generation
            .find(Some(ServiceKind::Chat), ArtifactKind::Database)
            .unwrap();
        assert!(db.path.exists());

        // PlainCipher wrote the gzip stream verbatim; it must round-trip to
        // the original dump
        let stored = fs::read(&db.path).unwrap();
        let dump = gunzip(&stored).unwrap();
        assert!(dump.starts_with(b"-- PostgreSQL dump"));

        let data = generation
            .find(Some(ServiceKind::Chat), ArtifactKind::Data)
            .unwrap();
        assert!(data.path.exists());

        // No log file in the fixture, so no logs artifact
        assert!(generation
            .find(Some(ServiceKind::Chat), ArtifactKind::Logs)
            .is_none());
    }

    #[tokio::test]
    async fn test_backup_aborts_when_database_is_down() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, false, false);

        let err = engine
            .create_backup(ServiceKind::Chat, "20250830_120000", "hunter2")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("not running"));

        // Precondition failure: nothing was written
        assert!(scan_artifacts(&dir.path().join("backups")).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_secrets_artifact_is_shared_and_skipped_on_rerun() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, true, false);

        let first = engine
            .backup_secrets("20250830_120000", "hunter2")
            .await
            .unwrap();
        assert!(first.is_some());

        let second = engine
            .backup_secrets("20250830_120000", "hunter2")
            .await
            .unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_list_generations_sorted_by_token() {
        let dir = TempDir::new().unwrap();
        let engine = engine(&dir, true, false);

        engine
            .create_backup(ServiceKind::Chat, "20250830_120000", "pw")
            .await
            .unwrap();
        engine
            .create_backup(ServiceKind::Chat, "20240101_000000", "pw")
            .await
            .unwrap();

        let generations = engine.list_generations().unwrap();
        let tokens: Vec<&str> = generations.iter().map(|g| g.token.as_str()).collect();
        assert_eq!(tokens, vec!["20240101_000000", "20250830_120000"]);
    }
}
