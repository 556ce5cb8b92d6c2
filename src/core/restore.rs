/// Restore orchestrator
///
/// A strict forward-only state machine:
///
///   Verify -> Test-Decrypt -> Restore-Secrets -> Stop -> Restore-Data
///     -> Restore-Database -> Start -> Verify-Live
///
/// Nothing destructive happens before the supplied passphrase has been proven
/// against a real artifact, and every destructive step first moves the
/// previous state aside rather than deleting it. A failed step aborts the run
/// and leaves the system exactly as the last completed step produced it.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::core::archive::{gunzip, untar_into};
use crate::core::backup::{scan_artifacts, Artifact, ArtifactKind};
use crate::core::crypto::ArtifactCipher;
use crate::core::runtime::ContainerRuntime;
use crate::core::secrets::SecretStore;
use crate::utils::{new_generation_token, ServiceKind};

/// What a restore run operates on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreTarget {
    Service(ServiceKind),
    Both,
    SecretsOnly,
}

impl RestoreTarget {
    pub fn services(&self) -> Vec<ServiceKind> {
        match self {
            RestoreTarget::Service(service) => vec![*service],
            RestoreTarget::Both => ServiceKind::all().to_vec(),
            RestoreTarget::SecretsOnly => Vec::new(),
        }
    }
}

impl fmt::Display for RestoreTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestoreTarget::Service(service) => write!(f, "{}", service),
            RestoreTarget::Both => f.write_str("both services"),
            RestoreTarget::SecretsOnly => f.write_str("secret store"),
        }
    }
}

impl FromStr for RestoreTarget {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "both" => Ok(RestoreTarget::Both),
            "secrets" => Ok(RestoreTarget::SecretsOnly),
            other => other
                .parse::<ServiceKind>()
                .map(RestoreTarget::Service)
                .map_err(|_| {
                    format!(
                        "unknown restore target '{}' (expected chat, forum, both or secrets)",
                        other
                    )
                }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    Verify,
    TestDecrypt,
    RestoreSecrets,
    Stop,
    RestoreData,
    RestoreDatabase,
    Start,
    VerifyLive,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            RestoreStep::Verify => "verify",
            RestoreStep::TestDecrypt => "test-decrypt",
            RestoreStep::RestoreSecrets => "restore-secrets",
            RestoreStep::Stop => "stop",
            RestoreStep::RestoreData => "restore-data",
            RestoreStep::RestoreDatabase => "restore-database",
            RestoreStep::Start => "start",
            RestoreStep::VerifyLive => "verify-live",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("no {kind} artifact for generation {token} ({scope})")]
    MissingArtifact {
        scope: String,
        kind: &'static str,
        token: String,
    },

    #[error("passphrase check failed, nothing was touched: {0}")]
    DecryptionRejected(String),

    #[error("another restore of '{0}' appears to be in progress (lock file {1})")]
    Locked(String, PathBuf),

    #[error("database for {service} did not become ready after {attempts} attempts")]
    DatabaseNotReady { service: String, attempts: u32 },

    #[error("step {step} failed: {source:#}")]
    StepFailed {
        step: RestoreStep,
        #[source]
        source: anyhow::Error,
    },
}

/// Result of a completed restore. Warnings cover the post-restore liveness
/// probe only; every destructive step succeeded.
#[derive(Debug)]
pub enum RestoreOutcome {
    Completed,
    CompletedWithWarnings(Vec<String>),
}

/// Advisory per-service lock file, removed on drop. The original shell
/// tooling had no mutual exclusion at all; two simultaneous restores of one
/// service would race on the same directory moves.
struct RestoreLock {
    path: PathBuf,
}

impl RestoreLock {
    fn acquire(deploy_root: &Path, name: &str) -> Result<Self, RestoreError> {
        let path = deploy_root.join(format!(".fedops-restore-{}.lock", name));

        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "{}", std::process::id());
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                Err(RestoreError::Locked(name.to_string(), path))
            }
            Err(e) => Err(RestoreError::StepFailed {
                step: RestoreStep::Verify,
                source: anyhow::Error::from(e).context("Failed to create lock file"),
            }),
        }
    }
}

impl Drop for RestoreLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

pub struct RestoreOrchestrator {
    runtime: Arc<dyn ContainerRuntime>,
    cipher: Arc<dyn ArtifactCipher>,
    secrets: SecretStore,
    backup_dir: PathBuf,
    deploy_root: PathBuf,
    client: reqwest::Client,
    db_ready_attempts: u32,
    db_ready_interval: Duration,
    liveness_attempts: u32,
    liveness_interval: Duration,
}

impl RestoreOrchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        cipher: Arc<dyn ArtifactCipher>,
        secrets: SecretStore,
        backup_dir: PathBuf,
        deploy_root: PathBuf,
        db_ready_attempts: u32,
        db_ready_interval: Duration,
        liveness_attempts: u32,
        liveness_interval: Duration,
    ) -> Self {
        Self {
            runtime,
            cipher,
            secrets,
            backup_dir,
            deploy_root,
            client: reqwest::Client::new(),
            db_ready_attempts,
            db_ready_interval,
            liveness_attempts,
            liveness_interval,
        }
    }

    /// Run the full restore state machine for `target` at `token`
    pub async fn restore(
        &self,
        target: RestoreTarget,
        token: &str,
        passphrase: &str,
    ) -> Result<RestoreOutcome, RestoreError> {
        let services = target.services();

        // --- Verify: all required artifacts must exist before anything else
        let artifacts = self.collect_artifacts(token, target)?;
        let secrets_artifact = artifacts.get(&(None, ArtifactKind::Secrets));

        // --- Locks: at most one restore per service, plus the shared secret
        // store whenever this run will rewrite it
        let mut locks = Vec::new();
        if secrets_artifact.is_some() {
            locks.push(RestoreLock::acquire(&self.deploy_root, "secrets")?);
        }
        for service in &services {
            locks.push(RestoreLock::acquire(&self.deploy_root, service.name())?);
        }

        // --- Test-Decrypt: prove the passphrase before any destructive step
        let probe = secrets_artifact
            .or_else(|| {
                services
                    .first()
                    .and_then(|s| artifacts.get(&(Some(*s), ArtifactKind::Database)))
            })
            .ok_or_else(|| RestoreError::MissingArtifact {
                scope: "generation".to_string(),
                kind: ArtifactKind::Database.label(),
                token: token.to_string(),
            })?;
        let probe_bytes = self
            .cipher
            .decrypt_file(&probe.path, passphrase)
            .await
            .map_err(|e| RestoreError::DecryptionRejected(format!("{:#}", e)))?;

        // --- Restore-Secrets: always first, before any service is stopped.
        // When a secrets artifact exists it is also the probe, so its
        // plaintext is already at hand; the store is rewritten exactly once
        // per run, shared by every service in the target.
        if secrets_artifact.is_some() {
            self.restore_secrets(&probe_bytes)?;
        }

        // --- Per-service sequence
        let mut warnings = Vec::new();
        for service in &services {
            self.restore_service(*service, &artifacts, passphrase, &mut warnings)
                .await?;
        }

        drop(locks);

        if warnings.is_empty() {
            Ok(RestoreOutcome::Completed)
        } else {
            Ok(RestoreOutcome::CompletedWithWarnings(warnings))
        }
    }

    /// List the generation tokens available on disk, oldest first
    pub fn available_tokens(&self) -> Result<Vec<String>> {
        let mut tokens: Vec<String> = scan_artifacts(&self.backup_dir)?
            .into_iter()
            .map(|a| a.token)
            .collect();
        tokens.sort();
        tokens.dedup();
        Ok(tokens)
    }

    fn collect_artifacts(
        &self,
        token: &str,
        target: RestoreTarget,
    ) -> Result<HashMap<(Option<ServiceKind>, ArtifactKind), Artifact>, RestoreError> {
        let scanned = scan_artifacts(&self.backup_dir).map_err(|e| RestoreError::StepFailed {
            step: RestoreStep::Verify,
            source: e,
        })?;

        let mut artifacts = HashMap::new();
        for artifact in scanned {
            if artifact.token == token {
                artifacts.insert((artifact.service, artifact.kind), artifact);
            }
        }

        for service in target.services() {
            for kind in [ArtifactKind::Database, ArtifactKind::Data] {
                if !artifacts.contains_key(&(Some(service), kind)) {
                    return Err(RestoreError::MissingArtifact {
                        scope: service.name().to_string(),
                        kind: kind.label(),
                        token: token.to_string(),
                    });
                }
            }
        }

        if matches!(target, RestoreTarget::SecretsOnly)
            && !artifacts.contains_key(&(None, ArtifactKind::Secrets))
        {
            return Err(RestoreError::MissingArtifact {
                scope: "secrets".to_string(),
                kind: ArtifactKind::Secrets.label(),
                token: token.to_string(),
            });
        }

        Ok(artifacts)
    }

    fn restore_secrets(&self, bytes: &[u8]) -> Result<(), RestoreError> {
        let step = RestoreStep::RestoreSecrets;
        let run = || -> Result<()> {
            // Previous store is moved aside, never deleted
            self.secrets.move_aside()?;
            untar_into(bytes, self.secrets.root())?;
            self.secrets.restrict_permissions()?;
            Ok(())
        };
        run().map_err(|source| RestoreError::StepFailed { step, source })
    }

    async fn restore_service(
        &self,
        service: ServiceKind,
        artifacts: &HashMap<(Option<ServiceKind>, ArtifactKind), Artifact>,
        passphrase: &str,
        warnings: &mut Vec<String>,
    ) -> Result<(), RestoreError> {
        let spec = service.spec();
        let data_artifact = &artifacts[&(Some(service), ArtifactKind::Data)];
        let db_artifact = &artifacts[&(Some(service), ArtifactKind::Database)];

        // Stop
        let components = service.components();
        self.runtime
            .stop_components(&components)
            .await
            .map_err(|source| RestoreError::StepFailed {
                step: RestoreStep::Stop,
                source,
            })?;

        // Restore-Data
        self.restore_data(service, data_artifact, passphrase)
            .await
            .map_err(|source| RestoreError::StepFailed {
                step: RestoreStep::RestoreData,
                source,
            })?;

        // Restore-Database
        self.restore_database(service, db_artifact, passphrase).await?;

        // Start the rest of the stack
        self.runtime
            .start_components(&service.non_db_components())
            .await
            .map_err(|source| RestoreError::StepFailed {
                step: RestoreStep::Start,
                source,
            })?;

        // Verify-Live: bounded, downgrades to a warning, never rolls back
        if !self.verify_live(spec.endpoint, spec.expected_status).await {
            warnings.push(format!(
                "{}: endpoint {} did not confirm liveness within {}s; restore completed but unverified",
                service,
                spec.endpoint,
                self.liveness_attempts as u64 * self.liveness_interval.as_secs().max(1),
            ));
        }

        Ok(())
    }

    async fn restore_data(
        &self,
        service: ServiceKind,
        artifact: &Artifact,
        passphrase: &str,
    ) -> Result<()> {
        let bytes = self.cipher.decrypt_file(&artifact.path, passphrase).await?;

        let data_dir = self.deploy_root.join(service.spec().data_dir);
        if data_dir.exists() {
            let mut name = data_dir.file_name().unwrap_or_default().to_os_string();
            name.push(format!(".backup.{}", new_generation_token()));
            let aside = data_dir.with_file_name(name);
            fs::rename(&data_dir, &aside).with_context(|| {
                format!(
                    "Failed to move data directory aside ({} -> {})",
                    data_dir.display(),
                    aside.display()
                )
            })?;
        }

        untar_into(&bytes, &data_dir)?;
        Ok(())
    }

    async fn restore_database(
        &self,
        service: ServiceKind,
        artifact: &Artifact,
        passphrase: &str,
    ) -> Result<(), RestoreError> {
        let step = RestoreStep::RestoreDatabase;
        let spec = service.spec();
        let step_err = |source| RestoreError::StepFailed { step, source };

        // Bring up only the database
        self.runtime
            .start_components(&[spec.db_container])
            .await
            .map_err(step_err)?;

        // Bounded readiness polling; exhausting the budget is fatal for this
        // restore attempt (loading a dump into a half-ready server is worse)
        let mut ready = false;
        for _ in 0..self.db_ready_attempts {
            if self
                .runtime
                .exec(spec.db_container, &["pg_isready", "-U", spec.db_role])
                .await
                .is_ok()
            {
                ready = true;
                break;
            }
            tokio::time::sleep(self.db_ready_interval).await;
        }
        if !ready {
            return Err(RestoreError::DatabaseNotReady {
                service: service.name().to_string(),
                attempts: self.db_ready_attempts,
            });
        }

        // Drop and recreate, idempotently: must not fail when the database
        // did not previously exist
        let drop_sql = format!("DROP DATABASE IF EXISTS {};", spec.db_name);
        self.runtime
            .exec(
                spec.db_container,
                &["psql", "-U", spec.db_role, "-d", "postgres", "-c", &drop_sql],
            )
            .await
            .map_err(step_err)?;
        let create_sql = format!("CREATE DATABASE {} OWNER {};", spec.db_name, spec.db_role);
        self.runtime
            .exec(
                spec.db_container,
                &["psql", "-U", spec.db_role, "-d", "postgres", "-c", &create_sql],
            )
            .await
            .map_err(step_err)?;

        // Stream the decrypted dump into the fresh database
        let sql = async {
            let bytes = self.cipher.decrypt_file(&artifact.path, passphrase).await?;
            gunzip(&bytes)
        }
        .await
        .map_err(step_err)?;

        self.runtime
            .exec_with_stdin(
                spec.db_container,
                &["psql", "-U", spec.db_role, "-d", spec.db_name, "-q"],
                &sql,
            )
            .await
            .map_err(step_err)?;

        Ok(())
    }

    async fn verify_live(&self, endpoint: &str, expected_status: u16) -> bool {
        for attempt in 0..self.liveness_attempts {
            let response = self
                .client
                .get(endpoint)
                .timeout(self.liveness_interval.max(Duration::from_secs(1)))
                .send()
                .await;

            if let Ok(response) = response {
                if response.status().as_u16() == expected_status {
                    return true;
                }
            }

            if attempt + 1 < self.liveness_attempts {
                tokio::time::sleep(self.liveness_interval).await;
            }
        }
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::archive::{gzip, tar_directory};
    use crate::core::backup::artifact_file_name;
    use anyhow::anyhow;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    type EventLog = Arc<Mutex<Vec<String>>>;

    /// Records every runtime call in a shared event log
    struct FakeRuntime {
        log: EventLog,
        fail_db_ready: bool,
    }

    #[async_trait]
    impl ContainerRuntime for FakeRuntime {
        async fn exec(&self, container: &str, cmd: &[&str]) -> Result<Vec<u8>> {
            self.log
                .lock()
                .unwrap()
                .push(format!("exec {} {}", container, cmd.join(" ")));
            if self.fail_db_ready && cmd[0] == "pg_isready" {
                return Err(anyhow!("connection refused"));
            }
            Ok(Vec::new())
        }

        async fn exec_with_stdin(&self, container: &str, cmd: &[&str], input: &[u8]) -> Result<()> {
            self.log.lock().unwrap().push(format!(
                "stdin {} {} ({} bytes)",
                container,
                cmd.join(" "),
                input.len()
            ));
            Ok(())
        }

        async fn container_status(&self, _: &str) -> Result<crate::core::runtime::RuntimeStatus> {
            Ok(crate::core::runtime::RuntimeStatus::Running)
        }

        async fn stop_components(&self, containers: &[&str]) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("stop {}", containers.join(",")));
            Ok(())
        }

        async fn start_components(&self, containers: &[&str]) -> Result<()> {
            self.log
                .lock()
                .unwrap()
                .push(format!("start {}", containers.join(",")));
            Ok(())
        }
    }

    /// Reads artifacts verbatim (fixtures are written unencrypted); can be
    /// told to reject everything, simulating a wrong passphrase
    struct FakeCipher {
        log: EventLog,
        reject: bool,
    }

    #[async_trait]
    impl ArtifactCipher for FakeCipher {
        async fn encrypt_to_file(&self, plaintext: &[u8], dest: &Path, _: &str) -> Result<()> {
            fs::write(dest, plaintext)?;
            Ok(())
        }

        async fn decrypt_file(&self, src: &Path, _: &str) -> Result<Vec<u8>> {
            self.log.lock().unwrap().push(format!(
                "decrypt {}",
                src.file_name().unwrap().to_string_lossy()
            ));
            if self.reject {
                return Err(anyhow!("bad session key"));
            }
            Ok(fs::read(src)?)
        }
    }

    const TOKEN: &str = "20250830_120000";

    struct Fixture {
        root: TempDir,
        log: EventLog,
    }

    impl Fixture {
        /// Deploy root with a live data dir and secret store, plus on-disk
        /// artifacts for chat (db + data) and a shared secrets artifact
        fn new() -> Self {
            let root = TempDir::new().unwrap();
            let log: EventLog = Arc::new(Mutex::new(Vec::new()));

            // Live state that a restore will replace
            fs::create_dir_all(root.path().join("data/chat")).unwrap();
            fs::write(root.path().join("data/chat/current.txt"), "live data").unwrap();
            let secrets = SecretStore::new(root.path().join("secrets"));
            secrets.ensure_bundle(ServiceKind::Chat).unwrap();

            // Backed-up state
            let staged_data = TempDir::new().unwrap();
            fs::write(staged_data.path().join("restored.txt"), "from backup").unwrap();
            let staged_secrets = TempDir::new().unwrap();
            fs::create_dir_all(staged_secrets.path().join("chat")).unwrap();
            fs::write(staged_secrets.path().join("chat/db_password"), "cafe1234").unwrap();

            let backups = root.path().join("backups");
            fs::create_dir_all(&backups).unwrap();
            fs::write(
                backups.join(artifact_file_name(
                    Some(ServiceKind::Chat),
                    ArtifactKind::Database,
                    TOKEN,
                )),
                gzip(b"CREATE TABLE rooms (id int);\n").unwrap(),
            )
            .unwrap();
            fs::write(
                backups.join(artifact_file_name(
                    Some(ServiceKind::Chat),
                    ArtifactKind::Data,
                    TOKEN,
                )),
                tar_directory(staged_data.path()).unwrap(),
            )
            .unwrap();
            fs::write(
                backups.join(artifact_file_name(None, ArtifactKind::Secrets, TOKEN)),
                tar_directory(staged_secrets.path()).unwrap(),
            )
            .unwrap();

            Self { root, log }
        }

        fn orchestrator(&self, reject: bool, fail_db_ready: bool) -> RestoreOrchestrator {
            RestoreOrchestrator::new(
                Arc::new(FakeRuntime {
                    log: self.log.clone(),
                    fail_db_ready,
                }),
                Arc::new(FakeCipher {
                    log: self.log.clone(),
                    reject,
                }),
                SecretStore::new(self.root.path().join("secrets")),
                self.root.path().join("backups"),
                self.root.path().to_path_buf(),
                2,
                Duration::ZERO,
                1,
                Duration::ZERO,
            )
        }

        fn events(&self) -> Vec<String> {
            self.log.lock().unwrap().clone()
        }
    }

    fn position(events: &[String], needle: &str) -> usize {
        events
            .iter()
            .position(|e| e.contains(needle))
            .unwrap_or_else(|| panic!("no event containing '{}' in {:?}", needle, events))
    }

    #[tokio::test]
    async fn test_wrong_passphrase_causes_no_outage() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(true, false);

        let err = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Chat), TOKEN, "wrong")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::DecryptionRejected(_)));

        // Nothing was stopped, nothing was replaced
        let events = fixture.events();
        assert!(!events.iter().any(|e| e.starts_with("stop")));
        assert_eq!(
            fs::read_to_string(fixture.root.path().join("data/chat/current.txt")).unwrap(),
            "live data"
        );
        assert!(fixture.root.path().join("secrets/chat/signing_key").exists());
    }

    #[tokio::test]
    async fn test_missing_artifact_fails_before_any_side_effect() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, false);

        let err = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Forum), TOKEN, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::MissingArtifact { .. }));
        assert!(fixture.events().is_empty());
    }

    #[tokio::test]
    async fn test_full_restore_ordering_and_aside_invariants() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, false);

        let outcome = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Chat), TOKEN, "pw")
            .await
            .unwrap();

        // Endpoint is not served in tests, so liveness is a warning, not an
        // error, and no step was undone
        assert!(matches!(outcome, RestoreOutcome::CompletedWithWarnings(_)));

        let events = fixture.events();

        // Secrets are restored strictly before the stack is touched
        assert!(position(&events, "decrypt secrets_") < position(&events, "stop "));
        // Stop precedes the data decrypt, which precedes the db bring-up
        assert!(position(&events, "stop chat-db") < position(&events, "decrypt chat_data"));
        assert!(position(&events, "decrypt chat_data") < position(&events, "start chat-db"));
        // Readiness probe, drop/recreate, dump replay, then the full stack
        assert!(position(&events, "pg_isready") < position(&events, "DROP DATABASE IF EXISTS"));
        assert!(
            position(&events, "DROP DATABASE IF EXISTS") < position(&events, "CREATE DATABASE")
        );
        assert!(position(&events, "CREATE DATABASE") < position(&events, "stdin chat-db psql"));
        assert!(
            position(&events, "stdin chat-db psql")
                < position(&events, "start chat-cache,chat-worker,chat-app")
        );

        // Data directory replaced, previous content moved aside (not deleted)
        let data_dir = fixture.root.path().join("data/chat");
        assert_eq!(
            fs::read_to_string(data_dir.join("restored.txt")).unwrap(),
            "from backup"
        );
        let aside: Vec<_> = fs::read_dir(fixture.root.path().join("data"))
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("chat.backup."))
            .collect();
        assert_eq!(aside.len(), 1);
        assert!(aside[0].path().join("current.txt").exists());

        // Secret store replaced from the artifact, previous store retained
        assert_eq!(
            fs::read_to_string(fixture.root.path().join("secrets/chat/db_password")).unwrap(),
            "cafe1234"
        );
        let secret_asides: Vec<_> = fs::read_dir(fixture.root.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .starts_with("secrets.pre-restore.")
            })
            .collect();
        assert_eq!(secret_asides.len(), 1);

        // Lock released after the run
        assert!(!fixture.root.path().join(".fedops-restore-chat.lock").exists());
    }

    #[tokio::test]
    async fn test_secrets_only_restore_touches_no_service() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, false);

        let outcome = orchestrator
            .restore(RestoreTarget::SecretsOnly, TOKEN, "pw")
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::Completed));

        let events = fixture.events();
        assert!(!events.iter().any(|e| e.starts_with("stop")));
        assert!(!events.iter().any(|e| e.starts_with("start")));
        assert_eq!(
            fs::read_to_string(fixture.root.path().join("secrets/chat/db_password")).unwrap(),
            "cafe1234"
        );
    }

    #[tokio::test]
    async fn test_database_readiness_budget_is_fatal() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, true);

        let err = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Chat), TOKEN, "pw")
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            RestoreError::DatabaseNotReady { attempts: 2, .. }
        ));

        // The restore stopped exactly where the budget ran out: no drop, no
        // replay, no restart of the remaining components
        let events = fixture.events();
        assert!(!events.iter().any(|e| e.contains("DROP DATABASE")));
        assert!(!events.iter().any(|e| e.contains("stdin")));
    }

    #[tokio::test]
    async fn test_both_services_share_one_secrets_restore() {
        let fixture = Fixture::new();

        // Forum artifacts and live state alongside the chat fixture
        fs::create_dir_all(fixture.root.path().join("data/forum")).unwrap();
        let staged = TempDir::new().unwrap();
        fs::write(staged.path().join("restored.txt"), "forum backup").unwrap();
        let backups = fixture.root.path().join("backups");
        fs::write(
            backups.join(artifact_file_name(
                Some(ServiceKind::Forum),
                ArtifactKind::Database,
                TOKEN,
            )),
            gzip(b"CREATE TABLE posts (id int);\n").unwrap(),
        )
        .unwrap();
        fs::write(
            backups.join(artifact_file_name(
                Some(ServiceKind::Forum),
                ArtifactKind::Data,
                TOKEN,
            )),
            tar_directory(staged.path()).unwrap(),
        )
        .unwrap();

        let orchestrator = fixture.orchestrator(false, false);
        let outcome = orchestrator
            .restore(RestoreTarget::Both, TOKEN, "pw")
            .await
            .unwrap();
        assert!(matches!(outcome, RestoreOutcome::CompletedWithWarnings(_)));

        // The secret store is decrypted and rewritten exactly once, strictly
        // before either service is stopped
        let events = fixture.events();
        let secrets_decrypts = events
            .iter()
            .filter(|e| e.starts_with("decrypt secrets_"))
            .count();
        assert_eq!(secrets_decrypts, 1);
        assert!(position(&events, "decrypt secrets_") < position(&events, "stop chat-db"));
        assert!(position(&events, "decrypt secrets_") < position(&events, "stop forum-db"));

        // Both stacks got their data back
        assert!(fixture
            .root
            .path()
            .join("data/forum/restored.txt")
            .exists());
        assert!(fixture.root.path().join("data/chat/restored.txt").exists());
    }

    #[tokio::test]
    async fn test_service_restore_honors_secret_store_lock() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, false);

        // A secrets-only restore is in flight; a chat restore would rewrite
        // the same store, so it must fail fast
        fs::write(
            fixture.root.path().join(".fedops-restore-secrets.lock"),
            "123",
        )
        .unwrap();

        let err = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Chat), TOKEN, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Locked(ref name, _) if name == "secrets"));
        assert!(fixture.events().is_empty());
        assert_eq!(
            fs::read_to_string(fixture.root.path().join("data/chat/current.txt")).unwrap(),
            "live data"
        );
    }

    #[tokio::test]
    async fn test_concurrent_restore_of_same_service_is_rejected() {
        let fixture = Fixture::new();
        let orchestrator = fixture.orchestrator(false, false);

        // Simulate a restore already holding the lock
        fs::write(fixture.root.path().join(".fedops-restore-chat.lock"), "123").unwrap();

        let err = orchestrator
            .restore(RestoreTarget::Service(ServiceKind::Chat), TOKEN, "pw")
            .await
            .unwrap_err();
        assert!(matches!(err, RestoreError::Locked(_, _)));
        assert!(fixture.events().is_empty());
    }

    #[test]
    fn test_restore_target_parsing() {
        assert_eq!(
            "chat".parse::<RestoreTarget>().unwrap(),
            RestoreTarget::Service(ServiceKind::Chat)
        );
        assert_eq!("both".parse::<RestoreTarget>().unwrap(), RestoreTarget::Both);
        assert_eq!(
            "secrets".parse::<RestoreTarget>().unwrap(),
            RestoreTarget::SecretsOnly
        );
        assert!("everything".parse::<RestoreTarget>().is_err());
    }
}
