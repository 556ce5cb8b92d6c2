/// Docker and Docker Compose integration
///
/// All interaction with the running stacks goes through the
/// [`ContainerRuntime`] trait so backup, restore and health logic can be
/// tested against fakes. The production implementation talks to the Docker
/// daemon via bollard and drives lifecycle operations through
/// `docker compose`, mirroring what an operator would type by hand.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use bollard::models::ContainerStateStatusEnum;
use bollard::Docker;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::Duration;

use crate::utils::ServiceKind;

/// Commands run inside containers (dump, psql, redis-cli) must return within
/// this budget; a hung command is treated as a failure, never waited on
/// forever. Dumps of large databases are the slowest case.
const EXEC_TIMEOUT: Duration = Duration::from_secs(900);

/// Simplified container run status as reported by the Docker daemon
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeStatus {
    Running,
    Exited,
    NotFound,
    Other(String),
}

#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Run a command inside a running container and capture stdout
    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<Vec<u8>>;

    /// Run a command inside a running container, feeding `input` to stdin
    async fn exec_with_stdin(&self, container: &str, cmd: &[&str], input: &[u8]) -> Result<()>;

    /// Query the run status of a single container
    async fn container_status(&self, container: &str) -> Result<RuntimeStatus>;

    /// Stop the given compose services
    async fn stop_components(&self, containers: &[&str]) -> Result<()>;

    /// Start the given compose services (without pulling in dependents)
    async fn start_components(&self, containers: &[&str]) -> Result<()>;
}

pub struct DockerRuntime {
    docker: Docker,
    deploy_root: PathBuf,
    compose_file: PathBuf,
}

impl DockerRuntime {
    /// Connect to the local Docker daemon and locate docker-compose.yml
    pub fn new(deploy_root: &Path) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("Failed to connect to Docker daemon. Is Docker running?")?;

        let compose_file = deploy_root.join("docker-compose.yml");
        if !compose_file.exists() {
            return Err(anyhow!(
                "docker-compose.yml not found at {}",
                compose_file.display()
            ));
        }

        Ok(Self {
            docker,
            deploy_root: deploy_root.to_path_buf(),
            compose_file,
        })
    }

    pub fn deploy_root(&self) -> &Path {
        &self.deploy_root
    }

    /// Check if Docker daemon is accessible
    pub async fn check_docker(&self) -> Result<bool> {
        match self.docker.ping().await {
            Ok(_) => Ok(true),
            Err(_) => Ok(false),
        }
    }

    /// Execute a docker-compose command
    async fn compose_command(&self, args: &[&str]) -> Result<String> {
        let mut cmd = Command::new("docker");
        cmd.arg("compose")
            .args(args)
            .current_dir(&self.deploy_root)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = cmd.output()
            .context("Failed to execute docker compose command")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("Docker compose command failed: {}", stderr));
        }

        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    /// Services deployed on this host, discovered from docker-compose.yml.
    /// A stack counts as deployed when its application service is declared.
    pub fn deployed_services(&self) -> Result<Vec<ServiceKind>> {
        use serde_yaml::Value;

        let compose_content = std::fs::read_to_string(&self.compose_file)
            .context("Failed to read docker-compose.yml")?;

        let yaml: Value = serde_yaml::from_str(&compose_content)
            .context("Failed to parse docker-compose.yml")?;

        let mut deployed = Vec::new();
        if let Some(services_map) = yaml.get("services").and_then(|s| s.as_mapping()) {
            for service in ServiceKind::all() {
                let declared = services_map
                    .keys()
                    .filter_map(|k| k.as_str())
                    .any(|name| name == service.spec().app_container);
                if declared {
                    deployed.push(service);
                }
            }
        }

        Ok(deployed)
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<Vec<u8>> {
        let mut command = tokio::process::Command::new("docker");
        command
            .args(["compose", "exec", "-T", container])
            .args(cmd)
            .current_dir(&self.deploy_root)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = tokio::time::timeout(EXEC_TIMEOUT, command.output())
            .await
            .map_err(|_| anyhow!("Command in {} timed out: {}", container, cmd.join(" ")))?
            .context("Failed to execute docker compose exec")?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Command failed in {} ({}): {}",
                container,
                cmd.join(" "),
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }

    async fn exec_with_stdin(&self, container: &str, cmd: &[&str], input: &[u8]) -> Result<()> {
        use tokio::io::AsyncWriteExt;

        let mut command = tokio::process::Command::new("docker");
        command
            .args(["compose", "exec", "-T", container])
            .args(cmd)
            .current_dir(&self.deploy_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let run = async {
            let mut child = command
                .spawn()
                .context("Failed to spawn docker compose exec")?;

            let mut stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("Failed to open stdin of exec'd command"))?;
            stdin.write_all(input).await?;
            drop(stdin);

            child.wait_with_output().await.map_err(anyhow::Error::from)
        };

        let output = tokio::time::timeout(EXEC_TIMEOUT, run)
            .await
            .map_err(|_| anyhow!("Command in {} timed out: {}", container, cmd.join(" ")))??;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "Command failed in {} ({}): {}",
                container,
                cmd.join(" "),
                stderr.trim()
            );
        }

        Ok(())
    }

    async fn container_status(&self, container: &str) -> Result<RuntimeStatus> {
        let inspect = match self.docker.inspect_container(container, None).await {
            Ok(inspect) => inspect,
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => return Ok(RuntimeStatus::NotFound),
            Err(e) => return Err(e).context("Failed to inspect container"),
        };

        let status = inspect
            .state
            .as_ref()
            .and_then(|s| s.status)
            .unwrap_or(ContainerStateStatusEnum::EMPTY);

        Ok(match status {
            ContainerStateStatusEnum::RUNNING => RuntimeStatus::Running,
            ContainerStateStatusEnum::EXITED | ContainerStateStatusEnum::DEAD => {
                RuntimeStatus::Exited
            }
            other => RuntimeStatus::Other(other.to_string()),
        })
    }

    async fn stop_components(&self, containers: &[&str]) -> Result<()> {
        let mut args = vec!["stop"];
        args.extend_from_slice(containers);
        self.compose_command(&args).await?;
        Ok(())
    }

    async fn start_components(&self, containers: &[&str]) -> Result<()> {
        let mut args = vec!["up", "-d", "--no-deps"];
        args.extend_from_slice(containers);
        self.compose_command(&args).await?;
        Ok(())
    }
}
