use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;

use fedops::cli::{BackupCommands, Cli, Commands, ConfigCommands};
use fedops::core::health::{CheckStatus, HealthScope, OverallStatus};
use fedops::core::restore::{RestoreOutcome, RestoreTarget};
use fedops::core::runtime::ContainerRuntime;
use fedops::core::{
    BackupEngine, DockerRuntime, GpgCipher, HealthChecker, OpsConfig, RestoreOrchestrator,
    SecretStore,
};
use fedops::utils::{
    format_bytes, get_deploy_root, is_valid_token, new_generation_token, ServiceKind, TOKEN_FORMAT,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Status => {
            handle_status().await?;
        }
        Commands::Backup { command } => match command {
            BackupCommands::Create { passphrase_env } => {
                handle_backup_create(&passphrase_env).await?;
            }
            BackupCommands::List => {
                handle_backup_list()?;
            }
        },
        Commands::Restore {
            target,
            generation,
            passphrase,
        } => {
            handle_restore(target, generation, passphrase).await?;
        }
        Commands::Health {
            verbose,
            json,
            service,
            timeout,
        } => {
            handle_health(verbose, json, &service, timeout).await?;
        }
        Commands::Config { command } => {
            handle_config(command)?;
        }
    }

    Ok(())
}

/// Read a line from stdin after printing a prompt
fn prompt(question: &str) -> Result<String> {
    print!("{}: ", question);
    std::io::stdout().flush()?;

    let mut line = String::new();
    std::io::stdin()
        .read_line(&mut line)
        .context("Failed to read from stdin")?;
    Ok(line.trim().to_string())
}

/// Passphrase from the environment, falling back to an interactive prompt
fn resolve_passphrase(env_var: &str) -> Result<String> {
    if let Ok(value) = std::env::var(env_var) {
        if !value.is_empty() {
            return Ok(value);
        }
    }

    let passphrase = prompt("Backup passphrase")?;
    if passphrase.is_empty() {
        bail!("A passphrase is required (set {} or enter one)", env_var);
    }
    Ok(passphrase)
}

fn backup_engine(runtime: Arc<DockerRuntime>, config: &OpsConfig) -> BackupEngine {
    BackupEngine::new(
        runtime,
        Arc::new(GpgCipher::new()),
        SecretStore::new(config.secret_store_dir()),
        config.backup_dir(),
        config.deploy_root().to_path_buf(),
        config.retention_days(),
    )
}

async fn handle_status() -> Result<()> {
    let deploy_root = get_deploy_root()?;
    let runtime = DockerRuntime::new(&deploy_root)?;

    if !runtime.check_docker().await? {
        bail!("Docker daemon is not reachable");
    }

    println!("Deployment Status");

    for service in runtime.deployed_services()? {
        println!("\n{}", service.spec().display_name.bold());
        for component in service.components() {
            let status = runtime.container_status(component).await?;
            println!("  {:<15} {:?}", component, status);
        }
    }

    Ok(())
}

async fn handle_backup_create(passphrase_env: &str) -> Result<()> {
    let deploy_root = get_deploy_root()?;
    let config = OpsConfig::load(&deploy_root)?;

    let errors = config.validate();
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("{} {}", "✗".red(), error);
        }
        bail!("Invalid configuration in stack.env");
    }

    let passphrase = resolve_passphrase(passphrase_env)?;
    let runtime = Arc::new(DockerRuntime::new(&deploy_root)?);

    let services = runtime.deployed_services()?;
    if services.is_empty() {
        bail!("No deployed services found in docker-compose.yml");
    }

    let engine = backup_engine(runtime, &config);
    let token = new_generation_token();
    println!("Creating backup generation {}\n", token);

    for service in &services {
        let spinner = indicatif::ProgressBar::new_spinner();
        spinner.enable_steady_tick(Duration::from_millis(100));
        spinner.set_message(format!("Backing up {}...", service));

        let generation = engine.create_backup(*service, &token, &passphrase).await;
        spinner.finish_and_clear();

        match generation {
            Ok(generation) => {
                for artifact in &generation.artifacts {
                    println!(
                        "{} {} ({})",
                        "✓".green(),
                        artifact.path.file_name().unwrap_or_default().to_string_lossy(),
                        format_bytes(artifact.size)
                    );
                }
            }
            Err(e) => {
                eprintln!("{} Backup of {} failed: {:#}", "✗".red(), service, e);
                std::process::exit(1);
            }
        }
    }

    // One shared secrets artifact per run
    if let Some(artifact) = engine.backup_secrets(&token, &passphrase).await? {
        println!(
            "{} {} ({})",
            "✓".green(),
            artifact.path.file_name().unwrap_or_default().to_string_lossy(),
            format_bytes(artifact.size)
        );
    }

    let removed = engine.apply_retention()?;
    if !removed.is_empty() {
        println!(
            "\nRetention: removed {} artifact(s) older than {} days",
            removed.len(),
            config.retention_days()
        );
    }

    println!("\nBackup generation {} complete", token);
    Ok(())
}

fn handle_backup_list() -> Result<()> {
    let deploy_root = get_deploy_root()?;
    let config = OpsConfig::load(&deploy_root)?;
    let runtime = Arc::new(DockerRuntime::new(&deploy_root)?);
    let engine = backup_engine(runtime, &config);

    let generations = engine.list_generations()?;
    if generations.is_empty() {
        println!("No backups found in {}", config.backup_dir().display());
        return Ok(());
    }

    println!("Backups in {}\n", config.backup_dir().display());
    for generation in generations {
        let age = chrono::NaiveDateTime::parse_from_str(&generation.token, TOKEN_FORMAT)
            .ok()
            .and_then(|dt| (chrono::Local::now().naive_local() - dt).to_std().ok())
            .map(|d| {
                format!(
                    "{} ago",
                    humantime::format_duration(Duration::from_secs(d.as_secs()))
                )
            })
            .unwrap_or_else(|| "age unknown".to_string());

        println!("{} ({})", generation.token, age);
        for artifact in &generation.artifacts {
            println!(
                "  {} ({})",
                artifact.path.file_name().unwrap_or_default().to_string_lossy(),
                format_bytes(artifact.size)
            );
        }
    }

    Ok(())
}

async fn handle_restore(
    target: String,
    generation: Option<String>,
    passphrase: Option<String>,
) -> Result<()> {
    let target: RestoreTarget = target.parse().map_err(|e: String| anyhow::anyhow!(e))?;

    let deploy_root = get_deploy_root()?;
    let config = OpsConfig::load(&deploy_root)?;
    let runtime = Arc::new(DockerRuntime::new(&deploy_root)?);

    let orchestrator = RestoreOrchestrator::new(
        runtime,
        Arc::new(GpgCipher::new()),
        SecretStore::new(config.secret_store_dir()),
        config.backup_dir(),
        deploy_root.clone(),
        config.db_ready_attempts(),
        Duration::from_secs(config.db_ready_interval_secs()),
        config.liveness_attempts(),
        Duration::from_secs(config.liveness_interval_secs()),
    );

    let token = match generation {
        Some(token) => token,
        None => {
            let tokens = orchestrator.available_tokens()?;
            if tokens.is_empty() {
                bail!("No backup generations found in {}", config.backup_dir().display());
            }
            println!("Available generations:");
            for token in &tokens {
                println!("  {}", token);
            }
            prompt("Generation to restore")?
        }
    };

    if !is_valid_token(&token) {
        bail!("'{}' is not a valid generation token (expected YYYYMMDD_HHMMSS)", token);
    }

    let passphrase = match passphrase {
        Some(passphrase) => passphrase,
        None => resolve_passphrase("FEDOPS_PASSPHRASE")?,
    };

    println!("Restoring {} from generation {}...", target, token);

    match orchestrator.restore(target, &token, &passphrase).await {
        Ok(RestoreOutcome::Completed) => {
            println!("{} Restore completed", "✓".green());
        }
        Ok(RestoreOutcome::CompletedWithWarnings(warnings)) => {
            println!("{} Restore completed with warnings:", "✓".green());
            for warning in warnings {
                println!("  {} {}", "⚠".yellow(), warning);
            }
        }
        Err(e) => {
            eprintln!("{} Restore failed: {}", "✗".red(), e);
            std::process::exit(1);
        }
    }

    Ok(())
}

async fn handle_health(verbose: bool, json: bool, service: &str, timeout: u64) -> Result<()> {
    let scope = match service {
        "all" => HealthScope::All,
        other => HealthScope::Service(
            other
                .parse::<ServiceKind>()
                .map_err(|e| anyhow::anyhow!(e))?,
        ),
    };

    let deploy_root = get_deploy_root()?;
    let config = OpsConfig::load(&deploy_root)?;
    let runtime = Arc::new(DockerRuntime::new(&deploy_root)?);

    let checker = HealthChecker::new(
        runtime,
        config.thresholds(),
        Duration::from_secs(timeout),
    );

    let report = checker.run(scope).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        let (healthy, warning, critical) = report.counts();
        println!("Health Report ({})\n", report.timestamp.format("%Y-%m-%d %H:%M:%S UTC"));
        println!(
            "{} healthy, {} warning, {} critical\n",
            healthy.to_string().green(),
            warning.to_string().yellow(),
            critical.to_string().red()
        );

        for (name, result) in &report.checks {
            let marker = match result.status {
                CheckStatus::Healthy => {
                    if !verbose {
                        continue;
                    }
                    "✓".green()
                }
                CheckStatus::Warning => "⚠".yellow(),
                CheckStatus::Critical => "✗".red(),
            };
            println!("{} {:<20} {}", marker, name, result.message);
        }

        match report.overall_status {
            OverallStatus::Healthy => println!("\nOverall: {}", "healthy".green()),
            OverallStatus::Unhealthy => println!("\nOverall: {}", "unhealthy".red()),
        }
    }

    if report.overall_status != OverallStatus::Healthy {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    let deploy_root = get_deploy_root()?;
    let config = OpsConfig::load(&deploy_root)?;

    match command {
        ConfigCommands::View => {
            println!("Effective configuration ({}):\n", deploy_root.display());
            println!("backup_dir:        {}", config.backup_dir().display());
            println!("secret_store_dir:  {}", config.secret_store_dir().display());
            println!("retention_days:    {}", config.retention_days());
            println!("db_ready_attempts: {}", config.db_ready_attempts());

            let t = config.thresholds();
            println!("disk thresholds:   warn {:.0}% / crit {:.0}%", t.disk_warn_pct, t.disk_crit_pct);
            println!("mem thresholds:    warn {:.0}% / crit {:.0}%", t.mem_warn_pct, t.mem_crit_pct);
            println!("load factors:      warn {:.1}x / crit {:.1}x cores", t.load_warn_factor, t.load_crit_factor);
        }
        ConfigCommands::Validate => {
            let errors = config.validate();
            if errors.is_empty() {
                println!("{} Configuration is valid", "✓".green());
            } else {
                println!("{} Configuration errors:", "✗".red());
                for error in errors {
                    println!("  - {}", error);
                }
                std::process::exit(1);
            }
        }
    }

    Ok(())
}
