/// Health checking for the deployed stacks
///
/// Every check is independent, idempotent and read-only. Results fold into a
/// single report through a pure aggregation rule: the overall status is
/// healthy only when every individual check is healthy. Warnings are shown
/// separately but still fail the aggregate.

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use crate::core::config::ResourceThresholds;
use crate::core::runtime::{ContainerRuntime, RuntimeStatus};
use crate::utils::{ServiceKind, FAIL2BAN_UNIT, PROXY_CONTAINER};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OverallStatus {
    Healthy,
    Unhealthy,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub status: CheckStatus,
    pub message: String,
}

impl CheckResult {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Healthy,
            message: message.into(),
        }
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Warning,
            message: message.into(),
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        Self {
            status: CheckStatus::Critical,
            message: message.into(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthReport {
    pub timestamp: DateTime<Utc>,
    pub overall_status: OverallStatus,
    pub checks: BTreeMap<String, CheckResult>,
}

impl HealthReport {
    pub fn counts(&self) -> (usize, usize, usize) {
        let mut healthy = 0;
        let mut warning = 0;
        let mut critical = 0;
        for result in self.checks.values() {
            match result.status {
                CheckStatus::Healthy => healthy += 1,
                CheckStatus::Warning => warning += 1,
                CheckStatus::Critical => critical += 1,
            }
        }
        (healthy, warning, critical)
    }
}

/// Which services to check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthScope {
    Service(ServiceKind),
    All,
}

impl HealthScope {
    fn services(&self) -> Vec<ServiceKind> {
        match self {
            HealthScope::Service(service) => vec![*service],
            HealthScope::All => ServiceKind::all().to_vec(),
        }
    }
}

/// Fail-closed aggregate: healthy iff every result is healthy
pub fn fold_overall<'a>(results: impl IntoIterator<Item = &'a CheckResult>) -> OverallStatus {
    let all_healthy = results
        .into_iter()
        .all(|r| r.status == CheckStatus::Healthy);
    if all_healthy {
        OverallStatus::Healthy
    } else {
        OverallStatus::Unhealthy
    }
}

/// Classify a usage percentage against warning/critical thresholds
pub fn classify_pct(used_pct: f64, warn: f64, crit: f64) -> CheckStatus {
    if used_pct >= crit {
        CheckStatus::Critical
    } else if used_pct >= warn {
        CheckStatus::Warning
    } else {
        CheckStatus::Healthy
    }
}

/// Classify a one-minute load average against per-core factors
pub fn classify_load(load_one: f64, cores: usize, warn_factor: f64, crit_factor: f64) -> CheckStatus {
    let cores = cores.max(1) as f64;
    if load_one >= cores * crit_factor {
        CheckStatus::Critical
    } else if load_one >= cores * warn_factor {
        CheckStatus::Warning
    } else {
        CheckStatus::Healthy
    }
}

/// Map a container run status to a check result
pub fn classify_container(name: &str, status: &RuntimeStatus) -> CheckResult {
    match status {
        RuntimeStatus::Running => CheckResult::healthy(format!("{} is running", name)),
        RuntimeStatus::Exited => CheckResult::critical(format!("{} has exited", name)),
        RuntimeStatus::NotFound => CheckResult::critical(format!("{} not found", name)),
        RuntimeStatus::Other(state) => {
            CheckResult::warning(format!("{} is in state '{}'", name, state))
        }
    }
}

pub struct HealthChecker {
    runtime: Arc<dyn ContainerRuntime>,
    client: reqwest::Client,
    thresholds: ResourceThresholds,
    timeout: Duration,
}

impl HealthChecker {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        thresholds: ResourceThresholds,
        timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            client: reqwest::Client::new(),
            thresholds,
            timeout,
        }
    }

    /// Run every check for the scope and fold the results into one report
    pub async fn run(&self, scope: HealthScope) -> Result<HealthReport> {
        let mut checks = BTreeMap::new();

        for service in scope.services() {
            self.check_service(service, &mut checks).await;
        }

        self.check_resources(&mut checks);
        self.check_perimeter(&mut checks).await;

        let overall_status = fold_overall(checks.values());
        Ok(HealthReport {
            timestamp: Utc::now(),
            overall_status,
            checks,
        })
    }

    async fn check_service(&self, service: ServiceKind, checks: &mut BTreeMap<String, CheckResult>) {
        let spec = service.spec();

        // Component liveness, probed concurrently; results are independent
        let components = service.components();
        let statuses = join_all(
            components
                .iter()
                .map(|name| self.runtime.container_status(name)),
        )
        .await;

        for (name, status) in components.iter().zip(statuses) {
            let result = match status {
                Ok(status) => classify_container(name, &status),
                Err(e) => CheckResult::warning(format!("{}: status unavailable ({})", name, e)),
            };
            checks.insert((*name).to_string(), result);
        }

        // Database readiness: lightweight probe, then a real query
        let db_check = format!("{}-db-query", service);
        let probe = self
            .runtime
            .exec(spec.db_container, &["pg_isready", "-U", spec.db_role])
            .await;
        let result = match probe {
            Err(e) => CheckResult::critical(format!("pg_isready failed: {}", e)),
            Ok(_) => {
                let query = self
                    .runtime
                    .exec(
                        spec.db_container,
                        &["psql", "-U", spec.db_role, "-d", spec.db_name, "-tAc", "SELECT 1"],
                    )
                    .await;
                match query {
                    Ok(_) => CheckResult::healthy("database accepts queries"),
                    Err(e) => CheckResult::critical(format!("test query failed: {}", e)),
                }
            }
        };
        checks.insert(db_check, result);

        // Cache readiness
        let cache_check = format!("{}-cache-ping", service);
        let ping = self
            .runtime
            .exec(spec.cache_container, &["redis-cli", "ping"])
            .await;
        let result = match ping {
            Ok(output) if String::from_utf8_lossy(&output).trim() == "PONG" => {
                CheckResult::healthy("cache responds to PING")
            }
            Ok(output) => CheckResult::critical(format!(
                "unexpected PING reply: {}",
                String::from_utf8_lossy(&output).trim()
            )),
            Err(e) => CheckResult::critical(format!("cache unreachable: {}", e)),
        };
        checks.insert(cache_check, result);

        // Primary HTTP endpoint
        let endpoint_check = format!("{}-endpoint", service);
        let response = self
            .client
            .get(spec.endpoint)
            .timeout(self.timeout)
            .send()
            .await;
        let result = match response {
            Ok(response) if response.status().as_u16() == spec.expected_status => {
                CheckResult::healthy(format!("{} returned {}", spec.endpoint, response.status()))
            }
            Ok(response) => CheckResult::critical(format!(
                "{} returned {} (expected {})",
                spec.endpoint,
                response.status(),
                spec.expected_status
            )),
            Err(e) => CheckResult::critical(format!("{} unreachable: {}", spec.endpoint, e)),
        };
        checks.insert(endpoint_check, result);
    }

    /// Host-level disk, memory and load checks. Threshold breaches are never
    /// fatal to anything; they only surface in the report.
    fn check_resources(&self, checks: &mut BTreeMap<String, CheckResult>) {
        use sysinfo::{Disks, System};

        let t = self.thresholds;

        // Disk: root filesystem
        let disks = Disks::new_with_refreshed_list();
        let root_disk = disks
            .iter()
            .find(|d| d.mount_point() == std::path::Path::new("/"))
            .or_else(|| disks.iter().next());
        let result = match root_disk {
            Some(disk) if disk.total_space() > 0 => {
                let used = disk.total_space() - disk.available_space();
                let pct = used as f64 / disk.total_space() as f64 * 100.0;
                CheckResult {
                    status: classify_pct(pct, t.disk_warn_pct, t.disk_crit_pct),
                    message: format!("{:.1}% used on {}", pct, disk.mount_point().display()),
                }
            }
            _ => CheckResult::warning("no disk information available".to_string()),
        };
        checks.insert("disk".to_string(), result);

        let mut sys = System::new();
        sys.refresh_memory();
        sys.refresh_cpu();

        // Memory
        let result = if sys.total_memory() > 0 {
            let pct = sys.used_memory() as f64 / sys.total_memory() as f64 * 100.0;
            CheckResult {
                status: classify_pct(pct, t.mem_warn_pct, t.mem_crit_pct),
                message: format!("{:.1}% of memory used", pct),
            }
        } else {
            CheckResult::warning("no memory information available".to_string())
        };
        checks.insert("memory".to_string(), result);

        // Load average vs core count
        let load = System::load_average();
        let cores = sys.cpus().len();
        checks.insert(
            "load".to_string(),
            CheckResult {
                status: classify_load(load.one, cores, t.load_warn_factor, t.load_crit_factor),
                message: format!("load {:.2} on {} cores", load.one, cores),
            },
        );
    }

    /// Perimeter collaborators: probed for status only, never managed here
    async fn check_perimeter(&self, checks: &mut BTreeMap<String, CheckResult>) {
        // Intrusion prevention runs on the host, outside the compose project
        let result = match tokio::process::Command::new("systemctl")
            .args(["is-active", "--quiet", FAIL2BAN_UNIT])
            .status()
            .await
        {
            Ok(status) if status.success() => {
                CheckResult::healthy(format!("{} is active", FAIL2BAN_UNIT))
            }
            Ok(_) => CheckResult::critical(format!("{} is not active", FAIL2BAN_UNIT)),
            Err(e) => CheckResult::warning(format!("could not query systemctl: {}", e)),
        };
        checks.insert(FAIL2BAN_UNIT.to_string(), result);

        let result = match self.runtime.container_status(PROXY_CONTAINER).await {
            Ok(status) => classify_container(PROXY_CONTAINER, &status),
            Err(e) => CheckResult::warning(format!("proxy status unavailable: {}", e)),
        };
        checks.insert(PROXY_CONTAINER.to_string(), result);
    }
}
