/// Operational configuration from stack.env
///
/// Reads the deployment's `stack.env` (same key=value format the stacks use).
/// Every key has a default, so a missing file yields a fully usable
/// configuration; `validate()` reports inconsistent overrides.

use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::constants::*;

#[derive(Debug, Clone)]
pub struct ConfigValue {
    pub key: String,
    pub value: String,
    pub comment: Option<String>,
}

/// Resource check thresholds, percent of capacity (load as factor per core)
#[derive(Debug, Clone, Copy)]
pub struct ResourceThresholds {
    pub disk_warn_pct: f64,
    pub disk_crit_pct: f64,
    pub mem_warn_pct: f64,
    pub mem_crit_pct: f64,
    pub load_warn_factor: f64,
    pub load_crit_factor: f64,
}

pub struct OpsConfig {
    deploy_root: PathBuf,
    config: HashMap<String, ConfigValue>,
}

impl OpsConfig {
    /// Load configuration from `<deploy_root>/stack.env`; a missing file
    /// yields defaults for everything.
    pub fn load(deploy_root: &Path) -> Result<Self> {
        let env_file = deploy_root.join("stack.env");

        let mut config = HashMap::new();
        if env_file.exists() {
            let content = fs::read_to_string(&env_file)
                .context("Failed to read stack.env")?;

            let mut current_comment = None;
            for line in content.lines() {
                let line = line.trim();

                if line.starts_with('#') {
                    current_comment = Some(line.trim_start_matches('#').trim().to_string());
                    continue;
                }

                if line.is_empty() {
                    current_comment = None;
                    continue;
                }

                if let Some((key, value)) = line.split_once('=') {
                    let key = key.trim().to_string();
                    let value = value.trim().to_string();

                    config.insert(
                        key.clone(),
                        ConfigValue {
                            key: key.clone(),
                            value,
                            comment: current_comment.take(),
                        },
                    );
                }
            }
        }

        Ok(Self {
            deploy_root: deploy_root.to_path_buf(),
            config,
        })
    }

    pub fn deploy_root(&self) -> &Path {
        &self.deploy_root
    }

    /// Get a raw configuration value
    pub fn get(&self, key: &str) -> Option<&str> {
        self.config.get(key).map(|v| v.value.as_str())
    }

    fn get_u64(&self, key: &str, default: u64) -> u64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn get_f64(&self, key: &str, default: f64) -> f64 {
        self.get(key)
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    fn dir(&self, key: &str, default: &str) -> PathBuf {
        let value = self.get(key).unwrap_or(default);
        let path = PathBuf::from(value);
        if path.is_absolute() {
            path
        } else {
            self.deploy_root.join(path)
        }
    }

    /// Flat directory holding all encrypted artifacts
    pub fn backup_dir(&self) -> PathBuf {
        self.dir("BACKUP_DIR", "backups")
    }

    /// Root of the secret store
    pub fn secret_store_dir(&self) -> PathBuf {
        self.dir("SECRET_STORE_DIR", "secrets")
    }

    /// Artifact retention in days
    pub fn retention_days(&self) -> u64 {
        self.get_u64("RETENTION_DAYS", DEFAULT_RETENTION_DAYS)
    }

    /// Bounded polling budget for a restarted database
    pub fn db_ready_attempts(&self) -> u32 {
        self.get_u64("DB_READY_ATTEMPTS", DEFAULT_DB_READY_ATTEMPTS as u64) as u32
    }

    pub fn db_ready_interval_secs(&self) -> u64 {
        self.get_u64("DB_READY_INTERVAL_SECS", DEFAULT_DB_READY_INTERVAL_SECS)
    }

    /// Bounded polling budget for post-restore liveness
    pub fn liveness_attempts(&self) -> u32 {
        self.get_u64("LIVENESS_ATTEMPTS", DEFAULT_LIVENESS_ATTEMPTS as u64) as u32
    }

    pub fn liveness_interval_secs(&self) -> u64 {
        self.get_u64("LIVENESS_INTERVAL_SECS", DEFAULT_LIVENESS_INTERVAL_SECS)
    }

    pub fn thresholds(&self) -> ResourceThresholds {
        ResourceThresholds {
            disk_warn_pct: self.get_f64("DISK_WARN_PCT", DEFAULT_DISK_WARN_PCT),
            disk_crit_pct: self.get_f64("DISK_CRIT_PCT", DEFAULT_DISK_CRIT_PCT),
            mem_warn_pct: self.get_f64("MEM_WARN_PCT", DEFAULT_MEM_WARN_PCT),
            mem_crit_pct: self.get_f64("MEM_CRIT_PCT", DEFAULT_MEM_CRIT_PCT),
            load_warn_factor: self.get_f64("LOAD_WARN_FACTOR", DEFAULT_LOAD_WARN_FACTOR),
            load_crit_factor: self.get_f64("LOAD_CRIT_FACTOR", DEFAULT_LOAD_CRIT_FACTOR),
        }
    }

    /// Validate configuration overrides
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();

        if self.retention_days() == 0 {
            errors.push("RETENTION_DAYS must be at least 1".to_string());
        }

        if self.db_ready_attempts() == 0 {
            errors.push("DB_READY_ATTEMPTS must be at least 1".to_string());
        }

        let t = self.thresholds();
        if t.disk_warn_pct >= t.disk_crit_pct {
            errors.push("DISK_WARN_PCT must be below DISK_CRIT_PCT".to_string());
        }
        if t.mem_warn_pct >= t.mem_crit_pct {
            errors.push("MEM_WARN_PCT must be below MEM_CRIT_PCT".to_string());
        }
        if t.load_warn_factor >= t.load_crit_factor {
            errors.push("LOAD_WARN_FACTOR must be below LOAD_CRIT_FACTOR".to_string());
        }

        for key in ["DISK_WARN_PCT", "DISK_CRIT_PCT", "MEM_WARN_PCT", "MEM_CRIT_PCT"] {
            if let Some(value) = self.get(key) {
                match value.parse::<f64>() {
                    Ok(pct) if (0.0..=100.0).contains(&pct) => {}
                    _ => errors.push(format!("{} must be a percentage between 0 and 100", key)),
                }
            }
        }

        errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::TempDir;

    fn write_stack_env(dir: &TempDir, body: &str) {
        let mut file = std::fs::File::create(dir.path().join("stack.env")).unwrap();
        write!(file, "{}", body).unwrap();
    }

    #[test]
    fn test_defaults_without_file() {
        let dir = TempDir::new().unwrap();
        let config = OpsConfig::load(dir.path()).unwrap();

        assert_eq!(config.retention_days(), 30);
        assert_eq!(config.backup_dir(), dir.path().join("backups"));
        assert_eq!(config.secret_store_dir(), dir.path().join("secrets"));
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_overrides_and_comments() {
        let dir = TempDir::new().unwrap();
        write_stack_env(
            &dir,
            "# Keep six weeks of backups\nRETENTION_DAYS=42\nBACKUP_DIR=/mnt/backups\nDISK_WARN_PCT=70\n",
        );

        let config = OpsConfig::load(dir.path()).unwrap();
        assert_eq!(config.retention_days(), 42);
        assert_eq!(config.backup_dir(), PathBuf::from("/mnt/backups"));
        assert_eq!(config.thresholds().disk_warn_pct, 70.0);
        assert!(config.validate().is_empty());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let dir = TempDir::new().unwrap();
        write_stack_env(&dir, "MEM_WARN_PCT=96\nMEM_CRIT_PCT=95\n");

        let config = OpsConfig::load(dir.path()).unwrap();
        let errors = config.validate();
        assert!(errors.iter().any(|e| e.contains("MEM_WARN_PCT")));
    }

    #[test]
    fn test_validate_rejects_zero_retention() {
        let dir = TempDir::new().unwrap();
        write_stack_env(&dir, "RETENTION_DAYS=0\n");

        let config = OpsConfig::load(dir.path()).unwrap();
        assert!(!config.validate().is_empty());
    }
}
