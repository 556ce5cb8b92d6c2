/// Helper utilities for the fedops CLI

use anyhow::{Context, Result};
use chrono::{Local, NaiveDateTime};
use std::path::PathBuf;

/// Timestamp token format shared by every artifact of a backup generation.
/// Fixed width, second precision, lexicographically sortable.
pub const TOKEN_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Allocate a new generation token from the local clock
pub fn new_generation_token() -> String {
    Local::now().format(TOKEN_FORMAT).to_string()
}

/// Check that a string is a well-formed generation token
pub fn is_valid_token(token: &str) -> bool {
    token.len() == 15 && NaiveDateTime::parse_from_str(token, TOKEN_FORMAT).is_ok()
}

/// Get the deploy root directory (where docker-compose.yml is located)
pub fn get_deploy_root() -> Result<PathBuf> {
    use crate::utils::AppConfig;

    // 1. Check saved configuration
    if let Ok(config) = AppConfig::load() {
        if let Some(root) = config.deploy_root {
            let path = PathBuf::from(&root);
            if path.join("docker-compose.yml").exists() {
                return Ok(path);
            }
        }
    }

    // 2. Check environment variable
    if let Ok(deploy_root) = std::env::var("FEDOPS_ROOT") {
        let path = PathBuf::from(deploy_root);
        if path.join("docker-compose.yml").exists() {
            if let Ok(mut config) = AppConfig::load() {
                let _ = config.set_deploy_root(path.clone());
            }
            return Ok(path);
        }
    }

    // 3. Search for docker-compose.yml in current and parent directories
    let current_dir = std::env::current_dir()
        .context("Failed to get current directory")?;

    let mut dir = current_dir.as_path();
    loop {
        if dir.join("docker-compose.yml").exists() {
            if let Ok(mut config) = AppConfig::load() {
                let _ = config.set_deploy_root(dir.to_path_buf());
            }
            return Ok(dir.to_path_buf());
        }

        match dir.parent() {
            Some(parent) => dir = parent,
            None => break,
        }
    }

    // 4. Not found - show helpful error
    anyhow::bail!(
        "Could not find the deployment root\n\n\
        Please specify the location:\n\n\
        Option 1 - Set environment variable:\n\
          export FEDOPS_ROOT=/path/to/deployment\n\
          fedops\n\n\
        Option 2 - Run from the deployment directory:\n\
          cd /path/to/deployment\n\
          fedops\n\n\
        Option 3 - Manually configure:\n\
          mkdir -p ~/.config/fedops\n\
          echo 'deploy_root = \"/path/to/deployment\"' > ~/.config/fedops/config.toml"
    )
}

/// Format bytes to human-readable size
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    if unit_index == 0 {
        format!("{} {}", bytes, UNITS[unit_index])
    } else {
        format!("{:.2} {}", size, UNITS[unit_index])
    }
}

/// Generate a random hex string of specified length
pub fn generate_hex_string(length: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..length)
        .map(|_| format!("{:x}", rng.gen::<u8>() % 16))
        .collect()
}

/// Validate hex string
pub fn is_valid_hex(s: &str) -> bool {
    s.chars().all(|c| c.is_ascii_hexdigit())
}
