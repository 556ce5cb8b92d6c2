/// Secret store management
///
/// One credential bundle per service, stored as individual files under the
/// store root (`<store>/<service>/<credential>`), owner-only permissions.
/// Bundles are generated once at first deployment and never silently
/// regenerated; a restore replaces the whole store after moving the previous
/// one aside.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::utils::{generate_hex_string, new_generation_token, ServiceKind, BUNDLE_CREDENTIALS};

pub struct SecretStore {
    root: PathBuf,
}

impl SecretStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bundle_dir(&self, service: ServiceKind) -> PathBuf {
        self.root.join(service.name())
    }

    fn credential_path(&self, service: ServiceKind, name: &str) -> PathBuf {
        self.bundle_dir(service).join(name)
    }

    /// True when every credential of the service's bundle is present
    pub fn bundle_exists(&self, service: ServiceKind) -> bool {
        BUNDLE_CREDENTIALS
            .iter()
            .all(|name| self.credential_path(service, name).is_file())
    }

    /// Generate the bundle for a service. Idempotent: credentials that
    /// already exist are left untouched. Returns true if anything was written.
    pub fn ensure_bundle(&self, service: ServiceKind) -> Result<bool> {
        let dir = self.bundle_dir(service);
        fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create secret bundle dir {}", dir.display()))?;

        let mut generated = false;
        for name in BUNDLE_CREDENTIALS {
            let path = self.credential_path(service, name);
            if path.exists() {
                continue;
            }

            let length = if *name == "signing_key" { 64 } else { 32 };
            fs::write(&path, generate_hex_string(length))
                .with_context(|| format!("Failed to write credential {}", path.display()))?;
            generated = true;
        }

        self.restrict_permissions()?;
        Ok(generated)
    }

    /// Read one credential value
    pub fn read(&self, service: ServiceKind, name: &str) -> Result<String> {
        let path = self.credential_path(service, name);
        if !path.is_file() {
            bail!(
                "Missing credential '{}' for service {} (expected at {})",
                name,
                service,
                path.display()
            );
        }
        let value = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read credential {}", path.display()))?;
        Ok(value.trim().to_string())
    }

    /// Move the entire store aside to a timestamped sibling. Never deletes;
    /// the returned path is where the previous store now lives.
    pub fn move_aside(&self) -> Result<Option<PathBuf>> {
        if !self.root.exists() {
            return Ok(None);
        }

        let mut name = self
            .root
            .file_name()
            .unwrap_or_default()
            .to_os_string();
        name.push(format!(".pre-restore.{}", new_generation_token()));
        let aside = self.root.with_file_name(name);

        fs::rename(&self.root, &aside).with_context(|| {
            format!(
                "Failed to move secret store aside ({} -> {})",
                self.root.display(),
                aside.display()
            )
        })?;

        Ok(Some(aside))
    }

    /// Re-apply owner-only permissions to the whole store (0700 directories,
    /// 0600 files). Extracted archives may carry looser modes.
    pub fn restrict_permissions(&self) -> Result<()> {
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;

            fn walk(path: &Path) -> Result<()> {
                let metadata = fs::metadata(path)?;
                if metadata.is_dir() {
                    fs::set_permissions(path, fs::Permissions::from_mode(0o700))?;
                    for entry in fs::read_dir(path)? {
                        walk(&entry?.path())?;
                    }
                } else {
                    fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
                }
                Ok(())
            }

            if self.root.exists() {
                walk(&self.root).with_context(|| {
                    format!("Failed to restrict permissions under {}", self.root.display())
                })?;
            }
        }

        Ok(())
    }
}
