/// Symmetric artifact encryption
///
/// Encryption shells out to the `gpg` binary so artifacts stay decryptable
/// with standard OpenPGP tooling (`gpg --decrypt backup.tar.gz.gpg`). The
/// cipher is behind a trait so backup and restore logic can be exercised in
/// tests without a gpg installation.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;

/// Suffix used while an artifact is being written; the file is renamed to its
/// final name only after gpg exits successfully, so a truncated artifact is
/// never visible under its final name.
const PARTIAL_SUFFIX: &str = ".partial";

#[async_trait]
pub trait ArtifactCipher: Send + Sync {
    /// Encrypt `plaintext` with a passphrase and atomically write it to `dest`
    async fn encrypt_to_file(&self, plaintext: &[u8], dest: &Path, passphrase: &str) -> Result<()>;

    /// Decrypt an artifact into memory. A wrong passphrase or a corrupt
    /// artifact must fail here without side effects.
    async fn decrypt_file(&self, src: &Path, passphrase: &str) -> Result<Vec<u8>>;
}

/// OpenPGP symmetric cipher via the gpg binary (AES256)
pub struct GpgCipher;

impl GpgCipher {
    pub fn new() -> Self {
        Self
    }

    fn partial_path(dest: &Path) -> PathBuf {
        let mut name = dest.file_name().unwrap_or_default().to_os_string();
        name.push(PARTIAL_SUFFIX);
        dest.with_file_name(name)
    }

    /// The passphrase is fed on fd 0, never as an argv element, so it does
    /// not show up in /proc/<pid>/cmdline while gpg runs. On encrypt the
    /// plaintext follows the passphrase line on the same pipe.
    fn encrypt_args(partial: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--batch",
            "--yes",
            "--quiet",
            "--pinentry-mode",
            "loopback",
            "--passphrase-fd",
            "0",
            "--symmetric",
            "--cipher-algo",
            "AES256",
            "-o",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(partial.as_os_str().to_os_string());
        args
    }

    fn decrypt_args(src: &Path) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--batch",
            "--yes",
            "--quiet",
            "--pinentry-mode",
            "loopback",
            "--passphrase-fd",
            "0",
            "--decrypt",
        ]
        .iter()
        .map(OsString::from)
        .collect();
        args.push(src.as_os_str().to_os_string());
        args
    }
}

impl Default for GpgCipher {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ArtifactCipher for GpgCipher {
    async fn encrypt_to_file(&self, plaintext: &[u8], dest: &Path, passphrase: &str) -> Result<()> {
        let partial = Self::partial_path(dest);

        let mut child = tokio::process::Command::new("gpg")
            .args(Self::encrypt_args(&partial))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn gpg. Is GnuPG installed?")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open gpg stdin"))?;
        // First line of stdin is the passphrase, the rest is the plaintext
        stdin.write_all(passphrase.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        stdin.write_all(plaintext).await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            // Never leave a partial file behind
            let _ = std::fs::remove_file(&partial);
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!("gpg encryption failed: {}", stderr.trim());
        }

        std::fs::rename(&partial, dest).with_context(|| {
            format!("Failed to move encrypted artifact into place at {}", dest.display())
        })?;

        Ok(())
    }

    async fn decrypt_file(&self, src: &Path, passphrase: &str) -> Result<Vec<u8>> {
        let mut child = tokio::process::Command::new("gpg")
            .args(Self::decrypt_args(src))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .context("Failed to spawn gpg. Is GnuPG installed?")?;

        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("Failed to open gpg stdin"))?;
        stdin.write_all(passphrase.as_bytes()).await?;
        stdin.write_all(b"\n").await?;
        drop(stdin);

        let output = child.wait_with_output().await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            bail!(
                "gpg could not decrypt {} (wrong passphrase or corrupt artifact?): {}",
                src.display(),
                stderr.trim()
            );
        }

        Ok(output.stdout)
    }
}
