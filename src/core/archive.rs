/// Gzip and tar helpers for backup artifacts
///
/// Archives are plain `tar.gz` streams with entries relative to the archived
/// directory, so they stay extractable with standard tooling.

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{Read, Write};
use std::path::Path;
use tar::{Archive, Builder};

/// Gzip a byte buffer
pub fn gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data).context("Failed to compress data")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Decompress a gzip byte buffer
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .context("Failed to decompress gzip stream")?;
    Ok(out)
}

/// Archive a directory tree into a gzipped tar, preserving relative paths
pub fn tar_directory(dir: &Path) -> Result<Vec<u8>> {
    let encoder = GzEncoder::new(Vec::new(), Compression::default());
    let mut builder = Builder::new(encoder);
    builder.follow_symlinks(false);
    builder
        .append_dir_all(".", dir)
        .with_context(|| format!("Failed to archive {}", dir.display()))?;
    let encoder = builder
        .into_inner()
        .context("Failed to finish tar stream")?;
    encoder.finish().context("Failed to finish gzip stream")
}

/// Extract a gzipped tar into a directory (created if missing)
pub fn untar_into(data: &[u8], dest: &Path) -> Result<()> {
    std::fs::create_dir_all(dest)
        .with_context(|| format!("Failed to create {}", dest.display()))?;
    let mut archive = Archive::new(GzDecoder::new(data));
    archive.set_preserve_permissions(true);
    archive
        .unpack(dest)
        .with_context(|| format!("Failed to extract archive into {}", dest.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_gzip_round_trip() {
        let payload = b"SELECT * FROM events;\n".repeat(100);
        let compressed = gzip(&payload).unwrap();
        assert!(compressed.len() < payload.len());
        assert_eq!(gunzip(&compressed).unwrap(), payload);
    }

    #[test]
    fn test_gunzip_rejects_garbage() {
        assert!(gunzip(b"definitely not gzip").is_err());
    }

    #[test]
    fn test_tar_round_trip_preserves_tree() {
        let src = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("media/uploads")).unwrap();
        fs::write(src.path().join("config.yaml"), "port: 8008\n").unwrap();
        fs::write(src.path().join("media/uploads/avatar.png"), [0u8, 1, 2, 3]).unwrap();

        let archive = tar_directory(src.path()).unwrap();

        let dest = TempDir::new().unwrap();
        untar_into(&archive, dest.path()).unwrap();

        assert_eq!(
            fs::read_to_string(dest.path().join("config.yaml")).unwrap(),
            "port: 8008\n"
        );
        assert_eq!(
            fs::read(dest.path().join("media/uploads/avatar.png")).unwrap(),
            vec![0u8, 1, 2, 3]
        );
    }
}
