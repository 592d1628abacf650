//! Archiving and compression of exported data.
//!
//! Two strategies: wrap an export directory into a compressed tarball, or
//! stream-compress a single file. The codec (gzip or brotli, both at maximum
//! level) comes from configuration.

use crate::config::CompressionMethod;
use crate::error::BackupError;
use async_compression::tokio::write::{BrotliEncoder, GzipEncoder};
use async_compression::Level;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncWriteExt, BufReader, BufWriter};

/// The single compressed file produced for a run.
#[derive(Debug, Clone)]
pub struct CompressedArtifact {
    pub path: PathBuf,
    pub original_size: u64,
    pub compressed_size: u64,
    pub method: CompressionMethod,
}

impl CompressedArtifact {
    /// Size reduction as a percentage label, e.g. `"63.4%"`.
    pub fn ratio_label(&self) -> String {
        if self.original_size == 0 || self.compressed_size == 0 {
            return "N/A".into();
        }
        let ratio = (1.0 - self.compressed_size as f64 / self.original_size as f64) * 100.0;
        format!("{ratio:.1}%")
    }
}

pub struct Archiver {
    method: CompressionMethod,
}

impl Archiver {
    pub fn new(method: CompressionMethod) -> Self {
        Self { method }
    }

    /// Wrap `source_dir` into `<dest_base>.tar.{gz,br}`. The intermediate
    /// tarball is removed once compressed; its size is reported as the
    /// original size.
    pub async fn compress_dir(
        &self,
        source_dir: &Path,
        dest_base: &Path,
    ) -> Result<CompressedArtifact, BackupError> {
        let tar_path = dest_base.with_extension("tar");
        let arcname = source_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .ok_or_else(|| archive_error("source directory has no name"))?;

        // tar is synchronous; build the tarball off the event loop
        let tar_path_blocking = tar_path.clone();
        let source_dir_blocking = source_dir.to_path_buf();
        tokio::task::spawn_blocking(move || -> std::io::Result<()> {
            let file = std::fs::File::create(&tar_path_blocking)?;
            let mut builder = tar::Builder::new(file);
            builder.append_dir_all(&arcname, &source_dir_blocking)?;
            builder.finish()?;
            Ok(())
        })
        .await
        .map_err(|e| archive_error(e))?
        .map_err(|e| archive_error(e))?;

        let original_size = tokio::fs::metadata(&tar_path)
            .await
            .map_err(|e| archive_error(e))?
            .len();

        let out_path = dest_base.with_extension(format!("tar.{}", self.method.extension()));
        let result = self.stream_compress(&tar_path, &out_path).await;
        let _ = tokio::fs::remove_file(&tar_path).await;
        result?;

        let compressed_size = tokio::fs::metadata(&out_path)
            .await
            .map_err(|e| archive_error(e))?
            .len();

        tracing::info!(
            archive = %out_path.display(),
            original_size,
            compressed_size,
            method = self.method.label(),
            "Archive created"
        );

        Ok(CompressedArtifact {
            path: out_path,
            original_size,
            compressed_size,
            method: self.method,
        })
    }

    /// Compress a single file to `<source>.{gz,br}` alongside it.
    pub async fn compress_file(&self, source: &Path) -> Result<CompressedArtifact, BackupError> {
        let original_size = tokio::fs::metadata(source)
            .await
            .map_err(|e| archive_error(e))?
            .len();

        let mut out_name = source.as_os_str().to_owned();
        out_name.push(format!(".{}", self.method.extension()));
        let out_path = PathBuf::from(out_name);

        self.stream_compress(source, &out_path).await?;

        let compressed_size = tokio::fs::metadata(&out_path)
            .await
            .map_err(|e| archive_error(e))?
            .len();

        tracing::info!(
            archive = %out_path.display(),
            original_size,
            compressed_size,
            method = self.method.label(),
            "File compressed"
        );

        Ok(CompressedArtifact {
            path: out_path,
            original_size,
            compressed_size,
            method: self.method,
        })
    }

    async fn stream_compress(&self, source: &Path, dest: &Path) -> Result<(), BackupError> {
        let input = tokio::fs::File::open(source)
            .await
            .map_err(|e| archive_error(e))?;
        let output = tokio::fs::File::create(dest)
            .await
            .map_err(|e| archive_error(e))?;
        let mut reader = BufReader::new(input);
        let writer = BufWriter::new(output);

        match self.method {
            CompressionMethod::Gzip => {
                let mut encoder = GzipEncoder::with_quality(writer, Level::Best);
                tokio::io::copy(&mut reader, &mut encoder)
                    .await
                    .map_err(|e| archive_error(e))?;
                encoder.shutdown().await.map_err(|e| archive_error(e))?;
            }
            CompressionMethod::Brotli => {
                let mut encoder = BrotliEncoder::with_quality(writer, Level::Best);
                tokio::io::copy(&mut reader, &mut encoder)
                    .await
                    .map_err(|e| archive_error(e))?;
                encoder.shutdown().await.map_err(|e| archive_error(e))?;
            }
        }
        Ok(())
    }
}

fn archive_error(cause: impl std::fmt::Display) -> BackupError {
    BackupError::Archive(cause.to_string())
}

/// Human-readable byte size, e.g. `"12.3MB"`.
pub fn format_size(bytes: u64) -> String {
    let mut size = bytes as f64;
    for unit in ["B", "KB", "MB", "GB"] {
        if size < 1024.0 {
            return format!("{size:.1}{unit}");
        }
        size /= 1024.0;
    }
    format!("{size:.1}TB")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compress_dir_gzip() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("dump");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("entries.json"), b"[{\"sgv\": 120}]".repeat(64)).unwrap();
        fs::write(source.join("treatments.json"), b"[]").unwrap();

        let archiver = Archiver::new(CompressionMethod::Gzip);
        let artifact = archiver
            .compress_dir(&source, &tmp.path().join("nightscout-backup-run"))
            .await
            .unwrap();

        assert!(artifact.path.to_string_lossy().ends_with(".tar.gz"));
        assert!(artifact.path.exists());
        assert!(artifact.original_size > 0);
        assert!(artifact.compressed_size > 0);
        // Intermediate tarball is removed
        assert!(!tmp.path().join("nightscout-backup-run.tar").exists());
    }

    #[tokio::test]
    async fn test_compress_dir_repetitive_data_shrinks() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("dump");
        fs::create_dir(&source).unwrap();
        fs::write(source.join("entries.json"), b"a".repeat(64 * 1024)).unwrap();

        let archiver = Archiver::new(CompressionMethod::Gzip);
        let artifact = archiver
            .compress_dir(&source, &tmp.path().join("base"))
            .await
            .unwrap();

        assert!(artifact.compressed_size < artifact.original_size);
        assert_ne!(artifact.ratio_label(), "N/A");
    }

    #[tokio::test]
    async fn test_compress_file_brotli() {
        let tmp = TempDir::new().unwrap();
        let source = tmp.path().join("export.json");
        fs::write(&source, b"{\"collections\": {}}").unwrap();

        let archiver = Archiver::new(CompressionMethod::Brotli);
        let artifact = archiver.compress_file(&source).await.unwrap();

        assert!(artifact.path.to_string_lossy().ends_with(".json.br"));
        assert!(artifact.path.exists());
        assert_eq!(artifact.method, CompressionMethod::Brotli);
    }

    #[tokio::test]
    async fn test_compress_missing_dir_is_archive_error() {
        let tmp = TempDir::new().unwrap();
        let archiver = Archiver::new(CompressionMethod::Gzip);
        let err = archiver
            .compress_dir(&tmp.path().join("absent"), &tmp.path().join("base"))
            .await
            .unwrap_err();
        assert!(err.to_string().starts_with("Archive creation failed:"));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512.0B");
        assert_eq!(format_size(2048), "2.0KB");
        assert_eq!(format_size(12 * 1024 * 1024), "12.0MB");
    }

    #[test]
    fn test_ratio_label_handles_zero_sizes() {
        let artifact = CompressedArtifact {
            path: PathBuf::from("x.tar.gz"),
            original_size: 0,
            compressed_size: 0,
            method: CompressionMethod::Gzip,
        };
        assert_eq!(artifact.ratio_label(), "N/A");
    }
}
