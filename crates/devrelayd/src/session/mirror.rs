//! Append-only on-disk copy of a device's log.

use std::io;
use std::path::{Path, PathBuf};

use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncWriteExt, BufWriter};

/// Appends batches to `<mirror_dir>/<device>.log`. Never read back.
#[derive(Debug)]
pub struct Mirror {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl Mirror {
    /// Opens (or creates) the mirror file in append mode, creating parent
    /// directories as needed.
    pub async fn open(path: PathBuf) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;

        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes one line per entry and flushes.
    pub async fn append(&mut self, lines: &[String]) -> io::Result<()> {
        for line in lines {
            self.writer.write_all(line.as_bytes()).await?;
            self.writer.write_all(b"\n").await?;
        }
        self.writer.flush().await
    }

    /// Flushes and closes the file.
    pub async fn close(mut self) -> io::Result<()> {
        self.writer.flush().await?;
        self.writer.into_inner().sync_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_append_and_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join("dev-1.log");

        let mut mirror = Mirror::open(path.clone()).await.unwrap();
        assert_eq!(mirror.path(), path.as_path());
        mirror
            .append(&["A".to_string(), "B".to_string()])
            .await
            .unwrap();
        mirror.close().await.unwrap();

        // A second session appends instead of truncating
        let mut mirror = Mirror::open(path.clone()).await.unwrap();
        mirror.append(&["C".to_string()]).await.unwrap();
        mirror.close().await.unwrap();

        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "A\nB\nC\n");
    }

    #[tokio::test]
    async fn test_lines_visible_after_each_append() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("dev-2.log");

        let mut mirror = Mirror::open(path.clone()).await.unwrap();
        mirror.append(&["first".to_string()]).await.unwrap();
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "first\n");
        mirror.close().await.unwrap();
    }
}
