//! Local file or block device source

use crate::error::{ImportError, Result};
use crate::source::{DEFAULT_FILENAME, DataSource, SourceReader, taken_reader_error};
use std::io::SeekFrom;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncSeekExt;
use tracing::info;

pub struct FileDataSource {
    file: Option<File>,
    filename: String,
    length: u64,
    block_device: bool,
}

impl FileDataSource {
    pub async fn open(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await.map_err(|e| {
            ImportError::Source(format!("Cannot stat source {}: {}", path.display(), e))
        })?;
        let block_device = metadata.file_type().is_block_device();
        if !metadata.is_file() && !block_device {
            return Err(ImportError::Source(format!(
                "Source {} is neither a regular file nor a block device",
                path.display()
            )));
        }

        let mut file = File::open(path).await.map_err(|e| {
            ImportError::Source(format!("Cannot open source {}: {}", path.display(), e))
        })?;

        // Block devices report a zero length in their metadata.
        let length = if block_device {
            let end = file.seek(SeekFrom::End(0)).await?;
            file.seek(SeekFrom::Start(0)).await?;
            end
        } else {
            metadata.len()
        };

        let filename = path
            .file_name()
            .and_then(|name| name.to_str())
            .filter(|name| !name.is_empty())
            .unwrap_or(DEFAULT_FILENAME)
            .to_string();

        info!(path = %path.display(), length, block_device, "Opened local source");
        Ok(Self {
            file: Some(file),
            filename,
            length,
            block_device,
        })
    }

    pub fn is_block_device(&self) -> bool {
        self.block_device
    }
}

impl DataSource for FileDataSource {
    fn filename(&self) -> &str {
        &self.filename
    }

    fn length(&self) -> u64 {
        self.length
    }

    fn reader(&mut self) -> Result<SourceReader> {
        let file = self.file.take().ok_or_else(taken_reader_error)?;
        Ok(Box::new(file))
    }

    fn close(&mut self) {
        self.file.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn regular_file_reports_length_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ubuntu.qcow2");
        std::fs::write(&path, vec![3u8; 12345]).unwrap();

        let mut source = FileDataSource::open(&path).await.unwrap();
        assert_eq!(source.filename(), "ubuntu.qcow2");
        assert_eq!(source.length(), 12345);
        assert!(!source.is_block_device());

        let mut data = Vec::new();
        source.reader().unwrap().read_to_end(&mut data).await.unwrap();
        assert_eq!(data.len(), 12345);
        assert!(source.reader().is_err(), "reader is handed out once");
    }

    #[tokio::test]
    async fn directories_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileDataSource::open(dir.path()).await,
            Err(ImportError::Source(_))
        ));
        assert!(FileDataSource::open(&dir.path().join("missing")).await.is_err());
    }
}
