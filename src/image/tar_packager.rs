//! Single-entry tar stream writer
//!
//! The disk image is streamed into the archive without buffering: the header
//! is written up front from the declared length, the payload follows chunk by
//! chunk, and [`TarPackager::finish`] appends the block padding and the
//! end-of-archive marker.

use crate::error::{ImportError, Result};
use std::path::Path;
use tar::{EntryType, Header};
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Directory inside the layer holding the disk image
pub const DISK_DIR: &str = "disk";
/// Owner of the image file inside the layer (the qemu user)
pub const DISK_OWNER_ID: u64 = 107;

const BLOCK_SIZE: u64 = 512;
const END_OF_ARCHIVE: [u8; 2 * BLOCK_SIZE as usize] = [0; 2 * BLOCK_SIZE as usize];
const NAME_FIELD_LEN: usize = 100;
const LONG_LINK_NAME: &str = "././@LongLink";

pub struct TarPackager<W> {
    writer: W,
    entry_path: String,
    length: u64,
    written: u64,
    header_written: bool,
}

impl<W: AsyncWrite + Unpin> TarPackager<W> {
    pub fn new(writer: W, filename: &str, length: u64) -> Self {
        Self {
            writer,
            entry_path: entry_path(filename),
            length,
            written: 0,
            header_written: false,
        }
    }

    pub fn entry_path(&self) -> &str {
        &self.entry_path
    }

    /// Total archive size for the declared payload, long-name block included
    pub fn archive_size(&self) -> u64 {
        let long_name = if self.needs_long_name() {
            BLOCK_SIZE + padded(self.entry_path.len() as u64 + 1)
        } else {
            0
        };
        long_name + BLOCK_SIZE + padded(self.length) + END_OF_ARCHIVE.len() as u64
    }

    fn needs_long_name(&self) -> bool {
        self.entry_path.len() > NAME_FIELD_LEN
    }

    /// GNU `L` header plus the NUL-terminated name, for paths the name field cannot hold
    fn long_name_block(&self) -> Result<Vec<u8>> {
        let name_len = self.entry_path.len() as u64 + 1;
        let mut header = Header::new_gnu();
        header.set_path(LONG_LINK_NAME).map_err(|e| {
            ImportError::Source(format!("Failed to build long name header: {}", e))
        })?;
        header.set_size(name_len);
        header.set_mode(0o644);
        header.set_uid(0);
        header.set_gid(0);
        header.set_mtime(0);
        header.set_entry_type(EntryType::GNULongName);
        header.set_cksum();

        let mut block = Vec::with_capacity((BLOCK_SIZE + padded(name_len)) as usize);
        block.extend_from_slice(header.as_bytes());
        block.extend_from_slice(self.entry_path.as_bytes());
        block.resize((BLOCK_SIZE + padded(name_len)) as usize, 0);
        Ok(block)
    }

    fn header(&self) -> Result<Header> {
        let mut header = Header::new_gnu();
        if self.needs_long_name() {
            let name = &mut header.as_old_mut().name;
            name.copy_from_slice(&self.entry_path.as_bytes()[..NAME_FIELD_LEN]);
        } else {
            header.set_path(&self.entry_path).map_err(|e| {
                ImportError::Source(format!("Invalid tar entry name '{}': {}", self.entry_path, e))
            })?;
        }
        header.set_size(self.length);
        header.set_mode(0o644);
        header.set_uid(DISK_OWNER_ID);
        header.set_gid(DISK_OWNER_ID);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);
        header.set_entry_type(EntryType::Regular);
        header.set_cksum();
        Ok(header)
    }

    pub async fn write_header(&mut self) -> Result<()> {
        if self.header_written {
            return Ok(());
        }
        if self.needs_long_name() {
            let block = self.long_name_block()?;
            self.writer.write_all(&block).await?;
        }
        let header = self.header()?;
        self.writer.write_all(header.as_bytes()).await?;
        self.header_written = true;
        Ok(())
    }

    /// Append payload bytes; writing past the declared length is an error
    pub async fn write(&mut self, chunk: &[u8]) -> Result<()> {
        if !self.header_written {
            self.write_header().await?;
        }

        let chunk_len = chunk.len() as u64;
        if self.written + chunk_len > self.length {
            return Err(ImportError::Source(format!(
                "Source delivered more than the declared {} bytes",
                self.length
            )));
        }

        self.writer.write_all(chunk).await?;
        self.written += chunk_len;
        Ok(())
    }

    /// Pad the entry, write the end-of-archive marker and close the writer
    pub async fn finish(mut self) -> Result<()> {
        if !self.header_written {
            self.write_header().await?;
        }
        if self.written != self.length {
            return Err(ImportError::Source(format!(
                "Source size mismatch: {} != {}",
                self.written, self.length
            )));
        }

        let remainder = self.length % BLOCK_SIZE;
        if remainder != 0 {
            let padding = vec![0u8; (BLOCK_SIZE - remainder) as usize];
            self.writer.write_all(&padding).await?;
        }
        self.writer.write_all(&END_OF_ARCHIVE).await?;
        self.writer.shutdown().await?;
        Ok(())
    }
}

fn padded(len: u64) -> u64 {
    len.div_ceil(BLOCK_SIZE) * BLOCK_SIZE
}

fn entry_path(filename: &str) -> String {
    let base = Path::new(filename)
        .file_name()
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty())
        .unwrap_or(filename);
    format!("{}/{}", DISK_DIR, base)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    async fn package(filename: &str, payload: &[u8], chunk: usize) -> Vec<u8> {
        let mut out = Vec::new();
        let mut packager = TarPackager::new(&mut out, filename, payload.len() as u64);
        packager.write_header().await.unwrap();
        for part in payload.chunks(chunk) {
            packager.write(part).await.unwrap();
        }
        packager.finish().await.unwrap();
        out
    }

    #[tokio::test]
    async fn round_trip_yields_one_entry_with_identical_bytes() {
        let payload: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
        let archive = package("disk.qcow2", &payload, 777).await;
        assert_eq!(
            archive.len() as u64,
            TarPackager::new(Vec::new(), "disk.qcow2", 10_000).archive_size()
        );

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(entry.path().unwrap().to_str(), Some("disk/disk.qcow2"));
        assert_eq!(entry.header().mode().unwrap(), 0o644);
        assert_eq!(entry.header().uid().unwrap(), DISK_OWNER_ID);

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, payload);
        drop(entry);
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn long_file_names_round_trip() {
        let filename = format!("{}.qcow2", "a".repeat(110));
        let payload = vec![7u8; 4];
        let archive = package(&filename, &payload, 4).await;
        assert_eq!(
            archive.len() as u64,
            TarPackager::new(Vec::new(), &filename, 4).archive_size()
        );

        let mut reader = tar::Archive::new(archive.as_slice());
        let mut entries = reader.entries().unwrap();
        let mut entry = entries.next().unwrap().unwrap();
        assert_eq!(
            entry.path().unwrap().to_str().map(str::to_string),
            Some(format!("disk/{}", filename))
        );
        assert_eq!(entry.header().uid().unwrap(), DISK_OWNER_ID);

        let mut contents = Vec::new();
        entry.read_to_end(&mut contents).unwrap();
        assert_eq!(contents, payload);
        drop(entry);
        assert!(entries.next().is_none());
    }

    #[tokio::test]
    async fn block_aligned_payload_has_no_padding() {
        let archive = package("a.img", &[1u8; 1024], 512).await;
        assert_eq!(archive.len(), 512 + 1024 + 1024);
    }

    #[tokio::test]
    async fn writing_past_declared_length_fails() {
        let mut out = Vec::new();
        let mut packager = TarPackager::new(&mut out, "a.img", 4);
        packager.write(b"abc").await.unwrap();
        let err = packager.write(b"de").await.unwrap_err();
        assert!(matches!(err, ImportError::Source(_)));
    }

    #[tokio::test]
    async fn finishing_short_fails() {
        let mut out = Vec::new();
        let mut packager = TarPackager::new(&mut out, "a.img", 10);
        packager.write(b"abc").await.unwrap();
        assert!(matches!(packager.finish().await, Err(ImportError::Source(_))));
    }

    #[test]
    fn entry_path_uses_the_base_name() {
        assert_eq!(entry_path("images/ubuntu.iso"), "disk/ubuntu.iso");
        assert_eq!(entry_path("disk.img"), "disk/disk.img");
    }
}
