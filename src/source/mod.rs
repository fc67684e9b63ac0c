//! Raw byte sources for an import
//!
//! A [`DataSource`] announces its length and file name up front and hands out
//! its reader exactly once. [`SourceSpec`] describes how to open a source and
//! is used to build a fresh one for every import attempt.

pub mod file;
pub mod http;
pub mod registry;

pub use file::FileDataSource;
pub use http::HttpDataSource;
pub use registry::RegistryDataSource;

use crate::error::{ImportError, Result};
use crate::registry::{Credentials, ImageReference};
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::io::AsyncRead;
use url::Url;

/// File name used when the source does not provide one
pub const DEFAULT_FILENAME: &str = "disk.img";

pub type SourceReader = Box<dyn AsyncRead + Send + Unpin>;

pub trait DataSource: Send {
    fn filename(&self) -> &str;

    /// Total number of bytes the reader will deliver
    fn length(&self) -> u64;

    /// Take the byte stream; fails if it was already taken
    fn reader(&mut self) -> Result<SourceReader>;

    /// Release the underlying handle if the reader was never taken
    fn close(&mut self);
}

/// Builds a fresh source for each attempt
#[async_trait]
pub trait SourceFactory: Send + Sync {
    async fn open(&self) -> Result<Box<dyn DataSource>>;
}

#[derive(Debug, Clone)]
pub enum SourceSpec {
    Http {
        url: Url,
        credentials: Option<Credentials>,
        insecure_tls: bool,
    },
    /// Container disk image whose layer holds the disk under `disk/`
    Registry {
        image: ImageReference,
        credentials: Option<Credentials>,
        insecure_tls: bool,
    },
    File {
        path: PathBuf,
    },
    BlockDevice {
        path: PathBuf,
    },
}

#[async_trait]
impl SourceFactory for SourceSpec {
    async fn open(&self) -> Result<Box<dyn DataSource>> {
        match self {
            SourceSpec::Http {
                url,
                credentials,
                insecure_tls,
            } => Ok(Box::new(
                HttpDataSource::open(url.clone(), credentials.clone(), *insecure_tls).await?,
            )),
            SourceSpec::Registry {
                image,
                credentials,
                insecure_tls,
            } => Ok(Box::new(
                RegistryDataSource::open(image.clone(), credentials.clone(), *insecure_tls).await?,
            )),
            SourceSpec::File { path } => Ok(Box::new(FileDataSource::open(path).await?)),
            SourceSpec::BlockDevice { path } => {
                let source = FileDataSource::open(path).await?;
                if !source.is_block_device() {
                    return Err(ImportError::Source(format!(
                        "{} is not a block device",
                        path.display()
                    )));
                }
                Ok(Box::new(source))
            }
        }
    }
}

pub(crate) fn taken_reader_error() -> ImportError {
    ImportError::Source("Source reader was already taken".to_string())
}
