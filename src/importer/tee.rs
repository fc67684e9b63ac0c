//! Single-reader fan-out of the source stream
//!
//! Each chunk read from the source is handed to every sink in order; the next
//! read only happens once all sinks accepted the chunk, so every branch sees
//! the bytes in source order.

use crate::digest::Checksums;
use crate::error::handlers::is_no_space_left;
use crate::error::{ImportError, Result};
use crate::image::TarPackager;
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::io::ReaderStream;

pub const READ_CHUNK_SIZE: usize = 256 * 1024;

#[async_trait]
pub trait ChunkSink: Send {
    async fn accept(&mut self, chunk: &Bytes) -> Result<()>;
}

#[async_trait]
impl ChunkSink for Checksums {
    async fn accept(&mut self, chunk: &Bytes) -> Result<()> {
        self.update(chunk);
        Ok(())
    }
}

#[async_trait]
impl<W: AsyncWrite + Unpin + Send> ChunkSink for TarPackager<W> {
    async fn accept(&mut self, chunk: &Bytes) -> Result<()> {
        self.write(chunk).await
    }
}

/// Forwards chunks to the inspector's private queue
pub struct ChannelSink {
    tx: mpsc::Sender<Bytes>,
}

impl ChannelSink {
    pub fn new(tx: mpsc::Sender<Bytes>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ChunkSink for ChannelSink {
    async fn accept(&mut self, chunk: &Bytes) -> Result<()> {
        self.tx
            .send(chunk.clone())
            .await
            .map_err(|_| ImportError::Inspection("Image inspector stopped consuming the stream".to_string()))
    }
}

/// Read `reader` to the end, feeding every chunk to all sinks; returns the byte count
pub async fn fan_out<R>(reader: R, sinks: &mut [&mut dyn ChunkSink]) -> Result<u64>
where
    R: AsyncRead + Unpin + Send,
{
    let mut chunks = ReaderStream::with_capacity(reader, READ_CHUNK_SIZE);
    let mut transmitted = 0u64;

    while let Some(chunk) = chunks.next().await {
        let chunk = chunk.map_err(|e| {
            if is_no_space_left(&e) {
                ImportError::NoSpaceLeft(e.to_string())
            } else {
                ImportError::Source(format!("Error reading from the source: {}", e))
            }
        })?;

        for sink in sinks.iter_mut() {
            sink.accept(&chunk).await?;
        }
        transmitted += chunk.len() as u64;
    }

    Ok(transmitted)
}
