//! Transfer engine contract.
//!
//! The session core only sees an engine as a capability: start an acquisition
//! for a magnet link, listen to its lifecycle events, list its files, open byte
//! ranges, and dispose it. Concrete engines live in submodules.

pub(crate) mod local_store;
#[cfg(test)]
pub(crate) mod mock;

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use magnet_stream_types::FileEntry;
use tokio::io::AsyncRead;
use tokio::sync::mpsc;

use crate::magnet::MagnetLink;

/// Inclusive byte range within a single file.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Number of bytes covered by the range.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Readable byte source for one file (or one range of it).
pub type ByteSource = Box<dyn AsyncRead + Send + Unpin>;

/// Lifecycle events emitted by an in-flight acquisition.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EngineEvent {
    /// Torrent metadata (file list) is available on the handle.
    MetadataReady,
    /// The acquisition failed; the handle must be disposed.
    Error(String),
    /// Informational; does not change acquisition state.
    Warning(String),
}

/// One acquisition attempt: the handle plus the stream of its events.
pub struct Acquisition {
    pub handle: Arc<dyn EngineHandle>,
    pub events: mpsc::UnboundedReceiver<EngineEvent>,
}

#[async_trait]
pub trait TransferEngine: Send + Sync {
    /// Begin acquiring the content behind a magnet link.
    async fn acquire(&self, magnet: &MagnetLink) -> anyhow::Result<Acquisition>;
}

#[async_trait]
pub trait EngineHandle: Send + Sync {
    /// Files known to the handle; empty before metadata is ready.
    fn files(&self) -> Vec<FileEntry>;
    /// Open a byte source for `name`, bounded to `range` when given.
    async fn open(&self, name: &str, range: Option<ByteRange>) -> io::Result<ByteSource>;
    /// Release everything the handle holds. Called exactly once per handle.
    async fn dispose(&self);
}
