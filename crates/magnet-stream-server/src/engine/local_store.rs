//! Directory-backed transfer engine.
//!
//! Treats `<content_dir>/<info_hash>/` as the on-disk assembly area of an external
//! swarm client. Metadata becomes ready once that directory holds files whose
//! names and sizes are unchanged across two polls; reads are served straight
//! from disk with range support.

use std::collections::HashSet;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use magnet_stream_types::FileEntry;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{Acquisition, ByteRange, ByteSource, EngineEvent, EngineHandle, TransferEngine};
use crate::magnet::MagnetLink;

pub(crate) struct LocalStoreEngine {
    root: PathBuf,
    poll_interval: Duration,
}

impl LocalStoreEngine {
    pub(crate) fn new(root: PathBuf, poll_interval: Duration) -> Self {
        Self {
            root,
            poll_interval,
        }
    }
}

#[async_trait]
impl TransferEngine for LocalStoreEngine {
    async fn acquire(&self, magnet: &MagnetLink) -> anyhow::Result<Acquisition> {
        let meta = tokio::fs::metadata(&self.root).await.map_err(|e| {
            anyhow::anyhow!("content dir {} unavailable: {e}", self.root.display())
        })?;
        if !meta.is_dir() {
            anyhow::bail!("content dir {} is not a directory", self.root.display());
        }

        let dir = self.root.join(magnet.info_hash.as_str());
        let handle = Arc::new(LocalStoreHandle {
            dir: dir.clone(),
            files: Mutex::new(Vec::new()),
            cancel: CancellationToken::new(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(watch_for_content(
            handle.clone(),
            tx,
            self.poll_interval,
        ));
        tracing::debug!(dir = %dir.display(), "local store: acquisition started");
        Ok(Acquisition {
            handle,
            events: rx,
        })
    }
}

/// Poll the torrent directory until its file set settles, then report metadata.
async fn watch_for_content(
    handle: Arc<LocalStoreHandle>,
    events: mpsc::UnboundedSender<EngineEvent>,
    poll_interval: Duration,
) {
    let mut previous: Vec<StoredFile> = Vec::new();
    let mut warned_empty = false;
    let mut warned_changing = false;
    loop {
        let dir = handle.dir.clone();
        let scan = tokio::task::spawn_blocking(move || scan_dir(&dir)).await;
        let files = match scan {
            Ok(Ok(files)) => files,
            Ok(Err(err)) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Ok(Err(err)) => {
                let _ = events.send(EngineEvent::Error(format!(
                    "scan {}: {err}",
                    handle.dir.display()
                )));
                return;
            }
            Err(err) => {
                let _ = events.send(EngineEvent::Error(format!("scan task failed: {err}")));
                return;
            }
        };
        if settled(&previous, &files) {
            if let Ok(mut guard) = handle.files.lock() {
                *guard = files;
            }
            let _ = events.send(EngineEvent::MetadataReady);
            return;
        }
        if files.is_empty() && !warned_empty {
            warned_empty = true;
            let _ = events.send(EngineEvent::Warning(format!(
                "waiting for content in {}",
                handle.dir.display()
            )));
        } else if !files.is_empty() && !warned_changing {
            warned_changing = true;
            let _ = events.send(EngineEvent::Warning(format!(
                "content in {} is still being written",
                handle.dir.display()
            )));
        }
        previous = files;
        tokio::select! {
            _ = handle.cancel.cancelled() => return,
            _ = tokio::time::sleep(poll_interval) => {}
        }
    }
}

/// Two consecutive scans agree on every file name and length.
fn settled(previous: &[StoredFile], current: &[StoredFile]) -> bool {
    !current.is_empty()
        && previous.len() == current.len()
        && previous
            .iter()
            .zip(current)
            .all(|(before, now)| before.entry == now.entry)
}

#[derive(Clone, Debug)]
struct StoredFile {
    entry: FileEntry,
    path: PathBuf,
}

struct LocalStoreHandle {
    dir: PathBuf,
    files: Mutex<Vec<StoredFile>>,
    cancel: CancellationToken,
}

impl LocalStoreHandle {
    fn path_for(&self, name: &str) -> Option<PathBuf> {
        self.files
            .lock()
            .ok()?
            .iter()
            .find(|f| f.entry.name == name)
            .map(|f| f.path.clone())
    }
}

#[async_trait]
impl EngineHandle for LocalStoreHandle {
    fn files(&self) -> Vec<FileEntry> {
        self.files
            .lock()
            .map(|files| files.iter().map(|f| f.entry.clone()).collect())
            .unwrap_or_default()
    }

    async fn open(&self, name: &str, range: Option<ByteRange>) -> io::Result<ByteSource> {
        if self.cancel.is_cancelled() {
            return Err(io::Error::new(io::ErrorKind::Other, "handle disposed"));
        }
        let path = self
            .path_for(name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("unknown file {name}")))?;
        let mut file = tokio::fs::File::open(&path).await?;
        match range {
            Some(range) => {
                if range.start > 0 {
                    file.seek(io::SeekFrom::Start(range.start)).await?;
                }
                Ok(Box::new(file.take(range.len())))
            }
            None => Ok(Box::new(file)),
        }
    }

    async fn dispose(&self) {
        self.cancel.cancel();
        tracing::debug!(dir = %self.dir.display(), "local store: handle disposed");
    }
}

/// Collect regular files below `dir`, keyed by file name.
///
/// Names must be unique per torrent; on collisions the first path in sorted order wins.
fn scan_dir(dir: &Path) -> io::Result<Vec<StoredFile>> {
    let mut paths = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in std::fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                paths.push(entry.path());
            }
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut files = Vec::new();
    for path in paths {
        let Some(name) = path.file_name().map(|n| n.to_string_lossy().to_string()) else {
            continue;
        };
        // partially written pieces
        if name.starts_with('.') {
            continue;
        }
        if !seen.insert(name.clone()) {
            tracing::warn!(path = %path.display(), "local store: duplicate file name skipped");
            continue;
        }
        let length = std::fs::metadata(&path)?.len();
        files.push(StoredFile {
            entry: FileEntry { name, length },
            path,
        });
    }
    Ok(files)
}
