//! Scripted in-memory engine for tests.

use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use magnet_stream_types::FileEntry;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;

use super::{Acquisition, ByteRange, ByteSource, EngineEvent, EngineHandle, TransferEngine};
use crate::magnet::MagnetLink;

/// What a single acquisition attempt does.
#[derive(Clone, Debug)]
pub(crate) enum Attempt {
    /// Emit a warning, then metadata.
    Ready,
    /// Emit an error.
    Fail(&'static str),
    /// Never emit anything.
    Silent,
}

#[derive(Clone, Debug)]
pub(crate) struct MockFile {
    pub name: String,
    pub data: Vec<u8>,
    /// Fail reads after this many bytes.
    pub fail_after: Option<usize>,
}

impl MockFile {
    pub(crate) fn new(name: &str, len: usize) -> Self {
        Self {
            name: name.to_string(),
            data: (0..len).map(|i| (i % 251) as u8).collect(),
            fail_after: None,
        }
    }

    pub(crate) fn failing_after(mut self, bytes: usize) -> Self {
        self.fail_after = Some(bytes);
        self
    }
}

#[derive(Default)]
pub(crate) struct MockCounters {
    pub acquisitions: AtomicUsize,
    pub disposals: AtomicUsize,
    pub opens: AtomicUsize,
}

pub(crate) struct MockEngine {
    script: Mutex<VecDeque<Attempt>>,
    files: Vec<MockFile>,
    event_delay: Duration,
    fail_open: bool,
    counters: Arc<MockCounters>,
}

impl MockEngine {
    /// Engine whose attempts follow `script`; once exhausted every attempt succeeds.
    pub(crate) fn new(script: Vec<Attempt>, files: Vec<MockFile>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            files,
            event_delay: Duration::from_millis(50),
            fail_open: false,
            counters: Arc::new(MockCounters::default()),
        }
    }

    pub(crate) fn with_event_delay(mut self, delay: Duration) -> Self {
        self.event_delay = delay;
        self
    }

    pub(crate) fn with_failing_open(mut self) -> Self {
        self.fail_open = true;
        self
    }

    pub(crate) fn acquisitions(&self) -> usize {
        self.counters.acquisitions.load(Ordering::SeqCst)
    }

    pub(crate) fn disposals(&self) -> usize {
        self.counters.disposals.load(Ordering::SeqCst)
    }

    pub(crate) fn opens(&self) -> usize {
        self.counters.opens.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl TransferEngine for MockEngine {
    async fn acquire(&self, _magnet: &MagnetLink) -> anyhow::Result<Acquisition> {
        self.counters.acquisitions.fetch_add(1, Ordering::SeqCst);
        let attempt = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Attempt::Ready);
        let handle = Arc::new(MockHandle {
            files: self.files.clone(),
            ready: Mutex::new(false),
            fail_open: self.fail_open,
            counters: self.counters.clone(),
        });
        let (tx, rx) = mpsc::unbounded_channel();
        let delay = self.event_delay;
        let ready_handle = handle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            match attempt {
                Attempt::Ready => {
                    let _ = tx.send(EngineEvent::Warning("no peers yet".to_string()));
                    *ready_handle.ready.lock().unwrap() = true;
                    let _ = tx.send(EngineEvent::MetadataReady);
                }
                Attempt::Fail(msg) => {
                    let _ = tx.send(EngineEvent::Error(msg.to_string()));
                }
                Attempt::Silent => {
                    // keep the channel open without emitting
                    std::future::pending::<()>().await;
                }
            }
        });
        Ok(Acquisition { handle, events: rx })
    }
}

struct MockHandle {
    files: Vec<MockFile>,
    ready: Mutex<bool>,
    fail_open: bool,
    counters: Arc<MockCounters>,
}

#[async_trait]
impl EngineHandle for MockHandle {
    fn files(&self) -> Vec<FileEntry> {
        if !*self.ready.lock().unwrap() {
            return Vec::new();
        }
        self.files
            .iter()
            .map(|f| FileEntry {
                name: f.name.clone(),
                length: f.data.len() as u64,
            })
            .collect()
    }

    async fn open(&self, name: &str, range: Option<ByteRange>) -> io::Result<ByteSource> {
        self.counters.opens.fetch_add(1, Ordering::SeqCst);
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::Other, "piece store unavailable"));
        }
        let file = self
            .files
            .iter()
            .find(|f| f.name == name)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "unknown file"))?;
        let (start, end) = match range {
            Some(range) => (range.start as usize, range.end as usize + 1),
            None => (0, file.data.len()),
        };
        Ok(Box::new(ChunkedReader {
            data: file.data[start..end].to_vec().into(),
            fail_after: file.fail_after,
            emitted: 0,
        }))
    }

    async fn dispose(&self) {
        self.counters.disposals.fetch_add(1, Ordering::SeqCst);
    }
}

/// Serves data in small chunks, optionally failing part way through.
struct ChunkedReader {
    data: VecDeque<u8>,
    fail_after: Option<usize>,
    emitted: usize,
}

impl AsyncRead for ChunkedReader {
    fn poll_read(
        mut self: Pin<&mut Self>,
        _cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        if let Some(limit) = self.fail_after {
            if self.emitted >= limit {
                return Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "peer went away",
                )));
            }
        }
        let mut n = buf.remaining().min(64).min(self.data.len());
        if let Some(limit) = self.fail_after {
            n = n.min(limit - self.emitted);
        }
        let chunk: Vec<u8> = self.data.drain(..n).collect();
        buf.put_slice(&chunk);
        self.emitted += n;
        Poll::Ready(Ok(()))
    }
}
