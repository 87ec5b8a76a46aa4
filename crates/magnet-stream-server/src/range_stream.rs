//! Byte-range streaming of session files.
//!
//! The response body owns the stream's [`StreamLease`]; whichever of natural
//! end, source error, or client disconnect (actix dropping the body) happens
//! first releases it, exactly once.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Instant;

use actix_web::body::SizedStream;
use actix_web::http::{header, StatusCode};
use actix_web::web::Bytes;
use actix_web::HttpResponse;
use futures_util::{Stream, StreamExt};
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::engine::{ByteRange, ByteSource};
use crate::error::SessionError;
use crate::session::refcount::{StreamLease, StreamRefCounter};
use crate::session::Session;

#[derive(Clone)]
pub(crate) struct RangeStreamServer {
    refs: StreamRefCounter,
}

impl RangeStreamServer {
    pub(crate) fn new(refs: StreamRefCounter) -> Self {
        Self { refs }
    }

    /// Build the streaming response for `file_name` within `session`.
    ///
    /// Every error returned here happens before any header is written.
    pub(crate) async fn serve(
        &self,
        session: &Arc<Session>,
        file_name: &str,
        range_header: Option<&str>,
    ) -> Result<HttpResponse, SessionError> {
        let files = session.files().ok_or(SessionError::SessionNotReady)?;
        let file = files
            .iter()
            .find(|f| f.name == file_name)
            .ok_or(SessionError::FileNotFound)?;
        let range = match range_header {
            Some(raw) => Some(parse_range(raw, file.length)?),
            None => None,
        };

        let lease = self.refs.increment(session.info_hash())?;
        let handle = session
            .handle()
            .ok_or_else(|| SessionError::StreamError("engine handle released".to_string()))?;
        let source = handle.open(&file.name, range).await.map_err(|err| {
            tracing::warn!(
                info_hash = %session.info_hash(),
                file = %file.name,
                error = %err,
                "failed to open byte source"
            );
            SessionError::StreamError(err.to_string())
        })?;

        // nothing is committed until the source yields its first chunk
        let mut reader = ReaderStream::new(source);
        let first = match reader.next().await {
            Some(Ok(chunk)) => Some(chunk),
            Some(Err(err)) => {
                tracing::warn!(
                    info_hash = %session.info_hash(),
                    file = %file.name,
                    error = %err,
                    "byte source failed before first chunk"
                );
                return Err(SessionError::StreamError(err.to_string()));
            }
            None => None,
        };

        let (status, len) = match range {
            Some(range) => (StatusCode::PARTIAL_CONTENT, range.len()),
            None => (StatusCode::OK, file.length),
        };
        let stream_id = Uuid::new_v4();
        tracing::info!(
            stream_id = %stream_id,
            info_hash = %session.info_hash(),
            file = %file.name,
            range = ?range.map(|r| (r.start, r.end)),
            "stream started"
        );

        let body = LeasedStream::new(reader, first, lease, stream_id, len);
        let mut resp = HttpResponse::build(status);
        resp.insert_header((header::ACCEPT_RANGES, "bytes"));
        resp.insert_header((header::CONTENT_TYPE, content_type_for(&file.name)));
        if let Some(range) = range {
            resp.insert_header((
                header::CONTENT_RANGE,
                format!("bytes {}-{}/{}", range.start, range.end, file.length),
            ));
        }
        resp.insert_header((header::CONTENT_LENGTH, len.to_string()));
        Ok(resp.body(SizedStream::new(len, body)))
    }
}

/// Parse a `Range` header against a file of `total_len` bytes.
///
/// Only the first range of a list is honoured. Requires `start <= end < total_len`.
pub(crate) fn parse_range(header: &str, total_len: u64) -> Result<ByteRange, SessionError> {
    let unsatisfiable = SessionError::RangeNotSatisfiable { length: total_len };
    let header = header.trim();
    let Some(ranges) = header.strip_prefix("bytes=") else {
        return Err(unsatisfiable);
    };
    let first = ranges.split(',').next().unwrap_or("").trim();
    let Some((start_s, end_s)) = first.split_once('-') else {
        return Err(unsatisfiable);
    };
    let Ok(start) = start_s.trim().parse::<u64>() else {
        return Err(unsatisfiable);
    };
    let end = match end_s.trim() {
        "" => match total_len.checked_sub(1) {
            Some(last) => last,
            None => return Err(unsatisfiable),
        },
        raw => match raw.parse::<u64>() {
            Ok(end) => end,
            Err(_) => return Err(unsatisfiable),
        },
    };
    if start > end || end >= total_len {
        return Err(unsatisfiable);
    }
    Ok(ByteRange { start, end })
}

/// Content type by file extension; the player needs it to pick a demuxer.
pub(crate) fn content_type_for(name: &str) -> &'static str {
    let ext = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "mp4" | "m4v" => "video/mp4",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "avi" => "video/x-msvideo",
        "mov" => "video/quicktime",
        "ts" => "video/mp2t",
        "mp3" => "audio/mpeg",
        "m4a" => "audio/mp4",
        "flac" => "audio/flac",
        "ogg" => "audio/ogg",
        "wav" => "audio/wav",
        "srt" => "application/x-subrip",
        "vtt" => "text/vtt",
        _ => "application/octet-stream",
    }
}

/// Response body that ties a byte source to its stream lease.
struct LeasedStream {
    inner: Option<ReaderStream<ByteSource>>,
    /// Chunk read ahead before headers were committed.
    first: Option<Bytes>,
    lease: Option<StreamLease>,
    stream_id: Uuid,
    expected: u64,
    sent: u64,
    started: Instant,
}

impl LeasedStream {
    fn new(
        inner: ReaderStream<ByteSource>,
        first: Option<Bytes>,
        lease: StreamLease,
        stream_id: Uuid,
        expected: u64,
    ) -> Self {
        Self {
            inner: Some(inner),
            first,
            lease: Some(lease),
            stream_id,
            expected,
            sent: 0,
            started: Instant::now(),
        }
    }

    /// Destroy the source and release the lease. Idempotent.
    fn finish(&mut self) {
        self.inner = None;
        self.first = None;
        if let Some(mut lease) = self.lease.take() {
            lease.release();
        }
    }
}

impl Stream for LeasedStream {
    type Item = std::io::Result<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if let Some(chunk) = self.first.take() {
            self.sent += chunk.len() as u64;
            return Poll::Ready(Some(Ok(chunk)));
        }
        let Some(inner) = self.inner.as_mut() else {
            return Poll::Ready(None);
        };
        match Pin::new(inner).poll_next(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Some(Ok(chunk))) => {
                self.sent += chunk.len() as u64;
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(err))) => {
                tracing::warn!(
                    stream_id = %self.stream_id,
                    error = %err,
                    sent = self.sent,
                    expected = self.expected,
                    "stream error; aborting response"
                );
                self.finish();
                Poll::Ready(Some(Err(err)))
            }
            Poll::Ready(None) => {
                tracing::info!(
                    stream_id = %self.stream_id,
                    sent = self.sent,
                    elapsed_ms = self.started.elapsed().as_millis() as u64,
                    "stream finished"
                );
                self.finish();
                Poll::Ready(None)
            }
        }
    }
}

impl Drop for LeasedStream {
    fn drop(&mut self) {
        if self.lease.is_some() {
            let info_hash = self
                .lease
                .as_ref()
                .map(|lease| lease.info_hash().to_string())
                .unwrap_or_default();
            tracing::info!(
                stream_id = %self.stream_id,
                info_hash = %info_hash,
                sent = self.sent,
                expected = self.expected,
                "client disconnected while streaming"
            );
            self.finish();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_range_accepts_open_end() {
        assert_eq!(
            parse_range("bytes=10-", 100).unwrap(),
            ByteRange { start: 10, end: 99 }
        );
    }

    #[test]
    fn parse_range_accepts_exact_bounds() {
        assert_eq!(parse_range("bytes=0-0", 100).unwrap(), ByteRange { start: 0, end: 0 });
        assert_eq!(
            parse_range("bytes=0-99", 100).unwrap(),
            ByteRange { start: 0, end: 99 }
        );
        assert_eq!(parse_range("bytes=0-99", 100).unwrap().len(), 100);
    }

    #[test]
    fn parse_range_rejects_invalid() {
        for header in [
            "items=1-2",
            "bytes=-10",
            "bytes=200-300",
            "bytes=50-40",
            "bytes=0-100",
            "bytes=abc-def",
            "bytes=5",
        ] {
            assert_eq!(
                parse_range(header, 100),
                Err(SessionError::RangeNotSatisfiable { length: 100 }),
                "{header}"
            );
        }
    }

    #[test]
    fn parse_range_rejects_any_range_on_empty_file() {
        assert!(parse_range("bytes=0-", 0).is_err());
        assert!(parse_range("bytes=0-0", 0).is_err());
    }

    #[test]
    fn parse_range_uses_first_range() {
        assert_eq!(
            parse_range("bytes=0-1,2-3", 100).unwrap(),
            ByteRange { start: 0, end: 1 }
        );
    }

    #[test]
    fn content_type_by_extension() {
        assert_eq!(content_type_for("Sintel.MP4"), "video/mp4");
        assert_eq!(content_type_for("movie.mkv"), "video/x-matroska");
        assert_eq!(content_type_for("README"), "application/octet-stream");
    }

    #[tokio::test]
    async fn leased_stream_yields_source_bytes() {
        use std::sync::Arc as StdArc;

        use crate::config::SessionConfig;
        use crate::engine::mock::{MockEngine, MockFile};
        use crate::magnet::MagnetLink;
        use crate::session::SessionManager;

        let engine = StdArc::new(
            MockEngine::new(vec![], vec![MockFile::new("a.mp4", 300)])
                .with_event_delay(std::time::Duration::from_millis(1)),
        );
        let sessions = SessionManager::new(engine, SessionConfig::default());
        let magnet =
            MagnetLink::parse("magnet:?xt=urn:btih:abababababababababababababababababababab").unwrap();
        sessions.add(magnet.clone()).await.unwrap();
        let lease = sessions.refs().increment(&magnet.info_hash).unwrap();

        let source: ByteSource = Box::new(std::io::Cursor::new(vec![1u8; 300]));
        let mut reader = ReaderStream::new(source);
        let first = reader.next().await.unwrap().unwrap();
        let mut stream = LeasedStream::new(reader, Some(first), lease, Uuid::new_v4(), 300);
        let mut total = 0;
        while let Some(chunk) = stream.next().await {
            total += chunk.unwrap().len();
        }
        assert_eq!(total, 300);
        assert!(stream.lease.is_none());
        assert!(stream.inner.is_none());
    }
}
