//! Streaming transfer primitives shared by every provider.

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio_util::io::ReaderStream;

use crate::cancel::{run_cancellable, CancellationToken};
use crate::{Error, Result};

/// Byte stream type for upload/download operations.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

/// Progress callback, invoked with cumulative byte counts.
///
/// Counts never decrease within one operation. There is no guaranteed final
/// call; completion is signalled by the operation returning.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// An upload payload with its declared length.
///
/// Several backends need the size before the first byte is sent (MEGA
/// upload slots, S3 `Content-Length`, Glacier part ranges), so uploads carry
/// it alongside the stream instead of buffering to measure.
pub struct SizedStream {
    stream: ByteStream,
    length: u64,
}

impl SizedStream {
    /// Wrap a stream that yields exactly `length` bytes.
    pub fn new(stream: ByteStream, length: u64) -> Self {
        Self { stream, length }
    }

    /// Payload held fully in memory.
    pub fn from_bytes(data: impl Into<Bytes>) -> Self {
        let data: Bytes = data.into();
        let length = data.len() as u64;
        let stream = if data.is_empty() {
            futures::stream::empty::<Result<Bytes>>().boxed()
        } else {
            futures::stream::once(async move { Ok(data) }).boxed()
        };
        Self { stream, length }
    }

    /// Payload read from an async reader, e.g. an open file.
    pub fn from_reader<R>(reader: R, length: u64) -> Self
    where
        R: AsyncRead + Send + 'static,
    {
        let stream = ReaderStream::new(reader).map(|chunk| chunk.map_err(Error::from));
        Self {
            stream: Box::pin(stream),
            length,
        }
    }

    /// Declared length in bytes.
    pub fn len(&self) -> u64 {
        self.length
    }

    /// Whether the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.length == 0
    }

    /// Stream that fails with `InvalidInput` if the source yields more or
    /// fewer bytes than declared.
    pub fn into_checked_stream(self) -> ByteStream {
        let expected = self.length;
        let state = (self.stream, 0u64, false);

        Box::pin(futures::stream::unfold(
            state,
            move |(mut stream, mut seen, finished)| async move {
                if finished {
                    return None;
                }
                match stream.next().await {
                    Some(Ok(chunk)) => {
                        seen += chunk.len() as u64;
                        if seen > expected {
                            let err = Error::InvalidInput(format!(
                                "Stream is longer than its declared length of {} bytes",
                                expected
                            ));
                            return Some((Err(err), (stream, seen, true)));
                        }
                        Some((Ok(chunk), (stream, seen, false)))
                    }
                    Some(Err(err)) => Some((Err(err), (stream, seen, true))),
                    None if seen < expected => {
                        let err = Error::InvalidInput(format!(
                            "Stream ended after {} of {} declared bytes",
                            seen, expected
                        ));
                        Some((Err(err), (stream, seen, true)))
                    }
                    None => None,
                }
            },
        ))
    }
}

/// Inclusive byte range for partial downloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    /// First byte offset.
    pub start: u64,
    /// Last byte offset (inclusive); `None` means to the end of the object.
    pub end: Option<u64>,
}

impl ByteRange {
    /// Create a range.
    ///
    /// # Errors
    /// - `InvalidInput` if `end < start`
    pub fn new(start: u64, end: Option<u64>) -> Result<Self> {
        if let Some(end) = end {
            if end < start {
                return Err(Error::InvalidInput(format!(
                    "Range end {} is before start {}",
                    end, start
                )));
            }
        }
        Ok(Self { start, end })
    }

    /// Resolve against the object size into concrete inclusive bounds.
    ///
    /// # Errors
    /// - `InvalidInput` if the range starts at or past the end of the object
    pub fn resolve(&self, size: u64) -> Result<(u64, u64)> {
        if self.start >= size {
            return Err(Error::InvalidInput(format!(
                "Range start {} is beyond object size {}",
                self.start, size
            )));
        }
        let last = size - 1;
        Ok((self.start, self.end.map_or(last, |e| e.min(last))))
    }

    /// HTTP `Range` header value.
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Tracks cumulative progress for one operation.
pub struct ProgressTracker {
    callback: Option<ProgressCallback>,
    transferred: u64,
}

impl ProgressTracker {
    /// Create a tracker reporting to `callback`, if any.
    pub fn new(callback: Option<ProgressCallback>) -> Self {
        Self {
            callback,
            transferred: 0,
        }
    }

    /// Record `bytes` more and report the new total.
    pub fn advance(&mut self, bytes: u64) {
        self.transferred += bytes;
        if let Some(callback) = &self.callback {
            callback(self.transferred);
        }
    }

    /// Bytes recorded so far.
    pub fn transferred(&self) -> u64 {
        self.transferred
    }
}

/// Report cumulative bytes as the stream is consumed.
pub fn with_progress(stream: ByteStream, progress: Option<ProgressCallback>) -> ByteStream {
    let Some(callback) = progress else {
        return stream;
    };
    let mut total = 0u64;
    Box::pin(stream.map(move |item| {
        if let Ok(chunk) = &item {
            total += chunk.len() as u64;
            callback(total);
        }
        item
    }))
}

/// Copy a stream into `dest`, reporting progress, until the stream ends.
///
/// Returns the number of bytes written. The writer is flushed on success;
/// on failure it holds whatever was written before the error.
pub async fn write_stream(
    mut stream: ByteStream,
    dest: &mut (dyn AsyncWrite + Send + Unpin),
    progress: &mut ProgressTracker,
    token: &CancellationToken,
) -> Result<u64> {
    let mut written = 0u64;
    while let Some(chunk) = run_cancellable(token, async { Ok(stream.next().await) }).await? {
        let chunk = chunk?;
        run_cancellable(token, async { Ok(dest.write_all(&chunk).await?) }).await?;
        written += chunk.len() as u64;
        progress.advance(chunk.len() as u64);
    }
    dest.flush().await?;
    Ok(written)
}

/// Pulls fixed-size chunks out of an arbitrarily framed stream.
///
/// Holds at most one chunk plus one source frame in memory.
pub struct ChunkReader {
    stream: ByteStream,
    buffer: BytesMut,
    exhausted: bool,
}

impl ChunkReader {
    /// Create a reader over `stream`.
    pub fn new(stream: ByteStream) -> Self {
        Self {
            stream,
            buffer: BytesMut::new(),
            exhausted: false,
        }
    }

    /// Read the next `len` bytes; the final chunk may be shorter.
    ///
    /// Returns `None` once the stream is exhausted.
    pub async fn read_chunk(
        &mut self,
        len: usize,
        token: &CancellationToken,
    ) -> Result<Option<Bytes>> {
        while self.buffer.len() < len && !self.exhausted {
            let next = run_cancellable(token, async { Ok(self.stream.next().await) }).await?;
            match next {
                Some(chunk) => self.buffer.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }

        if self.buffer.is_empty() {
            return Ok(None);
        }
        let take = len.min(self.buffer.len());
        Ok(Some(self.buffer.split_to(take).freeze()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    fn frames(parts: Vec<&'static [u8]>) -> ByteStream {
        Box::pin(futures::stream::iter(
            parts.into_iter().map(|p| Ok(Bytes::from_static(p))),
        ))
    }

    async fn collect(stream: ByteStream) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut stream = stream;
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out)
    }

    #[tokio::test]
    async fn test_checked_stream_exact_length() {
        let sized = SizedStream::new(frames(vec![b"abc", b"de"]), 5);
        assert_eq!(collect(sized.into_checked_stream()).await.unwrap(), b"abcde");
    }

    #[tokio::test]
    async fn test_checked_stream_too_short() {
        let sized = SizedStream::new(frames(vec![b"abc"]), 5);
        assert!(matches!(
            collect(sized.into_checked_stream()).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_checked_stream_too_long() {
        let sized = SizedStream::new(frames(vec![b"abc", b"def"]), 4);
        assert!(matches!(
            collect(sized.into_checked_stream()).await,
            Err(Error::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_from_reader() {
        let data = vec![7u8; 10_000];
        let sized = SizedStream::from_reader(std::io::Cursor::new(data.clone()), 10_000);
        assert_eq!(collect(sized.into_checked_stream()).await.unwrap(), data);
    }

    #[tokio::test]
    async fn test_chunk_reader_rechunks() {
        let token = CancellationToken::new();
        let mut reader = ChunkReader::new(frames(vec![b"ab", b"cdefg", b"h"]));

        assert_eq!(&reader.read_chunk(3, &token).await.unwrap().unwrap()[..], b"abc");
        assert_eq!(&reader.read_chunk(3, &token).await.unwrap().unwrap()[..], b"def");
        assert_eq!(&reader.read_chunk(3, &token).await.unwrap().unwrap()[..], b"gh");
        assert!(reader.read_chunk(3, &token).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_write_stream_reports_progress() {
        let token = CancellationToken::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let mut tracker = ProgressTracker::new(Some(Arc::new(move |n| {
            sink.lock().unwrap().push(n);
        })));

        let mut out: Vec<u8> = Vec::new();
        let written = write_stream(frames(vec![b"abc", b"de"]), &mut out, &mut tracker, &token)
            .await
            .unwrap();

        assert_eq!(written, 5);
        assert_eq!(out, b"abcde");
        assert_eq!(*seen.lock().unwrap(), vec![3, 5]);
    }

    #[test]
    fn test_byte_range() {
        assert!(ByteRange::new(10, Some(5)).is_err());

        let range = ByteRange::new(10, Some(19)).unwrap();
        assert_eq!(range.to_header(), "bytes=10-19");
        assert_eq!(range.resolve(15).unwrap(), (10, 14));
        assert!(range.resolve(10).is_err());

        let open = ByteRange::new(3, None).unwrap();
        assert_eq!(open.to_header(), "bytes=3-");
        assert_eq!(open.resolve(8).unwrap(), (3, 7));
    }
}
