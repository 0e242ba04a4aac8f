//! Extracting a file from the device's SD transfer channel.
//!
//! The device streams the file verbatim and terminates it with an in-band
//! ASCII sentinel. The sentinel can land anywhere relative to transport
//! chunk boundaries, so a tail of `sentinel length - 1` bytes is withheld
//! from the sink until the next chunk rules a match out.

use std::time::Duration;

use log::debug;
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::{Instant, timeout_at};
use tokio_util::sync::CancellationToken;

pub const END_OF_FILE_SENTINEL: &[u8] = b"__END_OF_FILE__";

/// Emit an intermediate progress report roughly every this many bytes.
const PROGRESS_BYTE_INTERVAL: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer cancelled")]
    Cancelled,
    #[error("timed out waiting for the end-of-file sentinel after {bytes_written} bytes")]
    Timeout { bytes_written: u64 },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub file_name: String,
    pub bytes_written: u64,
}

pub struct TransferOptions {
    /// Overall budget for the transfer; the stream ending without a sentinel
    /// also counts as a timeout.
    pub timeout: Duration,
    pub buffer_size: usize,
    pub progress: Option<Box<dyn FnMut(TransferProgress) + Send>>,
    pub cancel: Option<CancellationToken>,
}

impl Default for TransferOptions {
    fn default() -> Self {
        TransferOptions {
            timeout: Duration::from_secs(30),
            buffer_size: super::DEFAULT_BUFFER_SIZE,
            progress: None,
            cancel: None,
        }
    }
}

/// Copy bytes from `reader` to `writer` until the sentinel is seen. The
/// sentinel itself is not written, and nothing past it is read. Returns the
/// number of bytes written.
pub async fn read_until_sentinel<R, W>(
    reader: &mut R,
    writer: &mut W,
    file_name: &str,
    mut options: TransferOptions,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let sentinel_len = END_OF_FILE_SENTINEL.len();
    let cancel = options.cancel.take().unwrap_or_default();
    let deadline = Instant::now() + options.timeout;
    let mut chunk = vec![0u8; options.buffer_size.max(1)];
    let mut window: Vec<u8> = Vec::with_capacity(options.buffer_size + sentinel_len);
    let mut bytes_written = 0u64;
    let mut last_reported = 0u64;

    let mut report = |bytes_written: u64| {
        if let Some(progress) = options.progress.as_mut() {
            progress(TransferProgress {
                file_name: file_name.to_string(),
                bytes_written,
            });
        }
    };

    loop {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }

        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            read = timeout_at(deadline, reader.read(&mut chunk)) => match read {
                Ok(read) => read?,
                Err(_) => return Err(TransferError::Timeout { bytes_written }),
            },
        };
        if read == 0 {
            debug!("source ended after {bytes_written} bytes without a sentinel");
            return Err(TransferError::Timeout { bytes_written });
        }
        window.extend_from_slice(&chunk[..read]);

        if let Some(index) = find_sentinel(&window) {
            writer.write_all(&window[..index]).await?;
            bytes_written += index as u64;
            writer.flush().await?;
            report(bytes_written);
            return Ok(bytes_written);
        }

        // Everything but a possible sentinel prefix is safe to flush.
        let keep = window.len().min(sentinel_len - 1);
        let flush_len = window.len() - keep;
        if flush_len > 0 {
            writer.write_all(&window[..flush_len]).await?;
            bytes_written += flush_len as u64;
            window.drain(..flush_len);
        }

        if bytes_written - last_reported >= PROGRESS_BYTE_INTERVAL {
            last_reported = bytes_written;
            report(bytes_written);
        }
    }
}

fn find_sentinel(window: &[u8]) -> Option<usize> {
    if window.len() < END_OF_FILE_SENTINEL.len() {
        return None;
    }
    window
        .windows(END_OF_FILE_SENTINEL.len())
        .position(|candidate| candidate == END_OF_FILE_SENTINEL)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::pin::Pin;
    use std::task::{Context, Poll};

    /// Serves a byte slice in fixed-size chunks.
    struct ChunkedReader {
        data: Vec<u8>,
        position: usize,
        chunk_size: usize,
    }

    impl ChunkedReader {
        fn new(data: Vec<u8>, chunk_size: usize) -> Self {
            ChunkedReader {
                data,
                position: 0,
                chunk_size,
            }
        }
    }

    impl AsyncRead for ChunkedReader {
        fn poll_read(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &mut tokio::io::ReadBuf<'_>,
        ) -> Poll<std::io::Result<()>> {
            let remaining = &self.data[self.position..];
            let len = remaining.len().min(self.chunk_size).min(buf.remaining());
            buf.put_slice(&remaining[..len]);
            self.position += len;
            Poll::Ready(Ok(()))
        }
    }

    fn options() -> TransferOptions {
        TransferOptions {
            timeout: Duration::from_secs(5),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_sentinel_split_across_chunks() {
        let mut data: Vec<u8> = (1..=10).collect();
        data.extend_from_slice(END_OF_FILE_SENTINEL);
        let mut reader = ChunkedReader::new(data, 5);
        let mut sink = Vec::new();
        let written = read_until_sentinel(&mut reader, &mut sink, "log_1.bin", options())
            .await
            .unwrap();
        assert_eq!(written, 10);
        assert_eq!(sink, (1..=10).collect::<Vec<u8>>());
    }

    #[tokio::test]
    async fn test_bytes_after_sentinel_not_read() {
        let mut data = b"payload".to_vec();
        data.extend_from_slice(END_OF_FILE_SENTINEL);
        data.extend_from_slice(b"trailing garbage");
        let total = data.len();
        let mut reader = ChunkedReader::new(data, total);
        let mut sink = Vec::new();
        read_until_sentinel(&mut reader, &mut sink, "log_1.bin", options())
            .await
            .unwrap();
        assert_eq!(sink, b"payload");
    }

    #[tokio::test]
    async fn test_sentinel_prefix_is_flushed() {
        // A run of underscores that never completes the sentinel must still
        // reach the sink.
        let mut data = b"__END_OF_F".to_vec();
        data.extend_from_slice(b"more data");
        data.extend_from_slice(END_OF_FILE_SENTINEL);
        let mut reader = ChunkedReader::new(data.clone(), 4);
        let mut sink = Vec::new();
        let written = read_until_sentinel(&mut reader, &mut sink, "log_1.bin", options())
            .await
            .unwrap();
        assert_eq!(sink, b"__END_OF_Fmore data");
        assert_eq!(written, sink.len() as u64);
    }

    #[tokio::test]
    async fn test_eos_without_sentinel_is_timeout() {
        let mut reader = Cursor::new(b"no sentinel here".to_vec());
        let mut sink = Vec::new();
        let err = read_until_sentinel(&mut reader, &mut sink, "log_1.bin", options())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut reader = Cursor::new(b"data".to_vec());
        let mut sink = Vec::new();
        let err = read_until_sentinel(
            &mut reader,
            &mut sink,
            "log_1.bin",
            TransferOptions {
                cancel: Some(cancel),
                ..options()
            },
        )
        .await
        .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(sink.is_empty());
    }

    #[tokio::test]
    async fn test_progress_reported() {
        let mut data = vec![0xABu8; 200_000];
        data.extend_from_slice(END_OF_FILE_SENTINEL);
        let mut reader = ChunkedReader::new(data, 8192);
        let mut sink = Vec::new();
        let reports = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink_reports = reports.clone();
        let written = read_until_sentinel(
            &mut reader,
            &mut sink,
            "log_big.bin",
            TransferOptions {
                progress: Some(Box::new(move |p| sink_reports.lock().unwrap().push(p))),
                ..options()
            },
        )
        .await
        .unwrap();
        assert_eq!(written, 200_000);
        let reports = reports.lock().unwrap();
        assert!(reports.len() >= 2);
        assert_eq!(reports.last().unwrap().bytes_written, 200_000);
        assert!(reports.iter().all(|p| p.file_name == "log_big.bin"));
    }
}
