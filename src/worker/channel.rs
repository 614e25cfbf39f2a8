//! Framed byte channel to a single worker process.
//!
//! Wraps the worker's stdin/stdout with buffered, newline-framed I/O. The
//! channel itself does not enforce turn-taking; whoever holds it has exclusive
//! access, and the dispatcher moves it in and out of the pool to guarantee one
//! exchange at a time.

use std::io;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

use super::protocol::{RequestEnvelope, ResponseEnvelope};
use crate::error::{Result, TuskError};

/// Default buffer size for IPC (64KB).
const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Default upper bound for a single response line (64 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// Request/response channel bound to one worker.
pub struct WorkerChannel {
    /// Worker id, used to tag errors.
    id: usize,
    writer: BufWriter<BoxedWriter>,
    reader: BufReader<BoxedReader>,
    line: Vec<u8>,
    max_frame_bytes: usize,
}

impl WorkerChannel {
    /// Create a channel from a worker's input (`writer`) and output (`reader`) streams.
    pub fn new<W, R>(id: usize, writer: W, reader: R, max_frame_bytes: usize) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
        R: AsyncRead + Send + Unpin + 'static,
    {
        Self {
            id,
            writer: BufWriter::with_capacity(DEFAULT_BUFFER_SIZE, Box::new(writer)),
            reader: BufReader::with_capacity(DEFAULT_BUFFER_SIZE, Box::new(reader)),
            line: Vec::with_capacity(4096),
            max_frame_bytes,
        }
    }

    /// Send one request line and flush it.
    pub async fn send(&mut self, request: &RequestEnvelope) -> Result<()> {
        let line = request.to_line()?;
        let written = match self.writer.write_all(&line).await {
            Ok(()) => self.writer.flush().await,
            Err(e) => Err(e),
        };
        written.map_err(|e| self.write_error(e))
    }

    /// Receive exactly one response line.
    ///
    /// Blank lines are skipped. End of stream, an oversized or undecodable
    /// frame, and output already buffered past the frame are all errors; no
    /// partial recovery is attempted.
    pub async fn recv(&mut self) -> Result<ResponseEnvelope> {
        loop {
            self.line.clear();
            let limit = (self.max_frame_bytes as u64).saturating_add(1);
            let result = {
                let mut framed = (&mut self.reader).take(limit);
                framed.read_until(b'\n', &mut self.line).await
            };
            let read = result.map_err(|e| self.read_error(e))?;

            if read == 0 {
                return Err(TuskError::ChannelClosed { id: self.id });
            }
            if !self.line.ends_with(b"\n") {
                if self.line.len() as u64 >= limit {
                    return Err(TuskError::Protocol {
                        id: self.id,
                        message: format!(
                            "response frame exceeds {} bytes",
                            self.max_frame_bytes
                        ),
                    });
                }
                // Stream ended in the middle of a frame.
                return Err(TuskError::ChannelClosed { id: self.id });
            }
            if self.line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            let response =
                ResponseEnvelope::from_line(&self.line).map_err(|e| TuskError::Protocol {
                    id: self.id,
                    message: format!("invalid worker response: {}", e),
                })?;
            // A stray frame would be read as the answer to the next request.
            if !self.reader.buffer().iter().all(u8::is_ascii_whitespace) {
                return Err(TuskError::Protocol {
                    id: self.id,
                    message: "worker wrote more than one frame".to_string(),
                });
            }
            return Ok(response);
        }
    }

    /// One full turn: send a request, then read its response.
    pub async fn exchange(&mut self, request: &RequestEnvelope) -> Result<ResponseEnvelope> {
        self.send(request).await?;
        self.recv().await
    }

    fn write_error(&self, err: io::Error) -> TuskError {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                TuskError::ChannelClosed { id: self.id }
            }
            _ => TuskError::Protocol {
                id: self.id,
                message: format!("failed to send to worker: {}", err),
            },
        }
    }

    fn read_error(&self, err: io::Error) -> TuskError {
        match err.kind() {
            io::ErrorKind::UnexpectedEof | io::ErrorKind::ConnectionReset => {
                TuskError::ChannelClosed { id: self.id }
            }
            _ => TuskError::Protocol {
                id: self.id,
                message: format!("failed to receive from worker: {}", err),
            },
        }
    }
}

impl std::fmt::Debug for WorkerChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerChannel")
            .field("id", &self.id)
            .field("max_frame_bytes", &self.max_frame_bytes)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, DuplexStream, duplex};

    /// Channel plus the "worker side" of both pipes.
    fn create_channel(max_frame_bytes: usize) -> (WorkerChannel, DuplexStream, DuplexStream) {
        let (host_in, worker_in) = duplex(1024 * 1024);
        let (worker_out, host_out) = duplex(1024 * 1024);
        let channel = WorkerChannel::new(7, host_in, host_out, max_frame_bytes);
        (channel, worker_in, worker_out)
    }

    #[tokio::test]
    async fn test_exchange_with_echo_worker() {
        let (mut channel, worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);

        let worker = tokio::spawn(async move {
            let mut lines = tokio::io::BufReader::new(worker_in).lines();
            while let Some(line) = lines.next_line().await.unwrap() {
                worker_out.write_all(line.as_bytes()).await.unwrap();
                worker_out.write_all(b"\n").await.unwrap();
            }
        });

        let req = RequestEnvelope::new("POST", "/")
            .with_header("X-Test", "1")
            .with_body("ping\nwith\u{1}control");
        let resp = channel.exchange(&req).await.unwrap();
        assert_eq!(resp.status(), 200);
        assert_eq!(resp.body(), req.body.as_slice());
        assert_eq!(resp.headers["X-Test"], "1");

        // Second turn on the same channel.
        let resp = channel
            .exchange(&RequestEnvelope::new("GET", "/").with_body("pong"))
            .await
            .unwrap();
        assert_eq!(resp.body(), b"pong");

        drop(channel);
        worker.await.unwrap();
    }

    #[tokio::test]
    async fn test_recv_eof_is_channel_closed() {
        let (mut channel, _worker_in, worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        drop(worker_out);

        let err = channel.recv().await.unwrap_err();
        assert!(matches!(err, TuskError::ChannelClosed { id: 7 }));
    }

    #[tokio::test]
    async fn test_recv_partial_frame_is_channel_closed() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        worker_out.write_all(br#"{"status":200,"bo"#).await.unwrap();
        drop(worker_out);

        let err = channel.recv().await.unwrap_err();
        assert!(matches!(err, TuskError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_recv_malformed_frame_is_protocol_error() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        worker_out
            .write_all(b"Warning: something printed to stdout\n")
            .await
            .unwrap();

        let err = channel.recv().await.unwrap_err();
        match err {
            TuskError::Protocol { id, message } => {
                assert_eq!(id, 7);
                assert!(message.contains("invalid worker response"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_oversized_frame_is_protocol_error() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(32);
        let body = "x".repeat(100);
        worker_out
            .write_all(format!("{{\"body\":\"{}\"}}\n", body).as_bytes())
            .await
            .unwrap();

        let err = channel.recv().await.unwrap_err();
        assert!(err.to_string().contains("exceeds 32 bytes"));
    }

    #[tokio::test]
    async fn test_recv_skips_blank_lines_and_crlf() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        worker_out
            .write_all(b"\n  \r\n{\"status\":418,\"body\":\"teapot\"}\r\n")
            .await
            .unwrap();

        let resp = channel.recv().await.unwrap();
        assert_eq!(resp.status(), 418);
        assert_eq!(resp.body(), b"teapot");
    }

    #[tokio::test]
    async fn test_recv_extra_frame_is_protocol_error() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        worker_out
            .write_all(b"{\"body\":\"a\"}\n{\"body\":\"b\"}\n")
            .await
            .unwrap();

        let err = channel.recv().await.unwrap_err();
        match err {
            TuskError::Protocol { id, message } => {
                assert_eq!(id, 7);
                assert!(message.contains("more than one frame"));
            }
            other => panic!("Expected Protocol error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_recv_trailing_blank_line_is_not_an_extra_frame() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        worker_out.write_all(b"{\"body\":\"a\"}\n\n").await.unwrap();

        let resp = channel.recv().await.unwrap();
        assert_eq!(resp.body(), b"a");
    }

    #[tokio::test]
    async fn test_recv_with_unbounded_frame_limit() {
        let (mut channel, _worker_in, mut worker_out) = create_channel(usize::MAX);
        worker_out
            .write_all(b"{\"status\":201,\"body\":\"ok\"}\n")
            .await
            .unwrap();

        let resp = channel.recv().await.unwrap();
        assert_eq!(resp.status(), 201);
        assert_eq!(resp.body(), b"ok");
    }

    #[tokio::test]
    async fn test_send_to_closed_worker_fails() {
        let (mut channel, worker_in, _worker_out) = create_channel(DEFAULT_MAX_FRAME_BYTES);
        drop(worker_in);

        let err = channel
            .send(&RequestEnvelope::new("GET", "/"))
            .await
            .unwrap_err();
        assert!(err.is_worker_fatal());
    }
}
