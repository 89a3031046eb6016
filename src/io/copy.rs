//! Bidirectional copy for established tunnels
//!
//! Copies both directions concurrently. A clean EOF on one side is forwarded
//! as a write shutdown and the other direction keeps running; an error in
//! either direction ends the whole copy so the caller closes both streams.

use std::future::Future;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tracing::debug;

/// Default per-direction buffer size
pub const DEFAULT_BUFFER_SIZE: usize = 64 * 1024;

/// Result of a bidirectional copy operation
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CopyResult {
    /// Bytes transferred from client to upstream
    pub client_to_upstream: u64,
    /// Bytes transferred from upstream to client
    pub upstream_to_client: u64,
}

impl CopyResult {
    /// Total bytes transferred in both directions
    #[must_use]
    pub const fn total(&self) -> u64 {
        self.client_to_upstream + self.upstream_to_client
    }
}

/// Progress of one direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Buffer empty, waiting for the reader
    Reading,
    /// `buf[pos..end]` still has to be written
    Writing { pos: usize, end: usize },
    /// Reader hit EOF; flush and shut down the writer
    Closing,
    Done,
}

/// One direction of a tunnel: reads from one stream, writes to the other
struct Pipe {
    buf: Box<[u8]>,
    stage: Stage,
    copied: u64,
}

impl Pipe {
    fn new(buf_size: usize) -> Self {
        Self {
            buf: vec![0u8; buf_size.max(1)].into_boxed_slice(),
            stage: Stage::Reading,
            copied: 0,
        }
    }

    fn poll_pipe<R, W>(&mut self, cx: &mut Context<'_>, reader: &mut R, writer: &mut W) -> Poll<io::Result<()>>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        loop {
            match self.stage {
                Stage::Reading => {
                    let mut read_buf = ReadBuf::new(&mut self.buf);
                    ready!(Pin::new(&mut *reader).poll_read(cx, &mut read_buf))?;
                    let end = read_buf.filled().len();
                    self.stage = if end == 0 {
                        Stage::Closing
                    } else {
                        Stage::Writing { pos: 0, end }
                    };
                }
                Stage::Writing { pos, end } => {
                    let n = ready!(Pin::new(&mut *writer).poll_write(cx, &self.buf[pos..end]))?;
                    if n == 0 {
                        return Poll::Ready(Err(io::Error::new(io::ErrorKind::WriteZero, "peer accepted zero bytes")));
                    }
                    self.copied += n as u64;
                    self.stage = if pos + n == end {
                        Stage::Reading
                    } else {
                        Stage::Writing { pos: pos + n, end }
                    };
                }
                Stage::Closing => {
                    ready!(Pin::new(&mut *writer).poll_flush(cx))?;
                    ready!(Pin::new(&mut *writer).poll_shutdown(cx))?;
                    self.stage = Stage::Done;
                }
                Stage::Done => return Poll::Ready(Ok(())),
            }
        }
    }
}

/// Future driving both pipes of a tunnel
struct BidirectionalCopy<'a, A, B> {
    client: &'a mut A,
    upstream: &'a mut B,
    up: Pipe,
    down: Pipe,
}

impl<'a, A, B> BidirectionalCopy<'a, A, B> {
    fn new(client: &'a mut A, upstream: &'a mut B, buf_size: usize) -> Self {
        Self {
            client,
            upstream,
            up: Pipe::new(buf_size),
            down: Pipe::new(buf_size),
        }
    }
}

impl<A, B> Future for BidirectionalCopy<'_, A, B>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    type Output = io::Result<CopyResult>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();

        let up = this.up.poll_pipe(cx, this.client, this.upstream);
        if let Poll::Ready(Err(e)) = up {
            debug!("client->upstream transfer error: {}", e);
            return Poll::Ready(Err(e));
        }
        let down = this.down.poll_pipe(cx, this.upstream, this.client);
        if let Poll::Ready(Err(e)) = down {
            debug!("upstream->client transfer error: {}", e);
            return Poll::Ready(Err(e));
        }

        if up.is_pending() || down.is_pending() {
            return Poll::Pending;
        }
        Poll::Ready(Ok(CopyResult {
            client_to_upstream: this.up.copied,
            upstream_to_client: this.down.copied,
        }))
    }
}

/// Perform bidirectional copy between two streams
///
/// Runs until both directions reach EOF, or until either direction fails.
///
/// # Errors
///
/// Returns the first read, write or shutdown error from either direction.
pub async fn bidirectional_copy<A, B>(a: &mut A, b: &mut B) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    BidirectionalCopy::new(a, b, DEFAULT_BUFFER_SIZE).await
}

/// Perform bidirectional copy with custom buffer size
///
/// # Errors
///
/// See [`bidirectional_copy`].
pub async fn bidirectional_copy_with_buffer<A, B>(
    a: &mut A,
    b: &mut B,
    buf_size: usize,
) -> io::Result<CopyResult>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    BidirectionalCopy::new(a, b, buf_size).await
}
