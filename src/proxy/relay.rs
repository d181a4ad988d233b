//! One-directional byte relay used by tunnels.

use std::fmt;
use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

const BUFFER_SIZE: usize = 16 * 1024;

/// Which way bytes flow through a tunnel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Client to origin.
    Upstream,
    /// Origin to client.
    Downstream,
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Direction::Upstream => f.write_str("client->origin"),
            Direction::Downstream => f.write_str("origin->client"),
        }
    }
}

/// What happened to one direction of a tunnel.
#[derive(Debug)]
pub struct RelayOutcome {
    pub direction: Direction,
    /// Bytes written to the destination, including those before a fault.
    pub bytes: u64,
    /// Set when the copy stopped on an I/O error instead of end-of-stream.
    pub fault: Option<io::Error>,
}

/// Stream `source` into `destination` until end-of-stream or an I/O fault.
///
/// On end-of-stream the destination's write side is shut down so the peer
/// sees the half-close. Faults are returned, never raised.
pub async fn copy<W, R>(destination: &mut W, source: &mut R, direction: Direction) -> RelayOutcome
where
    W: AsyncWrite + Unpin + ?Sized,
    R: AsyncRead + Unpin + ?Sized,
{
    let mut buf = vec![0u8; BUFFER_SIZE];
    let mut bytes = 0u64;

    let fault = loop {
        let n = match source.read(&mut buf).await {
            Ok(0) => break destination.shutdown().await.err(),
            Ok(n) => n,
            Err(e) => break Some(e),
        };
        if let Err(e) = destination.write_all(&buf[..n]).await {
            break Some(e);
        }
        bytes += n as u64;
    };

    tracing::trace!(direction = %direction, bytes, faulted = fault.is_some(), "Relay finished");

    RelayOutcome {
        direction,
        bytes,
        fault,
    }
}
