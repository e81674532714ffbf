//! TCP transport: duplex bytes in, frames out.
//!
//! A thin layer over TCP4/TCP6 sockets. Knows nothing about the protocol
//! beyond the frame codec it is given: connect/bind with socket tuning,
//! deadline-bounded reads and writes, idempotent close. Errors surface as
//! `ConnectionClosed` (peer went away), `Timeout`, or `Io`.

use crate::core::codec::FrameCodec;
use crate::core::frame::Frame;
use crate::error::{ConduitError, Result};
use crate::utils::timeout::with_timeout;
use futures::{SinkExt, StreamExt};
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, instrument};

/// Establish an outbound TCP connection under a deadline.
///
/// Resolves `host` and picks an address of the requested family;
/// falls back to any resolved address when none matches.
#[instrument(skip(connect_timeout, buffer_size))]
pub async fn connect(
    host: &str,
    port: u16,
    ipv6: bool,
    connect_timeout: Duration,
    buffer_size: usize,
) -> Result<TcpStream> {
    let addrs: Vec<SocketAddr> = tokio::net::lookup_host((host, port)).await?.collect();
    let addr = addrs
        .iter()
        .find(|a| if ipv6 { a.is_ipv6() } else { a.is_ipv4() })
        .or_else(|| addrs.first())
        .copied()
        .ok_or_else(|| ConduitError::ConfigError(format!("No address found for {host}:{port}")))?;

    let socket = if addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    tune_socket(&socket, buffer_size);

    let stream = with_timeout(
        async { socket.connect(addr).await.map_err(ConduitError::from) },
        connect_timeout,
    )
    .await?;
    stream.set_nodelay(true)?;

    debug!(peer = %addr, "TCP connection established");
    Ok(stream)
}

/// Bind a listening socket on the configured address family.
pub async fn bind(host: &str, port: u16, ipv6: bool, buffer_size: usize) -> Result<TcpListener> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| ConduitError::ConfigError(format!("Invalid listen host: {host}")))?;
    let addr = SocketAddr::new(ip, port);

    let socket = if ipv6 || addr.is_ipv6() {
        TcpSocket::new_v6()?
    } else {
        TcpSocket::new_v4()?
    };
    tune_socket(&socket, buffer_size);
    socket.bind(addr)?;

    let listener = socket.listen(1024)?;
    debug!(local = %listener.local_addr()?, "Listening");
    Ok(listener)
}

/// Buffer-size hints are advisory; the OS may clamp or ignore them.
fn tune_socket(socket: &TcpSocket, buffer_size: usize) {
    if buffer_size > 0 {
        let _ = socket.set_recv_buffer_size(buffer_size as u32);
        let _ = socket.set_send_buffer_size(buffer_size as u32);
    }
}

/// Split a stream into deadline-aware framed halves.
pub fn split(
    stream: TcpStream,
    codec: FrameCodec,
    send_timeout: Duration,
) -> (FrameWriter, FrameReader) {
    let peer = stream.peer_addr().ok();
    let (read_half, write_half) = stream.into_split();
    (
        FrameWriter {
            inner: FramedWrite::new(write_half, codec),
            send_timeout,
            closed: false,
        },
        FrameReader {
            inner: FramedRead::new(read_half, codec),
            peer,
        },
    )
}

/// Read half: yields complete frames as they arrive.
pub struct FrameReader {
    inner: FramedRead<OwnedReadHalf, FrameCodec>,
    peer: Option<SocketAddr>,
}

impl FrameReader {
    /// Await the next frame. A cleanly ended stream maps to `ConnectionClosed`.
    pub async fn next(&mut self) -> Result<Frame> {
        match self.inner.next().await {
            Some(Ok(frame)) => Ok(frame),
            Some(Err(e)) => Err(e),
            None => Err(ConduitError::ConnectionClosed),
        }
    }

    /// Await the next frame under a deadline.
    pub async fn next_timeout(&mut self, deadline: Duration) -> Result<Frame> {
        with_timeout(self.next(), deadline).await
    }

    /// Peer address captured at split time.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }
}

/// Write half: frame sink with a per-frame deadline and idempotent close.
pub struct FrameWriter {
    inner: FramedWrite<OwnedWriteHalf, FrameCodec>,
    send_timeout: Duration,
    closed: bool,
}

impl FrameWriter {
    /// Encode and write one frame, flushing, under the write deadline.
    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        if self.closed {
            return Err(ConduitError::ConnectionClosed);
        }
        with_timeout(
            async {
                self.inner.send(frame).await?;
                Ok(())
            },
            self.send_timeout,
        )
        .await
    }

    /// Flush and shut down the write side. Safe to call repeatedly.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        // The peer may already be gone; a failed shutdown is not an error
        let _ = self.inner.close().await;
        Ok(())
    }
}
