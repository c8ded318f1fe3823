//! Networking primitives.
//!
//! The core only needs "deliver this frame reliably and in order" and "tell me
//! when a frame arrives". That is a TCP stream carrying `u32` big-endian
//! length-prefixed frames; frame contents are defined in [`crate::wire`] and
//! [`crate::messages`].

use std::{
    net::SocketAddr,
    sync::atomic::{AtomicU32, Ordering},
};

use anyhow::{bail, Context as _};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
};

use crate::{
    messages::{encode_frame, NetMsg},
    wire::Context,
};

/// Largest frame either side will accept.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

static NEXT_PEER_ID: AtomicU32 = AtomicU32::new(1);

/// Identifies a connected peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerId(pub u32);

impl PeerId {
    pub fn new_unique() -> Self {
        PeerId(NEXT_PEER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Ordered, reliable frame delivery.
#[async_trait]
pub trait FrameTransport: Send {
    async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()>;

    /// Next whole frame, or `None` on a clean close.
    async fn recv_frame(&mut self) -> anyhow::Result<Option<Bytes>>;

    /// Frames and sends a core message for the receiving side `ctx`.
    async fn send_msg(&mut self, msg: &NetMsg, ctx: Context) -> anyhow::Result<()> {
        self.send_frame(&encode_frame(msg, ctx)).await
    }
}

async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, frame: &[u8]) -> anyhow::Result<()> {
    if frame.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit", frame.len());
    }
    let mut buf = BytesMut::with_capacity(4 + frame.len());
    buf.put_u32(frame.len() as u32);
    buf.extend_from_slice(frame);
    w.write_all(&buf).await.context("tcp write")?;
    Ok(())
}

async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> anyhow::Result<Option<Bytes>> {
    let mut len_buf = [0u8; 4];
    match r.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e).context("tcp read len"),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("peer announced {len} byte frame, limit is {MAX_FRAME_LEN}");
    }
    let mut payload = vec![0u8; len];
    r.read_exact(&mut payload)
        .await
        .context("tcp read payload")?;
    Ok(Some(Bytes::from(payload)))
}

/// Reliable connection over TCP with length-prefixed frames.
#[derive(Debug)]
pub struct ReliableConn {
    stream: TcpStream,
}

impl ReliableConn {
    pub fn new(stream: TcpStream) -> Self {
        Self { stream }
    }

    pub async fn connect(addr: SocketAddr) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(addr).await.context("tcp connect")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok(Self::new(stream))
    }

    pub fn peer_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.stream.peer_addr()?)
    }

    /// Splits into independently owned read and write halves.
    pub fn into_split(self) -> (FrameReader, FrameWriter) {
        let (r, w) = self.stream.into_split();
        (FrameReader { half: r }, FrameWriter { half: w })
    }
}

#[async_trait]
impl FrameTransport for ReliableConn {
    async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.stream, frame).await
    }

    async fn recv_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.stream).await
    }
}

/// Read half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameReader {
    half: OwnedReadHalf,
}

impl FrameReader {
    pub async fn recv_frame(&mut self) -> anyhow::Result<Option<Bytes>> {
        read_frame(&mut self.half).await
    }
}

/// Write half of a [`ReliableConn`].
#[derive(Debug)]
pub struct FrameWriter {
    half: OwnedWriteHalf,
}

impl FrameWriter {
    pub async fn send_frame(&mut self, frame: &[u8]) -> anyhow::Result<()> {
        write_frame(&mut self.half, frame).await
    }

    pub async fn shutdown(&mut self) -> anyhow::Result<()> {
        self.half.shutdown().await.context("tcp shutdown")
    }
}

/// TCP server listener.
pub struct ReliableListener {
    listener: TcpListener,
}

impl ReliableListener {
    pub async fn bind(addr: SocketAddr) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await.context("tcp bind")?;
        Ok(Self { listener })
    }

    pub async fn accept(&self) -> anyhow::Result<(ReliableConn, SocketAddr)> {
        let (stream, addr) = self.listener.accept().await.context("tcp accept")?;
        stream.set_nodelay(true).context("tcp nodelay")?;
        Ok((ReliableConn::new(stream), addr))
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }
}
