//! Framed Links.
//!
//! A `Link` carries length-prefixed frames, one encoded flit each, over any
//! byte stream: a TCP connection between processes or an in-memory duplex
//! pipe inside one process. Each link runs two tasks:
//!
//! * a writer draining the send queue in order, and
//! * a reader delivering each complete frame exactly once, in order.
//!
//! A frame with an impossible length, an I/O error or the peer closing the
//! stream ends the link with a single `LinkEvent::Closed`. The owner of the
//! link decides what link loss means for its port (normally: link down and
//! every outstanding transaction aborted).

pub mod capture;

use bytes::Bytes;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::codec::frame::{decode_frame_len, encode_frame};
use crate::codec::Flit;
use crate::common::constants::FRAME_LEN_PREFIX;
use crate::common::{LinkId, TransportError};
use capture::{CaptureSink, Direction, FlitRecord};

pub use capture::ChannelCapture;

/// Size of the in-process pipe buffer used by `Link::pair`.
const DUPLEX_BUFFER: usize = 64 * 1024;

static NEXT_LINK_ID: AtomicU32 = AtomicU32::new(1);

fn next_link_id() -> LinkId {
    LinkId(NEXT_LINK_ID.fetch_add(1, Ordering::Relaxed))
}

/// Something that happened on the receive side of a link.
#[derive(Debug)]
pub enum LinkEvent {
    /// One complete frame body (an encoded flit).
    Frame(Bytes),
    /// The link is gone. `None` when the peer closed it cleanly.
    Closed(Option<TransportError>),
}

enum WriterCmd {
    Frame(Bytes),
    Close,
}

/// Cloneable send half of a link.
#[derive(Clone)]
pub struct LinkSender {
    id: LinkId,
    tx: mpsc::UnboundedSender<WriterCmd>,
}

impl LinkSender {
    pub fn id(&self) -> LinkId {
        self.id
    }

    /// Queues one frame body for ordered delivery.
    pub fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.tx
            .send(WriterCmd::Frame(bytes))
            .map_err(|_| TransportError::Closed(self.id))
    }

    /// Encodes and queues a flit.
    pub fn send_flit(&self, flit: &Flit) -> Result<(), TransportError> {
        let bytes = flit.encode()?;
        self.send(Bytes::from(bytes))
    }

    /// Flushes queued frames and shuts the stream down.
    pub fn close(&self) {
        let _ = self.tx.send(WriterCmd::Close);
    }

    /// Returns `true` once the writer task has exited.
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// One end of a framed byte stream.
pub struct Link {
    sender: LinkSender,
    peer: String,
    events: Option<mpsc::UnboundedReceiver<LinkEvent>>,
    reader: JoinHandle<()>,
}

impl Link {
    /// Wraps a connected byte stream.
    ///
    /// # Arguments
    ///
    /// * `stream` - Any bidirectional async byte stream
    /// * `peer` - Peer description used in logs and errors
    /// * `max_frame` - Largest accepted frame body (the flit capacity)
    /// * `capture` - Optional observer of every flit sent and received
    pub fn from_stream<S>(
        stream: S,
        peer: String,
        max_frame: usize,
        capture: Option<Arc<dyn CaptureSink>>,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let id = next_link_id();
        let (read_half, write_half) = tokio::io::split(stream);
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        tokio::spawn(writer_loop(id, write_half, cmd_rx, capture.clone()));
        let reader = tokio::spawn(reader_loop(
            id,
            read_half,
            max_frame,
            event_tx,
            cmd_tx.clone(),
            capture,
        ));
        log::debug!("[{}] up, peer {}", id, peer);

        Self {
            sender: LinkSender { id, tx: cmd_tx },
            peer,
            events: Some(event_rx),
            reader,
        }
    }

    /// Creates two links joined by an in-memory pipe.
    pub fn pair(max_frame: usize) -> (Link, Link) {
        let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
        (
            Link::from_stream(a, "duplex:a".to_string(), max_frame, None),
            Link::from_stream(b, "duplex:b".to_string(), max_frame, None),
        )
    }

    pub fn id(&self) -> LinkId {
        self.sender.id
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    /// Returns a cloneable send handle.
    pub fn sender(&self) -> LinkSender {
        self.sender.clone()
    }

    /// Queues one frame body for ordered delivery.
    pub fn send(&self, bytes: Bytes) -> Result<(), TransportError> {
        self.sender.send(bytes)
    }

    /// Encodes and queues a flit.
    pub fn send_flit(&self, flit: &Flit) -> Result<(), TransportError> {
        self.sender.send_flit(flit)
    }

    /// Waits for the next event.
    ///
    /// After `Closed` (or once `on_bytes` has taken the receive side) this
    /// keeps returning `Closed(None)`.
    pub async fn recv(&mut self) -> LinkEvent {
        match self.events.as_mut() {
            Some(rx) => match rx.recv().await {
                Some(LinkEvent::Closed(reason)) => {
                    self.events = None;
                    LinkEvent::Closed(reason)
                }
                Some(event) => event,
                None => {
                    self.events = None;
                    LinkEvent::Closed(None)
                }
            },
            None => LinkEvent::Closed(None),
        }
    }

    /// Hands every delivered frame to `handler`, in order, exactly once.
    ///
    /// # Returns
    ///
    /// A task that finishes when the link closes, yielding the close reason.
    pub fn on_bytes<F>(&mut self, mut handler: F) -> JoinHandle<Option<TransportError>>
    where
        F: FnMut(Bytes) + Send + 'static,
    {
        let events = self.events.take();
        tokio::spawn(async move {
            let Some(mut rx) = events else {
                return None;
            };
            while let Some(event) = rx.recv().await {
                match event {
                    LinkEvent::Frame(bytes) => handler(bytes),
                    LinkEvent::Closed(reason) => return reason,
                }
            }
            None
        })
    }

    /// Flushes queued frames and closes the link.
    pub fn close(&mut self) {
        log::debug!("[{}] closing", self.id());
        self.sender.close();
        self.reader.abort();
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.sender.close();
        self.reader.abort();
    }
}

async fn writer_loop<W>(
    id: LinkId,
    mut stream: W,
    mut rx: mpsc::UnboundedReceiver<WriterCmd>,
    capture: Option<Arc<dyn CaptureSink>>,
) where
    W: AsyncWrite + Unpin,
{
    while let Some(cmd) = rx.recv().await {
        let bytes = match cmd {
            WriterCmd::Frame(bytes) => bytes,
            WriterCmd::Close => break,
        };
        if let Some(sink) = &capture {
            sink.record(FlitRecord {
                timestamp: SystemTime::now(),
                link: id,
                direction: Direction::Tx,
                bytes: bytes.clone(),
            });
        }
        let frame = encode_frame(&bytes);
        if let Err(e) = stream.write_all(&frame).await {
            log::warn!("[{}] write failed: {}", id, e);
            break;
        }
        if let Err(e) = stream.flush().await {
            log::warn!("[{}] flush failed: {}", id, e);
            break;
        }
    }
    let _ = stream.shutdown().await;
    log::debug!("[{}] writer done", id);
}

async fn read_frame<R>(stream: &mut R, max_frame: usize) -> Result<Option<Bytes>, TransportError>
where
    R: AsyncRead + Unpin,
{
    let mut prefix = [0u8; FRAME_LEN_PREFIX];
    match stream.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let length = decode_frame_len(prefix, max_frame)?;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

async fn reader_loop<R>(
    id: LinkId,
    mut stream: R,
    max_frame: usize,
    events: mpsc::UnboundedSender<LinkEvent>,
    writer: mpsc::UnboundedSender<WriterCmd>,
    capture: Option<Arc<dyn CaptureSink>>,
) where
    R: AsyncRead + Unpin,
{
    let reason = loop {
        match read_frame(&mut stream, max_frame).await {
            Ok(Some(bytes)) => {
                if let Some(sink) = &capture {
                    sink.record(FlitRecord {
                        timestamp: SystemTime::now(),
                        link: id,
                        direction: Direction::Rx,
                        bytes: bytes.clone(),
                    });
                }
                if events.send(LinkEvent::Frame(bytes)).is_err() {
                    break None;
                }
            }
            Ok(None) => break None,
            Err(e) => {
                log::warn!("[{}] closing: {}", id, e);
                break Some(e);
            }
        }
    };
    let _ = writer.send(WriterCmd::Close);
    let _ = events.send(LinkEvent::Closed(reason));
    log::debug!("[{}] reader done", id);
}

/// Dials `peer` over TCP.
///
/// Fails with `ConnectionError` if the peer does not accept within
/// `timeout`.
pub async fn connect(
    peer: &str,
    timeout: Duration,
    max_frame: usize,
    capture: Option<Arc<dyn CaptureSink>>,
) -> Result<Link, TransportError> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(peer)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            return Err(TransportError::ConnectionError {
                peer: peer.to_string(),
                reason: e.to_string(),
            })
        }
        Err(_) => {
            return Err(TransportError::ConnectionError {
                peer: peer.to_string(),
                reason: format!("no answer within {timeout:?}"),
            })
        }
    };
    stream.set_nodelay(true)?;
    Ok(Link::from_stream(stream, peer.to_string(), max_frame, capture))
}

/// Accepts TCP links.
pub struct LinkListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl LinkListener {
    /// Binds a listener; port 0 picks an ephemeral port.
    pub async fn bind(addr: &str) -> Result<Self, TransportError> {
        let inner = TcpListener::bind(addr).await?;
        let local_addr = inner.local_addr()?;
        log::info!("[transport] listening on {}", local_addr);
        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Waits for the next connection.
    pub async fn accept(
        &self,
        max_frame: usize,
        capture: Option<Arc<dyn CaptureSink>>,
    ) -> Result<Link, TransportError> {
        let (stream, peer) = self.inner.accept().await?;
        stream.set_nodelay(true)?;
        Ok(Link::from_stream(stream, peer.to_string(), max_frame, capture))
    }
}
