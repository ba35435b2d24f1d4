//! Wire protocol and transport.
//!
//! Every message on the wire is a fixed 8-byte header followed by the payload:
//!
//! ```text
//! u32 message_type   (little-endian)
//! u32 payload_length (little-endian, <= max message size)
//! [u8; payload_length]
//! ```
//!
//! Framing is transport-agnostic: anything that yields an ordered byte stream
//! can carry it. Datagram transports would lose ordering across frames and
//! are not provided.

use async_trait::async_trait;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tracing::debug;

/// Default cap on payload size (1 MiB)
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Size of the fixed frame header
pub const HEADER_LEN: usize = 8;

/// Size of the request id that leads every request and response payload
pub const REQUEST_ID_LEN: usize = 8;

/// Transport protocol a node speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommProtocol {
    Tcp,
    Udp,
    Rdma,
    Mpi,
    WebSocket,
}

impl CommProtocol {
    pub fn code(self) -> u32 {
        match self {
            CommProtocol::Tcp => 0,
            CommProtocol::Udp => 1,
            CommProtocol::Rdma => 2,
            CommProtocol::Mpi => 3,
            CommProtocol::WebSocket => 4,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(CommProtocol::Tcp),
            1 => Some(CommProtocol::Udp),
            2 => Some(CommProtocol::Rdma),
            3 => Some(CommProtocol::Mpi),
            4 => Some(CommProtocol::WebSocket),
            _ => None,
        }
    }
}

/// Types of messages exchanged between nodes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MessageType {
    Heartbeat,
    TaskRequest,
    TaskResponse,
    NodeJoin,
    NodeLeave,
    LoadReport,
    ModelSync,
    GradientUpdate,
    BarrierSync,
    ErrorReport,
}

impl MessageType {
    pub fn code(self) -> u32 {
        match self {
            MessageType::Heartbeat => 0,
            MessageType::TaskRequest => 1,
            MessageType::TaskResponse => 2,
            MessageType::NodeJoin => 3,
            MessageType::NodeLeave => 4,
            MessageType::LoadReport => 5,
            MessageType::ModelSync => 6,
            MessageType::GradientUpdate => 7,
            MessageType::BarrierSync => 8,
            MessageType::ErrorReport => 9,
        }
    }
}

impl TryFrom<u32> for MessageType {
    type Error = CommunicationError;

    fn try_from(code: u32) -> Result<Self, Self::Error> {
        Ok(match code {
            0 => MessageType::Heartbeat,
            1 => MessageType::TaskRequest,
            2 => MessageType::TaskResponse,
            3 => MessageType::NodeJoin,
            4 => MessageType::NodeLeave,
            5 => MessageType::LoadReport,
            6 => MessageType::ModelSync,
            7 => MessageType::GradientUpdate,
            8 => MessageType::BarrierSync,
            9 => MessageType::ErrorReport,
            other => return Err(CommunicationError::UnknownMessageType(other)),
        })
    }
}

/// One decoded message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub msg_type: MessageType,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(msg_type: MessageType, payload: impl Into<Bytes>) -> Self {
        Self {
            msg_type,
            payload: payload.into(),
        }
    }

    /// Wire size including the header
    pub fn wire_len(&self) -> usize {
        HEADER_LEN + self.payload.len()
    }
}

/// Encodes and decodes frames against a payload size limit
#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_message_size: usize,
}

impl FrameCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }

    pub fn max_message_size(&self) -> usize {
        self.max_message_size
    }

    /// Encode a frame; oversized payloads are rejected up front
    pub fn encode(&self, msg_type: MessageType, payload: &[u8]) -> Result<BytesMut, CommunicationError> {
        if payload.len() > self.max_message_size {
            return Err(CommunicationError::MessageTooLarge {
                size: payload.len(),
                max: self.max_message_size,
            });
        }

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len());
        buf.put_u32_le(msg_type.code());
        buf.put_u32_le(payload.len() as u32);
        buf.put_slice(payload);
        Ok(buf)
    }

    /// Write one frame. Nothing is written if the payload is too large.
    pub async fn write_frame<W>(
        &self,
        writer: &mut W,
        msg_type: MessageType,
        payload: &[u8],
    ) -> Result<usize, CommunicationError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let buf = self.encode(msg_type, payload)?;
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(buf.len())
    }

    /// Read one frame whose payload must fit in `buffer_limit` bytes
    pub async fn read_frame<R>(&self, reader: &mut R, buffer_limit: usize) -> Result<Frame, CommunicationError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let mut header = [0u8; HEADER_LEN];
        match reader.read_exact(&mut header).await {
            Ok(_) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(CommunicationError::Closed)
            }
            Err(e) => return Err(e.into()),
        }

        let mut cursor = &header[..];
        let code = cursor.get_u32_le();
        let length = cursor.get_u32_le() as usize;

        let limit = buffer_limit.min(self.max_message_size);
        if length > limit {
            return Err(CommunicationError::BufferTooSmall {
                size: length,
                capacity: limit,
            });
        }

        let mut payload = vec![0u8; length];
        if length > 0 {
            reader.read_exact(&mut payload).await?;
        }

        // payload is consumed first so the stream stays aligned on the next header
        let msg_type = MessageType::try_from(code)?;
        Ok(Frame::new(msg_type, payload))
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

/// Prefix `body` with a little-endian request id
pub fn tag_payload(request_id: u64, body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(REQUEST_ID_LEN + body.len());
    buf.put_u64_le(request_id);
    buf.put_slice(body);
    buf.freeze()
}

/// Split a request or response payload into its id and body
pub fn split_request_id(payload: &Bytes) -> Result<(u64, Bytes), CommunicationError> {
    if payload.len() < REQUEST_ID_LEN {
        return Err(CommunicationError::Payload(format!(
            "{} byte payload is too short to carry a request id",
            payload.len()
        )));
    }
    let mut head = &payload[..REQUEST_ID_LEN];
    Ok((head.get_u64_le(), payload.slice(REQUEST_ID_LEN..)))
}

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An established, unframed byte stream to a peer
pub struct RawStream {
    pub reader: BoxedReader,
    pub writer: BoxedWriter,
    pub peer: String,
}

impl RawStream {
    /// Wrap any bidirectional stream
    pub fn from_stream<S>(stream: S, peer: impl Into<String>) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        Self {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.into(),
        }
    }
}

/// Accepts inbound streams
#[async_trait]
pub trait Acceptor: Send + Sync {
    async fn accept(&self) -> Result<RawStream, CommunicationError>;

    fn local_addr(&self) -> Result<SocketAddr, CommunicationError>;
}

/// Trait for transports that carry framed messages between nodes
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to `addr`, giving up after `timeout`
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<RawStream, CommunicationError>;

    /// Bind a listener on `addr`
    async fn listen(&self, addr: &str) -> Result<Box<dyn Acceptor>, CommunicationError>;
}

/// TCP transport over tokio sockets
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpTransport;

struct TcpAcceptor {
    listener: TcpListener,
}

#[async_trait]
impl Acceptor for TcpAcceptor {
    async fn accept(&self) -> Result<RawStream, CommunicationError> {
        let (stream, peer) = self.listener.accept().await?;
        stream.set_nodelay(true)?;
        let (reader, writer) = stream.into_split();
        Ok(RawStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer: peer.to_string(),
        })
    }

    fn local_addr(&self) -> Result<SocketAddr, CommunicationError> {
        Ok(self.listener.local_addr()?)
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn dial(&self, addr: &str, timeout: Duration) -> Result<RawStream, CommunicationError> {
        let stream = tokio::time::timeout(timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| CommunicationError::Timeout(timeout))??;
        stream.set_nodelay(true)?;
        let peer = stream.peer_addr()?.to_string();
        let (reader, writer) = stream.into_split();
        Ok(RawStream {
            reader: Box::new(reader),
            writer: Box::new(writer),
            peer,
        })
    }

    async fn listen(&self, addr: &str) -> Result<Box<dyn Acceptor>, CommunicationError> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Box::new(TcpAcceptor { listener }))
    }
}

/// Pick the transport implementation for a protocol
pub fn transport_for(protocol: CommProtocol) -> Result<Box<dyn Transport>, CommunicationError> {
    match protocol {
        CommProtocol::Tcp => Ok(Box::new(TcpTransport)),
        other => Err(CommunicationError::Unsupported(other)),
    }
}

/// A framed link to one peer.
///
/// Sends are serialized through the writer lock. Requests carry an id at the
/// front of their payload and the peer echoes it back; any number may be in
/// flight. Responses are handed over by whichever task is reading the
/// connection via [`Connection::deliver_response`].
pub struct Connection {
    peer: String,
    codec: FrameCodec,
    writer: tokio::sync::Mutex<BoxedWriter>,
    reader: tokio::sync::Mutex<BoxedReader>,
    pending: parking_lot::Mutex<HashMap<u64, oneshot::Sender<Frame>>>,
    closed: AtomicBool,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl Connection {
    pub fn new(stream: RawStream, codec: FrameCodec) -> Self {
        Self {
            peer: stream.peer,
            codec,
            writer: tokio::sync::Mutex::new(stream.writer),
            reader: tokio::sync::Mutex::new(stream.reader),
            pending: parking_lot::Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Requests still waiting for a response
    pub fn in_flight(&self) -> usize {
        self.pending.lock().len()
    }

    /// Send one message
    pub async fn send(&self, msg_type: MessageType, payload: &[u8]) -> Result<(), CommunicationError> {
        if self.is_closed() {
            return Err(CommunicationError::Closed);
        }
        let mut writer = self.writer.lock().await;
        let written = self.codec.write_frame(&mut *writer, msg_type, payload).await?;
        self.bytes_sent.fetch_add(written as u64, Ordering::Relaxed);
        debug!(peer = %self.peer, ?msg_type, bytes = written, "Sent frame");
        Ok(())
    }

    /// Receive the next message; its payload must fit in `buffer_limit`
    pub async fn receive(&self, buffer_limit: usize) -> Result<Frame, CommunicationError> {
        if self.is_closed() {
            return Err(CommunicationError::Closed);
        }
        let mut reader = self.reader.lock().await;
        let frame = self.codec.read_frame(&mut *reader, buffer_limit).await?;
        self.bytes_received
            .fetch_add(frame.wire_len() as u64, Ordering::Relaxed);
        Ok(frame)
    }

    /// Receive with a deadline
    pub async fn receive_timeout(
        &self,
        buffer_limit: usize,
        timeout: Duration,
    ) -> Result<Frame, CommunicationError> {
        tokio::time::timeout(timeout, self.receive(buffer_limit))
            .await
            .map_err(|_| CommunicationError::Timeout(timeout))?
    }

    /// Send a request tagged with `request_id` and wait for the matching
    /// response. `timeout` covers the send as well as the wait.
    ///
    /// The returned frame's payload has the id stripped.
    pub async fn request(
        &self,
        msg_type: MessageType,
        request_id: u64,
        body: &[u8],
        timeout: Duration,
    ) -> Result<Frame, CommunicationError> {
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock();
            if pending.contains_key(&request_id) {
                return Err(CommunicationError::Payload(format!(
                    "request {} is already in flight",
                    request_id
                )));
            }
            pending.insert(request_id, tx);
        }

        let payload = tag_payload(request_id, body);
        let exchange = async {
            self.send(msg_type, &payload).await?;
            rx.await.map_err(|_| CommunicationError::Closed)
        };

        let outcome = match tokio::time::timeout(timeout, exchange).await {
            Ok(outcome) => outcome,
            Err(_) => Err(CommunicationError::Timeout(timeout)),
        };
        if outcome.is_err() {
            self.pending.lock().remove(&request_id);
        }
        outcome
    }

    /// Hand a response frame to the request whose id it carries. Returns
    /// false if nobody is waiting for it.
    pub fn deliver_response(&self, frame: Frame) -> bool {
        let (request_id, body) = match split_request_id(&frame.payload) {
            Ok(parts) => parts,
            Err(e) => {
                debug!(peer = %self.peer, error = %e, "Dropping response without a request id");
                return false;
            }
        };

        let Some(tx) = self.pending.lock().remove(&request_id) else {
            debug!(peer = %self.peer, request_id, "Dropping response with no waiting request");
            return false;
        };
        tx.send(Frame::new(frame.msg_type, body)).is_ok()
    }

    /// Close the connection. Only the first call has any effect.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        // dropping the senders wakes waiting requests with `Closed`
        self.pending.lock().clear();
        let mut writer = self.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!(peer = %self.peer, error = %e, "Error while shutting down connection");
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("peer", &self.peer)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CommunicationError {
    #[error("Message of {size} bytes exceeds the {max} byte limit")]
    MessageTooLarge { size: usize, max: usize },
    #[error("Incoming message of {size} bytes does not fit in a {capacity} byte buffer")]
    BufferTooSmall { size: usize, capacity: usize },
    #[error("Unknown message type {0}")]
    UnknownMessageType(u32),
    #[error("Malformed payload: {0}")]
    Payload(String),
    #[error("Connection closed")]
    Closed,
    #[error("Timed out after {0:?}")]
    Timeout(Duration),
    #[error("Protocol {0:?} is not supported by this build")]
    Unsupported(CommProtocol),
    #[error("Network error: {0}")]
    Io(#[from] std::io::Error),
}
