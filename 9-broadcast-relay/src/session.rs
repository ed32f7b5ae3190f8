//! One live connection: inbound bytes become messages, outbound messages become frames.
//!
//! A [`Session`] is owned by the task driving its connection. Everything else
//! (the registry, a relay client's caller) talks to it through a cloneable
//! [`SessionHandle`], which queues frames for the session task to write and can
//! request shutdown.

use std::{
    fmt,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
};

use bytes::Bytes;
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    select,
    sync::mpsc,
    time::{Duration, sleep},
};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::codec::{self, DecodeError, FrameDecoder, Message};

const READ_CHUNK: usize = 4096;

/// How long a closing session keeps writing frames that were queued before
/// the close.
pub const SHUTDOWN_GRACE: Duration = Duration::from_millis(500);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    fn next() -> Self {
        Self(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Receives every message decoded from a session's inbound stream, in order.
pub trait MessageHandler: Send {
    fn on_message(&mut self, message: Message);
}

impl<F> MessageHandler for F
where
    F: FnMut(Message) + Send,
{
    fn on_message(&mut self, message: Message) {
        self(message)
    }
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("session is closed")]
    Closed,
    #[error("transport i/o failed: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

#[derive(Debug)]
struct Shared {
    id: SessionId,
    peer: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<Bytes>,
    shutdown: CancellationToken,
    sent: AtomicU64,
    received: AtomicU64,
}

/// Non-owning reference to a session, used for writes and membership checks.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn id(&self) -> SessionId {
        self.shared.id
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        self.shared.peer
    }

    /// Encodes one message and queues it for the transport.
    pub fn send(&self, sender: &str, body: &str) -> Result<(), TransportError> {
        self.send_frame(codec::encode(sender, body))
    }

    /// Queues an already encoded frame, so a broadcast encodes only once.
    pub fn send_frame(&self, frame: Bytes) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shared
            .outbound
            .send(frame)
            .map_err(|_| TransportError::Closed)?;
        self.shared.sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Requests transport shutdown. Calling it again has no effect.
    pub fn close(&self) {
        self.shared.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Resolves once the session has been closed from either side.
    pub async fn closed(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Frames queued to this session's transport.
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::Relaxed)
    }

    /// Messages decoded from this session's transport.
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::Relaxed)
    }
}

pub struct Session<H> {
    handle: SessionHandle,
    inbound: Inbound<H>,
    outbox: mpsc::UnboundedReceiver<Bytes>,
}

/// Decoder and handler: the read side of a session.
struct Inbound<H> {
    decoder: FrameDecoder,
    handler: H,
}

impl<H: MessageHandler> Inbound<H> {
    fn on_bytes(&mut self, handle: &SessionHandle, chunk: &[u8]) -> Result<usize, DecodeError> {
        let messages = self.decoder.decode_stream(chunk)?;
        let count = messages.len();
        for message in messages {
            handle.shared.received.fetch_add(1, Ordering::Relaxed);
            self.handler.on_message(message);
        }
        Ok(count)
    }

    async fn read_loop<R>(
        &mut self,
        handle: &SessionHandle,
        mut reader: R,
    ) -> Result<(), SessionError>
    where
        R: AsyncRead + Unpin,
    {
        let mut chunk = vec![0u8; READ_CHUNK];

        loop {
            select! {
                biased;
                _ = handle.closed() => return Ok(()),
                read = reader.read(&mut chunk) => {
                    let bytes = read.map_err(TransportError::Io)?;
                    if bytes == 0 {
                        return Ok(());
                    }
                    self.on_bytes(handle, &chunk[..bytes])?;
                }
            }
        }
    }
}

impl<H: MessageHandler> Session<H> {
    /// Creates a session whose handler may capture the session's own handle.
    pub fn open<F>(peer: Option<SocketAddr>, decoder: FrameDecoder, make_handler: F) -> Self
    where
        F: FnOnce(&SessionHandle) -> H,
    {
        let (outbound, outbox) = mpsc::unbounded_channel();
        let handle = SessionHandle {
            shared: Arc::new(Shared {
                id: SessionId::next(),
                peer,
                outbound,
                shutdown: CancellationToken::new(),
                sent: AtomicU64::new(0),
                received: AtomicU64::new(0),
            }),
        };
        let handler = make_handler(&handle);

        Self {
            handle,
            inbound: Inbound { decoder, handler },
            outbox,
        }
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    pub fn id(&self) -> SessionId {
        self.handle.id()
    }

    /// Feeds a chunk through the decoder and hands each complete message to
    /// the handler. Returns how many messages were handled.
    pub fn on_bytes(&mut self, chunk: &[u8]) -> Result<usize, DecodeError> {
        self.inbound.on_bytes(&self.handle, chunk)
    }

    pub fn send(&self, sender: &str, body: &str) -> Result<(), TransportError> {
        self.handle.send(sender, body)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    /// Drives the session over `stream` until the peer disconnects, an error
    /// occurs, or [`SessionHandle::close`] is called.
    ///
    /// Reads and writes proceed independently, so a peer that stops reading
    /// never stalls delivery of what it sends. Frames queued when the session
    /// closes get [`SHUTDOWN_GRACE`] to reach the transport.
    ///
    /// The session is marked closed before this returns, so later sends fail
    /// with [`TransportError::Closed`] instead of queueing into nothing.
    pub async fn run<S>(self, stream: S) -> Result<(), SessionError>
    where
        S: AsyncRead + AsyncWrite,
    {
        let Session {
            handle,
            mut inbound,
            outbox,
        } = self;
        let (reader, writer) = tokio::io::split(stream);

        let reading = async {
            let result = inbound.read_loop(&handle, reader).await;
            handle.close();
            result
        };
        let writing = async {
            let result = write_loop(&handle, outbox, writer).await;
            handle.close();
            result
        };
        let (read_result, write_result) = tokio::join!(reading, writing);

        read_result?;
        write_result?;
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn drain_outbox(&mut self) -> Vec<Bytes> {
        let mut frames = Vec::new();
        while let Ok(frame) = self.outbox.try_recv() {
            frames.push(frame);
        }
        frames
    }
}

/// Writes queued frames until the session closes, then flushes what is left
/// within [`SHUTDOWN_GRACE`] and shuts the write side down.
async fn write_loop<W>(
    handle: &SessionHandle,
    mut outbox: mpsc::UnboundedReceiver<Bytes>,
    mut writer: W,
) -> Result<(), TransportError>
where
    W: AsyncWrite + Unpin,
{
    let result = {
        let writing = async {
            loop {
                let frame = select! {
                    biased;
                    _ = handle.closed() => break,
                    frame = outbox.recv() => frame,
                };
                let Some(frame) = frame else {
                    break;
                };
                writer.write_all(&frame).await?;
            }

            while let Ok(frame) = outbox.try_recv() {
                writer.write_all(&frame).await?;
            }
            writer.flush().await
        };
        let grace = async {
            handle.closed().await;
            sleep(SHUTDOWN_GRACE).await;
        };

        select! {
            written = writing => written,
            _ = grace => {
                debug!(session = %handle.id(), "peer stopped reading; dropping queued frames");
                Ok(())
            }
        }
    };

    if let Err(error) = writer.shutdown().await {
        debug!(session = %handle.id(), ?error, "transport shutdown failed");
    }

    result.map_err(TransportError::Io)
}
