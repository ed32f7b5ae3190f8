use std::{
    fmt,
    io::{self, BufRead, Write},
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use anyhow::Result;
use futures::future::{FutureExt, Shared};
use thiserror::Error;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
    select,
    sync::{mpsc, oneshot},
};
use tracing::{debug, info, warn};

use crate::{
    cli::ClientArgs,
    codec::{FrameDecoder, Message},
    session::{MessageHandler, Session, SessionHandle, TransportError},
};

/// Consumer of messages relayed from the server.
pub trait DisplaySink: Send + 'static {
    fn display(&mut self, sender: &str, body: &str);
}

/// Prints `sender: body` lines to stdout.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdoutSink;

impl DisplaySink for StdoutSink {
    fn display(&mut self, sender: &str, body: &str) {
        let mut stdout = io::stdout().lock();
        if let Err(error) = writeln!(stdout, "{sender}: {body}").and_then(|()| stdout.flush()) {
            warn!(?error, "failed to write message to stdout");
        }
    }
}

impl DisplaySink for mpsc::UnboundedSender<Message> {
    fn display(&mut self, sender: &str, body: &str) {
        let _ = self.send(Message::new(sender, body));
    }
}

struct SinkHandler<S>(S);

impl<S: DisplaySink> MessageHandler for SinkHandler<S> {
    fn on_message(&mut self, message: Message) {
        self.0.display(&message.sender, &message.body);
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The connection ended without error, from either side.
    Closed,
    /// The connection failed.
    Lost(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "connection closed"),
            DisconnectReason::Lost(reason) => write!(f, "connection lost: {reason}"),
        }
    }
}

/// Fulfils the disconnect signal at most once, whichever teardown path gets
/// there first.
#[derive(Debug, Clone)]
pub struct DisconnectNotifier {
    slot: Arc<Mutex<Option<oneshot::Sender<DisconnectReason>>>>,
}

impl DisconnectNotifier {
    pub fn channel() -> (Self, oneshot::Receiver<DisconnectReason>) {
        let (tx, rx) = oneshot::channel();
        let notifier = Self {
            slot: Arc::new(Mutex::new(Some(tx))),
        };
        (notifier, rx)
    }

    /// Returns `true` only for the call that actually delivered the reason.
    pub fn notify(&self, reason: DisconnectReason) -> bool {
        let sender = self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        match sender {
            Some(sender) => {
                // The receiver may already be gone; the signal still counts as fired.
                let _ = sender.send(reason);
                true
            }
            None => false,
        }
    }
}

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: SocketAddr },
    #[error("failed to connect to {addr}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },
}

/// A participant's single connection to the server.
pub struct RelayClient {
    handle: SessionHandle,
    disconnected: Shared<oneshot::Receiver<DisconnectReason>>,
}

impl RelayClient {
    pub async fn connect<S>(addr: SocketAddr, sink: S) -> Result<Self, ClientError>
    where
        S: DisplaySink,
    {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| match source.kind() {
                io::ErrorKind::ConnectionRefused => ClientError::ConnectionRefused { addr },
                _ => ClientError::Connect { addr, source },
            })?;

        info!("connected to {}", addr);
        Ok(Self::start(stream, Some(addr), sink))
    }

    /// Starts relaying over an already established stream.
    pub fn start<T, S>(stream: T, peer: Option<SocketAddr>, sink: S) -> Self
    where
        T: AsyncRead + AsyncWrite + Send + 'static,
        S: DisplaySink,
    {
        let session = Session::open(peer, FrameDecoder::new(), |_| SinkHandler(sink));
        let handle = session.handle().clone();
        let (notifier, disconnected) = DisconnectNotifier::channel();

        tokio::spawn(async move {
            let reason = match session.run(stream).await {
                Ok(()) => DisconnectReason::Closed,
                Err(err) => DisconnectReason::Lost(err.to_string()),
            };
            debug!(%reason, "relay session ended");
            notifier.notify(reason);
        });

        Self {
            handle,
            disconnected: disconnected.shared(),
        }
    }

    pub fn send_message(&self, identifier: &str, text: &str) -> Result<(), TransportError> {
        self.handle.send(identifier, text)
    }

    pub fn close(&self) {
        self.handle.close();
    }

    pub fn handle(&self) -> &SessionHandle {
        &self.handle
    }

    /// Resolves once the connection to the server is gone.
    pub async fn disconnected(&self) -> DisconnectReason {
        self.disconnected
            .clone()
            .await
            .unwrap_or(DisconnectReason::Closed)
    }
}

impl Drop for RelayClient {
    fn drop(&mut self) {
        self.handle.close();
    }
}

/// Sends each incoming line as one message, then closes the connection once
/// the line source is exhausted. Returns the number of lines sent.
pub async fn pipe_lines(
    mut lines: mpsc::Receiver<String>,
    client: &RelayClient,
    identifier: &str,
) -> Result<usize> {
    let mut sent = 0;
    let result = loop {
        match lines.recv().await {
            Some(line) => {
                if let Err(err) = client.send_message(identifier, &line) {
                    break Err(err.into());
                }
                sent += 1;
            }
            None => break Ok(sent),
        }
    };

    client.close();
    result
}

/// Pipes lines until the input ends or the connection drops, and returns why
/// the connection ended. A send that races the connection going away yields
/// the disconnect reason rather than an error.
pub async fn relay_lines(
    lines: mpsc::Receiver<String>,
    client: &RelayClient,
    identifier: &str,
) -> DisconnectReason {
    select! {
        piped = pipe_lines(lines, client, identifier) => {
            match piped {
                Ok(sent) => debug!(sent, "input closed"),
                Err(error) => debug!(%error, "input bridge stopped"),
            }
            client.disconnected().await
        }
        reason = client.disconnected() => reason,
    }
}

/// Reads stdin on a dedicated thread so a blocked read never holds up exit.
/// Bytes that are not valid UTF-8 are replaced rather than ending the input.
pub fn spawn_stdin_lines() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(64);
    std::thread::spawn(move || {
        let mut stdin = io::stdin().lock();
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match stdin.read_until(b'\n', &mut raw) {
                Ok(0) => break,
                Ok(_) => {}
                Err(error) => {
                    warn!(%error, "failed to read stdin");
                    break;
                }
            }
            if tx.blocking_send(decode_line(&raw)).is_err() {
                break;
            }
        }
    });
    rx
}

fn decode_line(raw: &[u8]) -> String {
    let line = raw.strip_suffix(b"\n").unwrap_or(raw);
    let line = line.strip_suffix(b"\r").unwrap_or(line);
    String::from_utf8_lossy(line).into_owned()
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let client = match RelayClient::connect(args.server, StdoutSink).await {
        Ok(client) => client,
        Err(ClientError::ConnectionRefused { addr }) => {
            println!("Can't connect; is the server alive?");
            println!("  tried {addr}");
            return Ok(());
        }
        Err(err) => return Err(err.into()),
    };

    let lines = spawn_stdin_lines();

    select! {
        reason = relay_lines(lines, &client, &args.nick) => report_disconnect(reason),
        ctrl_c = tokio::signal::ctrl_c() => {
            if let Err(error) = ctrl_c {
                warn!(?error, "ctrl-c handler failed");
            }
            client.close();
        }
    }

    Ok(())
}

fn report_disconnect(reason: DisconnectReason) {
    println!("{reason}");
}
