use std::{future::Future, net::SocketAddr, time::Duration};

use anyhow::Result;
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::{TcpListener, TcpStream},
    select,
    task::JoinSet,
    time::timeout,
};
use tracing::{debug, info, warn};

use crate::{
    codec::{FrameDecoder, Message},
    registry::SessionRegistry,
    session::{MessageHandler, Session, SessionError, SessionId},
};

pub const DEFAULT_MAX_FRAME_LEN: usize = 1024 * 1024;

/// Upper bound on waiting for closed sessions to finish on shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Upper bound on a buffered partial frame. `None` accepts any size.
    pub max_frame_len: Option<usize>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_frame_len: Some(DEFAULT_MAX_FRAME_LEN),
        }
    }
}

impl ServerConfig {
    fn decoder(&self) -> FrameDecoder {
        match self.max_frame_len {
            Some(limit) => FrameDecoder::with_limit(limit),
            None => FrameDecoder::new(),
        }
    }
}

pub struct Server {
    listener: TcpListener,
    registry: SessionRegistry,
    config: ServerConfig,
}

impl Server {
    pub fn new(listener: TcpListener) -> Self {
        Self::with_config(listener, ServerConfig::default())
    }

    pub fn with_config(listener: TcpListener, config: ServerConfig) -> Self {
        Self {
            listener,
            registry: SessionRegistry::new(),
            config,
        }
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Shared view of the connected sessions.
    pub fn registry(&self) -> SessionRegistry {
        self.registry.clone()
    }

    pub async fn run_until<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send,
    {
        let Server {
            listener,
            registry,
            config,
        } = self;
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            select! {
                _ = &mut shutdown => {
                    handle_shutdown(&registry);
                    break;
                }
                accept_result = listener.accept() => {
                    handle_accept_result(accept_result, &registry, &config, &mut connections);
                }
                Some(joined) = connections.join_next(), if !connections.is_empty() => {
                    log_join_failure(joined);
                }
            }
        }

        drain_connections(connections).await;
        Ok(())
    }

    pub async fn run_until_ctrl_c(self) -> Result<()> {
        self.run_until(async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                warn!(error = ?err, "failed to install ctrl-c handler");
            }
        })
        .await
    }
}

fn handle_shutdown(registry: &SessionRegistry) {
    let closing = registry.close_all();
    info!(sessions = closing, "server shutting down");
}

/// Waits for closed sessions to flush and unregister, up to [`DRAIN_TIMEOUT`].
/// Sessions still running after that are aborted when the set drops.
async fn drain_connections(mut connections: JoinSet<()>) {
    let draining = async {
        while let Some(joined) = connections.join_next().await {
            log_join_failure(joined);
        }
    };
    if timeout(DRAIN_TIMEOUT, draining).await.is_err() {
        warn!(
            remaining = connections.len(),
            "sessions did not finish before shutdown timeout"
        );
    }
}

fn log_join_failure(joined: Result<(), tokio::task::JoinError>) {
    if let Err(err) = joined {
        warn!(error = %err, "connection task failed");
    }
}

fn handle_accept_result(
    result: std::io::Result<(TcpStream, SocketAddr)>,
    registry: &SessionRegistry,
    config: &ServerConfig,
    connections: &mut JoinSet<()>,
) {
    match result {
        Ok((stream, peer)) => spawn_connection_handler(stream, peer, registry, config, connections),
        Err(err) => warn!(error = ?err, "failed to accept connection"),
    }
}

fn spawn_connection_handler(
    stream: TcpStream,
    peer: SocketAddr,
    registry: &SessionRegistry,
    config: &ServerConfig,
    connections: &mut JoinSet<()>,
) {
    let registry = registry.clone();
    let config = config.clone();
    connections.spawn(async move {
        if let Err(err) = serve_connection(stream, Some(peer), registry, &config).await {
            warn!(peer = %peer, error = %err, "client connection closed with error");
        }
    });
}

/// Relays every message arriving on the owning session to all other sessions.
struct Fanout {
    registry: SessionRegistry,
    origin: SessionId,
}

impl MessageHandler for Fanout {
    fn on_message(&mut self, message: Message) {
        let report = self.registry.broadcast_except(self.origin, &message);
        debug!(
            session = %self.origin,
            delivered = report.delivered,
            failed = report.failed,
            "broadcast message"
        );
    }
}

/// Runs one accepted connection from registration to teardown.
///
/// The session is registered before its first read and unregistered on every
/// exit path, including decode and transport errors.
pub async fn serve_connection<S>(
    stream: S,
    peer: Option<SocketAddr>,
    registry: SessionRegistry,
    config: &ServerConfig,
) -> Result<(), SessionError>
where
    S: AsyncRead + AsyncWrite,
{
    let session = Session::open(peer, config.decoder(), |handle| Fanout {
        registry: registry.clone(),
        origin: handle.id(),
    });
    let handle = session.handle().clone();

    registry.register(handle.clone());
    info!(session = %handle.id(), ?peer, "client connected");

    let result = session.run(stream).await;

    registry.unregister(handle.id());
    info!(
        session = %handle.id(),
        ?peer,
        received = handle.received(),
        sent = handle.sent(),
        "client disconnected"
    );

    result
}
