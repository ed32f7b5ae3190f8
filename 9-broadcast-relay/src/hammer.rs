//! Load generator: many relay clients sending as fast as the server accepts.

use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::{Duration, Instant},
};

use anyhow::{Context, Result};
use futures::future::try_join_all;
use tokio::time::sleep;
use tracing::info;

use crate::{
    cli::HammerArgs,
    client::{DisplaySink, RelayClient},
};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
pub struct HammerConfig {
    pub server: SocketAddr,
    pub clients: usize,
    pub messages: usize,
    /// Pause between connecting every client and the first send, so the server
    /// has registered everyone before traffic starts.
    pub warmup: Duration,
    /// How long a client keeps waiting for more traffic once it stops arriving.
    pub settle: Duration,
}

impl From<&HammerArgs> for HammerConfig {
    fn from(args: &HammerArgs) -> Self {
        Self {
            server: args.server,
            clients: args.clients,
            messages: args.messages,
            warmup: Duration::from_millis(args.warmup_ms),
            settle: Duration::from_millis(args.settle_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientTally {
    pub nick: String,
    pub sent: u64,
    pub received: u64,
}

#[derive(Debug, Clone, Default)]
pub struct HammerReport {
    pub tallies: Vec<ClientTally>,
}

impl HammerReport {
    pub fn total_sent(&self) -> u64 {
        self.tallies.iter().map(|tally| tally.sent).sum()
    }

    pub fn total_received(&self) -> u64 {
        self.tallies.iter().map(|tally| tally.received).sum()
    }
}

struct CountingSink(Arc<AtomicU64>);

impl DisplaySink for CountingSink {
    fn display(&mut self, _sender: &str, _body: &str) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }
}

struct HammerClient {
    nick: String,
    client: RelayClient,
    received: Arc<AtomicU64>,
}

pub async fn hammer(config: &HammerConfig) -> Result<HammerReport> {
    let mut clients = Vec::with_capacity(config.clients);
    for index in 0..config.clients {
        let received = Arc::new(AtomicU64::new(0));
        let client = RelayClient::connect(config.server, CountingSink(Arc::clone(&received)))
            .await
            .with_context(|| format!("hammer-{index} failed to connect"))?;
        clients.push(HammerClient {
            nick: format!("hammer-{index}"),
            client,
            received,
        });
    }
    info!(clients = clients.len(), "all hammer clients connected");
    sleep(config.warmup).await;

    let expected = (config.clients.saturating_sub(1) * config.messages) as u64;
    let tallies = try_join_all(
        clients
            .iter()
            .map(|client| drive_client(client, config.messages, expected, config.settle)),
    )
    .await?;

    Ok(HammerReport { tallies })
}

async fn drive_client(
    hammer: &HammerClient,
    messages: usize,
    expected: u64,
    settle: Duration,
) -> Result<ClientTally> {
    for number in 0..messages {
        hammer
            .client
            .send_message(&hammer.nick, &format!("msg num {number}"))
            .with_context(|| format!("{} lost its connection", hammer.nick))?;
        tokio::task::yield_now().await;
    }

    wait_for_traffic(&hammer.received, expected, settle).await;
    hammer.client.close();

    Ok(ClientTally {
        nick: hammer.nick.clone(),
        sent: hammer.client.handle().sent(),
        received: hammer.received.load(Ordering::Relaxed),
    })
}

/// Returns once `expected` messages have arrived or nothing new arrived for `settle`.
async fn wait_for_traffic(received: &AtomicU64, expected: u64, settle: Duration) {
    let mut last = received.load(Ordering::Relaxed);
    let mut idle_since = Instant::now();

    while last < expected {
        sleep(POLL_INTERVAL).await;
        let now = received.load(Ordering::Relaxed);
        if now != last {
            last = now;
            idle_since = Instant::now();
        } else if idle_since.elapsed() >= settle {
            break;
        }
    }
}

pub async fn run(args: HammerArgs) -> Result<()> {
    let config = HammerConfig::from(&args);
    println!("starting {} clients", config.clients);

    let report = hammer(&config).await?;
    for tally in &report.tallies {
        println!("{} sent {}", tally.nick, tally.sent);
        println!("{} recv {}", tally.nick, tally.received);
    }

    Ok(())
}
