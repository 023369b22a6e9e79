//! Reconnecting sync client.
//!
//! Runs as a background task: connect, handshake, re-join channels, pump
//! frames; on any failure fall back to a capped exponential backoff
//! (2s → 4s → 8s … max 60s, plus jitter) and try again. Callers interact
//! through an outbound command sender, an inbound event receiver, and a
//! watchable connection state.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use rand::Rng;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

use super::envelope::{Envelope, Message};
use crate::auth::AuthStatus;
use crate::config::SyncConfig;

const JOIN_RETRIES: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Connected,
    Error,
}

#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub url: String,
    pub api_key: String,
    pub client_id: String,
    /// Channels re-joined after every (re)connect.
    pub channels: Vec<String>,
    pub connect_timeout: Duration,
    /// How long to wait for a `subscription_success` ack before re-sending
    /// the join.
    pub ack_timeout: Duration,
}

impl ClientConfig {
    /// Build a client config from the shared `[sync]` tuning section.
    pub fn from_sync(
        url: &str,
        api_key: &str,
        client_id: &str,
        channels: Vec<String>,
        sync: &SyncConfig,
    ) -> Self {
        Self {
            url: url.to_string(),
            api_key: api_key.to_string(),
            client_id: client_id.to_string(),
            channels,
            connect_timeout: Duration::from_secs(sync.connect_timeout_secs),
            ack_timeout: Duration::from_secs(sync.ack_timeout_secs),
        }
    }
}

pub struct SyncClient {
    pub commands: mpsc::Sender<Message>,
    pub events: mpsc::Receiver<Envelope>,
    pub state: watch::Receiver<ClientState>,
}

/// Spawn the client loop. The task runs until the command sender and event
/// receiver are both dropped.
pub fn spawn(config: ClientConfig) -> SyncClient {
    let (command_tx, command_rx) = mpsc::channel(64);
    let (event_tx, event_rx) = mpsc::channel(256);
    let (state_tx, state_rx) = watch::channel(ClientState::Connecting);
    tokio::spawn(client_loop(config, command_rx, event_tx, state_tx));
    SyncClient {
        commands: command_tx,
        events: event_rx,
        state: state_rx,
    }
}

async fn client_loop(
    config: ClientConfig,
    mut commands: mpsc::Receiver<Message>,
    events: mpsc::Sender<Envelope>,
    state: watch::Sender<ClientState>,
) {
    let mut backoff_secs: u64 = 2;

    loop {
        let _ = state.send(ClientState::Connecting);
        info!(url = %config.url, "sync client: connecting");

        let connected =
            tokio::time::timeout(config.connect_timeout, connect_async(&config.url)).await;
        match connected {
            Ok(Ok((ws, _))) => {
                let (mut sink, mut stream) = ws.split();

                match establish(&config, &mut sink, &mut stream, &events).await {
                    Ok(()) => {
                        backoff_secs = 2;
                        let _ = state.send(ClientState::Connected);
                        info!("sync client: connected");
                        run_session(&config, &mut sink, &mut stream, &mut commands, &events)
                            .await;
                        warn!("sync client: session ended");
                    }
                    Err(e) => warn!("sync client: handshake failed: {e:#}"),
                }
            }
            Ok(Err(e)) => warn!("sync client: connection failed: {e:#}"),
            Err(_) => warn!(
                timeout_secs = config.connect_timeout.as_secs(),
                "sync client: connection timed out"
            ),
        }

        let _ = state.send(ClientState::Error);
        if events.is_closed() && commands.is_closed() {
            debug!("sync client: both handles dropped, exiting");
            return;
        }
        sleep_backoff(&mut backoff_secs).await;
    }
}

/// Handshake then re-join every configured channel, each join acknowledged
/// within the ack timeout or re-sent.
async fn establish<Si, St>(
    config: &ClientConfig,
    sink: &mut Si,
    stream: &mut St,
    events: &mpsc::Sender<Envelope>,
) -> anyhow::Result<()>
where
    Si: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    St: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let connect = Envelope::new(
        Message::Connect {
            api_key: config.api_key.clone(),
        },
        &config.client_id,
    );
    sink.send(tungstenite::Message::Text(connect.to_json()))
        .await?;

    // Expect auth_status (authenticated) and connection_success, in order.
    let mut authenticated = false;
    loop {
        let envelope = next_envelope(stream, config.connect_timeout).await?;
        match &envelope.message {
            Message::AuthStatus { status } => {
                if status != AuthStatus::Authenticated.as_str() {
                    anyhow::bail!("authentication rejected: {status}");
                }
                authenticated = true;
            }
            Message::ConnectionSuccess { resync, .. } => {
                if !authenticated {
                    anyhow::bail!("connection_success before auth_status");
                }
                if *resync {
                    info!("sync client: server is replaying full snapshots");
                }
                break;
            }
            Message::Error(payload) => anyhow::bail!("server rejected connect: {}", payload.message),
            _ => {
                // Early broadcast; deliver it rather than dropping.
                let _ = events.send(envelope).await;
            }
        }
    }

    for channel in &config.channels {
        join_with_ack(config, sink, stream, events, channel).await?;
    }
    Ok(())
}

/// Send `join_channel` and wait for its `subscription_success`, re-sending
/// on ack timeout up to the retry limit.
async fn join_with_ack<Si, St>(
    config: &ClientConfig,
    sink: &mut Si,
    stream: &mut St,
    events: &mpsc::Sender<Envelope>,
    channel: &str,
) -> anyhow::Result<()>
where
    Si: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    St: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    for attempt in 1..=JOIN_RETRIES {
        let join = Envelope::new(
            Message::JoinChannel {
                channel: channel.to_string(),
            },
            &config.client_id,
        );
        sink.send(tungstenite::Message::Text(join.to_json())).await?;

        let deadline = tokio::time::Instant::now() + config.ack_timeout;
        loop {
            let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
            if remaining.is_zero() {
                warn!(channel = %channel, attempt, "sync client: join ack timed out");
                break;
            }
            match next_envelope(stream, remaining).await {
                Ok(envelope) => match &envelope.message {
                    Message::SubscriptionSuccess { channel: acked } if acked == channel => {
                        debug!(channel = %channel, "sync client: joined");
                        return Ok(());
                    }
                    Message::Error(payload) => {
                        anyhow::bail!("join {channel} rejected: {}", payload.message)
                    }
                    _ => {
                        let _ = events.send(envelope).await;
                    }
                },
                Err(_) => break,
            }
        }
    }
    anyhow::bail!("no subscription ack for {channel} after {JOIN_RETRIES} attempts")
}

async fn run_session<Si, St>(
    config: &ClientConfig,
    sink: &mut Si,
    stream: &mut St,
    commands: &mut mpsc::Receiver<Message>,
    events: &mpsc::Sender<Envelope>,
) where
    Si: SinkExt<tungstenite::Message, Error = tungstenite::Error> + Unpin,
    St: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match Envelope::parse(&text) {
                            Ok(envelope) => {
                                if events.send(envelope).await.is_err() {
                                    return;
                                }
                            }
                            Err(e) => debug!(err = %e, "sync client: dropping unparseable frame"),
                        }
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => return,
                    Some(Err(e)) => {
                        warn!(err = %e, "sync client: ws error");
                        return;
                    }
                    _ => {}
                }
            }
            cmd = commands.recv() => {
                let Some(message) = cmd else { return };
                let frame = Envelope::new(message, &config.client_id).to_json();
                if let Err(e) = sink.send(tungstenite::Message::Text(frame)).await {
                    warn!(err = %e, "sync client: send error");
                    return;
                }
            }
        }
    }
}

async fn next_envelope<St>(stream: &mut St, timeout: Duration) -> anyhow::Result<Envelope>
where
    St: StreamExt<Item = Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = tokio::time::timeout(remaining, stream.next())
            .await
            .map_err(|_| anyhow::anyhow!("timed out waiting for server frame"))?;
        match frame {
            Some(Ok(tungstenite::Message::Text(text))) => return Ok(Envelope::parse(&text)?),
            Some(Ok(tungstenite::Message::Close(_))) | None => {
                anyhow::bail!("connection closed by server")
            }
            Some(Err(e)) => return Err(e.into()),
            // Ping/pong and binary frames are not protocol messages.
            _ => continue,
        }
    }
}

async fn sleep_backoff(backoff_secs: &mut u64) {
    let jitter_ms = rand::thread_rng().gen_range(0..500);
    info!("sync client: reconnecting in {}s", *backoff_secs);
    tokio::time::sleep(Duration::from_secs(*backoff_secs) + Duration::from_millis(jitter_ms)).await;
    *backoff_secs = (*backoff_secs * 2).min(60);
}
