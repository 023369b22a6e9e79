//! WebSocket sync server.
//!
//! One TCP accept loop, one task per connection. A connection is mute until
//! its `connect` handshake passes `AuthService::verify`; after that the
//! client can join channels, push task commands, and run searches. Committed
//! mutations arrive through the per-client outbox that the broadcaster
//! fills.

pub mod broadcaster;
pub mod client;
pub mod envelope;

use anyhow::Result;
use futures_util::{SinkExt, StreamExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::{accept_async, tungstenite};
use tracing::{debug, error, info, warn};

use crate::auth::AuthStatus;
use crate::error::{EngineError, EngineResult};
use crate::tasks::model::Task;
use crate::AppContext;
use broadcaster::Reconnect;
use envelope::{Envelope, Message, TaskCommand, TaskDelta, TaskUpdateData};

pub async fn run(ctx: Arc<AppContext>) -> Result<()> {
    let addr = format!("{}:{}", ctx.config.bind_address, ctx.config.port);
    let listener = TcpListener::bind(&addr).await?;
    serve(listener, ctx).await
}

/// Accept loop over an already-bound listener. Split out from `run` so tests
/// can bind port 0 and read the assigned address first.
pub async fn serve(listener: TcpListener, ctx: Arc<AppContext>) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(addr = %addr, "sync server listening");
    }

    // Commit stream: store → forwarder → broadcaster.
    let (commit_tx, commit_rx) = mpsc::unbounded_channel();
    ctx.store.set_commit_sink(commit_tx);
    ctx.broadcaster.clone().run_forwarder(commit_rx);

    // Graceful shutdown on SIGTERM (Unix) or Ctrl-C. Pinned so the select!
    // loop can poll it repeatedly.
    let shutdown = make_shutdown_future();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            biased;

            _ = &mut shutdown => {
                info!("shutdown signal received, stopping sync server");
                break;
            }

            conn = listener.accept() => {
                let (stream, peer) = match conn {
                    Ok(c) => c,
                    Err(e) => {
                        error!(err = %e, "accept error");
                        continue;
                    }
                };
                debug!(peer = %peer, "new connection");
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, ctx).await {
                        warn!(peer = %peer, err = %e, "connection error");
                    }
                });
            }
        }
    }

    info!("sync server stopped");
    Ok(())
}

/// Resolves when a shutdown signal arrives. SIGTERM and Ctrl-C on Unix,
/// Ctrl-C elsewhere.
async fn make_shutdown_future() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                warn!(err = %e, "failed to register SIGTERM, falling back to Ctrl-C only");
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
    }
}

async fn handle_connection(stream: tokio::net::TcpStream, ctx: Arc<AppContext>) -> Result<()> {
    let ws = accept_async(stream).await?;
    let (mut sink, mut stream) = ws.split();

    // ── Handshake ────────────────────────────────────────────────────────
    // The first frame must be `connect` with a valid api key. Until then
    // the connection receives only connection and error events.
    let connect_timeout = Duration::from_secs(ctx.config.sync.connect_timeout_secs);
    let first = tokio::time::timeout(connect_timeout, stream.next()).await;
    let text = match first {
        Ok(Some(Ok(tungstenite::Message::Text(t)))) => t,
        // Timeout, closed, or a non-text frame before the handshake.
        _ => return Ok(()),
    };

    let client_id = match parse_handshake(&text, &ctx).await {
        Ok(client_id) => {
            let frame = Envelope::new(
                Message::AuthStatus {
                    status: AuthStatus::Authenticated.as_str().to_string(),
                },
                &client_id,
            );
            sink.send(tungstenite::Message::Text(frame.to_json())).await?;
            client_id
        }
        Err(err) => {
            let frame = Envelope::new(Message::Error(err.to_payload()), "server");
            let _ = sink.send(tungstenite::Message::Text(frame.to_json())).await;
            let _ = sink.send(tungstenite::Message::Close(None)).await;
            return Ok(());
        }
    };
    debug!(client_id = %client_id, "client authenticated");

    // Outbox sized past the backlog so a reconnect replay never stalls
    // before this loop starts draining.
    let (out_tx, mut out_rx) = mpsc::channel(ctx.config.sync.buffer_limit + 16);
    let outcome = ctx.broadcaster.reconnect(&client_id, out_tx.clone()).await;
    let resync = outcome == Reconnect::Resync;

    let hello = Envelope::new(
        Message::ConnectionSuccess {
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            resync,
        },
        &client_id,
    );
    sink.send(tungstenite::Message::Text(hello.to_json())).await?;

    if resync {
        for frame in resync_frames(&ctx, &client_id).await {
            if out_tx.send(frame).await.is_err() {
                break;
            }
        }
    }

    // ── Session loop ─────────────────────────────────────────────────────
    let mut fault = false;
    loop {
        tokio::select! {
            msg = stream.next() => {
                match msg {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match handle_frame(&text, &client_id, &ctx, &out_tx).await {
                            Ok(Session::Continue) => {}
                            Ok(Session::Closed) => {
                                let _ = sink.send(tungstenite::Message::Close(None)).await;
                                return Ok(());
                            }
                            Err(e) => {
                                error!(client_id = %client_id, err = %e, "session fault");
                                fault = true;
                                break;
                            }
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        let _ = sink.send(tungstenite::Message::Pong(data)).await;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        warn!(client_id = %client_id, err = %e, "ws error");
                        break;
                    }
                    _ => {}
                }
            }
            frame = out_rx.recv() => {
                match frame {
                    Some(json) => {
                        if let Err(e) = sink.send(tungstenite::Message::Text(json)).await {
                            warn!(client_id = %client_id, err = %e, "send error");
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Transport gone without an explicit goodbye: keep the session buffering.
    ctx.broadcaster.detach(&client_id);
    if fault {
        let _ = sink
            .send(tungstenite::Message::Close(Some(CloseFrame {
                code: CloseCode::Error,
                reason: "internal error".into(),
            })))
            .await;
    }
    Ok(())
}

/// Gate and verify the opening `connect` frame, returning the client id.
async fn parse_handshake(text: &str, ctx: &AppContext) -> EngineResult<String> {
    let envelope = Envelope::parse(text)?;
    let Message::Connect { api_key } = &envelope.message else {
        return Err(EngineError::Auth {
            reason: "first message must be connect".to_string(),
        });
    };
    match ctx.auth.verify(api_key).await {
        AuthStatus::Authenticated => Ok(envelope.client_id),
        status => Err(EngineError::Auth {
            reason: format!("api key {}", status.as_str()),
        }),
    }
}

enum Session {
    Continue,
    Closed,
}

/// Dispatch one inbound frame. Engine errors go back to the client as
/// `error` envelopes; only transport-level problems escape as `Err`.
async fn handle_frame(
    text: &str,
    client_id: &str,
    ctx: &AppContext,
    out_tx: &mpsc::Sender<String>,
) -> Result<Session> {
    let reply = match dispatch(text, client_id, ctx).await {
        Ok(Dispatch::Reply(message)) => Some(message),
        Ok(Dispatch::Silent) => None,
        Ok(Dispatch::Goodbye) => {
            ctx.broadcaster.remove(client_id);
            info!(client_id = %client_id, "client disconnected");
            return Ok(Session::Closed);
        }
        Err(err) => {
            debug!(client_id = %client_id, code = err.code(), "request rejected");
            Some(Message::Error(err.to_payload()))
        }
    };
    if let Some(message) = reply {
        out_tx
            .send(Envelope::new(message, client_id).to_json())
            .await?;
    }
    Ok(Session::Continue)
}

enum Dispatch {
    Reply(Message),
    Silent,
    Goodbye,
}

async fn dispatch(text: &str, client_id: &str, ctx: &AppContext) -> EngineResult<Dispatch> {
    let envelope = Envelope::parse(text)?;
    match envelope.message {
        Message::TaskUpdate(TaskUpdateData::Command(command)) => {
            let task = match command {
                TaskCommand::Create { task } => ctx.store.create(task).await?,
                TaskCommand::Update { id, patch } => ctx.store.update(&id, patch).await?,
                TaskCommand::Archive { id } => ctx.store.archive(&id).await?,
            };
            debug!(client_id = %client_id, task_id = %task.id, "task command applied");
            // Observers (this client included, if subscribed) hear about the
            // commit through the channel fan-out.
            Ok(Dispatch::Silent)
        }
        Message::TaskSearch(request) => {
            let snapshot = ctx.store.snapshot().await;
            match ctx.query.run(client_id, &request, snapshot).await {
                // Superseded by a newer request from the same client.
                None => Ok(Dispatch::Silent),
                Some(response) => Ok(Dispatch::Reply(Message::TaskSearchResult(response))),
            }
        }
        Message::JoinChannel { channel } => {
            ctx.registry.authorize(client_id, &channel)?;
            ctx.broadcaster.subscribe(client_id, &channel);
            Ok(Dispatch::Reply(Message::SubscriptionSuccess { channel }))
        }
        Message::LeaveChannel { channel } => {
            ctx.broadcaster.unsubscribe(client_id, &channel);
            Ok(Dispatch::Reply(Message::UnsubscriptionSuccess { channel }))
        }
        Message::Disconnect => Ok(Dispatch::Goodbye),
        // A second connect is a no-op; the session is already authenticated.
        Message::Connect { .. } => Ok(Dispatch::Silent),
        // Server-to-client types are not accepted inbound.
        _ => Err(EngineError::validation(
            "type",
            text_type(text),
            "not a client message",
        )),
    }
}

fn text_type(text: &str) -> String {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str().map(String::from)))
        .unwrap_or_default()
}

/// Current snapshots of every task visible through the client's
/// subscriptions, each flagged `resync`.
async fn resync_frames(ctx: &AppContext, client_id: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    let mut tasks: Vec<Task> = Vec::new();
    for channel in ctx.broadcaster.subscriptions(client_id) {
        if let Some(task_id) = channel.strip_prefix("task:") {
            if let Some(task) = ctx.store.get(task_id).await {
                if seen.insert(task.id.clone()) {
                    tasks.push(task);
                }
            }
        } else if let Some(domain) = channel.strip_prefix("domain:") {
            for task in ctx.store.list(Some(domain)).await {
                if seen.insert(task.id.clone()) {
                    tasks.push(task);
                }
            }
        }
    }
    tasks.sort_by(|a, b| a.updated_at.cmp(&b.updated_at));
    tasks
        .iter()
        .map(|task| {
            let delta = TaskDelta::resync_snapshot(task);
            let channel = format!("task:{}", task.id);
            Envelope::new(Message::TaskUpdate(TaskUpdateData::Delta(delta)), "server")
                .with_channel(&channel)
                .to_json()
        })
        .collect()
}
