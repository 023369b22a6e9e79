//! Channel fan-out with per-client disconnect buffering.
//!
//! The store pushes `CommitDelta`s through an unbounded channel; a forwarder
//! task hands each one to the broadcaster, which routes it to every client
//! subscribed to one of the delta's channels. Delivery to a connected client
//! goes through a bounded mpsc with `try_send` so a slow consumer can never
//! stall a commit — its deltas fall into the same backlog a disconnected
//! client accumulates.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::envelope::{Envelope, Message, TaskDelta, TaskUpdateData};
use crate::tasks::store::CommitDelta;

/// Outcome of a client re-attaching its transport.
#[derive(Debug, PartialEq, Eq)]
pub enum Reconnect {
    /// Backlog replayed in commit order; carries the number of deltas sent.
    Replayed(usize),
    /// Backlog overflowed or aged out; the caller must push full snapshots
    /// for every subscribed channel, flagged `resync`.
    Resync,
}

struct ClientSession {
    subscriptions: BTreeSet<String>,
    /// Live outbound transport. `None` while the client is disconnected.
    sender: Option<mpsc::Sender<String>>,
    /// Deltas awaiting the client, oldest first, each paired with the
    /// channel it matched.
    backlog: VecDeque<(String, TaskDelta)>,
    /// Once set, the backlog is no longer a faithful prefix of the commit
    /// stream and only a full resync can catch the client up.
    overflowed: bool,
    disconnected_at: Option<Instant>,
}

impl ClientSession {
    fn new() -> Self {
        Self {
            subscriptions: BTreeSet::new(),
            sender: None,
            backlog: VecDeque::new(),
            overflowed: false,
            disconnected_at: None,
        }
    }
}

pub struct SyncBroadcaster {
    sessions: Mutex<HashMap<String, ClientSession>>,
    /// Max buffered deltas per disconnected client.
    buffer_limit: usize,
    /// How long a disconnected client's backlog is retained.
    retention: Duration,
}

impl SyncBroadcaster {
    pub fn new(buffer_limit: usize, retention: Duration) -> Self {
        Self {
            sessions: Mutex::new(HashMap::new()),
            buffer_limit,
            retention,
        }
    }

    /// Spawn the forwarder pumping store commits into `publish`. Runs until
    /// the store side of the channel is dropped.
    pub fn run_forwarder(
        self: std::sync::Arc<Self>,
        mut rx: mpsc::UnboundedReceiver<CommitDelta>,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            while let Some(delta) = rx.recv().await {
                self.publish(&delta);
            }
            debug!("commit stream closed, forwarder exiting");
        })
    }

    /// Route one committed delta to every subscribed client. Never blocks:
    /// connected clients get a `try_send`, everyone else gets the backlog.
    pub fn publish(&self, delta: &CommitDelta) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        let now = Instant::now();
        for (client_id, session) in sessions.iter_mut() {
            let Some(channel) = delta
                .channels
                .iter()
                .find(|c| session.subscriptions.contains(*c))
            else {
                continue;
            };

            if self.expired(session, now) {
                // Retention lapsed mid-disconnect; the partial backlog is
                // worthless now.
                session.backlog.clear();
                session.overflowed = true;
                continue;
            }
            if session.overflowed {
                continue;
            }

            let wire_delta = TaskDelta::from_commit(delta);
            if let Some(sender) = session.sender.clone() {
                // Older buffered deltas go out first: the outbox and the
                // backlog together always form a commit-order prefix.
                let mut closed = false;
                loop {
                    let frame = match session.backlog.front() {
                        Some((buffered_channel, buffered)) => {
                            delta_frame(buffered_channel, buffered.clone())
                        }
                        None => break,
                    };
                    match sender.try_send(frame) {
                        Ok(()) => {
                            session.backlog.pop_front();
                        }
                        Err(mpsc::error::TrySendError::Full(_)) => break,
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            closed = true;
                            break;
                        }
                    }
                }
                if closed {
                    session.sender = None;
                    session.disconnected_at = Some(now);
                } else if session.backlog.is_empty() {
                    match sender.try_send(delta_frame(channel, wire_delta.clone())) {
                        Ok(()) => continue,
                        Err(mpsc::error::TrySendError::Full(_)) => {
                            debug!(client_id = %client_id, "outbox full, buffering delta");
                        }
                        Err(mpsc::error::TrySendError::Closed(_)) => {
                            session.sender = None;
                            session.disconnected_at = Some(now);
                        }
                    }
                }
            }

            session.backlog.push_back((channel.clone(), wire_delta));
            if session.backlog.len() > self.buffer_limit {
                warn!(client_id = %client_id, limit = self.buffer_limit, "backlog overflow, forcing resync");
                session.backlog.clear();
                session.overflowed = true;
            }
        }
    }

    /// Attach a client's transport and drain its backlog in
    /// commit order, or report that a resync is required.
    pub async fn reconnect(&self, client_id: &str, sender: mpsc::Sender<String>) -> Reconnect {
        let (pending, needs_resync) = {
            let Ok(mut sessions) = self.sessions.lock() else {
                return Reconnect::Replayed(0);
            };
            let session = sessions
                .entry(client_id.to_string())
                .or_insert_with(ClientSession::new);
            let expired = self.expired(session, Instant::now());
            let needs_resync = session.overflowed || expired;
            session.sender = Some(sender.clone());
            session.disconnected_at = None;
            session.overflowed = false;
            let pending: Vec<_> = session.backlog.drain(..).collect();
            (pending, needs_resync)
        };

        if needs_resync {
            info!(client_id = %client_id, "backlog unavailable, client must resync");
            return Reconnect::Resync;
        }
        let count = pending.len();
        for (channel, delta) in pending {
            if sender.send(delta_frame(&channel, delta)).await.is_err() {
                self.detach(client_id);
                break;
            }
        }
        if count > 0 {
            info!(client_id = %client_id, count, "replayed buffered deltas");
        }
        Reconnect::Replayed(count)
    }

    /// Transport dropped without an explicit goodbye; keep the session and
    /// start buffering against the retention window.
    pub fn detach(&self, client_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            if let Some(session) = sessions.get_mut(client_id) {
                session.sender = None;
                session.disconnected_at = Some(Instant::now());
            }
        }
    }

    /// Explicit disconnect: delivery for every channel stops now and nothing
    /// is buffered for a return.
    pub fn remove(&self, client_id: &str) {
        if let Ok(mut sessions) = self.sessions.lock() {
            sessions.remove(client_id);
        }
    }

    /// Returns false if the client was already subscribed.
    pub fn subscribe(&self, client_id: &str, channel: &str) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        sessions
            .entry(client_id.to_string())
            .or_insert_with(ClientSession::new)
            .subscriptions
            .insert(channel.to_string())
    }

    /// Returns false if the client was not subscribed. Buffered deltas for
    /// the channel are dropped along with the subscription.
    pub fn unsubscribe(&self, client_id: &str, channel: &str) -> bool {
        let Ok(mut sessions) = self.sessions.lock() else {
            return false;
        };
        let Some(session) = sessions.get_mut(client_id) else {
            return false;
        };
        let removed = session.subscriptions.remove(channel);
        if removed {
            session.backlog.retain(|(c, _)| c != channel);
        }
        removed
    }

    pub fn subscriptions(&self, client_id: &str) -> Vec<String> {
        self.sessions
            .lock()
            .ok()
            .and_then(|sessions| {
                sessions
                    .get(client_id)
                    .map(|s| s.subscriptions.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    fn expired(&self, session: &ClientSession, now: Instant) -> bool {
        session
            .disconnected_at
            .is_some_and(|at| now.duration_since(at) > self.retention)
    }
}

fn delta_frame(channel: &str, delta: TaskDelta) -> String {
    Envelope::new(Message::TaskUpdate(TaskUpdateData::Delta(delta)), "server")
        .with_channel(channel)
        .to_json()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::model::{Task, TaskStatus};
    use serde_json::Value;

    fn delta(task_id: &str, label: &str) -> CommitDelta {
        let mut task = Task::new(task_id, label);
        task.status = TaskStatus::InProgress;
        CommitDelta {
            task_id: task_id.to_string(),
            channels: task.channels(),
            status: task.status,
            updated_at: task.updated_at,
            changed: vec!["label".to_string()],
            fields: [("label".to_string(), Value::String(label.to_string()))]
                .into_iter()
                .collect(),
            task,
        }
    }

    fn parse_frame(frame: &str) -> Value {
        serde_json::from_str(frame).unwrap()
    }

    #[tokio::test]
    async fn test_connected_client_receives_matching_channels_only() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "task:t1");

        broadcaster.publish(&delta("t1", "Mine"));
        broadcaster.publish(&delta("t2", "Not mine"));

        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t1");
        assert_eq!(frame["channel"], "task:t1");
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_backlog_replays_in_commit_order() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(8);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "domain:default");
        drop(rx);

        broadcaster.publish(&delta("t1", "first"));
        broadcaster.publish(&delta("t2", "second"));
        broadcaster.publish(&delta("t3", "third"));

        let (tx, mut rx) = mpsc::channel(8);
        let outcome = broadcaster.reconnect("c1", tx).await;
        assert_eq!(outcome, Reconnect::Replayed(3));

        for expected in ["t1", "t2", "t3"] {
            let frame = parse_frame(&rx.recv().await.unwrap());
            assert_eq!(frame["data"]["id"], expected);
        }
    }

    #[tokio::test]
    async fn test_overflow_forces_resync_instead_of_partial_replay() {
        let broadcaster = SyncBroadcaster::new(2, Duration::from_secs(60));
        let (tx, rx) = mpsc::channel(8);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "domain:default");
        drop(rx);

        for i in 0..5 {
            broadcaster.publish(&delta(&format!("t{}", i), "x"));
        }

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(broadcaster.reconnect("c1", tx).await, Reconnect::Resync);
        // Nothing partial was replayed.
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_retention_expiry_forces_resync() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_millis(1));
        let (tx, rx) = mpsc::channel(8);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "domain:default");
        drop(rx);
        broadcaster.detach("c1");
        broadcaster.publish(&delta("t1", "buffered"));

        tokio::time::sleep(Duration::from_millis(10)).await;
        let (tx, _rx) = mpsc::channel(8);
        assert_eq!(broadcaster.reconnect("c1", tx).await, Reconnect::Resync);
    }

    #[tokio::test]
    async fn test_leave_channel_stops_delivery_immediately() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(8);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "task:t1");
        assert!(broadcaster.unsubscribe("c1", "task:t1"));
        assert!(!broadcaster.unsubscribe("c1", "task:t1"));

        broadcaster.publish(&delta("t1", "gone"));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_slow_consumer_falls_to_backlog_without_blocking() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(1);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "domain:default");

        broadcaster.publish(&delta("t1", "fits"));
        broadcaster.publish(&delta("t2", "buffered"));

        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t1");

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(broadcaster.reconnect("c1", tx).await, Reconnect::Replayed(1));
        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t2");
    }

    #[tokio::test]
    async fn test_buffered_delta_goes_out_before_newer_commits() {
        let broadcaster = SyncBroadcaster::new(16, Duration::from_secs(60));
        let (tx, mut rx) = mpsc::channel(1);
        broadcaster.reconnect("c1", tx).await;
        broadcaster.subscribe("c1", "domain:default");

        // t1 fills the outbox, t2 falls into the backlog.
        broadcaster.publish(&delta("t1", "first"));
        broadcaster.publish(&delta("t2", "second"));
        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t1");

        // Capacity is free again: t2 must be delivered before t3, never
        // leapfrogged by it.
        broadcaster.publish(&delta("t3", "third"));
        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t2");

        let (tx, mut rx) = mpsc::channel(8);
        assert_eq!(broadcaster.reconnect("c1", tx).await, Reconnect::Replayed(1));
        let frame = parse_frame(&rx.recv().await.unwrap());
        assert_eq!(frame["data"]["id"], "t3");
    }
}
