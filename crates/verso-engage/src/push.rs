//! Client side of the persistent push channel.
//!
//! One connection per session, subscribed to the thread/section topics the
//! session currently has open. Reconnect-on-drop with capped jittered
//! backoff is handled here; after a reconnect, the subscription set is
//! replayed and every subsequent event is treated as potentially duplicating
//! anything processed before the drop: the dedup registry absorbs that.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, sleep, Duration};
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use engage_proto::{ClientFrame, PushEvent, ServerFrame};

use crate::config::EngageConfig;

/// Connection parameters for the push channel.
#[derive(Debug, Clone)]
pub struct PushSettings {
    pub url: String,
    pub reconnect_initial: Duration,
    pub reconnect_max: Duration,
    pub heartbeat_interval: Duration,
}

impl PushSettings {
    pub fn from_config(config: &EngageConfig, session_id: &str) -> Self {
        Self {
            url: format!(
                "{}/ws/{}",
                config.gateway_url.trim_end_matches('/'),
                session_id
            ),
            reconnect_initial: config.reconnect_initial,
            reconnect_max: config.reconnect_max,
            heartbeat_interval: config.heartbeat_interval,
        }
    }
}

enum ConnectionEnd {
    Shutdown,
    Dropped,
}

/// Handle to the background push connection. Events received on subscribed
/// topics are forwarded, in per-thread order, to the channel given at spawn
/// time. Dropping the handle or calling [`PushChannel::close`] stops the
/// connection without touching any shared state.
pub struct PushChannel {
    outgoing: mpsc::UnboundedSender<ClientFrame>,
    topics: Arc<Mutex<HashSet<String>>>,
    shutdown: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

impl PushChannel {
    pub fn spawn(
        settings: PushSettings,
        initial_topics: Vec<String>,
        events: mpsc::UnboundedSender<PushEvent>,
    ) -> Self {
        let topics = Arc::new(Mutex::new(initial_topics.into_iter().collect::<HashSet<_>>()));
        let (outgoing, outgoing_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_channel(
            settings,
            topics.clone(),
            outgoing_rx,
            events,
            shutdown_rx,
        ));

        Self {
            outgoing,
            topics,
            shutdown,
            task,
        }
    }

    /// Start receiving events for additional topics (a newly opened thread
    /// or section). Replayed automatically after a reconnect.
    pub fn subscribe(&self, topics: Vec<String>) {
        {
            let mut set = self.topics.lock();
            set.extend(topics.iter().cloned());
        }
        let _ = self.outgoing.send(ClientFrame::Subscribe { topics });
    }

    /// Stop receiving events for topics whose views have closed.
    pub fn unsubscribe(&self, topics: Vec<String>) {
        {
            let mut set = self.topics.lock();
            for topic in &topics {
                set.remove(topic);
            }
        }
        let _ = self.outgoing.send(ClientFrame::Unsubscribe { topics });
    }

    pub async fn close(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

async fn run_channel(
    settings: PushSettings,
    topics: Arc<Mutex<HashSet<String>>>,
    mut outgoing: mpsc::UnboundedReceiver<ClientFrame>,
    events: mpsc::UnboundedSender<PushEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = settings.reconnect_initial;
    loop {
        if *shutdown.borrow() {
            return;
        }
        match connect_async(&settings.url).await {
            Ok((stream, _)) => {
                info!(url = %settings.url, "push channel connected");
                backoff = settings.reconnect_initial;
                let end = run_connection(
                    stream,
                    &topics,
                    &mut outgoing,
                    &events,
                    &mut shutdown,
                    settings.heartbeat_interval,
                )
                .await;
                if matches!(end, ConnectionEnd::Shutdown) {
                    return;
                }
                warn!(url = %settings.url, "push channel dropped, reconnecting");
            }
            Err(err) => {
                warn!(url = %settings.url, error = %err, "push channel connect failed");
            }
        }

        // Capped exponential backoff with jitter so a fleet of clients does
        // not reconnect in lockstep.
        let jitter_ms = rand::thread_rng().gen_range(0..=backoff.as_millis().max(1) as u64 / 2);
        let delay = backoff + Duration::from_millis(jitter_ms);
        tokio::select! {
            _ = sleep(delay) => {}
            changed = shutdown.changed() => {
                // A dropped handle counts as shutdown.
                if changed.is_err() || *shutdown.borrow() {
                    return;
                }
            }
        }
        backoff = (backoff * 2).min(settings.reconnect_max);
    }
}

async fn run_connection(
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
    topics: &Arc<Mutex<HashSet<String>>>,
    outgoing: &mut mpsc::UnboundedReceiver<ClientFrame>,
    events: &mpsc::UnboundedSender<PushEvent>,
    shutdown: &mut watch::Receiver<bool>,
    heartbeat_interval: Duration,
) -> ConnectionEnd {
    let (mut sender, mut receiver) = stream.split();

    // Replay the subscription set: implicit topics are whatever the session
    // currently has open.
    let current: Vec<String> = topics.lock().iter().cloned().collect();
    if !current.is_empty() {
        if send_frame(&mut sender, &ClientFrame::Subscribe { topics: current })
            .await
            .is_err()
        {
            return ConnectionEnd::Dropped;
        }
    }

    let mut heartbeat = interval(heartbeat_interval);
    heartbeat.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    return ConnectionEnd::Shutdown;
                }
            }
            frame = outgoing.recv() => {
                let Some(frame) = frame else {
                    return ConnectionEnd::Shutdown;
                };
                if send_frame(&mut sender, &frame).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }
            _ = heartbeat.tick() => {
                if send_frame(&mut sender, &ClientFrame::Ping).await.is_err() {
                    return ConnectionEnd::Dropped;
                }
            }
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(ServerFrame::Event { event }) => {
                                if events.send(event).is_err() {
                                    return ConnectionEnd::Shutdown;
                                }
                            }
                            Ok(ServerFrame::SubscribeAck { topics }) => {
                                debug!(?topics, "subscription acknowledged");
                            }
                            Ok(ServerFrame::Pong) => {}
                            Ok(ServerFrame::Error { message }) => {
                                warn!(%message, "gateway reported error");
                            }
                            Err(err) => {
                                warn!(error = %err, "unparseable gateway frame");
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => {
                        return ConnectionEnd::Dropped;
                    }
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

async fn send_frame<S>(sender: &mut S, frame: &ClientFrame) -> Result<(), ()>
where
    S: SinkExt<Message> + Unpin,
{
    let json = match serde_json::to_string(frame) {
        Ok(json) => json,
        Err(_) => return Err(()),
    };
    sender.send(Message::Text(json.into())).await.map_err(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use engage_proto::{thread_topic, PushEventKind};
    use futures_util::StreamExt;
    use tokio::net::TcpListener;

    fn settings(addr: std::net::SocketAddr) -> PushSettings {
        PushSettings {
            url: format!("ws://{}/ws/test-session", addr),
            reconnect_initial: Duration::from_millis(10),
            reconnect_max: Duration::from_millis(50),
            heartbeat_interval: Duration::from_secs(60),
        }
    }

    async fn expect_subscribe(
        ws: &mut WebSocketStream<tokio::net::TcpStream>,
    ) -> Vec<String> {
        while let Some(Ok(message)) = ws.next().await {
            if let Message::Text(text) = message {
                if let Ok(ClientFrame::Subscribe { topics }) = serde_json::from_str(&text) {
                    return topics;
                }
            }
        }
        panic!("connection closed before subscribe frame");
    }

    fn sample_event(entity: &str) -> PushEvent {
        PushEvent {
            kind: PushEventKind::CommentCreated,
            entity_id: entity.to_string(),
            thread_id: "t1".to_string(),
            payload: serde_json::json!({}),
        }
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes_after_drop() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();

        let channel = PushChannel::spawn(
            settings(addr),
            vec![thread_topic("t1")],
            events_tx,
        );

        // First connection: handshake, deliver one event, then drop.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(expect_subscribe(&mut ws).await, vec![thread_topic("t1")]);
        ws.send(Message::Text(
            serde_json::to_string(&ServerFrame::Event {
                event: sample_event("c1"),
            })
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
        assert_eq!(events_rx.recv().await.unwrap().entity_id, "c1");
        drop(ws);

        // The channel reconnects on its own and replays the subscription.
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
        assert_eq!(expect_subscribe(&mut ws).await, vec![thread_topic("t1")]);
        ws.send(Message::Text(
            serde_json::to_string(&ServerFrame::Event {
                event: sample_event("c2"),
            })
            .unwrap()
            .into(),
        ))
        .await
        .unwrap();
        assert_eq!(events_rx.recv().await.unwrap().entity_id, "c2");

        channel.close().await;
    }

    #[tokio::test]
    async fn subscribe_updates_are_sent_on_the_live_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (events_tx, _events_rx) = mpsc::unbounded_channel();

        let channel = PushChannel::spawn(settings(addr), vec![], events_tx);

        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

        channel.subscribe(vec![thread_topic("t9")]);
        assert_eq!(expect_subscribe(&mut ws).await, vec![thread_topic("t9")]);

        channel.close().await;
    }
}
