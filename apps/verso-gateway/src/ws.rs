//! WebSocket fanout: one persistent push connection per session, subscribed
//! to the thread/section topics that session has open. Events published on
//! the shared bus are delivered to every interested local connection,
//! including the originating session's own (echo): the client's dedup
//! registry exists precisely for that.

use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::Response,
    routing::{get, post},
    Router,
};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{broadcast, mpsc, RwLock};
use tokio::task::AbortHandle;
use tracing::{debug, info, warn};

use engage_proto::{generate_connection_id, ClientFrame, PushEvent, ServerFrame};
use fanout_bus::{Bus, BusMessage};

use crate::config::Config;
use crate::handlers::{health_check, publish_event};

/// State for a single push connection.
struct Connection {
    session_id: String,
    tx: mpsc::UnboundedSender<ServerFrame>,
    /// Topic name -> abort handle of the bus-to-socket forwarder task.
    topics: DashMap<String, AbortHandle>,
    last_heartbeat: Arc<RwLock<Instant>>,
}

impl Connection {
    fn active_topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.topics.iter().map(|t| t.key().clone()).collect();
        topics.sort();
        topics
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        for entry in self.topics.iter() {
            entry.value().abort();
        }
    }
}

/// Global state for the fanout gateway.
#[derive(Clone)]
pub struct FanoutState {
    connections: Arc<DashMap<String, Arc<Connection>>>,
    bus: Arc<dyn Bus>,
    heartbeat_timeout: Duration,
}

impl FanoutState {
    pub fn new(bus: Arc<dyn Bus>, config: &Config) -> Self {
        let state = Self {
            connections: Arc::new(DashMap::new()),
            bus,
            heartbeat_timeout: Duration::from_secs(config.heartbeat_timeout_seconds),
        };

        let monitor_state = state.clone();
        let check_interval = Duration::from_secs(config.heartbeat_check_seconds);
        tokio::spawn(async move {
            monitor_state.monitor_heartbeats(check_interval).await;
        });

        state
    }

    pub fn bus(&self) -> &Arc<dyn Bus> {
        &self.bus
    }

    /// Reap connections whose client stopped sending heartbeats.
    async fn monitor_heartbeats(&self, check_interval: Duration) {
        let mut interval = tokio::time::interval(check_interval);
        loop {
            interval.tick().await;

            // Collect heartbeat locks first to avoid holding DashMap guards
            // across await.
            let mut checks = Vec::new();
            for entry in self.connections.iter() {
                checks.push((entry.key().clone(), entry.value().last_heartbeat.clone()));
            }

            let mut stale = Vec::new();
            for (connection_id, heartbeat_lock) in checks {
                let last = *heartbeat_lock.read().await;
                if last.elapsed() > self.heartbeat_timeout {
                    stale.push(connection_id);
                }
            }

            for connection_id in stale {
                if let Some((_, connection)) = self.connections.remove(&connection_id) {
                    info!(
                        connection = %connection_id,
                        session = %connection.session_id,
                        "removing stale push connection (heartbeat timeout)"
                    );
                }
            }
        }
    }

    /// Start forwarding bus events on the given topics to a connection.
    /// Each topic gets its own forwarder task; per-topic bus order is
    /// preserved end to end.
    fn subscribe_topics(&self, connection: &Arc<Connection>, topics: Vec<String>) {
        for topic in topics {
            if connection.topics.contains_key(&topic) {
                continue;
            }
            let rx = self.bus.subscribe(&topic);
            let tx = connection.tx.clone();
            let topic_name = topic.clone();
            let handle = tokio::spawn(forward_topic(rx, tx, topic_name));
            connection.topics.insert(topic, handle.abort_handle());
        }
    }

    fn unsubscribe_topics(&self, connection: &Arc<Connection>, topics: &[String]) {
        for topic in topics {
            if let Some((_, handle)) = connection.topics.remove(topic) {
                handle.abort();
            }
        }
    }
}

async fn forward_topic(
    mut rx: broadcast::Receiver<BusMessage>,
    tx: mpsc::UnboundedSender<ServerFrame>,
    topic: String,
) {
    loop {
        match rx.recv().await {
            Ok(message) => match serde_json::from_slice::<PushEvent>(&message.payload) {
                Ok(event) => {
                    if tx.send(ServerFrame::Event { event }).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(topic = %topic, error = %err, "undecodable bus payload");
                }
            },
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // At-least-once, not exactly-once: a lagging consumer loses
                // events and the client recovers via its next canonical read.
                warn!(topic = %topic, skipped, "fanout consumer lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

pub fn router(state: FanoutState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/events", post(publish_event))
        .route("/ws/:session_id", get(push_handler))
        .with_state(state)
}

/// WebSocket upgrade handler.
pub async fn push_handler(
    ws: WebSocketUpgrade,
    Path(session_id): Path<String>,
    State(state): State<FanoutState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

async fn handle_socket(socket: WebSocket, session_id: String, state: FanoutState) {
    let connection_id = generate_connection_id();
    let (mut sender, mut receiver) = socket.split();

    // Channel feeding this connection's socket; forwarder tasks and frame
    // handling both write here.
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerFrame>();
    let writer_connection_id = connection_id.clone();
    tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Ok(json) = serde_json::to_string(&frame) {
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
        }
        debug!(connection = %writer_connection_id, "socket writer ended");
    });

    let connection = Arc::new(Connection {
        session_id: session_id.clone(),
        tx: tx.clone(),
        topics: DashMap::new(),
        last_heartbeat: Arc::new(RwLock::new(Instant::now())),
    });
    state
        .connections
        .insert(connection_id.clone(), connection.clone());
    info!(connection = %connection_id, session = %session_id, "push connection opened");

    while let Some(result) = receiver.next().await {
        let message = match result {
            Ok(message) => message,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket error");
                break;
            }
        };
        match message {
            Message::Text(text) => match serde_json::from_str::<ClientFrame>(&text) {
                Ok(frame) => handle_client_frame(frame, &connection, &state).await,
                Err(err) => {
                    warn!(connection = %connection_id, error = %err, "invalid client frame");
                    let _ = tx.send(ServerFrame::Error {
                        message: format!("invalid frame: {}", err),
                    });
                }
            },
            Message::Close(_) => break,
            // Control frames are handled by axum; binary frames are not
            // part of this protocol.
            _ => {}
        }
    }

    state.connections.remove(&connection_id);
    info!(connection = %connection_id, session = %session_id, "push connection closed");
}

async fn handle_client_frame(frame: ClientFrame, connection: &Arc<Connection>, state: &FanoutState) {
    match frame {
        ClientFrame::Subscribe { topics } => {
            debug!(
                session = %connection.session_id,
                ?topics,
                "subscribe"
            );
            state.subscribe_topics(connection, topics);
            let _ = connection.tx.send(ServerFrame::SubscribeAck {
                topics: connection.active_topics(),
            });
        }
        ClientFrame::Unsubscribe { topics } => {
            debug!(
                session = %connection.session_id,
                ?topics,
                "unsubscribe"
            );
            state.unsubscribe_topics(connection, &topics);
            let _ = connection.tx.send(ServerFrame::SubscribeAck {
                topics: connection.active_topics(),
            });
        }
        ClientFrame::Ping => {
            *connection.last_heartbeat.write().await = Instant::now();
            let _ = connection.tx.send(ServerFrame::Pong);
        }
    }
}
