//! Reconnecting WebSocket session shared by the venue adapters.
//!
//! The venue-specific part is a [`SocketHandler`]: it supplies the frames to
//! send after every (re)connect (auth, resubscription) and consumes text
//! frames. The session owns reconnect backoff, heartbeats and counters.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval, sleep, timeout};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::protocol::Message};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::exchange::stats::ConnectionStats;
use crate::exchange::stream::StreamSender;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

pub trait SocketHandler: Send + Sync + 'static {
    /// Frames sent right after each successful connect.
    fn on_connect(&self) -> Vec<String>;

    /// Handle one text frame; returned frames are written back.
    fn on_text(&self, text: &str) -> Vec<String>;

    /// Application-level ping, if the venue wants one.
    fn ping(&self) -> Option<String> {
        None
    }
}

#[derive(Debug, Clone)]
pub struct SocketConfig {
    pub name: String,
    pub url: String,
    pub heartbeat: Duration,
}

/// Handle to a running session. Dropping it does not stop the session; call
/// [`SocketSession::shutdown`].
pub struct SocketSession {
    outbound: mpsc::UnboundedSender<String>,
    shutdown: watch::Sender<bool>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SocketSession {
    pub fn spawn(
        config: SocketConfig,
        handler: Arc<dyn SocketHandler>,
        stats: Arc<ConnectionStats>,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = watch::channel(false);
        let task = tokio::spawn(supervise(config, handler, stats, outbound_rx, shutdown_rx));
        Self {
            outbound,
            shutdown,
            task: Mutex::new(Some(task)),
        }
    }

    /// Queue a frame. Frames queued while disconnected are sent after the
    /// next connect.
    pub fn send(&self, frame: String) {
        if self.outbound.send(frame).is_err() {
            debug!("Socket session already stopped; frame discarded");
        }
    }

    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

async fn supervise(
    config: SocketConfig,
    handler: Arc<dyn SocketHandler>,
    stats: Arc<ConnectionStats>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    mut shutdown: watch::Receiver<bool>,
) {
    let url = match Url::parse(&config.url) {
        Ok(url) => url,
        Err(e) => {
            error!("❌ {} WebSocket url '{}' is invalid: {}", config.name, config.url, e);
            stats.record_error(format!("invalid url: {}", e));
            return;
        }
    };
    let mut backoff = Duration::from_millis(500);
    let mut sessions = 0u64;

    loop {
        if *shutdown.borrow() {
            break;
        }

        match timeout(CONNECT_TIMEOUT, connect_async(url.as_str())).await {
            Ok(Ok((socket, _))) => {
                sessions += 1;
                if sessions > 1 {
                    stats.record_reconnect();
                }
                info!("🔌 {} WebSocket connected ({})", config.name, url);
                backoff = Duration::from_millis(500);

                let started = Instant::now();
                match run_session(socket, &config, &*handler, &stats, &mut outbound, &mut shutdown).await {
                    SessionEnd::Shutdown => break,
                    SessionEnd::Dropped(reason) => {
                        warn!(
                            "⚠️ {} WebSocket dropped after {:?}: {}",
                            config.name,
                            started.elapsed(),
                            reason
                        );
                        stats.record_error(reason);
                    }
                }
            }
            Ok(Err(e)) => {
                error!("❌ {} WebSocket connect failed: {}", config.name, e);
                stats.record_error(e.to_string());
            }
            Err(_) => {
                error!("❌ {} WebSocket connect timed out", config.name);
                stats.record_error("connect timed out");
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            _ = sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
    debug!("{} WebSocket supervisor stopped", config.name);
}

enum SessionEnd {
    Shutdown,
    Dropped(String),
}

async fn run_session(
    mut socket: WsStream,
    config: &SocketConfig,
    handler: &dyn SocketHandler,
    stats: &ConnectionStats,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    shutdown: &mut watch::Receiver<bool>,
) -> SessionEnd {
    for frame in handler.on_connect() {
        if let Err(e) = socket.send(Message::Text(frame)).await {
            return SessionEnd::Dropped(e.to_string());
        }
    }

    let mut heartbeat = interval(config.heartbeat);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
    heartbeat.tick().await;

    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket.send(Message::Close(None)).await;
                return SessionEnd::Shutdown;
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    return SessionEnd::Shutdown;
                };
                if let Err(e) = socket.send(Message::Text(frame)).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            _ = heartbeat.tick() => {
                let ping = match handler.ping() {
                    Some(text) => Message::Text(text),
                    None => Message::Ping(Vec::new()),
                };
                if let Err(e) = socket.send(ping).await {
                    return SessionEnd::Dropped(e.to_string());
                }
            }
            msg = socket.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        stats.record_message(text.len());
                        for reply in handler.on_text(&text) {
                            if let Err(e) = socket.send(Message::Text(reply)).await {
                                return SessionEnd::Dropped(e.to_string());
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = socket.send(Message::Pong(payload)).await {
                            return SessionEnd::Dropped(e.to_string());
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        return SessionEnd::Dropped(format!("closed by server: {:?}", frame));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return SessionEnd::Dropped(e.to_string()),
                    None => return SessionEnd::Dropped("stream ended".into()),
                }
            }
        }
    }
}

/// Subscribers per venue topic (stream name), with pruning of consumers that
/// went away.
pub struct TopicRoutes<T> {
    routes: Mutex<HashMap<String, Vec<StreamSender<T>>>>,
}

impl<T> Default for TopicRoutes<T> {
    fn default() -> Self {
        Self {
            routes: Mutex::new(HashMap::new()),
        }
    }
}

impl<T: Clone> TopicRoutes<T> {
    /// Returns true when this is the first subscriber for `topic`.
    pub fn add(&self, topic: &str, sender: StreamSender<T>) -> bool {
        let mut routes = self.routes.lock();
        let list = routes.entry(topic.to_string()).or_default();
        list.retain(|s| !s.is_closed());
        let first = list.is_empty();
        list.push(sender);
        first
    }

    /// Publish to every live subscriber of `topic`. Returns false when the
    /// topic no longer has subscribers and should be unsubscribed upstream.
    pub fn publish(&self, topic: &str, update: T) -> bool {
        let mut routes = self.routes.lock();
        let Some(list) = routes.get_mut(topic) else {
            return false;
        };
        list.retain(|s| s.publish(update.clone()));
        if list.is_empty() {
            routes.remove(topic);
            return false;
        }
        true
    }

    pub fn topics(&self) -> Vec<String> {
        self.routes.lock().keys().cloned().collect()
    }

    pub fn clear(&self) {
        self.routes.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exchange::stream::stream_channel;

    #[tokio::test]
    async fn test_routes_fan_out_and_prune() {
        let routes = TopicRoutes::<u32>::default();
        let (tx1, mut rx1) = stream_channel(4);
        let (tx2, rx2) = stream_channel(4);
        assert!(routes.add("btcusdt@trade", tx1));
        assert!(!routes.add("btcusdt@trade", tx2));

        drop(rx2);
        assert!(routes.publish("btcusdt@trade", 7));
        assert_eq!(rx1.recv().await, Some(7));

        drop(rx1);
        assert!(!routes.publish("btcusdt@trade", 8));
        assert!(routes.topics().is_empty());
    }

    #[test]
    fn test_unknown_topic_reports_no_subscribers() {
        let routes = TopicRoutes::<u32>::default();
        assert!(!routes.publish("nothing", 1));
    }
}
