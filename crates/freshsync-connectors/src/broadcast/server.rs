//! WebSocket endpoint for the broadcaster.
//!
//! An acceptor task owns the listener; every connection gets its own
//! session task. A session waits for `hello`, subscribes the client to
//! its views (which enqueues the snapshot frames), then runs a single
//! select loop: drain the outbound queue, read client frames, ping on
//! idle, and honor kill/shutdown signals.

use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};
use tungstenite::protocol::frame::coding::CloseCode;
use tungstenite::protocol::CloseFrame;
use tungstenite::Message;

use freshsync_core::error::SyncError;

use super::config::BroadcastConfig;
use super::hub::{BroadcastHub, ClientId, ViewChannel};
use super::protocol::{encode_frame, ClientFrame, ServerFrame};

/// The broadcaster's WebSocket listener.
pub struct WsServer {
    local_addr: SocketAddr,
    shutdown_tx: watch::Sender<bool>,
    acceptor: Option<tokio::task::JoinHandle<()>>,
    hub: Arc<BroadcastHub>,
}

impl WsServer {
    /// Binds the listener and starts accepting clients.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::UnresolvableEndpoint`] when the address
    /// cannot be bound.
    pub async fn bind(hub: Arc<BroadcastHub>, config: BroadcastConfig) -> Result<Self, SyncError> {
        let listener = TcpListener::bind(&config.listen_addr).await.map_err(|e| {
            SyncError::UnresolvableEndpoint {
                endpoint: config.listen_addr.clone(),
                reason: e.to_string(),
            }
        })?;
        let local_addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        info!(addr = %local_addr, "broadcast endpoint listening");
        let acceptor = tokio::spawn(accept_loop(
            listener,
            Arc::clone(&hub),
            config,
            shutdown_rx,
        ));
        Ok(Self {
            local_addr,
            shutdown_tx,
            acceptor: Some(acceptor),
            hub,
        })
    }

    /// The bound address (useful with port 0).
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Controlled shutdown: stop accepting, say goodbye to every
    /// client, and wait for the acceptor to wind down.
    pub async fn shutdown(mut self) {
        let _ = self.shutdown_tx.send(true);
        self.hub.kick_all("shutting_down");
        if let Some(acceptor) = self.acceptor.take() {
            let _ = tokio::time::timeout(std::time::Duration::from_secs(5), acceptor).await;
        }
        info!("broadcast endpoint closed");
    }
}

async fn accept_loop(
    listener: TcpListener,
    hub: Arc<BroadcastHub>,
    config: BroadcastConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, addr)) => {
                        let connected =
                            hub.metrics().clients_connected.load(Ordering::Relaxed);
                        if connected >= config.max_connections as u64 {
                            warn!(addr = %addr, connected, "refusing connection: at capacity");
                            drop(stream);
                            continue;
                        }
                        let _ = stream.set_nodelay(true);
                        tokio::spawn(run_session(
                            stream,
                            addr,
                            Arc::clone(&hub),
                            config.clone(),
                            shutdown.clone(),
                        ));
                    }
                    Err(e) => warn!(error = %e, "accept error"),
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}

/// How a session ended; decides the close handshake.
enum SessionExit {
    /// Peer went away; nothing to send.
    Gone,
    /// Send `bye` + close with this code and reason.
    Bye(CloseCode, String),
}

async fn run_session(
    stream: TcpStream,
    addr: SocketAddr,
    hub: Arc<BroadcastHub>,
    config: BroadcastConfig,
    shutdown: watch::Receiver<bool>,
) {
    let ws = match tokio_tungstenite::accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(addr = %addr, error = %e, "handshake failed");
            return;
        }
    };
    let client_id = hub.next_client_id();
    let metrics = hub.metrics();
    metrics.sessions_total.fetch_add(1, Ordering::Relaxed);
    metrics.clients_connected.fetch_add(1, Ordering::Relaxed);
    debug!(addr = %addr, client = client_id, "client connected");

    let (mut ws_tx, mut ws_rx) = ws.split();
    let mut channels: Vec<Arc<ViewChannel>> = Vec::new();

    let exit = session_body(
        &hub,
        &config,
        client_id,
        &mut ws_tx,
        &mut ws_rx,
        &mut channels,
        shutdown,
    )
    .await;

    if let SessionExit::Bye(code, reason) = exit {
        let bye = encode_frame(&ServerFrame::Bye {
            reason: reason.clone(),
        });
        if let Ok(frame) = bye {
            let _ = ws_tx.send(Message::Text(frame)).await;
        }
        let _ = ws_tx
            .send(Message::Close(Some(CloseFrame {
                code,
                reason: reason.into(),
            })))
            .await;
    }

    for channel in &channels {
        channel.unsubscribe(client_id);
    }
    metrics.clients_connected.fetch_sub(1, Ordering::Relaxed);
    debug!(addr = %addr, client = client_id, "client disconnected");
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsSource = futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

#[allow(clippy::too_many_lines)]
async fn session_body(
    hub: &Arc<BroadcastHub>,
    config: &BroadcastConfig,
    client_id: ClientId,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    channels: &mut Vec<Arc<ViewChannel>>,
    mut shutdown: watch::Receiver<bool>,
) -> SessionExit {
    // ── Hello ──
    let views = match read_hello(ws_rx, config).await {
        Ok(views) => views,
        Err(exit) => return exit,
    };
    for view in &views {
        if hub.get_view(view).is_none() {
            return SessionExit::Bye(CloseCode::Policy, "unknown_view".to_string());
        }
    }

    // ── Subscribe: snapshot frames land in the queue under each
    //    view's state lock ──
    let (tx, mut rx) = mpsc::channel(config.client_queue_capacity);
    let (kill_tx, mut kill_rx) = watch::channel::<Option<String>>(None);
    for view in &views {
        let Some(channel) = hub.get_view(view) else {
            return SessionExit::Bye(CloseCode::Policy, "unknown_view".to_string());
        };
        if channel
            .subscribe(
                client_id,
                tx.clone(),
                kill_tx.clone(),
                config.snapshot_chunk_rows,
            )
            .is_err()
        {
            return SessionExit::Bye(CloseCode::Policy, "slow_consumer".to_string());
        }
        channels.push(channel);
    }
    drop(tx);

    // ── Live loop ──
    let mut ping = tokio::time::interval_at(
        tokio::time::Instant::now() + config.ping_interval,
        config.ping_interval,
    );
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut awaiting_pong = false;

    loop {
        tokio::select! {
            // Checked first: an eviction drops the queue senders too, and
            // the client must still see its `bye` reason.
            biased;
            _ = kill_rx.changed() => {
                let reason = kill_rx.borrow().clone();
                if let Some(reason) = reason {
                    // Eviction is a policy matter; a hub-wide goodbye is
                    // the server going away.
                    let code = if reason == "shutting_down" {
                        CloseCode::Away
                    } else {
                        CloseCode::Policy
                    };
                    return SessionExit::Bye(code, reason);
                }
            },
            _ = shutdown.changed() => {
                return SessionExit::Bye(CloseCode::Away, "shutting_down".to_string());
            },
            outbound = rx.recv() => match outbound {
                Some(frame) => {
                    if ws_tx.send(Message::Text(frame)).await.is_err() {
                        return SessionExit::Gone;
                    }
                }
                // Every subscription dropped us (kick in flight).
                None => return SessionExit::Gone,
            },
            incoming = ws_rx.next() => match incoming {
                None | Some(Ok(Message::Close(_))) => return SessionExit::Gone,
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ClientFrame>(text.as_str()) {
                        Ok(ClientFrame::Pong) => awaiting_pong = false,
                        Ok(ClientFrame::Hello { .. }) | Err(_) => {
                            let error = SyncError::BadFrame(text.as_str().chars().take(64).collect());
                            debug!(client = client_id, kind = error.kind(), error = %error, "terminating session");
                            return SessionExit::Bye(
                                CloseCode::Policy,
                                "bad_frame".to_string(),
                            );
                        }
                    }
                }
                // Transport ping/pong is handled by the protocol layer.
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Binary(_))) => {
                    return SessionExit::Bye(CloseCode::Policy, "bad_frame".to_string());
                }
                Some(Err(e)) => {
                    debug!(client = client_id, error = %e, "read error");
                    return SessionExit::Gone;
                }
            },
            _ = ping.tick() => {
                if awaiting_pong {
                    return SessionExit::Bye(CloseCode::Policy, "ping_timeout".to_string());
                }
                match encode_frame(&ServerFrame::Ping) {
                    Ok(frame) => {
                        if ws_tx.send(Message::Text(frame)).await.is_err() {
                            return SessionExit::Gone;
                        }
                        awaiting_pong = true;
                    }
                    Err(_) => return SessionExit::Gone,
                }
            }
        }
    }
}

/// Waits for the opening `hello` frame.
async fn read_hello(ws_rx: &mut WsSource, config: &BroadcastConfig) -> Result<Vec<String>, SessionExit> {
    let first = tokio::time::timeout(config.hello_timeout, ws_rx.next()).await;
    let message = match first {
        Err(_) => return Err(SessionExit::Bye(CloseCode::Policy, "bad_hello".to_string())),
        Ok(None) | Ok(Some(Err(_))) => return Err(SessionExit::Gone),
        Ok(Some(Ok(message))) => message,
    };
    match message {
        Message::Text(text) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
            Ok(ClientFrame::Hello { views }) if !views.is_empty() => Ok(views),
            _ => Err(SessionExit::Bye(CloseCode::Policy, "bad_hello".to_string())),
        },
        Message::Close(_) => Err(SessionExit::Gone),
        _ => Err(SessionExit::Bye(CloseCode::Policy, "bad_hello".to_string())),
    }
}
