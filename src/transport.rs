//! WebSocket transport between the daemon and the Studio plugin.
//!
//! The server binds one TCP port and speaks HTTP only long enough to upgrade
//! to a WebSocket. At most one plugin peer is active at a time: a newer
//! connection supersedes the previous one, which is told to close. Decoded
//! messages and connect/disconnect notices flow to the session over a
//! crossbeam channel so the session thread can `select!` over them.

use std::convert::Infallible;
use std::io;
use std::net::{Ipv4Addr, TcpListener as StdTcpListener};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use crossbeam_channel::Receiver;
use futures::{SinkExt, StreamExt};
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{body::Incoming, Request, Response, StatusCode};
use hyper_tungstenite::{is_upgrade_request, tungstenite::Message, upgrade, HyperWebsocket};
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{unbounded_channel, UnboundedSender};

use crate::message::{decode_incoming, encode_outgoing, IncomingMessage, OutgoingMessage};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("could not bind port {port} (is another instance running?)")]
    Bind {
        port: u16,
        #[source]
        source: io::Error,
    },

    #[error("no plugin connected")]
    NotConnected,
}

/// What the transport reports to the session.
#[derive(Debug)]
pub enum TransportEvent {
    Connected,
    Disconnected,
    Message(IncomingMessage),
}

enum PeerFrame {
    Message(String),
    Close,
}

struct PeerHandle {
    generation: u64,
    sender: UnboundedSender<PeerFrame>,
}

struct TransportShared {
    peer: Mutex<Option<PeerHandle>>,
    events: crossbeam_channel::Sender<TransportEvent>,
    request_snapshot_on_connect: bool,
    generation: AtomicU64,
}

impl TransportShared {
    /// Installs `sender` as the active peer, closing any previous one.
    fn register_peer(&self, sender: UnboundedSender<PeerFrame>) -> u64 {
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.peer.lock().unwrap();
        if let Some(previous) = slot.replace(PeerHandle { generation, sender }) {
            log::info!("New plugin connection supersedes the previous one");
            let _ = previous.sender.send(PeerFrame::Close);
        }
        generation
    }

    /// Clears the peer slot if it still belongs to `generation`. Returns
    /// whether this peer was the active one.
    fn unregister_peer(&self, generation: u64) -> bool {
        let mut slot = self.peer.lock().unwrap();
        match &*slot {
            Some(handle) if handle.generation == generation => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        let slot = self.peer.lock().unwrap();
        let handle = slot.as_ref().ok_or(TransportError::NotConnected)?;
        handle
            .sender
            .send(PeerFrame::Message(encode_outgoing(message)))
            .map_err(|_| TransportError::NotConnected)
    }
}

/// Handle to the running server. Dropping it shuts the accept loop down and
/// joins the server thread.
pub struct Transport {
    shared: Arc<TransportShared>,
    shutdown: tokio::sync::watch::Sender<bool>,

    // Held for its Drop side effect: joins the runtime thread.
    #[allow(unused)]
    server_thread: jod_thread::JoinHandle<()>,
}

impl Transport {
    /// Binds the port and starts accepting plugin connections on a dedicated
    /// runtime thread. Bind failures surface synchronously; they are the one
    /// error that is fatal to the daemon.
    pub fn bind(
        port: u16,
        request_snapshot_on_connect: bool,
    ) -> Result<(Transport, Receiver<TransportEvent>), TransportError> {
        let std_listener = StdTcpListener::bind((Ipv4Addr::UNSPECIFIED, port))
            .and_then(|listener| {
                listener.set_nonblocking(true)?;
                Ok(listener)
            })
            .map_err(|source| TransportError::Bind { port, source })?;

        let (event_tx, event_rx) = crossbeam_channel::unbounded();
        let (shutdown_tx, mut shutdown_rx) = tokio::sync::watch::channel(false);

        let shared = Arc::new(TransportShared {
            peer: Mutex::new(None),
            events: event_tx,
            request_snapshot_on_connect,
            generation: AtomicU64::new(0),
        });

        let loop_shared = Arc::clone(&shared);
        let server_thread = jod_thread::Builder::new()
            .name("transport thread".to_owned())
            .spawn(move || {
                let rt = Runtime::new().expect("Could not start transport runtime");
                rt.block_on(async move {
                    let listener = match TcpListener::from_std(std_listener) {
                        Ok(listener) => listener,
                        Err(err) => {
                            log::error!("Could not register listener: {err}");
                            return;
                        }
                    };

                    log::info!("Listening for Studio on port {port}");

                    loop {
                        tokio::select! {
                            result = listener.accept() => match result {
                                Ok((stream, peer_addr)) => {
                                    log::debug!("Connection from {peer_addr}");
                                    let shared = Arc::clone(&loop_shared);
                                    tokio::spawn(serve_connection(stream, shared));
                                }
                                Err(err) => {
                                    log::error!("Accept failed: {err}");
                                }
                            },
                            _ = shutdown_rx.changed() => break,
                        }
                    }
                });
                // Dropping the runtime cancels all peer tasks; in-flight
                // sends are dropped, never retried.
            })
            .expect("Could not start transport thread");

        Ok((
            Transport {
                shared,
                shutdown: shutdown_tx,
                server_thread,
            },
            event_rx,
        ))
    }

    /// Queues a message for the active peer. Fails (and drops the message)
    /// when no plugin is connected.
    pub fn send(&self, message: &OutgoingMessage) -> Result<(), TransportError> {
        self.shared.send(message)
    }

    pub fn request_snapshot(
        &self,
        include_properties: Option<bool>,
        scripts_and_descendants_only: Option<bool>,
    ) -> Result<(), TransportError> {
        self.send(&OutgoingMessage::RequestSnapshot {
            include_properties,
            scripts_and_descendants_only,
        })
    }

    pub fn close(&self) {
        let _ = self.shutdown.send(true);
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        self.close();
    }
}

async fn serve_connection(stream: tokio::net::TcpStream, shared: Arc<TransportShared>) {
    let io = TokioIo::new(stream);

    let service = service_fn(move |mut request: Request<Incoming>| {
        let shared = Arc::clone(&shared);
        async move {
            if is_upgrade_request(&request) {
                match upgrade(&mut request, None) {
                    Ok((response, websocket)) => {
                        tokio::spawn(async move {
                            if let Err(err) = handle_socket(websocket, shared).await {
                                log::error!("Plugin socket error: {err}");
                            }
                        });
                        Ok::<_, Infallible>(response)
                    }
                    Err(err) => {
                        log::error!("WebSocket upgrade failed: {err}");
                        Ok(plain_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "upgrade failed",
                        ))
                    }
                }
            } else {
                Ok(plain_response(
                    StatusCode::BAD_REQUEST,
                    "azul speaks WebSocket; connect with an upgrade request",
                ))
            }
        }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(io, service)
        .with_upgrades()
        .await
    {
        log::debug!("Connection ended: {err}");
    }
}

fn plain_response(status: StatusCode, body: &'static str) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::from_static(body.as_bytes())))
        .expect("static responses always build")
}

async fn handle_socket(
    websocket: HyperWebsocket,
    shared: Arc<TransportShared>,
) -> anyhow::Result<()> {
    let mut websocket = websocket.await?;

    let (sender, mut outgoing) = unbounded_channel();
    let generation = shared.register_peer(sender);
    let _ = shared.events.send(TransportEvent::Connected);

    // Prime the tree as soon as the plugin shows up, unless the command
    // (pack, build, push) wants to drive snapshots itself.
    if shared.request_snapshot_on_connect {
        let _ = shared.send(&OutgoingMessage::RequestSnapshot {
            include_properties: None,
            scripts_and_descendants_only: None,
        });
    }

    loop {
        tokio::select! {
            frame = outgoing.recv() => match frame {
                Some(PeerFrame::Message(text)) => {
                    if websocket.send(Message::text(text)).await.is_err() {
                        break;
                    }
                }
                Some(PeerFrame::Close) | None => {
                    let _ = websocket.send(Message::Close(None)).await;
                    break;
                }
            },

            incoming = websocket.next() => match incoming {
                Some(Ok(Message::Text(text))) => match decode_incoming(&text) {
                    Ok(message) => {
                        let _ = shared.events.send(TransportEvent::Message(message));
                    }
                    Err(err) if err.is_recoverable() => {
                        log::warn!("Skipping message: {err}");
                    }
                    Err(err) => {
                        log::error!("Protocol violation, closing connection: {err}");
                        let _ = websocket.send(Message::Close(None)).await;
                        break;
                    }
                },
                Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(other)) => {
                    log::debug!("Ignoring non-text frame: {other:?}");
                }
                Some(Err(err)) => {
                    log::error!("WebSocket error: {err}");
                    break;
                }
            },
        }
    }

    // A superseded peer must not report the new peer as disconnected.
    if shared.unregister_peer(generation) {
        let _ = shared.events.send(TransportEvent::Disconnected);
    }

    Ok(())
}
