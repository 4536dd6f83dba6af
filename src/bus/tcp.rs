//! TCP transport for the bus
//!
//! Client processes connect to the job server and exchange newline-delimited
//! JSON frames. The server side forwards every request frame into an
//! `InProcessBus`, so remote and local requests reach the same subscribers.
//! Closing a connection cancels that connection's pending requests.

use crate::bus::{InProcessBus, MessageBus, Subscription};
use crate::error::{JobServerError, JobServerResult};
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tokio_util::codec::{Framed, LinesCodec, LinesCodecError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const URL_SCHEME: &str = "tcp://";

/// Upper bound for a single frame
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
enum Frame {
    Request {
        id: u64,
        subject: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },
    Reply {
        id: u64,
        payload: String,
    },
    /// Transport-level failure, e.g. nobody subscribed to the subject
    Failure {
        id: u64,
        kind: FailureKind,
        message: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
enum FailureKind {
    NoResponders,
    Timeout,
    Other,
}

impl FailureKind {
    fn of(err: &JobServerError) -> Self {
        match err {
            JobServerError::NoResponders(_) => Self::NoResponders,
            JobServerError::RequestTimeout { .. } => Self::Timeout,
            _ => Self::Other,
        }
    }
}

fn framed(stream: TcpStream) -> Framed<TcpStream, LinesCodec> {
    Framed::new(stream, LinesCodec::new_with_max_length(MAX_FRAME_LEN))
}

/// Serialize a frame, refusing lines the peer's codec would discard
fn encode_frame(frame: &Frame) -> JobServerResult<String> {
    let line = serde_json::to_string(frame).map_err(JobServerError::Encode)?;
    if line.len() > MAX_FRAME_LEN {
        return Err(JobServerError::FrameTooLarge {
            size: line.len(),
            limit: MAX_FRAME_LEN,
        });
    }
    Ok(line)
}

fn timeout_millis(timeout: Option<Duration>) -> Option<u64> {
    timeout.map(|t| u64::try_from(t.as_millis()).unwrap_or(u64::MAX))
}

/// Parse `tcp://host:port` into `host:port`
pub fn parse_url(url: &str) -> JobServerResult<&str> {
    match url.strip_prefix(URL_SCHEME) {
        Some(addr) if !addr.is_empty() => Ok(addr),
        _ => Err(JobServerError::InvalidUrl(url.to_string())),
    }
}

/// Accepts client connections and forwards their requests to a local bus
pub struct TcpBusServer {
    local_addr: SocketAddr,
}

impl TcpBusServer {
    /// Listen on `addr` and serve until `shutdown` is cancelled
    pub async fn bind(
        addr: &str,
        bus: InProcessBus,
        shutdown: CancellationToken,
    ) -> JobServerResult<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| JobServerError::io(format!("binding {}", addr), e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| JobServerError::io("reading listener address", e))?;

        info!("Bus listening on {}{}", URL_SCHEME, local_addr);
        tokio::spawn(accept_loop(listener, bus, shutdown));
        Ok(Self { local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// URL clients connect to
    pub fn url(&self) -> String {
        format!("{}{}", URL_SCHEME, self.local_addr)
    }
}

async fn accept_loop(listener: TcpListener, bus: InProcessBus, shutdown: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = shutdown.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                debug!("Client connected from {}", peer);
                tokio::spawn(serve_connection(stream, bus.clone(), shutdown.child_token()));
            }
            Err(e) => warn!("Failed to accept bus connection: {}", e),
        }
    }
    debug!("Bus listener stopped");
}

async fn serve_connection(stream: TcpStream, bus: InProcessBus, connection: CancellationToken) {
    let (mut sink, mut frames) = framed(stream).split();
    let (reply_tx, mut reply_rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(line) = reply_rx.recv().await {
            if let Err(e) = sink.send(line).await {
                warn!("Failed to write bus frame: {}", e);
                break;
            }
        }
    });

    // Framed yields one `None` after a decode error before it resumes reading
    let mut skipped_oversized = false;
    loop {
        let line = tokio::select! {
            _ = connection.cancelled() => break,
            line = frames.next() => line,
        };
        let line = match line {
            Some(Ok(line)) => line,
            // The codec skips to the next newline; other requests are unaffected
            Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                warn!("Discarding bus frame over {} bytes", MAX_FRAME_LEN);
                skipped_oversized = true;
                continue;
            }
            Some(Err(e)) => {
                warn!("Dropping bus connection: {}", e);
                break;
            }
            None if skipped_oversized => {
                skipped_oversized = false;
                continue;
            }
            None => break,
        };
        skipped_oversized = false;

        match serde_json::from_str::<Frame>(&line) {
            Ok(Frame::Request {
                id,
                subject,
                payload,
                timeout_ms,
            }) => {
                let bus = bus.clone();
                let reply_tx = reply_tx.clone();
                let connection = connection.clone();
                tokio::spawn(async move {
                    let timeout = timeout_ms.map(Duration::from_millis);
                    let reply = tokio::select! {
                        // Dropping the request tells the responder nobody is waiting
                        _ = connection.cancelled() => return,
                        reply = bus.request(&subject, payload.into_bytes(), timeout) => reply,
                    };
                    let frame = match reply {
                        Ok(payload) => Frame::Reply {
                            id,
                            payload: String::from_utf8_lossy(&payload).into_owned(),
                        },
                        Err(e) => Frame::Failure {
                            id,
                            kind: FailureKind::of(&e),
                            message: e.to_string(),
                        },
                    };
                    let line = encode_frame(&frame).or_else(|e| {
                        warn!("Cannot send reply {}: {}", id, e);
                        encode_frame(&Frame::Failure {
                            id,
                            kind: FailureKind::Other,
                            message: e.to_string(),
                        })
                    });
                    match line {
                        Ok(line) => {
                            if reply_tx.send(line).is_err() {
                                debug!("Connection closed before reply {} was written", id);
                            }
                        }
                        Err(e) => warn!("Dropping reply {}: {}", id, e),
                    }
                });
            }
            Ok(other) => warn!("Ignoring unexpected bus frame from client: {:?}", other),
            Err(e) => warn!("Ignoring malformed bus frame: {}", e),
        }
    }

    connection.cancel();
    drop(reply_tx);
    let _ = writer.await;
    debug!("Client disconnected");
}

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<Result<Vec<u8>, (FailureKind, String)>>>>>;

/// Client side of the TCP transport
///
/// Supports `request` only; subscriptions live in the job server.
pub struct TcpBusClient {
    next_id: AtomicU64,
    pending: Pending,
    outgoing: mpsc::UnboundedSender<String>,
    closed: CancellationToken,
}

impl TcpBusClient {
    /// Connect to a job server at `tcp://host:port`
    pub async fn connect(url: &str) -> JobServerResult<Self> {
        let addr = parse_url(url)?;
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|e| JobServerError::io(format!("connecting to {}", url), e))?;
        let (mut sink, mut frames) = framed(stream).split();

        let pending: Pending = Arc::default();
        let closed = CancellationToken::new();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<String>();

        let writer_closed = closed.clone();
        tokio::spawn(async move {
            loop {
                let line = tokio::select! {
                    _ = writer_closed.cancelled() => break,
                    line = outgoing_rx.recv() => match line {
                        Some(line) => line,
                        None => break,
                    },
                };
                if sink.send(line).await.is_err() {
                    writer_closed.cancel();
                    break;
                }
            }
        });

        let reader_pending = Arc::clone(&pending);
        let reader_closed = closed.clone();
        tokio::spawn(async move {
            let mut skipped_oversized = false;
            loop {
                let line = tokio::select! {
                    _ = reader_closed.cancelled() => break,
                    line = frames.next() => line,
                };
                let line = match line {
                    Some(Ok(line)) => line,
                    Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                        warn!("Discarding bus frame over {} bytes", MAX_FRAME_LEN);
                        skipped_oversized = true;
                        continue;
                    }
                    None if skipped_oversized => {
                        skipped_oversized = false;
                        continue;
                    }
                    Some(Err(_)) | None => break,
                };
                skipped_oversized = false;
                let (id, outcome) = match serde_json::from_str::<Frame>(&line) {
                    Ok(Frame::Reply { id, payload }) => (id, Ok(payload.into_bytes())),
                    Ok(Frame::Failure { id, kind, message }) => (id, Err((kind, message))),
                    Ok(other) => {
                        warn!("Ignoring unexpected bus frame from server: {:?}", other);
                        continue;
                    }
                    Err(e) => {
                        warn!("Ignoring malformed bus frame: {}", e);
                        continue;
                    }
                };
                let waiter = reader_pending.lock().remove(&id);
                match waiter {
                    Some(waiter) => {
                        if waiter.send(outcome).is_err() {
                            debug!("Requester of {} stopped waiting", id);
                        }
                    }
                    None => debug!("Dropping reply {} nobody is waiting for", id),
                }
            }
            reader_closed.cancel();
            // Wake everyone still waiting; their senders are dropped here
            reader_pending.lock().clear();
        });

        Ok(Self {
            next_id: AtomicU64::new(1),
            pending,
            outgoing,
            closed,
        })
    }

    /// Close the connection; outstanding requests fail with `ConnectionClosed`
    pub fn close(&self) {
        self.closed.cancel();
    }
}

impl Drop for TcpBusClient {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

#[async_trait]
impl MessageBus for TcpBusClient {
    async fn subscribe(&self, _subject: &str) -> JobServerResult<Subscription> {
        Err(JobServerError::Unsupported("subscribing from a client connection"))
    }

    async fn request(
        &self,
        subject: &str,
        payload: Vec<u8>,
        timeout: Option<Duration>,
    ) -> JobServerResult<Vec<u8>> {
        if self.closed.is_cancelled() {
            return Err(JobServerError::ConnectionClosed);
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let line = encode_frame(&Frame::Request {
            id,
            subject: subject.to_string(),
            payload: String::from_utf8_lossy(&payload).into_owned(),
            timeout_ms: timeout_millis(timeout),
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if self.outgoing.send(line).is_err() {
            self.pending.lock().remove(&id);
            return Err(JobServerError::ConnectionClosed);
        }

        let outcome = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    self.pending.lock().remove(&id);
                    return Err(JobServerError::RequestTimeout {
                        subject: subject.to_string(),
                        timeout,
                    });
                }
            },
            None => rx.await,
        };

        match outcome {
            Ok(Ok(payload)) => Ok(payload),
            Ok(Err((FailureKind::NoResponders, _))) => {
                Err(JobServerError::NoResponders(subject.to_string()))
            }
            Ok(Err((FailureKind::Timeout, _))) => Err(JobServerError::RequestTimeout {
                subject: subject.to_string(),
                timeout: timeout.unwrap_or_default(),
            }),
            Ok(Err((FailureKind::Other, message))) => Err(JobServerError::ReplyDelivery(message)),
            Err(_) => Err(JobServerError::ConnectionClosed),
        }
    }
}
