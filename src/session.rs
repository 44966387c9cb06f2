//! Session layer: owns the transport, issues commands, awaits replies for
//! commands that carry a receipt, and demultiplexes asynchronous MESSAGE
//! deliveries onto a stream.
//!
//! One background pump task owns the read half exclusively; all writes go
//! through a single `FramedWrite` sink behind a mutex, which serializes
//! concurrent callers and keeps every frame byte-atomic on the wire. A
//! command that expects a reply installs a one-shot waiter under that same
//! lock before writing, so request/reply pairing follows send order.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use bytes::BytesMut;
use futures::SinkExt;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{Decoder, Encoder, FramedWrite};

use crate::codec::{ServerItem, StompCodec};
use crate::error::{Result, StompError};
use crate::frame::{
    AckMode, Command, HeartBeat, ServerFrame, CMD_CONNECTED, CMD_ERROR, CMD_RECEIPT,
    HDR_HEART_BEAT, HDR_MESSAGE, HDR_RECEIPT_ID,
};

/// Receipt id the library chooses for the DISCONNECT drain.
const DISCONNECT_RECEIPT: &str = "session-disconnect";

/// Bound on the DISCONNECT receipt wait.
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Capacity of the delivery and error streams.
const STREAM_DEPTH: usize = 64;

type FrameSink = FramedWrite<OwnedWriteHalf, StompCodec>;
type ReplySlot = StdMutex<Option<oneshot::Sender<ServerFrame>>>;

/// Options for [`connect`].
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Heart-beat configuration offered in the CONNECT frame. `None` is
    /// equivalent to `0,0` (no pulses in either direction).
    pub heart_beat: Option<HeartBeat>,
    /// When set, SEND's default `content-length` counts only the body bytes
    /// instead of body plus the frame's trailing line feed. Strict brokers
    /// want this; the default matches the protocol family's accounting.
    pub strict_content_length: bool,
}

/// Per-session registration of interest in a destination.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub id: String,
    pub destination: String,
    pub ack: AckMode,
}

/// Open a TCP transport to a broker. The conventional port is
/// [`crate::frame::DEFAULT_PORT`].
pub async fn dial(host: &str, port: u16) -> Result<TcpStream> {
    let transport = TcpStream::connect((host, port)).await?;
    Ok(transport)
}

/// Parse a `heart-beat` header value (format `"cx,cy"`, milliseconds).
/// Missing or invalid fields default to 0.
pub fn parse_heart_beat(header: &str) -> (u64, u64) {
    let mut parts = header.split(',');
    let cx = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    let cy = parts
        .next()
        .and_then(|s| s.trim().parse::<u64>().ok())
        .unwrap_or(0);
    (cx, cy)
}

/// Negotiate one heart-beat direction. A client value of 0 disables the
/// direction; otherwise the slower of the two intervals wins.
pub fn negotiate_interval(client_ms: u64, server_ms: u64) -> Option<Duration> {
    if client_ms == 0 {
        None
    } else {
        Some(Duration::from_millis(client_ms.max(server_ms)))
    }
}

fn is_reply_kind(command: &str) -> bool {
    matches!(command, CMD_RECEIPT | CMD_CONNECTED | CMD_ERROR)
}

fn take_waiter(slot: &ReplySlot) -> Option<oneshot::Sender<ServerFrame>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner).take()
}

/// A live STOMP session.
///
/// A session is Active from [`connect`] until [`Session::disconnect`] or
/// transport EOF, after which every operation returns
/// [`StompError::SessionClosed`].
#[derive(Debug)]
pub struct Session {
    writer: Arc<Mutex<FrameSink>>,
    reply: Arc<ReplySlot>,
    subscriptions: StdMutex<Vec<Subscription>>,
    sub_id_counter: AtomicU64,
    closed: Arc<AtomicBool>,
    streams: StdMutex<Option<(mpsc::Receiver<ServerFrame>, mpsc::Receiver<StompError>)>>,
    strict_content_length: bool,
    pump: JoinHandle<()>,
    heart_beat: Option<JoinHandle<()>>,
}

/// Perform the STOMP handshake over an already-connected transport.
///
/// Writes a CONNECT frame (`accept-version`, `host` = peer address,
/// `heart-beat`) and blocks until the first server frame arrives. Anything
/// other than CONNECTED is a fatal handshake failure: the transport is shut
/// down and an error returned. On success the delivery pump and, when the
/// negotiated send interval is non-zero, the heart-beat task are started.
///
/// Returns the session together with the decoded CONNECTED frame.
pub async fn connect(mut transport: TcpStream, options: Options) -> Result<(Session, ServerFrame)> {
    let peer = transport.peer_addr()?.to_string();
    let heart_beat = options.heart_beat.unwrap_or_default();

    let mut codec = StompCodec::new();
    let mut outbound = BytesMut::new();
    codec.encode(Command::connect(peer.clone(), heart_beat), &mut outbound)?;
    transport.write_all(&outbound).await?;

    let mut inbound = BytesMut::with_capacity(8 * 1024);
    let connected = loop {
        match codec.decode(&mut inbound) {
            Ok(Some(ServerItem::Frame(frame))) => break frame,
            Ok(Some(ServerItem::Heartbeat)) => continue,
            Ok(None) => {
                if transport.read_buf(&mut inbound).await? == 0 {
                    return Err(StompError::ProtocolViolation(
                        "connection closed before CONNECTED".to_owned(),
                    ));
                }
            }
            Err(e) => {
                let _ = transport.shutdown().await;
                return Err(e);
            }
        }
    };

    if connected.command != CMD_CONNECTED {
        let _ = transport.shutdown().await;
        let detail = connected
            .header_str(HDR_MESSAGE)
            .map(str::to_owned)
            .unwrap_or_else(|| String::from_utf8_lossy(&connected.body).into_owned());
        tracing::warn!("handshake rejected by {}: {} {}", peer, connected.command, detail);
        return Err(StompError::ProtocolViolation(format!(
            "expected CONNECTED, got {}: {}",
            connected.command, detail
        )));
    }

    let (server_tx, server_rx) =
        parse_heart_beat(connected.header_str(HDR_HEART_BEAT).unwrap_or("0,0"));
    let send_interval = negotiate_interval(heart_beat.send_interval_ms, server_rx);
    let recv_timeout = negotiate_interval(heart_beat.recv_timeout_ms, server_tx);
    tracing::debug!(
        "connected to {}; heart-beat send {:?} recv {:?}",
        peer,
        send_interval,
        recv_timeout
    );

    let (read_half, write_half) = transport.into_split();
    let writer = Arc::new(Mutex::new(FramedWrite::new(write_half, StompCodec::new())));
    let reply: Arc<ReplySlot> = Arc::new(StdMutex::new(None));
    let closed = Arc::new(AtomicBool::new(false));
    let (delivery_tx, delivery_rx) = mpsc::channel(STREAM_DEPTH);
    let (err_tx, err_rx) = mpsc::channel(STREAM_DEPTH);

    let pump = tokio::spawn(run_pump(
        read_half,
        inbound,
        Arc::clone(&reply),
        delivery_tx,
        err_tx.clone(),
        Arc::clone(&closed),
        recv_timeout,
    ));
    let heart_beat_task = send_interval.map(|every| {
        tokio::spawn(run_heart_beat(
            Arc::clone(&writer),
            err_tx,
            Arc::clone(&closed),
            every,
        ))
    });

    let session = Session {
        writer,
        reply,
        subscriptions: StdMutex::new(Vec::new()),
        sub_id_counter: AtomicU64::new(0),
        closed,
        streams: StdMutex::new(Some((delivery_rx, err_rx))),
        strict_content_length: options.strict_content_length,
        pump,
        heart_beat: heart_beat_task,
    };
    Ok((session, connected))
}

/// Background reader: drives the decoder over the read half and routes each
/// frame to the pending reply waiter (RECEIPT/CONNECTED/ERROR while someone
/// waits) or onto the delivery stream. Decode errors and recv timeouts go to
/// the error stream and reading continues; a read failure or EOF closes the
/// session.
async fn run_pump(
    mut reader: OwnedReadHalf,
    mut buf: BytesMut,
    reply: Arc<ReplySlot>,
    delivery_tx: mpsc::Sender<ServerFrame>,
    err_tx: mpsc::Sender<StompError>,
    closed: Arc<AtomicBool>,
    recv_timeout: Option<Duration>,
) {
    let mut codec = StompCodec::new();
    'read: loop {
        loop {
            match codec.decode(&mut buf) {
                Ok(Some(ServerItem::Heartbeat)) => {}
                Ok(Some(ServerItem::Frame(frame))) => {
                    route_frame(frame, &reply, &delivery_tx).await;
                }
                Ok(None) => break,
                Err(e) => {
                    tracing::warn!("discarding malformed frame: {}", e);
                    let _ = err_tx.send(e).await;
                }
            }
        }

        let read = reader.read_buf(&mut buf);
        let outcome = match recv_timeout {
            Some(limit) => match tokio::time::timeout(limit, read).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    let _ = err_tx.send(StompError::HeartBeatTimeout(limit)).await;
                    continue 'read;
                }
            },
            None => read.await,
        };
        match outcome {
            Ok(0) => break,
            Ok(_) => {}
            // A failed read means the transport is gone; the session closes
            // like on EOF, after the error is published.
            Err(e) => {
                let _ = err_tx.send(e.into()).await;
                break;
            }
        }
    }
    closed.store(true, Ordering::SeqCst);
    // Wake any caller still blocked on a reply; dropping the sender turns
    // its wait into SessionClosed.
    drop(take_waiter(&reply));
    tracing::debug!("delivery pump stopped: transport EOF");
}

async fn route_frame(
    frame: ServerFrame,
    reply: &ReplySlot,
    delivery_tx: &mpsc::Sender<ServerFrame>,
) {
    let frame = if is_reply_kind(&frame.command) {
        match take_waiter(reply) {
            Some(waiter) => match waiter.send(frame) {
                Ok(()) => return,
                // Waiter cancelled after its command was written; the frame
                // must not vanish, so it joins the delivery stream.
                Err(frame) => frame,
            },
            None => frame,
        }
    } else {
        frame
    };
    let _ = delivery_tx.send(frame).await;
}

/// Timer task: writes one pulse (a single LF) every `every`, under the
/// outbound-write lock. A write failure is surfaced on the error stream and
/// ends the task.
async fn run_heart_beat(
    writer: Arc<Mutex<FrameSink>>,
    err_tx: mpsc::Sender<StompError>,
    closed: Arc<AtomicBool>,
    every: Duration,
) {
    let mut tick = tokio::time::interval(every);
    // The first tick of an interval completes immediately; skip it so the
    // first pulse goes out one full period after connect.
    tick.tick().await;
    loop {
        tick.tick().await;
        if closed.load(Ordering::SeqCst) {
            break;
        }
        let mut sink = writer.lock().await;
        if let Err(e) = sink.send(Command::Pulse).await {
            tracing::warn!("heart-beat write failed: {}", e);
            let _ = err_tx.send(e).await;
            break;
        }
    }
}

impl Session {
    /// Write one command; when it expects a reply, block until the pump
    /// hands back the next reply frame. Callers are serialized by the
    /// outbound-write lock, which is held across the reply wait so replies
    /// pair with commands in FIFO order.
    async fn request(&self, command: Command) -> Result<Option<ServerFrame>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StompError::SessionClosed);
        }
        let mut sink = self.writer.lock().await;
        if self.closed.load(Ordering::SeqCst) {
            return Err(StompError::SessionClosed);
        }
        let waiter = if command.expects_reply() {
            let (tx, rx) = oneshot::channel();
            *self
                .reply
                .lock()
                .unwrap_or_else(PoisonError::into_inner) = Some(tx);
            Some(rx)
        } else {
            None
        };
        if let Err(e) = sink.send(command).await {
            if matches!(e, StompError::Transport(_)) {
                self.closed.store(true, Ordering::SeqCst);
            }
            return Err(e);
        }
        match waiter {
            None => Ok(None),
            Some(rx) => match rx.await {
                Ok(frame) => Ok(Some(frame)),
                Err(_) => Err(StompError::SessionClosed),
            },
        }
    }

    /// Send a message to a destination. Returns `Some` reply frame exactly
    /// when `receipt` is set.
    pub async fn send(
        &self,
        destination: &str,
        body: &[u8],
        receipt: Option<&str>,
        transaction: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.send_with_headers(destination, body, receipt, transaction, Vec::new())
            .await
    }

    /// [`Session::send`] with caller-defined headers, emitted after the
    /// standard ones in the order given.
    pub async fn send_with_headers(
        &self,
        destination: &str,
        body: &[u8],
        receipt: Option<&str>,
        transaction: Option<&str>,
        user_defined: Vec<(String, String)>,
    ) -> Result<Option<ServerFrame>> {
        let mut command =
            Command::send(destination, body.to_vec(), receipt, transaction, user_defined)?;
        if self.strict_content_length {
            if let Command::Send {
                body,
                content_length,
                ..
            } = &mut command
            {
                *content_length = Some(body.len());
            }
        }
        self.request(command).await
    }

    /// Subscribe to a destination. The subscription id is assigned from a
    /// per-session counter ("0", "1", ...).
    pub async fn subscribe(
        &self,
        destination: &str,
        receipt: Option<&str>,
        ack: AckMode,
    ) -> Result<(Subscription, Option<ServerFrame>)> {
        if destination.is_empty() {
            return Err(StompError::InvalidArgument("empty destination".to_owned()));
        }
        let id = self
            .sub_id_counter
            .fetch_add(1, Ordering::SeqCst)
            .to_string();
        let command = Command::subscribe(&id, destination, ack, receipt)?;
        let reply = self.request(command).await?;
        let subscription = Subscription {
            id,
            destination: destination.to_owned(),
            ack,
        };
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(subscription.clone());
        Ok((subscription, reply))
    }

    /// Remove a subscription by id.
    pub async fn unsubscribe(
        &self,
        id: &str,
        receipt: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        let command = Command::unsubscribe(id, receipt)?;
        let reply = self.request(command).await?;
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .retain(|s| s.id != id);
        Ok(reply)
    }

    /// Acknowledge a message by its `message-id` header value.
    pub async fn ack(
        &self,
        message_id: &str,
        receipt: Option<&str>,
        transaction: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.request(Command::ack(message_id, receipt, transaction)?)
            .await
    }

    /// Reject a message by its `message-id` header value.
    pub async fn nack(
        &self,
        message_id: &str,
        receipt: Option<&str>,
        transaction: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.request(Command::nack(message_id, receipt, transaction)?)
            .await
    }

    /// Begin a broker-side transaction.
    pub async fn begin(
        &self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.request(Command::begin(transaction, receipt)?).await
    }

    /// Discard a transaction.
    pub async fn abort(
        &self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.request(Command::abort(transaction, receipt)?).await
    }

    /// Apply a transaction.
    pub async fn commit(
        &self,
        transaction: &str,
        receipt: Option<&str>,
    ) -> Result<Option<ServerFrame>> {
        self.request(Command::commit(transaction, receipt)?).await
    }

    /// Write one heart-beat pulse immediately.
    pub async fn send_heart_beat(&self) -> Result<()> {
        self.request(Command::Pulse).await.map(|_| ())
    }

    /// Graceful shutdown: send DISCONNECT with a library-chosen receipt,
    /// await the matching RECEIPT, then shut the transport down. The
    /// transport is closed even when the receipt is missing or mismatched;
    /// in that case the error says so. No frames may be written after this
    /// returns.
    pub async fn disconnect(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StompError::SessionClosed);
        }
        let mut sink = self.writer.lock().await;
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(StompError::SessionClosed);
        }
        let (tx, rx) = oneshot::channel();
        *self
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(tx);

        let result = match sink.send(Command::disconnect(Some(DISCONNECT_RECEIPT))).await {
            Err(e) => Err(e),
            Ok(()) => match tokio::time::timeout(DISCONNECT_TIMEOUT, rx).await {
                Err(_) => Err(StompError::ProtocolViolation(
                    "no RECEIPT for DISCONNECT".to_owned(),
                )),
                Ok(Err(_)) => Err(StompError::SessionClosed),
                Ok(Ok(frame)) => {
                    if frame.command == CMD_RECEIPT
                        && frame.header_str(HDR_RECEIPT_ID) == Some(DISCONNECT_RECEIPT)
                    {
                        Ok(())
                    } else {
                        Err(StompError::ProtocolViolation(format!(
                            "disconnect expected receipt-id {:?}, got {} {:?}",
                            DISCONNECT_RECEIPT,
                            frame.command,
                            frame.header_str(HDR_RECEIPT_ID).unwrap_or("<none>"),
                        )))
                    }
                }
            },
        };

        let _ = sink.close().await;
        drop(sink);
        self.pump.abort();
        if let Some(task) = &self.heart_beat {
            task.abort();
        }
        tracing::debug!("session disconnected");
        result
    }

    /// Take the delivery and error streams. MESSAGE frames (and unsolicited
    /// RECEIPT/ERROR frames) arrive on the first stream in wire order; pump
    /// errors arrive on the second. Returns `None` after the first call.
    pub fn receive(
        &self,
    ) -> Option<(mpsc::Receiver<ServerFrame>, mpsc::Receiver<StompError>)> {
        self.streams
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }

    /// Snapshot of the active subscriptions.
    pub fn subscriptions(&self) -> Vec<Subscription> {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Whether the session has been disconnected or lost its transport.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.pump.abort();
        if let Some(task) = &self.heart_beat {
            task.abort();
        }
    }
}
