//! One CQL connection: handshake, then three tasks (reader, writer,
//! heartbeat) multiplexing requests over stream ids.
//!
//! The reader routes each response frame to the oneshot sender registered
//! under its stream id. A request that timed out keeps its stream allocated
//! until the server actually answers (or the connection dies), so a stream id
//! is never reused while a reply for it may still be in flight; the late
//! reply is dropped silently when the oneshot receiver is gone.

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf, ReadHalf, WriteHalf};
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, instrument, warn};

use crate::buffer_pool::GLOBAL_BUFFER_POOL;
use crate::cluster::host::Address;
use crate::constant::{
    EVENT_SCHEMA_CHANGE, EVENT_STATUS_CHANGE, EVENT_TOPOLOGY_CHANGE, FrameFlags, MAX_STREAMS,
    ProtocolVersion,
};
use crate::error::{Error, Result};
use crate::metrics::Metrics;
use crate::opts::Opts;
use crate::protocol::event::Event;
use crate::protocol::frame::{FRAME_HEADER_SIZE, FrameHeader, ResponseFrame};
use crate::protocol::handshake::{Handshake, HandshakeAction};
use crate::protocol::request::{QueryParameters, Request};
use crate::protocol::response::{CqlResult, Response, ResponseKind};
use crate::stream::StreamIds;

/// Writes below this size are coalesced with queued frames into one syscall.
const WRITE_COALESCE_LIMIT: usize = 64 * 1024;

pub(crate) enum Stream {
    Tcp(TcpStream),
    #[cfg(feature = "tls")]
    Tls(Box<tokio_native_tls::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_read(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for Stream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_write(cx, buf),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_flush(cx),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(s) => Pin::new(s).poll_shutdown(cx),
            #[cfg(feature = "tls")]
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

enum WriteItem {
    Frame(Vec<u8>),
    Shutdown,
}

struct InFlight {
    streams: StreamIds,
    pending: HashMap<i16, oneshot::Sender<Response>>,
}

pub(crate) struct Connection {
    pub address: Address,
    pub version: ProtocolVersion,
    beta: bool,
    supported_options: HashMap<String, Vec<String>>,
    inflight: Mutex<InFlight>,
    write_tx: mpsc::UnboundedSender<WriteItem>,
    /// Serializes `USE` across requests on this connection.
    keyspace: tokio::sync::Mutex<Option<String>>,
    is_defunct: AtomicBool,
    is_closed: AtomicBool,
    in_flight_count: AtomicUsize,
    /// Milliseconds since `created_at`, bumped on every read/write.
    last_activity_ms: AtomicU64,
    created_at: Instant,
    closed_tx: watch::Sender<bool>,
    event_tx: Option<mpsc::UnboundedSender<Event>>,
    metrics: Arc<Metrics>,
}

/// A registered in-flight request: await it to get the response.
pub(crate) struct ResponseHandle {
    rx: oneshot::Receiver<Response>,
}

impl ResponseHandle {
    pub async fn wait(self, timeout: Duration) -> Result<Response> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(Error::ConnectionClosed),
            // Dropping the receiver leaves the stream allocated; the reader
            // releases it when the reply lands.
            Err(_) => Err(Error::RequestTimedOut),
        }
    }
}

impl Connection {
    /// Connect, run the handshake, and spawn the IO tasks.
    #[instrument(skip_all, fields(address = %address))]
    pub async fn connect(
        address: &Address,
        version: ProtocolVersion,
        opts: &Opts,
        keyspace: Option<String>,
        register_events: bool,
        event_tx: Option<mpsc::UnboundedSender<Event>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let connect_timeout = Duration::from_millis(opts.connect_timeout_ms);
        tokio::time::timeout(
            connect_timeout,
            Self::connect_inner(address, version, opts, keyspace, register_events, event_tx, metrics),
        )
        .await
        .map_err(|_| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "connect timed out",
            ))
        })?
    }

    async fn connect_inner(
        address: &Address,
        version: ProtocolVersion,
        opts: &Opts,
        keyspace: Option<String>,
        register_events: bool,
        event_tx: Option<mpsc::UnboundedSender<Event>>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>> {
        let socket_addr = address.socket_addr();
        let socket = if socket_addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(opts.tcp_nodelay)?;
        if opts.tcp_keepalive_secs.is_some() {
            socket.set_keepalive(true)?;
        }
        let tcp = socket.connect(socket_addr).await?;

        #[cfg(feature = "tls")]
        let mut stream = match &opts.tls_connector {
            Some(connector) => {
                let connector = tokio_native_tls::TlsConnector::from(connector.clone());
                let tls = connector
                    .connect(&address.tls_name(), tcp)
                    .await
                    .map_err(|e| Error::Io(std::io::Error::other(e)))?;
                Stream::Tls(Box::new(tls))
            }
            None => Stream::Tcp(tcp),
        };
        #[cfg(not(feature = "tls"))]
        let mut stream = Stream::Tcp(tcp);

        let auth_provider = opts.authenticator.clone().or_else(|| {
            opts.credentials
                .as_ref()
                .map(|(user, pass)| crate::auth::provider_from_credentials(user, pass))
        });
        let register = if register_events {
            vec![EVENT_TOPOLOGY_CHANGE, EVENT_STATUS_CHANGE, EVENT_SCHEMA_CHANGE]
        } else {
            Vec::new()
        };
        let mut handshake = Handshake::new(
            version,
            opts.use_beta_protocol,
            keyspace.clone(),
            register,
            auth_provider,
        );

        // Drive the handshake state machine: one request in flight at a time
        // on stream 0, straight on the socket.
        let mut frame = handshake.first_frame()?;
        loop {
            stream.write_all(&frame).await?;
            stream.flush().await?;

            let response = loop {
                let response = read_response(&mut stream, version).await?;
                // Nothing is REGISTERed yet mid-handshake, but be tolerant.
                if !matches!(response.kind, ResponseKind::Event(_)) {
                    break response;
                }
            };
            match handshake.drive(response)? {
                HandshakeAction::Write(next) => frame = next,
                HandshakeAction::Done => break,
            }
        }

        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (closed_tx, _) = watch::channel(false);
        let connection = Arc::new(Self {
            address: address.clone(),
            version,
            beta: opts.use_beta_protocol && version == ProtocolVersion::V5,
            supported_options: handshake.supported_options().clone(),
            inflight: Mutex::new(InFlight {
                streams: StreamIds::new(MAX_STREAMS),
                pending: HashMap::new(),
            }),
            write_tx,
            keyspace: tokio::sync::Mutex::new(keyspace),
            is_defunct: AtomicBool::new(false),
            is_closed: AtomicBool::new(false),
            in_flight_count: AtomicUsize::new(0),
            last_activity_ms: AtomicU64::new(0),
            created_at: Instant::now(),
            closed_tx,
            event_tx,
            metrics,
        });
        Metrics::bump(&connection.metrics.connections_opened);

        let (read_half, write_half) = tokio::io::split(stream);
        tokio::spawn(writer_task(Arc::clone(&connection), write_rx, write_half));
        tokio::spawn(reader_task(Arc::clone(&connection), read_half));
        tokio::spawn(heartbeat_task(
            Arc::clone(&connection),
            Duration::from_secs(opts.heartbeat_interval_secs),
            Duration::from_secs(opts.idle_timeout_secs),
        ));

        debug!(version = ?version, "connection ready");
        Ok(connection)
    }

    pub fn supported_options(&self) -> &HashMap<String, Vec<String>> {
        &self.supported_options
    }

    pub fn is_closed(&self) -> bool {
        self.is_closed.load(Ordering::Acquire)
    }

    pub fn is_defunct(&self) -> bool {
        self.is_defunct.load(Ordering::Acquire)
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight_count.load(Ordering::Relaxed)
    }

    pub fn has_free_streams(&self) -> bool {
        self.inflight.lock().streams.available() > 0
    }

    fn touch(&self) {
        self.last_activity_ms
            .store(self.created_at.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle_for(&self) -> Duration {
        let now = self.created_at.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_activity_ms.load(Ordering::Relaxed)))
    }

    /// Register a stream, encode and queue the frame. Fails fast with
    /// `NoStreams` or `ConnectionClosed`; never blocks.
    pub fn send(
        self: &Arc<Self>,
        request: &Request<'_>,
        tracing: bool,
        custom_payload: Option<&HashMap<String, Vec<u8>>>,
    ) -> Result<ResponseHandle> {
        if self.is_closed() {
            return Err(Error::ConnectionClosed);
        }
        let (stream, rx) = {
            let mut inflight = self.inflight.lock();
            let stream = inflight.streams.acquire()?;
            let (tx, rx) = oneshot::channel();
            inflight.pending.insert(stream, tx);
            (stream, rx)
        };

        let mut flags = FrameFlags::empty();
        if tracing {
            flags |= FrameFlags::TRACING;
        }
        if self.beta {
            flags |= FrameFlags::BETA;
        }
        let mut frame = Vec::new();
        if let Err(e) = request.encode(self.version, stream, flags, custom_payload, &mut frame) {
            let mut inflight = self.inflight.lock();
            inflight.pending.remove(&stream);
            inflight.streams.release(stream);
            return Err(e);
        }
        if self.write_tx.send(WriteItem::Frame(frame)).is_err() {
            let mut inflight = self.inflight.lock();
            inflight.pending.remove(&stream);
            inflight.streams.release(stream);
            return Err(Error::ConnectionClosed);
        }
        self.in_flight_count.fetch_add(1, Ordering::Relaxed);
        self.touch();
        Ok(ResponseHandle { rx })
    }

    /// Send and wait; the common path.
    pub async fn request(
        self: &Arc<Self>,
        request: &Request<'_>,
        timeout: Duration,
    ) -> Result<Response> {
        self.send(request, false, None)?.wait(timeout).await
    }

    /// Make sure this connection sits in `keyspace` before a request that
    /// assumes it. `USE` statements are serialized connection-wide; v5
    /// callers pass the keyspace in the frame instead and skip this.
    pub async fn ensure_keyspace(
        self: &Arc<Self>,
        keyspace: &str,
        timeout: Duration,
    ) -> Result<()> {
        let mut current = self.keyspace.lock().await;
        if current.as_deref() == Some(keyspace) {
            return Ok(());
        }
        let query = format!("USE \"{keyspace}\"");
        let params = QueryParameters::default();
        let response = self
            .request(
                &Request::Query {
                    query: &query,
                    params: &params,
                },
                timeout,
            )
            .await?;
        match response.kind {
            ResponseKind::Result(CqlResult::SetKeyspace(name)) => {
                *current = Some(name);
                Ok(())
            }
            ResponseKind::Error(err) => {
                warn!(keyspace, error = %err, "USE failed");
                Err(Error::UnableToSetKeyspace(keyspace.to_string()))
            }
            _ => Err(Error::UnexpectedResponse("expected RESULT(set_keyspace)")),
        }
    }

    /// Protocol-level failure: close and flag so the pool replaces instead of
    /// reusing.
    pub fn defunct(&self) {
        self.is_defunct.store(true, Ordering::Release);
        self.close();
    }

    /// Idempotent close. In-flight requests fail with `ConnectionClosed`
    /// once the reader winds down.
    pub fn close(&self) {
        if self.is_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.write_tx.send(WriteItem::Shutdown);
        let _ = self.closed_tx.send(true);
    }

    /// Resolves when the connection is fully closed.
    pub async fn closed(&self) {
        let mut rx = self.closed_tx.subscribe();
        // wait_for returns immediately if already true
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Drop every pending request; their receivers observe
    /// `ConnectionClosed`.
    fn fail_pending(&self) {
        let pending = {
            let mut inflight = self.inflight.lock();
            std::mem::take(&mut inflight.pending)
        };
        if !pending.is_empty() {
            debug!(count = pending.len(), "failing in-flight requests on close");
        }
        drop(pending);
        self.in_flight_count.store(0, Ordering::Relaxed);
    }
}

async fn writer_task(
    connection: Arc<Connection>,
    mut rx: mpsc::UnboundedReceiver<WriteItem>,
    mut write_half: WriteHalf<Stream>,
) {
    let mut buffer: Vec<u8> = Vec::with_capacity(WRITE_COALESCE_LIMIT);
    while let Some(item) = rx.recv().await {
        let WriteItem::Frame(frame) = item else {
            let _ = write_half.shutdown().await;
            return;
        };
        buffer.clear();
        buffer.extend_from_slice(&frame);
        // Back-to-back requests append to the same flush while it has not
        // gone out yet, bounding syscall count.
        while buffer.len() < WRITE_COALESCE_LIMIT {
            match rx.try_recv() {
                Ok(WriteItem::Frame(frame)) => buffer.extend_from_slice(&frame),
                Ok(WriteItem::Shutdown) => {
                    let _ = write_half.write_all(&buffer).await;
                    let _ = write_half.shutdown().await;
                    return;
                }
                Err(_) => break,
            }
        }
        if write_half.write_all(&buffer).await.is_err() || write_half.flush().await.is_err() {
            connection.defunct();
            return;
        }
        connection.touch();
    }
}

async fn reader_task(connection: Arc<Connection>, mut read_half: ReadHalf<Stream>) {
    loop {
        let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
        let read = tokio::select! {
            read = read_half.read_exact(&mut header_bytes) => read,
            _ = connection.closed() => break,
        };
        if read.is_err() {
            break;
        }
        let parsed = FrameHeader::from_bytes(&header_bytes)
            .and_then(|header| ResponseFrame::parse_header(header, connection.version));
        let (stream, opcode, flags, length) = match parsed {
            Ok(parts) => parts,
            Err(e) => {
                warn!(error = %e, "malformed frame header; defuncting connection");
                connection.defunct();
                break;
            }
        };
        let mut body = GLOBAL_BUFFER_POOL.get();
        body.resize(length, 0);
        if read_half.read_exact(&mut body).await.is_err() {
            break;
        }
        connection.touch();

        let response = match Response::decode(connection.version, opcode, flags, &body) {
            Ok(response) => response,
            Err(e) => {
                warn!(error = %e, ?opcode, "malformed frame body; defuncting connection");
                connection.defunct();
                break;
            }
        };
        drop(body);

        if stream < 0 {
            // Server-initiated frame: only EVENT is expected.
            if let ResponseKind::Event(event) = response.kind {
                if let Some(event_tx) = &connection.event_tx {
                    let _ = event_tx.send(event);
                }
            }
            continue;
        }

        let sender = {
            let mut inflight = connection.inflight.lock();
            inflight.streams.release(stream);
            inflight.pending.remove(&stream)
        };
        match sender {
            Some(tx) => {
                connection.in_flight_count.fetch_sub(1, Ordering::Relaxed);
                // A dropped receiver (timeout/cancel) drops the response here.
                let _ = tx.send(response);
            }
            None => {
                debug!(stream, "response for unknown stream dropped");
            }
        }
    }

    // Reader exit is the single close path: deliberate close lands here via
    // socket shutdown, anything else is a defunct.
    if !connection.is_closed() {
        connection.defunct();
    }
    connection.fail_pending();
    let _ = connection.closed_tx.send(true);
    Metrics::bump(&connection.metrics.connections_closed);
}

async fn heartbeat_task(connection: Arc<Connection>, interval: Duration, idle_timeout: Duration) {
    if interval.is_zero() {
        return;
    }
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = connection.closed() => return,
        }
        if connection.is_closed() {
            return;
        }
        if connection.idle_for() < interval {
            continue;
        }
        match connection.request(&Request::Options, idle_timeout).await {
            Ok(_) => {}
            Err(e) => {
                warn!(address = %connection.address, error = %e, "heartbeat failed; defuncting");
                connection.defunct();
                return;
            }
        }
    }
}

async fn read_response(stream: &mut Stream, version: ProtocolVersion) -> Result<Response> {
    let mut header_bytes = [0u8; FRAME_HEADER_SIZE];
    stream.read_exact(&mut header_bytes).await?;
    let header = FrameHeader::from_bytes(&header_bytes)?;
    let (_, opcode, flags, length) = ResponseFrame::parse_header(header, version)?;
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).await?;
    Response::decode(version, opcode, flags, &body)
}
