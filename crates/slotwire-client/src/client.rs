//! Client multiplexer: one socket, a slot table and a send queue.
//!
//! Callers reserve a slot, queue the message and await a [`ResponseFuture`].
//! Each connection runs a read task and a flush task. The flush task packs
//! queued messages into batches and writes each batch with one socket write;
//! the read task reassembles response frames and resolves slots. When the
//! connection ends for any reason, every pending slot resolves with
//! `ConnectionClosed`.

use std::any::{Any, type_name};
use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;
use slotwire_core::{FlushBudget, SharedErrorLogger};
use slotwire_protocol::{
    Catalog, Frame, FrameReader, FrameWriter, NO_RESPONSE_ID, Ping, ProtocolError, RequestHeader,
    ResponseHeader, Wire,
};
use tokio::io::{AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace};

use crate::config::{ClientConfig, KeepaliveSettings};
use crate::error::{CallError, ClientError, ClientResult};
use crate::response::ResponseFuture;
use crate::slots::{Completion, Slot, SlotState, SlotTable};

/// Connection state of a [`Client`].
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Connecting,
            2 => Self::Connected,
            _ => Self::Disconnected,
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
        })
    }
}

/// What a keepalive check did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum KeepaliveAction {
    None,
    Pinged,
    /// A ping went unanswered too long; the connection is being closed.
    TimedOut,
}

/// Why a connection was torn down.
#[derive(Debug)]
enum CloseReason {
    Requested,
    PeerClosed,
    Io(std::io::Error),
    Corrupt(ProtocolError),
    UnknownId(u32),
    ErrorPayload { id: u32, len: usize },
    WriteFailed,
}

impl CloseReason {
    fn is_error(&self) -> bool {
        !matches!(self, Self::Requested)
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Requested => f.write_str("closed by the client"),
            Self::PeerClosed => f.write_str("server closed the connection"),
            Self::Io(err) => write!(f, "read failed: {err}"),
            Self::Corrupt(err) => write!(f, "invalid response: {err}"),
            Self::UnknownId(id) => write!(f, "response for unknown request id {id}"),
            Self::ErrorPayload { id, len } => {
                write!(f, "error response for request {id} carries {len} payload bytes")
            }
            Self::WriteFailed => f.write_str("write failed"),
        }
    }
}

/// Message waiting to be packed by the flush task.
struct Outgoing {
    id: u32,
    kind: u8,
    message: Box<dyn Any + Send>,
}

/// One established connection.
struct Link {
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<Outgoing>,
    closed: AtomicBool,
    /// Serializes the flush task's slot bookkeeping with the disconnect
    /// fan-out. Callers never take it.
    finalize: Mutex<()>,
    close: watch::Sender<bool>,
}

impl Link {
    fn new(peer: SocketAddr, outbox: mpsc::UnboundedSender<Outgoing>) -> Self {
        Self {
            peer,
            outbox,
            closed: AtomicBool::new(false),
            finalize: Mutex::new(()),
            close: watch::Sender::new(false),
        }
    }

    fn lock_finalize(&self) -> MutexGuard<'_, ()> {
        self.finalize.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Marks a written batch as sent. After teardown the fan-out already
    /// resolved these slots.
    fn finalize(&self, slots: &SlotTable, ids: &[u32]) {
        let _guard = self.lock_finalize();
        if self.is_closed() {
            return;
        }
        for slot in ids.iter().filter_map(|&id| slots.get(id)) {
            slot.mark_sent();
        }
    }

    /// Resolves requests of this connection with `error`. Once torn down the
    /// ids may already belong to requests of a newer connection, so nothing
    /// is touched.
    fn fail(&self, slots: &SlotTable, ids: &[u32], error: CallError) {
        let _guard = self.lock_finalize();
        if self.is_closed() {
            return;
        }
        for slot in ids.iter().filter_map(|&id| slots.get(id)) {
            slot.fail(error);
        }
    }

    /// Marks the connection closed and resolves every pending request.
    fn shut(&self, slots: &SlotTable) -> usize {
        let _guard = self.lock_finalize();
        self.closed.store(true, Ordering::Release);
        slots.fail_pending(CallError::ConnectionClosed)
    }
}

pub(crate) struct ClientInner {
    id: u64,
    catalog: Arc<Catalog>,
    config: ClientConfig,
    logger: SharedErrorLogger,
    slots: Arc<SlotTable>,
    state: AtomicU8,
    link: ArcSwapOption<Link>,
    clock: Instant,
    last_activity_ms: AtomicU64,
    ping_sent_ms: AtomicU64,
}

/// Multiplexes concurrent requests over one TCP connection.
///
/// ```rust,no_run
/// use slotwire_client::{Client, ClientConfig};
/// use slotwire_core::default_error_logger;
/// use slotwire_protocol::{Catalog, wire_message};
///
/// wire_message! {
///     pub struct Add { pub a: i32, pub b: i32 }
/// }
/// wire_message! {
///     pub struct Added { pub sum: i32 }
/// }
///
/// # async fn run() -> Result<(), Box<dyn std::error::Error>> {
/// let catalog = Catalog::builder().request::<Add>().response::<Added>().build()?;
/// let client = Client::new(catalog, ClientConfig::default(), default_error_logger())?;
/// client.connect("127.0.0.1:7000").await?;
///
/// let added: Added = client.send_request(Add { a: 2, b: 3 }).await?;
/// assert_eq!(added.sum, 5);
/// # Ok(())
/// # }
/// ```
///
/// Dropping the client closes its connection.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Creates a disconnected client. Clients made by a
    /// [`ClientManager`](crate::ClientManager) also get keepalive pings.
    pub fn new(
        catalog: Arc<Catalog>,
        config: ClientConfig,
        logger: SharedErrorLogger,
    ) -> ClientResult<Self> {
        Self::with_id(0, catalog, config, logger)
    }

    pub(crate) fn with_id(
        id: u64,
        catalog: Arc<Catalog>,
        config: ClientConfig,
        logger: SharedErrorLogger,
    ) -> ClientResult<Self> {
        config.validate()?;
        let slots = Arc::new(SlotTable::new(config.max_concurrent_requests));
        Ok(Self {
            inner: Arc::new(ClientInner {
                id,
                catalog,
                config,
                logger,
                slots,
                state: AtomicU8::new(ConnectionState::Disconnected as u8),
                link: ArcSwapOption::empty(),
                clock: Instant::now(),
                last_activity_ms: AtomicU64::new(0),
                ping_sent_ms: AtomicU64::new(0),
            }),
        })
    }

    pub(crate) fn downgrade(&self) -> Weak<ClientInner> {
        Arc::downgrade(&self.inner)
    }

    /// Id assigned by the manager; 0 for standalone clients.
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.inner.connection_state()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.inner.catalog
    }

    /// Address of the connected server.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.current_link().map(|link| link.peer)
    }

    /// Time since data was last received.
    pub fn idle_time(&self) -> Duration {
        Duration::from_millis(self.inner.idle_ms())
    }

    /// Requests awaiting their response or their caller, keepalive included.
    pub fn pending_requests(&self) -> usize {
        self.inner.slots.occupied()
    }

    /// Opens the connection.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectInProgress`] unless the client is
    /// disconnected. A failed attempt is also reported to the error logger and
    /// leaves the client disconnected, ready for another try.
    pub async fn connect<A>(&self, addr: A) -> ClientResult<()>
    where
        A: ToSocketAddrs + fmt::Display,
    {
        let inner = &self.inner;
        if !inner.transition(ConnectionState::Disconnected, ConnectionState::Connecting) {
            return Err(ClientError::ConnectInProgress);
        }
        let mut attempt = ConnectAttempt {
            inner,
            finished: false,
        };

        let addr_text = addr.to_string();
        let connected = match TcpStream::connect(addr).await {
            Ok(stream) => inner.attach(stream),
            Err(err) => Err(err),
        };
        attempt.finished = true;

        match connected {
            Ok(peer) => {
                info!(client = inner.id, %peer, "connected");
                Ok(())
            }
            Err(err) => {
                inner.logger.error(&format!(
                    "client {} could not connect to {addr_text}: {err}",
                    inner.id
                ));
                inner.set_state(ConnectionState::Disconnected);
                Err(ClientError::Connect {
                    addr: addr_text,
                    source: err,
                })
            }
        }
    }

    /// Closes the connection. Pending requests resolve with
    /// `ConnectionClosed` once the connection's tasks wind down.
    ///
    /// Returns false if there was no connection.
    pub fn close_connection(&self) -> bool {
        self.inner.close_connection()
    }

    /// Sends `request` and resolves with its response.
    ///
    /// The future resolves right away with `RequestQueueOverflow` if the
    /// next slot is still occupied, and with `ConnectionClosed` if the client
    /// is not connected. Request or response types missing from the catalog
    /// resolve with `InternalError`.
    pub fn send_request<Req, Resp>(&self, request: Req) -> ResponseFuture<Resp>
    where
        Req: Wire,
        Resp: Wire,
    {
        let inner = &self.inner;
        let kinds = inner
            .catalog
            .requests()
            .kind_of::<Req>()
            .and_then(|kind| Ok((kind, inner.catalog.responses().kind_of::<Resp>()?)));
        let (kind, expected) = match kinds {
            Ok(kinds) => kinds,
            Err(err) => {
                inner.logger.fatal(&format!(
                    "client {} cannot send {}: {err}",
                    inner.id,
                    type_name::<Req>()
                ));
                return ResponseFuture::failed(CallError::InternalError);
            }
        };

        let id = inner.slots.next_user_id();
        let Some(slot) = inner.slots.get(id) else {
            return ResponseFuture::failed(CallError::InternalError);
        };
        if !slot.reserve(expected) {
            trace!(client = inner.id, id, "slot busy");
            return ResponseFuture::failed(CallError::RequestQueueOverflow);
        }

        let future = ResponseFuture::waiting(Arc::clone(&inner.slots), id);
        inner.enqueue(
            Some(slot),
            Outgoing {
                id,
                kind,
                message: Box::new(request),
            },
        );
        future
    }

    /// Sends `request` with the no-response id; the server's answer is
    /// ignored.
    ///
    /// # Errors
    ///
    /// `InternalError` if the type is not in the catalog, `ConnectionClosed`
    /// if the client is not connected. Pack failures happen later and only
    /// reach the error logger.
    pub fn send_request_without_response<Req: Wire>(&self, request: Req) -> Result<(), CallError> {
        let inner = &self.inner;
        let kind = inner.catalog.requests().kind_of::<Req>().map_err(|err| {
            inner.logger.fatal(&format!(
                "client {} cannot send {}: {err}",
                inner.id,
                type_name::<Req>()
            ));
            CallError::InternalError
        })?;
        if inner.enqueue(
            None,
            Outgoing {
                id: NO_RESPONSE_ID,
                kind,
                message: Box::new(request),
            },
        ) {
            Ok(())
        } else {
            Err(CallError::ConnectionClosed)
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.close_connection();
    }
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.inner.id)
            .field("state", &self.inner.connection_state())
            .field("slots", &self.inner.slots.user_slots())
            .finish()
    }
}

/// Puts the client back to `Disconnected` if `connect` is abandoned midway.
struct ConnectAttempt<'a> {
    inner: &'a ClientInner,
    finished: bool,
}

impl Drop for ConnectAttempt<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.inner.set_state(ConnectionState::Disconnected);
        }
    }
}

impl ClientInner {
    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn transition(&self, from: ConnectionState, to: ConnectionState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn current_link(&self) -> Option<Arc<Link>> {
        self.link.load_full()
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.clock.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn touch(&self) {
        self.last_activity_ms.store(self.now_ms(), Ordering::Release);
    }

    fn idle_ms(&self) -> u64 {
        self.now_ms()
            .saturating_sub(self.last_activity_ms.load(Ordering::Acquire))
    }

    fn close_connection(&self) -> bool {
        match self.current_link() {
            Some(link) => {
                link.close.send_replace(true);
                true
            }
            None => false,
        }
    }

    /// Starts the connection's tasks and marks the client connected.
    fn attach(self: &Arc<Self>, stream: TcpStream) -> std::io::Result<SocketAddr> {
        stream.set_nodelay(self.config.nodelay)?;
        let peer = stream.peer_addr()?;
        let (read_half, write_half) = stream.into_split();
        let (outbox, queue) = mpsc::unbounded_channel();
        let link = Arc::new(Link::new(peer, outbox));
        let close_rx = link.close.subscribe();
        self.link.store(Some(Arc::clone(&link)));
        self.touch();
        self.set_state(ConnectionState::Connected);

        tokio::spawn(run_link(
            Arc::clone(self),
            link,
            read_half,
            write_half,
            queue,
            close_rx,
        ));
        Ok(peer)
    }

    /// Hands a message to the current connection's flush task.
    ///
    /// When that is impossible the slot, if any, resolves with
    /// `ConnectionClosed` and false is returned.
    fn enqueue(&self, slot: Option<&Slot>, outgoing: Outgoing) -> bool {
        let queued = match &*self.link.load() {
            // A link closed after the send still runs its fan-out, unless
            // that already happened; resolving here covers both.
            Some(link) => link.outbox.send(outgoing).is_ok() && !link.is_closed(),
            None => false,
        };
        if !queued && let Some(slot) = slot {
            slot.fail(CallError::ConnectionClosed);
        }
        queued
    }

    /// Sends a ping or closes a connection whose ping went unanswered.
    pub(crate) fn check_keepalive(&self, settings: &KeepaliveSettings) -> KeepaliveAction {
        if self.connection_state() != ConnectionState::Connected {
            return KeepaliveAction::None;
        }

        if self.slots.ping().state() != SlotState::Idle {
            let outstanding = Duration::from_millis(
                self.now_ms()
                    .saturating_sub(self.ping_sent_ms.load(Ordering::Acquire)),
            );
            if outstanding <= settings.timeout() {
                return KeepaliveAction::None;
            }
            self.logger.error(&format!(
                "client {}: keepalive ping unanswered for {} ms, closing connection",
                self.id,
                outstanding.as_millis()
            ));
            self.close_connection();
            return KeepaliveAction::TimedOut;
        }

        if Duration::from_millis(self.idle_ms()) > settings.idle() && self.send_ping() {
            KeepaliveAction::Pinged
        } else {
            KeepaliveAction::None
        }
    }

    fn send_ping(&self) -> bool {
        let ping = self.slots.ping();
        if !ping.reserve_detached(self.catalog.responses().ping_kind()) {
            return false;
        }
        self.ping_sent_ms.store(self.now_ms(), Ordering::Release);
        trace!(client = self.id, "keepalive ping");
        self.enqueue(
            Some(ping),
            Outgoing {
                id: self.slots.ping_id(),
                kind: self.catalog.requests().ping_kind(),
                message: Box::new(Ping {}),
            },
        )
    }

    /// Appends one request to the batch. A request that cannot be packed
    /// resolves its caller with `InternalError` and is not sent.
    fn encode(
        &self,
        link: &Link,
        batch: &mut FrameWriter<RequestHeader>,
        ids: &mut Vec<u32>,
        outgoing: Outgoing,
    ) {
        let Outgoing { id, kind, message } = outgoing;
        let requests = self.catalog.requests();
        match batch.push(RequestHeader::new(id, kind), |w| {
            requests.pack(kind, &*message, w)
        }) {
            Ok(()) => {
                if id != NO_RESPONSE_ID {
                    ids.push(id);
                }
            }
            Err(err) => {
                self.logger.fatal(&format!(
                    "client {}: could not pack {} for request {id}: {err}",
                    self.id,
                    requests.name_of(kind).unwrap_or("?")
                ));
                link.fail(&self.slots, &[id], CallError::InternalError);
            }
        }
    }

    async fn read_responses(&self, mut read_half: OwnedReadHalf) -> CloseReason {
        let mut frames = FrameReader::<ResponseHeader>::new();
        loop {
            match read_half.read_buf(frames.read_buf()).await {
                Ok(0) => return CloseReason::PeerClosed,
                Ok(_) => self.touch(),
                Err(err) => return CloseReason::Io(err),
            }
            loop {
                match frames.next_frame() {
                    Ok(Some(frame)) => {
                        if let Err(reason) = self.deliver(frame) {
                            return reason;
                        }
                    }
                    Ok(None) => break,
                    Err(err) => return CloseReason::Corrupt(err),
                }
            }
        }
    }

    fn deliver(&self, frame: Frame<ResponseHeader>) -> Result<(), CloseReason> {
        let ResponseHeader { id, kind, status, .. } = frame.header;
        if id == NO_RESPONSE_ID {
            trace!(client = self.id, kind, %status, "ignoring response to a request sent without response");
            return Ok(());
        }
        let slot = self.slots.get(id).ok_or(CloseReason::UnknownId(id))?;

        if let Ok(error) = CallError::try_from(status) {
            if !frame.payload.is_empty() {
                return Err(CloseReason::ErrorPayload {
                    id,
                    len: frame.payload.len(),
                });
            }
            if !slot.fail(error) {
                debug!(client = self.id, id, %status, "error response for an idle slot");
            }
            return Ok(());
        }

        let responses = self.catalog.responses();
        let message = responses
            .decode(kind, &frame.payload)
            .map_err(CloseReason::Corrupt)?;
        match slot.complete(kind, message) {
            Completion::Resolved => {}
            Completion::WrongKind { expected } => self.logger.fatal(&format!(
                "client {}: request {id} expected {} but the response is {}",
                self.id,
                responses.name_of(expected).unwrap_or("?"),
                responses.name_of(kind).unwrap_or("?")
            )),
            Completion::NotPending => {
                debug!(client = self.id, id, "response for an idle slot");
            }
        }
        Ok(())
    }

    /// Resolves every pending request and forgets the link.
    fn teardown(&self, link: &Arc<Link>, reason: CloseReason) {
        let resolved = link.shut(&self.slots);
        // A newer connection may already have replaced this one.
        let current = Some(Arc::clone(link));
        let _ = self.link.compare_and_swap(&current, None::<Arc<Link>>);
        self.set_state(ConnectionState::Disconnected);

        if reason.is_error() {
            self.logger.error(&format!(
                "client {}: connection to {} closed: {reason}",
                self.id, link.peer
            ));
        }
        debug!(client = self.id, peer = %link.peer, %reason, resolved, "disconnected");
    }
}

async fn run_link(
    inner: Arc<ClientInner>,
    link: Arc<Link>,
    read_half: OwnedReadHalf,
    write_half: OwnedWriteHalf,
    queue: mpsc::UnboundedReceiver<Outgoing>,
    close_rx: watch::Receiver<bool>,
) {
    let mut flush = tokio::spawn(flush_requests(
        Arc::clone(&inner),
        Arc::clone(&link),
        queue,
        write_half,
    ));

    let reason = tokio::select! {
        reason = inner.read_responses(read_half) => reason,
        _ = &mut flush => CloseReason::WriteFailed,
        () = wait_closed(close_rx) => CloseReason::Requested,
    };

    flush.abort();
    inner.teardown(&link, reason);
}

async fn flush_requests<W>(
    inner: Arc<ClientInner>,
    link: Arc<Link>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut writer: W,
) where
    W: AsyncWrite + Unpin,
{
    let mut batch = FrameWriter::<RequestHeader>::new();
    let mut ids = Vec::new();
    let mut budget = FlushBudget::new(inner.config.flush_budget);

    loop {
        let first = match queue.try_recv() {
            Ok(outgoing) => outgoing,
            Err(mpsc::error::TryRecvError::Empty) => {
                budget.reset();
                match queue.recv().await {
                    Some(outgoing) => outgoing,
                    None => return,
                }
            }
            Err(mpsc::error::TryRecvError::Disconnected) => return,
        };

        inner.encode(&link, &mut batch, &mut ids, first);
        while !batch.is_full() {
            match queue.try_recv() {
                Ok(outgoing) => inner.encode(&link, &mut batch, &mut ids, outgoing),
                Err(_) => break,
            }
        }
        if batch.is_empty() {
            continue;
        }

        if let Err(err) = writer.write_all(batch.as_bytes()).await {
            debug!(client = inner.id, peer = %link.peer, error = %err, "request write failed");
            link.fail(&inner.slots, &ids, CallError::ConnectionClosed);
            return;
        }
        link.finalize(&inner.slots, &ids);
        ids.clear();
        batch.clear();

        if budget.spend() {
            tokio::task::yield_now().await;
        }
    }
}

async fn wait_closed(mut close_rx: watch::Receiver<bool>) {
    loop {
        if *close_rx.borrow_and_update() {
            return;
        }
        if close_rx.changed().await.is_err() {
            return;
        }
    }
}
