//! Incoming connection: request reassembly, dispatch and response batching.
//!
//! Each accepted socket runs two tasks. The read side reassembles request
//! frames, enforces the concurrency cap and calls handlers inline. The flush
//! task owns the response queue receiver and writes replies out in batches;
//! after each batch the in-flight counter drops by the number of replies it
//! carried.

use std::any::Any;
use std::fmt;
use std::net::SocketAddr;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use slotwire_core::{FlushBudget, SharedErrorLogger};
use slotwire_protocol::{
    Catalog, Frame, FrameReader, FrameWriter, ProtocolError, RequestHeader, ResponseHeader,
    StatusCode,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tracing::{debug, instrument};

use crate::responder::{Outgoing, Reply, Responder};
use crate::server::ServerShared;

/// Why a connection was torn down.
#[derive(Debug)]
enum CloseReason {
    PeerClosed,
    Io(std::io::Error),
    Corrupt(ProtocolError),
    NoHandler(u8),
    Overloaded { limit: usize },
    WriteFailed,
    Stale,
}

impl CloseReason {
    /// Conditions the peer or the server operator should hear about.
    fn is_error(&self) -> bool {
        matches!(
            self,
            Self::Corrupt(_) | Self::NoHandler(_) | Self::Overloaded { .. }
        )
    }
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerClosed => f.write_str("peer closed the connection"),
            Self::Io(err) => write!(f, "read failed: {err}"),
            Self::Corrupt(err) => write!(f, "invalid request: {err}"),
            Self::NoHandler(kind) => write!(f, "no handler for request kind {kind}"),
            Self::Overloaded { limit } => {
                write!(f, "exceeded limit of {limit} concurrent requests")
            }
            Self::WriteFailed => f.write_str("write failed"),
            Self::Stale => f.write_str("listener generation ended"),
        }
    }
}

/// State shared by a connection's tasks and the responders it hands out.
pub(crate) struct ConnectionContext {
    shared: Arc<ServerShared>,
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<Outgoing>,
    in_flight: AtomicUsize,
}

impl ConnectionContext {
    pub(crate) fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn catalog(&self) -> &Catalog {
        &self.shared.catalog
    }

    pub(crate) fn logger(&self) -> &SharedErrorLogger {
        &self.shared.logger
    }

    /// Queues a reply; false once the flush task is gone.
    pub(crate) fn enqueue(&self, outgoing: Outgoing) -> bool {
        self.outbox.send(outgoing).is_ok()
    }

    #[instrument(level = "trace", skip_all, fields(peer = %self.peer, id = frame.header.id, kind = frame.header.kind))]
    fn dispatch(self: &Arc<Self>, frame: Frame<RequestHeader>) -> Result<(), CloseReason> {
        let RequestHeader { id, kind, .. } = frame.header;

        let message = self
            .catalog()
            .requests()
            .decode(kind, &frame.payload)
            .map_err(CloseReason::Corrupt)?;

        let handler = self
            .shared
            .handlers
            .get(kind)
            .ok_or(CloseReason::NoHandler(kind))?;

        let limit = self.shared.config.max_concurrent_requests;
        if self.in_flight.fetch_add(1, Ordering::AcqRel) + 1 > limit {
            return Err(CloseReason::Overloaded { limit });
        }

        let responder = Responder::new(id, Arc::clone(self));
        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| handler(message, responder))) {
            self.logger().fatal(&format!(
                "handler for {} panicked on request {id} from {}: {}",
                self.catalog().requests().name_of(kind).unwrap_or("?"),
                self.peer,
                panic_message(panic.as_ref())
            ));
        }
        Ok(())
    }

    /// Appends one reply to the batch; a reply that cannot be packed is
    /// replaced by `RemoteServiceInternalError` for the same id.
    fn encode(&self, batch: &mut FrameWriter<ResponseHeader>, outgoing: Outgoing) {
        let Outgoing { id, reply } = outgoing;
        match reply {
            Reply::Success { kind, message } => {
                let responses = self.catalog().responses();
                let packed = batch.push(ResponseHeader::success(id, kind), |w| {
                    responses.pack(kind, &*message, w)
                });
                if let Err(err) = packed {
                    self.logger().fatal(&format!(
                        "could not pack {} for request {id} from {}: {err}",
                        responses.name_of(kind).unwrap_or("?"),
                        self.peer
                    ));
                    batch.push_empty(ResponseHeader::error(
                        id,
                        0,
                        StatusCode::RemoteServiceInternalError,
                    ));
                }
            }
            Reply::Failure(status) => batch.push_empty(ResponseHeader::error(id, 0, status)),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Runs one accepted connection until it closes.
pub(crate) async fn serve(shared: Arc<ServerShared>, stream: TcpStream, peer: SocketAddr, epoch: u64) {
    let epoch_rx = shared.subscribe_epoch();
    let flush_budget = shared.config.flush_budget;
    let (read_half, write_half) = stream.into_split();
    let (outbox, queue) = mpsc::unbounded_channel();

    let connection = Arc::new(ConnectionContext {
        shared,
        peer,
        outbox,
        in_flight: AtomicUsize::new(0),
    });

    let mut flush = tokio::spawn(flush_responses(
        Arc::clone(&connection),
        queue,
        write_half,
        flush_budget,
    ));

    let reason = tokio::select! {
        reason = read_requests(&connection, read_half) => reason,
        _ = &mut flush => CloseReason::WriteFailed,
        () = wait_stale(epoch_rx, epoch) => CloseReason::Stale,
    };

    if reason.is_error() {
        connection
            .logger()
            .error(&format!("closing connection from {peer}: {reason}"));
    } else {
        debug!(%peer, %reason, "connection closed");
    }
    flush.abort();
}

async fn read_requests(connection: &Arc<ConnectionContext>, mut read_half: OwnedReadHalf) -> CloseReason {
    let mut frames = FrameReader::<RequestHeader>::new();
    loop {
        match read_half.read_buf(frames.read_buf()).await {
            Ok(0) => return CloseReason::PeerClosed,
            Ok(_) => {}
            Err(err) => return CloseReason::Io(err),
        }
        loop {
            match frames.next_frame() {
                Ok(Some(frame)) => {
                    if let Err(reason) = connection.dispatch(frame) {
                        return reason;
                    }
                }
                Ok(None) => break,
                Err(err) => return CloseReason::Corrupt(err),
            }
        }
    }
}

async fn flush_responses(
    connection: Arc<ConnectionContext>,
    mut queue: mpsc::UnboundedReceiver<Outgoing>,
    mut write_half: OwnedWriteHalf,
    flush_budget: u32,
) {
    let mut batch = FrameWriter::<ResponseHeader>::new();
    let mut budget = FlushBudget::new(flush_budget);

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

        connection.encode(&mut batch, first);
        while !batch.is_full() {
            match queue.try_recv() {
                Ok(outgoing) => connection.encode(&mut batch, outgoing),
                Err(_) => break,
            }
        }

        if let Err(err) = write_half.write_all(batch.as_bytes()).await {
            debug!(peer = %connection.peer, error = %err, "response write failed");
            return;
        }
        connection
            .in_flight
            .fetch_sub(batch.frames(), Ordering::AcqRel);
        batch.clear();

        if budget.spend() {
            tokio::task::yield_now().await;
        }
    }
}

/// Resolves once the server moves past the listen generation `epoch`.
async fn wait_stale(mut epoch_rx: watch::Receiver<u64>, epoch: u64) {
    loop {
        if *epoch_rx.borrow_and_update() != epoch {
            return;
        }
        if epoch_rx.changed().await.is_err() {
            return;
        }
    }
}
