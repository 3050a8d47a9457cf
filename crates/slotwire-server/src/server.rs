//! TCP listener and accept loop.

use std::any::{Any, type_name};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use slotwire_core::SharedErrorLogger;
use slotwire_protocol::{Catalog, Wire};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::connection;
use crate::error::{ServerError, ServerResult};
use crate::handler::HandlerTable;
use crate::responder::Responder;

/// Pause after a failed `accept` so a persistent error does not spin.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// State shared by the server, its accept loop and every connection.
pub(crate) struct ServerShared {
    pub(crate) catalog: Arc<Catalog>,
    pub(crate) config: ServerConfig,
    pub(crate) logger: SharedErrorLogger,
    pub(crate) handlers: HandlerTable,
    epoch: watch::Sender<u64>,
}

impl ServerShared {
    /// Starts a new listen generation and returns its number.
    fn bump_epoch(&self) -> u64 {
        let mut current = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            current = *epoch;
        });
        current
    }

    pub(crate) fn subscribe_epoch(&self) -> watch::Receiver<u64> {
        self.epoch.subscribe()
    }
}

struct Listening {
    addr: SocketAddr,
    accept: JoinHandle<()>,
}

/// Request dispatcher listening on a TCP port.
///
/// ```rust,no_run
/// use slotwire_core::default_error_logger;
/// use slotwire_protocol::{Catalog, wire_message};
/// use slotwire_server::{Server, ServerConfig};
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
/// let server = Server::new(catalog, ServerConfig::default(), default_error_logger())?;
/// server.set_handler(|request: Add, responder| {
///     responder.send(Added { sum: request.a + request.b });
/// })?;
/// assert!(server.listen(7000, 32).await);
/// # Ok(())
/// # }
/// ```
pub struct Server {
    shared: Arc<ServerShared>,
    listening: Mutex<Option<Listening>>,
}

impl Server {
    /// Creates a server for `catalog`. The keepalive handler is registered
    /// here; every other request type needs [`set_handler`](Self::set_handler).
    pub fn new(
        catalog: Arc<Catalog>,
        config: ServerConfig,
        logger: SharedErrorLogger,
    ) -> ServerResult<Self> {
        config.validate()?;
        let handlers = HandlerTable::new(catalog.requests());
        let (epoch, _) = watch::channel(0);
        Ok(Self {
            shared: Arc::new(ServerShared {
                catalog,
                config,
                logger,
                handlers,
                epoch,
            }),
            listening: Mutex::new(None),
        })
    }

    /// Registers the handler for request type `T`.
    ///
    /// The handler runs on the connection's read task and must answer
    /// through the [`Responder`], either right away or after moving it to
    /// another task.
    ///
    /// # Errors
    ///
    /// Fails if `T` is not a request type of the catalog or already has a
    /// handler.
    pub fn set_handler<T, F>(&self, handler: F) -> ServerResult<()>
    where
        T: Wire,
        F: Fn(T, Responder) + Send + Sync + 'static,
    {
        let kind = self.shared.catalog.requests().kind_of::<T>()?;
        let name = type_name::<T>();
        self.shared.handlers.register(
            kind,
            name,
            Box::new(move |message: Box<dyn Any + Send>, responder: Responder| {
                match message.downcast::<T>() {
                    Ok(message) => handler(*message, responder),
                    Err(_) => responder.internal_error(),
                }
            }),
        )?;
        debug!(kind, name, "handler registered");
        Ok(())
    }

    /// Binds `0.0.0.0:port` and starts accepting connections.
    ///
    /// Returns `false` (after logging the cause) if the server is already
    /// listening or the socket cannot be bound, so the caller can retry on
    /// another port. Connections accepted under a previous `listen` are
    /// closed.
    pub async fn listen(&self, port: u16, backlog: u32) -> bool {
        match self.try_listen(port, backlog) {
            Ok(addr) => {
                info!(%addr, backlog, "server listening");
                true
            }
            Err(err) => {
                self.shared
                    .logger
                    .error(&format!("could not listen on port {port}: {err}"));
                false
            }
        }
    }

    fn try_listen(&self, port: u16, backlog: u32) -> ServerResult<SocketAddr> {
        let mut listening = self.lock_listening();
        if let Some(active) = listening.as_ref() {
            return Err(ServerError::AlreadyListening { addr: active.addr });
        }

        let socket = TcpSocket::new_v4()?;
        socket.set_reuseaddr(true)?;
        socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))?;
        let listener = socket.listen(backlog)?;
        let addr = listener.local_addr()?;

        let epoch = self.shared.bump_epoch();
        let accept = tokio::spawn(accept_loop(Arc::clone(&self.shared), listener, epoch));
        *listening = Some(Listening { addr, accept });
        Ok(addr)
    }

    /// Closes the listener and every connection it accepted.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::NotListening`] when there is no listener.
    pub fn stop(&self) -> ServerResult<()> {
        let listening = self.lock_listening().take().ok_or(ServerError::NotListening)?;
        listening.accept.abort();
        self.shared.bump_epoch();
        info!(addr = %listening.addr, "server stopped");
        Ok(())
    }

    /// Address of the active listener.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.lock_listening().as_ref().map(|active| active.addr)
    }

    pub fn is_listening(&self) -> bool {
        self.lock_listening().is_some()
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.shared.catalog
    }

    fn lock_listening(&self) -> MutexGuard<'_, Option<Listening>> {
        self.listening.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if let Some(listening) = self.lock_listening().take() {
            listening.accept.abort();
            self.shared.bump_epoch();
            debug!(addr = %listening.addr, "listener closed on drop");
        }
    }
}

async fn accept_loop(shared: Arc<ServerShared>, listener: TcpListener, epoch: u64) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                if let Err(err) = stream.set_nodelay(shared.config.nodelay) {
                    warn!(%peer, error = %err, "failed to set TCP_NODELAY");
                }
                debug!(%peer, epoch, "accepted connection");
                tokio::spawn(connection::serve(Arc::clone(&shared), stream, peer, epoch));
            }
            Err(err) => {
                shared.logger.error(&format!("accept failed: {err}"));
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}
