//! Client manager and keepalive loop.
//!
//! The manager creates clients and runs one background task that, every
//! tick, looks at each live client:
//! - idle longer than the keepalive time with no ping outstanding: send a ping
//! - ping outstanding longer than the connection timeout: close the connection
//!
//! Closing resolves the client's pending requests with `ConnectionClosed`
//! through the normal disconnect path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use slotwire_core::SharedErrorLogger;
use slotwire_protocol::Catalog;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::client::{Client, ClientInner, KeepaliveAction};
use crate::config::{ClientConfig, KeepaliveSettings};
use crate::error::ClientResult;

type ClientList = Arc<Mutex<Vec<Weak<ClientInner>>>>;

/// Commands that can be sent to the keepalive loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepaliveCommand {
    /// Check every client now instead of waiting for the next tick.
    CheckNow,
    /// Stop the loop.
    Stop,
}

/// Outcome of one pass over the clients.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct KeepaliveReport {
    pub clients: usize,
    pub pinged: usize,
    pub timed_out: usize,
}

/// Creates clients and keeps their connections alive.
///
/// Must be created inside a tokio runtime. The keepalive task stops when
/// the manager is dropped; clients already created keep working without
/// pings.
pub struct ClientManager {
    config: ClientConfig,
    logger: SharedErrorLogger,
    clients: ClientList,
    next_id: AtomicU64,
    command_tx: mpsc::Sender<KeepaliveCommand>,
    task: JoinHandle<()>,
}

impl ClientManager {
    pub fn new(config: ClientConfig, logger: SharedErrorLogger) -> ClientResult<Self> {
        config.validate()?;
        let (command_tx, command_rx) = mpsc::channel(16);
        let clients = ClientList::default();
        let task = tokio::spawn(run(
            config.keepalive.clone(),
            Arc::clone(&clients),
            command_rx,
        ));
        info!(
            idle_ms = config.keepalive.idle_ms,
            timeout_ms = config.keepalive.timeout_ms,
            "keepalive started"
        );
        Ok(Self {
            config,
            logger,
            clients,
            next_id: AtomicU64::new(1),
            command_tx,
            task,
        })
    }

    /// Creates a disconnected client with the next id.
    pub fn create_client(&self, catalog: Arc<Catalog>) -> ClientResult<Client> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let client = Client::with_id(id, catalog, self.config.clone(), Arc::clone(&self.logger))?;
        lock(&self.clients).push(client.downgrade());
        debug!(client = id, "client created");
        Ok(client)
    }

    /// Clients that have not been dropped yet.
    pub fn client_count(&self) -> usize {
        lock(&self.clients)
            .iter()
            .filter(|client| client.strong_count() > 0)
            .count()
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Triggers an immediate keepalive pass. False if the loop has stopped.
    pub async fn check_now(&self) -> bool {
        self.command_tx.send(KeepaliveCommand::CheckNow).await.is_ok()
    }

    /// Stops the keepalive loop. False if it had already stopped.
    pub async fn stop(&self) -> bool {
        self.command_tx.send(KeepaliveCommand::Stop).await.is_ok()
    }
}

impl Drop for ClientManager {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl std::fmt::Debug for ClientManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientManager")
            .field("clients", &self.client_count())
            .field("keepalive", &self.config.keepalive)
            .finish()
    }
}

fn lock(clients: &ClientList) -> MutexGuard<'_, Vec<Weak<ClientInner>>> {
    clients.lock().unwrap_or_else(PoisonError::into_inner)
}

async fn run(
    settings: KeepaliveSettings,
    clients: ClientList,
    mut command_rx: mpsc::Receiver<KeepaliveCommand>,
) {
    let mut ticker = tokio::time::interval(settings.tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                check_clients(&settings, &clients);
            }
            command = command_rx.recv() => {
                match command {
                    Some(KeepaliveCommand::CheckNow) => {
                        debug!("keepalive check requested");
                        check_clients(&settings, &clients);
                    }
                    Some(KeepaliveCommand::Stop) | None => {
                        info!("keepalive stopping");
                        break;
                    }
                }
            }
        }
    }
}

/// One keepalive pass. Dropped clients are forgotten here.
fn check_clients(settings: &KeepaliveSettings, clients: &ClientList) -> KeepaliveReport {
    let live: Vec<Arc<ClientInner>> = {
        let mut clients = lock(clients);
        clients.retain(|client| client.strong_count() > 0);
        clients.iter().filter_map(Weak::upgrade).collect()
    };

    let mut report = KeepaliveReport {
        clients: live.len(),
        ..KeepaliveReport::default()
    };
    for client in &live {
        match client.check_keepalive(settings) {
            KeepaliveAction::None => {}
            KeepaliveAction::Pinged => report.pinged += 1,
            KeepaliveAction::TimedOut => {
                debug!(client = client.id(), "keepalive timeout");
                report.timed_out += 1;
            }
        }
    }
    if report.pinged > 0 || report.timed_out > 0 {
        debug!(
            clients = report.clients,
            pinged = report.pinged,
            timed_out = report.timed_out,
            "keepalive pass"
        );
    }
    report
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use slotwire_core::CollectingLogger;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    use crate::client::ConnectionState;

    fn fast_config() -> ClientConfig {
        ClientConfig::default()
            .with_max_concurrent_requests(4)
            .with_keepalive(Duration::from_millis(30), Duration::from_millis(60))
            .with_keepalive_tick(Duration::from_secs(3600))
    }

    fn empty_catalog() -> Arc<Catalog> {
        Catalog::builder().build().unwrap()
    }

    #[tokio::test]
    async fn ids_are_sequential_and_dropped_clients_are_forgotten() {
        let manager = ClientManager::new(fast_config(), Arc::new(CollectingLogger::new())).unwrap();
        let first = manager.create_client(empty_catalog()).unwrap();
        let second = manager.create_client(empty_catalog()).unwrap();
        assert_eq!((first.id(), second.id()), (1, 2));
        assert_eq!(manager.client_count(), 2);

        drop(first);
        assert_eq!(manager.client_count(), 1);
        let report = check_clients(&manager.config().keepalive, &manager.clients);
        assert_eq!(report.clients, 1);
        assert_eq!(lock(&manager.clients).len(), 1);
    }

    #[tokio::test]
    async fn disconnected_clients_are_left_alone() {
        let manager = ClientManager::new(fast_config(), Arc::new(CollectingLogger::new())).unwrap();
        let _client = manager.create_client(empty_catalog()).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        let report = check_clients(&manager.config().keepalive, &manager.clients);
        assert_eq!(report, KeepaliveReport { clients: 1, pinged: 0, timed_out: 0 });
    }

    #[tokio::test]
    async fn idle_client_is_pinged_then_closed_when_unanswered() {
        let logger = Arc::new(CollectingLogger::new());
        let manager = ClientManager::new(fast_config(), logger.clone()).unwrap();
        let client = manager.create_client(empty_catalog()).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        client.connect(listener.local_addr().unwrap()).await.unwrap();
        let (mut silent_peer, _) = listener.accept().await.unwrap();
        let settings = manager.config().keepalive.clone();

        // Not idle long enough yet.
        assert_eq!(check_clients(&settings, &manager.clients).pinged, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(check_clients(&settings, &manager.clients).pinged, 1);

        // The ping reaches the peer: a 7 byte header, empty payload.
        let mut header = [0u8; 7];
        silent_peer.read_exact(&mut header).await.unwrap();
        assert_eq!(&header[0..4], &4u32.to_le_bytes());
        assert_eq!(&header[5..7], &[0, 0]);

        // Outstanding but not overdue.
        assert_eq!(check_clients(&settings, &manager.clients), KeepaliveReport {
            clients: 1,
            pinged: 0,
            timed_out: 0,
        });

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(check_clients(&settings, &manager.clients).timed_out, 1);

        tokio::time::timeout(Duration::from_secs(5), async {
            while client.connection_state() != ConnectionState::Disconnected {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(logger.contains("keepalive ping unanswered"));
    }

    #[tokio::test]
    async fn commands_reach_the_loop() {
        let manager = ClientManager::new(fast_config(), Arc::new(CollectingLogger::new())).unwrap();
        assert!(manager.check_now().await);
        assert!(manager.stop().await);

        tokio::time::timeout(Duration::from_secs(5), async {
            while !manager.task.is_finished() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
        assert!(!manager.check_now().await);
    }
}
