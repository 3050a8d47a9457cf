//! Client and server talking over loopback TCP.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use slotwire_client::demo::{self, ProcessStringRequest, ProcessStringResponse};
use slotwire_client::{CallError, Client, ClientConfig, ClientManager, ConnectionState};
use slotwire_core::CollectingLogger;
use slotwire_protocol::{Catalog, wire_message};
use slotwire_server::{Responder, Server, ServerConfig};
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Hold {
        pub tag: u32,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Fail {
        pub external: bool,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Released {
        pub tag: u32,
    }
}

type Held = Arc<Mutex<Vec<(u32, Responder)>>>;

fn catalog() -> Arc<Catalog> {
    Catalog::builder()
        .request::<ProcessStringRequest>()
        .request::<Hold>()
        .request::<Fail>()
        .response::<ProcessStringResponse>()
        .response::<Released>()
        .build()
        .unwrap()
}

struct TestServer {
    server: Server,
    held: Held,
    logger: Arc<CollectingLogger>,
}

impl TestServer {
    /// Demo handler plus `Hold` (answered only on `release`) and `Fail`.
    async fn start(max_concurrent: usize) -> Self {
        let logger = Arc::new(CollectingLogger::new());
        let server = Server::new(
            catalog(),
            ServerConfig::new(max_concurrent),
            logger.clone(),
        )
        .unwrap();
        demo::register_handlers(&server).unwrap();

        let held = Held::default();
        let stash = Arc::clone(&held);
        server
            .set_handler(move |request: Hold, responder| {
                stash.lock().unwrap().push((request.tag, responder));
            })
            .unwrap();
        server
            .set_handler(|request: Fail, responder| {
                if request.external {
                    responder.external_error();
                } else {
                    responder.internal_error();
                }
            })
            .unwrap();

        assert!(server.listen(0, 32).await);
        Self {
            server,
            held,
            logger,
        }
    }

    fn addr(&self) -> String {
        let port = self.server.local_addr().unwrap().port();
        format!("127.0.0.1:{port}")
    }

    fn held_count(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    async fn wait_held(&self, count: usize) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while self.held_count() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap();
    }

    fn release(&self) {
        for (tag, responder) in self.held.lock().unwrap().drain(..) {
            responder.send(Released { tag });
        }
    }
}

async fn connected_client(server: &TestServer, slots: u32) -> (Client, Arc<CollectingLogger>) {
    let logger = Arc::new(CollectingLogger::new());
    let config = ClientConfig::default().with_max_concurrent_requests(slots);
    let client = Client::new(catalog(), config, logger.clone()).unwrap();
    client.connect(server.addr()).await.unwrap();
    (client, logger)
}

async fn wait_disconnected(client: &Client) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while client.connection_state() != ConnectionState::Disconnected {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
}

fn process(text: &str) -> ProcessStringRequest {
    ProcessStringRequest {
        source_string: text.to_string(),
    }
}

#[tokio::test]
async fn process_string_round_trip() {
    let server = TestServer::start(100).await;
    let (client, logger) = connected_client(&server, 16).await;

    let response: ProcessStringResponse = client.send_request(process("abc")).await.unwrap();
    assert_eq!(response.processed_string, "abc_processed");
    assert_eq!(client.pending_requests(), 0);
    assert!(logger.lines().is_empty());
    assert!(server.logger.lines().is_empty());
}

#[tokio::test]
async fn pipelined_requests_resolve_with_their_own_response() {
    let server = TestServer::start(1000).await;
    let (client, _) = connected_client(&server, 256).await;

    let pending: Vec<_> = (0..200)
        .map(|i| client.send_request::<_, ProcessStringResponse>(process(&format!("req{i}"))))
        .collect();
    for (i, future) in pending.into_iter().enumerate() {
        assert_eq!(future.await.unwrap().processed_string, format!("req{i}_processed"));
    }
}

#[tokio::test]
async fn pipelining_under_a_flush_budget_of_one() {
    let server = TestServer::start(1000).await;
    let config = ClientConfig::default()
        .with_max_concurrent_requests(64)
        .with_flush_budget(1);
    let client = Client::new(catalog(), config, Arc::new(CollectingLogger::new())).unwrap();
    client.connect(server.addr()).await.unwrap();

    // Large bodies force several batches per burst.
    let texts: Vec<String> = (0..48)
        .map(|i| format!("{i}-{}", "y".repeat(if i % 3 == 0 { 30_000 } else { 16 })))
        .collect();
    let pending: Vec<_> = texts
        .iter()
        .map(|text| client.send_request::<_, ProcessStringResponse>(process(text)))
        .collect();
    for (text, future) in texts.iter().zip(pending) {
        assert_eq!(future.await.unwrap().processed_string, format!("{text}_processed"));
    }
    assert_eq!(client.pending_requests(), 0);
    assert!(server.logger.lines().is_empty());
}

#[tokio::test]
async fn responses_may_arrive_out_of_order() {
    let server = TestServer::start(100).await;
    let (client, _) = connected_client(&server, 8).await;

    let held = client.send_request::<_, Released>(Hold { tag: 7 });
    server.wait_held(1).await;

    // Answered while the first request is still held.
    let quick: ProcessStringResponse = client.send_request(process("fast")).await.unwrap();
    assert_eq!(quick.processed_string, "fast_processed");

    server.release();
    assert_eq!(held.await, Ok(Released { tag: 7 }));
}

#[tokio::test]
async fn remote_failures_map_to_call_errors() {
    let server = TestServer::start(100).await;
    let (client, _) = connected_client(&server, 8).await;

    let external = client.send_request::<_, Released>(Fail { external: true }).await;
    assert_eq!(external, Err(CallError::RemoteServiceExternalError));
    let internal = client.send_request::<_, Released>(Fail { external: false }).await;
    assert_eq!(internal, Err(CallError::RemoteServiceInternalError));

    // The connection is still usable.
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    let response: ProcessStringResponse = client.send_request(process("ok")).await.unwrap();
    assert_eq!(response.processed_string, "ok_processed");
}

#[tokio::test]
async fn one_request_past_the_slot_count_overflows() {
    let server = TestServer::start(100).await;
    let (client, _) = connected_client(&server, 2).await;

    let first = client.send_request::<_, Released>(Hold { tag: 1 });
    let second = client.send_request::<_, Released>(Hold { tag: 2 });
    server.wait_held(2).await;

    let third = client.send_request::<_, Released>(Hold { tag: 3 });
    assert_eq!(third.request_id(), None);
    assert_eq!(third.await, Err(CallError::RequestQueueOverflow));

    // Nothing reached the server for the third request.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.held_count(), 2);

    server.release();
    assert_eq!(first.await, Ok(Released { tag: 1 }));
    assert_eq!(second.await, Ok(Released { tag: 2 }));

    // Both slots are free again.
    let again: ProcessStringResponse = client.send_request(process("again")).await.unwrap();
    assert_eq!(again.processed_string, "again_processed");
}

#[tokio::test]
async fn exceeding_the_server_cap_closes_every_pending_request() {
    let server = TestServer::start(2).await;
    let (client, logger) = connected_client(&server, 8).await;

    let pending: Vec<_> = (0..3)
        .map(|tag| client.send_request::<_, Released>(Hold { tag }))
        .collect();
    for future in pending {
        assert_eq!(future.await, Err(CallError::ConnectionClosed));
    }
    wait_disconnected(&client).await;
    assert!(server.logger.contains("exceeded limit of 2 concurrent requests"));
    assert!(logger.contains("closed:"));
}

#[tokio::test]
async fn killing_the_connection_resolves_each_request_once() {
    let server = TestServer::start(100).await;
    let (client, _) = connected_client(&server, 8).await;

    let pending: Vec<_> = (0..5)
        .map(|tag| client.send_request::<_, Released>(Hold { tag }))
        .collect();
    server.wait_held(5).await;
    assert_eq!(client.pending_requests(), 5);

    server.server.stop().unwrap();
    for future in pending {
        assert_eq!(future.await, Err(CallError::ConnectionClosed));
    }
    wait_disconnected(&client).await;
    assert_eq!(client.pending_requests(), 0);

    // A late answer to the dead connection goes nowhere.
    server.release();

    // The client reconnects and reuses the same slots.
    assert!(server.server.listen(0, 32).await);
    client.connect(server.addr()).await.unwrap();
    let response: ProcessStringResponse = client.send_request(process("back")).await.unwrap();
    assert_eq!(response.processed_string, "back_processed");
}

#[tokio::test]
async fn oversize_request_is_never_sent() {
    let logger = Arc::new(CollectingLogger::new());
    let client = Client::new(catalog(), ClientConfig::default(), logger.clone()).unwrap();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    client.connect(listener.local_addr().unwrap()).await.unwrap();
    let (mut peer, _) = listener.accept().await.unwrap();

    let result = client
        .send_request::<_, ProcessStringResponse>(process(&"x".repeat(70_000)))
        .await;
    assert_eq!(result, Err(CallError::InternalError));
    assert!(logger.lines().iter().any(|line| line.fatal && line.message.contains("could not pack")));

    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(Duration::from_millis(100), peer.read(&mut buf)).await;
    assert!(read.is_err(), "bytes reached the wire");
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn unexpected_response_type_is_an_internal_error() {
    let server = TestServer::start(100).await;
    let (client, logger) = connected_client(&server, 8).await;

    let result = client.send_request::<_, Released>(process("abc")).await;
    assert_eq!(result, Err(CallError::InternalError));
    assert!(logger.contains("expected"));
    assert_eq!(client.connection_state(), ConnectionState::Connected);
}

#[tokio::test]
async fn fire_and_forget_answers_are_ignored() {
    let server = TestServer::start(100).await;
    let (client, logger) = connected_client(&server, 8).await;

    client.send_request_without_response(process("ignored")).unwrap();
    let response: ProcessStringResponse = client.send_request(process("seen")).await.unwrap();
    assert_eq!(response.processed_string, "seen_processed");

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(logger.lines().is_empty());
    assert!(server.logger.lines().is_empty());
}

#[tokio::test]
async fn keepalive_pings_are_answered() {
    let server = TestServer::start(100).await;
    let logger = Arc::new(CollectingLogger::new());
    let config = ClientConfig::default()
        .with_keepalive(Duration::from_millis(20), Duration::from_millis(500))
        .with_keepalive_tick(Duration::from_millis(10));
    let manager = ClientManager::new(config, logger.clone()).unwrap();
    let client = manager.create_client(catalog()).unwrap();
    client.connect(server.addr()).await.unwrap();

    tokio::time::sleep(Duration::from_millis(300)).await;

    // Pongs keep refreshing the activity clock.
    assert_eq!(client.connection_state(), ConnectionState::Connected);
    assert!(client.idle_time() < Duration::from_millis(200));
    assert!(logger.lines().is_empty());
    assert!(server.logger.lines().is_empty());
}

#[tokio::test]
async fn keepalive_closes_a_silent_connection() {
    let logger = Arc::new(CollectingLogger::new());
    let config = ClientConfig::default()
        .with_keepalive(Duration::from_millis(20), Duration::from_millis(50))
        .with_keepalive_tick(Duration::from_millis(10));
    let manager = ClientManager::new(config, logger.clone()).unwrap();
    let client = manager.create_client(catalog()).unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    client.connect(listener.local_addr().unwrap()).await.unwrap();
    let (_silent, _) = listener.accept().await.unwrap();

    let pending = client.send_request::<_, Released>(Hold { tag: 1 });
    assert_eq!(pending.await, Err(CallError::ConnectionClosed));
    wait_disconnected(&client).await;
    assert!(logger.contains("keepalive ping unanswered"));
}
