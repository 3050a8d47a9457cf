//! Messages and a raw frame client shared by the server tests.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use slotwire_core::CollectingLogger;
use slotwire_protocol::{
    Catalog, Frame, FrameReader, FrameWriter, RequestHeader, ResponseHeader, Wire, wire_message,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::{Server, ServerConfig};

const IO_TIMEOUT: Duration = Duration::from_secs(5);

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Echo {
        pub text: String,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Echoed {
        pub text: String,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Hold {
        pub tag: u32,
    }
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Unhandled {}
}

wire_message! {
    #[derive(Debug, Clone, PartialEq)]
    pub struct Bulk {
        pub data: Vec<u8>,
    }
}

pub fn catalog() -> Arc<Catalog> {
    Catalog::builder()
        .request::<Echo>()
        .request::<Hold>()
        .request::<Unhandled>()
        .response::<Echoed>()
        .response::<Bulk>()
        .build()
        .unwrap()
}

/// A listening server on an ephemeral port plus its log sink.
pub async fn listening_server(config: ServerConfig) -> (Server, Arc<CollectingLogger>) {
    let logger = Arc::new(CollectingLogger::new());
    let server = Server::new(catalog(), config, logger.clone()).unwrap();
    server
        .set_handler(|request: Echo, responder| {
            if request.text == "bulk" {
                responder.send(Bulk {
                    data: vec![0; 70_000],
                });
            } else {
                responder.send(Echoed { text: request.text });
            }
        })
        .unwrap();
    assert!(server.listen(0, 32).await);
    (server, logger)
}

/// Speaks the frame protocol directly over a socket.
pub struct RawClient {
    stream: TcpStream,
    frames: FrameReader<ResponseHeader>,
    catalog: Arc<Catalog>,
}

impl RawClient {
    pub async fn connect(server: &Server) -> Self {
        let port = server.local_addr().unwrap().port();
        let stream = TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
            .await
            .unwrap();
        Self {
            stream,
            frames: FrameReader::new(),
            catalog: Arc::clone(server.catalog()),
        }
    }

    pub fn frame<T: Wire>(&self, id: u32, message: &T) -> Vec<u8> {
        let kind = self.catalog.requests().kind_of::<T>().unwrap();
        let mut batch = FrameWriter::<RequestHeader>::new();
        batch
            .push(RequestHeader::new(id, kind), |w| w.write(message))
            .unwrap();
        batch.as_bytes().to_vec()
    }

    pub async fn send<T: Wire>(&mut self, id: u32, message: &T) {
        let bytes = self.frame(id, message);
        self.send_raw(&bytes).await;
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).await.unwrap();
    }

    /// Next response frame, or `None` once the server closed the socket.
    pub async fn recv(&mut self) -> Option<Frame<ResponseHeader>> {
        loop {
            if let Some(frame) = self.frames.next_frame().unwrap() {
                return Some(frame);
            }
            let read = tokio::time::timeout(IO_TIMEOUT, self.stream.read_buf(self.frames.read_buf()))
                .await
                .expect("timed out waiting for the server");
            match read {
                Ok(0) | Err(_) => return None,
                Ok(_) => {}
            }
        }
    }

    pub fn decode<T: Wire>(&self, frame: &Frame<ResponseHeader>) -> T {
        let message = self
            .catalog
            .responses()
            .decode(frame.header.kind, &frame.payload)
            .unwrap();
        *message.downcast::<T>().unwrap()
    }
}
