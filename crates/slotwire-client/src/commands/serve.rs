//! Serve command: runs the demo server in the foreground until Ctrl-C.

use slotwire_core::default_error_logger;
use slotwire_server::{Server, ServerConfig};
use tracing::info;

use crate::demo;
use crate::error::{ClientError, ClientResult};

pub async fn run(port: u16, max_concurrent: usize, backlog: u32) -> ClientResult<()> {
    let config = ServerConfig::new(max_concurrent);
    let server = Server::new(demo::catalog()?, config, default_error_logger())?;
    demo::register_handlers(&server)?;

    if !server.listen(port, backlog).await {
        return Err(ClientError::Listen { port });
    }
    if let Some(addr) = server.local_addr() {
        println!("listening on {addr} (max {max_concurrent} concurrent requests per connection)");
    }

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    server.stop()?;
    Ok(())
}
