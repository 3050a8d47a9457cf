//! Bench command: drives the demo service from many tasks over one client
//! and prints how many requests finished with each status, per second.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use slotwire_core::default_error_logger;
use slotwire_protocol::StatusCode;
use tokio::time::Instant;

use crate::client::{Client, ConnectionState};
use crate::config::ClientConfig;
use crate::demo::{self, ProcessStringRequest, ProcessStringResponse};
use crate::error::{CallError, ClientResult};
use crate::keepalive::ClientManager;

const STATUSES: [StatusCode; 6] = [
    StatusCode::Success,
    StatusCode::InternalError,
    StatusCode::RequestQueueOverflow,
    StatusCode::ConnectionClosed,
    StatusCode::RemoteServiceInternalError,
    StatusCode::RemoteServiceExternalError,
];

/// Request count per status code.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts([u64; STATUSES.len()]);

impl StatusCounts {
    pub fn get(&self, status: StatusCode) -> u64 {
        self.0[usize::from(status.as_u8())]
    }

    pub fn total(&self) -> u64 {
        self.0.iter().sum()
    }

    fn add(&mut self, other: &Self) {
        for (mine, theirs) in self.0.iter_mut().zip(other.0) {
            *mine += theirs;
        }
    }
}

impl fmt::Display for StatusCounts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} requests", self.total())?;
        for status in STATUSES {
            let count = self.get(status);
            if count > 0 {
                write!(f, ", {status}: {count}")?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
struct Counters([AtomicU64; STATUSES.len()]);

impl Counters {
    fn record(&self, status: StatusCode) {
        self.0[usize::from(status.as_u8())].fetch_add(1, Ordering::Relaxed);
    }

    /// Returns the counts so far and starts over.
    fn take(&self) -> StatusCounts {
        let mut counts = StatusCounts::default();
        for (count, counter) in counts.0.iter_mut().zip(&self.0) {
            *count = counter.swap(0, Ordering::Relaxed);
        }
        counts
    }
}

/// Summary of a load run.
#[derive(Debug, Clone, Copy)]
pub struct BenchReport {
    pub totals: StatusCounts,
    pub elapsed: Duration,
}

impl BenchReport {
    pub fn requests_per_second(&self) -> f64 {
        let seconds = self.elapsed.as_secs_f64();
        if seconds > 0.0 {
            self.totals.total() as f64 / seconds
        } else {
            0.0
        }
    }
}

/// Runs `tasks` request loops against `client` for `duration`, calling
/// `on_second` with each second's counts.
///
/// Loops stop early once the client disconnects.
pub async fn run_load<F>(
    client: Arc<Client>,
    tasks: usize,
    duration: Duration,
    mut on_second: F,
) -> BenchReport
where
    F: FnMut(u64, &StatusCounts),
{
    let counters = Arc::new(Counters::default());
    let started = Instant::now();
    let deadline = started + duration;

    let workers: Vec<_> = (0..tasks)
        .map(|task| {
            tokio::spawn(request_loop(
                Arc::clone(&client),
                Arc::clone(&counters),
                task,
                deadline,
            ))
        })
        .collect();

    let mut totals = StatusCounts::default();
    let mut second = 0;
    while Instant::now() < deadline && workers.iter().any(|worker| !worker.is_finished()) {
        let remaining = deadline.saturating_duration_since(Instant::now());
        tokio::time::sleep(remaining.min(Duration::from_secs(1))).await;
        second += 1;
        let counts = counters.take();
        totals.add(&counts);
        on_second(second, &counts);
    }

    for worker in workers {
        let _ = worker.await;
    }
    totals.add(&counters.take());

    BenchReport {
        totals,
        elapsed: started.elapsed(),
    }
}

async fn request_loop(client: Arc<Client>, counters: Arc<Counters>, task: usize, deadline: Instant) {
    let mut sequence = 0u64;
    while Instant::now() < deadline && client.connection_state() == ConnectionState::Connected {
        let source_string = format!("task{task}-{sequence}");
        let result: Result<ProcessStringResponse, CallError> = client
            .send_request(ProcessStringRequest {
                source_string: source_string.clone(),
            })
            .await;

        let status = match result {
            Ok(response) if response.processed_string == format!("{source_string}_processed") => {
                StatusCode::Success
            }
            Ok(_) => StatusCode::InternalError,
            Err(err) => err.status(),
        };
        counters.record(status);
        sequence += 1;

        if status == StatusCode::RequestQueueOverflow {
            tokio::task::yield_now().await;
        }
    }
}

/// Connects to `addr` (or the configured server) and runs the load.
pub async fn run(
    config: &ClientConfig,
    addr: Option<String>,
    tasks: usize,
    seconds: u64,
) -> ClientResult<()> {
    let addr = addr.unwrap_or_else(|| config.server_addr.clone());
    let manager = ClientManager::new(config.clone(), default_error_logger())?;
    let client = Arc::new(manager.create_client(demo::catalog()?)?);
    client.connect(addr.as_str()).await?;

    println!("benchmarking {addr} with {tasks} tasks for {seconds}s");
    let report = run_load(
        Arc::clone(&client),
        tasks,
        Duration::from_secs(seconds),
        |second, counts| println!("[{second:>3}s] {counts}"),
    )
    .await;

    println!(
        "total: {} in {:.1}s ({:.0} req/s)",
        report.totals,
        report.elapsed.as_secs_f64(),
        report.requests_per_second()
    );
    client.close_connection();
    Ok(())
}
