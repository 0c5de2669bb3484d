use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use notebook_protocol::{NotebookRuntimeError, NotebookRuntimeResult};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::{Instant, sleep};

/// Picks a free loopback port by binding to port 0 and releasing it.
pub async fn allocate_port() -> NotebookRuntimeResult<u16> {
    let listener = TcpListener::bind(SocketAddr::from((Ipv4Addr::LOCALHOST, 0)))
        .await
        .map_err(|error| {
            NotebookRuntimeError::Process(format!("failed to reserve a loopback port: {error}"))
        })?;
    let address = listener.local_addr().map_err(|error| {
        NotebookRuntimeError::Process(format!("failed to read reserved port: {error}"))
    })?;
    Ok(address.port())
}

pub async fn accepts_connections(port: u16) -> bool {
    TcpStream::connect(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
        .await
        .is_ok()
}

/// Polls `port` until it accepts a connection or `timeout` elapses.
///
/// `check` runs before every attempt; an error from it ends the wait early.
pub async fn wait_until_open<F>(
    port: u16,
    timeout: Duration,
    interval: Duration,
    mut check: F,
) -> NotebookRuntimeResult<()>
where
    F: FnMut() -> NotebookRuntimeResult<()>,
{
    let started = Instant::now();
    while started.elapsed() <= timeout {
        check()?;
        if accepts_connections(port).await {
            return Ok(());
        }
        sleep(interval).await;
    }

    Err(NotebookRuntimeError::Startup(format!(
        "worker did not open port {port} within {timeout:?}"
    )))
}
