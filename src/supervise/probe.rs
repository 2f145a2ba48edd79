use crate::config::HealthWait;
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Interval between readiness attempts
const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Per-attempt budget for a TCP connect
const PORT_ATTEMPT_TIMEOUT: Duration = Duration::from_millis(400);

/// Per-attempt budget for an HTTP request
const HTTP_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(2);

/// Wait until a freshly launched service is ready.
///
/// Polls the configured check every 500ms until it succeeds, the overall
/// timeout elapses, the child is observed to have exited, or an abort is
/// requested (stop in progress). Returns `true` only on success; a failed
/// attempt is never fatal by itself. The probe has no side effects beyond
/// the network I/O of each attempt.
pub async fn wait<A, B>(health: &HealthWait, is_child_alive: A, should_abort: B) -> bool
where
    A: FnMut() -> bool,
    B: Fn() -> bool,
{
    match health {
        // A successful launch alone counts as healthy.
        HealthWait::None => true,
        HealthWait::Port { port, timeout_secs } => {
            let port = *port;
            poll_until(
                Duration::from_secs(*timeout_secs),
                is_child_alive,
                should_abort,
                || port_ready(port),
            )
            .await
        }
        HealthWait::Http { url, timeout_secs } => {
            let client = match reqwest::Client::builder()
                .timeout(HTTP_ATTEMPT_TIMEOUT)
                .build()
            {
                Ok(client) => client,
                Err(e) => {
                    warn!("failed to build http client for health check: {}", e);
                    return false;
                }
            };
            poll_until(
                Duration::from_secs(*timeout_secs),
                is_child_alive,
                should_abort,
                || http_ready(&client, url),
            )
            .await
        }
    }
}

async fn poll_until<F, Fut, A, B>(
    timeout: Duration,
    mut is_child_alive: A,
    should_abort: B,
    mut attempt: F,
) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
    A: FnMut() -> bool,
    B: Fn() -> bool,
{
    let deadline = Instant::now() + timeout;

    loop {
        if should_abort() {
            debug!("health wait aborted");
            return false;
        }
        if !is_child_alive() {
            debug!("child exited before becoming healthy");
            return false;
        }
        if attempt().await {
            return true;
        }
        if Instant::now() + POLL_INTERVAL >= deadline {
            return false;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// One TCP readiness attempt against the loopback interface.
async fn port_ready(port: u16) -> bool {
    matches!(
        tokio::time::timeout(PORT_ATTEMPT_TIMEOUT, TcpStream::connect(("127.0.0.1", port))).await,
        Ok(Ok(_))
    )
}

/// One HTTP readiness attempt; any status below 400 counts as ready and
/// request errors just mean "not yet".
async fn http_ready(client: &reqwest::Client, url: &str) -> bool {
    match client.get(url).send().await {
        Ok(response) => response.status().as_u16() < 400,
        Err(e) => {
            debug!("health request not ready: {}", e);
            false
        }
    }
}
