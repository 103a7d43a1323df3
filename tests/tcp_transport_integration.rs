//! Integration tests for the plain-TCP transport against a local server.

use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use wirepool::pool::Route;
use wirepool::transport::tcp::{self, TcpTransport};
use wirepool::{CallError, ClientConfig, Core};

/// Spawn a server that answers every request on a connection with `body`,
/// framed by Content-Length, writing `chunk` bytes every `gap`.
async fn spawn_server(body: &'static str, chunk: usize, gap: Duration) -> Route {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 4096];
                loop {
                    // wait for a request (terminated by the blank line)
                    let mut request = Vec::new();
                    loop {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => {
                                request.extend_from_slice(&buf[..n]);
                                if request.windows(4).any(|w| w == b"\r\n\r\n") {
                                    break;
                                }
                            }
                        }
                    }

                    let header = format!(
                        "HTTP/1.1 200 OK\r\nContent-Length: {}\r\nConnection: keep-alive\r\n\r\n",
                        body.len()
                    );
                    if socket.write_all(header.as_bytes()).await.is_err() {
                        return;
                    }
                    for piece in body.as_bytes().chunks(chunk) {
                        tokio::time::sleep(gap).await;
                        if socket.write_all(piece).await.is_err() {
                            return;
                        }
                    }
                    let _ = socket.flush().await;
                }
            });
        }
    });

    Route::http("127.0.0.1", port)
}

fn tcp_config() -> ClientConfig {
    let mut config = ClientConfig::new();
    config.pool.max_per_route = 2;
    config.pool.max_total = 4;
    config.timeouts.connect_ms = 500;
    config.timeouts.lease_ms = 500;
    config.timeouts.inter_byte_ms = Some(60_000);
    config
}

#[tokio::test]
async fn test_real_exchange_and_keep_alive_reuse() {
    let route = spawn_server("hello from the pool", 64, Duration::ZERO).await;
    let core = Core::with_transport(tcp_config(), TcpTransport::new());
    let policy = core.default_policy();
    let request = tcp::get_request(&route, "/");

    let body = core.execute(&route, &request, &policy).await.unwrap();
    let text = String::from_utf8_lossy(&body);
    assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
    assert!(text.ends_with("hello from the pool"));

    // the Content-Length framing ends the exchange without closing the
    // socket, so the second call reuses the same connection
    let body = core.execute(&route, &request, &policy).await.unwrap();
    assert!(String::from_utf8_lossy(&body).ends_with("hello from the pool"));

    let stats = core.pool_stats().await;
    assert_eq!(stats.counters.total_created, 1);
    assert_eq!(stats.counters.total_reused, 1);
}

#[tokio::test]
async fn test_real_slow_body_trips_read_timer() {
    // one 64-byte slice every 300ms
    let route = spawn_server("sliced response body over tcp", 8, Duration::from_millis(300)).await;
    let core = Core::with_transport(tcp_config(), TcpTransport::new());
    let request = tcp::get_request(&route, "/");

    let policy = core
        .default_policy()
        .with_response_timeout(Some(Duration::from_millis(100)));

    let err = core.execute(&route, &request, &policy).await.unwrap_err();
    assert!(matches!(err, CallError::ReadTimeout { .. }));

    // the stalled connection was retired, not pooled
    let stats = core.pool_stats().await;
    assert_eq!(stats.total.available, 0);
    assert_eq!(stats.counters.total_retired, 1);
}

#[tokio::test]
async fn test_real_trickle_survives_read_timer_until_hard_cutoff() {
    // slices arrive every 100ms, well inside the 400ms gap timer, and the
    // body is long enough to outlive the hard limit many times over
    let route = spawn_server(
        "0123456789012345678901234567890123456789",
        2,
        Duration::from_millis(100),
    )
    .await;
    let core = Core::with_transport(tcp_config(), TcpTransport::new());
    let request = tcp::get_request(&route, "/");

    let policy = core
        .default_policy()
        .with_response_timeout(Some(Duration::from_millis(400)))
        .with_hard_timeout(Some(Duration::from_millis(500)));

    let started = Instant::now();
    let err = core.execute(&route, &request, &policy).await.unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, CallError::HardTimeoutExceeded { .. }));
    assert!(elapsed >= Duration::from_millis(450));
    assert!(
        elapsed < Duration::from_millis(900),
        "hard cutoff took {elapsed:?}"
    );
}

#[tokio::test]
async fn test_real_connect_refused_is_connect_failure() {
    // bind then drop the listener so the port refuses connections
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let route = Route::http("127.0.0.1", port);
    let core = Core::with_transport(tcp_config(), TcpTransport::new());
    let policy = core.default_policy();
    let request = tcp::get_request(&route, "/");

    let err = core.execute(&route, &request, &policy).await.unwrap_err();
    assert!(matches!(err, CallError::ConnectFailure { .. }));
}
