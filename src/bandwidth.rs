use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::pool::ProxyPool;
use crate::socks::{self, ProxyError, TargetAddr, TargetHost};

pub const DEFAULT_BANDWIDTH_URL: &str = "http://speedtest.tele2.net/100MB.zip";

/// How long each fetch may read body bytes for the throughput estimate
const SAMPLE_WINDOW: Duration = Duration::from_secs(5);

/// Hard deadline on one fetch, connect and handshake included
const FETCH_DEADLINE: Duration = Duration::from_secs(20);

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("probe url is unusable: {0}")]
    Url(&'static str),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Http(#[from] hyper::Error),

    #[error("request build failed: {0}")]
    Request(#[from] http::Error),

    #[error("probe fetch returned {0}")]
    Status(http::StatusCode),

    #[error(transparent)]
    Proxy(#[from] ProxyError),

    #[error("no payload bytes received")]
    NoData,

    #[error("fetch deadline exceeded")]
    Timeout,
}

/// Periodically sizes the pool's active window so that the summed measured
/// throughput of the best proxies covers the directly measurable bandwidth.
pub struct AutoOptimizer {
    pool: Arc<ProxyPool>,
    url: Uri,
    interval: Duration,
    last_direct_bps: Option<u64>,
}

impl AutoOptimizer {
    pub fn new(pool: Arc<ProxyPool>, url: Uri, interval: Duration) -> Self {
        AutoOptimizer {
            pool,
            url,
            interval,
            last_direct_bps: None,
        }
    }

    pub async fn run(mut self) {
        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tick.tick().await;
            self.retune_once().await;
        }
    }

    async fn retune_once(&mut self) {
        let direct_bps = match self.measure_direct().await {
            Ok(bps) => {
                info!(mbps = %format_mbps(bps), "direct bandwidth measured");
                self.last_direct_bps = Some(bps);
                bps
            }
            Err(err) => {
                warn!(%err, "direct bandwidth measurement failed");
                match self.last_direct_bps {
                    Some(previous) => previous,
                    None => {
                        info!("no bandwidth measurement available, keeping active window");
                        return;
                    }
                }
            }
        };

        let alive = self.pool.alive_ids();
        if alive.is_empty() {
            warn!("no alive proxies to measure");
            return;
        }
        let alive_count = alive.len();

        // Sequential on purpose: concurrent fetches would share the link and
        // depress every per-proxy estimate.
        let mut measured: Vec<(usize, u64)> = Vec::new();
        for id in alive {
            match self.measure_via_proxy(id).await {
                Ok(bps) => {
                    debug!(
                        proxy = %self.pool.descriptor(id).connection_string(),
                        mbps = %format_mbps(bps),
                        "proxy bandwidth measured"
                    );
                    self.pool.record_bandwidth(id, bps);
                    measured.push((id, bps));
                }
                Err(err) => {
                    debug!(
                        proxy = %self.pool.descriptor(id).connection_string(),
                        %err,
                        "proxy bandwidth measurement failed, excluded this round"
                    );
                }
            }
        }
        if measured.is_empty() {
            warn!("no proxy produced a throughput estimate, keeping active window");
            return;
        }

        measured.sort_by(|a, b| b.1.cmp(&a.1).then(a.0.cmp(&b.0)));
        let speeds: Vec<u64> = measured.iter().map(|&(_, bps)| bps).collect();
        let active = optimal_active_count(direct_bps, &speeds, alive_count);

        let mut order: Vec<usize> = measured.iter().map(|&(id, _)| id).collect();
        for id in 0..self.pool.len() {
            if !order.contains(&id) {
                order.push(id);
            }
        }
        self.pool.set_throughput_order(order);
        self.pool.set_active_count(active);
        info!(
            active,
            total = self.pool.len(),
            direct_mbps = %format_mbps(direct_bps),
            "retuned active proxy window"
        );
    }

    async fn measure_direct(&self) -> Result<u64, FetchError> {
        let (host, port, path) = endpoint(&self.url)?;
        let fetch = async {
            let stream = TcpStream::connect((host.as_str(), port)).await?;
            measure_fetch(stream, &host, &path).await
        };
        match timeout(FETCH_DEADLINE, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }

    async fn measure_via_proxy(&self, id: usize) -> Result<u64, FetchError> {
        let (host, port, path) = endpoint(&self.url)?;
        let target = TargetAddr {
            host: TargetHost::from_host_str(&host),
            port,
        };
        let descriptor = self.pool.descriptor(id);
        let fetch = async {
            let stream = socks::connect_via(descriptor, &target, FETCH_DEADLINE).await?;
            measure_fetch(stream, &host, &path).await
        };
        match timeout(FETCH_DEADLINE, fetch).await {
            Ok(result) => result,
            Err(_) => Err(FetchError::Timeout),
        }
    }
}

/// Smallest k such that the top-k measured speeds sum to at least the direct
/// bandwidth. When no prefix suffices, every alive proxy stays in rotation:
/// a failed bandwidth probe drops a proxy out of the sum, not out of the
/// pool. Never less than 1.
pub(crate) fn optimal_active_count(
    direct_bps: u64,
    sorted_bps_desc: &[u64],
    alive_count: usize,
) -> usize {
    let mut sum = 0u64;
    for (index, &bps) in sorted_bps_desc.iter().enumerate() {
        sum = sum.saturating_add(bps);
        if sum >= direct_bps {
            return index + 1;
        }
    }
    alive_count.max(sorted_bps_desc.len()).max(1)
}

/// GET `path` over an established stream and count body bytes for up to the
/// sample window. Returns observed throughput in bits per second.
async fn measure_fetch<S>(stream: S, host: &str, path: &str) -> Result<u64, FetchError>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = http1::Builder::new().handshake(io).await?;
    // The driver must keep running for the body to stream
    let driver = tokio::spawn(async move {
        let _ = conn.await;
    });

    let request = Request::builder()
        .uri(path)
        .header(http::header::HOST, host)
        .body(Empty::<Bytes>::new())?;

    let started = Instant::now();
    let deadline = started + SAMPLE_WINDOW;
    let mut response = sender.send_request(request).await?;
    if !response.status().is_success() {
        driver.abort();
        return Err(FetchError::Status(response.status()));
    }

    let mut total_bytes: u64 = 0;
    loop {
        match timeout_at(deadline, response.body_mut().frame()).await {
            Ok(Some(Ok(frame))) => {
                if let Some(data) = frame.data_ref() {
                    total_bytes += data.len() as u64;
                }
            }
            Ok(Some(Err(err))) => {
                driver.abort();
                return Err(err.into());
            }
            Ok(None) => break, // body complete before the window closed
            Err(_) => break,   // sample window over
        }
    }
    driver.abort();

    let elapsed = started.elapsed().as_secs_f64();
    if total_bytes == 0 || elapsed <= 0.0 {
        return Err(FetchError::NoData);
    }
    Ok((total_bytes as f64 * 8.0 / elapsed) as u64)
}

fn endpoint(url: &Uri) -> Result<(String, u16, String), FetchError> {
    let host = url.host().ok_or(FetchError::Url("missing host"))?.to_string();
    let port = url.port_u16().unwrap_or(80);
    let path = url
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());
    Ok((host, port, path))
}

fn format_mbps(bps: u64) -> String {
    format!("{:.2}", bps as f64 / 1_000_000.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Read until the end of the request head, tolerating chunked arrival.
    async fn read_request_head(conn: &mut TcpStream) {
        let mut head = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            if n == 0 {
                break;
            }
            head.extend_from_slice(&buf[..n]);
            if head.windows(4).any(|w| w == b"\r\n\r\n") {
                break;
            }
        }
    }

    #[test]
    fn optimal_count_stops_at_saturating_prefix() {
        // 60 + 50 covers 100
        assert_eq!(optimal_active_count(100, &[60, 50, 40, 30], 4), 2);
        assert_eq!(optimal_active_count(100, &[120, 50], 2), 1);
        assert_eq!(optimal_active_count(100, &[100], 1), 1);
    }

    #[test]
    fn optimal_count_uses_all_alive_when_sum_falls_short() {
        assert_eq!(optimal_active_count(100, &[10, 10, 10], 3), 3);
        // Two proxies answered the probe, a third is alive but failed it
        // this round; the shortfall keeps all three in rotation.
        assert_eq!(optimal_active_count(1000, &[60, 50], 3), 3);
    }

    #[test]
    fn optimal_count_never_returns_zero() {
        assert_eq!(optimal_active_count(100, &[], 0), 1);
        assert_eq!(optimal_active_count(0, &[10, 20], 2), 1);
    }

    #[tokio::test]
    async fn measure_fetch_counts_body_bytes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            read_request_head(&mut conn).await;
            let body = vec![0x42u8; 65536];
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 65536\r\n\r\n")
                .await
                .unwrap();
            conn.write_all(&body).await.unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let bps = measure_fetch(stream, "127.0.0.1", "/blob").await.unwrap();
        assert!(bps > 0);
    }

    #[tokio::test]
    async fn measure_fetch_rejects_error_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = listener.accept().await.unwrap();
            read_request_head(&mut conn).await;
            conn.write_all(b"HTTP/1.1 404 Not Found\r\nContent-Length: 0\r\n\r\n")
                .await
                .unwrap();
        });

        let stream = TcpStream::connect(addr).await.unwrap();
        let err = measure_fetch(stream, "127.0.0.1", "/missing")
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status(_)));
    }

    #[tokio::test]
    async fn retune_keeps_alive_proxies_when_measured_sum_falls_short() {
        use crate::descriptor::ProxyDescriptor;

        // Direct probe target: serves a fat body instantly, so the direct
        // estimate dwarfs anything the trickling proxies report.
        let direct = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let direct_addr = direct.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = direct.accept().await.unwrap();
            read_request_head(&mut conn).await;
            let body = vec![0u8; 262_144];
            conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 262144\r\n\r\n")
                .await
                .unwrap();
            conn.write_all(&body).await.unwrap();
        });

        // Two upstreams complete the SOCKS5 handshake, then trickle a
        // one-byte body after a pause: a few dozen bit/s each.
        let mut proxy_addrs = Vec::new();
        for _ in 0..2 {
            let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
            proxy_addrs.push(listener.local_addr().unwrap());
            tokio::spawn(async move {
                let (mut conn, _) = listener.accept().await.unwrap();
                let mut greeting = [0u8; 3];
                conn.read_exact(&mut greeting).await.unwrap();
                conn.write_all(&[0x05, 0x00]).await.unwrap();
                let mut request = [0u8; 10];
                conn.read_exact(&mut request).await.unwrap();
                conn.write_all(&[0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0])
                    .await
                    .unwrap();
                read_request_head(&mut conn).await;
                tokio::time::sleep(Duration::from_millis(150)).await;
                conn.write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 1\r\n\r\nA")
                    .await
                    .unwrap();
            });
        }

        // Third proxy is alive in the health table but refuses the fetch.
        let dead = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_addr = dead.local_addr().unwrap();
        drop(dead);

        let descriptors: Vec<ProxyDescriptor> = [proxy_addrs[0], proxy_addrs[1], dead_addr]
            .iter()
            .enumerate()
            .map(|(id, addr)| {
                let mut d =
                    ProxyDescriptor::parse(&format!("socks5://127.0.0.1:{}", addr.port()))
                        .unwrap();
                d.id = id;
                d
            })
            .collect();
        let pool = Arc::new(ProxyPool::new(descriptors));
        let url: Uri = format!("http://127.0.0.1:{}/blob", direct_addr.port())
            .parse()
            .unwrap();
        let mut optimizer =
            AutoOptimizer::new(Arc::clone(&pool), url, Duration::from_secs(600));

        optimizer.retune_once().await;

        // The two measured proxies cannot cover the direct estimate; the
        // third failed only this round's measurement and stays active.
        assert_eq!(pool.active_count(), 3);
    }

    #[test]
    fn endpoint_defaults_port_and_path() {
        let uri: Uri = "http://example.com".parse().unwrap();
        let (host, port, path) = endpoint(&uri).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 80);
        assert_eq!(path, "/");

        let uri: Uri = "http://example.com:8080/file.bin?x=1".parse().unwrap();
        let (host, port, path) = endpoint(&uri).unwrap();
        assert_eq!(host, "example.com");
        assert_eq!(port, 8080);
        assert_eq!(path, "/file.bin?x=1");
    }
}
