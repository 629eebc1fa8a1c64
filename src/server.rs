use std::future::Future;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::buffer_pool::{get_buffer, return_buffer};
use crate::config::Config;
use crate::pool::{PoolLease, ProxyPool};
use crate::socks::{self, ProxyError, TargetAddr, TargetHost};

// SOCKS protocol constants
const SOCKS_VERSION_5: u8 = 0x05;
const SOCKS_VERSION_4: u8 = 0x04;

const SOCKS5_AUTH_NONE: u8 = 0x00;
const SOCKS5_AUTH_NO_ACCEPTABLE_METHODS: u8 = 0xFF;

const SOCKS_CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

const SOCKS5_REP_SUCCESS: u8 = 0x00;
const SOCKS5_REP_GENERAL_FAILURE: u8 = 0x01;
const SOCKS5_REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const SOCKS5_REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

const SOCKS4_RESP_GRANTED: u8 = 0x5A;
const SOCKS4_RESP_REJECTED: u8 = 0x5B;

/// Distinct upstream proxies tried per session
const UPSTREAM_ATTEMPTS: usize = 3;

/// How long the surviving splice direction may keep draining after the
/// opposite side half-closed
const LINGER_DEADLINE: Duration = Duration::from_secs(30);

const MAX_USER_ID_LEN: usize = 512;

static SESSION_SEQ: AtomicU64 = AtomicU64::new(1);

/// Accept loop. Each accepted client runs as an independent session task;
/// when `shutdown` resolves, the listener closes immediately and in-flight
/// sessions get the configured grace period before they are aborted.
pub async fn serve(
    listener: TcpListener,
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
    shutdown: impl Future<Output = ()>,
) -> io::Result<()> {
    let mut sessions: JoinSet<()> = JoinSet::new();
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let pool = Arc::clone(&pool);
                    let config = Arc::clone(&config);
                    sessions.spawn(handle_client(stream, peer, pool, config));
                }
                Err(err) if is_transient_accept_error(&err) => {
                    warn!(%err, "accept failed (continuing)");
                }
                Err(err) => {
                    warn!(%err, "accept failed fatally");
                    return Err(err);
                }
            },
            _ = &mut shutdown => break,
            // Reap finished sessions so the set does not grow unbounded
            Some(_) = sessions.join_next(), if !sessions.is_empty() => {}
        }
    }

    drop(listener);
    let active = sessions.len();
    if active == 0 {
        return Ok(());
    }

    info!(active, grace = ?config.grace_period, "waiting for in-flight sessions");
    let deadline = tokio::time::sleep(config.grace_period);
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            next = sessions.join_next() => {
                if next.is_none() {
                    break;
                }
            }
            _ = &mut deadline => {
                warn!(remaining = sessions.len(), "grace period expired, aborting sessions");
                sessions.shutdown().await;
                break;
            }
        }
    }
    Ok(())
}

fn is_transient_accept_error(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
    )
}

async fn handle_client(
    mut stream: TcpStream,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
) {
    let session = SESSION_SEQ.fetch_add(1, Ordering::Relaxed);
    debug!(session, %peer, "client connected");
    if let Err(err) = run_session(&mut stream, session, peer, pool, config).await {
        debug!(session, %peer, %err, "session ended with error");
    }
    let _ = stream.shutdown().await;
    debug!(session, %peer, "client connection closed");
}

async fn run_session(
    stream: &mut TcpStream,
    session: u64,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
) -> io::Result<()> {
    let mut version = [0u8; 1];
    stream.read_exact(&mut version).await?;
    match version[0] {
        SOCKS_VERSION_5 => socks5_session(stream, session, peer, pool, config).await,
        SOCKS_VERSION_4 => socks4_session(stream, session, peer, pool, config).await,
        other => {
            // Not SOCKS; close without writing anything back
            debug!(session, %peer, version = other, "unknown protocol byte");
            Ok(())
        }
    }
}

async fn socks5_session(
    stream: &mut TcpStream,
    session: u64,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
) -> io::Result<()> {
    // Method negotiation; only no-auth is advertised
    let mut count = [0u8; 1];
    stream.read_exact(&mut count).await?;
    let mut methods = vec![0u8; count[0] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&SOCKS5_AUTH_NONE) {
        debug!(session, %peer, "client offered no acceptable auth method");
        stream
            .write_all(&[SOCKS_VERSION_5, SOCKS5_AUTH_NO_ACCEPTABLE_METHODS])
            .await?;
        return Ok(());
    }
    stream.write_all(&[SOCKS_VERSION_5, SOCKS5_AUTH_NONE]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != SOCKS_VERSION_5 {
        debug!(session, %peer, "malformed SOCKS5 request header");
        return Ok(());
    }
    if request[1] != SOCKS_CMD_CONNECT {
        debug!(session, %peer, cmd = request[1], "unsupported SOCKS5 command");
        send_socks5_reply(stream, SOCKS5_REP_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }
    let target = match read_socks5_target(stream, request[3]).await? {
        Some(target) => target,
        None => {
            debug!(session, %peer, atyp = request[3], "unsupported address type");
            send_socks5_reply(stream, SOCKS5_REP_ATYP_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };

    info!(session, %peer, %target, "SOCKS5 connect request");
    let (upstream, lease) = match acquire_upstream(&pool, &target, &config, session).await {
        Ok(acquired) => acquired,
        Err(err) => {
            warn!(session, %target, %err, "no upstream available");
            send_socks5_reply(stream, SOCKS5_REP_GENERAL_FAILURE).await?;
            return Ok(());
        }
    };
    send_socks5_reply(stream, SOCKS5_REP_SUCCESS).await?;

    splice(stream, upstream, session, lease).await
}

async fn socks4_session(
    stream: &mut TcpStream,
    session: u64,
    peer: SocketAddr,
    pool: Arc<ProxyPool>,
    config: Arc<Config>,
) -> io::Result<()> {
    // cmd, port, ip; the version byte was already consumed
    let mut request = [0u8; 7];
    stream.read_exact(&mut request).await?;
    let cmd = request[0];
    let port = u16::from_be_bytes([request[1], request[2]]);
    let ip = Ipv4Addr::new(request[3], request[4], request[5], request[6]);

    read_null_terminated(stream).await?; // user id, unused

    let octets = ip.octets();
    let host = if octets[0] == 0 && octets[1] == 0 && octets[2] == 0 && octets[3] != 0 {
        // SOCKS4a: hostname follows the user id
        let name = read_null_terminated(stream).await?;
        TargetHost::Name(String::from_utf8_lossy(&name).into_owned())
    } else {
        TargetHost::V4(ip)
    };

    if cmd != SOCKS_CMD_CONNECT {
        debug!(session, %peer, cmd, "unsupported SOCKS4 command");
        send_socks4_reply(stream, SOCKS4_RESP_REJECTED, port).await?;
        return Ok(());
    }

    let target = TargetAddr { host, port };
    info!(session, %peer, %target, "SOCKS4 connect request");
    let (upstream, lease) = match acquire_upstream(&pool, &target, &config, session).await {
        Ok(acquired) => acquired,
        Err(err) => {
            warn!(session, %target, %err, "no upstream available");
            send_socks4_reply(stream, SOCKS4_RESP_REJECTED, port).await?;
            return Ok(());
        }
    };
    send_socks4_reply(stream, SOCKS4_RESP_GRANTED, port).await?;

    splice(stream, upstream, session, lease).await
}

async fn read_socks5_target(stream: &mut TcpStream, atyp: u8) -> io::Result<Option<TargetAddr>> {
    let host = match atyp {
        SOCKS5_ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            TargetHost::V4(Ipv4Addr::from(addr))
        }
        SOCKS5_ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            TargetHost::Name(String::from_utf8_lossy(&name).into_owned())
        }
        SOCKS5_ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            TargetHost::V6(Ipv6Addr::from(addr))
        }
        _ => return Ok(None),
    };
    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok(Some(TargetAddr {
        host,
        port: u16::from_be_bytes(port),
    }))
}

async fn read_null_terminated(stream: &mut TcpStream) -> io::Result<Vec<u8>> {
    let mut out = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        stream.read_exact(&mut byte).await?;
        if byte[0] == 0 {
            return Ok(out);
        }
        if out.len() >= MAX_USER_ID_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "unterminated SOCKS4 string",
            ));
        }
        out.push(byte[0]);
    }
}

async fn send_socks5_reply(stream: &mut TcpStream, rep: u8) -> io::Result<()> {
    // Bound address is always 0.0.0.0:0
    stream
        .write_all(&[SOCKS_VERSION_5, rep, 0x00, SOCKS5_ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await
}

async fn send_socks4_reply(stream: &mut TcpStream, code: u8, port: u16) -> io::Result<()> {
    let port = port.to_be_bytes();
    stream
        .write_all(&[0x00, code, port[0], port[1], 0, 0, 0, 0])
        .await
}

/// Try up to `UPSTREAM_ATTEMPTS` distinct proxies for this session. Each
/// attempt holds an in-flight lease while the handshake runs; failures are
/// reported to the pool and the proxy is excluded from this session's
/// remaining attempts without touching global eligibility.
async fn acquire_upstream(
    pool: &Arc<ProxyPool>,
    target: &TargetAddr,
    config: &Config,
    session: u64,
) -> Result<(TcpStream, PoolLease), ProxyError> {
    let mut excluded: Vec<usize> = Vec::new();
    let mut last_err = ProxyError::NoHealthyProxy;

    for attempt in 1..=UPSTREAM_ATTEMPTS {
        let id = pool.pick_excluding(&excluded)?;
        let lease = pool.lease(id);
        let descriptor = pool.descriptor(id);
        let started = Instant::now();
        match socks::connect_via(descriptor, target, config.connect_timeout).await {
            Ok(stream) => {
                pool.report_success(id, started.elapsed());
                debug!(
                    session,
                    attempt,
                    proxy = %descriptor.connection_string(),
                    "upstream tunnel established"
                );
                return Ok((stream, lease));
            }
            Err(err) => {
                pool.report_failure(id);
                warn!(
                    session,
                    attempt,
                    proxy = %descriptor.connection_string(),
                    kind = if err.is_handshake_failure() { "handshake" } else { "transport" },
                    %err,
                    "upstream attempt failed"
                );
                drop(lease);
                excluded.push(id);
                last_err = err;
            }
        }
    }
    Err(last_err)
}

/// Bidirectional copy until both directions reach EOF. The first half-close
/// shuts down the opposite peer's write side and the surviving direction
/// keeps draining under a linger deadline. Errors end the session.
async fn splice(
    client: &mut TcpStream,
    mut upstream: TcpStream,
    session: u64,
    lease: PoolLease,
) -> io::Result<()> {
    let mut client_buf = get_buffer().await;
    let mut upstream_buf = get_buffer().await;
    let mut bytes_up: u64 = 0;
    let mut bytes_down: u64 = 0;
    let mut client_open = true;
    let mut upstream_open = true;
    let mut lingering = false;
    let mut error: Option<io::Error> = None;

    let linger = tokio::time::sleep(LINGER_DEADLINE);
    tokio::pin!(linger);

    loop {
        tokio::select! {
            res = client.read(&mut client_buf), if client_open => match res {
                Ok(0) => {
                    client_open = false;
                    let _ = upstream.shutdown().await;
                    if !upstream_open {
                        break;
                    }
                    linger.as_mut().reset(Instant::now() + LINGER_DEADLINE);
                    lingering = true;
                }
                Ok(n) => {
                    if let Err(err) = upstream.write_all(&client_buf[..n]).await {
                        error = Some(err);
                        break;
                    }
                    bytes_up += n as u64;
                }
                Err(err) => {
                    error = Some(err);
                    break;
                }
            },
            res = upstream.read(&mut upstream_buf), if upstream_open => match res {
                Ok(0) => {
                    upstream_open = false;
                    let _ = client.shutdown().await;
                    if !client_open {
                        break;
                    }
                    linger.as_mut().reset(Instant::now() + LINGER_DEADLINE);
                    lingering = true;
                }
                Ok(n) => {
                    if let Err(err) = client.write_all(&upstream_buf[..n]).await {
                        error = Some(err);
                        break;
                    }
                    bytes_down += n as u64;
                }
                Err(err) => {
                    error = Some(err);
                    break;
                }
            },
            _ = &mut linger, if lingering => {
                debug!(session, "linger deadline reached");
                break;
            }
        }
    }

    let _ = upstream.shutdown().await;
    return_buffer(client_buf).await;
    return_buffer(upstream_buf).await;
    drop(lease);

    debug!(session, bytes_up, bytes_down, "session finished");
    match error {
        Some(err) => Err(err),
        None => Ok(()),
    }
}
