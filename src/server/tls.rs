//! Stream transport (§4.6): 2-byte-length-implicit RADIUS framing over TLS,
//! inbound accept with per-client reader/writer pairs, and the outbound
//! reconnect protocol with backoff and peer-CN verification.
//!
//! Acceptor/connector construction follows the `SslAcceptor`
//! builder shape used for this proxy's DTLS sibling, adapted from
//! `SslMethod::dtls()` to `SslMethod::tls()` and from a synchronous
//! accept-in-a-loop to `tokio_openssl`'s async handshake.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use engine::{ClientHandle, IngestOutcome, ReplyOutcome, Upstream};
use openssl::pkey::{PKey, Private};
use openssl::ssl::{SslAcceptor, SslConnector, SslMethod, SslVerifyMode};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_openssl::SslStream;

use crate::config::TlsConfig;
use crate::server::Shared;

/// Loads a PEM private key, decrypting it with `CertificateKeyPassword` when
/// the TLS context configures one.
fn load_private_key(tls: &TlsConfig) -> anyhow::Result<PKey<Private>> {
    let pem = std::fs::read(&tls.certificate_key_file)?;
    let key = match &tls.certificate_key_password {
        Some(password) => PKey::private_key_from_pem_passphrase(&pem, password.as_bytes())?,
        None => PKey::private_key_from_pem(&pem)?,
    };
    Ok(key)
}

pub fn build_acceptor(tls: &TlsConfig) -> anyhow::Result<SslAcceptor> {
    let mut builder = SslAcceptor::mozilla_intermediate(SslMethod::tls())?;
    builder.set_private_key(&load_private_key(tls)?)?;
    builder.set_certificate_chain_file(&tls.certificate_file)?;
    builder.check_private_key()?;
    if let Some(ca_file) = &tls.ca_certificate_file {
        builder.set_ca_file(ca_file)?;
    }
    if let Some(ca_path) = &tls.ca_certificate_path {
        builder.set_ca_file(ca_path)?;
    }
    builder.set_verify(SslVerifyMode::PEER | SslVerifyMode::FAIL_IF_NO_PEER_CERT);
    Ok(builder.build())
}

pub fn build_connector(tls: &TlsConfig) -> anyhow::Result<SslConnector> {
    let mut builder = SslConnector::builder(SslMethod::tls())?;
    builder.set_private_key(&load_private_key(tls)?)?;
    builder.set_certificate_chain_file(&tls.certificate_file)?;
    builder.check_private_key()?;
    if let Some(ca_file) = &tls.ca_certificate_file {
        builder.set_ca_file(ca_file)?;
    }
    if let Some(ca_path) = &tls.ca_certificate_path {
        builder.set_ca_file(ca_path)?;
    }
    builder.set_verify(SslVerifyMode::PEER);
    Ok(builder.build())
}

/// Extracts the peer certificate's Common Name and compares it against
/// `expected_host`, case-insensitively (§9 Open Question a: CN only, no
/// SubjectAltName).
fn verify_peer_cn(stream: &SslStream<TcpStream>, expected_host: &str) -> bool {
    let Some(cert) = stream.ssl().peer_certificate() else {
        return false;
    };
    let Some(cn) = cert
        .subject_name()
        .entries_by_nid(openssl::nid::Nid::COMMONNAME)
        .next()
    else {
        return false;
    };
    let Ok(cn) = cn.data().as_utf8() else {
        return false;
    };
    cn.to_string().eq_ignore_ascii_case(expected_host)
}

async fn read_frame<R: AsyncReadExt + Unpin>(stream: &mut R) -> std::io::Result<Option<Vec<u8>>> {
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    }

    let declared = u16::from_be_bytes([header[2], header[3]]) as usize;
    if codec::packet::Packet::validate_declared_length(declared).is_err() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("RADIUS length {declared} out of range"),
        ));
    }

    let mut buf = vec![0u8; declared];
    buf[..4].copy_from_slice(&header);
    stream.read_exact(&mut buf[4..]).await?;
    Ok(Some(buf))
}

/// Inbound accept loop for TLS clients (§4.6 "Inbound stream acceptance").
/// `acceptors` is keyed by client handle since each client's configured
/// `tls` block may name a different certificate context.
pub async fn run_accept(
    listener: TcpListener,
    acceptors: Arc<ahash::HashMap<ClientHandle, Arc<SslAcceptor>>>,
    shared: Arc<Shared>,
) {
    let active: Arc<Mutex<HashSet<ClientHandle>>> = Arc::new(Mutex::new(HashSet::new()));

    loop {
        let (tcp, source) = match listener.accept().await {
            Ok(v) => v,
            Err(err) => {
                log::warn!("stream accept failed: {err}");
                continue;
            }
        };

        let Some(peer) = shared.peers.resolve(source) else {
            log::info!("stream connection from unconfigured peer {source}, rejecting");
            continue;
        };
        let Some(handle) = shared.clients.find_by_name(&peer.name) else {
            continue;
        };
        let Some(acceptor) = acceptors.get(&handle) else {
            log::warn!("client {} has no TLS context configured, rejecting", peer.name);
            continue;
        };

        {
            let mut active = active.lock().unwrap();
            if !active.insert(handle) {
                log::warn!("client {} already has a live stream session, rejecting", peer.name);
                continue;
            }
        }

        let shared = shared.clone();
        let acceptor = acceptor.clone();
        let active = active.clone();
        let host = peer.name.clone();
        tokio::spawn(async move {
            if let Err(err) = serve_client(tcp, acceptor, handle, &host, &shared).await {
                log::warn!("stream session with {host} ended: {err}");
            }
            active.lock().unwrap().remove(&handle);
        });
    }
}

async fn serve_client(
    tcp: TcpStream,
    acceptor: Arc<SslAcceptor>,
    handle: ClientHandle,
    host: &str,
    shared: &Arc<Shared>,
) -> anyhow::Result<()> {
    let ssl = openssl::ssl::Ssl::new(acceptor.context())?;
    let mut stream = SslStream::new(ssl, tcp)?;
    std::pin::Pin::new(&mut stream).accept().await?;

    if !verify_peer_cn(&stream, host) {
        anyhow::bail!("peer certificate CN does not match configured host `{host}`");
    }

    let Some(client) = shared.clients.get(handle) else {
        anyhow::bail!("client handle vanished after handshake");
    };
    let replies = client.replies.clone();
    let writer_replies = replies.clone();

    let (mut read_half, mut write_half) = tokio::io::split(stream);

    let shutdown = Arc::new(tokio::sync::Notify::new());
    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = writer_shutdown.notified() => break,
                entry = writer_replies.pop() => {
                    if entry.buf.len() < 4 {
                        continue;
                    }
                    if let Err(err) = write_half.write_all(&entry.buf).await {
                        log::warn!("stream reply write failed: {err}");
                        break;
                    }
                }
            }
        }
    });

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(buf)) => {
                let outcome =
                    engine::ingest(buf, handle, None, &shared.clients, &shared.realms, &shared.upstreams).await?;
                if let IngestOutcome::Dropped(reason) = outcome {
                    log::debug!("dropped: {reason}");
                }
            }
            Ok(None) => break,
            Err(err) => {
                log::warn!("stream read failed: {err}");
                break;
            }
        }
    }

    // §4.6 teardown: signal the writer and wait for it to exit rather than
    // aborting it mid-write, then drain anything left unsent.
    shutdown.notify_one();
    if let Err(err) = writer.await {
        log::warn!("stream writer task for {host} panicked: {err}");
    }
    replies.drain().await;
    Ok(())
}

/// Sleep schedule for the outbound reconnect protocol (§4.6), evaluated
/// under the upstream's lock snapshot.
fn reconnect_sleep(state: engine::ConnectState, now: Instant) -> (Duration, bool) {
    if state.connection_ok {
        return (Duration::from_secs(10), true);
    }
    let elapsed = now.saturating_duration_since(state.last_connect_attempt);
    if elapsed < Duration::from_secs(5) {
        (Duration::from_secs(10), false)
    } else if elapsed < Duration::from_secs(300) {
        (elapsed, false)
    } else if elapsed < Duration::from_secs(100_000) {
        (Duration::from_secs(600), false)
    } else {
        (Duration::ZERO, false)
    }
}

/// Runs a TLS upstream end to end: connect-with-backoff, handshake, CN
/// verification, then reader+writer until the connection drops, then loop.
pub async fn run_upstream(
    addresses: Vec<SocketAddr>,
    host: String,
    connector: Arc<SslConnector>,
    upstream: Arc<Upstream>,
    shared: Arc<Shared>,
) {
    loop {
        let state = upstream.connect_state().await;
        let before = state.last_connect_attempt;
        let (sleep_for, clear_ok) = reconnect_sleep(state, Instant::now());
        if clear_ok {
            upstream.note_connection_ok(false).await;
        }
        if !sleep_for.is_zero() {
            tokio::time::sleep(sleep_for).await;
        }

        // Another task may have reconnected while we decided/slept.
        if upstream.connect_state().await.last_connect_attempt != before {
            continue;
        }
        upstream.note_connect_attempt(Instant::now()).await;

        let Some(stream) = connect_any(&addresses, &connector, &host).await else {
            continue;
        };

        upstream.note_connection_ok(true).await;
        log::info!("upstream {}: connected", upstream.config.name);

        let (mut read_half, write_half) = tokio::io::split(stream);
        let write_half = Arc::new(tokio::sync::Mutex::new(write_half));

        let shutdown = Arc::new(tokio::sync::Notify::new());
        let writer_shutdown = shutdown.clone();
        let writer_upstream = upstream.clone();
        let writer_half = write_half.clone();
        let writer = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.notified() => break,
                    action = writer_upstream.writer_tick() => match action {
                        engine::WriterAction::Send(buf) => {
                            let mut half = writer_half.lock().await;
                            if let Err(err) = half.write_all(&buf).await {
                                log::warn!("upstream {}: write failed: {err}", writer_upstream.config.name);
                                return;
                            }
                        }
                        engine::WriterAction::WaitUntil(deadline) => {
                            tokio::select! {
                                _ = writer_shutdown.notified() => break,
                                _ = writer_upstream.wait_until(deadline) => {}
                            }
                        }
                    }
                }
            }
        });

        loop {
            match read_frame(&mut read_half).await {
                Ok(Some(buf)) => match upstream.on_reply(buf).await {
                    Ok(Some(ReplyOutcome::StatusAck)) => {}
                    Ok(Some(outcome @ ReplyOutcome::Relay { .. })) => {
                        if let Err(err) = engine::relay_reply(outcome, &shared.clients, &upstream.config.secret).await
                        {
                            log::warn!("upstream {}: failed to relay reply: {err}", upstream.config.name);
                        }
                    }
                    Ok(None) => {}
                    Err(err) => log::warn!("upstream {}: malformed reply: {err}", upstream.config.name),
                },
                Ok(None) => break,
                Err(err) => {
                    log::warn!("upstream {}: stream read failed: {err}", upstream.config.name);
                    break;
                }
            }
        }

        shutdown.notify_one();
        if let Err(err) = writer.await {
            log::warn!("upstream {}: writer task panicked: {err}", upstream.config.name);
        }
        upstream.note_connection_ok(false).await;
        log::warn!("upstream {}: connection lost, reconnecting", upstream.config.name);
    }
}

async fn connect_any(addresses: &[SocketAddr], connector: &SslConnector, host: &str) -> Option<SslStream<TcpStream>> {
    for addr in addresses {
        let tcp = match TcpStream::connect(addr).await {
            Ok(tcp) => tcp,
            Err(err) => {
                log::warn!("connect to {addr} failed: {err}");
                continue;
            }
        };

        let ssl = match connector.configure().and_then(|c| c.into_ssl(host)) {
            Ok(ssl) => ssl,
            Err(err) => {
                log::warn!("TLS setup for {addr} failed: {err}");
                continue;
            }
        };

        let mut stream = match SslStream::new(ssl, tcp) {
            Ok(stream) => stream,
            Err(err) => {
                log::warn!("TLS stream setup for {addr} failed: {err}");
                continue;
            }
        };

        if let Err(err) = std::pin::Pin::new(&mut stream).connect().await {
            log::warn!("TLS handshake with {addr} failed: {err}");
            continue;
        }

        if !verify_peer_cn(&stream, host) {
            log::warn!("peer at {addr} presented a certificate not matching `{host}`");
            continue;
        }

        return Some(stream);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// S6: a connection that just dropped (`connection_ok` still true from
    /// the prior successful session) gets the "clear and retry soon" branch
    /// rather than being treated as a cold start.
    #[test]
    fn s6_reconnect_after_a_live_connection_drops_waits_ten_seconds() {
        let state = engine::ConnectState { last_connect_attempt: Instant::now(), connection_ok: true };
        let (sleep_for, clear_ok) = reconnect_sleep(state, Instant::now());
        assert_eq!(sleep_for, Duration::from_secs(10));
        assert!(clear_ok);
    }

    #[test]
    fn s6_reconnect_schedule_backs_off_then_caps() {
        let attempt = Instant::now();

        let just_failed = engine::ConnectState { last_connect_attempt: attempt, connection_ok: false };
        let (sleep_for, clear_ok) = reconnect_sleep(just_failed, attempt + Duration::from_secs(2));
        assert_eq!(sleep_for, Duration::from_secs(10));
        assert!(!clear_ok);

        let mid_backoff = engine::ConnectState { last_connect_attempt: attempt, connection_ok: false };
        let (sleep_for, _) = reconnect_sleep(mid_backoff, attempt + Duration::from_secs(60));
        assert_eq!(sleep_for, Duration::from_secs(60));

        let long_down = engine::ConnectState { last_connect_attempt: attempt, connection_ok: false };
        let (sleep_for, _) = reconnect_sleep(long_down, attempt + Duration::from_secs(400));
        assert_eq!(sleep_for, Duration::from_secs(600));
    }
}
