//! Datagram transport (§4.6): a shared listening socket for inbound client
//! requests, a shared reply-writer task, and a connected per-upstream
//! send/receive pair.
//!
//! Grounded on the accept/size-check shape of a UDP ingest loop, adapted from
//! a single-protocol relay loop to one that hands each packet to the
//! correlation engine rather than processing it inline.

use std::net::SocketAddr;
use std::sync::Arc;

use engine::{ClientHandle, IngestOutcome, ReplyOutcome, Upstream};
use tokio::net::UdpSocket;

use crate::server::Shared;

const MAX_DATAGRAM: usize = 65536;

/// Inbound listener for datagram clients: one socket, one task, demuxing by
/// source address through the peer registry.
pub async fn run_ingest(socket: Arc<UdpSocket>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (cnt, source) = match socket.recv_from(&mut buf).await {
            Ok(v) => v,
            Err(err) => {
                log::warn!("datagram recv failed: {err}");
                continue;
            }
        };

        let declared = match codec::packet::Packet::received_len(&buf[..cnt]) {
            Ok(len) => len,
            Err(err) => {
                log::debug!("dropping datagram from {source}: {err}");
                continue;
            }
        };

        let Some(peer) = shared.peers.resolve(source) else {
            log::info!("datagram packet from unconfigured peer {source}, dropping");
            continue;
        };
        let Some(handle) = shared.clients.find_by_name(&peer.name) else {
            continue;
        };

        let packet = buf[..declared].to_vec();
        if let Err(err) = ingest_one(packet, handle, Some(source), &shared).await {
            log::warn!("ingest failed for {source}: {err}");
        }
    }
}

async fn ingest_one(
    packet: Vec<u8>,
    handle: ClientHandle,
    source: Option<SocketAddr>,
    shared: &Shared,
) -> codec::Result<()> {
    let outcome = engine::ingest(packet, handle, source, &shared.clients, &shared.realms, &shared.upstreams).await?;
    match outcome {
        IngestOutcome::Forwarded | IngestOutcome::RepliedLocally => {}
        IngestOutcome::Dropped(reason) => log::debug!("dropped: {reason}"),
    }
    Ok(())
}

/// Shared reply-writer task (§4.7): datagram clients all drain the same
/// queue, since a reply carries its own destination address.
pub async fn run_reply_writer(socket: Arc<UdpSocket>, replies: Arc<engine::ReplyQueue>) {
    loop {
        let entry = replies.pop().await;
        let Some(addr) = entry.addr else {
            log::warn!("datagram reply queue entry missing a destination address");
            continue;
        };
        if let Err(err) = socket.send_to(&entry.buf, addr).await {
            log::warn!("datagram reply send to {addr} failed: {err}");
        }
    }
}

/// Runs a connected datagram upstream: spawns the reader task and runs the
/// writer loop inline. `socket` must already be `connect()`-ed to the
/// upstream's resolved address.
pub async fn run_upstream(socket: Arc<UdpSocket>, upstream: Arc<Upstream>, shared: Arc<Shared>) {
    let reader_socket = socket.clone();
    let reader_upstream = upstream.clone();
    let reader_shared = shared.clone();
    tokio::spawn(async move {
        run_upstream_reader(reader_socket, reader_upstream, reader_shared).await;
    });

    loop {
        match upstream.writer_tick().await {
            engine::WriterAction::Send(buf) => {
                if let Err(err) = socket.send(&buf).await {
                    log::warn!("upstream {} send failed: {err}", upstream.config.name);
                }
            }
            engine::WriterAction::WaitUntil(deadline) => upstream.wait_until(deadline).await,
        }
    }
}

async fn run_upstream_reader(socket: Arc<UdpSocket>, upstream: Arc<Upstream>, shared: Arc<Shared>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let cnt = match socket.recv(&mut buf).await {
            Ok(cnt) => cnt,
            Err(err) => {
                log::warn!("upstream {} recv failed: {err}", upstream.config.name);
                continue;
            }
        };
        if cnt < 20 {
            continue;
        }

        match upstream.on_reply(buf[..cnt].to_vec()).await {
            Ok(Some(ReplyOutcome::StatusAck)) => {}
            Ok(Some(outcome @ ReplyOutcome::Relay { .. })) => {
                if let Err(err) = engine::relay_reply(outcome, &shared.clients, &upstream.config.secret).await {
                    log::warn!("upstream {}: failed to relay reply: {err}", upstream.config.name);
                }
            }
            Ok(None) => {}
            Err(err) => log::warn!("upstream {}: malformed reply: {err}", upstream.config.name),
        }
    }
}
