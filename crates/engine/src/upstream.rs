//! Per-upstream 256-slot request table: identifier allocation, retry
//! scheduling, expiry, duplicate suppression, and reply matching (§4.5).
//!
//! Grounded on the owned-record-behind-a-lock shape used elsewhere in this
//! proxy's session state, adapted from a synchronous mutex+condvar pair to
//! `tokio::sync::Mutex`/`Notify` since the writer/reader loops here are
//! async tasks rather than OS threads.
//!
//! `Upstream` only knows this upstream's own secret. Re-encrypting a reply's
//! password-bearing attributes into the origin client's secret is the
//! pipeline's job (it owns the client table); `on_reply` hands back the slot
//! contents needed for that (`orig_auth`, the request authenticator this
//! upstream used, origin client/address) rather than doing the rewrite
//! itself.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use codec::attribute::MESSAGE_AUTHENTICATOR;
use codec::crypto;
use codec::packet::{Code, HEADER_LEN, Packet};
use codec::{Attributes, Result as CodecResult};
use rand::RngCore;
use tokio::sync::{Mutex, Notify};

use crate::{ClientHandle, REQUEST_EXPIRY, REQUEST_RETRIES, STATUS_SERVER_JITTER_MAX, STATUS_SERVER_PERIOD};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    Datagram,
    Stream,
}

pub struct UpstreamConfig {
    pub name: String,
    pub secret: Vec<u8>,
    pub transport: TransportKind,
    pub status_server: bool,
}

struct Slot {
    /// The buffer as sent to this upstream: id already patched at byte 1,
    /// authenticator at `buf[4..20]` is the request authenticator this
    /// upstream's reply must validate against.
    buf: Vec<u8>,
    orig_client: ClientHandle,
    orig_addr: Option<SocketAddr>,
    orig_id: u8,
    orig_auth: [u8; 16],
    is_status_server: bool,
    tries: u32,
    expiry: Instant,
    received: bool,
}

impl Slot {
    fn request_authenticator(&self) -> [u8; 16] {
        let mut auth = [0u8; 16];
        auth.copy_from_slice(&self.buf[4..20]);
        auth
    }
}

struct State {
    slots: Vec<Option<Slot>>,
    next_id: u8,
    new_request: bool,
    last_send: Instant,
    last_connect_attempt: Instant,
    connection_ok: bool,
}

/// What the writer loop should do next, decided under the upstream's lock
/// and returned to the caller so the actual transport I/O (which needs a
/// concrete socket/stream) happens outside the engine crate.
pub enum WriterAction {
    /// Transmit this buffer now.
    Send(Vec<u8>),
    /// Nothing to do; sleep until `Instant` or until woken by a new request.
    WaitUntil(Instant),
}

/// Outcome of validating an inbound reply.
pub enum ReplyOutcome {
    /// Hand to the origin client's reply queue, after the pipeline
    /// re-encrypts MS-MPPE attributes and restores id/authenticator.
    Relay {
        client: ClientHandle,
        addr: Option<SocketAddr>,
        buf: Vec<u8>,
        orig_id: u8,
        orig_auth: [u8; 16],
        request_authenticator: [u8; 16],
    },
    /// A Status-Server liveness ack; nothing to relay.
    StatusAck,
}

/// Snapshot of the reconnect-schedule fields a transport adapter needs
/// (§4.6); mutation happens via [`Upstream::note_connect_attempt`] and
/// [`Upstream::note_connection_ok`].
#[derive(Debug, Clone, Copy)]
pub struct ConnectState {
    pub last_connect_attempt: Instant,
    pub connection_ok: bool,
}

pub struct Upstream {
    pub config: UpstreamConfig,
    state: Mutex<State>,
    notify: Notify,
}

impl Upstream {
    pub fn new(config: UpstreamConfig) -> Self {
        let now = Instant::now();
        Self {
            config,
            state: Mutex::new(State {
                slots: (0..256).map(|_| None).collect(),
                next_id: 0,
                new_request: false,
                last_send: now.checked_sub(STATUS_SERVER_PERIOD).unwrap_or(now),
                last_connect_attempt: now,
                connection_ok: false,
            }),
            notify: Notify::new(),
        }
    }

    /// Duplicate suppression on ingest (§4.5): a pending slot with the same
    /// `(origin_client, orig_id)` means this is a client retransmit.
    pub async fn has_duplicate(&self, orig_client: ClientHandle, orig_id: u8) -> bool {
        let state = self.state.lock().await;
        state
            .slots
            .iter()
            .flatten()
            .any(|s| !s.received && s.orig_client == orig_client && s.orig_id == orig_id)
    }

    /// Slot allocation (sendrq, §4.5). Patches the assigned index into byte
    /// 1 of `buf`, recomputes Message-Authenticator under this upstream's
    /// secret if present, and wakes the writer. Returns `false` if the table
    /// is full (request dropped).
    pub async fn sendrq(
        &self,
        mut buf: Vec<u8>,
        orig_client: ClientHandle,
        orig_addr: Option<SocketAddr>,
        orig_id: u8,
        orig_auth: [u8; 16],
        is_status_server: bool,
    ) -> CodecResult<bool> {
        let mut state = self.state.lock().await;

        let start = state.next_id as usize;
        let index = (0..256)
            .map(|offset| (start + offset) % 256)
            .find(|&idx| state.slots[idx].is_none());

        let Some(index) = index else {
            log::warn!("upstream {}: request table full, dropping request", self.config.name);
            return Ok(false);
        };

        buf[1] = index as u8;
        recompute_message_authenticator(&mut buf, &self.config.secret)?;

        state.slots[index] = Some(Slot {
            buf,
            orig_client,
            orig_addr,
            orig_id,
            orig_auth,
            is_status_server,
            tries: 0,
            expiry: Instant::now(),
            received: false,
        });
        state.next_id = ((index + 1) % 256) as u8;
        state.new_request = true;
        drop(state);
        self.notify.notify_one();
        Ok(true)
    }

    /// One iteration of the writer loop's scan step (§4.5 step 1-2): frees
    /// finished slots, retransmits due ones, and injects a Status-Server
    /// probe when due. Callers loop: call this, act on the returned
    /// `WriterAction`, then call [`Upstream::wait_until`] before calling
    /// again.
    pub async fn writer_tick(&self) -> WriterAction {
        let (to_send, nearest, probe_due) = {
            let mut state = self.state.lock().await;
            state.new_request = false;

            let now = Instant::now();
            let mut nearest: Option<Instant> = None;
            let mut to_send: Option<Vec<u8>> = None;

            for slot in state.slots.iter_mut() {
                let Some(s) = slot else { continue };

                if s.received {
                    *slot = None;
                    continue;
                }

                if now < s.expiry {
                    nearest = Some(nearest.map_or(s.expiry, |n| n.min(s.expiry)));
                    continue;
                }

                let retry_limit = if self.config.transport == TransportKind::Stream || s.is_status_server {
                    1
                } else {
                    REQUEST_RETRIES
                };

                if s.tries >= retry_limit {
                    if s.is_status_server {
                        log::warn!("upstream {}: server dead (status-server probe exhausted)", self.config.name);
                    }
                    *slot = None;
                    continue;
                }

                s.expiry = if self.config.transport == TransportKind::Stream || s.is_status_server {
                    now + REQUEST_EXPIRY
                } else {
                    now + (REQUEST_EXPIRY / REQUEST_RETRIES)
                };
                s.tries += 1;

                if to_send.is_none() {
                    to_send = Some(s.buf.clone());
                } else {
                    nearest = Some(now);
                }
            }

            let probe_due =
                self.config.status_server && now.duration_since(state.last_send) >= STATUS_SERVER_PERIOD;
            if to_send.is_some() {
                state.last_send = now;
            }
            (to_send, nearest, probe_due)
        };

        if let Some(buf) = to_send {
            return WriterAction::Send(buf);
        }

        if probe_due {
            if let Some(probe) = build_status_probe() {
                let now = Instant::now();
                if self
                    .sendrq(probe, ClientHandle(usize::MAX), None, 0, [0u8; 16], true)
                    .await
                    .unwrap_or(false)
                {
                    let mut state = self.state.lock().await;
                    state.last_send = now;
                }
            }
            return WriterAction::WaitUntil(Instant::now() + Duration::from_secs(1));
        }

        let now = Instant::now();
        let wake_at = nearest.unwrap_or_else(|| {
            if self.config.status_server {
                let jitter = (rand::rng().next_u32() % (STATUS_SERVER_JITTER_MAX as u32 + 1)) as u64;
                now + STATUS_SERVER_PERIOD + Duration::from_secs(jitter)
            } else {
                now + Duration::from_secs(3600)
            }
        });
        WriterAction::WaitUntil(wake_at)
    }

    /// Current reconnect-schedule state, read under the upstream's lock
    /// (§4.6: "one mutex guards each upstream, covering ... last_connect_attempt").
    pub async fn connect_state(&self) -> ConnectState {
        let state = self.state.lock().await;
        ConnectState {
            last_connect_attempt: state.last_connect_attempt,
            connection_ok: state.connection_ok,
        }
    }

    /// Records a fresh connect attempt, per the reconnect protocol's
    /// "set `last_connect_attempt = now`" steps.
    pub async fn note_connect_attempt(&self, at: Instant) {
        self.state.lock().await.last_connect_attempt = at;
    }

    /// Records whether the most recent connection attempt succeeded.
    pub async fn note_connection_ok(&self, ok: bool) {
        self.state.lock().await.connection_ok = ok;
    }

    /// Waits until woken by a new `sendrq` or the given deadline, whichever
    /// comes first.
    pub async fn wait_until(&self, deadline: Instant) {
        let sleep = tokio::time::sleep(deadline.saturating_duration_since(Instant::now()));
        tokio::pin!(sleep);
        tokio::select! {
            _ = &mut sleep => {},
            _ = self.notify.notified() => {},
        }
    }

    /// Reader-side reply processing (§4.5 reader task). Accepts only
    /// Access-Accept/Reject/Challenge; validates the reply authenticator and
    /// Message-Authenticator against the slot this reply's id names.
    pub async fn on_reply(&self, buf: Vec<u8>) -> CodecResult<Option<ReplyOutcome>> {
        if buf.len() < HEADER_LEN {
            return Ok(None);
        }
        match Packet::code(&buf) {
            Code::AccessAccept | Code::AccessReject | Code::AccessChallenge => {}
            _ => return Ok(None),
        }

        let id = buf[1] as usize;
        let mut state = self.state.lock().await;
        let Some(slot) = state.slots[id].as_mut() else {
            return Ok(None);
        };
        if slot.tries == 0 || slot.received {
            return Ok(None);
        }

        let request_authenticator = slot.request_authenticator();
        if !crypto::verify_reply_authenticator(&buf, &request_authenticator, &self.config.secret) {
            return Ok(None);
        }

        let region = buf[HEADER_LEN..].to_vec();
        let attrs = Attributes::scan(&region)?;
        if attrs.has(MESSAGE_AUTHENTICATOR)
            && !crypto::verify_message_authenticator_with_authenticator(
                &buf,
                &attrs,
                &request_authenticator,
                &self.config.secret,
            )?
        {
            return Ok(None);
        }

        if slot.is_status_server {
            slot.received = true;
            return Ok(Some(ReplyOutcome::StatusAck));
        }

        let outcome = ReplyOutcome::Relay {
            client: slot.orig_client,
            addr: slot.orig_addr,
            buf,
            orig_id: slot.orig_id,
            orig_auth: slot.orig_auth,
            request_authenticator,
        };
        slot.received = true;
        Ok(Some(outcome))
    }
}

/// Recomputes the Message-Authenticator attribute in place under `secret`,
/// if the packet carries one. Shared by `sendrq` and by the pipeline when it
/// restamps a reply under the origin client's secret.
pub fn recompute_message_authenticator(buf: &mut [u8], secret: &[u8]) -> CodecResult<()> {
    let region = buf[HEADER_LEN..].to_vec();
    let attrs = Attributes::scan(&region)?;
    if !attrs.has(MESSAGE_AUTHENTICATOR) {
        return Ok(());
    }
    let mac = crypto::compute_message_authenticator(buf, &attrs, secret)?;
    let entry = attrs
        .iter()
        .find(|e| e.kind == MESSAGE_AUTHENTICATOR)
        .expect("checked above");
    let (s, e) = (HEADER_LEN + entry.start, HEADER_LEN + entry.end);
    buf[s..e].copy_from_slice(&mac);
    Ok(())
}

/// Builds a Status-Server probe: code 12, length 38, Message-Authenticator
/// attribute with a freshly randomized authenticator field (§4.5 step 3).
fn build_status_probe() -> Option<Vec<u8>> {
    let mut buf = vec![0u8; HEADER_LEN + 18];
    Packet::set_code(&mut buf, Code::StatusServer);
    Packet::set_identifier(&mut buf, 0);
    Packet::set_length(&mut buf, buf.len() as u16);

    let mut auth = [0u8; 16];
    rand::rng().fill_bytes(&mut auth);
    Packet::set_authenticator(&mut buf, &auth);

    buf[HEADER_LEN] = MESSAGE_AUTHENTICATOR;
    buf[HEADER_LEN + 1] = 18;
    Some(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(transport: TransportKind, status_server: bool) -> UpstreamConfig {
        UpstreamConfig {
            name: "U".into(),
            secret: b"up-secret".to_vec(),
            transport,
            status_server,
        }
    }

    #[tokio::test]
    async fn sendrq_assigns_sequential_ids() {
        let upstream = Upstream::new(config(TransportKind::Datagram, false));
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessRequest);

        assert!(upstream.sendrq(buf.clone(), ClientHandle(0), None, 7, [0u8; 16], false).await.unwrap());
        assert!(upstream.sendrq(buf, ClientHandle(0), None, 8, [0u8; 16], false).await.unwrap());

        let state = upstream.state.lock().await;
        assert_eq!(state.slots[0].as_ref().unwrap().orig_id, 7);
        assert_eq!(state.slots[1].as_ref().unwrap().orig_id, 8);
    }

    #[tokio::test]
    async fn duplicate_is_detected_before_a_second_slot_is_allocated() {
        let upstream = Upstream::new(config(TransportKind::Datagram, false));
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessRequest);

        upstream.sendrq(buf.clone(), ClientHandle(3), None, 7, [0u8; 16], false).await.unwrap();
        assert!(upstream.has_duplicate(ClientHandle(3), 7).await);
        assert!(!upstream.has_duplicate(ClientHandle(3), 8).await);
    }

    #[tokio::test]
    async fn retry_budget_releases_slot_after_limit() {
        let upstream = Upstream::new(config(TransportKind::Datagram, false));
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessRequest);
        upstream.sendrq(buf, ClientHandle(0), None, 7, [0u8; 16], false).await.unwrap();

        for _ in 0..REQUEST_RETRIES {
            match upstream.writer_tick().await {
                WriterAction::Send(_) => {}
                WriterAction::WaitUntil(_) => panic!("expected a retransmit"),
            }
            let mut state = upstream.state.lock().await;
            if let Some(slot) = state.slots[0].as_mut() {
                slot.expiry = Instant::now();
            }
        }

        upstream.writer_tick().await;
        let state = upstream.state.lock().await;
        assert!(state.slots[0].is_none());
    }

    #[tokio::test]
    async fn invariant_1_slot_buffer_carries_its_own_index_as_the_identifier_byte() {
        let upstream = Upstream::new(config(TransportKind::Datagram, false));
        for id in 0..5u8 {
            let mut buf = vec![0u8; HEADER_LEN];
            Packet::set_code(&mut buf, Code::AccessRequest);
            upstream.sendrq(buf, ClientHandle(0), None, id, [0u8; 16], false).await.unwrap();
        }

        let state = upstream.state.lock().await;
        for (i, slot) in state.slots.iter().enumerate() {
            if let Some(slot) = slot {
                assert_eq!(slot.buf[1], i as u8);
            }
        }
    }

    #[tokio::test]
    async fn s5_reply_with_bad_authenticator_is_ignored_and_slot_stays_occupied() {
        let upstream = Upstream::new(config(TransportKind::Datagram, false));
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessRequest);
        upstream.sendrq(buf, ClientHandle(0), None, 7, [9u8; 16], false).await.unwrap();

        // writer_tick stamps the slot's request authenticator into buf[4..20]
        // of the buffer it hands back for transmission.
        let sent = match upstream.writer_tick().await {
            WriterAction::Send(buf) => buf,
            WriterAction::WaitUntil(_) => panic!("expected the fresh request to be due immediately"),
        };
        let mut request_auth = [0u8; 16];
        request_auth.copy_from_slice(&sent[4..20]);

        let mut reply = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut reply, Code::AccessAccept);
        Packet::set_identifier(&mut reply, 0);
        let mut wrong_auth = [0u8; 16];
        rand::rng().fill_bytes(&mut wrong_auth);
        assert_ne!(wrong_auth, request_auth);
        Packet::set_authenticator(&mut reply, &wrong_auth);
        Packet::set_length(&mut reply, HEADER_LEN as u16);

        assert!(upstream.on_reply(reply).await.unwrap().is_none());

        let state = upstream.state.lock().await;
        assert!(state.slots[0].is_some(), "slot must stay occupied for a reply that fails authenticator verification");
        assert!(!state.slots[0].as_ref().unwrap().received);
    }
}
