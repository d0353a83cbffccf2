//! Request ingest (radsrv, §4.8) and reply relay: the glue between the
//! realm matcher, the client table, and per-upstream request tables.

use std::net::SocketAddr;
use std::sync::Arc;

use ahash::HashMap;
use codec::attribute::MESSAGE_AUTHENTICATOR;
use codec::crypto;
use codec::packet::{Code, HEADER_LEN, Packet};
use codec::{Attributes, Result as CodecResult};
use rand::RngCore;

use crate::client::ClientTable;
use crate::realm::{RealmAction, RealmTable};
use crate::reply_queue::ReplyEntry;
use crate::upstream::{recompute_message_authenticator, ReplyOutcome, Upstream};
use crate::ClientHandle;

const USER_NAME: u8 = 1;
const USER_PASSWORD: u8 = 2;
const REPLY_MESSAGE: u8 = 18;
const TUNNEL_PASSWORD: u8 = 69;
const MS_VENDOR: u32 = 311;
const MS_MPPE_SEND_KEY: u8 = 16;
const MS_MPPE_RECV_KEY: u8 = 17;

#[derive(Debug, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Handed off to the destination upstream's request table.
    Forwarded,
    /// A synthesized Access-Reject/Access-Accept was enqueued directly.
    RepliedLocally,
    /// Dropped; the `&'static str` names why, for logging at the caller.
    Dropped(&'static str),
}

/// Request ingest (radsrv, §4.8).
pub async fn ingest(
    mut buf: Vec<u8>,
    origin: ClientHandle,
    origin_addr: Option<SocketAddr>,
    clients: &ClientTable,
    realms: &RealmTable,
    upstreams: &HashMap<String, Arc<Upstream>>,
) -> CodecResult<IngestOutcome> {
    let Some(client) = clients.get(origin) else {
        return Ok(IngestOutcome::Dropped("unknown client handle"));
    };

    match Packet::code(&buf) {
        Code::AccessRequest | Code::StatusServer => {}
        _ => return Ok(IngestOutcome::Dropped("not an Access-Request or Status-Server")),
    }

    let region = buf[HEADER_LEN..].to_vec();
    let attrs = Attributes::scan(&region)?;

    let orig_id = buf[1];
    let mut orig_auth = [0u8; 16];
    orig_auth.copy_from_slice(&buf[4..20]);

    let destination = if Packet::code(&buf) == Code::AccessRequest {
        let Some(user_name) = attrs.find(&region, USER_NAME) else {
            return Ok(IngestOutcome::Dropped("missing User-Name"));
        };
        let user_name = String::from_utf8_lossy(user_name).into_owned();

        match realms.resolve(&user_name) {
            None => return Ok(IngestOutcome::Dropped("no matching realm")),
            Some(RealmAction::Reject(reply_message)) => {
                let reject = synth_reject(&buf, reply_message.as_deref(), &client.config.secret)?;
                client.replies.push(ReplyEntry { buf: reject, addr: origin_addr }).await;
                return Ok(IngestOutcome::RepliedLocally);
            }
            Some(RealmAction::Forward(name)) => name.clone(),
        }
    } else {
        String::new()
    };

    let upstream = if Packet::code(&buf) == Code::AccessRequest {
        match upstreams.get(&destination) {
            Some(u) => Some(u.clone()),
            None => return Ok(IngestOutcome::Dropped("realm names an unknown upstream")),
        }
    } else {
        // Status-Server has no realm; the caller is expected to route it to
        // a specific upstream out of band (each upstream probes itself).
        None
    };

    if let Some(upstream) = &upstream {
        if upstream.has_duplicate(origin, orig_id).await {
            return Ok(IngestOutcome::Dropped("duplicate retransmit"));
        }
    }

    if attrs.has(MESSAGE_AUTHENTICATOR)
        && !crypto::verify_message_authenticator(&buf, &attrs, &client.config.secret)?
    {
        return Ok(IngestOutcome::Dropped("bad Message-Authenticator"));
    }

    if Packet::code(&buf) == Code::StatusServer {
        let accept = synth_status_accept(&buf, &client.config.secret)?;
        client.replies.push(ReplyEntry { buf: accept, addr: origin_addr }).await;
        return Ok(IngestOutcome::RepliedLocally);
    }

    let Some(upstream) = upstream else {
        return Ok(IngestOutcome::Dropped("no destination upstream"));
    };

    let mut new_auth = [0u8; 16];
    rand::rng().fill_bytes(&mut new_auth);

    reencrypt_password_attributes(&mut buf, &client.config.secret, &orig_auth, &upstream.config.secret, &new_auth)?;
    buf[4..20].copy_from_slice(&new_auth);

    let sent = upstream.sendrq(buf, origin, origin_addr, orig_id, orig_auth, false).await?;
    Ok(if sent {
        IngestOutcome::Forwarded
    } else {
        IngestOutcome::Dropped("upstream request table full")
    })
}

/// Re-encrypts a reply validated by [`Upstream::on_reply`] into the origin
/// client's secret and enqueues it to that client's reply queue.
pub async fn relay_reply(
    outcome: ReplyOutcome,
    clients: &ClientTable,
    upstream_secret: &[u8],
) -> CodecResult<()> {
    let ReplyOutcome::Relay { client, addr, mut buf, orig_id, orig_auth, request_authenticator } = outcome else {
        return Ok(());
    };

    let Some(client_entry) = clients.get(client) else {
        log::warn!("reply matched a slot whose origin client no longer exists");
        return Ok(());
    };

    reencrypt_mppe_attributes(&mut buf, upstream_secret, &request_authenticator, &client_entry.config.secret, &orig_auth)?;

    buf[1] = orig_id;
    buf[4..20].copy_from_slice(&orig_auth);
    recompute_message_authenticator(&mut buf, &client_entry.config.secret)?;

    client_entry.replies.push(ReplyEntry { buf, addr }).await;
    Ok(())
}

fn synth_reject(request: &[u8], reply_message: Option<&str>, secret: &[u8]) -> CodecResult<Vec<u8>> {
    let mut buf = request[..HEADER_LEN].to_vec();
    Packet::set_code(&mut buf, Code::AccessReject);

    if let Some(message) = reply_message {
        let bytes = message.as_bytes();
        buf.push(REPLY_MESSAGE);
        buf.push((bytes.len() + 2) as u8);
        buf.extend_from_slice(bytes);
    }

    Packet::set_length(&mut buf, buf.len() as u16);
    crypto::sign_response_authenticator(&mut buf, secret);
    Ok(buf)
}

fn synth_status_accept(request: &[u8], secret: &[u8]) -> CodecResult<Vec<u8>> {
    let mut buf = request[..HEADER_LEN].to_vec();
    Packet::set_code(&mut buf, Code::AccessAccept);
    Packet::set_length(&mut buf, HEADER_LEN as u16);
    crypto::sign_response_authenticator(&mut buf, secret);
    Ok(buf)
}

fn reencrypt_password_attributes(
    buf: &mut [u8],
    from_secret: &[u8],
    from_authenticator: &[u8; 16],
    to_secret: &[u8],
    to_authenticator: &[u8; 16],
) -> CodecResult<()> {
    let region = buf[HEADER_LEN..].to_vec();
    let attrs = Attributes::scan(&region)?;

    for kind in [USER_PASSWORD, TUNNEL_PASSWORD] {
        for entry in attrs.iter().filter(|e| e.kind == kind) {
            let cipher = &region[entry.start..entry.end];
            let reencrypted = crypto::reencrypt_password(cipher, from_secret, from_authenticator, to_secret, to_authenticator)?;
            let (s, e) = (HEADER_LEN + entry.start, HEADER_LEN + entry.end);
            buf[s..e].copy_from_slice(&reencrypted);
        }
    }
    Ok(())
}

fn reencrypt_mppe_attributes(
    buf: &mut [u8],
    from_secret: &[u8],
    from_authenticator: &[u8; 16],
    to_secret: &[u8],
    to_authenticator: &[u8; 16],
) -> CodecResult<()> {
    let region = buf[HEADER_LEN..].to_vec();
    let attrs = Attributes::scan(&region)?;

    for sub_type in [MS_MPPE_SEND_KEY, MS_MPPE_RECV_KEY] {
        if let Some((start, end)) = attrs.find_vendor_range(&region, MS_VENDOR, sub_type)? {
            let reencrypted = crypto::reencrypt_mppe_key(&region[start..end], from_secret, from_authenticator, to_secret, to_authenticator)?;
            let (s, e) = (HEADER_LEN + start, HEADER_LEN + end);
            buf[s..e].copy_from_slice(&reencrypted);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::ClientConfig;
    use crate::realm::RealmRule;
    use crate::reply_queue::ReplyQueue;
    use crate::upstream::{TransportKind, UpstreamConfig};

    fn access_request(id: u8, user_name: &str, password_cipher: &[u8]) -> Vec<u8> {
        let mut buf = vec![0u8; HEADER_LEN];
        Packet::set_code(&mut buf, Code::AccessRequest);
        Packet::set_identifier(&mut buf, id);
        let auth = [5u8; 16];
        Packet::set_authenticator(&mut buf, &auth);

        buf.push(USER_NAME);
        buf.push((user_name.len() + 2) as u8);
        buf.extend_from_slice(user_name.as_bytes());

        buf.push(USER_PASSWORD);
        buf.push((password_cipher.len() + 2) as u8);
        buf.extend_from_slice(password_cipher);

        Packet::set_length(&mut buf, buf.len() as u16);
        buf
    }

    #[tokio::test]
    async fn s1_datagram_accept_forwards_with_reencrypted_password() {
        let client_secret = b"testing123";
        let up_secret = b"up-secret";
        let request_auth = [5u8; 16];

        let plain_password = b"hunter22hunter22".to_vec(); // 16 bytes
        let cipher = crypto::encrypt_password(&plain_password, client_secret, &request_auth).unwrap();
        let buf = access_request(7, "alice@example.com", &cipher);

        let mut clients = ClientTable::default();
        let handle = clients.push(
            ClientConfig {
                name: "nas1".into(),
                secret: client_secret.to_vec(),
                transport: TransportKind::Datagram,
            },
            Arc::new(ReplyQueue::default()),
        );

        let mut realm_map: HashMap<String, Arc<Upstream>> = HashMap::default();
        let upstream = Arc::new(Upstream::new(UpstreamConfig {
            name: "U".into(),
            secret: up_secret.to_vec(),
            transport: TransportKind::Datagram,
            status_server: false,
        }));
        realm_map.insert("U".into(), upstream.clone());

        let realms = RealmTable::new(vec![
            RealmRule::compile("example.com", RealmAction::Forward("U".into())).unwrap(),
        ]);

        let outcome = ingest(buf, handle, Some("203.0.113.9:1812".parse().unwrap()), &clients, &realms, &realm_map)
            .await
            .unwrap();
        assert_eq!(outcome, IngestOutcome::Forwarded);
    }

    #[tokio::test]
    async fn s2_realm_miss_drops() {
        let client_secret = b"testing123";
        let request_auth = [5u8; 16];
        let plain_password = b"hunter22hunter22".to_vec();
        let cipher = crypto::encrypt_password(&plain_password, client_secret, &request_auth).unwrap();
        let buf = access_request(7, "bob@other.com", &cipher);

        let mut clients = ClientTable::default();
        let handle = clients.push(
            ClientConfig {
                name: "nas1".into(),
                secret: client_secret.to_vec(),
                transport: TransportKind::Datagram,
            },
            Arc::new(ReplyQueue::default()),
        );

        let realm_map: HashMap<String, Arc<Upstream>> = HashMap::default();
        let realms = RealmTable::new(vec![
            RealmRule::compile("example.com", RealmAction::Forward("U".into())).unwrap(),
        ]);

        let outcome = ingest(buf, handle, None, &clients, &realms, &realm_map).await.unwrap();
        assert_eq!(outcome, IngestOutcome::Dropped("no matching realm"));
    }

    #[tokio::test]
    async fn s3_no_server_realm_synthesizes_reject_with_reply_message() {
        let client_secret = b"testing123";
        let request_auth = [5u8; 16];
        let plain_password = b"hunter22hunter22".to_vec();
        let cipher = crypto::encrypt_password(&plain_password, client_secret, &request_auth).unwrap();
        let buf = access_request(42, "x@foo.bv", &cipher);

        let mut clients = ClientTable::default();
        let handle = clients.push(
            ClientConfig {
                name: "nas1".into(),
                secret: client_secret.to_vec(),
                transport: TransportKind::Datagram,
            },
            Arc::new(ReplyQueue::default()),
        );

        let realm_map: HashMap<String, Arc<Upstream>> = HashMap::default();
        let realms = RealmTable::new(vec![
            RealmRule::compile(r"/@.*\.bv$/", RealmAction::Reject(Some("Blocked".into()))).unwrap(),
        ]);

        let outcome = ingest(buf, handle, None, &clients, &realms, &realm_map).await.unwrap();
        assert_eq!(outcome, IngestOutcome::RepliedLocally);

        let entry = clients.get(handle).unwrap().replies.pop().await;
        assert_eq!(Packet::code(&entry.buf), Code::AccessReject);
        assert_eq!(Packet::identifier(&entry.buf), 42);
    }

    #[tokio::test]
    async fn s4_duplicate_retransmit_is_dropped_before_a_second_slot_is_used() {
        let client_secret = b"testing123";
        let request_auth = [5u8; 16];
        let plain_password = b"hunter22hunter22".to_vec();
        let cipher = crypto::encrypt_password(&plain_password, client_secret, &request_auth).unwrap();
        let buf = access_request(7, "alice@example.com", &cipher);

        let mut clients = ClientTable::default();
        let handle = clients.push(
            ClientConfig {
                name: "nas1".into(),
                secret: client_secret.to_vec(),
                transport: TransportKind::Datagram,
            },
            Arc::new(ReplyQueue::default()),
        );

        let mut realm_map: HashMap<String, Arc<Upstream>> = HashMap::default();
        let upstream = Arc::new(Upstream::new(UpstreamConfig {
            name: "U".into(),
            secret: b"up-secret".to_vec(),
            transport: TransportKind::Datagram,
            status_server: false,
        }));
        realm_map.insert("U".into(), upstream.clone());

        let realms = RealmTable::new(vec![
            RealmRule::compile("example.com", RealmAction::Forward("U".into())).unwrap(),
        ]);

        let first = ingest(buf.clone(), handle, None, &clients, &realms, &realm_map).await.unwrap();
        assert_eq!(first, IngestOutcome::Forwarded);

        let retransmit = ingest(buf, handle, None, &clients, &realms, &realm_map).await.unwrap();
        assert_eq!(retransmit, IngestOutcome::Dropped("duplicate retransmit"));

        match upstream.writer_tick().await {
            crate::upstream::WriterAction::Send(_) => {}
            crate::upstream::WriterAction::WaitUntil(_) => panic!("expected the single forwarded request to be due"),
        }
        // No second slot was ever allocated for the retransmit, so a second
        // tick immediately after has nothing newly due to send.
        match upstream.writer_tick().await {
            crate::upstream::WriterAction::WaitUntil(_) => {}
            crate::upstream::WriterAction::Send(_) => panic!("a second outbound was sent for a duplicate retransmit"),
        }
    }
}
