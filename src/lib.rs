pub mod config;
pub mod logger;
pub mod server;

use std::sync::Arc;

use ahash::HashMap;
use engine::{ClientHandle, TransportKind};

use self::config::Config;

/// In order to let integration tests drive the proxy directly, the body of
/// `main` lives here rather than in the binary.
pub async fn startup(config: Config) -> anyhow::Result<()> {
    let mut clients = engine::ClientTable::default();
    let mut peers = Vec::new();
    let mut acceptors: HashMap<ClientHandle, Arc<openssl::ssl::SslAcceptor>> = HashMap::default();

    let udp_client_count = config
        .clients
        .iter()
        .filter(|c| c.transport == TransportKind::Datagram)
        .count()
        .max(1);
    let udp_replies = Arc::new(engine::ReplyQueue::new(engine::MAX_REQUESTS * udp_client_count));

    for client in &config.clients {
        let default_port = match client.transport {
            TransportKind::Datagram => 1812,
            TransportKind::Stream => 2083,
        };
        let addresses = config::resolve_peer_addresses(&client.name, default_port)?;
        peers.push(engine::ResolvedPeer { name: client.name.clone(), addresses });

        let replies = match client.transport {
            TransportKind::Datagram => udp_replies.clone(),
            TransportKind::Stream => Arc::new(engine::ReplyQueue::default()),
        };

        let handle = clients.push(
            engine::ClientConfig {
                name: client.name.clone(),
                secret: client.secret.clone().into_bytes(),
                transport: client.transport,
            },
            replies,
        );

        if client.transport == TransportKind::Stream {
            let tls_name = client
                .tls
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("client {} is TLS but has no TLS context", client.name))?;
            let tls_config = config
                .tls
                .get(tls_name)
                .ok_or_else(|| anyhow::anyhow!("client {} references unknown TLS context {tls_name}", client.name))?;
            acceptors.insert(handle, Arc::new(server::tls::build_acceptor(tls_config)?));
        }
    }

    let peers = engine::PeerRegistry::new(peers);

    let mut realm_rules = Vec::new();
    for realm in &config.realms {
        let action = match &realm.server {
            Some(name) => engine::RealmAction::Forward(name.clone()),
            None => engine::RealmAction::Reject(realm.reply_message.clone()),
        };
        realm_rules.push(engine::RealmRule::compile(&realm.pattern, action)?);
    }
    let realms = engine::RealmTable::new(realm_rules);

    let mut upstreams: HashMap<String, Arc<engine::Upstream>> = HashMap::default();
    let mut upstream_targets = Vec::new();
    for server_cfg in &config.servers {
        let upstream = Arc::new(engine::Upstream::new(engine::UpstreamConfig {
            name: server_cfg.name.clone(),
            secret: server_cfg.secret.clone().into_bytes(),
            transport: server_cfg.transport,
            status_server: server_cfg.status_server,
        }));
        let addresses = config::resolve_peer_addresses(&server_cfg.name, server_cfg.port)?;
        upstreams.insert(server_cfg.name.clone(), upstream.clone());
        upstream_targets.push((server_cfg.clone(), upstream, addresses));
    }

    let shared = Arc::new(server::Shared { clients, peers, realms, upstreams });

    for addr in &config.listen_udp {
        let socket = Arc::new(tokio::net::UdpSocket::bind(addr).await?);
        tokio::spawn(server::udp::run_ingest(socket.clone(), shared.clone()));
        tokio::spawn(server::udp::run_reply_writer(socket, udp_replies.clone()));
    }

    if !config.listen_tcp.is_empty() {
        let acceptors = Arc::new(acceptors);
        for addr in &config.listen_tcp {
            let listener = tokio::net::TcpListener::bind(addr).await?;
            tokio::spawn(server::tls::run_accept(listener, acceptors.clone(), shared.clone()));
        }
    }

    for (server_cfg, upstream, addresses) in upstream_targets {
        match server_cfg.transport {
            TransportKind::Datagram => {
                let Some(addr) = addresses.first().copied() else {
                    anyhow::bail!("server {} has no resolvable address", server_cfg.name);
                };
                let socket = tokio::net::UdpSocket::bind(("0.0.0.0", 0)).await?;
                socket.connect(addr).await?;
                tokio::spawn(server::udp::run_upstream(Arc::new(socket), upstream, shared.clone()));
            }
            TransportKind::Stream => {
                let tls_name = server_cfg
                    .tls
                    .as_deref()
                    .ok_or_else(|| anyhow::anyhow!("server {} is TLS but has no TLS context", server_cfg.name))?;
                let tls_config = config.tls.get(tls_name).ok_or_else(|| {
                    anyhow::anyhow!("server {} references unknown TLS context {tls_name}", server_cfg.name)
                })?;
                let connector = Arc::new(server::tls::build_connector(tls_config)?);
                tokio::spawn(server::tls::run_upstream(
                    addresses,
                    server_cfg.name.clone(),
                    connector,
                    upstream,
                    shared.clone(),
                ));
            }
        }
    }

    std::future::pending::<()>().await;
    Ok(())
}
