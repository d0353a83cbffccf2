//! Transport adapters (§4.6): datagram listener/reply-writer and TLS
//! accept/reconnect loops, built on top of the transport-agnostic correlation
//! engine.

pub mod tls;
pub mod udp;

use std::sync::Arc;

use ahash::HashMap;
use engine::{ClientTable, PeerRegistry, RealmTable, Upstream};

/// Startup-frozen routing state every listener/writer task is handed an
/// `Arc` of.
pub struct Shared {
    pub clients: ClientTable,
    pub peers: PeerRegistry,
    pub realms: RealmTable,
    pub upstreams: HashMap<String, Arc<Upstream>>,
}
