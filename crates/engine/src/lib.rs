//! Request/response correlation engine for a RADIUS proxy: realm routing,
//! per-upstream request tables, reply queues, and the attribute-rewriting
//! pipeline that moves a request from one shared secret to another.

pub mod client;
pub mod peer;
pub mod pipeline;
pub mod realm;
pub mod reply_queue;
pub mod upstream;

pub use client::{ClientConfig, ClientTable};
pub use peer::{PeerRegistry, ResolvedPeer};
pub use pipeline::{IngestOutcome, ingest, relay_reply};
pub use realm::{RealmAction, RealmRule, RealmTable};
pub use reply_queue::ReplyQueue;
pub use upstream::{ConnectState, ReplyOutcome, TransportKind, Upstream, UpstreamConfig, WriterAction};

use std::time::Duration;

/// Default retry count for datagram upstream requests (§4.5, §8 item 7).
pub const REQUEST_RETRIES: u32 = 3;
/// Total time budget across all datagram retries for one request.
pub const REQUEST_EXPIRY: Duration = Duration::from_secs(20);
/// Nominal interval between Status-Server keepalive probes.
pub const STATUS_SERVER_PERIOD: Duration = Duration::from_secs(25);
/// Upper end of the jittered Status-Server wakeup window.
pub const STATUS_SERVER_JITTER_MAX: u64 = 7;
/// Per-client/per-upstream reply queue capacity.
pub const MAX_REQUESTS: usize = 256;

/// A stable, non-owning reference to a configured client, used by request
/// slots to avoid owning the client they originated from (§9: cyclic
/// references). Indexes into a startup-frozen client table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientHandle(pub usize);

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Codec(#[from] codec::Error),
    #[error("realm pattern is not a valid regex: {0}")]
    InvalidRealmPattern(#[from] regex::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
