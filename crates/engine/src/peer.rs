//! Resolves configured clients/servers to frozen address sets at startup and
//! answers "which configured peer sent this packet" by reverse lookup.

use std::net::{IpAddr, Ipv6Addr, SocketAddr};

use ahash::HashMap;

/// Normalizes an IPv4-mapped IPv6 address to its IPv4 form before
/// comparison, per §4.3.
fn normalize(addr: IpAddr) -> IpAddr {
    match addr {
        IpAddr::V6(v6) => v6.to_ipv4_mapped().map(IpAddr::V4).unwrap_or(IpAddr::V6(v6)),
        other => other,
    }
}

/// A peer's startup-resolved address set. Never refreshed after startup.
#[derive(Debug, Clone)]
pub struct ResolvedPeer {
    pub name: String,
    pub addresses: Vec<SocketAddr>,
}

impl ResolvedPeer {
    /// Matches by IP only. Real clients send/connect from an ephemeral
    /// OS-assigned source port, not the port they were configured/resolved
    /// under, so the port a `Client`/`Server` block resolved to is
    /// irrelevant to "did this packet come from this peer" (§4.3).
    fn contains(&self, source: SocketAddr) -> bool {
        let source_ip = normalize(source.ip());
        self.addresses.iter().any(|addr| normalize(addr.ip()) == source_ip)
    }
}

/// A frozen table of resolved peers, built once at startup and consulted on
/// every inbound packet for reverse lookup.
#[derive(Debug, Default, Clone)]
pub struct PeerRegistry {
    peers: Vec<ResolvedPeer>,
    by_name: HashMap<String, usize>,
}

impl PeerRegistry {
    pub fn new(peers: Vec<ResolvedPeer>) -> Self {
        let by_name = peers
            .iter()
            .enumerate()
            .map(|(i, p)| (p.name.clone(), i))
            .collect();
        Self { peers, by_name }
    }

    /// Reverse-lookup: which configured peer owns this source address.
    /// First match wins (§4.3); unmatched sources should be dropped by the
    /// caller with a warning.
    pub fn resolve(&self, source: SocketAddr) -> Option<&ResolvedPeer> {
        self.peers.iter().find(|p| p.contains(source))
    }

    pub fn by_name(&self, name: &str) -> Option<&ResolvedPeer> {
        self.by_name.get(name).map(|&i| &self.peers[i])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_exact_match() {
        let registry = PeerRegistry::new(vec![ResolvedPeer {
            name: "nas1".into(),
            addresses: vec!["10.0.0.1:1812".parse().unwrap()],
        }]);

        let found = registry.resolve("10.0.0.1:1812".parse().unwrap()).unwrap();
        assert_eq!(found.name, "nas1");
        assert!(registry.resolve("10.0.0.2:1812".parse().unwrap()).is_none());
    }

    #[test]
    fn resolves_regardless_of_the_peer_s_ephemeral_source_port() {
        let registry = PeerRegistry::new(vec![ResolvedPeer {
            name: "nas1".into(),
            addresses: vec!["10.0.0.1:1812".parse().unwrap()],
        }]);

        let found = registry.resolve("10.0.0.1:54321".parse().unwrap()).unwrap();
        assert_eq!(found.name, "nas1");
    }

    #[test]
    fn ipv4_mapped_ipv6_compares_as_ipv4() {
        let registry = PeerRegistry::new(vec![ResolvedPeer {
            name: "nas1".into(),
            addresses: vec!["10.0.0.1:1812".parse().unwrap()],
        }]);

        let mapped: SocketAddr = "[::ffff:10.0.0.1]:1812".parse().unwrap();
        assert!(registry.resolve(mapped).is_some());
    }
}
