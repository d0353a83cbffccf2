//! Startup-frozen table of configured clients, indexed by [`ClientHandle`]
//! so request-table slots can reference their origin client without owning
//! it (§9: cyclic references).

use std::sync::Arc;

use crate::reply_queue::ReplyQueue;
use crate::upstream::TransportKind;
use crate::ClientHandle;

pub struct ClientConfig {
    pub name: String,
    pub secret: Vec<u8>,
    pub transport: TransportKind,
}

pub struct ClientEntry {
    pub config: ClientConfig,
    /// Datagram clients conventionally share one process-wide queue (§4.7);
    /// stream clients each own theirs. Either way the table just holds a
    /// handle, so the caller that builds it decides which.
    pub replies: Arc<ReplyQueue>,
}

#[derive(Default)]
pub struct ClientTable {
    entries: Vec<ClientEntry>,
}

impl ClientTable {
    pub fn push(&mut self, config: ClientConfig, replies: Arc<ReplyQueue>) -> ClientHandle {
        let handle = ClientHandle(self.entries.len());
        self.entries.push(ClientEntry { config, replies });
        handle
    }

    pub fn get(&self, handle: ClientHandle) -> Option<&ClientEntry> {
        self.entries.get(handle.0)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ClientHandle, &ClientEntry)> {
        self.entries.iter().enumerate().map(|(i, e)| (ClientHandle(i), e))
    }

    /// Looks up a client's handle by its configured name, e.g. after a
    /// [`crate::PeerRegistry`] reverse lookup resolves a source address to a
    /// peer name.
    pub fn find_by_name(&self, name: &str) -> Option<ClientHandle> {
        self.entries
            .iter()
            .position(|e| e.config.name == name)
            .map(ClientHandle)
    }
}
