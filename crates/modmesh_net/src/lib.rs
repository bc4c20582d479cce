//! Module discovery and transport: namespace store, peer registry, signed
//! client calls and the global namespace sync.

mod client;
mod fanout;
mod namespace;
mod namespace_sync;
mod peer_registry;
mod transport;

pub use client::{CallOptions, ClientConfig, Kwargs, ModuleClient};
pub use fanout::scatter_gather;
pub use namespace::{
    is_address_literal, NamespaceMap, NamespaceScope, NamespaceStore, GLOBAL_NAMESPACE_KEY,
    LOCAL_NAMESPACE_KEY, REMOTE_NAMESPACE_KEY,
};
pub use namespace_sync::{NamespaceSync, NamespaceSyncConfig, SyncReport, NAMESPACE_FUNCTION};
pub use peer_registry::{
    peer_tag, remote_names, rewrite_wildcard_hosts, PeerEntry, PeerRegistry, PEER_REGISTRY_KEY,
};
pub use transport::{
    read_frame, write_frame, InMemoryTransport, TcpTransport, Transport, MAX_FRAME_PAYLOAD,
};
