//! Peer registry (§4.5, §3 "Peer").
//!
//! Grounded on `spark-switch/src/core/session_manager.rs`'s
//! find-or-insert repository shape, adapted from `DashMap` to a plain
//! `HashMap` since everything here is already run-loop-owned and single
//! threaded (§5) — the concurrent map has no job to do.

use std::collections::HashMap;

use telehash_transport_udp::NetworkPath;

use crate::crypto::RsaPublicKey;
use crate::dht::{PeerDirectory, PeerDirectoryEntry};
use crate::hashname::Hashname;

/// Per-remote-hashname record (§3).
#[derive(Debug)]
pub struct Peer {
    hashname: Hashname,
    pubkey: Option<RsaPublicKey>,
    paths: Vec<NetworkPath>,
    active_path: Option<NetworkPath>,
    via: Vec<Hashname>,
}

impl Peer {
    fn new(hashname: Hashname) -> Self {
        Self {
            hashname,
            pubkey: None,
            paths: Vec::new(),
            active_path: None,
            via: Vec::new(),
        }
    }

    pub fn hashname(&self) -> Hashname {
        self.hashname
    }

    pub fn pubkey(&self) -> Option<&RsaPublicKey> {
        self.pubkey.as_ref()
    }

    /// `pubkey` is monotonic: once set, only the same key bytes may be
    /// written again. Returns `false` (a no-op) on a conflicting write.
    pub fn set_public_key(&mut self, key: RsaPublicKey) -> bool {
        match &self.pubkey {
            Some(existing) if existing != &key => false,
            _ => {
                self.pubkey = Some(key);
                true
            }
        }
    }

    pub fn paths(&self) -> &[NetworkPath] {
        &self.paths
    }

    /// Record a newly learned path, in learning order, without
    /// duplicating an already-known one.
    pub fn add_net_path(&mut self, path: NetworkPath) {
        if !self.paths.contains(&path) {
            self.paths.push(path);
        }
    }

    pub fn active_path(&self) -> Option<NetworkPath> {
        self.active_path
    }

    /// Select the active path. No-op (and silently ignored) if `path` is
    /// not among the peer's known paths, preserving the invariant
    /// `active_path ∈ paths ∪ {null}`.
    pub fn set_active_path(&mut self, path: NetworkPath) {
        if self.paths.contains(&path) {
            self.active_path = Some(path);
        }
    }

    pub fn set_active_paths(&mut self, paths: &[NetworkPath]) {
        for path in paths {
            self.add_net_path(*path);
        }
        if self.active_path.is_none() {
            if let Some(first) = paths.first() {
                self.active_path = Some(*first);
            }
        }
    }

    pub fn via(&self) -> &[Hashname] {
        &self.via
    }

    pub fn add_via(&mut self, introducer: Hashname) {
        if !self.via.contains(&introducer) {
            self.via.push(introducer);
        }
    }
}

/// Owns every `Peer` the switch has materialized, plus the set of
/// registered peer directories consulted on first contact.
pub struct PeerRegistry {
    peers: HashMap<Hashname, Peer>,
    directories: Vec<Box<dyn PeerDirectory>>,
}

impl PeerRegistry {
    pub fn new(directories: Vec<Box<dyn PeerDirectory>>) -> Self {
        Self {
            peers: HashMap::new(),
            directories,
        }
    }

    pub fn get(&self, hashname: &Hashname) -> Option<&Peer> {
        self.peers.get(hashname)
    }

    pub fn get_mut(&mut self, hashname: &Hashname) -> Option<&mut Peer> {
        self.peers.get_mut(hashname)
    }

    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Return the existing peer for `hashname`, or materialize a fresh
    /// one. A peer is created at most once per hashname (§3 invariant):
    /// directories are consulted in registration order, first hit wins;
    /// on a miss everywhere, an empty `Peer` is inserted and every
    /// directory's `on_new_peer` hook fires.
    pub fn get_or_create(&mut self, hashname: Hashname) -> &mut Peer {
        if !self.peers.contains_key(&hashname) {
            let mut peer = Peer::new(hashname);
            for directory in &self.directories {
                if let Some(PeerDirectoryEntry { pubkey, paths }) = directory.get_peer(&hashname) {
                    if let Some(pubkey) = pubkey {
                        peer.set_public_key(pubkey);
                    }
                    peer.set_active_paths(&paths);
                    break;
                }
            }
            self.peers.insert(hashname, peer);
            for directory in &self.directories {
                directory.on_new_peer(&hashname);
            }
        }
        self.peers.get_mut(&hashname).expect("just inserted")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn path(port: u16) -> NetworkPath {
        NetworkPath::new(SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port))
    }

    fn hashname(byte: u8) -> Hashname {
        Hashname::from_bytes([byte; 32])
    }

    struct CountingDirectory {
        hits: Arc<AtomicUsize>,
    }

    impl PeerDirectory for CountingDirectory {
        fn get_peer(&self, _hashname: &Hashname) -> Option<PeerDirectoryEntry> {
            None
        }

        fn on_new_peer(&self, _hashname: &Hashname) {
            self.hits.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn get_or_create_materializes_peer_at_most_once() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = PeerRegistry::new(vec![Box::new(CountingDirectory { hits: hits.clone() })]);

        let h = hashname(7);
        registry.get_or_create(h);
        registry.get_or_create(h);

        assert_eq!(registry.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn pubkey_is_monotonic() {
        let mut peer = Peer::new(hashname(1));
        assert!(peer.set_public_key(RsaPublicKey(vec![1, 2, 3])));
        assert!(peer.set_public_key(RsaPublicKey(vec![1, 2, 3])));
        assert!(!peer.set_public_key(RsaPublicKey(vec![9, 9, 9])));
        assert_eq!(peer.pubkey(), Some(&RsaPublicKey(vec![1, 2, 3])));
    }

    #[test]
    fn active_path_must_be_a_known_path() {
        let mut peer = Peer::new(hashname(2));
        peer.set_active_path(path(1));
        assert_eq!(peer.active_path(), None);

        peer.add_net_path(path(1));
        peer.set_active_path(path(1));
        assert_eq!(peer.active_path(), Some(path(1)));
    }
}
