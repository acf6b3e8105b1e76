//! Path negotiator collaborator (§4.9). Out of scope: the actual NAT
//! traversal mechanics; the switch only drives the two operations below
//! from background tasks and reacts to their outcome via
//! `Command::PathNegotiateResult`.

use async_trait::async_trait;

use crate::hashname::Hashname;

#[async_trait]
pub trait PathNegotiator: Send + Sync + 'static {
    /// Full path probe: tries every known path, updates the peer's
    /// active path, returns whether the peer is reachable at all.
    async fn negotiate(&self, peer: Hashname) -> bool;

    /// Cheap single-path recheck, used when `last_sync` is fresh
    /// (within `path_recheck_freshness`).
    async fn negotiate_netpath(&self, peer: Hashname) -> bool;
}
