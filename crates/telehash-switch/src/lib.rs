//! Telehash v2 switch runtime.
//!
//! Owns the single-threaded run loop (§4.1) that drives every peer, line,
//! and channel state machine in the process, plus the collaborator traits
//! (`CryptoEnvelope`, `PeerDirectory`, `RelayHandler`, `PathNegotiator`)
//! spec.md §1 and §6 place outside this crate's scope. See `SPEC_FULL.md`
//! and `DESIGN.md` at the workspace root for the full module map and the
//! grounding ledger.

pub mod backlog;
pub mod channel;
pub mod command;
pub mod config;
pub mod crypto;
pub mod dht;
pub mod error;
pub mod hashname;
pub mod line;
pub mod packet;
pub mod path;
pub mod peer;
pub mod relay;
mod runloop;
pub mod stats;
pub mod switch;

pub use channel::{ChannelOptions, Reliability};
pub use command::CloseReason;
pub use config::SwitchConfig;
pub use crypto::{CryptoEnvelope, LineKey, RsaPrivateKey, RsaPublicKey};
pub use dht::{PeerDirectory, PeerDirectoryEntry};
pub use error::SwitchError;
pub use hashname::Hashname;
pub use line::LineState;
pub use packet::{InnerHeader, InnerPacket, OuterHeader, OuterPacket};
pub use path::PathNegotiator;
pub use peer::Peer;
pub use relay::{NullRelayHandler, RelayHandler};
pub use stats::Stats;
pub use switch::{ChannelHandle, Switch, SwitchOptions};
