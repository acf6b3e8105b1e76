//! The run loop's command alphabet (§9 design note: "replace dynamic
//! command dispatch with a tagged sum of command variants").
//!
//! Every state mutation the switch performs is one of these variants;
//! the run loop matches on the tag rather than invoking an open-ended
//! `Exec` trait object, making the full command alphabet explicit at
//! compile time.

use telehash_transport_udp::NetworkPath;

use crate::channel::ChannelOptions;
use crate::hashname::Hashname;
use crate::packet::{InnerPacket, OuterPacket};
use crate::stats::Stats;

/// Reason recorded when a line closes (§4.6, §9 "factor the three
/// close paths into one routine parameterized by reason").
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum CloseReason {
    Idle,
    Broken,
    Down,
}

/// A handle identifying one channel within one line, used to address
/// commands without holding a borrowed reference across the command
/// queue.
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ChannelAddr {
    pub peer: Hashname,
    pub channel_id: String,
}

#[derive(Debug)]
pub enum Command {
    /// Used only in unit tests exercising the backlog in isolation.
    #[cfg(test)]
    Noop,

    /// Test-only introspection: fetch a line's current `shr_key` bytes so
    /// an integration test can forge a wire packet sealed under the real
    /// session key without reaching into run loop state directly (§5:
    /// state is only ever touched through a command).
    #[cfg(test)]
    DebugLineKeyBytes { peer: Hashname },

    /// Test-only introspection: fetch the id a line installed for
    /// itself in `active_lines`, so an integration test can address a
    /// forged wire packet the way a real peer would (§3 "line_id = id
    /// of local ephemeral line key").
    #[cfg(test)]
    DebugLocalLineId { peer: Hashname },

    /// A raw datagram handed in by a transport reader task.
    RcvDatagram { bytes: Vec<u8>, path: NetworkPath },

    /// §6 `OpenChannel`. Deferred onto the target line's backlog if the
    /// line is not yet `opened` (the pathing/"path"-type exception of
    /// §4.7 applies).
    OpenChannel { options: ChannelOptions },

    /// §4.7 "Send": seal and hand `inner` to the transport over the
    /// channel's line, honoring an explicit path override if supplied.
    SendPacket {
        addr: ChannelAddr,
        inner: InnerPacket,
        path_override: Option<NetworkPath>,
    },

    /// §4.7 "Application read" (`get_rcv_pkt`).
    GetRcvPkt { addr: ChannelAddr },

    /// §4.7 "Deadlines" (`set_rcv_deadline`). `deadline_millis` is an
    /// absolute monotonic-clock timestamp in milliseconds; `0` clears
    /// the deadline.
    SetRcvDeadline { addr: ChannelAddr, deadline_millis: i64 },

    CloseChannel { addr: ChannelAddr },
    KillChannel { addr: ChannelAddr },

    /// §4.6 close routine, parameterized by reason per the design note.
    CloseLine { peer: Hashname, reason: CloseReason },

    /// §4.8 ingress dispatch for an inbound `open`-type outer packet.
    RcvOpen { outer: OuterPacket, path: NetworkPath },

    /// A background path-negotiation task posting its outcome back.
    PathNegotiateResult { peer: Hashname, succeeded: bool },

    /// A background send task posting a transport write failure back, so
    /// the error is counted in `Stats` rather than only logged (§10
    /// per-packet stats counters).
    SendPacketFailed { addr: ChannelAddr },

    /// One-shot timer firings.
    RcvDeadlineTimer { addr: ChannelAddr },
    LineBrokenTimer { peer: Hashname },
    LineOpenTimer { peer: Hashname },

    /// Periodic maintenance commands.
    ChannelGc,
    PathRecheck,
    StatsLog,

    /// `Stats()` (§6).
    GetStats,

    /// Current time on the switch's clock, in milliseconds since this
    /// switch's epoch (§4.7 "Deadlines"): the reference point
    /// `SetRcvDeadline`'s absolute `deadline_millis` is measured
    /// against. Lets callers compute `now + offset` deadlines without
    /// reaching into the run loop's clock directly.
    GetClockMillis,

    /// `Close()` lifecycle entry point; schedules close-down for every
    /// line after the shutdown grace interval.
    Shutdown,
}

/// What a completed command hands back to a `Call` awaiter. The run
/// loop and the awaiter agree out of band (by construction) on which
/// variant a given command produces; an awaiter that receives the wrong
/// variant treats it as an internal bug, not a recoverable error.
#[derive(Debug)]
pub enum CommandOutcome {
    Unit,
    ChannelOpened(ChannelAddr),
    Packet(InnerPacket),
    Stats(Stats),
    Millis(i64),
    #[cfg(test)]
    LineKeyBytes(Option<Vec<u8>>),
    #[cfg(test)]
    LineId(Option<String>),
}
