//! Channel core (§4.7, §3 "Channel"): the multiplexed sub-stream within
//! one line.
//!
//! Exact retransmit/ack semantics for reliable channels are named in
//! spec §9 as an open question beyond the supplied source files; this
//! implements the part that is specified — strictly ordered, gap-free
//! delivery to the application and sequence assignment on send — and
//! leaves retransmit timers undone rather than guessing at a protocol.

use std::collections::{BTreeMap, VecDeque};

use crate::backlog::Backlog;
use crate::command::Command;
use crate::error::SwitchError;
use crate::hashname::Hashname;
use crate::packet::InnerPacket;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Reliability {
    Reliable,
    Unreliable,
}

/// Parameters for opening a channel (§6 `OpenChannel`).
#[derive(Clone, Debug)]
pub struct ChannelOptions {
    pub peer: Hashname,
    pub id: Option<String>,
    pub kind: String,
    pub reliability: Reliability,
}

pub struct Channel {
    id: String,
    kind: String,
    reliability: Reliability,
    initiator: bool,

    rcv_queue: VecDeque<InnerPacket>,
    reliable_out_of_order: BTreeMap<u64, InnerPacket>,
    next_rcv_seq: u64,
    next_snd_seq: u64,

    pub rcv_backlog: Backlog<Command>,
    pub snd_backlog: Backlog<Command>,

    rcv_deadline_reached: bool,
    closed: bool,
}

impl Channel {
    pub fn new(id: String, kind: String, reliability: Reliability, initiator: bool) -> Self {
        Self {
            id,
            kind,
            reliability,
            initiator,
            rcv_queue: VecDeque::new(),
            reliable_out_of_order: BTreeMap::new(),
            next_rcv_seq: 0,
            next_snd_seq: 0,
            rcv_backlog: Backlog::new(),
            snd_backlog: Backlog::new(),
            rcv_deadline_reached: false,
            closed: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn reliability(&self) -> Reliability {
        self.reliability
    }

    pub fn initiator(&self) -> bool {
        self.initiator
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn rcv_deadline_reached(&self) -> bool {
        self.rcv_deadline_reached
    }

    pub fn set_rcv_deadline_reached(&mut self, reached: bool) {
        self.rcv_deadline_reached = reached;
    }

    /// Whether the very first packet of an inbound reliable channel open
    /// would be acceptable. Unreliable channels accept any first packet.
    pub fn accepts_as_first_packet(reliability: Reliability, header_seq: Option<u64>) -> bool {
        match reliability {
            Reliability::Reliable => header_seq == Some(0),
            Reliability::Unreliable => true,
        }
    }

    /// Push a received inner packet (§4.7 "Receive" / `push_rcv_pkt`).
    /// Returns `true` if the packet became immediately readable (i.e. the
    /// receive backlog should be rescheduled).
    pub fn push_rcv_pkt(&mut self, pkt: InnerPacket) -> bool {
        match self.reliability {
            Reliability::Unreliable => {
                self.rcv_queue.push_back(pkt);
                true
            }
            Reliability::Reliable => {
                let seq = match pkt.header.seq {
                    Some(seq) => seq,
                    None => return false,
                };
                if seq < self.next_rcv_seq {
                    return false; // duplicate, drop
                }
                if seq == self.next_rcv_seq {
                    self.rcv_queue.push_back(pkt);
                    self.next_rcv_seq += 1;
                    while let Some(next) = self.reliable_out_of_order.remove(&self.next_rcv_seq) {
                        self.rcv_queue.push_back(next);
                        self.next_rcv_seq += 1;
                    }
                    true
                } else {
                    self.reliable_out_of_order.insert(seq, pkt);
                    false
                }
            }
        }
    }

    /// Application read (§4.7 "Application read" / `get_rcv_pkt`).
    pub fn try_pop_rcv(&mut self) -> Option<InnerPacket> {
        self.rcv_queue.pop_front()
    }

    pub fn has_pending_rcv(&self) -> bool {
        !self.rcv_queue.is_empty()
    }

    /// `can_snd_pkt` (§4.7 "Send", step 1). Bypass sends ignore channel
    /// attachment entirely and never reach this check.
    pub fn can_snd_pkt(&self) -> bool {
        !self.closed
    }

    /// `will_send_packet` (§4.7 "Send", step 2): reliable-mode sequence
    /// assignment. Unreliable channels are left untouched.
    pub fn will_send_packet(&mut self, inner: &mut InnerPacket) {
        if self.reliability == Reliability::Reliable {
            inner.header.seq = Some(self.next_snd_seq);
            self.next_snd_seq += 1;
        }
    }

    /// Mark the channel broken and cancel every deferred read/write with
    /// `ErrChannelBroken` (§4.6 close semantics, per-channel step).
    pub fn mark_broken(&mut self) {
        self.closed = true;
        self.rcv_backlog.cancel_all(SwitchError::ChannelBroken);
        self.snd_backlog.cancel_all(SwitchError::ChannelBroken);
    }

    pub fn close(&mut self) {
        self.closed = true;
    }
}
