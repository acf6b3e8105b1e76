//! Line FSM (§4.6, §3 "Line"): the per-peer handshake/rekey/pathing/
//! teardown state machine.
//!
//! Transition methods are pure: they mutate only the `Line`'s own state
//! and return the list of side effects (`LineAction`) the run loop must
//! still carry out (send a packet, arm a timer, spawn a background
//! task, touch `active_lines`). This keeps the FSM itself synchronous
//! and trivially testable, and matches §5's rule that only the run loop
//! may perform actual I/O.

use std::collections::HashMap;

use telehash_transport_udp::NetworkPath;

use crate::channel::Channel;
use crate::command::CloseReason;
use crate::crypto::LineKey;
use crate::hashname::Hashname;
use crate::packet::InnerPacket;

use crate::backlog::Backlog;
use crate::command::Command;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum LineState {
    Opening,
    Peering,
    Pathing,
    Opened,
    Closed,
}

/// A side effect the run loop owes after a `Line` transition.
#[derive(Debug)]
pub enum LineAction {
    SendOpen { path_hint: Option<NetworkPath> },
    RequestIntroduction,
    InstallActiveLine { line_id: String },
    RemoveActiveLine { line_id: String },
    SpawnPathNegotiation,
    ArmOpenTimer,
    CancelOpenTimer,
    ArmBrokenTimer,
    CancelBrokenTimer,
    RescheduleBacklog,
}

pub struct Line {
    peer: Hashname,
    state: LineState,
    local_prv_key: Option<Vec<u8>>,
    local_pub_key: Option<Vec<u8>>,
    remote_pub_key: Option<Vec<u8>>,
    shr_key: Option<LineKey>,
    local_line_id: Option<String>,
    /// The id the peer uses to key its own `active_lines` (learned from
    /// the peer's open packet). Outgoing line packets must be stamped
    /// with this, not our own `local_line_id` — the recipient looks
    /// packets up by the line id it installed for itself (§3, §4.8).
    remote_line_id: Option<String>,
    channels: HashMap<String, Channel>,
    pub backlog: Backlog<Command>,
    last_sync: Option<tokio::time::Instant>,
}

impl Line {
    pub fn new(peer: Hashname) -> Self {
        Self {
            peer,
            state: LineState::Opening,
            local_prv_key: None,
            local_pub_key: None,
            remote_pub_key: None,
            shr_key: None,
            local_line_id: None,
            remote_line_id: None,
            channels: HashMap::new(),
            backlog: Backlog::new(),
            last_sync: None,
        }
    }

    pub fn peer(&self) -> Hashname {
        self.peer
    }

    pub fn state(&self) -> LineState {
        self.state
    }

    pub fn shr_key(&self) -> Option<&LineKey> {
        self.shr_key.as_ref()
    }

    pub fn local_line_id(&self) -> Option<&str> {
        self.local_line_id.as_deref()
    }

    /// The id to stamp on outgoing line packets: the peer's own
    /// `active_lines` key, learned from its open packet.
    pub fn remote_line_id(&self) -> Option<&str> {
        self.remote_line_id.as_deref()
    }

    /// Existing local ephemeral keypair, if this side has already sent an
    /// open on this line (initiator, or a prior rekey round).
    pub fn local_keypair(&self) -> Option<(&[u8], &[u8])> {
        Some((self.local_prv_key.as_deref()?, self.local_pub_key.as_deref()?))
    }

    pub fn channels(&self) -> &HashMap<String, Channel> {
        &self.channels
    }

    pub fn channels_mut(&mut self) -> &mut HashMap<String, Channel> {
        &mut self.channels
    }

    pub fn insert_channel(&mut self, channel: Channel) {
        self.channels.insert(channel.id().to_string(), channel);
    }

    pub fn last_sync(&self) -> Option<tokio::time::Instant> {
        self.last_sync
    }

    /// §4.6: "outbound open requested". `known_contact` is true when the
    /// peer already has a public key and a path; false when only `via`
    /// introducers are known.
    pub fn request_open(
        &mut self,
        local_ephemeral: (Vec<u8>, Vec<u8>),
        known_contact: bool,
    ) -> Vec<LineAction> {
        let (prv, publ) = local_ephemeral;
        self.local_line_id = Some(hex::encode(&publ));
        self.local_prv_key = Some(prv);
        self.local_pub_key = Some(publ);

        if known_contact {
            self.state = LineState::Opening;
            vec![LineAction::SendOpen { path_hint: None }, LineAction::ArmOpenTimer]
        } else {
            self.state = LineState::Peering;
            vec![LineAction::RequestIntroduction]
        }
    }

    /// §4.6: "peering -> pubkey+path learned -> opening".
    pub fn contact_learned(&mut self) -> Vec<LineAction> {
        if self.state != LineState::Peering {
            return Vec::new();
        }
        self.state = LineState::Opening;
        vec![LineAction::SendOpen { path_hint: None }, LineAction::ArmOpenTimer]
    }

    /// §4.6: receiving a valid open. Covers the `opening/pathing -> pathing`
    /// handshake-completion transition and the `opened -> opened` rekey
    /// transition. Returns `None` if the current state does not accept an
    /// inbound open at all (e.g. `closed`).
    pub fn receive_open(
        &mut self,
        remote_pub_key: Vec<u8>,
        remote_line_id: String,
        shr_key: LineKey,
        local_ephemeral: impl FnOnce() -> (Vec<u8>, Vec<u8>),
    ) -> Option<Vec<LineAction>> {
        match self.state {
            LineState::Opening | LineState::Pathing => {
                if self.local_line_id.is_none() {
                    let (prv, publ) = local_ephemeral();
                    self.local_line_id = Some(hex::encode(&publ));
                    self.local_prv_key = Some(prv);
                    self.local_pub_key = Some(publ);
                }
                self.remote_pub_key = Some(remote_pub_key);
                self.remote_line_id = Some(remote_line_id);
                self.shr_key = Some(shr_key);
                self.state = LineState::Pathing;
                let line_id = self.local_line_id.clone().expect("set above");
                Some(vec![
                    LineAction::InstallActiveLine { line_id },
                    LineAction::SpawnPathNegotiation,
                ])
            }
            LineState::Opened => {
                self.remote_pub_key = Some(remote_pub_key);
                self.remote_line_id = Some(remote_line_id);
                self.shr_key = Some(shr_key);
                Some(vec![
                    LineAction::SendOpen { path_hint: None },
                    LineAction::RescheduleBacklog,
                ])
            }
            LineState::Peering | LineState::Closed => None,
        }
    }

    /// §4.6: `pathing` path negotiation outcome.
    pub fn path_negotiation_result(&mut self, succeeded: bool) -> Vec<LineAction> {
        if self.state != LineState::Pathing {
            return Vec::new();
        }
        if succeeded {
            self.state = LineState::Opened;
            self.last_sync = Some(tokio::time::Instant::now());
            vec![
                LineAction::CancelOpenTimer,
                LineAction::ArmBrokenTimer,
                LineAction::RescheduleBacklog,
            ]
        } else {
            self.close(CloseReason::Broken)
        }
    }

    pub fn note_path_sync(&mut self) {
        self.last_sync = Some(tokio::time::Instant::now());
    }

    /// §4.6 "close semantics", factored into one routine parameterized
    /// by reason (§9 design note). Marks every channel broken, cancels
    /// every backlog, and reports which timers/active-line entries the
    /// run loop must tear down.
    pub fn close(&mut self, reason: CloseReason) -> Vec<LineAction> {
        if self.state == LineState::Closed {
            return Vec::new();
        }
        tracing::info!(target: telehash_core::observability::SPAN_LINE, peer = %self.peer, ?reason, "closing line");

        let was_installed = matches!(self.state, LineState::Pathing | LineState::Opened);
        self.state = LineState::Closed;

        for channel in self.channels.values_mut() {
            channel.mark_broken();
        }
        self.backlog.cancel_all(crate::error::SwitchError::ChannelBroken);

        let mut actions = vec![LineAction::CancelOpenTimer, LineAction::CancelBrokenTimer];
        if was_installed {
            if let Some(line_id) = self.local_line_id.clone() {
                actions.push(LineAction::RemoveActiveLine { line_id });
            }
        }
        actions
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hashname(b: u8) -> Hashname {
        Hashname::from_bytes([b; 32])
    }

    fn fake_ephemeral() -> (Vec<u8>, Vec<u8>) {
        (vec![1, 2, 3], vec![4, 5, 6])
    }

    #[test]
    fn request_open_with_known_contact_goes_to_opening() {
        let mut line = Line::new(hashname(1));
        let actions = line.request_open(fake_ephemeral(), true);
        assert_eq!(line.state(), LineState::Opening);
        assert!(matches!(actions[0], LineAction::SendOpen { .. }));
    }

    #[test]
    fn request_open_without_contact_goes_to_peering() {
        let mut line = Line::new(hashname(1));
        let actions = line.request_open(fake_ephemeral(), false);
        assert_eq!(line.state(), LineState::Peering);
        assert!(matches!(actions[0], LineAction::RequestIntroduction));
    }

    #[test]
    fn receive_open_from_opening_installs_active_line_and_spawns_negotiation() {
        let mut line = Line::new(hashname(1));
        line.request_open(fake_ephemeral(), true);
        let actions = line
            .receive_open(vec![9, 9, 9], "remote-line".into(), LineKey(vec![1]), fake_ephemeral)
            .unwrap();
        assert_eq!(line.state(), LineState::Pathing);
        assert!(actions
            .iter()
            .any(|a| matches!(a, LineAction::InstallActiveLine { .. })));
        assert!(actions
            .iter()
            .any(|a| matches!(a, LineAction::SpawnPathNegotiation)));
    }

    #[test]
    fn rekey_on_opened_line_keeps_state_and_reschedules() {
        let mut line = Line::new(hashname(1));
        line.request_open(fake_ephemeral(), true);
        line.receive_open(vec![9], "remote-line".into(), LineKey(vec![1]), fake_ephemeral)
            .unwrap();
        line.path_negotiation_result(true);
        assert_eq!(line.state(), LineState::Opened);

        let actions = line
            .receive_open(vec![8], "remote-line-2".into(), LineKey(vec![2]), fake_ephemeral)
            .unwrap();
        assert_eq!(line.state(), LineState::Opened);
        assert!(actions
            .iter()
            .any(|a| matches!(a, LineAction::RescheduleBacklog)));
    }

    #[test]
    fn path_negotiation_failure_closes_line() {
        let mut line = Line::new(hashname(1));
        line.request_open(fake_ephemeral(), true);
        line.receive_open(vec![9], "remote-line".into(), LineKey(vec![1]), fake_ephemeral)
            .unwrap();
        line.path_negotiation_result(false);
        assert_eq!(line.state(), LineState::Closed);
    }

    #[test]
    fn closing_an_opened_line_marks_channels_broken() {
        let mut line = Line::new(hashname(1));
        line.request_open(fake_ephemeral(), true);
        line.receive_open(vec![9], "remote-line".into(), LineKey(vec![1]), fake_ephemeral)
            .unwrap();
        line.path_negotiation_result(true);

        line.insert_channel(Channel::new(
            "c1".into(),
            "ping".into(),
            crate::channel::Reliability::Unreliable,
            true,
        ));
        line.close(CloseReason::Broken);
        assert!(line.channels().get("c1").unwrap().is_closed());
    }
}
