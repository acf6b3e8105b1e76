//! The run loop (§4.1): a single serialized executor owning all switch
//! state. `Call`/`Cast`/`CastAfter`/`StopAndWait` are the only ways in;
//! `Defer` is internal to a command handler, which stashes the
//! envelope's responder into the relevant backlog instead of answering
//! it immediately.
//!
//! Grounded in `spark-core/src/runtime/executor.rs`'s `TaskExecutor`
//! seam and `spark-core/src/time/clock.rs`'s `Clock` seam (see
//! `telehash-core`), generalized here to drive an actor-style command
//! queue instead of a governance pipeline.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use telehash_core::{Clock, TaskExecutor};
use telehash_transport_udp::{NetworkPath, Transport};

use crate::backlog::Pending;
use crate::channel::ChannelOptions;
use crate::command::{ChannelAddr, CloseReason, Command, CommandOutcome};
use crate::config::SwitchConfig;
use crate::crypto::{CryptoEnvelope, RsaPrivateKey, RsaPublicKey};
use crate::error::SwitchError;
use crate::hashname::Hashname;
use crate::line::{Line, LineAction, LineState};
use crate::packet::OuterPacket;
use crate::path::PathNegotiator;
use crate::peer::PeerRegistry;
use crate::relay::RelayHandler;
use crate::stats::Stats;
use crate::switch::ChannelHandle;

pub(crate) type Responder = oneshot::Sender<Result<CommandOutcome, SwitchError>>;

pub(crate) struct Envelope {
    pub command: Command,
    pub responder: Option<Responder>,
}

/// Handle submitters use to talk to the run loop; cheap to clone, safe
/// to hold from background tasks and application code alike.
#[derive(Clone)]
pub struct RunLoopHandle {
    tx: mpsc::UnboundedSender<Envelope>,
}

impl RunLoopHandle {
    /// `Call(cmd)`: enqueue and wait for completion.
    pub async fn call(&self, command: Command) -> Result<CommandOutcome, SwitchError> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(Envelope {
                command,
                responder: Some(tx),
            })
            .map_err(|_| SwitchError::TransportClosed)?;
        rx.await
            .map_err(|_| SwitchError::internal("run loop dropped without answering"))?
    }

    /// `Cast(cmd)`: enqueue fire-and-forget.
    pub fn cast(&self, command: Command) {
        let _ = self.tx.send(Envelope {
            command,
            responder: None,
        });
    }

    /// `CastAfter(d, cmd)`: schedule after `d`. Returns a handle whose
    /// cancel is idempotent; a cancelled timer never posts its command
    /// (§8 property 9).
    pub fn cast_after(
        &self,
        clock: &dyn Clock,
        executor: &dyn TaskExecutor,
        delay: Duration,
        command: Command,
    ) -> TimerHandle {
        let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
        let tx = self.tx.clone();
        let sleep = clock.sleep(delay);
        executor.spawn(async move {
            tokio::select! {
                _ = sleep => {
                    let _ = tx.send(Envelope { command, responder: None });
                }
                _ = &mut cancel_rx => {}
            }
        });
        TimerHandle {
            cancel: Some(cancel_tx),
        }
    }
}

/// A cancellable deferred-command handle.
pub struct TimerHandle {
    cancel: Option<oneshot::Sender<()>>,
}

impl TimerHandle {
    pub fn cancel(&mut self) {
        if let Some(tx) = self.cancel.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[derive(Default)]
pub(crate) struct LineTimers {
    pub open: Option<TimerHandle>,
    pub broken: Option<TimerHandle>,
}

/// All switch state (§3 "Switch state"), owned exclusively by the run
/// loop task.
pub(crate) struct SwitchState {
    pub peers: PeerRegistry,
    pub lines: HashMap<Hashname, Line>,
    pub active_lines: HashMap<String, Hashname>,
    pub terminating: bool,
    pub stats: Stats,
    pub config: SwitchConfig,

    pub crypto: Arc<dyn CryptoEnvelope>,
    pub transport: Arc<dyn Transport>,
    pub path_negotiator: Arc<dyn PathNegotiator>,
    pub relay_handler: Arc<dyn RelayHandler>,
    pub clock: Arc<dyn Clock>,
    pub executor: Arc<dyn TaskExecutor>,

    pub local_hashname: Hashname,
    pub local_rsa_key: RsaPrivateKey,
    pub local_rsa_pub: RsaPublicKey,

    /// Fixed reference point captured once at switch construction.
    /// `deadline_millis` throughout this module is always relative to
    /// this same instant, so it stays well-defined (and panic-free)
    /// under a [`telehash_core::MockClock`] whose `now()` can run ahead
    /// of or behind real wall-clock time.
    pub epoch: std::time::Instant,

    pub handle: RunLoopHandle,
    pub(crate) timers: HashMap<Hashname, LineTimers>,
    pub incoming_channels: mpsc::UnboundedSender<ChannelHandle>,
}

/// Answer a `Call` awaiter, if there is one. Deliberately takes no
/// `self` so it can be invoked while a `&mut self` field borrow (a
/// `Line` or `Channel` reference) is still alive in the caller.
fn answer(responder: Option<Responder>, result: Result<CommandOutcome, SwitchError>) -> Dispatched {
    if let Some(responder) = responder {
        let _ = responder.send(result);
    }
    Dispatched::Answered
}

enum Dispatched {
    Answered,
    Deferred,
}

impl SwitchState {
    fn cast_after(&self, delay: Duration, command: Command) -> TimerHandle {
        self.handle
            .cast_after(self.clock.as_ref(), self.executor.as_ref(), delay, command)
    }

    fn resubmit(&self, pending: Pending<Command>) {
        let (command, responder) = pending.into_parts();
        let _ = self.handle.tx.send(Envelope { command, responder });
    }

    fn reschedule_line_backlog(&mut self, peer: Hashname) {
        if let Some(line) = self.lines.get_mut(&peer) {
            let pendings = line.backlog.reschedule_all();
            for pending in pendings {
                self.resubmit(pending);
            }
        }
    }

    fn apply_line_actions(&mut self, peer: Hashname, actions: Vec<LineAction>) {
        for action in actions {
            match action {
                LineAction::SendOpen { path_hint } => self.spawn_send_open(peer, path_hint),
                LineAction::RequestIntroduction => {
                    tracing::debug!(peer = %peer, "requesting peer introduction via known introducers");
                }
                LineAction::InstallActiveLine { line_id } => {
                    self.active_lines.insert(line_id, peer);
                    self.stats.running_lines = self.active_lines.len() as u64;
                }
                LineAction::RemoveActiveLine { line_id } => {
                    self.active_lines.remove(&line_id);
                    self.stats.running_lines = self.active_lines.len() as u64;
                }
                LineAction::SpawnPathNegotiation => self.spawn_path_negotiation(peer),
                LineAction::ArmOpenTimer => {
                    let handle = self.cast_after(self.config.line_open_timeout, Command::LineOpenTimer { peer });
                    self.timers.entry(peer).or_default().open = Some(handle);
                }
                LineAction::CancelOpenTimer => {
                    if let Some(timers) = self.timers.get_mut(&peer) {
                        timers.open = None;
                    }
                }
                LineAction::ArmBrokenTimer => {
                    let handle = self.cast_after(self.config.line_broken_timeout, Command::LineBrokenTimer { peer });
                    self.timers.entry(peer).or_default().broken = Some(handle);
                }
                LineAction::CancelBrokenTimer => {
                    if let Some(timers) = self.timers.get_mut(&peer) {
                        timers.broken = None;
                    }
                }
                LineAction::RescheduleBacklog => self.reschedule_line_backlog(peer),
            }
        }
    }

    fn spawn_send_open(&self, peer: Hashname, path_hint: Option<NetworkPath>) {
        let Some(line) = self.lines.get(&peer) else { return };
        let Some(peer_record) = self.peers.get(&peer) else { return };
        let Some(dest_pubkey) = peer_record.pubkey().cloned() else { return };
        let Some(line_id) = line.local_line_id().map(|s| s.to_string()) else { return };
        let path = path_hint.or_else(|| peer_record.active_path());
        let Some(path) = path else { return };

        let crypto = self.crypto.clone();
        let transport = self.transport.clone();
        let local_key = self.local_rsa_key.clone();
        let local_pub = self.local_rsa_pub.clone();
        let local_hashname = self.local_hashname;
        let ephemeral_pub = line_id;

        self.executor.spawn(async move {
            let ephemeral_pub_bytes = match hex::decode(&ephemeral_pub) {
                Ok(bytes) => bytes,
                Err(_) => return,
            };
            if let Ok(outer) = crypto.make_open(
                &local_key,
                &local_pub,
                &local_hashname,
                &ephemeral_pub_bytes,
                &ephemeral_pub,
                &dest_pubkey,
            ) {
                if let Ok(bytes) = outer.encode() {
                    let _ = transport.write(&bytes, path).await;
                }
            }
        });
    }

    fn spawn_path_negotiation(&self, peer: Hashname) {
        let negotiator = self.path_negotiator.clone();
        let handle = self.handle.clone();
        let use_quick = self
            .lines
            .get(&peer)
            .and_then(|line| line.last_sync())
            .map(|ts| ts.elapsed() < self.config.path_recheck_freshness)
            .unwrap_or(false);

        self.executor.spawn(async move {
            let succeeded = if use_quick {
                negotiator.negotiate_netpath(peer).await
            } else {
                negotiator.negotiate(peer).await
            };
            handle.cast(Command::PathNegotiateResult { peer, succeeded });
        });
    }

    fn known_contact(&self, peer: Hashname) -> bool {
        self.peers
            .get(&peer)
            .map(|p| p.pubkey().is_some() && p.active_path().is_some())
            .unwrap_or(false)
    }

    pub(crate) fn handle_envelope(&mut self, env: Envelope) {
        let Envelope { command, responder } = env;
        let _ = self.dispatch(command, responder);
    }

    fn dispatch(&mut self, command: Command, responder: Option<Responder>) -> Dispatched {
        match command {
            #[cfg(test)]
            Command::Noop => answer(responder, Ok(CommandOutcome::Unit)),

            #[cfg(test)]
            Command::DebugLineKeyBytes { peer } => {
                let bytes = self.lines.get(&peer).and_then(|l| l.shr_key()).map(|k| k.0.clone());
                answer(responder, Ok(CommandOutcome::LineKeyBytes(bytes)))
            }

            #[cfg(test)]
            Command::DebugLocalLineId { peer } => {
                let id = self.lines.get(&peer).and_then(|l| l.local_line_id()).map(|s| s.to_string());
                answer(responder, Ok(CommandOutcome::LineId(id)))
            }

            Command::RcvDatagram { bytes, path } => {
                self.handle_rcv_datagram(bytes, path);
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::RcvOpen { outer, path } => {
                self.handle_rcv_open(outer, path);
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::OpenChannel { options } => self.handle_open_channel(options, responder),

            Command::SendPacket {
                addr,
                inner,
                path_override,
            } => {
                let result = self.handle_send_packet(&addr, inner, path_override);
                answer(responder, result.map(|_| CommandOutcome::Unit))
            }

            Command::GetRcvPkt { addr } => self.handle_get_rcv_pkt(addr, responder),

            Command::SetRcvDeadline {
                addr,
                deadline_millis,
            } => {
                let result = self.handle_set_rcv_deadline(&addr, deadline_millis);
                answer(responder, result.map(|_| CommandOutcome::Unit))
            }

            Command::CloseChannel { addr } => {
                if let Some(line) = self.lines.get_mut(&addr.peer) {
                    if let Some(ch) = line.channels_mut().get_mut(&addr.channel_id) {
                        ch.close();
                    }
                }
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::KillChannel { addr } => {
                if let Some(line) = self.lines.get_mut(&addr.peer) {
                    if let Some(ch) = line.channels_mut().get_mut(&addr.channel_id) {
                        ch.mark_broken();
                    }
                }
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::CloseLine { peer, reason } => {
                self.close_line(peer, reason);
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::PathNegotiateResult { peer, succeeded } => {
                if succeeded {
                    if let Some(line) = self.lines.get_mut(&peer) {
                        line.note_path_sync();
                    }
                }
                let actions = self
                    .lines
                    .get_mut(&peer)
                    .map(|line| line.path_negotiation_result(succeeded))
                    .unwrap_or_default();
                self.apply_line_actions(peer, actions);
                self.recompute_stats();
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::SendPacketFailed { addr } => {
                self.stats.num_send_packet_errors += 1;
                tracing::debug!(peer = %addr.peer, channel = %addr.channel_id, "send_packet transport write failed");
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::RcvDeadlineTimer { addr } => {
                let pendings = self.lines.get_mut(&addr.peer).and_then(|line| {
                    let ch = line.channels_mut().get_mut(&addr.channel_id)?;
                    ch.set_rcv_deadline_reached(true);
                    Some(ch.rcv_backlog.reschedule_all())
                });
                if let Some(pendings) = pendings {
                    for pending in pendings {
                        self.resubmit(pending);
                    }
                }
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::LineBrokenTimer { peer } => {
                self.close_line(peer, CloseReason::Broken);
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::LineOpenTimer { peer } => {
                self.close_line(peer, CloseReason::Broken);
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::ChannelGc => {
                for line in self.lines.values_mut() {
                    line.channels_mut().retain(|_, ch| !ch.is_closed());
                }
                // §4.6 "any | idle policy | closed | close-idle": a line
                // with no channels left to carry and no path sync inside
                // `line_idle_timeout` is idle, not broken — reclaim it on
                // the same sweep that already walks every line.
                let idle_peers: Vec<Hashname> = self
                    .lines
                    .iter()
                    .filter(|(_, line)| {
                        line.channels().is_empty()
                            && line
                                .last_sync()
                                .map(|ts| ts.elapsed() >= self.config.line_idle_timeout)
                                .unwrap_or(false)
                    })
                    .map(|(peer, _)| *peer)
                    .collect();
                for peer in idle_peers {
                    self.close_line(peer, CloseReason::Idle);
                }
                self.recompute_stats();
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::PathRecheck => {
                let peers: Vec<Hashname> = self.lines.keys().copied().collect();
                for peer in peers {
                    self.spawn_path_negotiation(peer);
                }
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::StatsLog => {
                self.recompute_stats();
                tracing::info!(stats = ?self.stats, "switch stats");
                answer(responder, Ok(CommandOutcome::Unit))
            }

            Command::GetStats => {
                self.recompute_stats();
                answer(responder, Ok(CommandOutcome::Stats(self.stats)))
            }

            Command::GetClockMillis => {
                answer(responder, Ok(CommandOutcome::Millis(self.now_millis())))
            }

            Command::Shutdown => {
                self.terminating = true;
                let peers: Vec<Hashname> = self.lines.keys().copied().collect();
                let grace = self.config.shutdown_grace;
                let handle = self.handle.clone();
                self.executor.spawn(async move {
                    tokio::time::sleep(grace).await;
                    for peer in peers {
                        handle.cast(Command::CloseLine {
                            peer,
                            reason: CloseReason::Down,
                        });
                    }
                });
                answer(responder, Ok(CommandOutcome::Unit))
            }
        }
    }

    fn close_line(&mut self, peer: Hashname, reason: CloseReason) {
        let actions = match self.lines.get_mut(&peer) {
            Some(line) => line.close(reason),
            None => return,
        };
        self.timers.remove(&peer);
        self.apply_line_actions(peer, actions);
        self.lines.remove(&peer);
        self.recompute_stats();
    }

    fn handle_open_channel(&mut self, options: ChannelOptions, responder: Option<Responder>) -> Dispatched {
        let peer = options.peer;
        if self.terminating {
            return answer(responder, Err(SwitchError::NoOpenLine));
        }

        if !self.lines.contains_key(&peer) {
            // Ensure any registered directory gets a chance to supply a
            // pubkey/path before we decide whether this is a known
            // contact (§4.5): outbound opens are first contact just as
            // much as an inbound open is.
            self.peers.get_or_create(peer);
            let known_contact = self.known_contact(peer);
            let mut line = Line::new(peer);
            let ephemeral = self.crypto.generate_ephemeral();
            let actions = line.request_open(ephemeral, known_contact);
            self.lines.insert(peer, line);
            self.apply_line_actions(peer, actions);
        }

        let line = self.lines.get_mut(&peer).expect("inserted above");
        let allowed = matches!(line.state(), LineState::Opened)
            || (matches!(line.state(), LineState::Pathing) && options.kind == "path");

        if !allowed {
            line.backlog.defer(Pending::new(Command::OpenChannel { options }, responder));
            return Dispatched::Deferred;
        }

        let channel_id = options
            .id
            .clone()
            .unwrap_or_else(|| hex::encode(rand::random::<[u8; 8]>()));
        if line.channels().contains_key(&channel_id) {
            return answer(responder, Err(SwitchError::ChannelAlreadyExists(channel_id)));
        }

        let channel = crate::channel::Channel::new(channel_id.clone(), options.kind, options.reliability, true);
        line.insert_channel(channel);
        self.recompute_stats();
        tracing::debug!(
            target: telehash_core::observability::SPAN_CHANNEL,
            peer = %peer,
            channel = %channel_id,
            "opened outbound channel"
        );

        answer(
            responder,
            Ok(CommandOutcome::ChannelOpened(ChannelAddr { peer, channel_id })),
        )
    }

    fn handle_send_packet(
        &mut self,
        addr: &ChannelAddr,
        mut inner: crate::packet::InnerPacket,
        path_override: Option<NetworkPath>,
    ) -> Result<(), SwitchError> {
        let shr_key = self
            .lines
            .get(&addr.peer)
            .and_then(|line| line.shr_key().cloned())
            .ok_or(SwitchError::ChannelBroken)?;
        let remote_line_id = self
            .lines
            .get(&addr.peer)
            .and_then(|line| line.remote_line_id())
            .ok_or(SwitchError::ChannelBroken)?
            .to_string();

        {
            let line = self.lines.get_mut(&addr.peer).ok_or(SwitchError::ChannelBroken)?;
            let channel = line
                .channels_mut()
                .get_mut(&addr.channel_id)
                .ok_or(SwitchError::ChannelBroken)?;
            if !channel.can_snd_pkt() {
                return Err(SwitchError::ChannelBroken);
            }
            inner.header.channel_id = Some(addr.channel_id.clone());
            // The recipient only materializes a channel on first sight of a
            // packet carrying a non-empty type (§4.7 "Open (inbound)"); an
            // already-open channel on the recipient's side ignores a
            // repeated type, so it's safe to stamp this on every packet
            // rather than tracking whether we've sent one before.
            inner.header.kind = Some(channel.kind().to_string());
            channel.will_send_packet(&mut inner);
        }

        let path = path_override
            .or_else(|| self.peers.get(&addr.peer).and_then(|p| p.active_path()))
            .ok_or(SwitchError::PeerBroken(addr.peer))?;

        let mut outer = self.crypto.seal(&shr_key, &inner)?;
        outer.header.line = Some(remote_line_id);
        let bytes = outer.encode()?;
        let transport = self.transport.clone();
        let handle = self.handle.clone();
        let failed_addr = addr.clone();
        self.executor.spawn(async move {
            if transport.write(&bytes, path).await.is_err() {
                handle.cast(Command::SendPacketFailed { addr: failed_addr });
            }
        });
        self.stats.num_send_packets += 1;
        Ok(())
    }

    fn handle_get_rcv_pkt(&mut self, addr: ChannelAddr, responder: Option<Responder>) -> Dispatched {
        let Some(line) = self.lines.get_mut(&addr.peer) else {
            return answer(responder, Err(SwitchError::ChannelBroken));
        };
        let Some(channel) = line.channels_mut().get_mut(&addr.channel_id) else {
            return answer(responder, Err(SwitchError::ChannelBroken));
        };

        if let Some(pkt) = channel.try_pop_rcv() {
            return answer(responder, Ok(CommandOutcome::Packet(pkt)));
        }
        if channel.is_closed() {
            return answer(responder, Err(SwitchError::ChannelBroken));
        }
        if channel.rcv_deadline_reached() {
            return answer(responder, Err(SwitchError::ReadDeadlineExceeded));
        }

        channel
            .rcv_backlog
            .defer(Pending::new(Command::GetRcvPkt { addr }, responder));
        Dispatched::Deferred
    }

    /// Milliseconds elapsed on `self.clock` since this switch's epoch.
    /// `deadline_millis` values are always relative to the same
    /// reference point, so this is safe to call regardless of how far
    /// the clock has been advanced (real or virtual).
    fn now_millis(&self) -> i64 {
        self.clock
            .now()
            .saturating_duration_since(self.epoch)
            .as_millis() as i64
    }

    fn handle_set_rcv_deadline(&mut self, addr: &ChannelAddr, deadline_millis: i64) -> Result<(), SwitchError> {
        if deadline_millis == 0 {
            let channel = self
                .lines
                .get_mut(&addr.peer)
                .and_then(|line| line.channels_mut().get_mut(&addr.channel_id))
                .ok_or(SwitchError::ChannelBroken)?;
            channel.set_rcv_deadline_reached(false);
            return Ok(());
        }

        let now_millis = self.now_millis();
        if deadline_millis <= now_millis {
            let pendings = {
                let channel = self
                    .lines
                    .get_mut(&addr.peer)
                    .and_then(|line| line.channels_mut().get_mut(&addr.channel_id))
                    .ok_or(SwitchError::ChannelBroken)?;
                channel.set_rcv_deadline_reached(true);
                channel.rcv_backlog.reschedule_all()
            };
            for pending in pendings {
                self.resubmit(pending);
            }
            return Ok(());
        }

        let delay = Duration::from_millis((deadline_millis - now_millis) as u64);
        let addr = addr.clone();
        // The timer handle is deliberately dropped: `RcvDeadlineTimer`
        // fires at most once and a later `SetRcvDeadline` simply arms a
        // fresh one; there is nothing to cancel it against.
        let _ = self.cast_after(delay, Command::RcvDeadlineTimer { addr });
        Ok(())
    }

    /// §4.8 ingress dispatch, outer layer: decode the framed datagram and
    /// classify it as `open` or `line` (anything else is a silent drop).
    fn handle_rcv_datagram(&mut self, bytes: Vec<u8>, path: NetworkPath) {
        let outer = match OuterPacket::decode(&bytes) {
            Ok(outer) => outer,
            Err(_) => {
                self.stats.num_received_packet_errors += 1;
                tracing::debug!("ingress: dropped unparseable outer packet");
                return;
            }
        };

        if outer.header.is_open() {
            self.handle_rcv_open(outer, path);
        } else if outer.header.is_line() {
            self.handle_rcv_line_packet(outer, path);
        } else {
            tracing::debug!(kind = %outer.header.kind, "ingress: dropped packet of unknown type");
        }
    }

    /// §4.8 "`type == \"line\"`": route a sealed line packet to its active
    /// line, unseal it, and dispatch to a channel (existing or freshly
    /// opened per §4.7 "Open (inbound)").
    fn handle_rcv_line_packet(&mut self, outer: OuterPacket, path: NetworkPath) {
        let Some(line_id) = outer.header.line.clone() else {
            self.stats.num_received_packet_errors += 1;
            return;
        };
        let Some(&peer) = self.active_lines.get(&line_id) else {
            self.stats.num_received_packet_errors += 1;
            tracing::debug!(line = %line_id, "ingress: dropped packet for uninstalled line id");
            return;
        };
        let Some(shr_key) = self.lines.get(&peer).and_then(|l| l.shr_key().cloned()) else {
            self.stats.num_received_packet_errors += 1;
            return;
        };

        let mut inner = match self.crypto.unseal(&shr_key, &outer) {
            Ok(inner) => inner,
            Err(_) => {
                self.stats.num_received_packet_errors += 1;
                tracing::debug!(peer = %peer, "ingress: failed to unseal line packet");
                return;
            }
        };
        inner.path = Some(path);

        // Any accepted line packet resets the broken timer (§4.6).
        self.apply_line_actions(peer, vec![LineAction::ArmBrokenTimer]);

        let Some(channel_id) = inner.header.channel_id.clone() else {
            self.stats.num_received_packet_errors += 1;
            tracing::debug!(peer = %peer, "ingress: dropped inner packet with empty channel id");
            return;
        };

        if inner.header.is_relay() {
            self.relay_handler.handle_relay(peer, inner);
            self.stats.num_received_packets += 1;
            return;
        }

        let Some(line) = self.lines.get_mut(&peer) else {
            return;
        };

        if line.channels().contains_key(&channel_id) {
            let channel = line.channels_mut().get_mut(&channel_id).expect("checked above");
            let became_readable = channel.push_rcv_pkt(inner);
            self.stats.num_received_packets += 1;
            if became_readable {
                let pendings = channel.rcv_backlog.reschedule_all();
                for pending in pendings {
                    self.resubmit(pending);
                }
            }
            return;
        }

        self.open_inbound_channel(peer, channel_id, inner);
    }

    /// §4.7 "Open (inbound)": a `line`-type packet referencing a channel id
    /// not yet in the line's channel map, with a non-empty inner `type`,
    /// materializes a fresh channel. Reliability is inferred from sequence
    /// presence; a reliable channel's first packet must carry sequence 0.
    fn open_inbound_channel(&mut self, peer: Hashname, channel_id: String, inner: crate::packet::InnerPacket) {
        use crate::channel::{Channel, Reliability};

        let Some(kind) = inner.header.kind.clone() else {
            self.stats.num_received_packet_errors += 1;
            tracing::debug!(peer = %peer, channel = %channel_id, "ingress: dropped channel-open with empty type");
            return;
        };

        let reliability = if inner.header.seq.is_some() {
            Reliability::Reliable
        } else {
            Reliability::Unreliable
        };

        if !Channel::accepts_as_first_packet(reliability, inner.header.seq) {
            self.stats.num_received_packet_errors += 1;
            tracing::debug!(
                peer = %peer,
                channel = %channel_id,
                seq = ?inner.header.seq,
                "ingress: rejected reliable channel open with non-zero first sequence"
            );
            return;
        }

        let Some(line) = self.lines.get_mut(&peer) else {
            return;
        };

        let mut channel = Channel::new(channel_id.clone(), kind, reliability, false);
        channel.push_rcv_pkt(inner);
        line.insert_channel(channel);
        self.stats.num_received_packets += 1;
        self.recompute_stats();
        tracing::debug!(
            target: telehash_core::observability::SPAN_CHANNEL,
            peer = %peer,
            channel = %channel_id,
            "accepted inbound channel"
        );

        let handle = ChannelHandle::new(self.handle.clone(), ChannelAddr { peer, channel_id });
        let _ = self.incoming_channels.send(handle);
    }

    /// §4.8 "`type == \"open\"`": decompose, verify, acquire-or-create the
    /// peer and line, and dispatch the handshake transition (§4.6).
    fn handle_rcv_open(&mut self, outer: OuterPacket, path: NetworkPath) {
        let decomposed = match self.crypto.decompose_open(&self.local_rsa_key, &outer) {
            Ok(decomposed) => decomposed,
            Err(_) => {
                self.stats.num_received_packet_errors += 1;
                tracing::debug!("ingress: dropped unparseable open packet");
                return;
            }
        };

        if !self.crypto.verify(&decomposed.remote_pubkey, &self.local_hashname) {
            tracing::info!(peer = %decomposed.remote_hashname, "ingress: open packet failed verification, dropping");
            return;
        }

        let peer_hashname = decomposed.remote_hashname;
        let peer = self.peers.get_or_create(peer_hashname);
        let had_path_before = !peer.paths().is_empty();
        peer.add_net_path(path);
        if !had_path_before {
            peer.set_active_path(path);
        }
        peer.set_public_key(decomposed.remote_pubkey);

        if !self.lines.contains_key(&peer_hashname) {
            self.lines.insert(peer_hashname, Line::new(peer_hashname));
        }

        let local_ephemeral = self
            .lines
            .get(&peer_hashname)
            .and_then(|l| l.local_keypair())
            .map(|(prv, publ)| (prv.to_vec(), publ.to_vec()))
            .unwrap_or_else(|| self.crypto.generate_ephemeral());

        let shr_key = match self
            .crypto
            .line_activate(&local_ephemeral.0, &decomposed.remote_ephemeral_pub)
        {
            Ok(key) => key,
            Err(_) => {
                self.stats.num_received_packet_errors += 1;
                return;
            }
        };

        let line = self.lines.get_mut(&peer_hashname).expect("inserted above");
        let remote_ephemeral_pub = decomposed.remote_ephemeral_pub.clone();
        let remote_line_id = decomposed.remote_line_id.clone();
        let actions = line.receive_open(remote_ephemeral_pub, remote_line_id, shr_key, move || local_ephemeral);

        match actions {
            Some(actions) => {
                self.stats.num_received_packets += 1;
                self.apply_line_actions(peer_hashname, actions);
                self.recompute_stats();
            }
            None => {
                tracing::debug!(peer = %peer_hashname, "ingress: open ignored, line not accepting opens in its current state");
            }
        }
    }

    fn recompute_stats(&mut self) {
        let mut open_lines = 0;
        let mut channels = 0;
        for line in self.lines.values() {
            if matches!(line.state(), LineState::Opened) {
                open_lines += 1;
            }
            channels += line.channels().len() as u64;
        }
        self.stats.running_lines = self.active_lines.len() as u64;
        self.stats.open_lines = open_lines;
        self.stats.channels = channels;
    }
}

pub(crate) fn new_channel_pair() -> (RunLoopHandle, mpsc::UnboundedReceiver<Envelope>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (RunLoopHandle { tx }, rx)
}

pub(crate) async fn run(mut state: SwitchState, mut rx: mpsc::UnboundedReceiver<Envelope>) {
    while let Some(env) = rx.recv().await {
        state.handle_envelope(env);
    }
}
