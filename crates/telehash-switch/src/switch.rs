//! Public switch surface (§6): `Switch` lifecycle, `OpenChannel`, `Stats`,
//! `LocalHashname`, and the per-channel `ReadPacket`/`WritePacket`/
//! `SetReadDeadline`/`Close`/`Kill` methods.
//!
//! Grounded in `spark-switch/src/core/session_manager.rs`'s facade shape:
//! a thin handle wrapping a command-posting seam, with all real state
//! confined to the run loop task (§5). `Switch` itself owns no protocol
//! state directly — it is a cloneable set of handles onto the run loop,
//! the ingress reader task, and the periodic maintenance loops.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tracing::Instrument;

use telehash_core::{Clock, SystemClock, TaskExecutor, TokioExecutor};
use telehash_transport_udp::Transport;

use crate::channel::{ChannelOptions, Reliability};
use crate::command::{ChannelAddr, CloseReason, Command, CommandOutcome};
use crate::config::SwitchConfig;
use crate::crypto::{CryptoEnvelope, RsaPrivateKey, RsaPublicKey};
use crate::dht::PeerDirectory;
use crate::error::SwitchError;
use crate::hashname::Hashname;
use crate::packet::{InnerHeader, InnerPacket};
use crate::path::PathNegotiator;
use crate::peer::PeerRegistry;
use crate::relay::{NullRelayHandler, RelayHandler};
use crate::runloop::{new_channel_pair, run, RunLoopHandle, SwitchState};
use crate::stats::Stats;

/// Everything `Switch::open` needs to materialize a switch. The two
/// collaborators with no sensible default (`crypto`, `transport`) are
/// required positionally; everything else has a workable default that
/// tests and simple deployments can leave untouched.
pub struct SwitchOptions {
    pub local_rsa_key: RsaPrivateKey,
    pub local_rsa_pub: RsaPublicKey,
    pub crypto: Arc<dyn CryptoEnvelope>,
    pub transport: Arc<dyn Transport>,
    pub path_negotiator: Arc<dyn PathNegotiator>,
    pub relay_handler: Arc<dyn RelayHandler>,
    pub directories: Vec<Box<dyn PeerDirectory>>,
    pub config: SwitchConfig,
    pub clock: Arc<dyn Clock>,
    pub executor: Arc<dyn TaskExecutor>,
}

impl SwitchOptions {
    /// Construct with every optional collaborator defaulted: no peer
    /// directories, a null relay handler, the default timer constants, a
    /// real system clock, and `tokio::spawn` as the executor.
    pub fn new(
        local_rsa_key: RsaPrivateKey,
        local_rsa_pub: RsaPublicKey,
        crypto: Arc<dyn CryptoEnvelope>,
        transport: Arc<dyn Transport>,
        path_negotiator: Arc<dyn PathNegotiator>,
    ) -> Self {
        Self {
            local_rsa_key,
            local_rsa_pub,
            crypto,
            transport,
            path_negotiator,
            relay_handler: Arc::new(NullRelayHandler),
            directories: Vec::new(),
            config: SwitchConfig::default(),
            clock: Arc::new(SystemClock),
            executor: Arc::new(TokioExecutor),
        }
    }
}

/// A channel opened or accepted on a [`Switch`] (§3 "Channel", §6 "Channel
/// methods"). Cheap to clone; every method posts a command to the owning
/// run loop rather than touching any local state.
#[derive(Clone)]
pub struct ChannelHandle {
    handle: RunLoopHandle,
    addr: ChannelAddr,
}

impl ChannelHandle {
    pub(crate) fn new(handle: RunLoopHandle, addr: ChannelAddr) -> Self {
        Self { handle, addr }
    }

    pub fn peer(&self) -> Hashname {
        self.addr.peer
    }

    pub fn id(&self) -> &str {
        &self.addr.channel_id
    }

    /// `ReadPacket`: block until the next inbound packet, a deadline
    /// reached, or the channel/line broke.
    pub async fn read_packet(&self) -> Result<InnerPacket, SwitchError> {
        match self.handle.call(Command::GetRcvPkt { addr: self.addr.clone() }).await? {
            CommandOutcome::Packet(pkt) => Ok(pkt),
            other => Err(SwitchError::internal(format!("unexpected outcome for GetRcvPkt: {other:?}"))),
        }
    }

    /// `WritePacket`: seal `payload` with no application-level header
    /// fields beyond what the channel's send bookkeeping assigns (§4.7).
    pub async fn write_packet(&self, payload: Vec<u8>) -> Result<(), SwitchError> {
        let inner = InnerPacket {
            header: InnerHeader::default(),
            payload,
            path: None,
        };
        self.handle
            .call(Command::SendPacket {
                addr: self.addr.clone(),
                inner,
                path_override: None,
            })
            .await?;
        Ok(())
    }

    /// `SetReadDeadline`: `deadline_millis` is an absolute timestamp,
    /// measured in milliseconds since the owning switch's epoch (see
    /// [`ChannelHandle::clock_now_millis`]); `0` clears any deadline.
    pub async fn set_read_deadline(&self, deadline_millis: i64) -> Result<(), SwitchError> {
        self.handle
            .call(Command::SetRcvDeadline {
                addr: self.addr.clone(),
                deadline_millis,
            })
            .await?;
        Ok(())
    }

    /// Current time on the owning switch's clock, in the same epoch
    /// `set_read_deadline`'s absolute `deadline_millis` is measured
    /// against. Combine with a `Duration` to set a relative deadline:
    /// `channel.set_read_deadline(channel.clock_now_millis().await? + 1_000).await`.
    pub async fn clock_now_millis(&self) -> Result<i64, SwitchError> {
        match self.handle.call(Command::GetClockMillis).await? {
            CommandOutcome::Millis(millis) => Ok(millis),
            other => Err(SwitchError::internal(format!("unexpected outcome for GetClockMillis: {other:?}"))),
        }
    }

    /// As [`ChannelHandle::set_read_deadline`], but expressed as a
    /// duration from now rather than an absolute timestamp. A negative
    /// `offset` sets a deadline already in the past.
    pub async fn set_read_deadline_in(&self, offset: i64) -> Result<(), SwitchError> {
        let now = self.clock_now_millis().await?;
        self.set_read_deadline(now + offset).await
    }

    /// `Close`: graceful half-close. Outstanding reads still drain
    /// whatever is already queued.
    pub fn close(&self) {
        self.handle.cast(Command::CloseChannel { addr: self.addr.clone() });
    }

    /// `Kill`: immediate teardown, cancelling every pending read/write
    /// with `ErrChannelBroken`.
    pub fn kill(&self) {
        self.handle.cast(Command::KillChannel { addr: self.addr.clone() });
    }
}

/// The switch runtime (§2, §6). Owns handles onto the run loop task, the
/// transport ingress reader, and the periodic maintenance loops; all
/// actual peer/line/channel state lives inside the run loop (§5).
pub struct Switch {
    handle: RunLoopHandle,
    local_hashname: Hashname,
    transport: Arc<dyn Transport>,
    incoming: AsyncMutex<mpsc::UnboundedReceiver<ChannelHandle>>,
    shutdown_grace: std::time::Duration,
    stopped: Arc<AtomicBool>,
}

impl Switch {
    /// `Open()`: materialize a switch and start its run loop, ingress
    /// reader, and periodic maintenance (channel GC, path recheck, stats
    /// log) loops. `options.transport` must already be bound/listening;
    /// opening the underlying socket is the transport collaborator's job.
    pub fn open(options: SwitchOptions) -> Self {
        let local_hashname = options.crypto.hashname_of(&options.local_rsa_pub);
        let (handle, rx) = new_channel_pair();
        let (incoming_tx, incoming_rx) = mpsc::unbounded_channel();
        let epoch = options.clock.now();

        let state = SwitchState {
            peers: PeerRegistry::new(options.directories),
            lines: std::collections::HashMap::new(),
            active_lines: std::collections::HashMap::new(),
            terminating: false,
            stats: Stats::default(),
            config: options.config,
            crypto: options.crypto,
            transport: Arc::clone(&options.transport),
            path_negotiator: options.path_negotiator,
            relay_handler: options.relay_handler,
            clock: Arc::clone(&options.clock),
            executor: Arc::clone(&options.executor),
            local_hashname,
            local_rsa_key: options.local_rsa_key,
            local_rsa_pub: options.local_rsa_pub,
            epoch,
            handle: handle.clone(),
            timers: std::collections::HashMap::new(),
            incoming_channels: incoming_tx,
        };

        tokio::spawn(
            run(state, rx)
                .instrument(tracing::info_span!(target: telehash_core::observability::SPAN_RUN_LOOP, "run_loop")),
        );

        let stopped = Arc::new(AtomicBool::new(false));
        spawn_ingress_reader(Arc::clone(&options.transport), handle.clone());
        spawn_periodic(
            Arc::clone(&options.clock),
            Arc::clone(&stopped),
            options.config.channel_gc_period,
            handle.clone(),
            || Command::ChannelGc,
        );
        spawn_periodic(
            Arc::clone(&options.clock),
            Arc::clone(&stopped),
            options.config.path_recheck_period,
            handle.clone(),
            || Command::PathRecheck,
        );
        spawn_periodic(
            options.clock,
            Arc::clone(&stopped),
            options.config.stats_log_period,
            handle.clone(),
            || Command::StatsLog,
        );

        Self {
            handle,
            local_hashname,
            transport: options.transport,
            incoming: AsyncMutex::new(incoming_rx),
            shutdown_grace: options.config.shutdown_grace,
            stopped,
        }
    }

    pub fn local_hashname(&self) -> Hashname {
        self.local_hashname
    }

    /// `OpenChannel(options)`: open a channel to `peer`, creating the
    /// line if necessary. Deferred on the line's backlog until the line
    /// reaches `opened` (or, for `type == "path"`, `pathing`) per §4.7.
    pub async fn open_channel(
        &self,
        peer: Hashname,
        kind: impl Into<String>,
        reliability: Reliability,
    ) -> Result<ChannelHandle, SwitchError> {
        self.open_channel_with_id(peer, None, kind, reliability).await
    }

    /// As [`Switch::open_channel`], but with an explicit channel id
    /// instead of a randomly generated one (used by an initiator that
    /// needs to predict its own id, e.g. to hand it to a remote peer out
    /// of band before opening).
    pub async fn open_channel_with_id(
        &self,
        peer: Hashname,
        id: Option<String>,
        kind: impl Into<String>,
        reliability: Reliability,
    ) -> Result<ChannelHandle, SwitchError> {
        let options = ChannelOptions {
            peer,
            id,
            kind: kind.into(),
            reliability,
        };
        match self.handle.call(Command::OpenChannel { options }).await? {
            CommandOutcome::ChannelOpened(addr) => Ok(ChannelHandle::new(self.handle.clone(), addr)),
            other => Err(SwitchError::internal(format!("unexpected outcome for OpenChannel: {other:?}"))),
        }
    }

    /// Receive the next inbound channel opened by a remote peer (§4.7
    /// "Open (inbound)"). Resolves to `None` once the switch has closed.
    pub async fn accept_channel(&self) -> Option<ChannelHandle> {
        self.incoming.lock().await.recv().await
    }

    /// `Stats()` (§6).
    pub async fn stats(&self) -> Result<Stats, SwitchError> {
        match self.handle.call(Command::GetStats).await? {
            CommandOutcome::Stats(stats) => Ok(stats),
            other => Err(SwitchError::internal(format!("unexpected outcome for GetStats: {other:?}"))),
        }
    }

    /// `Close()`: begin graceful shutdown. Every open line receives a
    /// close-down command within `shutdown_grace` (§5, §8 scenario S6);
    /// this call waits out that grace window, then stops the ingress
    /// reader and periodic loops and closes the transport.
    pub async fn close(&self) {
        let _ = self.handle.call(Command::Shutdown).await;
        tokio::time::sleep(self.shutdown_grace).await;
        self.stopped.store(true, Ordering::Release);
        self.transport.close().await;
    }

    /// Force every open line closed immediately, bypassing the shutdown
    /// grace window. Used by tests that need deterministic teardown.
    pub async fn close_line_now(&self, peer: Hashname) {
        let _ = self
            .handle
            .call(Command::CloseLine {
                peer,
                reason: CloseReason::Down,
            })
            .await;
    }
}

fn spawn_ingress_reader(transport: Arc<dyn Transport>, handle: RunLoopHandle) {
    tokio::spawn(async move {
        loop {
            match transport.read().await {
                Ok((bytes, path)) => handle.cast(Command::RcvDatagram { bytes, path }),
                Err(err) if err.is_closed() => return,
                Err(_) => continue,
            }
        }
    });
}

fn spawn_periodic(
    clock: Arc<dyn Clock>,
    stopped: Arc<AtomicBool>,
    period: std::time::Duration,
    handle: RunLoopHandle,
    command_factory: impl Fn() -> Command + Send + 'static,
) {
    tokio::spawn(async move {
        loop {
            clock.sleep(period).await;
            if stopped.load(Ordering::Acquire) {
                return;
            }
            handle.cast(command_factory());
        }
    });
}

#[cfg(test)]
mod tests {
    use std::net::{IpAddr, Ipv4Addr, SocketAddr};
    use std::time::Duration;

    use async_trait::async_trait;

    use telehash_transport_udp::{NetworkPath, UdpTransport};

    use crate::crypto::fake::FakeCryptoEnvelope;

    use super::*;

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    /// A directory with exactly one entry, used to seed each switch with
    /// the other's pubkey and address so `known_contact` is true on the
    /// very first outbound open (§4.5).
    struct StaticDirectory {
        hashname: Hashname,
        entry: crate::dht::PeerDirectoryEntry,
    }

    impl PeerDirectory for StaticDirectory {
        fn get_peer(&self, hashname: &Hashname) -> Option<crate::dht::PeerDirectoryEntry> {
            (*hashname == self.hashname).then(|| self.entry.clone())
        }

        fn on_new_peer(&self, _hashname: &Hashname) {}
    }

    /// A path negotiator that always reports success without doing any
    /// actual probing, since the real NAT-traversal mechanics are out of
    /// scope (§4.9) and these tests already place both sides on the same
    /// loopback address.
    struct AlwaysNegotiate;

    #[async_trait]
    impl PathNegotiator for AlwaysNegotiate {
        async fn negotiate(&self, _peer: Hashname) -> bool {
            true
        }

        async fn negotiate_netpath(&self, _peer: Hashname) -> bool {
            true
        }
    }

    /// Timer constants short enough that the test doesn't sit through the
    /// production defaults, while still exercising every transition.
    fn fast_config() -> SwitchConfig {
        SwitchConfig {
            line_broken_timeout: Duration::from_secs(5),
            line_open_timeout: Duration::from_secs(2),
            channel_gc_period: Duration::from_secs(60),
            stats_log_period: Duration::from_secs(60),
            shutdown_grace: Duration::from_millis(50),
            path_recheck_freshness: Duration::from_secs(120),
            path_recheck_period: Duration::from_secs(60),
            line_idle_timeout: Duration::from_secs(600),
        }
    }

    async fn open_switch(
        rsa_pub_byte: u8,
        transport: Arc<dyn Transport>,
        directories: Vec<Box<dyn PeerDirectory>>,
    ) -> Switch {
        open_switch_with_config(rsa_pub_byte, transport, directories, fast_config()).await
    }

    async fn open_switch_with_config(
        rsa_pub_byte: u8,
        transport: Arc<dyn Transport>,
        directories: Vec<Box<dyn PeerDirectory>>,
        config: SwitchConfig,
    ) -> Switch {
        let options = SwitchOptions {
            local_rsa_key: RsaPrivateKey(vec![rsa_pub_byte; 8]),
            local_rsa_pub: RsaPublicKey(vec![rsa_pub_byte; 8]),
            crypto: Arc::new(FakeCryptoEnvelope),
            transport,
            path_negotiator: Arc::new(AlwaysNegotiate),
            relay_handler: Arc::new(NullRelayHandler),
            directories,
            config,
            clock: Arc::new(SystemClock),
            executor: Arc::new(TokioExecutor),
        };
        Switch::open(options)
    }

    /// Stand up two switches that already know each other's pubkey and
    /// address (§4.5 `known_contact`), drive a handshake to completion by
    /// opening an unreliable "setup" channel from `a` to `b`, and hand back
    /// both switches, both endpoints of that channel, and each side's
    /// hashname/transport/address — the common scaffolding every S2-S6
    /// scenario below builds on.
    struct Harness {
        a: Switch,
        b: Switch,
        a_hashname: Hashname,
        b_hashname: Hashname,
        a_transport: Arc<dyn Transport>,
        b_addr: NetworkPath,
        a_channel: ChannelHandle,
        b_channel: ChannelHandle,
    }

    /// Fetch the raw bytes of the `shr_key` a switch has installed for
    /// `peer`, via the test-only `DebugLineKeyBytes` introspection
    /// command (§5: state is only ever touched through a command).
    async fn line_key_bytes(switch: &Switch, peer: Hashname) -> Vec<u8> {
        match switch.handle.call(Command::DebugLineKeyBytes { peer }).await.unwrap() {
            CommandOutcome::LineKeyBytes(Some(bytes)) => bytes,
            other => panic!("expected a line key for {peer}, got {other:?}"),
        }
    }

    /// Fetch the id a switch installed for its own side of its line to
    /// `peer`, i.e. the value a correspondent must stamp onto outer
    /// line packets addressed to it.
    async fn local_line_id(switch: &Switch, peer: Hashname) -> String {
        match switch.handle.call(Command::DebugLocalLineId { peer }).await.unwrap() {
            CommandOutcome::LineId(Some(id)) => id,
            other => panic!("expected a local line id for {peer}, got {other:?}"),
        }
    }

    /// Forge a line packet addressed to `target` as if it came from the
    /// other side of an already-opened line, and hand it directly to
    /// `target`'s transport — bypassing channel send bookkeeping so a
    /// test can construct an otherwise-invalid inner header (§8 S2).
    async fn forge_line_packet(
        target: &Switch,
        peer: Hashname,
        header: InnerHeader,
        payload: Vec<u8>,
        via_transport: &Arc<dyn Transport>,
        to_addr: NetworkPath,
    ) {
        let key = crate::crypto::LineKey(line_key_bytes(target, peer).await);
        let line_id = local_line_id(target, peer).await;
        let inner = InnerPacket { header, payload, path: None };
        let mut outer = FakeCryptoEnvelope.seal(&key, &inner).unwrap();
        outer.header.line = Some(line_id);
        let bytes = outer.encode().unwrap();
        via_transport.write(&bytes, to_addr).await.unwrap();
    }

    async fn setup_harness(config: SwitchConfig) -> Harness {
        let a_transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind(loopback(0), 1).await.unwrap());
        let b_transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind(loopback(0), 1).await.unwrap());
        let a_addr = a_transport.local_addresses()[0];
        let b_addr = b_transport.local_addresses()[0];

        let crypto = FakeCryptoEnvelope;
        let a_hashname = crypto.hashname_of(&RsaPublicKey(vec![0xA; 8]));
        let b_hashname = crypto.hashname_of(&RsaPublicKey(vec![0xB; 8]));

        let a = open_switch_with_config(
            0xA,
            Arc::clone(&a_transport),
            vec![Box::new(StaticDirectory {
                hashname: b_hashname,
                entry: crate::dht::PeerDirectoryEntry {
                    pubkey: Some(RsaPublicKey(vec![0xB; 8])),
                    paths: vec![b_addr],
                },
            })],
            config,
        )
        .await;
        let b = open_switch_with_config(
            0xB,
            b_transport,
            vec![Box::new(StaticDirectory {
                hashname: a_hashname,
                entry: crate::dht::PeerDirectoryEntry {
                    pubkey: Some(RsaPublicKey(vec![0xA; 8])),
                    paths: vec![a_addr],
                },
            })],
            config,
        )
        .await;

        let a_channel = a
            .open_channel(b_hashname, "setup", Reliability::Unreliable)
            .await
            .expect("line negotiation should complete and the channel should open");
        // As in the S1 test above: nothing reaches `b` until a's first
        // packet carries the channel's type.
        a_channel.write_packet(Vec::new()).await.unwrap();
        let b_channel = b
            .accept_channel()
            .await
            .expect("b should see the inbound channel once a's open packet lands");
        // Drain the empty packet that announced the channel, so scenarios
        // below see a clean read buffer.
        b_channel.read_packet().await.expect("should receive a's setup packet");

        Harness {
            a,
            b,
            a_hashname,
            b_hashname,
            a_transport,
            b_addr,
            a_channel,
            b_channel,
        }
    }

    /// End-to-end handshake and channel exchange (§8 scenario S1): two
    /// switches each known to the other via a static directory open a
    /// line, negotiate a path, open an unreliable channel, and exchange
    /// packets in both directions.
    #[tokio::test(flavor = "multi_thread")]
    async fn two_switches_open_line_and_exchange_packets() {
        let a_transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind(loopback(0), 1).await.unwrap());
        let b_transport: Arc<dyn Transport> =
            Arc::new(UdpTransport::bind(loopback(0), 1).await.unwrap());
        let a_addr = a_transport.local_addresses()[0];
        let b_addr = b_transport.local_addresses()[0];

        let crypto = FakeCryptoEnvelope;
        let a_hashname = crypto.hashname_of(&RsaPublicKey(vec![0xA; 8]));
        let b_hashname = crypto.hashname_of(&RsaPublicKey(vec![0xB; 8]));

        let a = open_switch(
            0xA,
            a_transport,
            vec![Box::new(StaticDirectory {
                hashname: b_hashname,
                entry: crate::dht::PeerDirectoryEntry {
                    pubkey: Some(RsaPublicKey(vec![0xB; 8])),
                    paths: vec![b_addr],
                },
            })],
        )
        .await;
        let b = open_switch(
            0xB,
            b_transport,
            vec![Box::new(StaticDirectory {
                hashname: a_hashname,
                entry: crate::dht::PeerDirectoryEntry {
                    pubkey: Some(RsaPublicKey(vec![0xA; 8])),
                    paths: vec![a_addr],
                },
            })],
        )
        .await;

        assert_eq!(a.local_hashname(), a_hashname);
        assert_eq!(b.local_hashname(), b_hashname);

        let a_channel = a
            .open_channel(b_hashname, "chat", Reliability::Unreliable)
            .await
            .expect("line negotiation should complete and the channel should open");

        // A channel exists only locally until its first packet carries the
        // channel's type to the remote side (§4.7 "Open (inbound)"); `b`
        // has nothing to `accept_channel()` until this lands.
        a_channel.write_packet(b"hello from a".to_vec()).await.unwrap();

        let b_channel = b
            .accept_channel()
            .await
            .expect("b should see the inbound channel once a's open packet lands");
        assert_eq!(b_channel.peer(), a_hashname);
        assert_eq!(b_channel.id(), a_channel.id());

        let received = b_channel.read_packet().await.unwrap();
        assert_eq!(received.payload, b"hello from a");

        b_channel.write_packet(b"hello from b".to_vec()).await.unwrap();
        let received = a_channel.read_packet().await.unwrap();
        assert_eq!(received.payload, b"hello from b");

        let a_stats = a.stats().await.unwrap();
        assert_eq!(a_stats.open_lines, 1);
        assert_eq!(a_stats.channels, 1);

        a.close().await;
        b.close().await;
    }

    /// §8 scenario S2: a reliable channel's first packet must carry
    /// sequence 0. A forged inbound packet on a never-opened channel id
    /// with `seq = 5` is rejected outright — no channel is created, and
    /// the drop is counted rather than silently swallowed.
    #[tokio::test(flavor = "multi_thread")]
    async fn reliable_channel_rejects_nonzero_first_sequence() {
        let harness = setup_harness(fast_config()).await;
        let before = harness.b.stats().await.unwrap();

        forge_line_packet(
            &harness.b,
            harness.a_hashname,
            InnerHeader {
                channel_id: Some("evil-reliable".to_string()),
                kind: Some("ping".to_string()),
                seq: Some(5),
                ..Default::default()
            },
            vec![0x01],
            &harness.a_transport,
            harness.b_addr,
        )
        .await;

        // Give the run loop one quantum to process the forged datagram.
        tokio::time::sleep(Duration::from_millis(100)).await;

        let after = harness.b.stats().await.unwrap();
        assert_eq!(after.channels, before.channels, "no channel should have been created");
        assert!(after.num_received_packet_errors > before.num_received_packet_errors);

        harness.a.close().await;
        harness.b.close().await;
    }

    /// §8 scenario S3: a fresh open packet on an already-opened line is a
    /// rekey, not a teardown. The line stays `opened` with a new
    /// `shr_key`, and the recipient replies with its own open.
    #[tokio::test(flavor = "multi_thread")]
    async fn rekey_on_opened_line_refreshes_shr_key_and_stays_opened() {
        let harness = setup_harness(fast_config()).await;

        let key_before = line_key_bytes(&harness.b, harness.a_hashname).await;

        let crypto = FakeCryptoEnvelope;
        let (eph_prv, eph_pub) = crypto.generate_ephemeral();
        let line_id = hex::encode(&eph_pub);
        let a_pub = RsaPublicKey(vec![0xA; 8]);
        let a_prv = RsaPrivateKey(vec![0xA; 8]);
        let b_pub = RsaPublicKey(vec![0xB; 8]);
        let outer = crypto
            .make_open(&a_prv, &a_pub, &harness.a_hashname, &eph_pub, &line_id, &b_pub)
            .unwrap();
        let bytes = outer.encode().unwrap();
        let _ = eph_prv;

        harness
            .a_transport
            .write(&bytes, harness.b_addr)
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;

        let key_after = line_key_bytes(&harness.b, harness.a_hashname).await;
        assert_ne!(key_before, key_after, "rekey should have derived a fresh shr_key");

        let b_stats = harness.b.stats().await.unwrap();
        assert_eq!(b_stats.open_lines, 1, "line should remain opened across a rekey");

        harness.a.close().await;
        harness.b.close().await;
    }

    /// §8 scenario S4: a line's `broken_timer` expiring cascades into
    /// closing the line and failing every pending channel operation
    /// with `ErrChannelBroken`.
    #[tokio::test(flavor = "multi_thread")]
    async fn broken_line_cascades_to_pending_reads() {
        let mut config = fast_config();
        config.line_broken_timeout = Duration::from_millis(300);
        let harness = setup_harness(config).await;

        let b_channel = harness.b_channel.clone();
        let read = tokio::spawn(async move { b_channel.read_packet().await });

        let result = tokio::time::timeout(Duration::from_secs(5), read)
            .await
            .expect("broken_timer should have fired well within the timeout")
            .unwrap();
        assert_eq!(result.unwrap_err(), SwitchError::ChannelBroken);

        let b_stats = harness.b.stats().await.unwrap();
        assert_eq!(b_stats.open_lines, 0, "the broken line should have been removed");

        harness.a.close().await;
        harness.b.close().await;
    }

    /// §8 scenario S5: a deadline already in the past completes the next
    /// (or currently pending) read immediately with a deadline error.
    #[tokio::test(flavor = "multi_thread")]
    async fn read_deadline_in_the_past_completes_immediately() {
        let harness = setup_harness(fast_config()).await;

        harness.b_channel.set_read_deadline_in(-1).await.unwrap();
        let result = tokio::time::timeout(Duration::from_millis(200), harness.b_channel.read_packet())
            .await
            .expect("a past deadline should resolve within one quantum");
        assert_eq!(result.unwrap_err(), SwitchError::ReadDeadlineExceeded);

        harness.a.close().await;
        harness.b.close().await;
    }

    /// §8 scenario S6: `Close()` schedules close-down for every open line
    /// within the shutdown grace window, cascading to any pending channel
    /// operation.
    #[tokio::test(flavor = "multi_thread")]
    async fn shutdown_grace_closes_lines_and_cascades_pending_reads() {
        let mut config = fast_config();
        config.shutdown_grace = Duration::from_millis(50);
        let harness = setup_harness(config).await;

        let b_channel = harness.b_channel.clone();
        let read = tokio::spawn(async move { b_channel.read_packet().await });

        harness.b.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), read)
            .await
            .expect("pending read should have been cancelled by shutdown")
            .unwrap();
        assert_eq!(result.unwrap_err(), SwitchError::ChannelBroken);

        harness.a.close().await;
    }

    /// §4.6 "any | idle policy | closed | close-idle": an opened line left
    /// with no channels and no path sync for `line_idle_timeout` is
    /// reclaimed by the periodic GC sweep, distinct from `broken_timer`
    /// expiry (set well outside this test's window).
    #[tokio::test(flavor = "multi_thread")]
    async fn idle_line_with_no_channels_is_closed_as_idle() {
        let mut config = fast_config();
        config.line_broken_timeout = Duration::from_secs(5);
        config.line_idle_timeout = Duration::from_millis(100);
        config.channel_gc_period = Duration::from_millis(50);
        let harness = setup_harness(config).await;

        harness.a_channel.close();
        harness.b_channel.close();

        tokio::time::sleep(Duration::from_millis(400)).await;

        let a_stats = harness.a.stats().await.unwrap();
        let b_stats = harness.b.stats().await.unwrap();
        assert_eq!(a_stats.open_lines, 0, "a's idle line should have been reclaimed");
        assert_eq!(b_stats.open_lines, 0, "b's idle line should have been reclaimed");

        harness.a.close().await;
        harness.b.close().await;
    }
}
