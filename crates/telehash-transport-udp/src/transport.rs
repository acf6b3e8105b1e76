//! UDP transport collaborator.
//!
//! Spec §6: the transport is an external collaborator providing
//! `open(addr)`, `read() -> (bytes, path)`, `write(bytes, path)`, `close()`
//! and `local_addresses()`. §5 additionally calls for "transport read
//! workers (one per hardware thread)" that read datagrams and hand them
//! to the switch; grounded in the original implementation's
//! `net_controller_open`, which spawns `runtime.NumCPU()` reader
//! goroutines against one shared UDP socket.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, Notify};

use crate::address::NetworkPath;
use crate::error::TransportError;

/// Maximum single datagram the transport will read. Telehash packets are
/// small (header + line/channel payload); this matches the original
/// source's `16*1024`-byte read buffer.
const MAX_DATAGRAM: usize = 16 * 1024;

/// The transport collaborator the switch core depends on.
///
/// Implementors must make `read` safe to call concurrently with `write`
/// and `close` from other tasks; the switch relies on this to run its
/// ingress reader pool independently of outbound sends.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Send `bytes` to `path`. Fails with [`TransportError::Closed`] once
    /// [`Transport::close`] has been called.
    async fn write(&self, bytes: &[u8], path: NetworkPath) -> Result<(), TransportError>;

    /// Receive the next datagram and its source path. Resolves to
    /// `Err(TransportError::Closed)` once the transport is shut down —
    /// callers (the ingress reader pool) should treat that as a signal to
    /// stop, not retry.
    async fn read(&self) -> Result<(Vec<u8>, NetworkPath), TransportError>;

    /// Addresses this transport is reachable on, for inclusion in seek
    /// replies or local diagnostics.
    fn local_addresses(&self) -> Vec<NetworkPath>;

    /// Shut the transport down. Idempotent; outstanding `read`/`write`
    /// calls resolve with `TransportError::Closed`.
    async fn close(&self);

    /// Best-effort probe send used by the path negotiator to punch a NAT
    /// binding ahead of a full handshake retry. Unlike `write`, failures
    /// are swallowed (there is nothing useful to do with them) rather
    /// than surfaced to the caller.
    async fn write_raw(&self, bytes: &[u8], path: NetworkPath) {
        let _ = self.write(bytes, path).await;
    }
}

/// Counters for packets moved across this transport, independent of the
/// switch-level [`Stats`](telehash_switch equivalent) — this tracks raw
/// datagrams, not decoded/decrypted line traffic.
#[derive(Debug, Default)]
pub struct TransportCounters {
    pub sent: AtomicU64,
    pub send_errors: AtomicU64,
    pub received: AtomicU64,
    pub receive_errors: AtomicU64,
}

/// Production UDP transport.
///
/// `bind` opens one `UdpSocket` and spawns `reader_tasks` independent
/// tasks that all call `recv_from` on a shared handle, forwarding
/// `(bytes, path)` into a single mpsc channel that `read()` drains. This
/// is the concrete shape of the "one reader per hardware thread" pool
/// called for in spec §5.
pub struct UdpTransport {
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
    inbound_rx: tokio::sync::Mutex<mpsc::Receiver<(Vec<u8>, NetworkPath)>>,
    pub counters: TransportCounters,
}

impl UdpTransport {
    /// Bind to `addr` and start `reader_tasks` background readers.
    ///
    /// `reader_tasks` should typically be `std::thread::available_parallelism()`;
    /// it is a parameter rather than hard-coded so tests can pin it to 1 for
    /// deterministic ordering.
    pub async fn bind(addr: SocketAddr, reader_tasks: usize) -> Result<Self, TransportError> {
        let socket = Arc::new(UdpSocket::bind(addr).await.map_err(TransportError::from_io)?);
        let local_addr = socket.local_addr().map_err(TransportError::from_io)?;
        let closed = Arc::new(AtomicBool::new(false));
        let shutdown = Arc::new(Notify::new());

        let (tx, rx) = mpsc::channel(1024);

        for _ in 0..reader_tasks.max(1) {
            let socket = Arc::clone(&socket);
            let tx = tx.clone();
            let closed = Arc::clone(&closed);
            let shutdown = Arc::clone(&shutdown);
            tokio::spawn(async move {
                reader_loop(socket, tx, closed, shutdown).await;
            });
        }

        Ok(Self {
            socket,
            local_addr,
            closed,
            shutdown,
            inbound_rx: tokio::sync::Mutex::new(rx),
            counters: TransportCounters::default(),
        })
    }
}

async fn reader_loop(
    socket: Arc<UdpSocket>,
    tx: mpsc::Sender<(Vec<u8>, NetworkPath)>,
    closed: Arc<AtomicBool>,
    shutdown: Arc<Notify>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        if closed.load(Ordering::Acquire) {
            return;
        }

        tokio::select! {
            _ = shutdown.notified() => return,
            result = socket.recv_from(&mut buf) => {
                match result {
                    Ok((n, addr)) => {
                        let datagram = buf[..n].to_vec();
                        if tx.send((datagram, NetworkPath::new(addr))).await.is_err() {
                            return;
                        }
                    }
                    Err(err) => {
                        if TransportError::from_io(err).is_closed() {
                            return;
                        }
                        tracing::debug!("udp reader: dropped datagram after io error");
                    }
                }
            }
        }
    }
}

#[async_trait]
impl Transport for UdpTransport {
    async fn write(&self, bytes: &[u8], path: NetworkPath) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Acquire) {
            self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
            return Err(TransportError::Closed);
        }

        match self.socket.send_to(bytes, path.socket_addr()).await {
            Ok(_) => {
                self.counters.sent.fetch_add(1, Ordering::Relaxed);
                Ok(())
            }
            Err(err) => {
                self.counters.send_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::from_io(err))
            }
        }
    }

    async fn read(&self) -> Result<(Vec<u8>, NetworkPath), TransportError> {
        let mut rx = self.inbound_rx.lock().await;
        match rx.recv().await {
            Some(datagram) => {
                self.counters.received.fetch_add(1, Ordering::Relaxed);
                Ok(datagram)
            }
            None => {
                self.counters.receive_errors.fetch_add(1, Ordering::Relaxed);
                Err(TransportError::Closed)
            }
        }
    }

    fn local_addresses(&self) -> Vec<NetworkPath> {
        vec![NetworkPath::new(self.local_addr)]
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback(port: u16) -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port)
    }

    #[tokio::test]
    async fn roundtrip_send_and_receive() {
        let server = UdpTransport::bind(loopback(0), 2).await.unwrap();
        let server_addr = server.local_addresses()[0];

        let client = UdpTransport::bind(loopback(0), 1).await.unwrap();
        let client_addr = client.local_addresses()[0];

        client.write(b"hello", server_addr).await.unwrap();
        let (bytes, from) = server.read().await.unwrap();
        assert_eq!(bytes, b"hello");
        assert_eq!(from.socket_addr(), client_addr.socket_addr());
    }

    #[tokio::test]
    async fn read_fails_closed_after_close() {
        let transport = UdpTransport::bind(loopback(0), 1).await.unwrap();
        transport.close().await;

        let err = transport.read().await.unwrap_err();
        assert!(err.is_closed());

        let err = transport.write(b"x", loopback(1)).await.unwrap_err();
        assert!(err.is_closed());
    }
}
