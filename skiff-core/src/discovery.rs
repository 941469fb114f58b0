//! Discovery: UDP announcement broadcaster plus TCP handshake listener and
//! dialer. Resolves into an established session carrying the control socket.

use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::oneshot;
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::{interval, MissedTickBehavior};

use crate::frame::BufferPool;
use crate::model::{truncate_utf8, DeviceAnnouncement};

/// UDP port announcements are broadcast to.
pub const DISCOVERY_PORT: u16 = 6666;
/// TCP port the handshake listener binds.
pub const HANDSHAKE_PORT: u16 = 6667;
/// Cap for announcement payloads and handshake device info.
pub const ANNOUNCE_LIMIT: usize = 1024;
/// Interval between broadcast datagrams.
pub const BROADCAST_DELAY: Duration = Duration::from_millis(300);

const ACCEPT_BYTE: u8 = 0x00;
const DENY_BYTE: u8 = 0x01;

/// Outcome of the host policy for one handshake attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDecision {
    Accept,
    Deny,
}

pub type DecisionFuture = Pin<Box<dyn Future<Output = SessionDecision> + Send>>;

/// Host-owned accept policy, invoked once per handshake attempt with the
/// remote address and the name it announced.
pub trait AcceptPolicy: Send + Sync + 'static {
    fn decide(&self, remote: SocketAddr, announced_name: String) -> DecisionFuture;
}

impl<F> AcceptPolicy for F
where
    F: Fn(SocketAddr, String) -> DecisionFuture + Send + Sync + 'static,
{
    fn decide(&self, remote: SocketAddr, announced_name: String) -> DecisionFuture {
        self(remote, announced_name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("discovery cancelled")]
    Cancelled,
    #[error("session denied by remote")]
    Denied,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    pub announcement: DeviceAnnouncement,
    pub local_addr: IpAddr,
    /// Where announcements are sent. Defaults to 255.255.255.255 (limited
    /// broadcast); hosts that know their interface should set the subnet
    /// broadcast address instead.
    pub broadcast_addr: IpAddr,
    pub discovery_port: u16,
    pub handshake_port: u16,
    pub broadcast_delay: Duration,
}

impl DiscoveryConfig {
    pub fn new(announcement: DeviceAnnouncement) -> Self {
        Self {
            announcement,
            local_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            broadcast_addr: IpAddr::V4(Ipv4Addr::BROADCAST),
            discovery_port: DISCOVERY_PORT,
            handshake_port: HANDSHAKE_PORT,
            broadcast_delay: BROADCAST_DELAY,
        }
    }
}

/// An accepted session: the peer and the socket that becomes the control
/// channel's transport.
#[derive(Debug)]
pub struct EstablishedSession {
    pub peer_addr: SocketAddr,
    pub stream: TcpStream,
}

/// Running discovery. Await [`DiscoveryHandle::established`] for the session;
/// dropping the handle (or cancelling) stops both the broadcaster and the
/// listener.
pub struct DiscoveryHandle {
    handshake_addr: SocketAddr,
    established_rx: oneshot::Receiver<Result<EstablishedSession, DiscoveryError>>,
    broadcaster: JoinHandle<()>,
    listener: JoinHandle<()>,
}

/// Clonable cancel switch for a running discovery.
#[derive(Clone)]
pub struct DiscoveryCanceller {
    broadcaster: AbortHandle,
    listener: AbortHandle,
}

impl DiscoveryCanceller {
    pub fn cancel(&self) {
        self.broadcaster.abort();
        self.listener.abort();
    }
}

impl DiscoveryHandle {
    /// Actual bound address of the handshake listener.
    pub fn handshake_addr(&self) -> SocketAddr {
        self.handshake_addr
    }

    pub fn canceller(&self) -> DiscoveryCanceller {
        DiscoveryCanceller {
            broadcaster: self.broadcaster.abort_handle(),
            listener: self.listener.abort_handle(),
        }
    }

    /// Resolves once a handshake is accepted, or with `Cancelled` after
    /// [`DiscoveryCanceller::cancel`].
    pub async fn established(mut self) -> Result<EstablishedSession, DiscoveryError> {
        match (&mut self.established_rx).await {
            Ok(result) => result,
            Err(_) => Err(DiscoveryError::Cancelled),
        }
    }
}

impl Drop for DiscoveryHandle {
    fn drop(&mut self) {
        self.broadcaster.abort();
        self.listener.abort();
    }
}

pub struct Discovery;

impl Discovery {
    /// Bind the handshake listener and the broadcast socket, then run both
    /// roles until a session is accepted or the handle is cancelled.
    pub async fn start<P: AcceptPolicy>(
        config: DiscoveryConfig,
        policy: P,
    ) -> std::io::Result<DiscoveryHandle> {
        let listener =
            TcpListener::bind((config.local_addr, config.handshake_port)).await?;
        let handshake_addr = listener.local_addr()?;

        let udp = UdpSocket::bind((config.local_addr, 0)).await?;
        udp.set_broadcast(true)?;
        let target = SocketAddr::new(config.broadcast_addr, config.discovery_port);
        let payload = truncate_utf8(&config.announcement.text, ANNOUNCE_LIMIT)
            .as_bytes()
            .to_vec();
        let delay = config.broadcast_delay;
        let broadcaster = tokio::spawn(broadcast_loop(udp, payload, target, delay));

        let (established_tx, established_rx) = oneshot::channel();
        let listener = tokio::spawn(async move {
            let session = accept_session(listener, policy).await;
            let _ = established_tx.send(session);
        });

        Ok(DiscoveryHandle {
            handshake_addr,
            established_rx,
            broadcaster,
            listener,
        })
    }
}

/// Dial a remote handshake listener: send our device info, await the one-byte
/// verdict. On accept the returned socket is the control transport.
pub async fn request_session(
    remote: SocketAddr,
    announcement: &DeviceAnnouncement,
) -> Result<TcpStream, DiscoveryError> {
    let mut stream = TcpStream::connect(remote).await?;
    let info = truncate_utf8(&announcement.text, ANNOUNCE_LIMIT).as_bytes();
    stream.write_all(&(info.len() as u32).to_be_bytes()).await?;
    stream.write_all(info).await?;
    stream.flush().await?;
    let mut verdict = [0u8; 1];
    stream.read_exact(&mut verdict).await?;
    if verdict[0] == ACCEPT_BYTE {
        Ok(stream)
    } else {
        Err(DiscoveryError::Denied)
    }
}

async fn broadcast_loop(
    socket: UdpSocket,
    payload: Vec<u8>,
    target: SocketAddr,
    delay: Duration,
) {
    let mut ticker = interval(delay);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        // Send failures are retried on the next tick, never fatal.
        if let Err(error) = socket.send_to(&payload, target).await {
            tracing::warn!(event = "discovery_broadcast_send_failed", error = %error);
        }
    }
}

async fn accept_session<P: AcceptPolicy>(
    listener: TcpListener,
    policy: P,
) -> Result<EstablishedSession, DiscoveryError> {
    let pool = BufferPool::new();
    loop {
        let (mut stream, peer_addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(error) => {
                tracing::warn!(event = "discovery_accept_failed", error = %error);
                tokio::time::sleep(Duration::from_millis(250)).await;
                continue;
            }
        };
        match handshake_attempt(&mut stream, peer_addr, &policy, &pool).await {
            Ok(SessionDecision::Accept) => {
                tracing::info!(event = "discovery_session_accepted", peer = %peer_addr);
                return Ok(EstablishedSession { peer_addr, stream });
            }
            Ok(SessionDecision::Deny) => {
                tracing::info!(event = "discovery_session_denied", peer = %peer_addr);
                // Client socket dropped; keep listening.
            }
            Err(error) => {
                tracing::warn!(
                    event = "discovery_handshake_failed",
                    peer = %peer_addr,
                    error = %error
                );
            }
        }
    }
}

/// One handshake: 4-byte length (clamped into `[0, 1024]`), device info
/// bytes, then exactly one verdict byte.
async fn handshake_attempt<P: AcceptPolicy>(
    stream: &mut TcpStream,
    peer_addr: SocketAddr,
    policy: &P,
    pool: &BufferPool,
) -> std::io::Result<SessionDecision> {
    let mut len_buf = [0u8; 4];
    stream.read_exact(&mut len_buf).await?;
    let len = (u32::from_be_bytes(len_buf) as usize).min(ANNOUNCE_LIMIT);
    let mut buf = pool.take();
    stream.read_exact(&mut buf[..len]).await?;
    let announced = String::from_utf8_lossy(&buf[..len]).into_owned();
    pool.restore(buf);

    let decision = policy.decide(peer_addr, announced).await;
    let verdict = match decision {
        SessionDecision::Accept => ACCEPT_BYTE,
        SessionDecision::Deny => DENY_BYTE,
    };
    stream.write_all(&[verdict]).await?;
    stream.flush().await?;
    Ok(decision)
}
