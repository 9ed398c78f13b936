use anyhow::{anyhow, Context, Result};
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use log::{debug, error, info, warn};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use super::certificate::CertificateStore;

/// The only request the responder understands
pub const REQUEST_TOKEN: &[u8] = b"REQUEST";

const MAX_DATAGRAM: usize = 8 * 1024;
const REBIND_DELAY: Duration = Duration::from_secs(1);

/// How hard the client tries before giving up on a peer
#[derive(Debug, Clone, Copy)]
pub struct FetchPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub receive_timeout: Duration,
}

/// Unauthenticated UDP responder handing out our certificate
pub struct CertificateResponder {
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

impl CertificateResponder {
    /// Bind `port` on all interfaces and answer requests until stopped
    pub async fn start(port: u16, certificate_der: &[u8]) -> Result<Self> {
        let socket = UdpSocket::bind(SocketAddr::from(([0, 0, 0, 0], port)))
            .await
            .with_context(|| format!("Failed to bind certificate responder on UDP port {}", port))?;
        let local_addr = socket.local_addr()?;
        let reply: Arc<[u8]> = STANDARD.encode(certificate_der).into_bytes().into();

        info!("Certificate responder listening on {}", local_addr);

        let handle = tokio::spawn(async move {
            let mut socket = Some(socket);
            loop {
                let active = match socket.take() {
                    Some(s) => s,
                    None => match UdpSocket::bind(local_addr).await {
                        Ok(s) => s,
                        Err(e) => {
                            error!("Failed to rebind certificate responder: {}", e);
                            sleep(REBIND_DELAY).await;
                            continue;
                        }
                    },
                };
                if let Err(e) = serve(&active, &reply).await {
                    warn!("Certificate responder error, restarting: {}", e);
                    drop(active);
                    sleep(REBIND_DELAY).await;
                }
            }
        });

        Ok(Self { handle, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.handle.abort();
        debug!("Certificate responder stopped");
    }
}

impl Drop for CertificateResponder {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn serve(socket: &UdpSocket, reply: &[u8]) -> Result<()> {
    let mut buf = [0u8; 64];
    let mut consecutive_errors = 0u32;
    loop {
        match socket.recv_from(&mut buf).await {
            Ok((len, peer)) => {
                consecutive_errors = 0;
                if &buf[..len] == REQUEST_TOKEN {
                    socket.send_to(reply, peer).await?;
                    debug!("Sent certificate ({} bytes) to {}", reply.len(), peer);
                } else {
                    debug!("Ignoring unknown {}-byte datagram from {}", len, peer);
                }
            }
            // Some platforms surface ICMP errors from earlier replies here
            Err(e) if consecutive_errors < 8 => {
                consecutive_errors += 1;
                debug!("Transient certificate responder error: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Ask `address:port` for its certificate and store it as the trusted
/// certificate of `remote_id`
pub async fn receive_certificate(
    address: IpAddr,
    port: u16,
    remote_id: &str,
    store: &CertificateStore,
    policy: FetchPolicy,
) -> Result<()> {
    let der = fetch_certificate(SocketAddr::new(address, port), policy).await?;
    store
        .save_remote(remote_id, &der)
        .with_context(|| format!("Failed to store certificate of {}", remote_id))?;
    info!("Certificate for {} received and saved", remote_id);
    Ok(())
}

/// Request a certificate from `target`, accepting only a reply that comes
/// from `target` itself
pub async fn fetch_certificate(target: SocketAddr, policy: FetchPolicy) -> Result<Vec<u8>> {
    let bind: SocketAddr = match target {
        SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
        SocketAddr::V6(_) => "[::]:0".parse()?,
    };
    let socket = UdpSocket::bind(bind).await.context("Failed to bind bootstrap client socket")?;
    let mut buf = vec![0u8; MAX_DATAGRAM];

    for attempt in 1..=policy.attempts {
        debug!("Requesting certificate from {}, attempt {}", target, attempt);
        match request_once(&socket, target, &mut buf, policy.receive_timeout).await {
            Ok(der) => return Ok(der),
            Err(e) => {
                debug!("Certificate request {} to {} failed: {}", attempt, target, e);
                if attempt < policy.attempts {
                    sleep(policy.backoff).await;
                }
            }
        }
    }

    error!("Failed to receive certificate from {}", target);
    Err(anyhow!(
        "No certificate from {} after {} attempts",
        target,
        policy.attempts
    ))
}

async fn request_once(
    socket: &UdpSocket,
    target: SocketAddr,
    buf: &mut [u8],
    receive_timeout: Duration,
) -> Result<Vec<u8>> {
    socket.send_to(REQUEST_TOKEN, target).await?;
    let (len, from) = timeout(receive_timeout, socket.recv_from(buf))
        .await
        .map_err(|_| anyhow!("timed out"))??;
    if from != target {
        return Err(anyhow!("reply came from {} instead of {}", from, target));
    }
    let text = std::str::from_utf8(&buf[..len]).context("reply is not text")?;
    STANDARD.decode(text.trim()).context("reply is not base64")
}
