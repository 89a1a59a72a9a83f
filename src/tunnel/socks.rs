//! SOCKS5 listener bridging local clients onto SSH channels
//!
//! Each tunnel runs one local SOCKS5 proxy server. For every accepted
//! connection the listener performs the SOCKS5 handshake, opens a
//! direct-tcpip channel through the SSH session to the requested
//! destination, and bridges bytes in both directions.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use russh::client;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::error::TunnelError;

/// SOCKS5 protocol constants
mod v5 {
    pub const VERSION: u8 = 0x05;
    pub const AUTH_NONE: u8 = 0x00;
    pub const AUTH_UNACCEPTABLE: u8 = 0xFF;
    pub const CMD_CONNECT: u8 = 0x01;
    pub const ATYP_IPV4: u8 = 0x01;
    pub const ATYP_DOMAIN: u8 = 0x03;
    pub const ATYP_IPV6: u8 = 0x04;
    pub const REP_SUCCESS: u8 = 0x00;
    pub const REP_HOST_UNREACHABLE: u8 = 0x04;
    pub const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
    pub const REP_ADDR_NOT_SUPPORTED: u8 = 0x08;
}

/// How often the listener polls the SSH session for silent death.
const SESSION_WATCH_INTERVAL: Duration = Duration::from_secs(5);

/// Bound on how long teardown waits for the listener to release its port.
const SHUTDOWN_WAIT: Duration = Duration::from_secs(5);

/// Handle to a running SOCKS5 listener.
///
/// The listener task owns the SSH session; stopping the handle closes both
/// the local port and the underlying connection.
pub(crate) struct ListenerHandle {
    running: Arc<AtomicBool>,
    stop_tx: mpsc::Sender<()>,
    closed_rx: oneshot::Receiver<()>,
}

impl ListenerHandle {
    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Stop the listener and wait until it has released the port and closed
    /// the SSH connection, so the port can be rebound immediately after.
    pub(crate) async fn stop(self) {
        self.running.store(false, Ordering::SeqCst);
        let _ = self.stop_tx.send(()).await;
        if tokio::time::timeout(SHUTDOWN_WAIT, self.closed_rx)
            .await
            .is_err()
        {
            warn!("timed out waiting for SOCKS5 listener shutdown");
        }
    }

    /// Handle wired to nothing, for registry tests.
    #[cfg(test)]
    pub(crate) fn stub() -> Self {
        let (stop_tx, _stop_rx) = mpsc::channel(1);
        let (closed_tx, closed_rx) = oneshot::channel();
        drop(closed_tx);
        Self {
            running: Arc::new(AtomicBool::new(true)),
            stop_tx,
            closed_rx,
        }
    }
}

/// Bind a SOCKS5 listener on `0.0.0.0:<port>` and spawn its accept loop on
/// top of an authenticated SSH session.
pub(crate) async fn spawn_socks_listener<H>(
    session: client::Handle<H>,
    port: u16,
) -> Result<(ListenerHandle, SocketAddr), TunnelError>
where
    H: client::Handler + 'static,
{
    let listener = TcpListener::bind(("0.0.0.0", port))
        .await
        .map_err(|e| TunnelError::Transport(format!("failed to bind port {port}: {e}")))?;
    let bound_addr = listener
        .local_addr()
        .map_err(|e| TunnelError::Transport(format!("failed to read bound address: {e}")))?;

    info!("SOCKS5 listener started on {}", bound_addr);

    let session = Arc::new(session);
    let running = Arc::new(AtomicBool::new(true));
    let running_task = running.clone();
    let (stop_tx, mut stop_rx) = mpsc::channel::<()>(1);
    let (closed_tx, closed_rx) = oneshot::channel::<()>();

    tokio::spawn(async move {
        let mut watch = tokio::time::interval(SESSION_WATCH_INTERVAL);
        loop {
            tokio::select! {
                _ = stop_rx.recv() => {
                    debug!("SOCKS5 listener on {} stopped by request", bound_addr);
                    break;
                }
                _ = watch.tick() => {
                    if session.is_closed() {
                        warn!("SSH session behind {} died, stopping listener", bound_addr);
                        break;
                    }
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, peer)) => {
                            if !running_task.load(Ordering::SeqCst) {
                                break;
                            }
                            let session = session.clone();
                            tokio::spawn(async move {
                                if let Err(e) = handle_connection(session, stream, peer).await {
                                    debug!("SOCKS5 connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            warn!("SOCKS5 accept error on {}: {}", bound_addr, e);
                            tokio::time::sleep(Duration::from_millis(100)).await;
                        }
                    }
                }
            }
        }

        running_task.store(false, Ordering::SeqCst);
        drop(listener);
        let _ = session
            .disconnect(russh::Disconnect::ByApplication, "", "en")
            .await;
        let _ = closed_tx.send(());
        debug!("SOCKS5 listener on {} exited", bound_addr);
    });

    Ok((
        ListenerHandle {
            running,
            stop_tx,
            closed_rx,
        },
        bound_addr,
    ))
}

/// Serve one SOCKS5 client: handshake, open the SSH channel, bridge.
async fn handle_connection<H>(
    session: Arc<client::Handle<H>>,
    mut stream: TcpStream,
    peer: SocketAddr,
) -> Result<(), TunnelError>
where
    H: client::Handler + 'static,
{
    // Nagle hurts interactive SOCKS traffic.
    if let Err(e) = stream.set_nodelay(true) {
        debug!("failed to set TCP_NODELAY: {}", e);
    }

    let (dest_host, dest_port) = negotiate(&mut stream).await?;

    let channel = match session
        .channel_open_direct_tcpip(
            &dest_host,
            dest_port as u32,
            &peer.ip().to_string(),
            peer.port() as u32,
        )
        .await
    {
        Ok(ch) => ch,
        Err(e) => {
            send_reply(&mut stream, v5::REP_HOST_UNREACHABLE).await?;
            return Err(TunnelError::from(e));
        }
    };

    send_reply(&mut stream, v5::REP_SUCCESS).await?;
    debug!("SOCKS5 tunnel open to {}:{}", dest_host, dest_port);

    let mut ssh_stream = channel.into_stream();
    let _ = tokio::io::copy_bidirectional(&mut stream, &mut ssh_stream).await;
    Ok(())
}

/// Run the SOCKS5 greeting and request phases, returning the requested
/// destination. Generic over the stream so the framing is testable.
async fn negotiate<S>(stream: &mut S) -> Result<(String, u16), TunnelError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut buf = [0u8; 262];

    // Greeting: version + offered auth methods.
    stream.read_exact(&mut buf[..2]).await?;
    if buf[0] != v5::VERSION {
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS version {}",
            buf[0]
        )));
    }
    let nmethods = buf[1] as usize;
    stream.read_exact(&mut buf[..nmethods]).await?;
    if !buf[..nmethods].contains(&v5::AUTH_NONE) {
        stream
            .write_all(&[v5::VERSION, v5::AUTH_UNACCEPTABLE])
            .await?;
        return Err(TunnelError::Protocol(
            "client refused NO AUTH method".into(),
        ));
    }
    stream.write_all(&[v5::VERSION, v5::AUTH_NONE]).await?;

    // Request: version, command, reserved, address type.
    stream.read_exact(&mut buf[..4]).await?;
    if buf[0] != v5::VERSION {
        return Err(TunnelError::Protocol("bad version in request".into()));
    }
    if buf[1] != v5::CMD_CONNECT {
        send_reply(stream, v5::REP_CMD_NOT_SUPPORTED).await?;
        return Err(TunnelError::Protocol(format!(
            "unsupported SOCKS5 command {}",
            buf[1]
        )));
    }

    let dest = match buf[3] {
        v5::ATYP_IPV4 => {
            stream.read_exact(&mut buf[..6]).await?;
            let ip = std::net::Ipv4Addr::new(buf[0], buf[1], buf[2], buf[3]);
            let port = u16::from_be_bytes([buf[4], buf[5]]);
            (ip.to_string(), port)
        }
        v5::ATYP_DOMAIN => {
            stream.read_exact(&mut buf[..1]).await?;
            let len = buf[0] as usize;
            stream.read_exact(&mut buf[..len + 2]).await?;
            let host = String::from_utf8_lossy(&buf[..len]).into_owned();
            let port = u16::from_be_bytes([buf[len], buf[len + 1]]);
            (host, port)
        }
        v5::ATYP_IPV6 => {
            stream.read_exact(&mut buf[..18]).await?;
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&buf[..16]);
            let ip = std::net::Ipv6Addr::from(octets);
            let port = u16::from_be_bytes([buf[16], buf[17]]);
            (ip.to_string(), port)
        }
        other => {
            send_reply(stream, v5::REP_ADDR_NOT_SUPPORTED).await?;
            return Err(TunnelError::Protocol(format!(
                "unsupported address type {other}"
            )));
        }
    };

    Ok(dest)
}

/// Send a SOCKS5 reply with a 0.0.0.0:0 bound address.
async fn send_reply<S>(stream: &mut S, status: u8) -> Result<(), TunnelError>
where
    S: AsyncWrite + Unpin,
{
    let reply = [
        v5::VERSION,
        status,
        0x00,
        v5::ATYP_IPV4,
        0,
        0,
        0,
        0,
        0,
        0,
    ];
    stream.write_all(&reply).await?;
    Ok(())
}
