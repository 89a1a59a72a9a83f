//! Network collaborators
//!
//! Free-port allocation, host address discovery, and the egress-IP probe
//! used to verify that a tunnel actually proxies traffic.

use std::io;
use std::net::{IpAddr, Ipv4Addr, TcpListener, UdpSocket};
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

const PRIMARY_IP_ENDPOINT: &str = "https://api.ipify.org";
const FALLBACK_IP_ENDPOINT: &str = "https://ip.seeip.org";

/// Ask the OS for a currently free TCP port.
pub fn free_port() -> io::Result<u16> {
    let listener = TcpListener::bind(("127.0.0.1", 0))?;
    Ok(listener.local_addr()?.port())
}

/// Best-effort LAN IPv4 of this host, used to render proxy addresses that
/// are reachable from other machines. Falls back to loopback.
pub fn local_ipv4() -> Ipv4Addr {
    // No packet is sent; connect() just makes the OS pick a source address.
    let probe = || -> io::Result<IpAddr> {
        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.connect(("8.8.8.8", 80))?;
        Ok(socket.local_addr()?.ip())
    };
    match probe() {
        Ok(IpAddr::V4(ip)) => ip,
        _ => Ipv4Addr::LOCALHOST,
    }
}

/// External IP lookup routed through a SOCKS5 proxy.
#[async_trait]
pub trait EgressProbe: Send + Sync {
    /// The address the outside world sees through `proxy_url`, or `None`
    /// when the proxy does not answer.
    async fn egress_ip(&self, proxy_url: &str) -> Option<String>;
}

/// Probe backed by public what-is-my-ip services, tried in order.
pub struct HttpEgressProbe {
    timeout: Duration,
}

impl HttpEgressProbe {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }
}

impl Default for HttpEgressProbe {
    fn default() -> Self {
        Self::new(Duration::from_secs(15))
    }
}

#[async_trait]
impl EgressProbe for HttpEgressProbe {
    async fn egress_ip(&self, proxy_url: &str) -> Option<String> {
        let proxy = reqwest::Proxy::all(proxy_url).ok()?;
        let client = reqwest::Client::builder()
            .proxy(proxy)
            .timeout(self.timeout)
            .build()
            .ok()?;

        for endpoint in [PRIMARY_IP_ENDPOINT, FALLBACK_IP_ENDPOINT] {
            match client.get(endpoint).send().await {
                Ok(resp) => {
                    if let Ok(body) = resp.text().await {
                        let ip = body.trim();
                        if ip.parse::<IpAddr>().is_ok() {
                            return Some(ip.to_string());
                        }
                        debug!("egress probe via {} returned junk", endpoint);
                    }
                }
                Err(e) => debug!("egress probe via {} failed: {}", endpoint, e),
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_port_is_bindable() {
        let port = free_port().unwrap();
        assert!(port > 0);
        // The port was released when the probe listener dropped.
        TcpListener::bind(("127.0.0.1", port)).unwrap();
    }

    #[test]
    fn local_ipv4_never_fails() {
        // Whatever the environment, we must get an address to render
        // proxy URLs with.
        let _ = local_ipv4();
    }
}
