//! TCP reachability probe, run before opening a Modbus/framed session over
//! IP (spec.md §4.1): cheaper than letting the framed client's own timeout
//! fire, and gives a measured RTT worth logging.

use std::net::SocketAddr;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::time::timeout;

#[derive(Debug, Clone, Copy)]
pub struct ProbeResult {
    pub reachable: bool,
    pub rtt: Duration,
}

/// Attempts a bare TCP connect to `addr`, bounded by `connect_timeout`.
/// Returns the measured round-trip time regardless of outcome so callers
/// can log it even on failure.
pub async fn probe_tcp(addr: SocketAddr, connect_timeout: Duration) -> ProbeResult {
    let started = Instant::now();
    let outcome = timeout(connect_timeout, TcpStream::connect(addr)).await;
    let rtt = started.elapsed();

    match outcome {
        Ok(Ok(stream)) => {
            drop(stream);
            ProbeResult { reachable: true, rtt }
        }
        _ => ProbeResult { reachable: false, rtt },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_port_reports_unreachable() {
        // Port 1 is a reserved, virtually never-bound port on loopback.
        let addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let result = probe_tcp(addr, Duration::from_millis(200)).await;
        assert!(!result.reachable);
    }
}
