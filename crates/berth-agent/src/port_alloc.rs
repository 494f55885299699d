use std::io::ErrorKind;

use async_trait::async_trait;

#[async_trait]
pub trait PortProbe: Send + Sync {
    async fn is_port_available(&self, port: u16) -> bool;
}

/// Binds a throwaway listener on all interfaces; success means the port is free.
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpPortProbe;

#[async_trait]
impl PortProbe for TcpPortProbe {
    async fn is_port_available(&self, port: u16) -> bool {
        if port == 0 {
            return false;
        }
        match tokio::net::TcpListener::bind(("0.0.0.0", port)).await {
            Ok(l) => {
                drop(l);
                true
            }
            Err(e) if e.kind() == ErrorKind::AddrInUse => false,
            Err(e) => {
                tracing::debug!(port, error = %e, "port probe failed");
                false
            }
        }
    }
}

/// Lowest available port in `start..=max`, scanning upward.
pub async fn find_available_port(probe: &dyn PortProbe, start: u16, max: u16) -> Option<u16> {
    let start = start.max(1);
    if start > max {
        return None;
    }
    for port in start..=max {
        if probe.is_port_available(port).await {
            return Some(port);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use crate::test_support::FakePorts;

    use super::*;

    #[tokio::test]
    async fn picks_lowest_free_port_after_occupied_run() {
        let ports = FakePorts::occupied([5000, 5001, 5002]);
        assert_eq!(find_available_port(&ports, 5001, u16::MAX).await, Some(5003));
        assert_eq!(find_available_port(&ports, 4999, u16::MAX).await, Some(4999));
    }

    #[tokio::test]
    async fn exhausted_range_yields_none() {
        let ports = FakePorts::occupied(6000..=6010);
        assert_eq!(find_available_port(&ports, 6000, 6010).await, None);
        assert_eq!(find_available_port(&ports, 6000, 6011).await, Some(6011));
    }

    #[tokio::test]
    async fn inverted_range_yields_none() {
        let ports = FakePorts::default();
        assert_eq!(find_available_port(&ports, 7001, 7000).await, None);
    }

    #[tokio::test]
    async fn bound_socket_is_reported_unavailable() {
        let held = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
        let port = held.local_addr().unwrap().port();

        assert!(!TcpPortProbe.is_port_available(port).await);
        assert_eq!(find_available_port(&TcpPortProbe, port, port).await, None);
    }

    #[tokio::test]
    async fn port_zero_is_never_handed_out() {
        assert!(!TcpPortProbe.is_port_available(0).await);
    }
}
