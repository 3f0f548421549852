//! Coordinator discovery
//!
//! This module handles:
//! - Listening for the coordinator's UDP beacon with a bounded wait
//! - Choosing the stream target: manual address, discovered address, or
//!   the localhost fallback

use crate::config::{AgentConfig, DiscoveryConfig};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Waits for a beacon and returns `sender_ip:service_port`.
/// Bind failure and timeout both mean "not found".
pub async fn discover_coordinator(cfg: &DiscoveryConfig, service_port: u16) -> Option<SocketAddr> {
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, cfg.port)).await {
        Ok(socket) => socket,
        Err(e) => {
            warn!(port = cfg.port, error = %e, "cannot listen for discovery beacon");
            return None;
        }
    };
    listen_for_beacon(&socket, &cfg.magic, Duration::from_secs(cfg.timeout_secs), service_port).await
}

async fn listen_for_beacon(
    socket: &UdpSocket,
    magic: &str,
    wait: Duration,
    service_port: u16,
) -> Option<SocketAddr> {
    let deadline = Instant::now() + wait;
    let mut buf = [0u8; 512];

    loop {
        let (len, sender) = match timeout_at(deadline, socket.recv_from(&mut buf)).await {
            Err(_) => {
                debug!("no discovery beacon before timeout");
                return None;
            }
            Ok(Err(e)) => {
                warn!(error = %e, "discovery receive failed");
                return None;
            }
            Ok(Ok(received)) => received,
        };

        let payload = String::from_utf8_lossy(&buf[..len]);
        if payload.trim() != magic {
            debug!(%sender, "ignoring unrelated datagram");
            continue;
        }

        // IPv4 only, so reconnects always pick the same address family
        let IpAddr::V4(ip) = sender.ip() else {
            continue;
        };
        let found = SocketAddr::new(IpAddr::V4(ip), service_port);
        info!(coordinator = %found, "coordinator discovered");
        return Some(found);
    }
}

/// Stream target for this reconnect cycle.
pub async fn resolve_target(cfg: &AgentConfig) -> String {
    if let Some(manual) = cfg.coordinator.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        return manual.to_string();
    }

    match discover_coordinator(&cfg.discovery, cfg.service_port).await {
        Some(addr) => addr.to_string(),
        None => {
            let fallback = format!("localhost:{}", cfg.service_port);
            info!(target = %fallback, "discovery found nothing, using fallback");
            fallback
        }
    }
}
