//! LAN discovery beacon
//!
//! Broadcasts the magic string over UDP so agents without a configured
//! address can find the coordinator. The sender's IP is the answer, the
//! service port is fixed.

use crate::config::DiscoveryConf;
use if_addrs::{get_if_addrs, IfAddr};
use std::collections::BTreeSet;
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Running beacon. Must be handed back to `stop` at shutdown.
pub struct DiscoveryHandle {
    stop_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

impl DiscoveryHandle {
    pub async fn stop(self) {
        let _ = self.stop_tx.send(());
        if let Err(e) = self.task.await {
            warn!(error = %e, "discovery beacon task failed");
        }
        info!("discovery beacon stopped");
    }
}

pub async fn start_discovery(cfg: &DiscoveryConf) -> io::Result<DiscoveryHandle> {
    let socket = UdpSocket::bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;

    let targets = broadcast_targets(cfg.port);
    info!(
        port = cfg.port,
        interval_secs = cfg.interval_secs,
        targets = targets.len(),
        "discovery beacon started"
    );

    Ok(spawn_beacon(
        socket,
        targets,
        cfg.magic.clone(),
        Duration::from_secs(cfg.interval_secs),
    ))
}

/// Limited broadcast plus every IPv4 interface broadcast address.
pub fn broadcast_targets(port: u16) -> Vec<SocketAddr> {
    let mut addrs = BTreeSet::new();
    addrs.insert(Ipv4Addr::BROADCAST);

    match get_if_addrs() {
        Ok(interfaces) => {
            for iface in interfaces.iter().filter(|i| !i.is_loopback()) {
                if let IfAddr::V4(v4) = &iface.addr {
                    if let Some(broadcast) = v4.broadcast {
                        debug!(interface = %iface.name, %broadcast, "beacon target");
                        addrs.insert(broadcast);
                    }
                }
            }
        }
        Err(e) => warn!(error = %e, "failed to enumerate interfaces, using limited broadcast only"),
    }

    addrs
        .into_iter()
        .map(|ip| SocketAddr::V4(SocketAddrV4::new(ip, port)))
        .collect()
}

fn spawn_beacon(
    socket: UdpSocket,
    targets: Vec<SocketAddr>,
    magic: String,
    every: Duration,
) -> DiscoveryHandle {
    let (stop_tx, mut stop_rx) = oneshot::channel();

    let task = tokio::spawn(async move {
        let mut ticker = tokio::time::interval(every);
        loop {
            tokio::select! {
                _ = &mut stop_rx => break,
                _ = ticker.tick() => {
                    for target in &targets {
                        if let Err(e) = socket.send_to(magic.as_bytes(), *target).await {
                            // retried next tick
                            debug!(%target, error = %e, "beacon send failed");
                        }
                    }
                }
            }
        }
    });

    DiscoveryHandle { stop_tx, task }
}
