/**
 * STREAM SERVER - Long-lived report/directive streams from endpoints
 *
 * ROLE :
 * Accepts agent connections on the service port and pairs every heartbeat
 * with exactly one directive.
 *
 * HOW IT WORKS :
 * - One tokio task per accepted connection
 * - First frame must be a valid `StreamOpen`, otherwise the stream is closed
 * - Then: read heartbeat -> `FleetStore::apply_report` -> write directive
 * - Error, EOF or silence longer than the idle timeout ends the stream and
 *   finalizes the endpoint through `FleetStore::disconnect`
 */

use crate::fleet::{ConnectionId, FleetStore};
use crate::health::HealthTracker;
use nexus_protocol::{read_frame, write_frame, Heartbeat, ProtocolError, StreamOpen};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::time::timeout;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy)]
pub struct StreamSettings {
    pub idle_timeout: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no frame received for {0:?}")]
    IdleTimeout(Duration),
    #[error("stream closed before the StreamOpen preamble")]
    ClosedBeforeOpen,
}

/// Accept loop. Runs until the task is dropped.
pub async fn serve(
    listener: TcpListener,
    fleet: Arc<FleetStore>,
    health: HealthTracker,
    settings: StreamSettings,
) {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "stream server listening");
    }

    loop {
        let (socket, peer) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                warn!(error = %e, "accept failed");
                tokio::time::sleep(Duration::from_millis(100)).await;
                continue;
            }
        };
        if let Err(e) = socket.set_nodelay(true) {
            debug!(%peer, error = %e, "could not disable nagle");
        }

        let fleet = Arc::clone(&fleet);
        let health = health.clone();
        tokio::spawn(async move {
            handle_stream(socket, peer, fleet, health, settings).await;
        });
    }
}

pub async fn handle_stream<S>(
    mut stream: S,
    peer: SocketAddr,
    fleet: Arc<FleetStore>,
    health: HealthTracker,
    settings: StreamSettings,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let conn = fleet.attach();
    health.stream_opened();
    debug!(%peer, conn, "stream accepted");

    let mut endpoint: Option<String> = None;
    let result = run_stream(&mut stream, conn, &fleet, &health, settings, &mut endpoint).await;

    match &result {
        Ok(()) => info!(%peer, endpoint = ?endpoint, "stream closed by endpoint"),
        Err(e) => warn!(%peer, endpoint = ?endpoint, error = %e, "stream ended"),
    }

    if let Some(id) = endpoint {
        fleet.disconnect(&id, conn);
    }
    health.stream_closed();
}

async fn run_stream<S>(
    stream: &mut S,
    conn: ConnectionId,
    fleet: &FleetStore,
    health: &HealthTracker,
    settings: StreamSettings,
    endpoint: &mut Option<String>,
) -> Result<(), StreamError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let open: StreamOpen = timeout(settings.idle_timeout, read_frame(stream))
        .await
        .map_err(|_| StreamError::IdleTimeout(settings.idle_timeout))??
        .ok_or(StreamError::ClosedBeforeOpen)?;
    open.validate()?;

    loop {
        let frame: Option<Heartbeat> = timeout(settings.idle_timeout, read_frame(stream))
            .await
            .map_err(|_| StreamError::IdleTimeout(settings.idle_timeout))??;
        let Some(report) = frame else {
            return Ok(());
        };

        track_endpoint(fleet, conn, endpoint, &report);
        let response = fleet.apply_report(conn, &report);
        health.report_handled();

        let sent = timeout(settings.idle_timeout, write_frame(stream, &response))
            .await
            .map_err(|_| StreamError::IdleTimeout(settings.idle_timeout))
            .and_then(|r| r.map_err(StreamError::from));
        if let Err(e) = sent {
            if response.close_active_game {
                warn!(endpoint = ?endpoint, "kill directive lost with the stream");
            }
            return Err(e);
        }
    }
}

/// Remembers which endpoint this stream speaks for. A stream that switches
/// ids releases the previous endpoint.
fn track_endpoint(fleet: &FleetStore, conn: ConnectionId, endpoint: &mut Option<String>, report: &Heartbeat) {
    let id = report.pc_id.trim();
    if id.is_empty() {
        return;
    }
    match endpoint.as_deref() {
        Some(current) if current == id => {}
        Some(previous) => {
            info!(previous, next = id, "stream changed endpoint id");
            fleet.disconnect(previous, conn);
            *endpoint = Some(id.to_string());
        }
        None => {
            info!(endpoint = id, conn, "endpoint connected");
            *endpoint = Some(id.to_string());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemorySessionStore;
    use nexus_devkit::{init_test_logging, wait_until, StubEndpoint};
    use nexus_protocol::PROTOCOL_VERSION;

    struct Harness {
        addr: SocketAddr,
        fleet: Arc<FleetStore>,
        store: Arc<MemorySessionStore>,
        health: HealthTracker,
        server: tokio::task::JoinHandle<()>,
    }

    impl Drop for Harness {
        fn drop(&mut self) {
            self.server.abort();
        }
    }

    async fn start(idle_timeout: Duration) -> Harness {
        init_test_logging();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store = Arc::new(MemorySessionStore::new());
        let fleet = Arc::new(FleetStore::new(store.clone(), 50_000));
        let health = HealthTracker::new();
        let server = tokio::spawn(serve(
            listener,
            Arc::clone(&fleet),
            health.clone(),
            StreamSettings { idle_timeout },
        ));
        Harness {
            addr,
            fleet,
            store,
            health,
            server,
        }
    }

    async fn disconnected(fleet: &Arc<FleetStore>) -> bool {
        let fleet = Arc::clone(fleet);
        wait_until(Duration::from_secs(2), move || {
            let fleet = Arc::clone(&fleet);
            async move { fleet.connected_count() == 0 }
        })
        .await
    }

    #[tokio::test]
    async fn test_every_report_gets_a_directive() {
        let h = start(Duration::from_secs(5)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();

        for label in ["Idle", "cs2.exe", "cs2.exe", "Idle"] {
            let response = endpoint.report(label).await.unwrap();
            assert!(!response.close_active_game);
        }

        let sessions = h.store.all_sessions();
        assert_eq!(sessions.len(), 1);
        assert!(!sessions[0].is_active);
        assert_eq!(sessions[0].endpoint_id, endpoint.pc_id());
        assert_eq!(endpoint.reports_sent(), 4);
        assert_eq!(h.health.get_health(&h.fleet).reports_handled, 4);
    }

    #[tokio::test]
    async fn test_frame_of_wrong_shape_closes_stream() {
        let h = start(Duration::from_secs(5)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        endpoint.report("cs2.exe").await.unwrap();

        // a second preamble where a heartbeat belongs
        endpoint.send_frame(&StreamOpen::stream_session()).await.unwrap();
        assert!(endpoint.expect_closed().await);
        assert!(disconnected(&h.fleet).await);
        assert!(h.store.all_sessions().iter().all(|s| !s.is_active));
    }

    #[tokio::test]
    async fn test_kill_delivered_on_first_report_after_payment() {
        let h = start(Duration::from_secs(5)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        endpoint.report("cs2.exe").await.unwrap();

        let receipt = h.fleet.mark_paid("PC-01").unwrap();
        assert!(receipt.kill_requested);

        assert!(endpoint.report("cs2.exe").await.unwrap().close_active_game);
        assert!(!endpoint.report("Idle").await.unwrap().close_active_game);
        assert!(!endpoint.report("Idle").await.unwrap().close_active_game);
    }

    #[tokio::test]
    async fn test_eof_finalizes_session() {
        let h = start(Duration::from_secs(5)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        endpoint.report("cs2.exe").await.unwrap();
        assert_eq!(h.fleet.connected_count(), 1);

        endpoint.close().await;
        assert!(disconnected(&h.fleet).await);
        assert!(h.store.all_sessions().iter().all(|s| !s.is_active));
    }

    #[tokio::test]
    async fn test_idle_stream_is_dropped() {
        let h = start(Duration::from_millis(150)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        endpoint.report("cs2.exe").await.unwrap();

        assert!(disconnected(&h.fleet).await);
        assert!(endpoint.expect_closed().await);
        assert!(h.store.all_sessions().iter().all(|s| !s.is_active));
    }

    #[tokio::test]
    async fn test_bad_preamble_closes_stream() {
        let h = start(Duration::from_secs(5)).await;

        let wrong_method = StreamOpen {
            method: "Subscribe".into(),
            protocol_version: PROTOCOL_VERSION,
        };
        let mut endpoint = StubEndpoint::connect_with(h.addr, "PC-01", wrong_method).await.unwrap();
        assert!(endpoint.report("cs2.exe").await.is_err());

        let wrong_version = StreamOpen {
            method: nexus_protocol::STREAM_SESSION_METHOD.into(),
            protocol_version: PROTOCOL_VERSION + 1,
        };
        let mut endpoint = StubEndpoint::connect_with(h.addr, "PC-02", wrong_version).await.unwrap();
        assert!(endpoint.report("cs2.exe").await.is_err());

        assert_eq!(h.fleet.connected_count(), 0);
        assert!(h.store.all_sessions().is_empty());
    }

    #[tokio::test]
    async fn test_garbage_frame_ends_only_that_stream() {
        let h = start(Duration::from_secs(5)).await;
        let mut good = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        good.report("cs2.exe").await.unwrap();

        let mut bad = StubEndpoint::connect(h.addr, "PC-02").await.unwrap();
        bad.report("dota2.exe").await.unwrap();
        let mut junk = 5u32.to_be_bytes().to_vec();
        junk.extend_from_slice(b"{oops");
        bad.send_bytes(&junk).await.unwrap();
        assert!(bad.expect_closed().await);

        let fleet = Arc::clone(&h.fleet);
        assert!(
            wait_until(Duration::from_secs(2), move || {
                let fleet = Arc::clone(&fleet);
                async move { fleet.connected_count() == 1 }
            })
            .await
        );
        assert!(!good.report("cs2.exe").await.unwrap().close_active_game);
        assert!(h.fleet.endpoint_view("PC-01").unwrap().active_session_id.is_some());
    }

    #[tokio::test]
    async fn test_reconnect_is_not_evicted_by_old_stream() {
        let h = start(Duration::from_secs(5)).await;
        let mut old = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        old.report("cs2.exe").await.unwrap();

        let mut new = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        new.report("cs2.exe").await.unwrap();

        old.close().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.fleet.connected_count(), 1);
        assert!(h.store.all_sessions().iter().any(|s| s.is_active));

        new.close().await;
        assert!(disconnected(&h.fleet).await);
    }

    #[tokio::test]
    async fn test_endpoint_id_switch_releases_previous() {
        let h = start(Duration::from_secs(5)).await;
        let mut endpoint = StubEndpoint::connect(h.addr, "PC-01").await.unwrap();
        endpoint.report("cs2.exe").await.unwrap();

        let renamed = Heartbeat::new("PC-01B", "cs2.exe", 0);
        endpoint.report_raw(&renamed).await.unwrap();

        let snapshot = h.fleet.snapshot();
        let ids: Vec<&str> = snapshot.endpoints.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec!["PC-01B"]);
        let active: Vec<_> = h.store.all_sessions().into_iter().filter(|s| s.is_active).collect();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].endpoint_id, "PC-01B");
    }
}
