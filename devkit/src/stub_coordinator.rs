/*!
Scripted coordinator for agent-side tests.

Listens on an ephemeral localhost port, accepts any number of streams and
answers heartbeats from a directive script. Everything it receives is kept
for assertions.
*/

use crate::test_utils::wait_until;
use anyhow::Result;
use nexus_protocol::{read_frame, write_frame, CommandResponse, Heartbeat, StreamOpen};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::{JoinHandle, JoinSet};

/// Behavior of a `StubCoordinator`.
#[derive(Debug, Clone)]
pub struct StubOptions {
    /// `close_active_game` per heartbeat, indexed over all streams.
    /// Heartbeats past the end get `false`.
    pub directives: Vec<bool>,
    /// Drop each stream after answering this many heartbeats.
    pub close_after: Option<usize>,
    /// When false, heartbeats are recorded but never answered.
    pub respond: bool,
}

impl Default for StubOptions {
    fn default() -> Self {
        Self {
            directives: Vec::new(),
            close_after: None,
            respond: true,
        }
    }
}

#[derive(Default)]
struct Recorded {
    opens: Mutex<Vec<StreamOpen>>,
    heartbeats: Mutex<Vec<Heartbeat>>,
    connections: AtomicUsize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct StubCoordinator {
    addr: SocketAddr,
    recorded: Arc<Recorded>,
    task: JoinHandle<()>,
}

impl StubCoordinator {
    /// Answers heartbeats with `directives`, then with no-ops.
    pub async fn start(directives: Vec<bool>) -> Result<Self> {
        Self::start_with(StubOptions {
            directives,
            ..StubOptions::default()
        })
        .await
    }

    pub async fn start_with(options: StubOptions) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let recorded = Arc::new(Recorded::default());
        let options = Arc::new(options);

        let state = Arc::clone(&recorded);
        let task = tokio::spawn(async move {
            let mut streams = JoinSet::new();
            loop {
                match listener.accept().await {
                    Ok((socket, peer)) => {
                        state.connections.fetch_add(1, Ordering::SeqCst);
                        tracing::debug!(%peer, "stub coordinator accepted stream");
                        streams.spawn(serve_stream(socket, Arc::clone(&state), Arc::clone(&options)));
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, "stub coordinator accept failed");
                        tokio::time::sleep(Duration::from_millis(10)).await;
                    }
                }
            }
        });

        Ok(Self { addr, recorded, task })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn connections(&self) -> usize {
        self.recorded.connections.load(Ordering::SeqCst)
    }

    pub fn opens(&self) -> Vec<StreamOpen> {
        lock(&self.recorded.opens).clone()
    }

    pub fn heartbeats(&self) -> Vec<Heartbeat> {
        lock(&self.recorded.heartbeats).clone()
    }

    pub async fn wait_for_heartbeats(&self, count: usize, timeout: Duration) -> bool {
        let recorded = Arc::clone(&self.recorded);
        wait_until(timeout, || {
            let recorded = Arc::clone(&recorded);
            async move { lock(&recorded.heartbeats).len() >= count }
        })
        .await
    }

    pub async fn wait_for_connections(&self, count: usize, timeout: Duration) -> bool {
        let recorded = Arc::clone(&self.recorded);
        wait_until(timeout, || {
            let recorded = Arc::clone(&recorded);
            async move { recorded.connections.load(Ordering::SeqCst) >= count }
        })
        .await
    }

    /// Stops accepting and drops every open stream.
    pub fn shutdown(&self) {
        self.task.abort();
    }
}

impl Drop for StubCoordinator {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stream(mut socket: TcpStream, recorded: Arc<Recorded>, options: Arc<StubOptions>) {
    let open: StreamOpen = match read_frame(&mut socket).await {
        Ok(Some(open)) => open,
        _ => return,
    };
    lock(&recorded.opens).push(open);

    let mut answered = 0usize;
    loop {
        let heartbeat: Heartbeat = match read_frame(&mut socket).await {
            Ok(Some(heartbeat)) => heartbeat,
            _ => return,
        };

        let index = {
            let mut heartbeats = lock(&recorded.heartbeats);
            heartbeats.push(heartbeat);
            heartbeats.len() - 1
        };
        if !options.respond {
            continue;
        }

        let close = options.directives.get(index).copied().unwrap_or(false);
        let response = CommandResponse {
            close_active_game: close,
        };
        if write_frame(&mut socket, &response).await.is_err() {
            return;
        }

        answered += 1;
        if options.close_after.is_some_and(|limit| answered >= limit) {
            return;
        }
    }
}
