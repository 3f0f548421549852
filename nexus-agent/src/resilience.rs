//! Reconnect loop
//!
//! Two states: `Disconnected` (resolve, connect, retry with a fixed backoff)
//! and `Streaming` (report until the stream fails). Retries are unbounded;
//! only process shutdown stops the agent.

use crate::config::AgentConfig;
use crate::discovery::resolve_target;
use crate::execution::ProcessTerminator;
use crate::probe::ActivityProbe;
use crate::transport::{connect, SessionSettings, StreamSession};
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Streaming,
}

#[derive(Debug, Clone, Copy)]
pub struct ReconnectPolicy {
    pub backoff: Duration,
}

/// Calls `attempt` until it succeeds, sleeping `backoff` after each failure.
/// N failures mean N+1 attempts.
pub async fn reconnect<T, E, F, Fut>(policy: &ReconnectPolicy, mut attempt: F) -> T
where
    F: FnMut(u64) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Display,
{
    let mut n = 0u64;
    loop {
        n += 1;
        match attempt(n).await {
            Ok(value) => {
                if n > 1 {
                    info!(attempts = n, "connected after retries");
                }
                return value;
            }
            Err(e) => {
                warn!(attempt = n, error = %e, backoff = ?policy.backoff, "connect failed, retrying");
                sleep(policy.backoff).await;
            }
        }
    }
}

pub struct Agent {
    config: AgentConfig,
    session: StreamSession,
    policy: ReconnectPolicy,
    state: ConnectionState,
}

impl Agent {
    pub fn new(
        config: AgentConfig,
        probe: Box<dyn ActivityProbe>,
        terminator: Arc<dyn ProcessTerminator>,
    ) -> Self {
        let settings = SessionSettings {
            endpoint_id: config.resolve_endpoint_id(),
            poll_interval: config.poll_interval(),
            response_timeout: config.response_timeout(),
        };
        let policy = ReconnectPolicy {
            backoff: config.reconnect_backoff(),
        };

        Self {
            session: StreamSession::new(probe, terminator, settings),
            config,
            policy,
            state: ConnectionState::Disconnected,
        }
    }

    #[cfg(test)]
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    fn set_state(&mut self, next: ConnectionState) {
        if self.state != next {
            debug!(from = ?self.state, to = ?next, "connection state changed");
            self.state = next;
        }
    }

    pub async fn run_forever(&mut self) {
        loop {
            self.run_cycle().await;
            sleep(self.policy.backoff).await;
        }
    }

    /// One Disconnected -> Streaming -> Disconnected round trip.
    async fn run_cycle(&mut self) {
        self.set_state(ConnectionState::Disconnected);

        let config = &self.config;
        let mut stream = reconnect(&self.policy, move |attempt| async move {
            let target = resolve_target(config).await;
            info!(target = %target, attempt, "connecting to coordinator");
            connect(&target, config.connect_timeout()).await
        })
        .await;

        self.set_state(ConnectionState::Streaming);
        let err = self.session.run(&mut stream).await;
        self.set_state(ConnectionState::Disconnected);
        warn!(error = %err, reports = self.session.reports_sent(), "stream lost, reconnecting");
    }
}
