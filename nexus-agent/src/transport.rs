//! Session stream, agent side
//!
//! Opens the stream with the `StreamOpen` preamble, then on every polling
//! tick sends one heartbeat and waits for its directive. A kill directive is
//! handed to the terminator in the background so the next report is never
//! delayed.

use crate::execution::ProcessTerminator;
use crate::probe::ActivityProbe;
use chrono::Utc;
use nexus_protocol::{
    is_idle, normalize_label, read_frame, write_frame, CommandResponse, Heartbeat, ProtocolError,
    StreamOpen,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::time::{interval, timeout, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("connect to {target} timed out after {timeout:?}")]
    ConnectTimeout { target: String, timeout: Duration },
    #[error("connect to {target} failed: {source}")]
    Connect {
        target: String,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Protocol(#[from] ProtocolError),
    #[error("no directive within {0:?}")]
    ResponseTimeout(Duration),
    #[error("coordinator closed the stream")]
    Closed,
}

/// Time-bounded connect followed by the stream preamble.
pub async fn connect(target: &str, connect_timeout: Duration) -> Result<TcpStream, TransportError> {
    let mut stream = timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            target: target.to_string(),
            timeout: connect_timeout,
        })?
        .map_err(|source| TransportError::Connect {
            target: target.to_string(),
            source,
        })?;

    if let Err(e) = stream.set_nodelay(true) {
        debug!(error = %e, "could not disable nagle");
    }

    timeout(connect_timeout, write_frame(&mut stream, &StreamOpen::stream_session()))
        .await
        .map_err(|_| TransportError::ConnectTimeout {
            target: target.to_string(),
            timeout: connect_timeout,
        })??;

    info!(target, "stream opened");
    Ok(stream)
}

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub endpoint_id: String,
    pub poll_interval: Duration,
    pub response_timeout: Duration,
}

pub struct StreamSession {
    probe: Box<dyn ActivityProbe>,
    terminator: Arc<dyn ProcessTerminator>,
    settings: SessionSettings,
    reports_sent: u64,
}

impl StreamSession {
    pub fn new(
        probe: Box<dyn ActivityProbe>,
        terminator: Arc<dyn ProcessTerminator>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            probe,
            terminator,
            settings,
            reports_sent: 0,
        }
    }

    pub fn reports_sent(&self) -> u64 {
        self.reports_sent
    }

    /// Streams until the first send/receive failure and returns it.
    pub async fn run<S>(&mut self, stream: &mut S) -> TransportError
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let mut ticker = interval(self.settings.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.report_once(stream).await {
                return e;
            }
        }
    }

    async fn report_once<S>(&mut self, stream: &mut S) -> Result<(), TransportError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let label = normalize_label(&self.probe.sample());
        let heartbeat = Heartbeat::new(self.settings.endpoint_id.clone(), &label, Utc::now().timestamp());
        write_frame(stream, &heartbeat).await?;
        self.reports_sent += 1;

        let response: CommandResponse = timeout(self.settings.response_timeout, read_frame(stream))
            .await
            .map_err(|_| TransportError::ResponseTimeout(self.settings.response_timeout))??
            .ok_or(TransportError::Closed)?;

        if response.close_active_game {
            self.execute_kill(label);
        }
        Ok(())
    }

    fn execute_kill(&self, label: String) {
        if is_idle(&label) {
            info!("kill directive received while idle, nothing to close");
            return;
        }

        let terminator = Arc::clone(&self.terminator);
        tokio::spawn(async move {
            match terminator.terminate_by_label(&label).await {
                Ok(result) if result.success => info!(label = %label, "activity terminated"),
                Ok(result) => warn!(label = %label, exit_code = ?result.exit_code, output = %result.output.trim(), "terminate command failed"),
                Err(e) => warn!(label = %label, error = %e, "terminate failed"),
            }
        });
    }
}
