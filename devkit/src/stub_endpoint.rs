/*!
Stub endpoint speaking the session stream protocol.

Opens a stream like a real agent would, then sends one report per call and
returns the directive the coordinator answered with.
*/

use nexus_protocol::{read_frame, write_frame, CommandResponse, Heartbeat, ProtocolError, StreamOpen};
use serde::Serialize;
use std::net::SocketAddr;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;

pub struct StubEndpoint {
    pc_id: String,
    stream: TcpStream,
    reports_sent: usize,
}

impl StubEndpoint {
    /// Connects and sends the standard `StreamOpen` preamble.
    pub async fn connect(addr: SocketAddr, pc_id: &str) -> Result<Self, ProtocolError> {
        Self::connect_with(addr, pc_id, StreamOpen::stream_session()).await
    }

    /// Connects with a custom preamble, for negotiation tests.
    pub async fn connect_with(
        addr: SocketAddr,
        pc_id: &str,
        open: StreamOpen,
    ) -> Result<Self, ProtocolError> {
        let mut stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        write_frame(&mut stream, &open).await?;
        tracing::debug!(pc_id, %addr, "stub endpoint connected");

        Ok(Self {
            pc_id: pc_id.to_string(),
            stream,
            reports_sent: 0,
        })
    }

    pub fn pc_id(&self) -> &str {
        &self.pc_id
    }

    pub fn reports_sent(&self) -> usize {
        self.reports_sent
    }

    /// Sends one report for `label` and waits for its directive.
    pub async fn report(&mut self, label: &str) -> Result<CommandResponse, ProtocolError> {
        let heartbeat = Heartbeat::new(self.pc_id.clone(), label, chrono::Utc::now().timestamp());
        self.report_raw(&heartbeat).await
    }

    /// Sends a prebuilt heartbeat, e.g. one carrying another endpoint id.
    pub async fn report_raw(&mut self, heartbeat: &Heartbeat) -> Result<CommandResponse, ProtocolError> {
        write_frame(&mut self.stream, heartbeat).await?;
        self.reports_sent += 1;
        self.next_response().await
    }

    /// Sends any serializable value as one frame without waiting.
    pub async fn send_frame<T: Serialize>(&mut self, value: &T) -> Result<(), ProtocolError> {
        write_frame(&mut self.stream, value).await
    }

    /// Writes raw bytes, bypassing framing.
    pub async fn send_bytes(&mut self, bytes: &[u8]) -> Result<(), ProtocolError> {
        self.stream.write_all(bytes).await?;
        self.stream.flush().await?;
        Ok(())
    }

    /// Reads the next directive. A closed stream is `UnexpectedEof`.
    pub async fn next_response(&mut self) -> Result<CommandResponse, ProtocolError> {
        read_frame(&mut self.stream)
            .await?
            .ok_or(ProtocolError::UnexpectedEof)
    }

    /// Waits for the coordinator to close the stream, returning true on a
    /// clean EOF.
    pub async fn expect_closed(&mut self) -> bool {
        matches!(
            read_frame::<_, serde_json::Value>(&mut self.stream).await,
            Ok(None) | Err(ProtocolError::Io(_)) | Err(ProtocolError::UnexpectedEof)
        )
    }

    pub async fn close(mut self) {
        let _ = self.stream.shutdown().await;
    }
}
