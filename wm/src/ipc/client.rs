//! Debug-channel client used by the command-line tools

use std::path::PathBuf;
use std::time::Duration;

use eyre::{Context, Result};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tracing::debug;

use crate::dispatch::EOD;
use crate::error::ErrorCode;
use crate::protocol::{Args, Packet, PacketKind};

/// Default timeout for a round-trip
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Sends one request at a time and waits for its reply
#[derive(Debug, Clone)]
pub struct DebugClient {
    socket_path: PathBuf,
    timeout: Duration,
}

impl DebugClient {
    pub fn with_socket_path(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn socket_exists(&self) -> bool {
        self.socket_path.exists()
    }

    /// Send `cmd` and return the reply arguments. A negative `ret` is an error.
    pub async fn request(&self, cmd: &str, args: Args) -> Result<Args> {
        debug!(socket = ?self.socket_path, %cmd, "DebugClient::request: called");
        let stream = tokio::time::timeout(self.timeout, UnixStream::connect(&self.socket_path))
            .await
            .context("Connection timeout")?
            .context("Failed to connect to master socket")?;

        let reply = tokio::time::timeout(self.timeout, round_trip(stream, Packet::request(1, cmd, args)))
            .await
            .context("Request timeout")??;

        let ret = reply.ret();
        if ret < 0 {
            let reason = ErrorCode::from_code(ret).map_or_else(|| format!("error {ret}"), |e| e.to_string());
            return Err(eyre::eyre!("{} failed: {}", cmd, reason));
        }
        Ok(reply)
    }

    /// Run a listing verb and parse its records
    pub async fn listing(&self, cmd: &str, args: Args) -> Result<Vec<Value>> {
        let reply = self.request(cmd, args).await?;
        let text = reply.str(1).map_err(|_| eyre::eyre!("{} returned no listing", cmd))?;
        parse_listing(text)
    }
}

async fn round_trip(mut stream: UnixStream, request: Packet) -> Result<Args> {
    let line = request.to_line().map_err(|e| eyre::eyre!("Cannot encode request: {}", e))?;
    stream.write_all(line.as_bytes()).await.context("Failed to write request")?;
    stream.flush().await.context("Failed to flush request")?;

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await.context("Failed to read reply")? {
        let packet = Packet::from_line(&line).map_err(|e| eyre::eyre!("Bad reply: {}", e))?;
        if packet.kind == PacketKind::Reply && packet.seq == request.seq {
            return Ok(packet.args);
        }
        debug!(cmd = %packet.cmd, "round_trip: skipping unrelated packet");
    }
    Err(eyre::eyre!("Connection closed before reply"))
}

/// Records up to the terminating `EOD` line
pub fn parse_listing(text: &str) -> Result<Vec<Value>> {
    let mut rows = Vec::new();
    for line in text.lines() {
        if line == EOD {
            return Ok(rows);
        }
        rows.push(serde_json::from_str(line).context("Malformed listing record")?);
    }
    Err(eyre::eyre!("Listing not terminated"))
}
