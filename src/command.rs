//! Script channel to the robot's secondary interface
//!
//! Each command opens a fresh connection, writes the program followed by a
//! newline and closes. The controller sends nothing back that we read.

use crate::config::RobotConfig;
use crate::{Error, Result};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct CommandChannel {
    host: String,
    port: u16,
    connect_timeout: Duration,
    write_timeout: Duration,
}

impl CommandChannel {
    pub fn new(host: &str, port: u16, connect_timeout: Duration, write_timeout: Duration) -> Self {
        Self {
            host: host.to_string(),
            port,
            connect_timeout,
            write_timeout,
        }
    }

    pub fn from_config(config: &RobotConfig) -> Self {
        Self::new(
            &config.host,
            config.script_port,
            config.connect_timeout(),
            config.write_timeout(),
        )
    }

    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Send one program; returns once the bytes are handed to the socket
    pub async fn send(&self, script: &str) -> Result<()> {
        let endpoint = self.endpoint();

        let mut stream = timeout(self.connect_timeout, TcpStream::connect((self.host.as_str(), self.port)))
            .await
            .map_err(|_| Error::timeout(&endpoint, "connect"))?
            .map_err(|e| Error::transport(&endpoint, e))?;

        let mut payload = Vec::with_capacity(script.len() + 1);
        payload.extend_from_slice(script.as_bytes());
        payload.push(b'\n');

        timeout(self.write_timeout, async {
            stream.write_all(&payload).await?;
            stream.shutdown().await
        })
        .await
        .map_err(|_| Error::timeout(&endpoint, "write"))?
        .map_err(|e| Error::transport(&endpoint, e))?;

        debug!("Sent {} byte script to {}", payload.len(), endpoint);
        Ok(())
    }
}
