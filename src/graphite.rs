//! Graphite plaintext protocol over TCP
//!
//! One sample per line, `<path> <value>\n`. The liveness probe is the literal
//! line `health_check`, answered by the relay with any single line.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tracing::{debug, trace};

use crate::backend::{SinkConnection, SinkConnectionFactory};
use crate::error::SinkError;

pub const PROBE_LINE: &str = "health_check\n";

/// Opens plain TCP connections to a Graphite relay
#[derive(Debug, Clone, Copy, Default)]
pub struct GraphiteDialer;

#[async_trait]
impl SinkConnectionFactory for GraphiteDialer {
    async fn dial(
        &self,
        host: &str,
        port: u16,
        deadline: Duration,
    ) -> Result<Box<dyn SinkConnection>, SinkError> {
        let endpoint = format!("{host}:{port}");
        let stream = tokio::time::timeout(deadline, TcpStream::connect(&endpoint))
            .await
            .map_err(|_| SinkError::DialTimeout {
                endpoint: endpoint.clone(),
                timeout: deadline,
            })??;

        stream.set_nodelay(true)?;
        debug!("connected to graphite at {endpoint}");

        Ok(Box::new(GraphiteConnection::new(stream)))
    }
}

pub struct GraphiteConnection {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl GraphiteConnection {
    pub fn new(stream: TcpStream) -> Self {
        let (read, write) = stream.into_split();
        Self {
            reader: BufReader::new(read),
            writer: write,
        }
    }
}

#[async_trait]
impl SinkConnection for GraphiteConnection {
    async fn write(&mut self, line: &str) -> Result<(), SinkError> {
        self.writer.write_all(line.as_bytes()).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Send the probe line and wait for one line back, both within `deadline`
    async fn probe(&mut self, deadline: Duration) -> Result<(), SinkError> {
        let mut ack = String::new();
        let round_trip = async {
            self.writer.write_all(PROBE_LINE.as_bytes()).await?;
            self.writer.flush().await?;
            self.reader.read_line(&mut ack).await
        };
        let read = tokio::time::timeout(deadline, round_trip)
            .await
            .map_err(|_| SinkError::ProbeTimeout(deadline))??;

        if read == 0 {
            return Err(SinkError::Closed);
        }

        trace!("probe acknowledged: {:?}", ack.trim_end());
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
