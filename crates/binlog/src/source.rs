//! Replication source seam.
//!
//! [`BinlogConnector`] opens replication streams and answers the few
//! metadata questions the reader has. [`MysqlConnector`] talks to a real
//! server; the `test-util` feature provides a scripted one.

use std::future::Future;
use std::time::Duration;

use binwatch_core::config::{SourceConfig, StartMode};
use binwatch_core::types::StreamPosition;
use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::error::BinlogError;
use crate::protocol::MysqlClient;

/// Factory for replication streams.
pub trait BinlogConnector: Send + Sync + 'static {
    type Connection: BinlogConnection;

    /// Open a stream positioned at `start`.
    fn connect(
        &self,
        start: &StreamPosition,
    ) -> impl Future<Output = Result<Self::Connection, BinlogError>> + Send;

    /// Resolve `now` / `earliest` to a concrete position.
    fn resolve_start(
        &self,
        mode: StartMode,
    ) -> impl Future<Output = Result<StreamPosition, BinlogError>> + Send;

    /// Ordered column names of a table, for logs without column metadata.
    fn column_names(
        &self,
        database: &str,
        table: &str,
    ) -> impl Future<Output = Result<Vec<String>, BinlogError>> + Send;
}

/// An open replication stream.
pub trait BinlogConnection: Send + 'static {
    /// Next raw event (header included), or `None` when the source ended
    /// the stream.
    fn next_event(&mut self) -> impl Future<Output = Result<Option<Bytes>, BinlogError>> + Send;

    /// Whether events carry a CRC32 trailer. Needed before the first
    /// FORMAT_DESCRIPTION, since the dump opens with a ROTATE.
    fn checksum(&self) -> bool;
}

/// Connector for a MySQL server.
#[derive(Debug, Clone)]
pub struct MysqlConnector {
    config: SourceConfig,
}

impl MysqlConnector {
    pub fn new(config: SourceConfig) -> Self {
        Self { config }
    }

    fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.config.connect_timeout_secs)
    }

    fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.config.read_timeout_secs)
    }

    /// TCP connect and authenticate.
    async fn open(&self) -> Result<MysqlClient<TcpStream>, BinlogError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let stream = tokio::time::timeout(self.connect_timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| BinlogError::Timeout(format!("connecting to {addr}")))??;
        stream.set_nodelay(true)?;
        let client = tokio::time::timeout(
            self.connect_timeout(),
            MysqlClient::handshake(
                stream,
                &self.config.user,
                &self.config.password,
                self.read_timeout(),
            ),
        )
        .await
        .map_err(|_| BinlogError::Timeout(format!("handshake with {addr}")))??;
        debug!(
            addr = %addr,
            server_version = client.server_version(),
            connection_id = client.connection_id(),
            "connected to source"
        );
        Ok(client)
    }

    /// Check server settings the stream depends on.
    async fn check_server(client: &mut MysqlClient<TcpStream>) -> Result<(), BinlogError> {
        let format = single_value(client.query("SELECT @@global.binlog_format").await?);
        match format.as_deref() {
            Some(f) if f.eq_ignore_ascii_case("ROW") => {}
            other => {
                return Err(BinlogError::UnsupportedFormat(format!(
                    "server binlog_format is {}; row-based logging is required",
                    other.unwrap_or("unknown")
                )));
            }
        }

        let row_image = single_value(client.query("SELECT @@global.binlog_row_image").await?);
        if !row_image
            .as_deref()
            .is_some_and(|v| v.eq_ignore_ascii_case("FULL"))
        {
            warn!(
                binlog_row_image = row_image.as_deref().unwrap_or("unknown"),
                "binlog_row_image is not FULL; before/after images will be partial"
            );
        }
        Ok(())
    }
}

impl BinlogConnector for MysqlConnector {
    type Connection = MysqlConnection;

    async fn connect(&self, start: &StreamPosition) -> Result<MysqlConnection, BinlogError> {
        let mut client = self.open().await?;
        Self::check_server(&mut client).await?;

        let checksum = single_value(client.query("SELECT @@global.binlog_checksum").await?)
            .is_some_and(|v| !v.eq_ignore_ascii_case("NONE"));
        client
            .execute("SET @master_binlog_checksum = @@global.binlog_checksum")
            .await?;
        let period_ns = self.config.heartbeat_secs.saturating_mul(1_000_000_000);
        client
            .execute(&format!("SET @master_heartbeat_period = {period_ns}"))
            .await?;

        client.register_replica(self.config.server_id).await?;
        client.start_dump(start, self.config.server_id).await?;
        info!(position = %start, server_id = self.config.server_id, "replication stream opened");
        Ok(MysqlConnection { client, checksum })
    }

    async fn resolve_start(&self, mode: StartMode) -> Result<StreamPosition, BinlogError> {
        let mut client = self.open().await?;
        match mode {
            StartMode::Now => {
                // renamed in 8.2
                let rows = match client.query("SHOW MASTER STATUS").await {
                    Ok(rows) => rows,
                    Err(BinlogError::Server { .. }) => {
                        client.query("SHOW BINARY LOG STATUS").await?
                    }
                    Err(e) => return Err(e),
                };
                first_position(&rows).ok_or_else(|| {
                    BinlogError::UnsupportedFormat(
                        "binary logging is disabled on the source (no master status)".to_owned(),
                    )
                })
            }
            StartMode::Earliest => {
                let rows = client.query("SHOW BINARY LOGS").await?;
                rows.first()
                    .and_then(|row| row.first().cloned().flatten())
                    .map(|file| StreamPosition::new(file, 4))
                    .ok_or_else(|| {
                        BinlogError::UnsupportedFormat(
                            "binary logging is disabled on the source (no binary logs)".to_owned(),
                        )
                    })
            }
        }
    }

    async fn column_names(&self, database: &str, table: &str) -> Result<Vec<String>, BinlogError> {
        let mut client = self.open().await?;
        let sql = format!(
            "SELECT COLUMN_NAME FROM information_schema.COLUMNS \
             WHERE TABLE_SCHEMA = '{}' AND TABLE_NAME = '{}' ORDER BY ORDINAL_POSITION",
            escape_literal(database),
            escape_literal(table)
        );
        let rows = client.query(&sql).await?;
        Ok(rows
            .into_iter()
            .filter_map(|row| row.into_iter().next().flatten())
            .collect())
    }
}

/// Live replication stream from a MySQL server.
pub struct MysqlConnection {
    client: MysqlClient<TcpStream>,
    checksum: bool,
}

impl BinlogConnection for MysqlConnection {
    async fn next_event(&mut self) -> Result<Option<Bytes>, BinlogError> {
        self.client.next_event().await
    }

    fn checksum(&self) -> bool {
        self.checksum
    }
}

fn single_value(rows: Vec<Vec<Option<String>>>) -> Option<String> {
    rows.into_iter().next()?.into_iter().next()?
}

/// `File` and `Position` are the first two columns of the status output.
fn first_position(rows: &[Vec<Option<String>>]) -> Option<StreamPosition> {
    let row = rows.first()?;
    let file = row.first()?.clone()?;
    let offset = row.get(1)?.as_deref()?.parse().ok()?;
    Some(StreamPosition::new(file, offset))
}

fn escape_literal(s: &str) -> String {
    s.replace('\\', "\\\\").replace('\'', "\\'")
}
