//! MySQL client/server protocol: the subset a replica needs.
//!
//! Handshake v10 with `mysql_native_password` or `caching_sha2_password`
//! (fast-auth only), COM_QUERY with text result sets, COM_REGISTER_SLAVE and
//! COM_BINLOG_DUMP. The client is generic over the byte stream so tests can
//! stand in a scripted server on an in-memory duplex pipe.

use std::time::Duration;

use binwatch_core::types::StreamPosition;
use bytes::Bytes;
use sha1::{Digest, Sha1};
use sha2::Sha256;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, trace};

use crate::cursor::ByteCursor;
use crate::error::{BinlogError, ER_MASTER_FATAL_ERROR_READING_BINLOG};

const MAX_PAYLOAD: usize = 0x00FF_FFFF;
const MAX_PACKET_SIZE: u32 = 16 * 1024 * 1024;
const CHARSET_UTF8MB4: u8 = 45;

const CLIENT_LONG_PASSWORD: u32 = 0x0000_0001;
const CLIENT_LONG_FLAG: u32 = 0x0000_0004;
const CLIENT_PROTOCOL_41: u32 = 0x0000_0200;
const CLIENT_TRANSACTIONS: u32 = 0x0000_2000;
const CLIENT_SECURE_CONNECTION: u32 = 0x0000_8000;
const CLIENT_PLUGIN_AUTH: u32 = 0x0008_0000;

const COM_QUERY: u8 = 0x03;
const COM_BINLOG_DUMP: u8 = 0x12;
const COM_REGISTER_SLAVE: u8 = 0x15;

const NATIVE_PASSWORD: &str = "mysql_native_password";
const CACHING_SHA2_PASSWORD: &str = "caching_sha2_password";

/// Text result-set row; `None` is SQL NULL.
pub type TextRow = Vec<Option<String>>;

/// Parsed initial handshake packet.
#[derive(Debug, Clone)]
struct Greeting {
    server_version: String,
    connection_id: u32,
    salt: Vec<u8>,
    auth_plugin: String,
}

/// Connection to a MySQL server.
pub struct MysqlClient<S> {
    stream: BufReader<S>,
    seq: u8,
    read_timeout: Duration,
    server_version: String,
    connection_id: u32,
    /// Position requested by the last COM_BINLOG_DUMP.
    dump_position: Option<StreamPosition>,
}

impl<S> MysqlClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Run the handshake and authenticate.
    pub async fn handshake(
        stream: S,
        user: &str,
        password: &str,
        read_timeout: Duration,
    ) -> Result<Self, BinlogError> {
        let mut client = Self {
            stream: BufReader::new(stream),
            seq: 0,
            read_timeout,
            server_version: String::new(),
            connection_id: 0,
            dump_position: None,
        };

        let packet = client.read_packet().await?;
        if packet.first() == Some(&0xFF) {
            return Err(parse_error_packet(&packet));
        }
        let greeting = parse_greeting(&packet)?;
        debug!(
            server_version = %greeting.server_version,
            connection_id = greeting.connection_id,
            auth_plugin = %greeting.auth_plugin,
            "received server greeting"
        );
        client.server_version = greeting.server_version.clone();
        client.connection_id = greeting.connection_id;

        let plugin = if greeting.auth_plugin == CACHING_SHA2_PASSWORD {
            CACHING_SHA2_PASSWORD
        } else {
            NATIVE_PASSWORD
        };
        let auth = scramble(plugin, password, &greeting.salt)?;
        client
            .write_packet(&handshake_response(user, plugin, &auth))
            .await?;
        client.authenticate(password).await?;
        Ok(client)
    }

    pub fn server_version(&self) -> &str {
        &self.server_version
    }

    pub fn connection_id(&self) -> u32 {
        self.connection_id
    }

    /// Follow auth-switch and caching_sha2 fast-auth exchanges until OK.
    async fn authenticate(&mut self, password: &str) -> Result<(), BinlogError> {
        loop {
            let packet = self.read_packet().await?;
            match packet.first() {
                Some(0x00) => return Ok(()),
                Some(0xFF) => {
                    let err = parse_error_packet(&packet);
                    return Err(BinlogError::Auth(err.to_string()));
                }
                Some(0xFE) => {
                    let mut cursor = ByteCursor::new(&packet[1..]);
                    let plugin = cursor.nul_str()?;
                    let salt = trim_nul(cursor.rest());
                    debug!(plugin = %plugin, "server requested auth switch");
                    let auth = scramble(&plugin, password, salt)?;
                    self.write_packet(&auth).await?;
                }
                Some(0x01) => match packet.get(1) {
                    // fast-auth success, OK follows
                    Some(0x03) => continue,
                    Some(0x04) => {
                        return Err(BinlogError::Auth(
                            "caching_sha2_password full authentication requires a secure \
                             connection; use mysql_native_password for the replication \
                             account or log in once over TLS to prime the server cache"
                                .to_owned(),
                        ));
                    }
                    other => {
                        return Err(BinlogError::Protocol(format!(
                            "unexpected auth-more-data byte {other:?}"
                        )));
                    }
                },
                other => {
                    return Err(BinlogError::Protocol(format!(
                        "unexpected packet during authentication: {other:?}"
                    )));
                }
            }
        }
    }

    /// Run a statement and collect its text result set. Statements without a
    /// result set return no rows.
    pub async fn query(&mut self, sql: &str) -> Result<Vec<TextRow>, BinlogError> {
        trace!(sql, "query");
        let mut payload = Vec::with_capacity(sql.len() + 1);
        payload.push(COM_QUERY);
        payload.extend_from_slice(sql.as_bytes());
        self.command(&payload).await?;

        let first = self.read_packet().await?;
        match first.first() {
            Some(0x00) => return Ok(Vec::new()),
            Some(0xFF) => return Err(parse_error_packet(&first)),
            None => return Err(BinlogError::Protocol("empty query response".to_owned())),
            _ => {}
        }
        let columns = ByteCursor::new(&first).packed_int()? as usize;

        // column definitions, then EOF
        for _ in 0..columns {
            self.read_packet().await?;
        }
        let eof = self.read_packet().await?;
        if !is_eof(&eof) {
            return Err(BinlogError::Protocol(
                "missing EOF after column definitions".to_owned(),
            ));
        }

        let mut rows = Vec::new();
        loop {
            let packet = self.read_packet().await?;
            if is_eof(&packet) {
                break;
            }
            if packet.first() == Some(&0xFF) {
                return Err(parse_error_packet(&packet));
            }
            rows.push(parse_text_row(&packet, columns)?);
        }
        Ok(rows)
    }

    /// Run a statement, discarding any rows.
    pub async fn execute(&mut self, sql: &str) -> Result<(), BinlogError> {
        self.query(sql).await.map(|_| ())
    }

    /// Announce this connection as a replica.
    pub async fn register_replica(&mut self, server_id: u32) -> Result<(), BinlogError> {
        let mut payload = vec![COM_REGISTER_SLAVE];
        payload.extend_from_slice(&server_id.to_le_bytes());
        payload.push(0); // hostname
        payload.push(0); // user
        payload.push(0); // password
        payload.extend_from_slice(&0u16.to_le_bytes()); // port
        payload.extend_from_slice(&0u32.to_le_bytes()); // replication rank
        payload.extend_from_slice(&0u32.to_le_bytes()); // master id
        self.command(&payload).await?;

        let response = self.read_packet().await?;
        match response.first() {
            Some(0x00) => Ok(()),
            Some(0xFF) => Err(parse_error_packet(&response)),
            other => Err(BinlogError::Protocol(format!(
                "unexpected COM_REGISTER_SLAVE response {other:?}"
            ))),
        }
    }

    /// Request the event stream from `position`. Errors for the request
    /// itself (purged file, bad offset) arrive with the first read.
    pub async fn start_dump(
        &mut self,
        position: &StreamPosition,
        server_id: u32,
    ) -> Result<(), BinlogError> {
        let offset = u32::try_from(position.offset.max(4)).map_err(|_| {
            BinlogError::Protocol(format!(
                "offset {} does not fit COM_BINLOG_DUMP",
                position.offset
            ))
        })?;
        let mut payload = vec![COM_BINLOG_DUMP];
        payload.extend_from_slice(&offset.to_le_bytes());
        payload.extend_from_slice(&0u16.to_le_bytes()); // blocking
        payload.extend_from_slice(&server_id.to_le_bytes());
        payload.extend_from_slice(position.file.as_bytes());
        self.command(&payload).await?;
        self.dump_position = Some(position.clone());
        debug!(position = %position, server_id, "binlog dump requested");
        Ok(())
    }

    /// Next raw event of the dump, or `None` when the server ends the stream.
    pub async fn next_event(&mut self) -> Result<Option<Bytes>, BinlogError> {
        let mut packet = self.read_packet().await?;
        match packet.first() {
            Some(0x00) => {
                packet.remove(0);
                Ok(Some(Bytes::from(packet)))
            }
            _ if is_eof(&packet) => Ok(None),
            Some(0xFF) => Err(self.dump_error(parse_error_packet(&packet))),
            other => Err(BinlogError::Protocol(format!(
                "unexpected stream packet header {other:?}"
            ))),
        }
    }

    /// Classify dump errors that mean the requested position is gone.
    fn dump_error(&self, err: BinlogError) -> BinlogError {
        match err {
            BinlogError::Server { code, message }
                if code == ER_MASTER_FATAL_ERROR_READING_BINLOG && is_purged_message(&message) =>
            {
                BinlogError::StaleCheckpoint {
                    position: self
                        .dump_position
                        .clone()
                        .unwrap_or_else(|| StreamPosition::new("", 0)),
                    message,
                }
            }
            other => other,
        }
    }

    async fn command(&mut self, payload: &[u8]) -> Result<(), BinlogError> {
        self.seq = 0;
        self.write_packet(payload).await
    }

    async fn write_packet(&mut self, payload: &[u8]) -> Result<(), BinlogError> {
        let mut chunks = payload.chunks(MAX_PAYLOAD).peekable();
        let mut buf = Vec::with_capacity(payload.len() + 4);
        if payload.is_empty() {
            buf.extend_from_slice(&[0, 0, 0, self.seq]);
            self.seq = self.seq.wrapping_add(1);
        }
        while let Some(chunk) = chunks.next() {
            let len = chunk.len() as u32;
            buf.extend_from_slice(&len.to_le_bytes()[..3]);
            buf.push(self.seq);
            buf.extend_from_slice(chunk);
            self.seq = self.seq.wrapping_add(1);
            if chunks.peek().is_none() && chunk.len() == MAX_PAYLOAD {
                buf.extend_from_slice(&[0, 0, 0, self.seq]);
                self.seq = self.seq.wrapping_add(1);
            }
        }
        let stream = self.stream.get_mut();
        stream.write_all(&buf).await?;
        stream.flush().await?;
        Ok(())
    }

    /// Read one logical packet, joining 16 MiB continuations.
    async fn read_packet(&mut self) -> Result<Vec<u8>, BinlogError> {
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; 4];
            self.read_exact(&mut header).await?;
            let len = usize::from(header[0])
                | (usize::from(header[1]) << 8)
                | (usize::from(header[2]) << 16);
            self.seq = header[3].wrapping_add(1);
            let start = payload.len();
            payload.resize(start + len, 0);
            self.read_exact(&mut payload[start..]).await?;
            if len < MAX_PAYLOAD {
                return Ok(payload);
            }
        }
    }

    async fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), BinlogError> {
        match tokio::time::timeout(self.read_timeout, self.stream.read_exact(buf)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                Err(BinlogError::Closed)
            }
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Err(BinlogError::Timeout(format!(
                "no data from server for {:?}",
                self.read_timeout
            ))),
        }
    }
}

fn is_eof(packet: &[u8]) -> bool {
    packet.first() == Some(&0xFE) && packet.len() < 9
}

fn trim_nul(data: &[u8]) -> &[u8] {
    match data.last() {
        Some(0) => &data[..data.len() - 1],
        _ => data,
    }
}

/// `Could not find first log file name in binary log index file`, purged
/// GTIDs and offsets past the end of the file all mean the checkpoint is gone.
fn is_purged_message(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("could not find first log file")
        || lower.contains("purged")
        || lower.contains("position > file size")
}

/// ERR packet: `0xFF code(2) ['#' sqlstate(5)] message`.
pub(crate) fn parse_error_packet(packet: &[u8]) -> BinlogError {
    let mut cursor = ByteCursor::new(packet.get(1..).unwrap_or_default());
    let Ok(code) = cursor.u16_le() else {
        return BinlogError::Protocol("truncated error packet".to_owned());
    };
    if cursor.peek_u8() == Some(b'#') {
        let _ = cursor.skip(6);
    }
    BinlogError::Server {
        code,
        message: String::from_utf8_lossy(cursor.rest()).into_owned(),
    }
}

fn parse_greeting(packet: &[u8]) -> Result<Greeting, BinlogError> {
    let mut cursor = ByteCursor::new(packet);
    let protocol_version = cursor.u8()?;
    if protocol_version != 10 {
        return Err(BinlogError::Protocol(format!(
            "unsupported handshake protocol version {protocol_version}"
        )));
    }
    let server_version = cursor.nul_str()?;
    let connection_id = cursor.u32_le()?;
    let mut salt = cursor.bytes(8)?.to_vec();
    cursor.skip(1)?;
    let capabilities_low = u32::from(cursor.u16_le()?);

    let mut auth_plugin = NATIVE_PASSWORD.to_owned();
    if !cursor.is_empty() {
        let _charset = cursor.u8()?;
        let _status = cursor.u16_le()?;
        let capabilities = capabilities_low | (u32::from(cursor.u16_le()?) << 16);
        let auth_data_len = usize::from(cursor.u8()?);
        cursor.skip(10)?;
        if capabilities & CLIENT_SECURE_CONNECTION != 0 {
            let len = auth_data_len.saturating_sub(8).max(13);
            let part2 = cursor.bytes(len.min(cursor.remaining()))?;
            salt.extend_from_slice(trim_nul(part2));
        }
        if capabilities & CLIENT_PLUGIN_AUTH != 0 && !cursor.is_empty() {
            auth_plugin = String::from_utf8_lossy(trim_nul(cursor.rest())).into_owned();
        }
    }

    Ok(Greeting {
        server_version,
        connection_id,
        salt,
        auth_plugin,
    })
}

fn handshake_response(user: &str, plugin: &str, auth: &[u8]) -> Vec<u8> {
    let capabilities = CLIENT_LONG_PASSWORD
        | CLIENT_LONG_FLAG
        | CLIENT_PROTOCOL_41
        | CLIENT_TRANSACTIONS
        | CLIENT_SECURE_CONNECTION
        | CLIENT_PLUGIN_AUTH;
    let mut out = Vec::with_capacity(64 + user.len() + auth.len());
    out.extend_from_slice(&capabilities.to_le_bytes());
    out.extend_from_slice(&MAX_PACKET_SIZE.to_le_bytes());
    out.push(CHARSET_UTF8MB4);
    out.extend_from_slice(&[0u8; 23]);
    out.extend_from_slice(user.as_bytes());
    out.push(0);
    out.push(auth.len() as u8);
    out.extend_from_slice(auth);
    out.extend_from_slice(plugin.as_bytes());
    out.push(0);
    out
}

fn parse_text_row(packet: &[u8], columns: usize) -> Result<TextRow, BinlogError> {
    let mut cursor = ByteCursor::new(packet);
    let mut row = Vec::with_capacity(columns);
    for _ in 0..columns {
        if cursor.peek_u8() == Some(0xFB) {
            cursor.skip(1)?;
            row.push(None);
        } else {
            let len = cursor.packed_len()?;
            row.push(Some(cursor.str_n(len)?));
        }
    }
    Ok(row)
}

/// Auth response for `plugin`.
pub(crate) fn scramble(plugin: &str, password: &str, salt: &[u8]) -> Result<Vec<u8>, BinlogError> {
    if password.is_empty() {
        return Ok(Vec::new());
    }
    match plugin {
        // SHA1(pwd) XOR SHA1(salt + SHA1(SHA1(pwd)))
        NATIVE_PASSWORD => {
            let stage1 = Sha1::digest(password.as_bytes());
            let stage2 = Sha1::digest(stage1);
            let mut hasher = Sha1::new();
            hasher.update(salt);
            hasher.update(stage2);
            let mix = hasher.finalize();
            Ok(stage1.iter().zip(mix.iter()).map(|(a, b)| a ^ b).collect())
        }
        // SHA256(pwd) XOR SHA256(SHA256(SHA256(pwd)) + salt)
        CACHING_SHA2_PASSWORD => {
            let p1 = Sha256::digest(password.as_bytes());
            let p2 = Sha256::digest(p1);
            let mut hasher = Sha256::new();
            hasher.update(p2);
            hasher.update(salt);
            let p3 = hasher.finalize();
            Ok(p1.iter().zip(p3.iter()).map(|(a, b)| a ^ b).collect())
        }
        other => Err(BinlogError::Auth(format!(
            "unsupported authentication plugin {other}"
        ))),
    }
}
