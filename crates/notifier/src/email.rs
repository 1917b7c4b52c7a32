//! Email channel: plain-text message over SMTP, with optional STARTTLS
//! and AUTH LOGIN.

use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use binwatch_core::config::ChannelConfig;
use binwatch_core::pipeline::BoxFuture;
use binwatch_core::types::{Alert, Severity};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tracing::{debug, warn};

use crate::channel::{NotificationChannel, render_body, render_subject};
use crate::error::{ChannelError, NotifierError};

const CLIENT_NAME: &str = "binwatch";

/// SMTP delivery to a fixed recipient list.
///
/// 4xx replies and I/O failures are transient, 5xx replies are permanent.
pub struct EmailChannel {
    name: String,
    min_severity: Severity,
    host: String,
    port: u16,
    tls: Option<(TlsConnector, ServerName<'static>)>,
    credentials: Option<(String, String)>,
    from: String,
    recipients: Vec<String>,
    subject_prefix: String,
    timeout: Duration,
}

impl std::fmt::Debug for EmailChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmailChannel")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("starttls", &self.tls.is_some())
            .field("recipients", &self.recipients)
            .finish_non_exhaustive()
    }
}

impl EmailChannel {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, NotifierError> {
        let setup = |reason: String| NotifierError::Setup {
            channel: config.name.clone(),
            reason,
        };

        if config.smtp_host.trim().is_empty() {
            return Err(setup("smtp_host is required".to_owned()));
        }
        if config.from.trim().is_empty() {
            return Err(setup("from is required".to_owned()));
        }
        if config.recipients.is_empty() {
            return Err(setup("at least one recipient is required".to_owned()));
        }
        if let Some(bad) = [config.from.as_str()]
            .into_iter()
            .chain(config.recipients.iter().map(String::as_str))
            .find(|addr| !addr.contains('@') || addr.contains(['\r', '\n', '<', '>']))
        {
            return Err(setup(format!("invalid address '{bad}'")));
        }

        let tls = if config.starttls {
            let server_name = ServerName::try_from(config.smtp_host.clone())
                .map_err(|e| setup(format!("invalid TLS server name: {e}")))?;
            let client = tls_client_config().map_err(setup)?;
            Some((TlsConnector::from(Arc::new(client)), server_name))
        } else {
            None
        };

        let credentials = (!config.username.is_empty())
            .then(|| (config.username.clone(), config.password.clone()));

        Ok(Self {
            name: config.name.clone(),
            min_severity: config.min_severity,
            host: config.smtp_host.clone(),
            port: config.smtp_port,
            tls,
            credentials,
            from: config.from.clone(),
            recipients: config.recipients.clone(),
            subject_prefix: config.subject_prefix.clone(),
            timeout: Duration::from_secs(config.timeout_secs.max(1)),
        })
    }

    /// RFC 5322 message with dot-stuffed CRLF body, ready for DATA.
    fn compose(&self, alert: &Alert) -> String {
        let subject = render_subject(&self.subject_prefix, alert).replace(['\r', '\n'], " ");
        let mut message = format!(
            "From: {}\r\nTo: {}\r\nSubject: {subject}\r\nDate: {}\r\nMessage-ID: <{}@{CLIENT_NAME}>\r\n\
             MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\
             Content-Transfer-Encoding: 8bit\r\n\r\n",
            self.from,
            self.recipients.join(", "),
            alert.created_at.to_rfc2822(),
            alert.id,
        );
        for line in render_body(alert).lines() {
            if line.starts_with('.') {
                message.push('.');
            }
            message.push_str(line);
            message.push_str("\r\n");
        }
        message
    }

    async fn session(&self, message: &str) -> Result<(), ChannelError> {
        let tcp = TcpStream::connect((self.host.as_str(), self.port))
            .await
            .map_err(|e| ChannelError::Transient(format!("connect {}:{}: {e}", self.host, self.port)))?;

        let mut conn = SmtpConnection::new(tcp);
        conn.expect(&[220]).await?;
        conn.command(&format!("EHLO {CLIENT_NAME}"), &[250]).await?;

        match &self.tls {
            Some((connector, server_name)) => {
                conn.command("STARTTLS", &[220]).await?;
                let tls = connector
                    .connect(server_name.clone(), conn.into_inner())
                    .await
                    .map_err(|e| ChannelError::Transient(format!("TLS handshake: {e}")))?;
                let mut conn = SmtpConnection::new(tls);
                conn.command(&format!("EHLO {CLIENT_NAME}"), &[250]).await?;
                self.transaction(&mut conn, message).await
            }
            None => self.transaction(&mut conn, message).await,
        }
    }

    async fn transaction<S>(
        &self,
        conn: &mut SmtpConnection<S>,
        message: &str,
    ) -> Result<(), ChannelError>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        if let Some((username, password)) = &self.credentials {
            conn.command("AUTH LOGIN", &[334]).await?;
            conn.command(&BASE64.encode(username), &[334]).await?;
            conn.command(&BASE64.encode(password), &[235]).await?;
        }

        conn.command(&format!("MAIL FROM:<{}>", self.from), &[250]).await?;
        for recipient in &self.recipients {
            conn.command(&format!("RCPT TO:<{recipient}>"), &[250, 251]).await?;
        }
        conn.command("DATA", &[354]).await?;
        conn.write(message).await?;
        conn.command(".", &[250]).await?;

        if let Err(e) = conn.command("QUIT", &[221]).await {
            debug!(channel = %self.name, error = %e, "QUIT not acknowledged");
        }
        Ok(())
    }
}

impl NotificationChannel for EmailChannel {
    fn name(&self) -> &str {
        &self.name
    }

    fn min_severity(&self) -> Severity {
        self.min_severity
    }

    fn send<'a>(&'a self, alert: &'a Alert) -> BoxFuture<'a, Result<(), ChannelError>> {
        Box::pin(async move {
            let message = self.compose(alert);
            match tokio::time::timeout(self.timeout, self.session(&message)).await {
                Ok(result) => {
                    if let Err(e) = &result {
                        warn!(channel = %self.name, alert_id = %alert.id, error = %e, "SMTP delivery failed");
                    }
                    result
                }
                Err(_) => Err(ChannelError::Transient(format!(
                    "SMTP session timed out after {:?}",
                    self.timeout
                ))),
            }
        })
    }
}

fn tls_client_config() -> Result<ClientConfig, String> {
    let mut roots = RootCertStore::empty();
    let native = rustls_native_certs::load_native_certs();
    for cert in native.certs {
        let _ = roots.add(cert);
    }
    if roots.is_empty() {
        return Err("no trusted root certificates found".to_owned());
    }

    let provider = Arc::new(tokio_rustls::rustls::crypto::ring::default_provider());
    Ok(ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| format!("TLS setup: {e}"))?
        .with_root_certificates(roots)
        .with_no_client_auth())
}

/// SMTP reply: code plus the text of every line.
#[derive(Debug)]
struct Reply {
    code: u16,
    text: String,
}

struct SmtpConnection<S> {
    stream: BufReader<S>,
}

impl<S> SmtpConnection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    fn new(stream: S) -> Self {
        Self {
            stream: BufReader::new(stream),
        }
    }

    fn into_inner(self) -> S {
        self.stream.into_inner()
    }

    async fn write(&mut self, data: &str) -> Result<(), ChannelError> {
        let stream = self.stream.get_mut();
        stream.write_all(data.as_bytes()).await.map_err(io_error)?;
        stream.flush().await.map_err(io_error)
    }

    async fn command(&mut self, line: &str, accept: &[u16]) -> Result<Reply, ChannelError> {
        self.write(&format!("{line}\r\n")).await?;
        self.expect(accept).await
    }

    async fn expect(&mut self, accept: &[u16]) -> Result<Reply, ChannelError> {
        let reply = self.read_reply().await?;
        if accept.contains(&reply.code) {
            return Ok(reply);
        }
        let reason = format!("SMTP {} {}", reply.code, reply.text);
        if (400..500).contains(&reply.code) {
            Err(ChannelError::Transient(reason))
        } else {
            Err(ChannelError::Permanent(reason))
        }
    }

    /// Read one possibly multi-line reply (`250-...` continues, `250 ...` ends).
    async fn read_reply(&mut self) -> Result<Reply, ChannelError> {
        let mut text = Vec::new();
        loop {
            let mut line = String::new();
            let n = self.stream.read_line(&mut line).await.map_err(io_error)?;
            if n == 0 {
                return Err(ChannelError::Transient("server closed the connection".to_owned()));
            }
            let line = line.trim_end();
            let code = line
                .get(..3)
                .and_then(|c| c.parse::<u16>().ok())
                .ok_or_else(|| ChannelError::Transient(format!("malformed reply '{line}'")))?;
            text.push(line.get(4..).unwrap_or_default().to_owned());
            if line.as_bytes().get(3) != Some(&b'-') {
                return Ok(Reply {
                    code,
                    text: text.join(" "),
                });
            }
        }
    }
}

fn io_error(err: std::io::Error) -> ChannelError {
    ChannelError::Transient(format!("SMTP I/O: {err}"))
}
