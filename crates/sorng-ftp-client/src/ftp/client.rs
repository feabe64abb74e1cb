//! FTP client handle.
//!
//! Lifecycle: `connect()` → TCP connect → greeting → USER/PASS → FEAT →
//! `TYPE I` → ready. The whole sequence is bounded by the connect timeout.
//!
//! `FtpClient` is a cheap, cloneable handle onto the session task; every
//! method queues its command and awaits the matching reply, so calls made
//! concurrently from several tasks are still sent one at a time, in order.
//! Directory and transfer commands live in `directory.rs` and `file_ops.rs`.

use crate::ftp::connection::{TcpTransport, Transport};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::session::{ControlSession, SessionRequest, SessionShared};
use crate::ftp::types::*;
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use uuid::Uuid;

/// A logged-in FTP session.
#[derive(Clone)]
pub struct FtpClient {
    pub(crate) id: String,
    pub(crate) config: Arc<FtpConnectionConfig>,
    requests: mpsc::UnboundedSender<SessionRequest>,
    shared: Arc<SessionShared>,
    events: Arc<StdMutex<Option<mpsc::UnboundedReceiver<SessionEvent>>>>,
}

impl FtpClient {
    /// Connect over plain TCP and log in.
    pub async fn connect(config: FtpConnectionConfig) -> FtpResult<Self> {
        Self::connect_with(config, Arc::new(TcpTransport)).await
    }

    /// Connect through a caller-supplied transport and log in.
    pub async fn connect_with(
        config: FtpConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> FtpResult<Self> {
        if config.host.trim().is_empty() {
            return Err(FtpError::invalid_config("Host must not be empty"));
        }

        let id = Uuid::new_v4().to_string();
        let target = format!("{}:{}", config.host, config.port);
        log::info!("[ftp:{}] connecting to {} as {}", id, target, config.user);

        let limit = config.connect_timeout();
        match timeout(limit, Self::establish(id.clone(), config, transport)).await {
            Ok(result) => result.map_err(|e| e.with_session(&id)),
            Err(_) => {
                log::warn!("[ftp:{}] connect to {} timed out after {:?}", id, target, limit);
                Err(FtpError::timeout(format!("Timed out while connecting to {}", target))
                    .with_session(&id))
            }
        }
    }

    async fn establish(
        id: String,
        config: FtpConnectionConfig,
        transport: Arc<dyn Transport>,
    ) -> FtpResult<Self> {
        let connection = transport
            .connect(&config.host, config.port)
            .await
            .map_err(|e| {
                FtpError::connection_failed(format!(
                    "Unable to connect to {}:{}: {}",
                    config.host, config.port, e
                ))
            })?;

        let shared = Arc::new(SessionShared::default());
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = oneshot::channel();
        let requests = ControlSession::start(
            id.clone(),
            config.clone(),
            connection,
            transport,
            Arc::clone(&shared),
            events_tx,
            ready_tx,
        );

        match ready_rx.await {
            Ok(Ok(())) => Ok(Self {
                id,
                config: Arc::new(config),
                requests,
                shared,
                events: Arc::new(StdMutex::new(Some(events_rx))),
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => Err(FtpError::disconnected(
                "Session ended before login completed",
            )),
        }
    }

    // ─── Session info ────────────────────────────────────────────

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &FtpConnectionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == SessionState::Authorized
    }

    /// Extensions advertised by FEAT at login (empty if FEAT failed).
    pub fn features(&self) -> ServerFeatures {
        self.shared.features()
    }

    pub fn greeting(&self) -> Option<String> {
        self.shared.greeting()
    }

    /// Session-level events. Only the first call gets the receiver.
    pub fn take_events(&self) -> Option<mpsc::UnboundedReceiver<SessionEvent>> {
        self.events.lock().ok().and_then(|mut slot| slot.take())
    }

    // ─── Command plumbing ────────────────────────────────────────

    pub(crate) fn ensure_authorized(&self) -> FtpResult<()> {
        match self.state() {
            SessionState::Authorized => Ok(()),
            state => Err(FtpError::invalid_state(format!(
                "Not logged in (session is {:?})",
                state
            ))
            .with_session(&self.id)),
        }
    }

    pub(crate) fn require_feature(&self, keyword: &str) -> FtpResult<()> {
        if self.shared.features().supports(keyword) {
            Ok(())
        } else {
            Err(FtpError::unsupported(format!("Server does not support {}", keyword))
                .with_session(&self.id))
        }
    }

    pub(crate) fn closed_error(&self) -> FtpError {
        FtpError::disconnected("Session is closed").with_session(&self.id)
    }

    pub(crate) fn submit(&self, request: SessionRequest) -> FtpResult<()> {
        self.requests
            .send(request)
            .map_err(|_| self.closed_error())
    }

    async fn send(&self, command: Command, then: Option<Command>) -> FtpResult<Completion> {
        self.ensure_authorized()?;
        let (responder, reply) = oneshot::channel();
        self.submit(SessionRequest::Command {
            command,
            then,
            responder,
        })?;
        reply
            .await
            .map_err(|_| self.closed_error())?
            .map_err(|e| e.with_session(&self.id))
    }

    /// Send any command and return the server's final reply.
    pub async fn execute(&self, command: Command) -> FtpResult<Completion> {
        self.send(command, None).await
    }

    /// Send `first`; on success send `second` before anything else queued.
    /// The result is the reply to `second`.
    pub(crate) async fn execute_pair(&self, first: Command, second: Command) -> FtpResult<Completion> {
        self.send(first, Some(second)).await
    }

    // ─── Connection control ──────────────────────────────────────

    /// Close the control connection immediately. Pending commands fail with
    /// `Disconnected`.
    pub fn end(&self) {
        log::debug!("[ftp:{}] end requested", self.id);
        let _ = self.requests.send(SessionRequest::End);
    }

    /// Polite logout: QUIT, then the server closes the connection.
    pub async fn quit(&self) -> FtpResult<()> {
        self.execute(Command::new("QUIT")).await?;
        Ok(())
    }

    pub async fn noop(&self) -> FtpResult<()> {
        self.execute(Command::new("NOOP")).await?;
        Ok(())
    }

    /// Abort the current transfer. ABOR jumps ahead of every queued command
    /// and the open data connection is closed without reporting an error.
    pub async fn abort(&self) -> FtpResult<()> {
        self.ensure_authorized()?;
        let (responder, reply) = oneshot::channel();
        self.submit(SessionRequest::Abort { responder })?;
        reply
            .await
            .map_err(|_| self.closed_error())?
            .map_err(|e| e.with_session(&self.id))?;
        Ok(())
    }

    // ─── Working directory ───────────────────────────────────────

    pub async fn cwd(&self, path: &str) -> FtpResult<()> {
        self.execute(Command::with_arg("CWD", path)).await?;
        Ok(())
    }

    pub async fn cdup(&self) -> FtpResult<()> {
        self.execute(Command::new("CDUP")).await?;
        Ok(())
    }

    /// Current directory from the 257 reply.
    pub async fn pwd(&self) -> FtpResult<String> {
        let reply = self.execute(Command::new("PWD")).await?;
        expect_path(reply)
    }

    // ─── Informational ───────────────────────────────────────────

    /// SYST reply text, e.g. `UNIX Type: L8`.
    pub async fn system(&self) -> FtpResult<String> {
        let reply = self.execute(Command::new("SYST")).await?;
        Ok(reply.text)
    }

    /// STAT, for the server or for one path.
    pub async fn status(&self, path: Option<&str>) -> FtpResult<String> {
        let command = match path {
            Some(p) => Command::with_arg("STAT", p),
            None => Command::new("STAT"),
        };
        let reply = self.execute(command).await?;
        Ok(reply.text)
    }

    pub async fn site(&self, args: &str) -> FtpResult<String> {
        let reply = self.execute(Command::with_arg("SITE", args)).await?;
        Ok(reply.text)
    }

    /// REST: the next RETR/STOR starts at `offset`.
    pub async fn restart(&self, offset: u64) -> FtpResult<()> {
        self.ensure_authorized()?;
        self.require_feature("REST")?;
        self.execute(Command::with_arg("REST", offset.to_string()))
            .await?;
        Ok(())
    }
}

pub(crate) fn expect_path(reply: Completion) -> FtpResult<String> {
    match reply.payload {
        ReplyPayload::Path(path) => Ok(path),
        _ => Err(FtpError::unexpected_reply(
            reply.code,
            format!("Expected a quoted path: {}", reply.text),
        )),
    }
}
