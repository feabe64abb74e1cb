//! Per-connection control session.
//!
//! One spawned task owns the control stream, the reply parser, the command
//! queue, the login state machine and any passive connect in progress. The
//! [`FtpClient`](crate::ftp::client::FtpClient) handle talks to it only through
//! [`SessionRequest`] messages; replies come back on per-command channels.

use std::net::SocketAddr;
use std::sync::{Arc, RwLock};

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval_at, Duration, Instant, MissedTickBehavior};

use crate::ftp::connection::{BoxedStream, Connection, Transport};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::handshake::{Handshake, HandshakeAction, HandshakeStep};
use crate::ftp::protocol::{interpret, Interpretation, ResponseParser};
use crate::ftp::queue::CommandQueue;
use crate::ftp::transfer::{
    connect_data, AbortSignal, DataConnectError, PassiveAttempt, PendingTransfer, TransferSignal,
};
use crate::ftp::types::{
    Command, Completion, FtpConnectionConfig, PassiveEndpoint, PassiveMode, Reply, ReplyPayload,
    ServerFeatures, SessionEvent, SessionState,
};

// ── Messages from the client handle ─────────────────────────────────────

/// Requests sent *to* a session task.
pub(crate) enum SessionRequest {
    /// Queue a command; `then` is sent right after a successful reply,
    /// ahead of anything else waiting.
    Command {
        command: Command,
        then: Option<Command>,
        responder: oneshot::Sender<FtpResult<Completion>>,
    },
    /// Open a passive data connection, then send `command` over control.
    Transfer {
        command: Command,
        signals: mpsc::UnboundedSender<TransferSignal>,
    },
    /// ABOR at the head of the queue; marks the open data channel aborting.
    Abort {
        responder: oneshot::Sender<FtpResult<Completion>>,
    },
    /// Close the control connection now.
    End,
}

/// Where the reply to a queued command goes.
enum Continuation {
    Handshake,
    Caller(oneshot::Sender<FtpResult<Completion>>),
    Chain {
        next: Command,
        responder: oneshot::Sender<FtpResult<Completion>>,
    },
    Passive(PendingTransfer),
    Transfer(mpsc::UnboundedSender<TransferSignal>),
    /// ABOR after a failed data connect; `error` goes to the caller once it completes.
    AbortAfterFailure {
        error: FtpError,
        pending: PendingTransfer,
    },
    Keepalive,
}

impl Continuation {
    fn fail(self, error: FtpError) {
        match self {
            Continuation::Caller(tx) | Continuation::Chain { responder: tx, .. } => {
                let _ = tx.send(Err(error));
            }
            Continuation::Passive(pending) => pending.fail(error),
            Continuation::AbortAfterFailure { error: cause, pending } => pending.fail(cause),
            Continuation::Transfer(signals) => {
                let _ = signals.send(TransferSignal::Finished(Err(error)));
            }
            Continuation::Handshake | Continuation::Keepalive => {}
        }
    }
}

// ── State visible to the client handle ──────────────────────────────────

/// Snapshot the session publishes for synchronous reads by the handle.
#[derive(Debug)]
pub(crate) struct SessionShared {
    state: RwLock<SessionState>,
    features: RwLock<ServerFeatures>,
    greeting: RwLock<Option<String>>,
}

impl Default for SessionShared {
    fn default() -> Self {
        Self {
            state: RwLock::new(SessionState::Unauthenticated),
            features: RwLock::new(ServerFeatures::default()),
            greeting: RwLock::new(None),
        }
    }
}

impl SessionShared {
    pub fn state(&self) -> SessionState {
        self.state
            .read()
            .map(|s| *s)
            .unwrap_or(SessionState::Closed)
    }

    pub fn features(&self) -> ServerFeatures {
        self.features
            .read()
            .map(|f| f.clone())
            .unwrap_or_default()
    }

    pub fn greeting(&self) -> Option<String> {
        self.greeting.read().ok().and_then(|g| g.clone())
    }

    fn set_state(&self, state: SessionState) {
        if let Ok(mut s) = self.state.write() {
            *s = state;
        }
    }

    fn set_features(&self, features: ServerFeatures) {
        if let Ok(mut f) = self.features.write() {
            *f = features;
        }
    }

    fn set_greeting(&self, greeting: String) {
        if let Ok(mut g) = self.greeting.write() {
            *g = Some(greeting);
        }
    }
}

enum CloseReason {
    /// Server closed the control connection.
    Remote,
    /// `end()` or every client handle dropped.
    Local,
    Failed(FtpError),
}

// ── The session task ────────────────────────────────────────────────────

pub(crate) struct ControlSession {
    id: String,
    config: FtpConnectionConfig,
    writer: WriteHalf<BoxedStream>,
    parser: ResponseParser,
    queue: CommandQueue<Continuation>,
    handshake: Handshake,
    peer: Option<SocketAddr>,
    transport: Arc<dyn Transport>,
    shared: Arc<SessionShared>,
    events: mpsc::UnboundedSender<SessionEvent>,
    ready: Option<oneshot::Sender<FtpResult<()>>>,
    data_tx: mpsc::UnboundedSender<Result<BoxedStream, DataConnectError>>,
    passive: Option<PassiveAttempt>,
    active_abort: Option<Arc<AbortSignal>>,
    closed: bool,
}

impl ControlSession {
    /// Spawn the session task on `connection` and return its request channel.
    ///
    /// `ready` resolves once login finished (or failed).
    pub fn start(
        id: String,
        config: FtpConnectionConfig,
        connection: Connection,
        transport: Arc<dyn Transport>,
        shared: Arc<SessionShared>,
        events: mpsc::UnboundedSender<SessionEvent>,
        ready: oneshot::Sender<FtpResult<()>>,
    ) -> mpsc::UnboundedSender<SessionRequest> {
        let (reader, writer) = tokio::io::split(connection.stream);
        let (request_tx, request_rx) = mpsc::unbounded_channel();
        let (data_tx, data_rx) = mpsc::unbounded_channel();

        let handshake = Handshake::new(config.user.clone(), config.password.clone());
        let parser = ResponseParser::with_limit(config.max_reply_bytes);
        let session = ControlSession {
            id,
            config,
            writer,
            parser,
            queue: CommandQueue::new(),
            handshake,
            peer: connection.peer,
            transport,
            shared,
            events,
            ready: Some(ready),
            data_tx,
            passive: None,
            active_abort: None,
            closed: false,
        };

        tokio::spawn(session.run(reader, request_rx, data_rx));
        request_tx
    }

    async fn run(
        mut self,
        mut reader: ReadHalf<BoxedStream>,
        mut requests: mpsc::UnboundedReceiver<SessionRequest>,
        mut data_rx: mpsc::UnboundedReceiver<Result<BoxedStream, DataConnectError>>,
    ) {
        let mut buf = vec![0u8; 8192];
        let period = self.config.keepalive_interval();
        let tick = period.unwrap_or(Duration::from_secs(3600));
        let mut keepalive = interval_at(Instant::now() + tick, tick);
        keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                read = reader.read(&mut buf) => match read {
                    Ok(0) => {
                        self.shutdown(CloseReason::Remote).await;
                    }
                    Ok(n) => {
                        for reply in self.parser.feed(&buf[..n]) {
                            self.on_reply(reply).await;
                            if self.closed {
                                break;
                            }
                        }
                        if let Err(e) = self.parser.check_limit() {
                            log::error!("[ftp:{}] {}", self.id, e);
                            self.shutdown(CloseReason::Failed(e)).await;
                        }
                    }
                    Err(e) => {
                        log::error!("[ftp:{}] control read failed: {}", self.id, e);
                        let error = FtpError::disconnected(format!("Control connection error: {}", e));
                        self.shutdown(CloseReason::Failed(error)).await;
                    }
                },
                request = requests.recv() => match request {
                    Some(request) => self.on_request(request).await,
                    None => self.shutdown(CloseReason::Local).await,
                },
                Some(result) = data_rx.recv() => self.on_data_connect(result).await,
                _ = keepalive.tick(), if period.is_some() => self.on_keepalive().await,
            }

            if self.closed {
                break;
            }
        }
        log::debug!("[ftp:{}] session task finished", self.id);
    }

    // ── Outbound ────────────────────────────────────────────────────────

    async fn on_request(&mut self, request: SessionRequest) {
        match request {
            SessionRequest::Command {
                command,
                then,
                responder,
            } => {
                let continuation = match then {
                    Some(next) => Continuation::Chain { next, responder },
                    None => Continuation::Caller(responder),
                };
                self.queue.enqueue(command, continuation);
            }
            SessionRequest::Transfer { command, signals } => {
                let verb = match self.config.passive_mode {
                    PassiveMode::Passive => "PASV",
                    PassiveMode::ExtendedPassive => "EPSV",
                };
                self.queue.enqueue(
                    Command::new(verb),
                    Continuation::Passive(PendingTransfer { command, signals }),
                );
            }
            SessionRequest::Abort { responder } => {
                if let Some(signal) = &self.active_abort {
                    signal.trigger();
                }
                log::debug!("[ftp:{}] ABOR moved to the head of the queue", self.id);
                self.queue
                    .promote(Command::new("ABOR"), Continuation::Caller(responder));
                // A data connect in progress is abandoned when it resolves.
            }
            SessionRequest::End => {
                self.shutdown(CloseReason::Local).await;
                return;
            }
        }
        self.dispatch().await;
    }

    /// Write the next queued command if the control channel is free.
    async fn dispatch(&mut self) {
        if self.closed || self.handshake.step() == HandshakeStep::AwaitGreeting {
            return;
        }
        let line = match self.queue.dispatch_next() {
            Some(command) => {
                log::trace!("[ftp:{}] >>> {}", self.id, command);
                if command.is("ABOR") {
                    if let Some(signal) = &self.active_abort {
                        signal.trigger();
                    }
                }
                command.to_wire()
            }
            None => return,
        };
        if let Err(e) = self.writer.write_all(&line).await {
            log::error!("[ftp:{}] control write failed: {}", self.id, e);
            let error = FtpError::disconnected(format!("Control connection error: {}", e));
            self.shutdown(CloseReason::Failed(error)).await;
        }
    }

    async fn on_keepalive(&mut self) {
        if self.handshake.is_done() && self.queue.is_idle() && self.passive.is_none() {
            log::debug!("[ftp:{}] keepalive NOOP", self.id);
            self.queue.enqueue(Command::new("NOOP"), Continuation::Keepalive);
            self.dispatch().await;
        }
    }

    // ── Inbound ─────────────────────────────────────────────────────────

    async fn on_reply(&mut self, reply: Reply) {
        log::trace!("[ftp:{}] <<< {} {}", self.id, reply.code, reply.text);

        if self.handshake.step() == HandshakeStep::AwaitGreeting {
            let action = self.handshake.on_greeting(&reply);
            if let Some(greeting) = self.handshake.greeting() {
                log::info!("[ftp:{}] greeting: {}", self.id, greeting);
                self.shared.set_greeting(greeting.to_string());
                let _ = self.events.send(SessionEvent::Greeting(greeting.to_string()));
            }
            self.apply_handshake(action).await;
            return;
        }

        let in_flight = match self.queue.in_flight() {
            Some(q) => q,
            None => {
                log::warn!(
                    "[ftp:{}] unsolicited reply {} {}",
                    self.id,
                    reply.code,
                    reply.text
                );
                if reply.code == 421 {
                    let error = FtpError::from_reply(421, &reply.text);
                    self.shutdown(CloseReason::Failed(error)).await;
                }
                return;
            }
        };

        match interpret(&reply) {
            Interpretation::Preliminary => {
                if let Continuation::Transfer(signals) = &in_flight.continuation {
                    let _ = signals.send(TransferSignal::Started(reply));
                }
            }
            Interpretation::Final(outcome) => {
                if let Some(done) = self.queue.complete() {
                    self.resolve(done.continuation, outcome).await;
                }
                self.dispatch().await;
            }
        }
    }

    async fn resolve(&mut self, continuation: Continuation, outcome: FtpResult<Completion>) {
        match continuation {
            Continuation::Handshake => {
                let action = self.handshake.advance(outcome);
                self.apply_handshake(action).await;
            }
            Continuation::Caller(tx) => {
                let _ = tx.send(outcome);
            }
            Continuation::Chain { next, responder } => match outcome {
                Ok(_) => self.queue.promote(next, Continuation::Caller(responder)),
                Err(e) => {
                    let _ = responder.send(Err(e));
                }
            },
            Continuation::Passive(pending) => match outcome {
                Ok(Completion {
                    payload: ReplyPayload::Passive(endpoint),
                    ..
                }) => self.begin_data_connect(endpoint, pending),
                Ok(c) => pending.fail(FtpError::unexpected_reply(
                    c.code,
                    format!("Expected a passive mode reply: {}", c.text),
                )),
                Err(e) => pending.fail(e),
            },
            Continuation::Transfer(signals) => {
                self.active_abort = None;
                let _ = signals.send(TransferSignal::Finished(outcome));
            }
            Continuation::AbortAfterFailure { error, pending } => {
                if let Err(e) = &outcome {
                    log::debug!("[ftp:{}] ABOR after failed data connect: {}", self.id, e);
                }
                pending.fail(error);
            }
            Continuation::Keepalive => {
                if let Err(e) = outcome {
                    log::debug!("[ftp:{}] keepalive NOOP rejected: {}", self.id, e);
                }
            }
        }
    }

    async fn apply_handshake(&mut self, action: HandshakeAction) {
        self.shared.set_state(self.handshake.session_state());
        match action {
            HandshakeAction::Wait => {}
            HandshakeAction::Send(command) => {
                log::debug!("[ftp:{}] login step {:?}", self.id, self.handshake.step());
                self.queue.promote(command, Continuation::Handshake);
                self.dispatch().await;
            }
            HandshakeAction::Ready(features) => {
                log::info!(
                    "[ftp:{}] ready ({} extensions advertised)",
                    self.id,
                    features.entries.len()
                );
                self.shared.set_features(features);
                let _ = self.events.send(SessionEvent::Ready);
                if let Some(ready) = self.ready.take() {
                    let _ = ready.send(Ok(()));
                }
                self.dispatch().await;
            }
            HandshakeAction::Fail(error) => {
                log::warn!("[ftp:{}] login failed: {}", self.id, error);
                self.shutdown(CloseReason::Failed(error)).await;
            }
        }
    }

    // ── Data connections ────────────────────────────────────────────────

    fn begin_data_connect(&mut self, endpoint: PassiveEndpoint, pending: PendingTransfer) {
        if self.queue.next_is("ABOR") {
            log::debug!("[ftp:{}] ABOR pending, not opening a data connection", self.id);
            pending.abort();
            return;
        }
        let target = match endpoint.socket_addr(self.peer.map(|p| p.ip())) {
            Some(addr) => addr,
            None => {
                pending.fail(FtpError::data_channel(
                    "No address known for the passive data connection",
                ));
                return;
            }
        };
        log::debug!("[ftp:{}] passive data connection to {}", self.id, target);
        self.queue.hold();
        self.spawn_data_connect(target);
        self.passive = Some(PassiveAttempt::new(target, pending));
    }

    fn spawn_data_connect(&self, target: SocketAddr) {
        let transport = Arc::clone(&self.transport);
        let tx = self.data_tx.clone();
        let limit = self.config.data_timeout();
        tokio::spawn(async move {
            let result = connect_data(transport, target, limit).await;
            let _ = tx.send(result);
        });
    }

    async fn on_data_connect(&mut self, result: Result<BoxedStream, DataConnectError>) {
        let mut attempt = match self.passive.take() {
            Some(a) => a,
            None => return,
        };

        if self.queue.next_is("ABOR") {
            log::debug!(
                "[ftp:{}] ABOR pending, dropping data connection to {}",
                self.id,
                attempt.target
            );
            drop(result);
            attempt.pending.abort();
            self.queue.release();
            self.dispatch().await;
            return;
        }

        match result {
            Ok(stream) => {
                let abort = Arc::new(AbortSignal::default());
                let PendingTransfer { command, signals } = attempt.pending;
                let connected = TransferSignal::Connected {
                    stream,
                    abort: Arc::clone(&abort),
                };
                if signals.send(connected).is_ok() {
                    self.active_abort = Some(abort);
                    self.queue.promote(command, Continuation::Transfer(signals));
                } else {
                    log::debug!("[ftp:{}] transfer caller went away, dropping {}", self.id, command);
                }
            }
            Err(DataConnectError::Timeout) => {
                log::warn!("[ftp:{}] data connection to {} timed out", self.id, attempt.target);
                attempt
                    .pending
                    .fail(FtpError::timeout("Timed out while making data connection"));
            }
            Err(DataConnectError::Io(e)) => {
                if let Some(retry) = attempt.retry_target(self.peer.map(|p| p.ip())) {
                    log::debug!(
                        "[ftp:{}] data connection to {} failed ({}), retrying at {}",
                        self.id,
                        attempt.target,
                        e,
                        retry
                    );
                    attempt.retried = true;
                    attempt.target = retry;
                    self.spawn_data_connect(retry);
                    self.passive = Some(attempt);
                    return;
                }
                log::warn!("[ftp:{}] data connection to {} failed: {}", self.id, attempt.target, e);
                let error = FtpError::data_channel(format!("Unable to make data connection: {}", e));
                self.queue.promote(
                    Command::new("ABOR"),
                    Continuation::AbortAfterFailure {
                        error,
                        pending: attempt.pending,
                    },
                );
            }
        }

        self.queue.release();
        self.dispatch().await;
    }

    // ── Teardown ────────────────────────────────────────────────────────

    async fn shutdown(&mut self, reason: CloseReason) {
        if self.closed {
            return;
        }
        self.closed = true;

        let failure = match &reason {
            CloseReason::Remote => FtpError::disconnected("Server closed the control connection"),
            CloseReason::Local => FtpError::disconnected("Session ended"),
            CloseReason::Failed(e) => e.clone(),
        };

        let mut had_pending = false;
        if let Some(ready) = self.ready.take() {
            had_pending = true;
            let _ = ready.send(Err(failure.clone()));
        }
        if let Some(attempt) = self.passive.take() {
            had_pending = true;
            attempt.pending.fail(failure.clone());
        }
        for queued in self.queue.drain() {
            if !matches!(queued.continuation, Continuation::Keepalive | Continuation::Handshake) {
                had_pending = true;
            }
            queued.continuation.fail(failure.clone());
        }
        self.active_abort = None;
        self.shared.set_state(SessionState::Closed);
        let _ = self.writer.shutdown().await;

        let had_error = matches!(reason, CloseReason::Failed(_));
        match reason {
            CloseReason::Remote => {
                let _ = self.events.send(SessionEvent::End);
            }
            CloseReason::Failed(e) if !had_pending => {
                let _ = self.events.send(SessionEvent::Error(e));
            }
            _ => {}
        }
        let _ = self.events.send(SessionEvent::Closed { had_error });
        log::info!("[ftp:{}] session closed", self.id);
    }
}
