//! Data-channel management for FTP transfers.
//!
//! - **Passive connect**: one attempt against the PASV/EPSV endpoint, bounded
//!   by the data timeout; a refused attempt is retried once against the control
//!   connection's peer address (NAT'd servers often advertise a private IP).
//! - **Completion**: a transfer is finished only when both the data
//!   connection has closed and the terminal control reply has arrived, in
//!   whichever order they happen.
//! - **Abort**: ABOR marks the open data channel as aborting; readers stop,
//!   the socket is closed and the outcome is [`TransferOutcome::Aborted`]
//!   instead of the resulting 426.

use crate::ftp::connection::{BoxedStream, Transport};
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::parser::{ListingContext, ListingParser};
use crate::ftp::types::{Command, Completion, ListItem, Reply, TransferOutcome};
use chrono::{Local, NaiveDateTime};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Duration};

const CHUNK_SIZE: usize = 64 * 1024;

// ─── Abort flag ──────────────────────────────────────────────────────

/// Shared between the session (which sends ABOR) and the transfer reader.
#[derive(Debug, Default)]
pub struct AbortSignal {
    aborting: AtomicBool,
    notify: Notify,
}

impl AbortSignal {
    pub fn trigger(&self) {
        self.aborting.store(true, Ordering::SeqCst);
        self.notify.notify_one();
    }

    pub fn is_aborting(&self) -> bool {
        self.aborting.load(Ordering::SeqCst)
    }

    pub async fn wait(&self) {
        if self.is_aborting() {
            return;
        }
        self.notify.notified().await;
    }
}

// ─── Session → transfer signalling ───────────────────────────────────

/// Progress of one transfer command, sent by the session.
pub(crate) enum TransferSignal {
    /// Data connection is up; the transfer command is being sent.
    Connected {
        stream: BoxedStream,
        abort: Arc<AbortSignal>,
    },
    /// Preliminary 1xx reply.
    Started(Reply),
    /// Terminal reply, or why the transfer never started.
    Finished(FtpResult<Completion>),
    /// ABOR arrived before the transfer command was sent; it never will be.
    Aborted,
}

/// A transfer command waiting for its data connection.
pub(crate) struct PendingTransfer {
    pub command: Command,
    pub signals: mpsc::UnboundedSender<TransferSignal>,
}

impl PendingTransfer {
    pub fn fail(self, error: FtpError) {
        let _ = self.signals.send(TransferSignal::Finished(Err(error)));
    }

    pub fn abort(self) {
        let _ = self.signals.send(TransferSignal::Aborted);
    }
}

// ─── Passive connect ─────────────────────────────────────────────────

#[derive(Debug)]
pub(crate) enum DataConnectError {
    Timeout,
    Io(io::Error),
}

/// Connect to a passive endpoint within `limit`. On timeout the pending
/// connect is dropped, which closes the socket.
pub(crate) async fn connect_data(
    transport: Arc<dyn Transport>,
    addr: SocketAddr,
    limit: Duration,
) -> Result<BoxedStream, DataConnectError> {
    match timeout(limit, transport.connect_data(addr)).await {
        Err(_) => Err(DataConnectError::Timeout),
        Ok(result) => result.map_err(DataConnectError::Io),
    }
}

/// The passive connect currently in progress.
pub(crate) struct PassiveAttempt {
    pub target: SocketAddr,
    pub retried: bool,
    pub pending: PendingTransfer,
}

impl PassiveAttempt {
    pub fn new(target: SocketAddr, pending: PendingTransfer) -> Self {
        Self {
            target,
            retried: false,
            pending,
        }
    }

    /// Where to retry after a failed connect: the control peer, once, and
    /// only if it differs from the address just tried.
    pub fn retry_target(&self, control_peer: Option<IpAddr>) -> Option<SocketAddr> {
        if self.retried {
            return None;
        }
        let ip = control_peer?;
        (ip != self.target.ip()).then(|| SocketAddr::new(ip, self.target.port()))
    }
}

// ─── Transfer handle ─────────────────────────────────────────────────

/// The two conditions a transfer waits for.
#[derive(Debug, Default)]
struct CompletionLatches {
    data_closed: bool,
    terminal: Option<FtpResult<Completion>>,
    data_error: Option<FtpError>,
}

impl CompletionLatches {
    fn is_complete(&self) -> bool {
        self.data_closed && self.terminal.is_some()
    }
}

/// An open data connection for RETR/STOR/APPE/LIST/MLSD.
///
/// Reading uses [`AsyncRead`]; call [`finish`](Self::finish) afterwards to
/// wait for the server's verdict.
pub struct DataTransfer {
    stream: Option<BoxedStream>,
    signals: mpsc::UnboundedReceiver<TransferSignal>,
    abort: Arc<AbortSignal>,
    latches: CompletionLatches,
    bytes: u64,
}

impl DataTransfer {
    pub(crate) fn new(
        stream: BoxedStream,
        signals: mpsc::UnboundedReceiver<TransferSignal>,
        abort: Arc<AbortSignal>,
        terminal: Option<FtpResult<Completion>>,
    ) -> Self {
        Self {
            stream: Some(stream),
            signals,
            abort,
            latches: CompletionLatches {
                terminal,
                ..CompletionLatches::default()
            },
            bytes: 0,
        }
    }

    /// A transfer that was aborted before its data connection was used.
    /// Reads see end of data and [`finish`](Self::finish) reports
    /// [`TransferOutcome::Aborted`].
    pub(crate) fn aborted(signals: mpsc::UnboundedReceiver<TransferSignal>) -> Self {
        let abort = Arc::new(AbortSignal::default());
        abort.trigger();
        Self {
            stream: None,
            signals,
            abort,
            latches: CompletionLatches {
                data_closed: true,
                terminal: Some(Err(FtpError::new(
                    FtpErrorKind::TransferFailed,
                    "Transfer aborted",
                ))),
                data_error: None,
            },
            bytes: 0,
        }
    }

    pub fn is_aborting(&self) -> bool {
        self.abort.is_aborting()
    }

    /// Bytes moved over the data connection so far.
    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }

    fn record(&mut self, signal: Option<TransferSignal>) {
        match signal {
            Some(TransferSignal::Finished(result)) => self.latches.terminal = Some(result),
            Some(TransferSignal::Started(_))
            | Some(TransferSignal::Connected { .. })
            | Some(TransferSignal::Aborted) => {}
            None => {
                self.latches.terminal = Some(Err(FtpError::disconnected(
                    "Control connection closed during transfer",
                )))
            }
        }
    }

    async fn close_data(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
        self.latches.data_closed = true;
    }

    /// Read the next chunk; 0 means the data connection is closed (end of
    /// data, abort, or socket error recorded for [`finish`](Self::finish)).
    pub(crate) async fn read_some(&mut self, buf: &mut [u8]) -> usize {
        loop {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return 0,
            };
            let terminal_pending = self.latches.terminal.is_none();
            tokio::select! {
                biased;
                _ = self.abort.wait() => {
                    self.close_data().await;
                    return 0;
                }
                signal = self.signals.recv(), if terminal_pending => {
                    self.record(signal);
                }
                read = stream.read(buf) => match read {
                    Ok(0) => {
                        self.close_data().await;
                        return 0;
                    }
                    Ok(n) => {
                        self.bytes += n as u64;
                        return n;
                    }
                    Err(e) => {
                        log::warn!("data connection read failed: {}", e);
                        self.latches.data_error = Some(FtpError::data_channel(e.to_string()));
                        self.close_data().await;
                        return 0;
                    }
                },
            }
        }
    }

    /// Write all of `data`; `false` when the transfer stopped first (abort,
    /// server-side failure, socket error).
    pub(crate) async fn write_data(&mut self, data: &[u8]) -> bool {
        let mut offset = 0;
        while offset < data.len() {
            let stream = match self.stream.as_mut() {
                Some(s) => s,
                None => return false,
            };
            let terminal_pending = self.latches.terminal.is_none();
            tokio::select! {
                biased;
                _ = self.abort.wait() => {
                    self.close_data().await;
                    return false;
                }
                signal = self.signals.recv(), if terminal_pending => {
                    self.record(signal);
                    if matches!(self.latches.terminal, Some(Err(_))) {
                        self.close_data().await;
                        return false;
                    }
                }
                written = stream.write(&data[offset..]) => match written {
                    Ok(0) => {
                        self.latches.data_error = Some(FtpError::data_channel("Data connection closed by server"));
                        self.close_data().await;
                        return false;
                    }
                    Ok(n) => {
                        offset += n;
                        self.bytes += n as u64;
                    }
                    Err(e) => {
                        log::warn!("data connection write failed: {}", e);
                        self.latches.data_error = Some(FtpError::data_channel(e.to_string()));
                        self.close_data().await;
                        return false;
                    }
                },
            }
        }
        true
    }

    /// Copy the remaining data into `writer`.
    pub async fn copy_to<W: AsyncWrite + Unpin>(&mut self, writer: &mut W) -> FtpResult<u64> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = self.read_some(&mut buf).await;
            if n == 0 {
                break;
            }
            writer.write_all(&buf[..n]).await?;
            total += n as u64;
        }
        writer.flush().await?;
        Ok(total)
    }

    /// Send everything `reader` yields over the data connection.
    pub async fn copy_from<R: AsyncRead + Unpin>(&mut self, reader: &mut R) -> FtpResult<u64> {
        let mut buf = vec![0u8; CHUNK_SIZE];
        let mut total = 0u64;
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            if !self.write_data(&buf[..n]).await {
                break;
            }
            total += n as u64;
        }
        Ok(total)
    }

    /// Close the data side (if still open) and wait for the terminal reply.
    pub(crate) async fn settle(&mut self) -> FtpResult<TransferOutcome> {
        if !self.latches.data_closed {
            self.close_data().await;
        }
        while self.latches.terminal.is_none() {
            let signal = self.signals.recv().await;
            self.record(signal);
        }
        debug_assert!(self.latches.is_complete());

        let terminal = self.latches.terminal.take();
        if self.abort.is_aborting() {
            return Ok(TransferOutcome::Aborted);
        }
        match terminal {
            Some(Err(e)) => Err(e),
            _ => match self.latches.data_error.take() {
                Some(e) => Err(e),
                None => Ok(TransferOutcome::Completed),
            },
        }
    }

    /// Wait for both completion conditions and report how the transfer ended.
    pub async fn finish(mut self) -> FtpResult<TransferOutcome> {
        self.settle().await
    }
}

impl AsyncRead for DataTransfer {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = &mut *self;
        if this.abort.is_aborting() {
            this.stream = None;
            this.latches.data_closed = true;
        }
        let stream = match this.stream.as_mut() {
            Some(s) => s,
            None => return Poll::Ready(Ok(())),
        };
        let before = buf.filled().len();
        match Pin::new(stream).poll_read(cx, buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len() - before;
                if n == 0 {
                    this.stream = None;
                    this.latches.data_closed = true;
                } else {
                    this.bytes += n as u64;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => {
                this.latches.data_error = Some(FtpError::data_channel(e.to_string()));
                Poll::Ready(Err(e))
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

// ─── Streaming listing ───────────────────────────────────────────────

/// Directory listing parsed line by line as it arrives.
pub struct ListStream {
    transfer: DataTransfer,
    parser: ListingParser,
    context: ListingContext,
    strict: bool,
    now: NaiveDateTime,
    pending: Vec<u8>,
    eof: bool,
    done: bool,
}

impl ListStream {
    pub(crate) fn new(
        transfer: DataTransfer,
        parser: ListingParser,
        context: ListingContext,
        strict: bool,
    ) -> Self {
        Self {
            transfer,
            parser,
            context,
            strict,
            now: Local::now().naive_local(),
            pending: Vec::new(),
            eof: false,
            done: false,
        }
    }

    /// Next listing item; `None` once the data is exhausted and the server
    /// confirmed the listing. A failed listing ends with one `Err`.
    pub async fn next(&mut self) -> Option<FtpResult<ListItem>> {
        let mut buf = vec![0u8; 8192];
        loop {
            if self.done {
                return None;
            }
            if let Some(line) = self.take_line() {
                match self.parse(&line) {
                    Some(item) => return Some(item),
                    None => continue,
                }
            }
            if self.eof {
                if !self.pending.is_empty() {
                    let rest = std::mem::take(&mut self.pending);
                    match self.parse(&rest) {
                        Some(item) => return Some(item),
                        None => continue,
                    }
                }
                self.done = true;
                return match self.transfer.settle().await {
                    Ok(_) => None,
                    Err(e) => Some(Err(e)),
                };
            }
            let n = self.transfer.read_some(&mut buf).await;
            if n == 0 {
                self.eof = true;
            } else {
                self.pending.extend_from_slice(&buf[..n]);
            }
        }
    }

    /// Drain the whole listing.
    pub async fn collect_all(mut self) -> FtpResult<Vec<ListItem>> {
        let mut items = Vec::new();
        while let Some(item) = self.next().await {
            items.push(item?);
        }
        Ok(items)
    }

    pub fn is_aborting(&self) -> bool {
        self.transfer.is_aborting()
    }

    fn take_line(&mut self) -> Option<Vec<u8>> {
        let pos = self.pending.iter().position(|b| *b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=pos).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(line)
    }

    fn parse(&self, line: &[u8]) -> Option<FtpResult<ListItem>> {
        let text = String::from_utf8_lossy(line);
        let item = self.parser.parse_line_at(&text, self.context, self.now)?;
        if self.context == ListingContext::Mlsd {
            if let ListItem::Entry(entry) = &item {
                let kind = entry.facts.get("type").map(|t| t.to_lowercase());
                if matches!(kind.as_deref(), Some("cdir") | Some("pdir")) {
                    return None;
                }
            }
        }
        match item {
            ListItem::Raw(raw) if self.strict => Some(Err(FtpError::parse_error(format!(
                "Unrecognised listing line: {}",
                raw
            )))),
            item => Some(Ok(item)),
        }
    }
}
