//! File transfers: RETR, STOR, APPE.

use crate::ftp::client::FtpClient;
use crate::ftp::error::{FtpError, FtpErrorKind, FtpResult};
use crate::ftp::session::SessionRequest;
use crate::ftp::transfer::{DataTransfer, TransferSignal};
use crate::ftp::types::*;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

impl FtpClient {
    /// Negotiate a passive data connection, send `command` and wait until
    /// the server has accepted it (1xx) or already finished it.
    pub(crate) async fn open_transfer(&self, command: Command) -> FtpResult<DataTransfer> {
        self.ensure_authorized()?;
        log::debug!("[ftp:{}] opening data connection for {}", self.id, command);
        let (signals, mut rx) = mpsc::unbounded_channel();
        self.submit(SessionRequest::Transfer { command, signals })?;

        let (stream, abort) = match rx.recv().await {
            Some(TransferSignal::Connected { stream, abort }) => (stream, abort),
            Some(TransferSignal::Aborted) => {
                log::debug!("[ftp:{}] transfer aborted before it started", self.id);
                return Ok(DataTransfer::aborted(rx));
            }
            Some(TransferSignal::Finished(Err(e))) => return Err(e.with_session(&self.id)),
            Some(_) => {
                return Err(FtpError::invalid_state("Transfer reply before data connection")
                    .with_session(&self.id))
            }
            None => return Err(self.closed_error()),
        };

        match rx.recv().await {
            Some(TransferSignal::Started(reply)) => {
                log::debug!("[ftp:{}] transfer started: {} {}", self.id, reply.code, reply.text);
                Ok(DataTransfer::new(stream, rx, abort, None))
            }
            Some(TransferSignal::Finished(Ok(done))) => {
                Ok(DataTransfer::new(stream, rx, abort, Some(Ok(done))))
            }
            Some(TransferSignal::Finished(Err(e))) => Err(e.with_session(&self.id)),
            Some(TransferSignal::Aborted) => Ok(DataTransfer::aborted(rx)),
            Some(TransferSignal::Connected { .. }) => Err(FtpError::invalid_state(
                "Data connection opened twice",
            )
            .with_session(&self.id)),
            None => Err(self.closed_error()),
        }
    }

    // ─── RETR ────────────────────────────────────────────────────

    /// Start a download; read the returned transfer, then `finish()` it.
    pub async fn get(&self, path: &str) -> FtpResult<DataTransfer> {
        self.open_transfer(Command::with_arg("RETR", path)).await
    }

    /// Download `path` into `writer`; returns the byte count.
    pub async fn get_into<W: AsyncWrite + Unpin>(&self, path: &str, writer: &mut W) -> FtpResult<u64> {
        let mut transfer = self.get(path).await?;
        let copied = transfer.copy_to(writer).await;
        let outcome = transfer.finish().await;
        self.conclude(path, copied?, outcome)
    }

    // ─── STOR / APPE ─────────────────────────────────────────────

    /// Upload everything `reader` yields to `path`, replacing it.
    pub async fn put<R: AsyncRead + Unpin>(&self, reader: &mut R, path: &str) -> FtpResult<u64> {
        self.upload(Command::with_arg("STOR", path), reader, path).await
    }

    /// Upload, appending to `path`.
    pub async fn append<R: AsyncRead + Unpin>(&self, reader: &mut R, path: &str) -> FtpResult<u64> {
        self.upload(Command::with_arg("APPE", path), reader, path).await
    }

    async fn upload<R: AsyncRead + Unpin>(
        &self,
        command: Command,
        reader: &mut R,
        path: &str,
    ) -> FtpResult<u64> {
        let mut transfer = self.open_transfer(command).await?;
        let copied = transfer.copy_from(reader).await;
        let outcome = transfer.finish().await;
        self.conclude(path, copied?, outcome)
    }

    fn conclude(
        &self,
        path: &str,
        bytes: u64,
        outcome: FtpResult<TransferOutcome>,
    ) -> FtpResult<u64> {
        match outcome.map_err(|e| e.with_session(&self.id))? {
            TransferOutcome::Completed => {
                log::debug!("[ftp:{}] {} bytes transferred for {}", self.id, bytes, path);
                Ok(bytes)
            }
            TransferOutcome::Aborted => Err(FtpError::new(
                FtpErrorKind::TransferFailed,
                format!("Transfer of {} aborted after {} bytes", path, bytes),
            )
            .with_session(&self.id)),
        }
    }
}
