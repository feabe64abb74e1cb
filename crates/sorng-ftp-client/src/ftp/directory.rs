//! Directory operations: list, MLSD/MLST, mkdir, rmdir, delete, rename,
//! SIZE and MDTM.

use crate::ftp::client::{expect_path, FtpClient};
use crate::ftp::error::{FtpError, FtpResult};
use crate::ftp::parser::{parse_mlsd_entry, ListingContext, ListingParser};
use crate::ftp::protocol::{parse_mdtm, parse_size};
use crate::ftp::transfer::ListStream;
use crate::ftp::types::*;
use chrono::{DateTime, Utc};

fn with_path(verb: &str, path: Option<&str>) -> Command {
    match path {
        Some(p) if !p.is_empty() => Command::with_arg(verb, p),
        _ => Command::new(verb),
    }
}

impl FtpClient {
    fn listing_parser(&self) -> ListingParser {
        ListingParser::new(self.config.date_heuristics)
    }

    // ─── LIST ────────────────────────────────────────────────────

    /// Full LIST output, parsed. Unrecognised lines come back as
    /// [`ListItem::Raw`] unless `strict_listing` is set.
    pub async fn list(&self, path: Option<&str>) -> FtpResult<Vec<ListItem>> {
        self.list_stream(path).await?.collect_all().await
    }

    /// LIST with entries parsed as the data arrives.
    pub async fn list_stream(&self, path: Option<&str>) -> FtpResult<ListStream> {
        let transfer = self.open_transfer(with_path("LIST", path)).await?;
        Ok(ListStream::new(
            transfer,
            self.listing_parser(),
            ListingContext::List,
            self.config.strict_listing,
        ))
    }

    // ─── MLSD / MLST ─────────────────────────────────────────────

    /// Machine-readable listing. `.` and `..` (cdir/pdir) are left out.
    pub async fn mlsd(&self, path: Option<&str>) -> FtpResult<Vec<ListItem>> {
        self.mlsd_stream(path).await?.collect_all().await
    }

    pub async fn mlsd_stream(&self, path: Option<&str>) -> FtpResult<ListStream> {
        self.ensure_authorized()?;
        if !self.features().supports_mlsd() {
            return Err(FtpError::unsupported("Server does not support MLSD").with_session(&self.id));
        }
        let transfer = self.open_transfer(with_path("MLSD", path)).await?;
        Ok(ListStream::new(
            transfer,
            self.listing_parser(),
            ListingContext::Mlsd,
            self.config.strict_listing,
        ))
    }

    /// Facts for a single path, sent over the control connection.
    pub async fn mlst(&self, path: &str) -> FtpResult<ListingEntry> {
        self.ensure_authorized()?;
        self.require_feature("MLST")?;
        let reply = self.execute(Command::with_arg("MLST", path)).await?;
        reply
            .text
            .lines()
            .skip(1)
            .map(str::trim_start)
            .find_map(parse_mlsd_entry)
            .ok_or_else(|| {
                FtpError::parse_error(format!("No facts in MLST reply: {}", reply.text))
                    .with_session(&self.id)
            })
    }

    // ─── MKD / RMD / DELE ────────────────────────────────────────

    /// Create a directory; returns the path the server reports.
    pub async fn mkdir(&self, path: &str) -> FtpResult<String> {
        let reply = self.execute(Command::with_arg("MKD", path)).await?;
        expect_path(reply)
    }

    pub async fn rmdir(&self, path: &str) -> FtpResult<()> {
        self.execute(Command::with_arg("RMD", path)).await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> FtpResult<()> {
        self.execute(Command::with_arg("DELE", path)).await?;
        Ok(())
    }

    // ─── RNFR / RNTO ─────────────────────────────────────────────

    /// RNFR `from`, and after its 350 RNTO `to` with nothing in between.
    pub async fn rename(&self, from: &str, to: &str) -> FtpResult<()> {
        log::debug!("[ftp:{}] rename {} -> {}", self.id, from, to);
        self.execute_pair(
            Command::with_arg("RNFR", from),
            Command::with_arg("RNTO", to),
        )
        .await?;
        Ok(())
    }

    // ─── SIZE / MDTM ─────────────────────────────────────────────

    pub async fn size(&self, path: &str) -> FtpResult<u64> {
        self.ensure_authorized()?;
        self.require_feature("SIZE")?;
        let reply = self.execute(Command::with_arg("SIZE", path)).await?;
        parse_size(&reply.text).map_err(|e| e.with_session(&self.id))
    }

    /// Modification time (MDTM), in UTC.
    pub async fn last_mod(&self, path: &str) -> FtpResult<DateTime<Utc>> {
        self.ensure_authorized()?;
        self.require_feature("MDTM")?;
        let reply = self.execute(Command::with_arg("MDTM", path)).await?;
        parse_mdtm(&reply.text).map_err(|e| e.with_session(&self.id))
    }
}
