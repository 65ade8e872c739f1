//! JSON Lines audit ledger.
//!
//! One `LedgerEntry` per line, appended and flushed on every terminal
//! transition. The file is opened in append mode so restarts keep history.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tracing::{debug, info, warn};
use upx_core::{AuditLedger, CoreError, LedgerEntry};

use crate::error::AppResult;

pub struct JsonlLedger {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
}

impl JsonlLedger {
    /// Open (or create) the ledger at `path`, creating parent directories.
    pub fn open(path: impl AsRef<Path>) -> AppResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(&path)?;
        info!(path = %path.display(), "Audit ledger opened");
        Ok(Self {
            path,
            writer: Mutex::new(BufWriter::new(file)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every entry back. Corrupt lines are skipped.
    pub fn read_all(&self) -> AppResult<Vec<LedgerEntry>> {
        let reader = BufReader::new(File::open(&self.path)?);
        let mut entries = Vec::new();
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LedgerEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => warn!(line_num = line_num + 1, error = %e, "Skipping corrupt ledger line"),
            }
        }
        Ok(entries)
    }
}

impl AuditLedger for JsonlLedger {
    fn append(&self, entry: &LedgerEntry) -> upx_core::Result<()> {
        let line = serde_json::to_string(entry)
            .map_err(|e| CoreError::Ledger(format!("serialize {}: {e}", entry.identifier)))?;

        let mut writer = self.writer.lock();
        writeln!(writer, "{line}")
            .and_then(|()| writer.flush())
            .map_err(|e| CoreError::Ledger(format!("write {}: {e}", self.path.display())))?;
        debug!(identifier = %entry.identifier, state = entry.state.as_str(), "Ledger entry appended");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rust_decimal_macros::dec;
    use tempfile::TempDir;
    use upx_core::{ClientOrderId, MarketCode, Order, OrderRequest, OrderSide, OrderState, Price, Size};

    fn entry(id: &str, state: OrderState) -> LedgerEntry {
        let request = OrderRequest::limit(
            MarketCode::new("KRW-BTC").unwrap(),
            OrderSide::Bid,
            Size::new(dec!(0.01)),
            Price::new(dec!(50000000)),
        );
        let mut order = Order::accepted(
            ClientOrderId::from_string(id),
            &request,
            Some(format!("uuid-{id}")),
            Utc::now(),
        );
        order.state = state;
        LedgerEntry::from_order(&order, Utc::now())
    }

    #[test]
    fn test_append_and_read_back() {
        let dir = TempDir::new().unwrap();
        let ledger = JsonlLedger::open(dir.path().join("nested/ledger.jsonl")).unwrap();

        ledger.append(&entry("upx-1-1", OrderState::Filled)).unwrap();
        ledger.append(&entry("upx-1-2", OrderState::Cancelled)).unwrap();

        let entries = ledger.read_all().unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].identifier.as_str(), "upx-1-1");
        assert_eq!(entries[1].state, OrderState::Cancelled);
    }

    #[test]
    fn test_reopen_appends() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");

        JsonlLedger::open(&path)
            .unwrap()
            .append(&entry("upx-1-1", OrderState::Filled))
            .unwrap();
        let reopened = JsonlLedger::open(&path).unwrap();
        reopened.append(&entry("upx-1-2", OrderState::Filled)).unwrap();

        assert_eq!(reopened.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_corrupt_line_skipped() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let ledger = JsonlLedger::open(&path).unwrap();
        ledger.append(&entry("upx-1-1", OrderState::Filled)).unwrap();
        std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"{not json\n")
            .unwrap();
        ledger.append(&entry("upx-1-2", OrderState::Filled)).unwrap();

        assert_eq!(ledger.read_all().unwrap().len(), 2);
    }
}
