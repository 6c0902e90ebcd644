// =============================================================================
// Trade Journal — append-only JSON-lines record of entry opens and closes
// =============================================================================
//
// The engine is stateless across restarts: the exchange snapshot is the
// source of truth and reconciliation rebuilds the ledger from it. The
// journal exists for diagnostics and audit — one line per ledger mutation,
// flushed immediately, never rewritten.
// =============================================================================

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::ledger::{Entry, LegKey};
use crate::types::{epoch_secs, Side};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JournalAction {
    Open,
    Close,
}

/// One journal line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JournalRecord {
    pub ts: f64,
    pub action: JournalAction,
    pub ledger_id: String,
    pub symbol: String,
    pub interval: String,
    pub side: Side,
    pub qty: f64,
    #[serde(default)]
    pub entry_price: Option<f64>,
    #[serde(default)]
    pub margin_usdt: Option<f64>,
    #[serde(default)]
    pub signature: Option<Vec<String>>,
    #[serde(default)]
    pub reason: Option<String>,
}

pub struct TradeJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl TradeJournal {
    /// Open (or create) the journal at `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open journal at {}", path.display()))?;
        debug!(path = %path.display(), "trade journal opened");
        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    fn append(&self, record: &JournalRecord) {
        let line = match serde_json::to_string(record) {
            Ok(l) => l,
            Err(err) => {
                warn!(error = %err, "journal record serialisation failed");
                return;
            }
        };
        let mut file = self.file.lock();
        if let Err(err) = writeln!(file, "{line}").and_then(|_| file.flush()) {
            warn!(path = %self.path.display(), error = %err, "journal append failed");
        }
    }

    /// Record a freshly acked entry.
    pub fn record_open(&self, leg_key: &LegKey, entry: &Entry) {
        self.append(&JournalRecord {
            ts: epoch_secs(),
            action: JournalAction::Open,
            ledger_id: entry.ledger_id.clone(),
            symbol: leg_key.symbol.clone(),
            interval: leg_key.interval.clone(),
            side: leg_key.side,
            qty: entry.qty,
            entry_price: Some(entry.entry_price),
            margin_usdt: Some(entry.margin_usdt),
            signature: Some(entry.trigger_signature.clone()),
            reason: None,
        });
    }

    /// Record a confirmed close of `qty` against an entry.
    pub fn record_close(&self, leg_key: &LegKey, ledger_id: &str, qty: f64, reason: &str) {
        self.append(&JournalRecord {
            ts: epoch_secs(),
            action: JournalAction::Close,
            ledger_id: ledger_id.to_string(),
            symbol: leg_key.symbol.clone(),
            interval: leg_key.interval.clone(),
            side: leg_key.side,
            qty,
            entry_price: None,
            margin_usdt: None,
            signature: None,
            reason: Some(reason.to_string()),
        });
    }

    /// Read every parseable record back (diagnostics). Unparseable lines are
    /// skipped with a warning.
    pub fn replay(path: impl AsRef<Path>) -> Result<Vec<JournalRecord>> {
        let path = path.as_ref();
        let file =
            File::open(path).with_context(|| format!("failed to read {}", path.display()))?;
        let mut out = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(&line) {
                Ok(record) => out.push(record),
                Err(err) => warn!(lineno, error = %err, "skipping corrupt journal line"),
            }
        }
        Ok(out)
    }
}

impl std::fmt::Debug for TradeJournal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TradeJournal")
            .field("path", &self.path)
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "meridian-journal-{tag}-{}.jsonl",
            uuid::Uuid::new_v4()
        ))
    }

    fn sample_entry() -> Entry {
        Entry {
            ledger_id: "abc".into(),
            qty: 0.005,
            entry_price: 20_000.0,
            leverage: 5,
            margin_usdt: 20.0,
            trigger_signature: vec!["rsi".into(), "slot0".into()],
            indicator_keys: vec!["rsi".into()],
            timestamp: epoch_secs(),
            fees_usdt: None,
            entry_realized_usdt: None,
        }
    }

    #[test]
    fn open_close_roundtrip() {
        let path = temp_path("roundtrip");
        let journal = TradeJournal::open(&path).unwrap();
        let key = LegKey::new("BTCUSDT", "1m", Side::Buy);

        journal.record_open(&key, &sample_entry());
        journal.record_close(&key, "abc", 0.005, "per_trade_stop_loss");

        let records = TradeJournal::replay(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].action, JournalAction::Open);
        assert_eq!(records[0].ledger_id, "abc");
        assert_eq!(records[1].action, JournalAction::Close);
        assert_eq!(records[1].reason.as_deref(), Some("per_trade_stop_loss"));

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn replay_skips_corrupt_lines() {
        let path = temp_path("corrupt");
        std::fs::write(
            &path,
            "not json\n{\"ts\":1.0,\"action\":\"open\",\"ledger_id\":\"x\",\"symbol\":\"BTCUSDT\",\"interval\":\"1m\",\"side\":\"Buy\",\"qty\":0.005}\n",
        )
        .unwrap();
        let records = TradeJournal::replay(&path).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].ledger_id, "x");
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn append_mode_preserves_existing() {
        let path = temp_path("append");
        {
            let journal = TradeJournal::open(&path).unwrap();
            journal.record_open(&LegKey::new("BTCUSDT", "1m", Side::Buy), &sample_entry());
        }
        {
            let journal = TradeJournal::open(&path).unwrap();
            journal.record_close(
                &LegKey::new("BTCUSDT", "1m", Side::Buy),
                "abc",
                0.005,
                "indicator_flip",
            );
        }
        assert_eq!(TradeJournal::replay(&path).unwrap().len(), 2);
        std::fs::remove_file(&path).ok();
    }
}
