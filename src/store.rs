use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::types::{Position, Trade};

const TRADES_FILE: &str = "trades.jsonl";
const PERFORMANCE_FILE: &str = "performance.json";
const STATE_FILE: &str = "bot_state.json";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Aggregate performance over all recorded trades.
///
/// `profit_factor` is `None` when gross profit exists with zero gross loss
/// (unbounded); with no wins and no losses it reports zero.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TradeMetrics {
    pub total_trades: u64,
    pub total_pnl: Decimal,
    pub win_rate: Decimal,
    pub avg_win: Decimal,
    pub avg_loss: Decimal,
    pub profit_factor: Option<Decimal>,
    pub max_drawdown: Decimal,
}

impl TradeMetrics {
    pub fn from_trades(trades: &[Trade]) -> Self {
        let total_trades = trades.len() as u64;
        let total_pnl: Decimal = trades.iter().map(|t| t.pnl_usd).sum();

        let wins: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.is_win())
            .map(|t| t.pnl_usd)
            .collect();
        let losses: Vec<Decimal> = trades
            .iter()
            .filter(|t| t.pnl_usd < Decimal::ZERO)
            .map(|t| t.pnl_usd)
            .collect();

        let win_rate = if total_trades > 0 {
            Decimal::from(wins.len() as u64) / Decimal::from(total_trades) * dec!(100)
        } else {
            Decimal::ZERO
        };

        let avg_win = if wins.is_empty() {
            Decimal::ZERO
        } else {
            wins.iter().copied().sum::<Decimal>() / Decimal::from(wins.len() as u64)
        };
        let avg_loss = if losses.is_empty() {
            Decimal::ZERO
        } else {
            losses.iter().copied().sum::<Decimal>() / Decimal::from(losses.len() as u64)
        };

        let gross_profit: Decimal = wins.iter().copied().sum();
        let gross_loss: Decimal = losses.iter().map(|p| p.abs()).sum();
        let profit_factor = if gross_loss > Decimal::ZERO {
            Some(gross_profit / gross_loss)
        } else if gross_profit > Decimal::ZERO {
            None
        } else {
            Some(Decimal::ZERO)
        };

        // Largest peak-to-trough decline of the cumulative PnL series.
        let mut cumulative = Decimal::ZERO;
        let mut peak = Decimal::ZERO;
        let mut max_drawdown = Decimal::ZERO;
        for trade in trades {
            cumulative += trade.pnl_usd;
            if cumulative > peak {
                peak = cumulative;
            }
            let drawdown = peak - cumulative;
            if drawdown > max_drawdown {
                max_drawdown = drawdown;
            }
        }

        Self {
            total_trades,
            total_pnl,
            win_rate,
            avg_win,
            avg_loss,
            profit_factor,
            max_drawdown,
        }
    }
}

/// Append-only trade log plus derived state files.
///
/// `trades.jsonl` holds one record per line, flushed per append. Reads
/// tolerate a truncated final record. `performance.json` is overwritten with
/// fresh metrics after every append. In-memory records are the metrics
/// source, so a failed disk append degrades persistence but never the
/// numbers; unwritten lines are retried on the next append.
pub struct TradeStore {
    trades_path: PathBuf,
    performance_path: PathBuf,
    state_path: PathBuf,
    file: Mutex<File>,
    cache: Mutex<Vec<Trade>>,
    pending: Mutex<Vec<String>>,
}

impl TradeStore {
    pub fn open(dir: &Path) -> Result<Self, StoreError> {
        std::fs::create_dir_all(dir)?;
        let trades_path = dir.join(TRADES_FILE);
        let cache = read_trades(&trades_path);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&trades_path)?;

        Ok(Self {
            trades_path,
            performance_path: dir.join(PERFORMANCE_FILE),
            state_path: dir.join(STATE_FILE),
            file: Mutex::new(file),
            cache: Mutex::new(cache),
            pending: Mutex::new(Vec::new()),
        })
    }

    pub fn append(&self, trade: &Trade) -> Result<(), StoreError> {
        self.cache.lock().unwrap().push(trade.clone());

        let line = serde_json::to_string(trade)?;
        self.pending.lock().unwrap().push(line);
        let persisted = self.flush_pending();

        if let Err(e) = self.write_performance() {
            warn!(error = %e, "failed to refresh performance snapshot");
        }
        persisted
    }

    fn flush_pending(&self) -> Result<(), StoreError> {
        let mut pending = self.pending.lock().unwrap();
        let mut file = self.file.lock().unwrap();
        while !pending.is_empty() {
            write_line(&mut file, &pending[0])?;
            pending.remove(0);
        }
        Ok(())
    }

    pub fn load_all(&self) -> Vec<Trade> {
        self.cache.lock().unwrap().clone()
    }

    pub fn metrics(&self) -> TradeMetrics {
        TradeMetrics::from_trades(&self.cache.lock().unwrap())
    }

    pub fn write_performance(&self) -> Result<(), StoreError> {
        let metrics = self.metrics();
        let json = serde_json::to_string_pretty(&metrics)?;
        std::fs::write(&self.performance_path, json)?;
        Ok(())
    }

    /// Persist the open position for a restart-with-open-position workflow.
    pub fn save_open_position(&self, position: &Position) -> Result<(), StoreError> {
        let json = serde_json::to_string_pretty(position)?;
        std::fs::write(&self.state_path, json)?;
        Ok(())
    }

    pub fn load_open_position(&self) -> Option<Position> {
        let raw = std::fs::read_to_string(&self.state_path).ok()?;
        match serde_json::from_str(&raw) {
            Ok(position) => Some(position),
            Err(e) => {
                warn!(error = %e, path = %self.state_path.display(), "unreadable bot state ignored");
                None
            }
        }
    }

    pub fn clear_open_position(&self) {
        if self.state_path.exists() {
            if let Err(e) = std::fs::remove_file(&self.state_path) {
                warn!(error = %e, "failed to remove bot state file");
            }
        }
    }

    pub fn flush(&self) -> Result<(), StoreError> {
        self.flush_pending()?;
        self.file.lock().unwrap().sync_all()?;
        Ok(())
    }

    pub fn trades_path(&self) -> &Path {
        &self.trades_path
    }
}

fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes())?;
    file.write_all(b"\n")?;
    file.flush()
}

fn read_trades(path: &Path) -> Vec<Trade> {
    let raw = match std::fs::read_to_string(path) {
        Ok(raw) => raw,
        Err(_) => return Vec::new(),
    };

    let lines: Vec<&str> = raw.lines().collect();
    let mut trades = Vec::with_capacity(lines.len());
    for (index, line) in lines.iter().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Trade>(line) {
            Ok(trade) => trades.push(trade),
            Err(e) if index == lines.len() - 1 => {
                // A torn final record means the process died mid-write.
                debug!(error = %e, "dropping truncated final trade record");
            }
            Err(e) => {
                warn!(error = %e, line = index + 1, "skipping unreadable trade record");
            }
        }
    }
    trades
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{ExitReason, Instrument, Position, PositionSide};
    use chrono::{TimeZone, Utc};
    use rust_decimal_macros::dec;

    fn temp_dir() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("breakout-store-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn trade(pnl: Decimal) -> Trade {
        let opened = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
        Position {
            instrument: Instrument::from("ETH-USD"),
            side: PositionSide::Long,
            entry_price: dec!(100),
            size_base: Decimal::ONE,
            size_usd: dec!(100),
            stop_loss: dec!(99),
            take_profit: dec!(107),
            opened_at: opened,
            client_order_id: "c".to_string(),
            reasoning: "test".to_string(),
        }
        .into_trade(dec!(100) + pnl, ExitReason::TakeProfit, opened + chrono::Duration::hours(1))
    }

    #[test]
    fn replaying_the_log_reproduces_identical_metrics() {
        let dir = temp_dir();
        let store = TradeStore::open(&dir).unwrap();
        for pnl in [dec!(6), dec!(-2), dec!(10), dec!(-4), dec!(1.5)] {
            store.append(&trade(pnl)).unwrap();
        }
        let original = store.metrics();
        drop(store);

        let reloaded = TradeStore::open(&dir).unwrap();
        assert_eq!(reloaded.load_all().len(), 5);
        assert_eq!(reloaded.metrics(), original);
    }

    #[test]
    fn existing_records_are_never_rewritten() {
        let dir = temp_dir();
        let store = TradeStore::open(&dir).unwrap();
        store.append(&trade(dec!(5))).unwrap();
        let before = std::fs::read(store.trades_path()).unwrap();

        store.append(&trade(dec!(-3))).unwrap();
        let after = std::fs::read(store.trades_path()).unwrap();

        assert!(after.len() > before.len());
        assert_eq!(&after[..before.len()], &before[..]);
    }

    #[test]
    fn truncated_final_record_is_dropped_silently() {
        let dir = temp_dir();
        {
            let store = TradeStore::open(&dir).unwrap();
            store.append(&trade(dec!(5))).unwrap();
            store.append(&trade(dec!(-2))).unwrap();
        }

        // Tear the last record in half, as a crash mid-write would.
        let path = dir.join(TRADES_FILE);
        let raw = std::fs::read_to_string(&path).unwrap();
        let torn = &raw[..raw.len() - 20];
        std::fs::write(&path, torn).unwrap();

        let store = TradeStore::open(&dir).unwrap();
        let trades = store.load_all();
        assert_eq!(trades.len(), 1);
        assert_eq!(trades[0].pnl_usd, dec!(5));
    }

    #[test]
    fn metrics_formulas() {
        let trades: Vec<Trade> = [dec!(10), dec!(-5), dec!(20), dec!(-15), dec!(2)]
            .into_iter()
            .map(trade)
            .collect();
        let metrics = TradeMetrics::from_trades(&trades);

        assert_eq!(metrics.total_trades, 5);
        assert_eq!(metrics.total_pnl, dec!(12));
        assert_eq!(metrics.win_rate, dec!(60));
        assert_eq!(metrics.avg_win, dec!(32) / dec!(3));
        assert_eq!(metrics.avg_loss, dec!(-10));
        assert_eq!(metrics.profit_factor, Some(dec!(1.6)));
        // Cumulative path: 10, 5, 25, 10, 12 — worst decline is 25 → 10.
        assert_eq!(metrics.max_drawdown, dec!(15));
    }

    #[test]
    fn profit_factor_edge_cases() {
        assert_eq!(
            TradeMetrics::from_trades(&[]).profit_factor,
            Some(Decimal::ZERO)
        );
        // All winners: unbounded.
        let wins: Vec<Trade> = [dec!(5), dec!(3)].into_iter().map(trade).collect();
        assert_eq!(TradeMetrics::from_trades(&wins).profit_factor, None);
        // Breakeven-only trades: zero gross both sides.
        let flat: Vec<Trade> = [dec!(0)].into_iter().map(trade).collect();
        assert_eq!(
            TradeMetrics::from_trades(&flat).profit_factor,
            Some(Decimal::ZERO)
        );
    }

    #[test]
    fn performance_snapshot_follows_every_append() {
        let dir = temp_dir();
        let store = TradeStore::open(&dir).unwrap();
        store.append(&trade(dec!(7))).unwrap();

        let raw = std::fs::read_to_string(dir.join(PERFORMANCE_FILE)).unwrap();
        let snapshot: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(snapshot["total_trades"], 1);
        assert_eq!(snapshot["total_pnl"], serde_json::json!("7"));
    }

    #[test]
    fn open_position_round_trips_through_bot_state() {
        let dir = temp_dir();
        let store = TradeStore::open(&dir).unwrap();
        assert!(store.load_open_position().is_none());

        let position = Position {
            instrument: Instrument::from("ETH-USD"),
            side: PositionSide::Long,
            entry_price: dec!(101),
            size_base: dec!(0.99),
            size_usd: dec!(99.99),
            stop_loss: dec!(99),
            take_profit: dec!(107),
            opened_at: Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap(),
            client_order_id: "c-1".to_string(),
            reasoning: "breakout".to_string(),
        };
        store.save_open_position(&position).unwrap();
        assert_eq!(store.load_open_position(), Some(position));

        store.clear_open_position();
        assert!(store.load_open_position().is_none());
    }
}
