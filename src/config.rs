use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::types::{Instrument, Timeframe};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("cannot parse {path}: {source}")]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
    #[error("invalid configuration: {}", .0.join("; "))]
    Invalid(Vec<String>),
    #[error("missing credential {0} (run `setup` or set it in the environment)")]
    MissingCredential(&'static str),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BotConfig {
    /// Market to trade, e.g. `ETH-USD`.
    pub instrument: Instrument,
    pub timeframe: Timeframe,
    /// Breakout confirmation: forming-candle volume must reach this multiple
    /// of the rolling average.
    pub volume_factor: Decimal,
    /// Sealed-candle lookback for the resistance level.
    pub resistance_periods: usize,
    /// Sealed-candle lookback for the average volume.
    pub volume_lookback: usize,
    /// Take-profit distance as a multiple of the entry risk.
    pub risk_reward_ratio: Decimal,
    /// Stop placement below the broken resistance, as a fraction.
    pub stop_offset_pct: Decimal,
    /// Default notional per entry.
    pub position_size_usd: Decimal,
    /// Hard cap per entry.
    pub max_position_size_usd: Decimal,
    pub max_daily_loss_usd: Decimal,
    pub max_drawdown_pct: Decimal,
    /// Required free collateral is `size_usd / max_leverage`.
    pub max_leverage: Decimal,
    pub update_interval_s: u64,
    pub simulation_mode: bool,

    pub snapshot_interval_s: u64,
    /// Candles fetched per snapshot.
    pub candle_history: u32,
    /// Venue base-unit step; order sizes round down to it.
    pub lot_size: Decimal,
    /// Simulated account seed, honoured only in simulation mode.
    pub initial_equity_usd: Decimal,
    pub order_timeout_s: u64,
    pub query_timeout_s: u64,
    pub shutdown_grace_s: u64,
    /// Directory for trades.jsonl, performance.json and bot_state.json.
    pub data_dir: PathBuf,
    /// Persist an open position instead of closing it on shutdown.
    pub keep_position_on_shutdown: bool,
}

impl Default for BotConfig {
    fn default() -> Self {
        Self {
            instrument: Instrument::from("ETH-USD"),
            timeframe: Timeframe::M5,
            volume_factor: dec!(2.0),
            resistance_periods: 24,
            volume_lookback: 20,
            risk_reward_ratio: dec!(3.0),
            stop_offset_pct: dec!(0.01),
            position_size_usd: dec!(100),
            max_position_size_usd: dec!(500),
            max_daily_loss_usd: dec!(50),
            max_drawdown_pct: dec!(10),
            max_leverage: dec!(5),
            update_interval_s: 30,
            simulation_mode: true,
            snapshot_interval_s: 60,
            candle_history: 120,
            lot_size: dec!(0.001),
            initial_equity_usd: dec!(10000),
            order_timeout_s: 10,
            query_timeout_s: 5,
            shutdown_grace_s: 15,
            data_dir: PathBuf::from("."),
            keep_position_on_shutdown: false,
        }
    }
}

impl BotConfig {
    /// Load from a TOML file. A missing file at the default path falls back
    /// to defaults; an explicitly requested file must exist.
    pub fn load(path: &Path, required: bool) -> Result<Self, ConfigError> {
        let raw = match std::fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound && !required => {
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.volume_factor <= Decimal::ZERO {
            errors.push("volume_factor must be > 0".to_string());
        }
        if self.resistance_periods == 0 {
            errors.push("resistance_periods must be > 0".to_string());
        }
        if self.volume_lookback == 0 {
            errors.push("volume_lookback must be > 0".to_string());
        }
        if self.risk_reward_ratio < Decimal::ONE {
            errors.push("risk_reward_ratio must be >= 1".to_string());
        }
        if self.stop_offset_pct <= Decimal::ZERO || self.stop_offset_pct >= Decimal::ONE {
            errors.push("stop_offset_pct must be between 0 and 1".to_string());
        }
        if self.position_size_usd <= Decimal::ZERO {
            errors.push("position_size_usd must be > 0".to_string());
        }
        if self.max_position_size_usd < self.position_size_usd {
            errors.push("max_position_size_usd must be >= position_size_usd".to_string());
        }
        if self.max_daily_loss_usd <= Decimal::ZERO {
            errors.push("max_daily_loss_usd must be > 0".to_string());
        }
        if self.max_drawdown_pct <= Decimal::ZERO || self.max_drawdown_pct > dec!(100) {
            errors.push("max_drawdown_pct must be between 0 and 100".to_string());
        }
        if self.max_leverage < Decimal::ONE {
            errors.push("max_leverage must be >= 1".to_string());
        }
        if self.update_interval_s == 0 {
            errors.push("update_interval_s must be > 0".to_string());
        }
        if self.lot_size <= Decimal::ZERO {
            errors.push("lot_size must be > 0".to_string());
        }
        if self.initial_equity_usd <= Decimal::ZERO {
            errors.push("initial_equity_usd must be > 0".to_string());
        }
        if self.candle_history < self.resistance_periods.max(self.volume_lookback) as u32 {
            errors.push("candle_history must cover the longest lookback".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }
}

/// Credentials for the venue, sourced from the environment (`.env` friendly).
#[derive(Debug, Clone)]
pub struct VenueCredentials {
    pub address: String,
    pub subaccount: u32,
    pub api_key: String,
    pub api_secret: String,
}

impl VenueCredentials {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let address = std::env::var("DYDX_ADDRESS")
            .map_err(|_| ConfigError::MissingCredential("DYDX_ADDRESS"))?;
        let subaccount = std::env::var("DYDX_SUBACCOUNT")
            .ok()
            .and_then(|s| s.parse().ok())
            .unwrap_or(0);
        let api_key = std::env::var("DYDX_API_KEY")
            .map_err(|_| ConfigError::MissingCredential("DYDX_API_KEY"))?;
        let api_secret = std::env::var("DYDX_API_SECRET")
            .map_err(|_| ConfigError::MissingCredential("DYDX_API_SECRET"))?;

        Ok(Self {
            address,
            subaccount,
            api_key,
            api_secret,
        })
    }

    /// Market-data-only credentials: the indexer surface is public, so
    /// simulation mode runs without keys.
    pub fn public_only() -> Self {
        Self {
            address: String::new(),
            subaccount: 0,
            api_key: String::new(),
            api_secret: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        assert!(BotConfig::default().validate().is_ok());
    }

    #[test]
    fn validate_collects_every_violation() {
        let cfg = BotConfig {
            volume_factor: dec!(0),
            resistance_periods: 0,
            stop_offset_pct: dec!(2),
            ..BotConfig::default()
        };
        match cfg.validate() {
            Err(ConfigError::Invalid(errors)) => assert_eq!(errors.len(), 3),
            other => panic!("expected Invalid, got {:?}", other.err()),
        }
    }

    #[test]
    fn toml_round_trip_keeps_timeframe_vocabulary() {
        let cfg = BotConfig {
            timeframe: Timeframe::H4,
            ..BotConfig::default()
        };
        let raw = toml::to_string(&cfg).unwrap();
        assert!(raw.contains("timeframe = \"4h\""));
        let back: BotConfig = toml::from_str(&raw).unwrap();
        assert_eq!(back.timeframe, Timeframe::H4);
    }
}
