//! Environment-driven configuration.
//!
//! `BROKER_URL` is required; everything else has defaults. Parsing
//! failures are fatal at startup (exit code 2).

use crate::error::ConfigError;
use crate::schema::{Exchange, Instrument};
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// Weights for the trend/exhaustion scorer. The emitted field set is the
/// contract; weights are tunable.
#[derive(Debug, Clone)]
pub struct TrendWeights {
    pub delta: f64,
    pub absorption: f64,
    pub exhaustion: f64,
}

impl Default for TrendWeights {
    fn default() -> Self {
        Self {
            delta: 0.5,
            absorption: 0.3,
            exhaustion: 0.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub broker_url: String,
    /// Symbols to ingest per exchange, from `SYMBOLS_{EXCHANGE}`.
    pub symbols: HashMap<Exchange, Vec<String>>,
    /// Top-N DOM truncation depth.
    pub dom_depth: usize,
    /// Multiplier applied to the instrument tick size to get the heatmap
    /// price bin. Single source of truth for bin sizing.
    pub heatmap_bin_mult: Decimal,
    pub footprint_bar_ms: i64,
    pub imbalance_ratio: Decimal,
    pub iceberg_k: Decimal,
    pub iceberg_r: u32,
    pub iceberg_window_ms: i64,
    pub wall_x: Decimal,
    pub wall_t1_ms: i64,
    pub spoof_t2_ms: i64,
    pub tape_large_mult: Decimal,
    pub trend_weights: TrendWeights,
    /// Analytics worker kinds to launch, from `WORKERS`.
    pub workers: Vec<String>,
    pub gateway_port: u16,
    pub metrics_port: u16,
    pub health_port: u16,
}

/// Every analytics worker kind, in launch order.
pub const ALL_WORKERS: [&str; 6] = [
    "tape",
    "heatmap",
    "footprint",
    "iceberg",
    "wallspoof",
    "trend",
];

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let broker_url = env::var("BROKER_URL").map_err(|_| ConfigError::MissingVar("BROKER_URL"))?;

        let mut symbols = HashMap::new();
        for exchange in Exchange::ALL {
            let var = match exchange {
                Exchange::Bybit => "SYMBOLS_BYBIT",
                Exchange::Binance => "SYMBOLS_BINANCE",
                Exchange::Okx => "SYMBOLS_OKX",
            };
            if let Ok(raw) = env::var(var) {
                let list: Vec<String> = raw
                    .split(',')
                    .map(|s| s.trim().to_ascii_uppercase())
                    .filter(|s| !s.is_empty())
                    .collect();
                if !list.is_empty() {
                    symbols.insert(exchange, list);
                }
            }
        }

        Ok(Self {
            broker_url,
            symbols,
            dom_depth: parse_or("DOM_DEPTH", 200)?,
            heatmap_bin_mult: parse_or_dec("HEATMAP_BIN_MULT", "10")?,
            footprint_bar_ms: parse_or("FOOTPRINT_BAR_MS", 60_000)?,
            imbalance_ratio: parse_or_dec("IMBALANCE_RATIO", "3")?,
            iceberg_k: parse_or_dec("ICEBERG_K", "5")?,
            iceberg_r: parse_or("ICEBERG_R", 3)?,
            iceberg_window_ms: parse_or("ICEBERG_WINDOW_MS", 60_000)?,
            wall_x: parse_or_dec("WALL_X", "3")?,
            wall_t1_ms: parse_or("WALL_T1_MS", 5_000)?,
            spoof_t2_ms: parse_or("SPOOF_T2_MS", 1_000)?,
            tape_large_mult: parse_or_dec("TAPE_LARGE_MULT", "3")?,
            trend_weights: TrendWeights::default(),
            workers: match env::var("WORKERS") {
                Err(_) => ALL_WORKERS.iter().map(|s| s.to_string()).collect(),
                Ok(raw) => raw
                    .split(',')
                    .map(|s| s.trim().to_ascii_lowercase())
                    .filter(|s| !s.is_empty())
                    .collect(),
            },
            gateway_port: parse_or("GATEWAY_PORT", 8080)?,
            metrics_port: parse_or("METRICS_PORT", 9090)?,
            health_port: parse_or("HEALTH_PORT", 8081)?,
        })
    }

    /// All configured instruments, in exchange order.
    pub fn instruments(&self) -> Vec<Instrument> {
        let mut out = Vec::new();
        for exchange in Exchange::ALL {
            if let Some(list) = self.symbols.get(&exchange) {
                for sym in list {
                    out.push(Instrument::new(exchange, sym.clone()));
                }
            }
        }
        out
    }

    /// Tick size of an instrument. Static table; unknown symbols fall back
    /// to a conservative default.
    pub fn tick_size(&self, _exchange: Exchange, symbol: &str) -> Decimal {
        match symbol {
            "BTCUSDT" => Decimal::from_str("0.1").unwrap_or_default(),
            "ETHUSDT" => Decimal::from_str("0.01").unwrap_or_default(),
            _ => Decimal::from_str("0.01").unwrap_or_default(),
        }
    }

    /// Heatmap price bin for an instrument: tick size times the configured
    /// multiplier. This is the only place bin sizes are derived.
    pub fn bin_size(&self, exchange: Exchange, symbol: &str) -> Decimal {
        self.tick_size(exchange, symbol) * self.heatmap_bin_mult
    }
}

fn parse_or<T: FromStr>(var: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(default),
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::InvalidVar { var, value: raw }),
    }
}

fn parse_or_dec(var: &'static str, default: &str) -> Result<Decimal, ConfigError> {
    match env::var(var) {
        Err(_) => Ok(Decimal::from_str(default).unwrap_or_default()),
        Ok(raw) => Decimal::from_str(&raw).map_err(|_| ConfigError::InvalidVar { var, value: raw }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> Config {
        Config {
            broker_url: "redis://localhost:6379".to_string(),
            symbols: HashMap::from([(Exchange::Bybit, vec!["BTCUSDT".to_string()])]),
            dom_depth: 200,
            heatmap_bin_mult: Decimal::from(10),
            footprint_bar_ms: 60_000,
            imbalance_ratio: Decimal::from(3),
            iceberg_k: Decimal::from(5),
            iceberg_r: 3,
            iceberg_window_ms: 60_000,
            wall_x: Decimal::from(3),
            wall_t1_ms: 5_000,
            spoof_t2_ms: 1_000,
            tape_large_mult: Decimal::from(3),
            trend_weights: TrendWeights::default(),
            workers: ALL_WORKERS.iter().map(|s| s.to_string()).collect(),
            gateway_port: 8080,
            metrics_port: 9090,
            health_port: 8081,
        }
    }

    #[test]
    fn test_bin_size_single_source() {
        let cfg = test_config();
        assert_eq!(
            cfg.bin_size(Exchange::Bybit, "BTCUSDT"),
            Decimal::from_str("1.0").unwrap()
        );
        assert_eq!(
            cfg.bin_size(Exchange::Binance, "ETHUSDT"),
            Decimal::from_str("0.1").unwrap()
        );
    }

    #[test]
    fn test_instruments_order() {
        let cfg = test_config();
        let instruments = cfg.instruments();
        assert_eq!(instruments.len(), 1);
        assert_eq!(instruments[0].exchange, Exchange::Bybit);
        assert_eq!(instruments[0].symbol, "BTCUSDT");
    }
}
