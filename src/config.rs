// =============================================================================
// Engine Configuration — flat nested config with atomic save
// =============================================================================
//
// Every tunable the control plane needs lives here, grouped the way the
// configuration surface names them. `#[serde(default)]` on every field means
// adding a new knob never breaks loading an older config file, exactly as
// the starting crate's `RuntimeConfig` guarantees. Persistence uses the same
// atomic tmp + rename pattern for the same reason: a crash mid-write must
// never leave a half-written config file behind.
//
// Broker credentials are not part of this struct — they are read from
// environment variables at startup (`BROKER_BASE_URL`, `BROKER_API_KEY`) and
// never serialized, matching the starting crate's handling of
// `BINANCE_API_KEY`/`BINANCE_API_SECRET`.
// =============================================================================

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

fn default_loop_interval_ms() -> u64 {
    1000
}

fn default_symbol() -> String {
    "EURUSD".to_string()
}

fn default_symbols() -> Vec<String> {
    vec!["EURUSD".to_string()]
}

fn default_timeframes() -> Vec<String> {
    vec!["1h".to_string()]
}

fn default_update_interval_ms() -> u64 {
    2_000
}

fn default_ohlc_update_interval_ms() -> u64 {
    5_000
}

fn default_ohlc_count() -> u32 {
    100
}

fn default_max_age_ms() -> u64 {
    10_000
}

fn default_timeframe() -> String {
    "1h".to_string()
}

fn default_rsi_period() -> usize {
    14
}

fn default_ema_period() -> usize {
    20
}

fn default_bollinger_period() -> usize {
    20
}

fn default_bollinger_std() -> f64 {
    2.0
}

fn default_atr_period() -> usize {
    14
}

fn default_adx_period() -> usize {
    14
}

fn default_macd_fast() -> usize {
    12
}

fn default_macd_slow() -> usize {
    26
}

fn default_macd_signal() -> usize {
    9
}

fn default_stoch_period() -> usize {
    14
}

fn default_stoch_slowing() -> usize {
    3
}

fn default_max_inactive_minutes() -> i64 {
    240
}

fn default_min_profit_pips() -> f64 {
    5.0
}

fn default_check_interval_seconds() -> u64 {
    60
}

fn default_profit_target_percent() -> f64 {
    5.0
}

fn default_min_free_margin() -> f64 {
    100.0
}

fn default_critical_margin_level() -> f64 {
    120.0
}

fn default_warning_margin_level() -> f64 {
    200.0
}

fn default_initial_positions() -> u32 {
    1
}

fn default_additional_positions() -> u32 {
    1
}

fn default_trigger_pips() -> f64 {
    20.0
}

fn default_lot_increment() -> f64 {
    0.01
}

fn default_lot_increment_step() -> u32 {
    1
}

fn default_max_positions() -> usize {
    5
}

fn default_max_level() -> u32 {
    5
}

fn default_base_volume() -> f64 {
    0.01
}

fn default_activation_distance_pips() -> f64 {
    20.0
}

fn default_trailing_distance_pips() -> f64 {
    10.0
}

fn default_max_total() -> usize {
    20
}

fn default_max_per_symbol() -> usize {
    10
}

fn default_max_per_group() -> usize {
    5
}

fn default_max_spread_points() -> i64 {
    30
}

fn default_magic_number() -> i64 {
    20_260_728
}

fn default_broker_timeout_ms() -> u64 {
    5_000
}

fn default_pip_scale() -> f64 {
    0.0001
}

fn default_price_precision() -> u32 {
    5
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradingConfig {
    #[serde(default = "default_symbol")]
    pub symbol: String,
    #[serde(default = "default_loop_interval_ms")]
    pub loop_interval_ms: u64,
}

impl Default for TradingConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            loop_interval_ms: default_loop_interval_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarketDataConfig {
    #[serde(default = "default_symbols")]
    pub symbols: Vec<String>,
    #[serde(default = "default_timeframes")]
    pub timeframes: Vec<String>,
    #[serde(default = "default_update_interval_ms")]
    pub update_interval_ms: u64,
    #[serde(default = "default_ohlc_update_interval_ms")]
    pub ohlc_update_interval_ms: u64,
    #[serde(default = "default_ohlc_count")]
    pub ohlc_count: u32,
    #[serde(default = "default_max_age_ms")]
    pub max_age_ms: u64,
}

impl Default for MarketDataConfig {
    fn default() -> Self {
        Self {
            symbols: default_symbols(),
            timeframes: default_timeframes(),
            update_interval_ms: default_update_interval_ms(),
            ohlc_update_interval_ms: default_ohlc_update_interval_ms(),
            ohlc_count: default_ohlc_count(),
            max_age_ms: default_max_age_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndicatorsConfig {
    #[serde(default = "default_timeframe")]
    pub timeframe: String,
    #[serde(default = "default_rsi_period")]
    pub rsi_period: usize,
    #[serde(default = "default_ema_period")]
    pub ema_period: usize,
    #[serde(default = "default_bollinger_period")]
    pub bollinger_period: usize,
    #[serde(default = "default_bollinger_std")]
    pub bollinger_std: f64,
    #[serde(default = "default_atr_period")]
    pub atr_period: usize,
    #[serde(default = "default_adx_period")]
    pub adx_period: usize,
    #[serde(default = "default_macd_fast")]
    pub macd_fast: usize,
    #[serde(default = "default_macd_slow")]
    pub macd_slow: usize,
    #[serde(default = "default_macd_signal")]
    pub macd_signal: usize,
    #[serde(default = "default_stoch_period")]
    pub stoch_period: usize,
    #[serde(default = "default_stoch_slowing")]
    pub stoch_slowing: usize,
}

impl Default for IndicatorsConfig {
    fn default() -> Self {
        Self {
            timeframe: default_timeframe(),
            rsi_period: default_rsi_period(),
            ema_period: default_ema_period(),
            bollinger_period: default_bollinger_period(),
            bollinger_std: default_bollinger_std(),
            atr_period: default_atr_period(),
            adx_period: default_adx_period(),
            macd_fast: default_macd_fast(),
            macd_slow: default_macd_slow(),
            macd_signal: default_macd_signal(),
            stoch_period: default_stoch_period(),
            stoch_slowing: default_stoch_slowing(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StagnantRiskConfig {
    #[serde(default = "default_max_inactive_minutes")]
    pub max_inactive_minutes: i64,
    #[serde(default = "default_min_profit_pips")]
    pub min_profit_pips: f64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for StagnantRiskConfig {
    fn default() -> Self {
        Self {
            max_inactive_minutes: default_max_inactive_minutes(),
            min_profit_pips: default_min_profit_pips(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProfitTargetRiskConfig {
    #[serde(default = "default_profit_target_percent")]
    pub profit_target_percent: f64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for ProfitTargetRiskConfig {
    fn default() -> Self {
        Self {
            profit_target_percent: default_profit_target_percent(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MarginRiskConfig {
    #[serde(default = "default_min_free_margin")]
    pub min_free_margin: f64,
    #[serde(default = "default_critical_margin_level")]
    pub critical_margin_level: f64,
    #[serde(default = "default_warning_margin_level")]
    pub warning_margin_level: f64,
    #[serde(default = "default_check_interval_seconds")]
    pub check_interval_seconds: u64,
}

impl Default for MarginRiskConfig {
    fn default() -> Self {
        Self {
            min_free_margin: default_min_free_margin(),
            critical_margin_level: default_critical_margin_level(),
            warning_margin_level: default_warning_margin_level(),
            check_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RiskConfig {
    #[serde(default)]
    pub stagnant: StagnantRiskConfig,
    #[serde(default)]
    pub profit_target: ProfitTargetRiskConfig,
    #[serde(default)]
    pub margin: MarginRiskConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingConfigSection {
    #[serde(default = "default_initial_positions")]
    pub initial_positions: u32,
    #[serde(default = "default_additional_positions")]
    pub additional_positions: u32,
    #[serde(default = "default_trigger_pips")]
    pub trigger_pips: f64,
    #[serde(default = "default_lot_increment")]
    pub lot_increment: f64,
    #[serde(default = "default_lot_increment_step")]
    pub lot_increment_step: u32,
    #[serde(default = "default_max_positions")]
    pub max_positions: usize,
    #[serde(default = "default_max_level")]
    pub max_level: u32,
    #[serde(default = "default_base_volume")]
    pub base_volume: f64,
}

impl Default for ScalingConfigSection {
    fn default() -> Self {
        Self {
            initial_positions: default_initial_positions(),
            additional_positions: default_additional_positions(),
            trigger_pips: default_trigger_pips(),
            lot_increment: default_lot_increment(),
            lot_increment_step: default_lot_increment_step(),
            max_positions: default_max_positions(),
            max_level: default_max_level(),
            base_volume: default_base_volume(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrailingConfigSection {
    #[serde(default = "default_activation_distance_pips")]
    pub activation_distance_pips: f64,
    #[serde(default = "default_trailing_distance_pips")]
    pub distance_pips: f64,
    #[serde(default = "default_check_interval_seconds")]
    pub update_interval_seconds: u64,
}

impl Default for TrailingConfigSection {
    fn default() -> Self {
        Self {
            activation_distance_pips: default_activation_distance_pips(),
            distance_pips: default_trailing_distance_pips(),
            update_interval_seconds: default_check_interval_seconds(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionsConfig {
    #[serde(default = "default_max_total")]
    pub max_total: usize,
    #[serde(default = "default_max_per_symbol")]
    pub max_per_symbol: usize,
    #[serde(default = "default_max_per_group")]
    pub max_per_group: usize,
}

impl Default for PositionsConfig {
    fn default() -> Self {
        Self {
            max_total: default_max_total(),
            max_per_symbol: default_max_per_symbol(),
            max_per_group: default_max_per_group(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default = "default_max_spread_points")]
    pub max_spread_points: i64,
    #[serde(default = "default_magic_number")]
    pub magic_number: i64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        Self {
            max_spread_points: default_max_spread_points(),
            magic_number: default_magic_number(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerConfig {
    #[serde(default = "default_broker_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_broker_timeout_ms(),
        }
    }
}

/// Static per-symbol facts the broker transport never reports: the price
/// delta one pip represents, and the decimal precision quotes are given in.
/// Not part of the external operation set (§6) — this is local domain
/// knowledge the engine needs to turn broker prices into pip distances.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SymbolSpec {
    #[serde(default = "default_pip_scale")]
    pub pip_scale: f64,
    #[serde(default = "default_price_precision")]
    pub price_precision: u32,
}

impl Default for SymbolSpec {
    fn default() -> Self {
        Self {
            pip_scale: default_pip_scale(),
            price_precision: default_price_precision(),
        }
    }
}

fn default_symbol_specs() -> std::collections::HashMap<String, SymbolSpec> {
    let mut specs = std::collections::HashMap::new();
    specs.insert("EURUSD".to_string(), SymbolSpec::default());
    specs
}

/// Top-level engine configuration. Every field carries `#[serde(default)]`
/// so that adding a new knob never breaks loading an older config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub trading: TradingConfig,
    #[serde(default)]
    pub market_data: MarketDataConfig,
    #[serde(default)]
    pub indicators: IndicatorsConfig,
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub scaling: ScalingConfigSection,
    #[serde(default)]
    pub trailing: TrailingConfigSection,
    #[serde(default)]
    pub positions: PositionsConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    /// Keyed by symbol name; a symbol with no entry falls back to `SymbolSpec::default()`.
    #[serde(default = "default_symbol_specs")]
    pub symbols: std::collections::HashMap<String, SymbolSpec>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            trading: TradingConfig::default(),
            market_data: MarketDataConfig::default(),
            indicators: IndicatorsConfig::default(),
            risk: RiskConfig::default(),
            scaling: ScalingConfigSection::default(),
            trailing: TrailingConfigSection::default(),
            positions: PositionsConfig::default(),
            execution: ExecutionConfig::default(),
            broker: BrokerConfig::default(),
            symbols: default_symbol_specs(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a JSON file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read engine config from {}", path.display()))?;
        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse engine config from {}", path.display()))?;
        info!(path = %path.display(), symbol = %config.trading.symbol, "engine config loaded");
        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename) so a crash mid-write never corrupts
    /// the config on disk.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self).context("failed to serialise engine config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "engine config saved (atomic)");
        Ok(())
    }

    pub fn broker_timeout(&self) -> Duration {
        Duration::from_millis(self.broker.timeout_ms)
    }

    pub fn market_data_max_age(&self) -> Duration {
        Duration::from_millis(self.market_data.max_age_ms)
    }

    /// Build the `Symbol` table the engine's components key off of: every
    /// symbol named in `trading.symbol`/`market_data.symbols`, each carrying
    /// its configured pip scale and price precision (or `SymbolSpec::default()`
    /// when the symbol has no explicit entry under `symbols`).
    pub fn symbol_table(&self) -> std::collections::HashMap<String, crate::types::Symbol> {
        let mut names: Vec<String> = self.market_data.symbols.clone();
        if !names.contains(&self.trading.symbol) {
            names.push(self.trading.symbol.clone());
        }

        names
            .into_iter()
            .map(|name| {
                let spec = self.symbols.get(&name).copied().unwrap_or_default();
                let symbol = crate::types::Symbol::new(name.clone(), spec.pip_scale, spec.price_precision);
                (name, symbol)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_round_trips_through_json() {
        let config = EngineConfig::default();
        let json = serde_json::to_string(&config).unwrap();
        let parsed: EngineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.trading.symbol, config.trading.symbol);
        assert_eq!(parsed.scaling.max_level, config.scaling.max_level);
    }

    #[test]
    fn missing_fields_in_older_json_fall_back_to_defaults() {
        let sparse = r#"{"trading": {"symbol": "GBPUSD"}}"#;
        let config: EngineConfig = serde_json::from_str(sparse).unwrap();
        assert_eq!(config.trading.symbol, "GBPUSD");
        assert_eq!(config.trading.loop_interval_ms, default_loop_interval_ms());
        assert_eq!(config.scaling.max_level, default_max_level());
    }

    #[test]
    fn save_then_load_round_trips_to_a_real_file() {
        let dir = std::env::temp_dir().join(format!("engine_config_test_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");

        let mut config = EngineConfig::default();
        config.trading.symbol = "USDJPY".to_string();
        config.save(&path).unwrap();

        let loaded = EngineConfig::load(&path).unwrap();
        assert_eq!(loaded.trading.symbol, "USDJPY");

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn save_leaves_no_tmp_file_behind() {
        let dir = std::env::temp_dir().join(format!("engine_config_test_tmp_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("engine_config.json");

        EngineConfig::default().save(&path).unwrap();
        assert!(!path.with_extension("json.tmp").exists());

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn symbol_table_falls_back_to_default_spec_for_unlisted_symbols() {
        let mut config = EngineConfig::default();
        config.trading.symbol = "GBPUSD".to_string();
        config.market_data.symbols = vec!["GBPUSD".to_string()];
        config.symbols.clear();

        let table = config.symbol_table();
        let gbp = table.get("GBPUSD").unwrap();
        assert_eq!(gbp.pip_scale, default_pip_scale());
    }

    #[test]
    fn symbol_table_uses_explicit_spec_when_present() {
        let mut config = EngineConfig::default();
        config.trading.symbol = "USDJPY".to_string();
        config.market_data.symbols = vec!["USDJPY".to_string()];
        config
            .symbols
            .insert("USDJPY".to_string(), SymbolSpec { pip_scale: 0.01, price_precision: 3 });

        let table = config.symbol_table();
        assert_eq!(table.get("USDJPY").unwrap().pip_scale, 0.01);
    }
}
