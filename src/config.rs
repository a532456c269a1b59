// ===============================
// src/config.rs
// ===============================
/*
=============================================================================
Project : hedge_arena — real-time market-shock trading game engine in Rust
Module  : config.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Runs timed trading rounds over a shared price feed, fires scripted
          market shocks, settles trades atomically per player, scores each
          round, ranks players, exposes Prometheus metrics, and records JSONL
          events.
=============================================================================
*/
use clap::Parser;
use dotenvy::dotenv;
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::env;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::{Symbol, Ticker};
use crate::errors::{EngineError, EngineResult};
use crate::events::MacroPolicy;
use crate::scoring::ScoringCfg;

/// Runner options (CLI flag or ENV, `.env` is loaded first).
#[derive(Parser, Clone, Debug)]
#[command(name = "hedge_arena", version, about = "Market-shock trading game engine")]
pub struct Args {
    /// TICKERS=SYM:Name:Sector:Price,...
    #[arg(long, env = "TICKERS", default_value = "ACME:Acme Corp:Industrials:100,BOLT:Bolt Energy:Energy:42.50,CHIP:Chipworks:Tech:250")]
    pub tickers: String,

    #[arg(long, env = "ROUNDS", default_value_t = 3)]
    pub rounds: usize,

    #[arg(long, env = "ROUND_MS", default_value_t = 10_000)]
    pub round_ms: i64,

    #[arg(long, env = "ROUND_GAP_MS", default_value_t = 2_000)]
    pub gap_ms: i64,

    #[arg(long, env = "EVENTS_PER_ROUND", default_value_t = 2)]
    pub events_per_round: usize,

    #[arg(long, env = "STARTING_CASH", default_value = "100000")]
    pub starting_cash: Decimal,

    /// Simulated players; 0 disables the bots.
    #[arg(long, env = "BOTS", default_value_t = 4)]
    pub bots: usize,

    #[arg(long, env = "SEED", default_value_t = 42)]
    pub seed: u64,

    #[arg(long, env = "RECORD_FILE")]
    pub record_file: Option<String>,

    #[arg(long, env = "METRICS_PORT", default_value_t = 9898)]
    pub metrics_port: u16,

    #[arg(long, env = "HEARTBEAT_MS", default_value_t = 2_000)]
    pub heartbeat_ms: u64,
}

/// Engine tunables shared by every game.
#[derive(Clone, Debug, PartialEq)]
pub struct EngineCfg {
    pub price_floor: Decimal,
    /// Max wait for a trade caught behind a round close; then RoundClosed.
    pub closing_grace: Duration,
    /// Max wait for a participant's account lock; then ConcurrencyConflict.
    pub lock_timeout: Duration,
    pub macro_policy: MacroPolicy,
    pub scoring: ScoringCfg,
}

impl Default for EngineCfg {
    fn default() -> Self {
        Self {
            price_floor: Decimal::new(1, 2),
            closing_grace: Duration::from_millis(250),
            lock_timeout: Duration::from_millis(500),
            macro_policy: MacroPolicy::Uniform,
            scoring: ScoringCfg::default(),
        }
    }
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key).ok().and_then(|v| v.trim().parse().ok()).unwrap_or(default)
}

impl EngineCfg {
    /// Rejects tunables the engine cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.price_floor <= Decimal::ZERO {
            return Err(EngineError::validation(format!("price floor must be positive, got {}", self.price_floor)));
        }
        if self.scoring.pnl_unit <= Decimal::ZERO {
            return Err(EngineError::validation("scoring pnl unit must be positive"));
        }
        Ok(())
    }

    pub fn from_env() -> Self {
        let d = EngineCfg::default();

        // MACRO_POLICY=uniform|jitter (+ MACRO_JITTER_BPS, MACRO_JITTER_SEED)
        let macro_policy = match env::var("MACRO_POLICY").unwrap_or_default().to_ascii_lowercase().as_str() {
            "jitter" => MacroPolicy::Jitter {
                max_bps: env_or("MACRO_JITTER_BPS", 50),
                seed: env_or("MACRO_JITTER_SEED", 7),
            },
            _ => MacroPolicy::Uniform,
        };

        let scoring = ScoringCfg {
            pnl_unit: env_or("SCORE_PNL_UNIT", d.scoring.pnl_unit),
            max_pnl_points: env_or("SCORE_MAX_PNL_POINTS", d.scoring.max_pnl_points),
            reaction_bonus: env_or("SCORE_REACTION_BONUS", d.scoring.reaction_bonus),
            speed_bonus_max: env_or("SCORE_SPEED_BONUS_MAX", d.scoring.speed_bonus_max),
            speed_window_ms: env_or("SCORE_SPEED_WINDOW_MS", d.scoring.speed_window_ms),
        };

        Self {
            price_floor: env_or("PRICE_FLOOR", d.price_floor),
            closing_grace: Duration::from_millis(env_or("CLOSING_GRACE_MS", 250)),
            lock_timeout: Duration::from_millis(env_or("LOCK_TIMEOUT_MS", 500)),
            macro_policy,
            scoring,
        }
    }
}

/// Parse `SYM:Name:Sector:Price` entries. Bad entries are skipped.
pub fn parse_tickers(list: &str) -> Vec<(Ticker, Decimal)> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .filter_map(|entry| {
            let parts: Vec<&str> = entry.split(':').map(str::trim).collect();
            let symbol = parts.first().filter(|s| !s.is_empty())?.to_ascii_uppercase();
            let price = parts.get(3).and_then(|p| Decimal::from_str(p).ok()).unwrap_or(Decimal::ONE_HUNDRED);
            let opt = |i: usize| parts.get(i).filter(|s| !s.is_empty()).map(|s| s.to_string());
            Some((Ticker { symbol, name: opt(1), sector: opt(2) }, price))
        })
        .collect()
}

pub fn initial_prices(tickers: &[(Ticker, Decimal)]) -> BTreeMap<Symbol, Decimal> {
    tickers.iter().map(|(t, px)| (t.symbol.clone(), *px)).collect()
}

pub fn load() -> EngineResult<(Args, EngineCfg)> {
    // make sure .env is read before clap looks at the environment
    let _ = dotenv();
    let args = Args::parse();
    let cfg = EngineCfg::from_env();
    cfg.validate()?;
    Ok((args, cfg))
}
