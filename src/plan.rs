// ===============================
// src/plan.rs (round & event configuration)
// ===============================
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::domain::{EventId, EventKind, MarketEvent, RoundNo, Severity, Symbol, TsMs};
use crate::errors::{EngineError, EngineResult};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPlan {
    pub kind: EventKind,
    pub severity: Severity,
    pub impulse_pct: Decimal,
    pub target: Option<Symbol>,
    pub offset_ms: i64,
    pub headline: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoundPlan {
    pub events: Vec<EventPlan>,
}

/// Everything a game needs to run: money, tickers, timing and the event script.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GamePlan {
    pub starting_cash: Decimal,
    pub round_ms: i64,
    pub gap_ms: i64,
    pub initial_prices: BTreeMap<Symbol, Decimal>,
    pub rounds: Vec<RoundPlan>,
    /// When set, the scheduler starts the game by itself at this instant.
    pub start_at: Option<TsMs>,
}

/// Largest upward shock a script may carry, in percent.
pub const MAX_IMPULSE_PCT: Decimal = Decimal::from_parts(1000, 0, 0, false, 0);

impl GamePlan {
    pub fn symbols(&self) -> Vec<Symbol> { self.initial_prices.keys().cloned().collect() }

    pub fn validate(&self) -> EngineResult<()> {
        if self.starting_cash <= Decimal::ZERO {
            return Err(EngineError::validation("starting cash must be positive"));
        }
        if self.rounds.is_empty() {
            return Err(EngineError::validation("a game needs at least one round"));
        }
        if self.round_ms <= 0 || self.gap_ms < 0 {
            return Err(EngineError::validation("round_ms must be > 0 and gap_ms >= 0"));
        }
        if self.initial_prices.is_empty() {
            return Err(EngineError::validation("a game needs at least one ticker"));
        }
        if let Some((sym, px)) = self.initial_prices.iter().find(|(_, px)| **px <= Decimal::ZERO) {
            return Err(EngineError::validation(format!("initial price for {sym} must be positive, got {px}")));
        }
        for (i, r) in self.rounds.iter().enumerate() {
            for e in &r.events {
                if e.offset_ms < 0 || e.offset_ms >= self.round_ms {
                    return Err(EngineError::validation(format!(
                        "round {}: event offset {} outside [0, {})",
                        i + 1,
                        e.offset_ms,
                        self.round_ms
                    )));
                }
                if e.impulse_pct <= -Decimal::ONE_HUNDRED || e.impulse_pct > MAX_IMPULSE_PCT {
                    return Err(EngineError::validation(format!(
                        "round {}: impulse must be within (-100%, {MAX_IMPULSE_PCT}%]",
                        i + 1
                    )));
                }
                if e.kind == EventKind::Micro {
                    match &e.target {
                        Some(t) if self.initial_prices.contains_key(t) => {}
                        Some(t) => return Err(EngineError::validation(format!("round {}: unknown target {t}", i + 1))),
                        None => return Err(EngineError::validation(format!("round {}: MICRO event without target", i + 1))),
                    }
                }
            }
        }
        Ok(())
    }

    /// Window of round `n` (1-based) for a game started at `start`.
    /// Windows never overlap and are ordered by round number.
    pub fn window(&self, start: TsMs, round_no: RoundNo) -> (TsMs, TsMs) {
        let i = (round_no as i64) - 1;
        let starts_at = start + i * (self.round_ms + self.gap_ms);
        (starts_at, starts_at + self.round_ms)
    }

    /// Materialize the event script with ids unique inside the game.
    pub fn events(&self) -> Vec<Vec<MarketEvent>> {
        let mut next_id = 1u64;
        self.rounds
            .iter()
            .enumerate()
            .map(|(i, r)| {
                r.events
                    .iter()
                    .map(|e| {
                        let ev = MarketEvent {
                            id: EventId(next_id),
                            round_no: (i + 1) as RoundNo,
                            kind: e.kind,
                            severity: e.severity,
                            impulse_pct: e.impulse_pct,
                            target: if e.kind == EventKind::Micro { e.target.clone() } else { None },
                            offset_ms: e.offset_ms,
                            headline: e.headline.clone(),
                        };
                        next_id += 1;
                        ev
                    })
                    .collect()
            })
            .collect()
    }

    /// Seeded scenario generator for demos and soak tests.
    pub fn random(
        seed: u64,
        initial_prices: BTreeMap<Symbol, Decimal>,
        starting_cash: Decimal,
        rounds: usize,
        events_per_round: usize,
        round_ms: i64,
        gap_ms: i64,
    ) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let symbols: Vec<Symbol> = initial_prices.keys().cloned().collect();
        let rounds = (0..rounds)
            .map(|_| {
                let mut events: Vec<EventPlan> = (0..events_per_round)
                    .map(|_| {
                        let macro_ev = symbols.is_empty() || rng.gen_bool(0.3);
                        let critical = rng.gen_bool(0.2);
                        // 0.5% .. 8% moves, 2x for critical shocks
                        let mut bps: i64 = rng.gen_range(50..=800);
                        if critical { bps *= 2; }
                        if rng.gen_bool(0.5) { bps = -bps; }
                        let target = if macro_ev { None } else { Some(symbols[rng.gen_range(0..symbols.len())].clone()) };
                        let headline = match (&target, bps > 0) {
                            (Some(t), true) => format!("{t} beats expectations"),
                            (Some(t), false) => format!("{t} misses guidance"),
                            (None, true) => "Rate cut surprises the market".to_string(),
                            (None, false) => "Inflation print spooks investors".to_string(),
                        };
                        EventPlan {
                            kind: if macro_ev { EventKind::Macro } else { EventKind::Micro },
                            severity: if critical { Severity::Critical } else { Severity::Normal },
                            impulse_pct: Decimal::new(bps, 2),
                            target,
                            offset_ms: rng.gen_range(0..round_ms.max(1)),
                            headline: Some(headline),
                        }
                    })
                    .collect();
                events.sort_by_key(|e| e.offset_ms);
                RoundPlan { events }
            })
            .collect();
        Self { starting_cash, round_ms, gap_ms, initial_prices, rounds, start_at: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn prices() -> BTreeMap<Symbol, Decimal> {
        BTreeMap::from([("ACME".to_string(), dec!(100)), ("BOLT".to_string(), dec!(20))])
    }

    fn micro(target: Option<&str>, offset_ms: i64) -> EventPlan {
        EventPlan {
            kind: EventKind::Micro,
            severity: Severity::Normal,
            impulse_pct: dec!(-20),
            target: target.map(str::to_string),
            offset_ms,
            headline: None,
        }
    }

    fn plan(events: Vec<EventPlan>) -> GamePlan {
        GamePlan {
            starting_cash: dec!(10000),
            round_ms: 1_000,
            gap_ms: 200,
            initial_prices: prices(),
            rounds: vec![RoundPlan { events }, RoundPlan::default()],
            start_at: None,
        }
    }

    #[test]
    fn validation_catches_bad_scripts() {
        assert!(plan(vec![micro(Some("ACME"), 10)]).validate().is_ok());
        assert!(plan(vec![micro(None, 10)]).validate().is_err());
        assert!(plan(vec![micro(Some("ZZZ"), 10)]).validate().is_err());
        assert!(plan(vec![micro(Some("ACME"), 1_000)]).validate().is_err());
        let mut huge = micro(Some("ACME"), 10);
        huge.impulse_pct = dec!(1000.01);
        assert!(plan(vec![huge.clone()]).validate().is_err());
        huge.impulse_pct = MAX_IMPULSE_PCT;
        assert!(plan(vec![huge]).validate().is_ok());
        let mut p = plan(vec![]);
        p.rounds.clear();
        assert!(p.validate().is_err());
    }

    #[test]
    fn windows_do_not_overlap() {
        let p = plan(vec![]);
        let (s1, e1) = p.window(10_000, 1);
        let (s2, e2) = p.window(10_000, 2);
        assert_eq!((s1, e1), (10_000, 11_000));
        assert_eq!((s2, e2), (11_200, 12_200));
        assert!(e1 <= s2);
    }

    #[test]
    fn event_ids_are_unique_across_rounds() {
        let mut p = plan(vec![micro(Some("ACME"), 10), micro(Some("BOLT"), 20)]);
        p.rounds[1].events.push(micro(Some("ACME"), 5));
        let evs = p.events();
        let ids: Vec<u64> = evs.iter().flatten().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(evs[1][0].round_no, 2);
    }

    #[test]
    fn random_plans_are_reproducible_and_valid() {
        let a = GamePlan::random(7, prices(), dec!(100000), 3, 4, 10_000, 1_000);
        let b = GamePlan::random(7, prices(), dec!(100000), 3, 4, 10_000, 1_000);
        assert_eq!(a, b);
        assert!(a.validate().is_ok());
        assert_eq!(a.rounds.len(), 3);
    }
}
