// ===============================
// src/events.rs (Event Dispatcher)
// ===============================
//
// Applies market-shock impulses to the price ledger, exactly once per event.
//
//   new_price = last_price * (1 + impulse_pct / 100), floored at `price_floor`
//
// MACRO fan-out is an explicit policy:
// - Uniform : the same impulse on every ticker (default)
// - Jitter  : impulse +/- a deterministic per-(event, ticker) offset in bps,
//             derived from a seed so replays give identical prices.
//
use ahash::AHashSet as HashSet;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::domain::{EventId, EventKind, MarketEvent, PriceSnapshot, Severity, TsMs, PRICE_DP};
use crate::errors::{EngineError, EngineResult, NotFoundError};
use crate::metrics::{EVENTS_FIRED, EVENTS_REDELIVERED};
use crate::prices::PriceLedger;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "policy")]
pub enum MacroPolicy {
    Uniform,
    Jitter { max_bps: u32, seed: u64 },
}

impl Default for MacroPolicy {
    fn default() -> Self { MacroPolicy::Uniform }
}

impl MacroPolicy {
    pub fn as_str(&self) -> &'static str {
        match self { MacroPolicy::Uniform => "uniform", MacroPolicy::Jitter { .. } => "jitter" }
    }
}

/// `None` when the move leaves the Decimal range.
pub fn apply_impulse(last: Decimal, impulse_pct: Decimal, floor: Decimal) -> Option<Decimal> {
    let factor = Decimal::ONE.checked_add(impulse_pct.checked_div(Decimal::ONE_HUNDRED)?)?;
    Some(last.checked_mul(factor)?.round_dp(PRICE_DP).max(floor))
}

/// Firing order inside a round: offset, then event id.
pub fn firing_order(events: &[MarketEvent]) -> Vec<MarketEvent> {
    let mut out = events.to_vec();
    out.sort_by_key(|e| (e.offset_ms, e.id));
    out
}

pub struct EventDispatcher {
    ledger: Arc<PriceLedger>,
    policy: MacroPolicy,
    price_floor: Decimal,
    applied: Mutex<HashSet<EventId>>,
}

impl EventDispatcher {
    /// Builds the exactly-once guard from what the ledger already holds, so a
    /// dispatcher created after a restart will not re-apply old events.
    pub async fn new(ledger: Arc<PriceLedger>, policy: MacroPolicy, price_floor: Decimal) -> Self {
        let applied = ledger.applied_events().await;
        Self { ledger, policy, price_floor, applied: Mutex::new(applied) }
    }

    pub async fn is_applied(&self, id: EventId) -> bool { self.applied.lock().await.contains(&id) }

    /// Effective impulse for one ticker under the configured policy.
    pub fn impulse_for(&self, ev: &MarketEvent, symbol: &str) -> Decimal {
        match (ev.kind, self.policy) {
            (EventKind::Micro, _) | (EventKind::Macro, MacroPolicy::Uniform) => ev.impulse_pct,
            (EventKind::Macro, MacroPolicy::Jitter { max_bps, seed }) => {
                let mut rng = StdRng::seed_from_u64(jitter_seed(seed, ev.id, symbol));
                let bps = rng.gen_range(-(max_bps as i64)..=(max_bps as i64));
                ev.impulse_pct + Decimal::new(bps, 2)
            }
        }
    }

    /// Fire one event at `at`. Returns the snapshots written, or an empty list
    /// when the event was already applied (re-delivery).
    pub async fn fire(&self, ev: &MarketEvent, at: TsMs) -> EngineResult<Vec<PriceSnapshot>> {
        // held for the whole fire: no two deliveries of the same event interleave
        let mut applied = self.applied.lock().await;
        if applied.contains(&ev.id) {
            debug!(event = %ev.id, "event already applied, skipping re-delivery");
            EVENTS_REDELIVERED.inc();
            return Ok(Vec::new());
        }

        let targets: Vec<String> = match ev.kind {
            EventKind::Macro => self.ledger.symbols(),
            EventKind::Micro => {
                let t = ev.target.clone().ok_or_else(|| NotFoundError::Ticker("<none>".into()))?;
                vec![t]
            }
        };
        // plan every target before anything is written: a MACRO fan-out
        // either lands on all tickers or on none
        let mut planned = Vec::with_capacity(targets.len());
        for sym in &targets {
            let last = self.ledger.latest(sym, TsMs::MAX).await?.price;
            let pct = self.impulse_for(ev, sym);
            let next = apply_impulse(last, pct, self.price_floor)
                .filter(|px| *px > Decimal::ZERO)
                .ok_or_else(|| EngineError::validation(format!("event {} moves {sym} from {last} out of range ({pct}%)", ev.id)))?;
            planned.push((sym, next));
        }

        // the dispatcher is the only writer once prices are seeded, so the
        // planned price still applies to the last snapshot
        let mut written = Vec::with_capacity(planned.len());
        for (sym, next) in planned {
            let snap = self.ledger.reprice(sym, ev.round_no, at, Some(ev.id), |_| next).await?;
            written.push(snap);
        }
        applied.insert(ev.id);

        EVENTS_FIRED.with_label_values(&[ev.kind.as_str(), ev.severity.as_str()]).inc();
        match ev.severity {
            Severity::Critical => warn!(event = %ev.id, kind = ev.kind.as_str(), pct = %ev.impulse_pct, tickers = written.len(), "CRITICAL event fired"),
            Severity::Normal => info!(event = %ev.id, kind = ev.kind.as_str(), pct = %ev.impulse_pct, tickers = written.len(), "event fired"),
        }
        Ok(written)
    }
}

fn jitter_seed(seed: u64, id: EventId, symbol: &str) -> u64 {
    // FNV-1a over the symbol, mixed with seed and event id
    let mut h: u64 = 0xcbf2_9ce4_8422_2325;
    for b in symbol.as_bytes() {
        h ^= *b as u64;
        h = h.wrapping_mul(0x0000_0100_0000_01b3);
    }
    h ^ seed.rotate_left(17) ^ id.0.wrapping_mul(0x9e37_79b9_7f4a_7c15)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{GameId, Severity};
    use rust_decimal_macros::dec;

    fn ev(id: u64, kind: EventKind, pct: Decimal, target: Option<&str>, offset_ms: i64) -> MarketEvent {
        MarketEvent {
            id: EventId(id),
            round_no: 1,
            kind,
            severity: Severity::Normal,
            impulse_pct: pct,
            target: target.map(str::to_string),
            offset_ms,
            headline: None,
        }
    }

    async fn seeded() -> Arc<PriceLedger> {
        let l = Arc::new(PriceLedger::new(GameId(1), ["ACME", "BOLT"]));
        l.append("ACME", 1, dec!(100), 0, None).await.unwrap();
        l.append("BOLT", 1, dec!(50), 0, None).await.unwrap();
        l
    }

    #[test]
    fn impulse_math_and_floor() {
        assert_eq!(apply_impulse(dec!(100), dec!(-20), dec!(0.01)), Some(dec!(80)));
        assert_eq!(apply_impulse(dec!(100), dec!(5), dec!(0.01)), Some(dec!(105)));
        assert_eq!(apply_impulse(dec!(1), dec!(-100), dec!(0.01)), Some(dec!(0.01)));
        assert_eq!(apply_impulse(Decimal::MAX, dec!(50), dec!(0.01)), None);
    }

    #[test]
    fn order_is_offset_then_id() {
        let evs = vec![
            ev(3, EventKind::Macro, dec!(1), None, 500),
            ev(2, EventKind::Macro, dec!(1), None, 100),
            ev(1, EventKind::Macro, dec!(1), None, 500),
        ];
        let ids: Vec<u64> = firing_order(&evs).iter().map(|e| e.id.0).collect();
        assert_eq!(ids, vec![2, 1, 3]);
    }

    #[tokio::test]
    async fn micro_hits_only_its_target() {
        let l = seeded().await;
        let d = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        let out = d.fire(&ev(1, EventKind::Micro, dec!(-20), Some("ACME"), 0), 10).await.unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(l.latest("ACME", 10).await.unwrap().price, dec!(80));
        assert_eq!(l.latest("BOLT", 10).await.unwrap().price, dec!(50));
    }

    #[tokio::test]
    async fn macro_uniform_hits_everything() {
        let l = seeded().await;
        let d = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        d.fire(&ev(1, EventKind::Macro, dec!(10), None, 0), 10).await.unwrap();
        assert_eq!(l.latest("ACME", 10).await.unwrap().price, dec!(110));
        assert_eq!(l.latest("BOLT", 10).await.unwrap().price, dec!(55));
    }

    #[tokio::test]
    async fn redelivery_does_not_double_apply() {
        let l = seeded().await;
        let d = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        let e = ev(9, EventKind::Micro, dec!(-20), Some("ACME"), 0);
        d.fire(&e, 10).await.unwrap();
        assert!(d.fire(&e, 11).await.unwrap().is_empty());
        assert_eq!(l.latest("ACME", 20).await.unwrap().price, dec!(80));

        // a fresh dispatcher (restart) rebuilds the guard from the ledger
        let d2 = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        assert!(d2.is_applied(EventId(9)).await);
        assert!(d2.fire(&e, 12).await.unwrap().is_empty());
        assert_eq!(l.history("ACME").await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn jitter_is_deterministic_and_bounded() {
        let l = seeded().await;
        let policy = MacroPolicy::Jitter { max_bps: 50, seed: 42 };
        let d = EventDispatcher::new(l.clone(), policy, dec!(0.01)).await;
        let e = ev(4, EventKind::Macro, dec!(-10), None, 0);
        let a = d.impulse_for(&e, "ACME");
        assert_eq!(a, d.impulse_for(&e, "ACME"));
        assert!(a >= dec!(-10.5) && a <= dec!(-9.5));
    }

    #[tokio::test]
    async fn out_of_range_move_writes_nothing() {
        let l = Arc::new(PriceLedger::new(GameId(1), ["ACME", "BOLT"]));
        l.append("ACME", 1, dec!(100), 0, None).await.unwrap();
        l.append("BOLT", 1, Decimal::MAX, 0, None).await.unwrap();
        let d = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        let err = d.fire(&ev(1, EventKind::Macro, dec!(50), None, 0), 1).await.unwrap_err();
        assert_eq!(err.code(), "VALIDATION_ERROR");
        assert_eq!(l.history("ACME").await.unwrap().len(), 1);
        assert!(!d.is_applied(EventId(1)).await);
    }

    #[tokio::test]
    async fn unpriced_target_writes_nothing() {
        let l = Arc::new(PriceLedger::new(GameId(1), ["ACME", "BOLT"]));
        l.append("ACME", 1, dec!(100), 0, None).await.unwrap();
        let d = EventDispatcher::new(l.clone(), MacroPolicy::Uniform, dec!(0.01)).await;
        assert!(d.fire(&ev(1, EventKind::Macro, dec!(5), None, 0), 1).await.is_err());
        assert_eq!(l.history("ACME").await.unwrap().len(), 1);
        assert!(!d.is_applied(EventId(1)).await);
    }
}
