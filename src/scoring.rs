// ===============================
// src/scoring.rs (round close scoring)
// ===============================
//
// Pure functions over (account copy, equity at open, marks at close). The
// engine never mutates cash or positions here, so a recompute over the same
// committed trades gives the same RoundScore, field for field.
//
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tokio::sync::Mutex;

use crate::domain::{GameId, ParticipantId, Round, RoundNo, RoundScore, Symbol};
use crate::errors::{EngineResult, StateError};
use crate::portfolio::Account;

/// Game-design weights. Only determinism is structural; the numbers are tunable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringCfg {
    /// PnL per point.
    pub pnl_unit: Decimal,
    pub max_pnl_points: i64,
    pub reaction_bonus: i64,
    pub speed_bonus_max: i64,
    pub speed_window_ms: i64,
}

impl Default for ScoringCfg {
    fn default() -> Self {
        Self {
            pnl_unit: Decimal::ONE_HUNDRED,
            max_pnl_points: 100,
            reaction_bonus: 10,
            speed_bonus_max: 20,
            speed_window_ms: 5_000,
        }
    }
}

pub fn points(cfg: &ScoringCfg, pnl_delta: Decimal, reaction_ms: Option<i64>) -> i64 {
    let pnl_points = if cfg.pnl_unit > Decimal::ZERO {
        let cap = Decimal::from(cfg.max_pnl_points);
        // a quotient past the Decimal range is past the cap as well
        let units = pnl_delta
            .checked_div(cfg.pnl_unit)
            .unwrap_or(if pnl_delta.is_sign_negative() { -cap } else { cap });
        units.trunc().clamp(-cap, cap).to_i64().unwrap_or(0)
    } else {
        0
    };
    let reaction_points = match reaction_ms {
        None => 0,
        Some(ms) => {
            let speed = if cfg.speed_window_ms > 0 && ms < cfg.speed_window_ms {
                cfg.speed_bonus_max.saturating_mul(cfg.speed_window_ms - ms.max(0)) / cfg.speed_window_ms
            } else {
                0
            };
            cfg.reaction_bonus + speed
        }
    };
    pnl_points + reaction_points
}

/// Score one participant for one closed round.
pub fn score_round(
    game_id: GameId,
    round: &Round,
    account: &Account,
    equity_before: Decimal,
    marks_at_close: &BTreeMap<Symbol, Decimal>,
    cfg: &ScoringCfg,
) -> RoundScore {
    let equity_after = account.equity(marks_at_close);
    let pnl_delta = equity_after - equity_before;
    // trades are kept in commit order, so the first one is the reaction
    let reaction_ms = account.trades_in_round(round.round_no).next().map(|t| t.response_ms);
    RoundScore {
        game_id,
        round_no: round.round_no,
        participant: account.participant.clone(),
        equity_before,
        equity_after,
        pnl_delta,
        points_earned: points(cfg, pnl_delta, reaction_ms),
        reacted: reaction_ms.is_some(),
        reaction_ms,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScoreWrite { Inserted, Unchanged }

/// Final scores, keyed by (round, participant). Write-once.
#[derive(Debug, Default)]
pub struct ScoreBook {
    scores: Mutex<BTreeMap<(RoundNo, ParticipantId), RoundScore>>,
}

impl ScoreBook {
    pub fn new() -> Self { Self::default() }

    /// Idempotent write: an identical score is a no-op, a different one is refused.
    pub async fn record(&self, score: RoundScore) -> EngineResult<ScoreWrite> {
        let mut scores = self.scores.lock().await;
        let key = (score.round_no, score.participant.clone());
        match scores.get(&key) {
            Some(existing) if *existing == score => Ok(ScoreWrite::Unchanged),
            Some(_) => Err(StateError::ScoreFinal { round_no: score.round_no, participant: score.participant.to_string() }.into()),
            None => {
                scores.insert(key, score);
                Ok(ScoreWrite::Inserted)
            }
        }
    }

    pub async fn for_round(&self, round_no: RoundNo) -> Vec<RoundScore> {
        self.scores.lock().await.values().filter(|s| s.round_no == round_no).cloned().collect()
    }

    pub async fn for_participant(&self, participant: &ParticipantId) -> Vec<RoundScore> {
        self.scores.lock().await.values().filter(|s| &s.participant == participant).cloned().collect()
    }

    pub async fn all(&self) -> Vec<RoundScore> { self.scores.lock().await.values().cloned().collect() }
}
