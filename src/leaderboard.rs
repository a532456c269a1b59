// ===============================
// src/leaderboard.rs (Leaderboard Aggregator)
// ===============================
//
// Read-only ranking. Ordering:
//   1. current equity          (desc)
//   2. cumulative reaction ms  (asc; never-reacted goes last)
//   3. participant id          (asc, stable)
// Points are carried along for display only.
//
use rust_decimal::Decimal;
use serde::Serialize;
use std::cmp::Ordering;
use std::collections::BTreeMap;

use crate::domain::{ParticipantId, RoundScore, Symbol};
use crate::errors::EngineResult;
use crate::game::Game;
use crate::portfolio::Account;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Standing {
    pub rank: usize,
    pub participant: ParticipantId,
    pub equity: Decimal,
    pub total_points: i64,
    pub rounds_reacted: u32,
    /// Sum of reaction times over reacted rounds; `None` if never reacted.
    pub cumulative_reaction_ms: Option<i64>,
}

fn by_rank(a: &Standing, b: &Standing) -> Ordering {
    b.equity
        .cmp(&a.equity)
        .then_with(|| match (a.cumulative_reaction_ms, b.cumulative_reaction_ms) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        })
        .then_with(|| a.participant.cmp(&b.participant))
}

pub fn rank(accounts: &[Account], marks: &BTreeMap<Symbol, Decimal>, scores: &[RoundScore]) -> Vec<Standing> {
    let mut rows: Vec<Standing> = accounts
        .iter()
        .map(|acc| {
            let mine = scores.iter().filter(|s| s.participant == acc.participant);
            let mut total_points = 0i64;
            let mut rounds_reacted = 0u32;
            let mut reaction: Option<i64> = None;
            for s in mine {
                total_points += s.points_earned;
                if let Some(ms) = s.reaction_ms {
                    rounds_reacted += 1;
                    reaction = Some(reaction.unwrap_or(0) + ms);
                }
            }
            Standing {
                rank: 0,
                participant: acc.participant.clone(),
                equity: acc.equity(marks),
                total_points,
                rounds_reacted,
                cumulative_reaction_ms: reaction,
            }
        })
        .collect();
    rows.sort_by(by_rank);
    for (i, r) in rows.iter_mut().enumerate() {
        r.rank = i + 1;
    }
    rows
}

impl Game {
    /// Standings right now, equity marked at current prices.
    pub async fn leaderboard(&self) -> EngineResult<Vec<Standing>> {
        let accounts = self.portfolio.snapshots().await?;
        let marks = self.ledger.marks(self.clock.now_ms()).await;
        let scores = self.scores.all().await;
        Ok(rank(&accounts, &marks, &scores))
    }
}
