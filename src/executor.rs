// ===============================
// src/executor.rs (Trade Executor)
// ===============================
//
// Pipeline per request:
//   validate -> game ACTIVE -> ticker -> participant
//   -> round gate (shared) -> round OPEN & in window
//   -> account lock -> price as of now -> check + settle (all or nothing)
//
// A trade that loses the race against a round close waits at most
// `closing_grace` for the gate, then gets RoundClosed.
//
use serde::{Deserialize, Serialize};
use std::sync::atomic::Ordering;
use std::time::Instant;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::domain::{GameStatus, ParticipantId, Record, RoundNo, RoundPhase, Side, Symbol, Trade, TradeId};
use crate::errors::{EngineError, EngineResult, NotFoundError, StateError};
use crate::game::Game;
use crate::metrics::{TRADES, TRADE_LATENCY, TRADE_REJECTS};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TradeRequest {
    pub participant: ParticipantId,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    pub round_no: RoundNo,
}

impl TradeRequest {
    pub fn buy(participant: &ParticipantId, symbol: &str, quantity: u64, round_no: RoundNo) -> Self {
        Self { participant: participant.clone(), symbol: symbol.into(), side: Side::Buy, quantity, round_no }
    }

    pub fn sell(participant: &ParticipantId, symbol: &str, quantity: u64, round_no: RoundNo) -> Self {
        Self { participant: participant.clone(), symbol: symbol.into(), side: Side::Sell, quantity, round_no }
    }
}

impl Game {
    /// Execute one market order at the current price. On any error nothing
    /// about the participant's cash, holdings or trade list has changed.
    pub async fn execute_trade(&self, req: TradeRequest) -> EngineResult<Trade> {
        let t0 = Instant::now();
        let res = self.try_execute(&req).await;
        TRADE_LATENCY.observe(t0.elapsed().as_secs_f64() * 1000.0);
        match &res {
            Ok(t) => {
                TRADES.with_label_values(&[t.side.as_str()]).inc();
                debug!(game = %self.id(), trade = %t.id, participant = %t.participant, side = t.side.as_str(),
                       symbol = %t.symbol, qty = t.quantity, price = %t.price, notional = %t.notional(), "trade committed");
                self.emit(Record::Trade(t.clone()));
            }
            Err(e) => {
                TRADE_REJECTS.with_label_values(&[e.code()]).inc();
                warn!(game = %self.id(), participant = %req.participant, symbol = %req.symbol,
                      code = e.code(), error = %e, "trade rejected");
            }
        }
        res
    }

    async fn try_execute(&self, req: &TradeRequest) -> EngineResult<Trade> {
        if req.quantity == 0 {
            return Err(EngineError::validation("quantity must be a positive whole number"));
        }
        let symbol = req.symbol.trim().to_ascii_uppercase();

        let st = timeout(self.cfg.closing_grace, self.state.read())
            .await
            .map_err(|_| StateError::RoundClosed { round_no: req.round_no })?;

        if st.status != GameStatus::Active {
            return Err(StateError::GameNotActive { status: st.status }.into());
        }
        if !self.ledger.knows(&symbol) {
            return Err(NotFoundError::Ticker(symbol).into());
        }
        if !self.portfolio.contains(&req.participant).await {
            return Err(NotFoundError::Participant(req.participant.to_string()).into());
        }
        let round = match (st.current, st.phase) {
            (Some(n), RoundPhase::Open) if n == req.round_no => st.round(n)?,
            _ => return Err(StateError::RoundClosed { round_no: req.round_no }.into()),
        };

        let mut acc = self.portfolio.lock(&req.participant).await?;
        // sample the clock after the lock: the quote and the commit share one instant
        let now = self.clock.now_ms();
        if !round.contains(now) {
            return Err(StateError::RoundClosed { round_no: req.round_no }.into());
        }
        let quote = self.ledger.latest(&symbol, now).await?;

        let trade = Trade {
            id: TradeId(self.trade_seq.fetch_add(1, Ordering::Relaxed)),
            game_id: self.id(),
            participant: req.participant.clone(),
            round_no: round.round_no,
            symbol,
            side: req.side,
            quantity: req.quantity,
            price: quote.price,
            executed_at: now,
            response_ms: now - round.starts_at,
        };
        acc.settle(trade.clone())?;
        Ok(trade)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::EngineCfg;
    use crate::domain::{GameId, Ticker};
    use crate::plan::{GamePlan, RoundPlan};
    use rust_decimal_macros::dec;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    /// Round 1 open at t=0 with one participant, p1.
    async fn open_game(closing_grace: Duration, lock_timeout: Duration) -> (Arc<ManualClock>, Arc<Game>) {
        let cfg = EngineCfg { closing_grace, lock_timeout, ..EngineCfg::default() };
        let plan = GamePlan {
            starting_cash: dec!(10000),
            round_ms: 60_000,
            gap_ms: 0,
            initial_prices: BTreeMap::from([("ACME".to_string(), dec!(100))]),
            rounds: vec![RoundPlan::default()],
            start_at: None,
        };
        let tickers = vec![Ticker { symbol: "ACME".into(), name: None, sector: None }];
        let clock = Arc::new(ManualClock::new(0));
        let game = Game::create(GameId(1), "EXE001".into(), plan, tickers, cfg, clock.clone(), None).await.unwrap();
        game.join(&ParticipantId::new("p1")).await.unwrap();
        game.start().await.unwrap();
        game.open_round(1).await.unwrap();
        (clock, Arc::new(game))
    }

    fn buy(qty: u64) -> TradeRequest { TradeRequest::buy(&ParticipantId::new("p1"), "ACME", qty, 1) }

    #[tokio::test]
    async fn busy_account_is_a_retryable_conflict() {
        let (clock, game) = open_game(Duration::from_millis(250), Duration::from_millis(20)).await;
        clock.set(500);
        let held = game.portfolio.lock(&ParticipantId::new("p1")).await.unwrap();

        let err = game.execute_trade(buy(10)).await.unwrap_err();
        assert_eq!(err.code(), "CONCURRENCY_CONFLICT");
        assert!(err.is_retryable());
        // counting needs every account too, and says so instead of reporting 0
        assert_eq!(game.trade_count().await.unwrap_err().code(), "CONCURRENCY_CONFLICT");
        drop(held);

        // nothing half-applied: the retry goes through against full cash
        let t = game.execute_trade(buy(10)).await.unwrap();
        assert_eq!(t.quantity, 10);
        assert_eq!(game.portfolio(&ParticipantId::new("p1")).await.unwrap().cash, dec!(9000));
    }

    #[tokio::test]
    async fn close_drains_the_trade_in_flight() {
        let (clock, game) = open_game(Duration::from_millis(50), Duration::from_secs(5)).await;
        clock.set(500);
        let held = game.portfolio.lock(&ParticipantId::new("p1")).await.unwrap();

        // the trade takes the round gate, then parks on the account lock
        let g = game.clone();
        let trade = tokio::spawn(async move { g.execute_trade(buy(10)).await });
        tokio::time::sleep(Duration::from_millis(20)).await;

        let g = game.clone();
        let close = tokio::spawn(async move { g.close_round(1).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!close.is_finished());

        drop(held);
        let t = trade.await.unwrap().unwrap();
        let scores = close.await.unwrap().unwrap();
        assert_eq!(scores[0].reaction_ms, Some(t.response_ms));
        assert_eq!(scores[0].equity_after, dec!(10000));
    }

    #[tokio::test]
    async fn trade_behind_a_pending_close_gets_round_closed() {
        let grace = Duration::from_millis(30);
        let (clock, game) = open_game(grace, Duration::from_secs(5)).await;
        clock.set(500);
        let gate = game.state.write().await;

        let t0 = Instant::now();
        let err = game.execute_trade(buy(10)).await.unwrap_err();
        assert_eq!(err.code(), "ROUND_CLOSED");
        assert!(t0.elapsed() >= grace);
        drop(gate);

        assert_eq!(game.trade_count().await.unwrap(), 0);
        assert_eq!(game.portfolio(&ParticipantId::new("p1")).await.unwrap().cash, dec!(10000));
    }
}
