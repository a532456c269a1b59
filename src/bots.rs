// ===============================
// src/bots.rs (simulated players)
// ===============================
//
// Dua gaya pemain untuk demo & soak test:
// 1) DipBuyer (mean-reversion): harga < rata-rata N snapshot - edge% -> Buy,
//    harga > rata-rata + edge% -> Sell (kalau pegang barang).
// 2) Momentum: bereaksi hanya ke snapshot hasil event; naik >= edge% -> Buy,
//    turun >= edge% -> Sell.
//
// State struct murni (on_snapshot) dipisah dari loop async supaya gampang dites.
// Bot trading lewat Game::execute_trade persis seperti pemain manusia.
//
use ahash::AHashMap as HashMap;
use rand::Rng;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::{
    select,
    sync::{broadcast::error::RecvError, watch},
    time::{sleep, Duration},
};
use tracing::{debug, info, warn};

use crate::domain::{GameStatus, ParticipantId, PriceSnapshot, Side, Symbol};
use crate::executor::TradeRequest;
use crate::game::Game;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BotKind { DipBuyer, Momentum }

impl BotKind {
    pub fn as_str(&self) -> &'static str {
        match self { BotKind::DipBuyer => "dip_buyer", BotKind::Momentum => "momentum" }
    }
}

// -----------------------------------------------------------------------------
// DipBuyer: rolling mean over the last `w` prices of one ticker.
// -----------------------------------------------------------------------------
pub struct DipBuyer {
    window: VecDeque<Decimal>,
    sum: Decimal,
    w: usize,
    edge_pct: Decimal,
}

impl DipBuyer {
    pub fn new(w: usize, edge_pct: Decimal) -> Self {
        Self { window: VecDeque::with_capacity(w), sum: Decimal::ZERO, w: w.max(1), edge_pct }
    }

    fn fair(&self) -> Option<Decimal> {
        if self.window.is_empty() { None } else { Some(self.sum / Decimal::from(self.window.len())) }
    }

    fn push(&mut self, px: Decimal) {
        if self.window.len() == self.w {
            if let Some(x) = self.window.pop_front() { self.sum -= x; }
        }
        self.window.push_back(px);
        self.sum += px;
    }

    pub fn on_price(&mut self, px: Decimal) -> Option<Side> {
        // compare against the mean *before* this print
        let signal = self.fair().and_then(|fair| {
            let band = fair * self.edge_pct / Decimal::ONE_HUNDRED;
            if px < fair - band {
                Some(Side::Buy)
            } else if px > fair + band {
                Some(Side::Sell)
            } else {
                None
            }
        });
        self.push(px);
        signal
    }
}

// -----------------------------------------------------------------------------
// Momentum: follows event-driven jumps.
// -----------------------------------------------------------------------------
pub struct Momentum {
    last: Option<Decimal>,
    edge_pct: Decimal,
}

impl Momentum {
    pub fn new(edge_pct: Decimal) -> Self { Self { last: None, edge_pct } }

    pub fn on_snapshot(&mut self, s: &PriceSnapshot) -> Option<Side> {
        let prev = self.last.replace(s.price)?;
        if s.source_event.is_none() || prev.is_zero() {
            return None;
        }
        let move_pct = (s.price - prev) / prev * Decimal::ONE_HUNDRED;
        if move_pct >= self.edge_pct {
            Some(Side::Buy)
        } else if move_pct <= -self.edge_pct {
            Some(Side::Sell)
        } else {
            None
        }
    }
}

enum Brain {
    Dip(HashMap<Symbol, DipBuyer>),
    Mom(HashMap<Symbol, Momentum>),
}

impl Brain {
    fn new(kind: BotKind) -> Self {
        match kind {
            BotKind::DipBuyer => Brain::Dip(HashMap::new()),
            BotKind::Momentum => Brain::Mom(HashMap::new()),
        }
    }

    fn seed(&mut self, symbol: &str, px: Decimal) {
        match self {
            Brain::Dip(m) => { m.entry(symbol.to_string()).or_insert_with(|| DipBuyer::new(4, Decimal::new(3, 0))).push(px); }
            Brain::Mom(m) => { m.entry(symbol.to_string()).or_insert_with(|| Momentum::new(Decimal::new(2, 0))).last = Some(px); }
        }
    }

    fn on_snapshot(&mut self, s: &PriceSnapshot) -> Option<Side> {
        match self {
            Brain::Dip(m) => m.entry(s.symbol.clone()).or_insert_with(|| DipBuyer::new(4, Decimal::new(3, 0))).on_price(s.price),
            Brain::Mom(m) => m.entry(s.symbol.clone()).or_insert_with(|| Momentum::new(Decimal::new(2, 0))).on_snapshot(s),
        }
    }
}

/// Size and send one order for the open round. Buys spend a fifth of the cash,
/// sells dump the whole position.
async fn act(game: &Game, me: &ParticipantId, symbol: &str, side: Side) {
    let Some(round) = game.current_round().await else { return };
    let view = match game.portfolio(me).await {
        Ok(v) => v,
        Err(e) => {
            warn!(bot = %me, code = e.code(), "bot: portfolio unavailable");
            return;
        }
    };
    let quantity = match side {
        Side::Buy => match game.price(symbol).await {
            Ok(q) if !q.price.is_zero() => (view.cash / Decimal::from(5) / q.price).floor().to_u64().unwrap_or(0),
            _ => 0,
        },
        Side::Sell => view.positions.iter().find(|p| p.symbol == symbol).map(|p| p.quantity).unwrap_or(0),
    };
    if quantity == 0 {
        return;
    }
    let req = TradeRequest { participant: me.clone(), symbol: symbol.to_string(), side, quantity, round_no: round.round_no };
    if let Ok(t) = game.execute_trade(req).await {
        debug!(bot = %me, trade = %t.id, side = side.as_str(), %symbol, qty = t.quantity, "bot: filled");
    }
}

pub async fn run(game: Arc<Game>, me: ParticipantId, kind: BotKind, mut shutdown: watch::Receiver<bool>) {
    let mut rx = game.subscribe_prices();
    let mut status = game.subscribe_status();
    let mut brain = Brain::new(kind);
    for t in game.tickers() {
        if let Ok(q) = game.price(&t.symbol).await {
            brain.seed(&t.symbol, q.price);
        }
    }
    info!(bot = %me, kind = kind.as_str(), game = %game.id(), "bot: started");

    loop {
        select! {
            r = rx.recv() => match r {
                Ok(snap) => {
                    if let Some(side) = brain.on_snapshot(&snap) {
                        // human-ish think time
                        let think = rand::thread_rng().gen_range(50..800);
                        sleep(Duration::from_millis(think)).await;
                        act(&game, &me, &snap.symbol, side).await;
                    }
                }
                Err(RecvError::Lagged(n)) => warn!(bot = %me, skipped = n, "bot: lagged on price feed"),
                Err(RecvError::Closed) => break,
            },
            r = status.changed() => {
                if r.is_err() || *status.borrow() == GameStatus::Completed { break; }
            }
            _ = shutdown.changed() => break,
        }
    }
    info!(bot = %me, "bot: stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{EventId, GameId};
    use rust_decimal_macros::dec;

    fn snap(px: Decimal, ev: Option<u64>) -> PriceSnapshot {
        PriceSnapshot {
            id: 1,
            game_id: GameId(1),
            round_no: 1,
            symbol: "ACME".into(),
            price: px,
            taken_at: 0,
            source_event: ev.map(EventId),
        }
    }

    #[test]
    fn dip_buyer_buys_dips_and_sells_pops() {
        let mut b = DipBuyer::new(4, dec!(3));
        assert_eq!(b.on_price(dec!(100)), None);
        assert_eq!(b.on_price(dec!(99)), None);
        assert_eq!(b.on_price(dec!(90)), Some(Side::Buy));
        assert_eq!(b.on_price(dec!(120)), Some(Side::Sell));
    }

    #[test]
    fn momentum_follows_event_moves_only() {
        let mut m = Momentum::new(dec!(2));
        assert_eq!(m.on_snapshot(&snap(dec!(100), None)), None);
        assert_eq!(m.on_snapshot(&snap(dec!(80), None)), None);
        assert_eq!(m.on_snapshot(&snap(dec!(88), Some(1))), Some(Side::Buy));
        assert_eq!(m.on_snapshot(&snap(dec!(87.5), Some(2))), None);
        assert_eq!(m.on_snapshot(&snap(dec!(70), Some(3))), Some(Side::Sell));
    }
}
