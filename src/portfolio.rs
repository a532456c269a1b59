// ===============================
// src/portfolio.rs (cash & positions store)
// ===============================
//
// One account per participant: cash, materialized holdings and the committed
// trade list. Each account sits behind its own async mutex, so trades of
// different participants never contend, while one participant's trades are
// strictly serialized (single writer).
//
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tokio::time::timeout;

use crate::domain::{ParticipantId, RoundNo, Side, Symbol, Trade};
use crate::errors::{BusinessError, EngineError, EngineResult, NotFoundError};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Holding {
    pub quantity: u64,
    /// Cost of the shares still held (reduced pro rata on sells).
    pub cost_basis: Decimal,
}

impl Holding {
    pub fn avg_price(&self) -> Decimal {
        if self.quantity == 0 { Decimal::ZERO } else { self.cost_basis / Decimal::from(self.quantity) }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    pub participant: ParticipantId,
    pub cash: Decimal,
    pub holdings: BTreeMap<Symbol, Holding>,
    /// Committed trades in commit order.
    pub trades: Vec<Trade>,
    pub version: u64,
}

impl Account {
    pub fn new(participant: ParticipantId, cash: Decimal) -> Self {
        Self { participant, cash, holdings: BTreeMap::new(), trades: Vec::new(), version: 0 }
    }

    pub fn position(&self, symbol: &str) -> u64 {
        self.holdings.get(symbol).map(|h| h.quantity).unwrap_or(0)
    }

    /// Pre-trade check; returns the notional on success. No mutation.
    /// A buy whose notional does not fit in a Decimal can never be funded.
    pub fn check(&self, side: Side, symbol: &str, quantity: u64, price: Decimal) -> Result<Decimal, BusinessError> {
        let notional = price.checked_mul(Decimal::from(quantity));
        match side {
            Side::Buy if self.position(symbol).checked_add(quantity).is_none() => {
                Err(BusinessError::NotionalOverflow { symbol: symbol.to_string(), quantity })
            }
            Side::Buy => match notional {
                Some(n) if n <= self.cash => Ok(n),
                Some(n) => Err(BusinessError::InsufficientFunds { required: n, available: self.cash }),
                None => Err(BusinessError::InsufficientFunds { required: Decimal::MAX, available: self.cash }),
            },
            Side::Sell => {
                let held = self.position(symbol);
                if held < quantity {
                    return Err(BusinessError::InsufficientShares { symbol: symbol.to_string(), required: quantity, held });
                }
                notional
                    .filter(|n| self.cash.checked_add(*n).is_some())
                    .ok_or_else(|| BusinessError::NotionalOverflow { symbol: symbol.to_string(), quantity })
            }
        }
    }

    /// Check and apply in one step: either everything (cash, holding, trade
    /// record) changes or nothing does.
    pub fn settle(&mut self, trade: Trade) -> Result<(), BusinessError> {
        let notional = self.check(trade.side, &trade.symbol, trade.quantity, trade.price)?;
        match trade.side {
            Side::Buy => {
                self.cash -= notional;
                let h = self.holdings.entry(trade.symbol.clone()).or_default();
                h.quantity += trade.quantity;
                h.cost_basis += notional;
            }
            Side::Sell => {
                self.cash += notional;
                if let Some(h) = self.holdings.get_mut(&trade.symbol) {
                    let released = h.avg_price() * Decimal::from(trade.quantity);
                    h.quantity -= trade.quantity;
                    h.cost_basis = if h.quantity == 0 { Decimal::ZERO } else { h.cost_basis - released };
                }
                self.holdings.retain(|_, h| h.quantity > 0);
            }
        }
        self.trades.push(trade);
        self.version += 1;
        Ok(())
    }

    /// cash + sum(qty * mark). Tickers without a mark contribute nothing.
    pub fn equity(&self, marks: &BTreeMap<Symbol, Decimal>) -> Decimal {
        self.cash.saturating_add(self.market_value(marks))
    }

    pub fn market_value(&self, marks: &BTreeMap<Symbol, Decimal>) -> Decimal {
        self.holdings
            .iter()
            .filter_map(|(sym, h)| marks.get(sym).map(|px| px.saturating_mul(Decimal::from(h.quantity))))
            .fold(Decimal::ZERO, |acc, v| acc.saturating_add(v))
    }

    pub fn trades_in_round(&self, round_no: RoundNo) -> impl Iterator<Item = &Trade> {
        self.trades.iter().filter(move |t| t.round_no == round_no)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PositionView {
    pub symbol: Symbol,
    pub quantity: u64,
    pub avg_price: Decimal,
    pub market_price: Option<Decimal>,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
}

/// Owner-facing read model: cash, marked positions, equity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortfolioView {
    pub participant: ParticipantId,
    pub cash: Decimal,
    pub positions: Vec<PositionView>,
    pub market_value: Decimal,
    pub unrealized_pnl: Decimal,
    pub equity: Decimal,
}

impl PortfolioView {
    pub fn build(acc: &Account, marks: &BTreeMap<Symbol, Decimal>) -> Self {
        let positions: Vec<PositionView> = acc
            .holdings
            .iter()
            .map(|(sym, h)| {
                let market_price = marks.get(sym).copied();
                let market_value = market_price.map(|px| px.saturating_mul(Decimal::from(h.quantity))).unwrap_or_default();
                PositionView {
                    symbol: sym.clone(),
                    quantity: h.quantity,
                    avg_price: h.avg_price(),
                    market_price,
                    market_value,
                    unrealized_pnl: if market_price.is_some() { market_value - h.cost_basis } else { Decimal::ZERO },
                }
            })
            .collect();
        let market_value = positions.iter().fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.market_value));
        Self {
            participant: acc.participant.clone(),
            cash: acc.cash,
            unrealized_pnl: positions.iter().fold(Decimal::ZERO, |acc, p| acc.saturating_add(p.unrealized_pnl)),
            market_value,
            equity: acc.cash.saturating_add(market_value),
            positions,
        }
    }
}

/// Rebuild an account from scratch by replaying trades in commit order.
pub fn replay(participant: ParticipantId, starting_cash: Decimal, trades: &[Trade]) -> EngineResult<Account> {
    let mut acc = Account::new(participant, starting_cash);
    for t in trades {
        acc.settle(t.clone())
            .map_err(|e| EngineError::validation(format!("replay diverged at trade {}: {e}", t.id)))?;
    }
    Ok(acc)
}

pub struct PortfolioStore {
    starting_cash: Decimal,
    lock_timeout: Duration,
    accounts: RwLock<BTreeMap<ParticipantId, Arc<Mutex<Account>>>>,
}

impl PortfolioStore {
    pub fn new(starting_cash: Decimal, lock_timeout: Duration) -> Self {
        Self { starting_cash, lock_timeout, accounts: RwLock::new(BTreeMap::new()) }
    }

    pub async fn open(&self, participant: &ParticipantId) -> EngineResult<()> {
        let mut accounts = self.accounts.write().await;
        if accounts.contains_key(participant) {
            return Err(EngineError::validation(format!("{participant} already joined")));
        }
        accounts.insert(
            participant.clone(),
            Arc::new(Mutex::new(Account::new(participant.clone(), self.starting_cash))),
        );
        Ok(())
    }

    pub async fn contains(&self, participant: &ParticipantId) -> bool {
        self.accounts.read().await.contains_key(participant)
    }

    pub async fn participants(&self) -> Vec<ParticipantId> {
        self.accounts.read().await.keys().cloned().collect()
    }

    pub async fn is_empty(&self) -> bool { self.accounts.read().await.is_empty() }

    async fn slot(&self, participant: &ParticipantId) -> EngineResult<Arc<Mutex<Account>>> {
        self.accounts
            .read()
            .await
            .get(participant)
            .cloned()
            .ok_or_else(|| NotFoundError::Participant(participant.to_string()).into())
    }

    /// Exclusive access to one account. Waiting longer than the lock timeout
    /// surfaces as a retryable conflict instead of queueing forever.
    pub async fn lock(&self, participant: &ParticipantId) -> EngineResult<OwnedMutexGuard<Account>> {
        let slot = self.slot(participant).await?;
        timeout(self.lock_timeout, slot.lock_owned())
            .await
            .map_err(|_| EngineError::ConcurrencyConflict { participant: participant.to_string() })
    }

    /// Consistent copy of one account (never a half-applied trade).
    pub async fn snapshot(&self, participant: &ParticipantId) -> EngineResult<Account> {
        Ok(self.lock(participant).await?.clone())
    }

    /// Copies of every account, ordered by participant.
    pub async fn snapshots(&self) -> EngineResult<Vec<Account>> {
        let mut out = Vec::new();
        for p in self.participants().await {
            out.push(self.snapshot(&p).await?);
        }
        Ok(out)
    }

    pub async fn trade_count(&self) -> EngineResult<usize> {
        Ok(self.snapshots().await?.iter().map(|a| a.trades.len()).sum())
    }

    /// Replay the committed trades and compare with the materialized account.
    pub async fn reconcile(&self, participant: &ParticipantId) -> EngineResult<()> {
        let acc = self.snapshot(participant).await?;
        let rebuilt = replay(participant.clone(), self.starting_cash, &acc.trades)?;
        if rebuilt.cash != acc.cash || rebuilt.holdings != acc.holdings {
            return Err(EngineError::validation(format!(
                "{participant}: materialized state diverges from trade replay"
            )));
        }
        Ok(())
    }
}
