// ===============================
// src/prices.rs (Price Ledger)
// ===============================
//
// Append-only per-ticker price history for one game.
// - Ticker set is fixed when the ledger is built (tickers are static).
// - One RwLock per ticker: appends serialize per ticker, reads run in parallel.
// - Timestamps are monotone per ticker; snapshots are never rewritten.
// - Every append is also pushed on the broadcast bus (bots, recorder, UI).
//
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{broadcast, RwLock};

use crate::domain::{EventId, GameId, PriceSnapshot, RoundNo, Symbol, TsMs};
use crate::errors::{EngineError, EngineResult, NotFoundError};
use crate::metrics::PRICE_SNAPSHOTS;

pub struct PriceLedger {
    game_id: GameId,
    books: HashMap<Symbol, RwLock<Vec<PriceSnapshot>>>,
    next_id: AtomicU64,
    feed: Option<broadcast::Sender<PriceSnapshot>>,
}

impl PriceLedger {
    pub fn new<I, S>(game_id: GameId, symbols: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Symbol>,
    {
        let books = symbols.into_iter().map(|s| (s.into(), RwLock::new(Vec::new()))).collect();
        Self { game_id, books, next_id: AtomicU64::new(1), feed: None }
    }

    pub fn with_feed(mut self, tx: broadcast::Sender<PriceSnapshot>) -> Self {
        self.feed = Some(tx);
        self
    }

    pub fn symbols(&self) -> Vec<Symbol> {
        let mut out: Vec<Symbol> = self.books.keys().cloned().collect();
        out.sort();
        out
    }

    pub fn knows(&self, symbol: &str) -> bool { self.books.contains_key(symbol) }

    fn book(&self, symbol: &str) -> EngineResult<&RwLock<Vec<PriceSnapshot>>> {
        self.books.get(symbol).ok_or_else(|| NotFoundError::Ticker(symbol.to_string()).into())
    }

    /// Append a snapshot with an explicit timestamp. Rejects non-positive
    /// prices and timestamps older than the ticker's last snapshot.
    pub async fn append(
        &self,
        symbol: &str,
        round_no: RoundNo,
        price: Decimal,
        taken_at: TsMs,
        source_event: Option<EventId>,
    ) -> EngineResult<PriceSnapshot> {
        if price <= Decimal::ZERO {
            return Err(EngineError::validation(format!("price for {symbol} must be positive, got {price}")));
        }
        let mut book = self.book(symbol)?.write().await;
        if let Some(last) = book.last() {
            if taken_at < last.taken_at {
                return Err(EngineError::validation(format!(
                    "snapshot for {symbol} at {taken_at} is older than last at {}",
                    last.taken_at
                )));
            }
        }
        Ok(self.push(&mut book, symbol, round_no, price, taken_at, source_event))
    }

    /// Read-modify-write on the latest price of one ticker, under the ticker's
    /// write lock. `taken_at` is lifted to the last snapshot's timestamp if the
    /// clock drifted backwards.
    pub async fn reprice<F>(
        &self,
        symbol: &str,
        round_no: RoundNo,
        taken_at: TsMs,
        source_event: Option<EventId>,
        f: F,
    ) -> EngineResult<PriceSnapshot>
    where
        F: FnOnce(Decimal) -> Decimal,
    {
        let mut book = self.book(symbol)?.write().await;
        let last = book
            .last()
            .ok_or_else(|| EngineError::from(NotFoundError::Price { symbol: symbol.to_string() }))?;
        let at = taken_at.max(last.taken_at);
        let price = f(last.price);
        if price <= Decimal::ZERO {
            return Err(EngineError::validation(format!("repriced {symbol} to non-positive {price}")));
        }
        Ok(self.push(&mut book, symbol, round_no, price, at, source_event))
    }

    fn push(
        &self,
        book: &mut Vec<PriceSnapshot>,
        symbol: &str,
        round_no: RoundNo,
        price: Decimal,
        taken_at: TsMs,
        source_event: Option<EventId>,
    ) -> PriceSnapshot {
        let snap = PriceSnapshot {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            game_id: self.game_id,
            round_no,
            symbol: symbol.to_string(),
            price,
            taken_at,
            source_event,
        };
        book.push(snap.clone());
        PRICE_SNAPSHOTS.inc();
        if let Some(tx) = &self.feed {
            // no subscribers is fine
            let _ = tx.send(snap.clone());
        }
        snap
    }

    /// Last snapshot with `taken_at <= as_of`.
    pub async fn latest(&self, symbol: &str, as_of: TsMs) -> EngineResult<PriceSnapshot> {
        let book = self.book(symbol)?.read().await;
        let idx = book.partition_point(|s| s.taken_at <= as_of);
        if idx == 0 {
            return Err(NotFoundError::Price { symbol: symbol.to_string() }.into());
        }
        Ok(book[idx - 1].clone())
    }

    /// Mark prices for every ticker priced at or before `as_of`.
    pub async fn marks(&self, as_of: TsMs) -> BTreeMap<Symbol, Decimal> {
        let mut out = BTreeMap::new();
        for (sym, book) in self.books.iter() {
            let book = book.read().await;
            let idx = book.partition_point(|s| s.taken_at <= as_of);
            if idx > 0 {
                out.insert(sym.clone(), book[idx - 1].price);
            }
        }
        out
    }

    pub async fn history(&self, symbol: &str) -> EngineResult<Vec<PriceSnapshot>> {
        Ok(self.book(symbol)?.read().await.clone())
    }

    /// Events that already produced at least one snapshot. Used to rebuild the
    /// dispatcher's exactly-once guard after a restart.
    pub async fn applied_events(&self) -> HashSet<EventId> {
        let mut out = HashSet::new();
        for book in self.books.values() {
            out.extend(book.read().await.iter().filter_map(|s| s.source_event));
        }
        out
    }

    pub fn snapshot_count(&self) -> u64 { self.next_id.load(Ordering::Relaxed) - 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn ledger() -> PriceLedger { PriceLedger::new(GameId(1), ["ACME", "BOLT"]) }

    #[tokio::test]
    async fn latest_respects_as_of() {
        let l = ledger();
        l.append("ACME", 1, dec!(100), 1_000, None).await.unwrap();
        l.append("ACME", 1, dec!(110), 2_000, None).await.unwrap();

        assert_eq!(l.latest("ACME", 1_500).await.unwrap().price, dec!(100));
        assert_eq!(l.latest("ACME", 2_000).await.unwrap().price, dec!(110));
        let err = l.latest("ACME", 999).await.unwrap_err();
        assert_eq!(err.code(), "NO_PRICE");
    }

    #[tokio::test]
    async fn unknown_and_unpriced_tickers() {
        let l = ledger();
        assert_eq!(l.latest("ZZZ", 0).await.unwrap_err().code(), "UNKNOWN_TICKER");
        assert_eq!(l.latest("BOLT", i64::MAX).await.unwrap_err().code(), "NO_PRICE");
    }

    #[tokio::test]
    async fn rejects_time_travel_and_bad_prices() {
        let l = ledger();
        l.append("ACME", 1, dec!(100), 2_000, None).await.unwrap();
        assert!(l.append("ACME", 1, dec!(101), 1_999, None).await.is_err());
        assert!(l.append("ACME", 1, dec!(0), 3_000, None).await.is_err());
        assert_eq!(l.history("ACME").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn reprice_lifts_stale_timestamps() {
        let l = ledger();
        l.append("ACME", 1, dec!(100), 5_000, None).await.unwrap();
        let s = l.reprice("ACME", 1, 4_000, Some(EventId(7)), |p| p * dec!(0.5)).await.unwrap();
        assert_eq!(s.taken_at, 5_000);
        assert_eq!(s.price, dec!(50));
        assert!(l.applied_events().await.contains(&EventId(7)));
    }

    #[tokio::test]
    async fn marks_skip_unpriced() {
        let l = ledger();
        l.append("ACME", 1, dec!(100), 1_000, None).await.unwrap();
        let m = l.marks(1_000).await;
        assert_eq!(m.len(), 1);
        assert_eq!(m["ACME"], dec!(100));
    }

    #[tokio::test]
    async fn feed_receives_appends() {
        let (tx, mut rx) = broadcast::channel(8);
        let l = ledger().with_feed(tx);
        l.append("BOLT", 1, dec!(12.5), 10, None).await.unwrap();
        let got = rx.recv().await.unwrap();
        assert_eq!(got.symbol, "BOLT");
        assert_eq!(l.snapshot_count(), 1);
    }
}
