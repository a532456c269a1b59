// ===============================
// src/game.rs (one game: lifecycle, round gate, queries)
// ===============================
//
// Lifecycle:  PENDING -> ACTIVE -> COMPLETED        (never backwards)
// Per round:  SCHEDULED -> OPEN -> CLOSING -> CLOSED (strictly by round_no)
//
// `state` doubles as the round gate: trades run under a shared guard, a round
// close takes the exclusive guard, so it waits for every in-flight trade of
// the round to commit or reject before anything is scored.
//
use rust_decimal::Decimal;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, watch, RwLock};
use tracing::{debug, info};

use crate::clock::SharedClock;
use crate::config::EngineCfg;
use crate::domain::{
    GameId, GameStatus, MarketEvent, ParticipantId, PriceSnapshot, Record, Round, RoundNo, RoundPhase,
    RoundScore, Symbol, Ticker, Trade, TsMs,
};
use crate::errors::{EngineError, EngineResult, NotFoundError, StateError};
use crate::events::EventDispatcher;
use crate::metrics::{GAMES_ACTIVE, PARTICIPANTS, ROUNDS_CLOSED};
use crate::plan::GamePlan;
use crate::portfolio::{replay, PortfolioStore, PortfolioView};
use crate::prices::PriceLedger;
use crate::scoring::{score_round, ScoreBook};

pub const MAX_PAGE: usize = 200;

#[derive(Debug, Clone)]
pub(crate) struct GameState {
    pub status: GameStatus,
    pub rounds: Vec<Round>,
    pub current: Option<RoundNo>,
    pub phase: RoundPhase,
    pub last_closed: RoundNo,
    /// Equity of every participant present when each round opened.
    pub opening_equity: BTreeMap<RoundNo, BTreeMap<ParticipantId, Decimal>>,
    pub started_at: Option<TsMs>,
    pub completed_at: Option<TsMs>,
}

impl GameState {
    pub fn round(&self, round_no: RoundNo) -> EngineResult<&Round> {
        round_no
            .checked_sub(1)
            .and_then(|i| self.rounds.get(i as usize))
            .ok_or_else(|| NotFoundError::Round(round_no).into())
    }
}

pub struct Game {
    id: GameId,
    code: String,
    created_at: TsMs,
    plan: GamePlan,
    tickers: Vec<Ticker>,
    pub(crate) cfg: EngineCfg,
    pub(crate) clock: SharedClock,
    pub(crate) ledger: Arc<PriceLedger>,
    pub(crate) dispatcher: EventDispatcher,
    pub(crate) portfolio: PortfolioStore,
    pub(crate) scores: ScoreBook,
    pub(crate) state: RwLock<GameState>,
    pub(crate) trade_seq: AtomicU64,
    status_tx: watch::Sender<GameStatus>,
    prices_tx: broadcast::Sender<PriceSnapshot>,
    journal: Option<mpsc::Sender<Record>>,
}

impl fmt::Debug for Game {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Game")
            .field("id", &self.id)
            .field("code", &self.code)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

impl Game {
    /// Build a PENDING game, seed its prices and lay out its rounds.
    pub async fn create(
        id: GameId,
        code: String,
        plan: GamePlan,
        tickers: Vec<Ticker>,
        cfg: EngineCfg,
        clock: SharedClock,
        journal: Option<mpsc::Sender<Record>>,
    ) -> EngineResult<Self> {
        plan.validate()?;
        cfg.validate()?;
        if let Some(sym) = plan.initial_prices.keys().find(|s| !tickers.iter().any(|t| &t.symbol == *s)) {
            return Err(NotFoundError::Ticker(sym.clone()).into());
        }

        let (prices_tx, _) = broadcast::channel(4096);
        let ledger = Arc::new(PriceLedger::new(id, plan.symbols()).with_feed(prices_tx.clone()));
        let now = clock.now_ms();
        let mut seeded = Vec::new();
        for (sym, px) in plan.initial_prices.iter() {
            seeded.push(ledger.append(sym, 1, *px, now, None).await?);
        }
        let dispatcher = EventDispatcher::new(ledger.clone(), cfg.macro_policy, cfg.price_floor).await;

        let rounds = layout(&plan, plan.start_at.unwrap_or(now));
        let (status_tx, _) = watch::channel(GameStatus::Pending);
        let game = Self {
            id,
            code,
            created_at: now,
            portfolio: PortfolioStore::new(plan.starting_cash, cfg.lock_timeout),
            tickers,
            plan,
            cfg,
            clock,
            ledger,
            dispatcher,
            scores: ScoreBook::new(),
            state: RwLock::new(GameState {
                status: GameStatus::Pending,
                rounds,
                current: None,
                phase: RoundPhase::Scheduled,
                last_closed: 0,
                opening_equity: BTreeMap::new(),
                started_at: None,
                completed_at: None,
            }),
            trade_seq: AtomicU64::new(1),
            status_tx,
            prices_tx,
            journal,
        };
        game.lifecycle("created");
        for s in seeded {
            game.emit(Record::Price(s));
        }
        Ok(game)
    }

    pub fn id(&self) -> GameId { self.id }
    pub fn code(&self) -> &str { &self.code }
    pub fn created_at(&self) -> TsMs { self.created_at }
    pub fn plan(&self) -> &GamePlan { &self.plan }
    pub fn tickers(&self) -> &[Ticker] { &self.tickers }
    pub fn now_ms(&self) -> TsMs { self.clock.now_ms() }

    pub fn status(&self) -> GameStatus { *self.status_tx.borrow() }
    pub fn subscribe_status(&self) -> watch::Receiver<GameStatus> { self.status_tx.subscribe() }
    pub fn subscribe_prices(&self) -> broadcast::Receiver<PriceSnapshot> { self.prices_tx.subscribe() }

    pub(crate) fn emit(&self, rec: Record) {
        if let Some(tx) = &self.journal {
            if let Err(e) = tx.try_send(rec) {
                debug!(game = %self.id, ?e, "journal full or closed, record dropped");
            }
        }
    }

    pub(crate) fn note(&self, text: impl Into<String>) {
        self.emit(Record::Note { game_id: self.id, ts: self.clock.now_ms(), text: text.into() });
    }

    fn lifecycle(&self, what: impl Into<String>) {
        let what = what.into();
        info!(game = %self.id, code = %self.code, %what, "lifecycle");
        self.emit(Record::Lifecycle { game_id: self.id, ts: self.clock.now_ms(), what });
    }

    fn set_status(&self, st: &mut GameState, next: GameStatus) -> EngineResult<()> {
        if next.stage() <= st.status.stage() {
            return Err(StateError::InvalidTransition { from: st.status.to_string(), to: next.to_string() }.into());
        }
        st.status = next;
        self.status_tx.send_replace(next);
        Ok(())
    }

    // ---------- Round Clock ----------

    pub async fn rounds(&self) -> Vec<Round> { self.state.read().await.rounds.clone() }

    pub async fn round(&self, round_no: RoundNo) -> EngineResult<Round> {
        self.state.read().await.round(round_no).cloned()
    }

    pub fn round_count(&self) -> RoundNo { self.plan.rounds.len() as RoundNo }

    /// The round currently OPEN, if any.
    pub async fn current_round(&self) -> Option<Round> {
        let st = self.state.read().await;
        match (st.current, st.phase) {
            (Some(n), RoundPhase::Open) => st.round(n).ok().cloned(),
            _ => None,
        }
    }

    pub async fn last_closed(&self) -> RoundNo { self.state.read().await.last_closed }

    /// (started_at, completed_at)
    pub async fn timeline(&self) -> (Option<TsMs>, Option<TsMs>) {
        let st = self.state.read().await;
        (st.started_at, st.completed_at)
    }

    pub async fn phase(&self) -> (Option<RoundNo>, RoundPhase) {
        let st = self.state.read().await;
        (st.current, st.phase)
    }

    pub async fn join(&self, participant: &ParticipantId) -> EngineResult<()> {
        let st = self.state.read().await;
        if !st.status.accepts_players() {
            return Err(StateError::GameNotActive { status: st.status }.into());
        }
        self.portfolio.open(participant).await?;
        drop(st);
        PARTICIPANTS.inc();
        self.lifecycle(format!("{participant} joined"));
        Ok(())
    }

    /// Explicit start (or the scheduler reaching `start_at`). Re-anchors the
    /// round windows on the current instant.
    pub async fn start(&self) -> EngineResult<Vec<Round>> {
        let mut st = self.state.write().await;
        if st.status != GameStatus::Pending {
            return Err(StateError::InvalidTransition { from: st.status.to_string(), to: GameStatus::Active.to_string() }.into());
        }
        if self.portfolio.is_empty().await {
            return Err(StateError::NoParticipants.into());
        }
        let now = self.clock.now_ms();
        st.rounds = layout(&self.plan, now);
        st.started_at = Some(now);
        self.set_status(&mut st, GameStatus::Active)?;
        let rounds = st.rounds.clone();
        drop(st);
        GAMES_ACTIVE.inc();
        self.lifecycle("started");
        Ok(rounds)
    }

    /// Open round `round_no`. Only the round right after the last closed one
    /// may open, whatever the clock says.
    pub async fn open_round(&self, round_no: RoundNo) -> EngineResult<Round> {
        let mut st = self.state.write().await;
        if st.status != GameStatus::Active {
            return Err(StateError::GameNotActive { status: st.status }.into());
        }
        let expected = st.last_closed + 1;
        if round_no != expected || st.phase == RoundPhase::Open || st.phase == RoundPhase::Closing {
            return Err(StateError::OutOfSequence { expected, got: round_no }.into());
        }
        let round = st.round(round_no)?.clone();

        // no trade can be in flight while we hold the gate exclusively
        let marks = self.ledger.marks(self.clock.now_ms()).await;
        let opening: BTreeMap<ParticipantId, Decimal> = self
            .portfolio
            .snapshots()
            .await?
            .into_iter()
            .map(|a| (a.participant.clone(), a.equity(&marks)))
            .collect();
        st.opening_equity.insert(round_no, opening);
        st.current = Some(round_no);
        st.phase = RoundPhase::Open;
        drop(st);

        self.lifecycle(format!("round {round_no} open"));
        Ok(round)
    }

    /// Fire one scheduled event of the open round. Re-delivery is a no-op.
    pub async fn fire_event(&self, ev: &MarketEvent) -> EngineResult<Vec<PriceSnapshot>> {
        {
            let st = self.state.read().await;
            if st.status != GameStatus::Active {
                return Err(StateError::GameNotActive { status: st.status }.into());
            }
            if st.current != Some(ev.round_no) || st.phase != RoundPhase::Open {
                return Err(StateError::RoundClosed { round_no: ev.round_no }.into());
            }
        }
        let written = self.dispatcher.fire(ev, self.clock.now_ms()).await?;
        for s in &written {
            self.emit(Record::Price(s.clone()));
        }
        Ok(written)
    }

    /// Close round `round_no`: stop trading, wait for in-flight trades, score
    /// everyone, then complete the game after the last round. Closing an
    /// already closed round just recomputes (and confirms) its scores.
    pub async fn close_round(&self, round_no: RoundNo) -> EngineResult<Vec<RoundScore>> {
        {
            let mut st = self.state.write().await;
            if round_no <= st.last_closed {
                drop(st);
                return self.rescore(round_no).await;
            }
            let closable = st.current == Some(round_no) && matches!(st.phase, RoundPhase::Open | RoundPhase::Closing);
            if !closable {
                return Err(StateError::InvalidTransition {
                    from: format!("round {round_no} {}", st.phase),
                    to: RoundPhase::Closed.to_string(),
                }
                .into());
            }
            st.phase = RoundPhase::Closing;
        }

        let scores = self.compute_scores(round_no).await?;
        for s in &scores {
            self.scores.record(s.clone()).await?;
            self.emit(Record::Score(s.clone()));
        }

        let completed = {
            let mut st = self.state.write().await;
            st.phase = RoundPhase::Closed;
            st.current = None;
            st.last_closed = round_no;
            if round_no >= self.round_count() {
                st.completed_at = Some(self.clock.now_ms());
                self.set_status(&mut st, GameStatus::Completed)?;
                true
            } else {
                false
            }
        };
        ROUNDS_CLOSED.inc();
        self.lifecycle(format!("round {round_no} closed"));
        if completed {
            GAMES_ACTIVE.dec();
            self.lifecycle("completed");
        }
        Ok(scores)
    }

    /// Recompute the scores of a closed round. Identical results are no-ops.
    pub async fn rescore(&self, round_no: RoundNo) -> EngineResult<Vec<RoundScore>> {
        if round_no > self.state.read().await.last_closed {
            return Err(StateError::InvalidTransition {
                from: format!("round {round_no} not closed"),
                to: "rescored".into(),
            }
            .into());
        }
        let scores = self.compute_scores(round_no).await?;
        for s in &scores {
            self.scores.record(s.clone()).await?;
        }
        Ok(scores)
    }

    async fn compute_scores(&self, round_no: RoundNo) -> EngineResult<Vec<RoundScore>> {
        let (round, opening) = {
            let st = self.state.read().await;
            (st.round(round_no)?.clone(), st.opening_equity.get(&round_no).cloned().unwrap_or_default())
        };
        // last instant inside [starts_at, ends_at)
        let marks = self.ledger.marks(round.ends_at - 1).await;
        let mut out = Vec::new();
        for live in self.portfolio.snapshots().await? {
            // the account as it stood when this round closed; later rounds
            // must not move an already final score
            let upto: Vec<Trade> = live.trades.iter().filter(|t| t.round_no <= round_no).cloned().collect();
            let at_close = replay(live.participant.clone(), self.plan.starting_cash, &upto)?;
            if !opening.contains_key(&at_close.participant) && at_close.trades_in_round(round_no).next().is_none() {
                continue;
            }
            let before = opening.get(&at_close.participant).copied().unwrap_or(self.plan.starting_cash);
            out.push(score_round(self.id, &round, &at_close, before, &marks, &self.cfg.scoring));
        }
        Ok(out)
    }

    // ---------- Queries ----------

    /// Public: latest price of a ticker right now.
    pub async fn price(&self, symbol: &str) -> EngineResult<PriceSnapshot> {
        self.ledger.latest(&symbol.to_ascii_uppercase(), self.clock.now_ms()).await
    }

    pub async fn price_history(&self, symbol: &str) -> EngineResult<Vec<PriceSnapshot>> {
        self.ledger.history(&symbol.to_ascii_uppercase()).await
    }

    pub async fn marks(&self) -> BTreeMap<Symbol, Decimal> { self.ledger.marks(self.clock.now_ms()).await }

    pub async fn participants(&self) -> Vec<ParticipantId> { self.portfolio.participants().await }

    pub async fn portfolio(&self, participant: &ParticipantId) -> EngineResult<PortfolioView> {
        let acc = self.portfolio.snapshot(participant).await?;
        Ok(PortfolioView::build(&acc, &self.marks().await))
    }

    /// Trade history, owner only, newest first.
    pub async fn trades(
        &self,
        requester: &ParticipantId,
        participant: &ParticipantId,
        round_no: Option<RoundNo>,
        limit: usize,
        offset: usize,
    ) -> EngineResult<Vec<Trade>> {
        authorize(requester, participant)?;
        if limit == 0 || limit > MAX_PAGE {
            return Err(EngineError::validation(format!("limit must be within 1..={MAX_PAGE}")));
        }
        let acc = self.portfolio.snapshot(participant).await?;
        let mut rows: Vec<Trade> = acc.trades.into_iter().filter(|t| round_no.map_or(true, |r| t.round_no == r)).collect();
        rows.sort_by(|a, b| b.executed_at.cmp(&a.executed_at).then(b.id.cmp(&a.id)));
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    /// Round scores, owner only.
    pub async fn scores_for(&self, requester: &ParticipantId, participant: &ParticipantId) -> EngineResult<Vec<RoundScore>> {
        authorize(requester, participant)?;
        if !self.portfolio.contains(participant).await {
            return Err(NotFoundError::Participant(participant.to_string()).into());
        }
        Ok(self.scores.for_participant(participant).await)
    }

    pub async fn reconcile(&self, participant: &ParticipantId) -> EngineResult<()> {
        self.portfolio.reconcile(participant).await
    }

    /// Committed trades across all participants. Fails with ConcurrencyConflict
    /// when an account stays locked past the lock timeout.
    pub async fn trade_count(&self) -> EngineResult<usize> { self.portfolio.trade_count().await }

    pub fn snapshot_count(&self) -> u64 { self.ledger.snapshot_count() }

    /// Aggregates for one participant in this game; `None` if they never joined.
    pub async fn tally(&self, participant: &ParticipantId) -> EngineResult<Option<Tally>> {
        if !self.portfolio.contains(participant).await {
            return Ok(None);
        }
        let acc = self.portfolio.snapshot(participant).await?;
        let points: i64 = self.scores.for_participant(participant).await.iter().map(|s| s.points_earned).sum();
        Ok(Some(Tally {
            trades: acc.trades.len(),
            response_ms_total: acc.trades.iter().map(|t| t.response_ms).sum(),
            points,
        }))
    }
}

/// Per-game totals of one participant, summed up by the lobby.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub trades: usize,
    pub response_ms_total: i64,
    pub points: i64,
}

fn authorize(requester: &ParticipantId, owner: &ParticipantId) -> EngineResult<()> {
    if requester != owner {
        return Err(EngineError::AccessDenied(format!("{requester} cannot read data of {owner}")));
    }
    Ok(())
}

fn layout(plan: &GamePlan, start: TsMs) -> Vec<Round> {
    plan.events()
        .into_iter()
        .enumerate()
        .map(|(i, events)| {
            let round_no = (i + 1) as RoundNo;
            let (starts_at, ends_at) = plan.window(start, round_no);
            Round { round_no, starts_at, ends_at, events }
        })
        .collect()
}
