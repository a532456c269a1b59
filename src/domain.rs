// ===============================
// src/domain.rs
// ===============================
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

pub type Symbol = String;
pub type RoundNo = u32;
/// Milliseconds since the unix epoch (engine clock).
pub type TsMs = i64;

/// Prices are kept at this many decimal places after an impulse.
pub const PRICE_DP: u32 = 4;

// ----- Identifiers -----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GameId(pub u64);
impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "G{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(pub u64);
impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "EV{}", self.0) }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TradeId(pub u64);
impl fmt::Display for TradeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { write!(f, "T{}", self.0) }
}

/// Opaque, already-authenticated identity handed in by the identity layer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParticipantId(pub String);
impl ParticipantId {
    pub fn new(id: impl Into<String>) -> Self { Self(id.into()) }
    pub fn as_str(&self) -> &str { &self.0 }
}
impl fmt::Display for ParticipantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

// ----- Enums -----
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Side { Buy, Sell }
impl Side {
    pub fn as_str(&self) -> &'static str { match self { Side::Buy => "buy", Side::Sell => "sell" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum GameStatus { Pending, Active, Completed }
impl GameStatus {
    /// Position in the lifecycle; transitions only ever move forward.
    pub fn stage(&self) -> u8 { match self { GameStatus::Pending => 0, GameStatus::Active => 1, GameStatus::Completed => 2 } }
    pub fn accepts_players(&self) -> bool { matches!(self, GameStatus::Pending | GameStatus::Active) }
}
impl fmt::Display for GameStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self { GameStatus::Pending => "PENDING", GameStatus::Active => "ACTIVE", GameStatus::Completed => "COMPLETED" })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RoundPhase { Scheduled, Open, Closing, Closed }
impl fmt::Display for RoundPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RoundPhase::Scheduled => "SCHEDULED",
            RoundPhase::Open => "OPEN",
            RoundPhase::Closing => "CLOSING",
            RoundPhase::Closed => "CLOSED",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EventKind { Macro, Micro }
impl EventKind {
    pub fn as_str(&self) -> &'static str { match self { EventKind::Macro => "macro", EventKind::Micro => "micro" } }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity { Normal, Critical }
impl Severity {
    pub fn as_str(&self) -> &'static str { match self { Severity::Normal => "normal", Severity::Critical => "critical" } }
}

// ----- Reference data -----
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ticker { pub symbol: Symbol, pub name: Option<String>, pub sector: Option<String> }

/// A market shock scheduled inside one round.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketEvent {
    pub id: EventId,
    pub round_no: RoundNo,
    pub kind: EventKind,
    pub severity: Severity,
    /// Signed percentage, e.g. -20 means a 20% drop.
    pub impulse_pct: Decimal,
    /// Required for MICRO, ignored for MACRO.
    pub target: Option<Symbol>,
    /// Fire offset from the round's `starts_at`.
    pub offset_ms: i64,
    pub headline: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Round {
    pub round_no: RoundNo,
    pub starts_at: TsMs,
    pub ends_at: TsMs,
    pub events: Vec<MarketEvent>,
}

impl Round {
    /// Half-open window [starts_at, ends_at).
    pub fn contains(&self, ts: TsMs) -> bool { ts >= self.starts_at && ts < self.ends_at }
}

// ----- Append-only facts -----
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PriceSnapshot {
    pub id: u64,
    pub game_id: GameId,
    pub round_no: RoundNo,
    pub symbol: Symbol,
    pub price: Decimal,
    pub taken_at: TsMs,
    /// Event that produced this snapshot; `None` for seed prices.
    pub source_event: Option<EventId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trade {
    pub id: TradeId,
    pub game_id: GameId,
    pub participant: ParticipantId,
    pub round_no: RoundNo,
    pub symbol: Symbol,
    pub side: Side,
    pub quantity: u64,
    pub price: Decimal,
    pub executed_at: TsMs,
    pub response_ms: i64,
}

impl Trade {
    pub fn notional(&self) -> Decimal { self.price.saturating_mul(Decimal::from(self.quantity)) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoundScore {
    pub game_id: GameId,
    pub round_no: RoundNo,
    pub participant: ParticipantId,
    pub equity_before: Decimal,
    pub equity_after: Decimal,
    pub pnl_delta: Decimal,
    pub points_earned: i64,
    pub reacted: bool,
    pub reaction_ms: Option<i64>,
}

/// Journal line (JSONL). Everything the engine commits ends up here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Record {
    Price(PriceSnapshot),
    Trade(Trade),
    Score(RoundScore),
    Lifecycle { game_id: GameId, ts: TsMs, what: String },
    /// Operational warning worth keeping next to the data (late opens, skipped events).
    Note { game_id: GameId, ts: TsMs, text: String },
}
