// ===============================
// src/lobby.rs (profiles, ticker catalog, game registry)
// ===============================
//
// Everything around a game that is not the round engine itself:
// - profiles  : the identities games authorize against
// - tickers   : static catalog, a game picks its tickers from here
// - games     : create / find by id or join code / list / delete (PENDING only)
// - standings : per-player stats and the cross-game points leaderboard
//
use ahash::AHashMap as HashMap;
use rand::{distributions::Uniform, Rng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::info;

use crate::clock::SharedClock;
use crate::config::EngineCfg;
use crate::domain::{GameId, GameStatus, ParticipantId, Record, Symbol, Ticker, TsMs};
use crate::errors::{EngineError, EngineResult, NotFoundError, StateError};
use crate::game::{Game, Tally};
use crate::metrics::CONFIG_TICKER;
use crate::plan::GamePlan;

pub const JOIN_CODE_LEN: usize = 6;
pub const MAX_STANDINGS: usize = 100;
const JOIN_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PlayerLevel {
    #[default]
    Beginner,
    Intermediate,
    Advanced,
    Expert,
}

impl PlayerLevel {
    /// Experience tier from the number of games joined.
    pub fn for_games(total_games: u32) -> Self {
        match total_games {
            0..=9 => PlayerLevel::Beginner,
            10..=24 => PlayerLevel::Intermediate,
            25..=49 => PlayerLevel::Advanced,
            _ => PlayerLevel::Expert,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PlayerLevel::Beginner => "BEGINNER",
            PlayerLevel::Intermediate => "INTERMEDIATE",
            PlayerLevel::Advanced => "ADVANCED",
            PlayerLevel::Expert => "EXPERT",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Profile {
    pub id: ParticipantId,
    pub username: String,
    pub full_name: Option<String>,
    pub level: PlayerLevel,
    pub total_games: u32,
    pub created_at: TsMs,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlayerStats {
    pub profile: Profile,
    pub total_trades: usize,
    /// Mean reaction over every committed trade; `None` before the first one.
    pub avg_response_ms: Option<i64>,
    pub total_points: i64,
}

/// One row of the cross-game leaderboard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LobbyStanding {
    pub rank: usize,
    pub participant: ParticipantId,
    pub username: String,
    pub total_points: i64,
    pub total_games: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameSummary {
    pub id: GameId,
    pub code: String,
    pub status: GameStatus,
    pub rounds: u32,
    pub participants: usize,
    pub created_at: TsMs,
    pub started_at: Option<TsMs>,
    pub completed_at: Option<TsMs>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Health {
    pub profiles: usize,
    pub tickers: usize,
    pub games: usize,
    pub active_games: usize,
    pub participants: usize,
    pub price_snapshots: u64,
    pub trades: usize,
}

fn validate_username(username: &str) -> EngineResult<String> {
    let u = username.trim();
    if !(3..=30).contains(&u.chars().count()) {
        return Err(EngineError::validation("username must be 3-30 characters"));
    }
    if !u.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.') {
        return Err(EngineError::validation("username may only contain letters, digits, '_', '-' and '.'"));
    }
    Ok(u.to_string())
}

fn new_join_code() -> String {
    let pick = Uniform::from(0..JOIN_CODE_ALPHABET.len());
    rand::thread_rng()
        .sample_iter(pick)
        .take(JOIN_CODE_LEN)
        .map(|i| JOIN_CODE_ALPHABET[i] as char)
        .collect()
}

pub struct Lobby {
    cfg: EngineCfg,
    clock: SharedClock,
    journal: Option<mpsc::Sender<Record>>,
    profiles: RwLock<BTreeMap<ParticipantId, Profile>>,
    tickers: RwLock<BTreeMap<Symbol, Ticker>>,
    games: RwLock<BTreeMap<GameId, Arc<Game>>>,
    codes: RwLock<HashMap<String, GameId>>,
    next_game: AtomicU64,
}

impl Lobby {
    pub fn new(cfg: EngineCfg, clock: SharedClock) -> Self {
        Self {
            cfg,
            clock,
            journal: None,
            profiles: RwLock::new(BTreeMap::new()),
            tickers: RwLock::new(BTreeMap::new()),
            games: RwLock::new(BTreeMap::new()),
            codes: RwLock::new(HashMap::new()),
            next_game: AtomicU64::new(1),
        }
    }

    /// Every game created afterwards journals into `tx`.
    pub fn with_journal(mut self, tx: mpsc::Sender<Record>) -> Self {
        self.journal = Some(tx);
        self
    }

    // ---------- profiles ----------

    pub async fn register(&self, id: ParticipantId, username: &str, full_name: Option<String>) -> EngineResult<Profile> {
        let username = validate_username(username)?;
        let mut profiles = self.profiles.write().await;
        if profiles.contains_key(&id) {
            return Err(EngineError::validation(format!("profile {id} already exists")));
        }
        if profiles.values().any(|p| p.username.eq_ignore_ascii_case(&username)) {
            return Err(EngineError::validation(format!("username {username} is taken")));
        }
        let profile = Profile {
            id: id.clone(),
            username,
            full_name,
            level: PlayerLevel::default(),
            total_games: 0,
            created_at: self.clock.now_ms(),
        };
        profiles.insert(id, profile.clone());
        Ok(profile)
    }

    pub async fn profile(&self, id: &ParticipantId) -> EngineResult<Profile> {
        self.profiles.read().await.get(id).cloned().ok_or_else(|| NotFoundError::Profile(id.to_string()).into())
    }

    pub async fn profiles(&self, level: Option<PlayerLevel>) -> Vec<Profile> {
        self.profiles
            .read()
            .await
            .values()
            .filter(|p| level.map_or(true, |l| p.level == l))
            .cloned()
            .collect()
    }

    /// Owner only.
    pub async fn update_full_name(&self, requester: &ParticipantId, id: &ParticipantId, full_name: Option<String>) -> EngineResult<Profile> {
        if requester != id {
            return Err(EngineError::AccessDenied(format!("{requester} cannot edit profile {id}")));
        }
        let mut profiles = self.profiles.write().await;
        let p = profiles.get_mut(id).ok_or_else(|| NotFoundError::Profile(id.to_string()))?;
        p.full_name = full_name.map(|n| n.trim().to_string()).filter(|n| !n.is_empty());
        Ok(p.clone())
    }

    /// Owner only. Game memberships stay; the id just stops resolving here.
    pub async fn delete_profile(&self, requester: &ParticipantId, id: &ParticipantId) -> EngineResult<()> {
        if requester != id {
            return Err(EngineError::AccessDenied(format!("{requester} cannot delete profile {id}")));
        }
        self.profiles
            .write()
            .await
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| NotFoundError::Profile(id.to_string()).into())
    }

    // ---------- ticker catalog ----------

    pub async fn add_ticker(&self, symbol: &str, name: Option<String>, sector: Option<String>) -> EngineResult<Ticker> {
        let symbol = symbol.trim().to_ascii_uppercase();
        if symbol.is_empty() || symbol.len() > 16 {
            return Err(EngineError::validation("ticker symbol must be 1-16 characters"));
        }
        let mut tickers = self.tickers.write().await;
        if tickers.contains_key(&symbol) {
            return Err(EngineError::validation(format!("ticker {symbol} already exists")));
        }
        let t = Ticker { symbol: symbol.clone(), name, sector };
        tickers.insert(symbol.clone(), t.clone());
        CONFIG_TICKER.with_label_values(&[symbol.as_str()]).set(1);
        Ok(t)
    }

    pub async fn tickers(&self) -> Vec<Ticker> { self.tickers.read().await.values().cloned().collect() }

    // ---------- games ----------

    pub async fn create_game(&self, plan: GamePlan) -> EngineResult<Arc<Game>> {
        let tickers = {
            let catalog = self.tickers.read().await;
            plan.initial_prices
                .keys()
                .map(|s| catalog.get(s).cloned().ok_or_else(|| NotFoundError::Ticker(s.clone())))
                .collect::<Result<Vec<_>, _>>()?
        };

        let mut codes = self.codes.write().await;
        let code = loop {
            let c = new_join_code();
            if !codes.contains_key(&c) {
                break c;
            }
        };
        let id = GameId(self.next_game.fetch_add(1, Ordering::Relaxed));
        let game = Arc::new(
            Game::create(id, code.clone(), plan, tickers, self.cfg.clone(), self.clock.clone(), self.journal.clone())
                .await?,
        );
        codes.insert(code, id);
        self.games.write().await.insert(id, game.clone());
        Ok(game)
    }

    pub async fn game(&self, id: GameId) -> EngineResult<Arc<Game>> {
        self.games.read().await.get(&id).cloned().ok_or_else(|| NotFoundError::Game(id.to_string()).into())
    }

    pub async fn game_by_code(&self, code: &str) -> EngineResult<Arc<Game>> {
        let code = code.trim().to_ascii_uppercase();
        let id = self.codes.read().await.get(&code).copied().ok_or_else(|| NotFoundError::Game(code.clone()))?;
        self.game(id).await
    }

    pub async fn list_games(&self, status: Option<GameStatus>) -> Vec<GameSummary> {
        let games: Vec<Arc<Game>> = self.games.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for g in games {
            let st = g.status();
            if status.map_or(true, |s| s == st) {
                let (started_at, completed_at) = g.timeline().await;
                out.push(GameSummary {
                    id: g.id(),
                    code: g.code().to_string(),
                    status: st,
                    rounds: g.round_count(),
                    participants: g.participants().await.len(),
                    created_at: g.created_at(),
                    started_at,
                    completed_at,
                });
            }
        }
        out
    }

    pub async fn delete_game(&self, id: GameId) -> EngineResult<()> {
        let code = {
            let mut games = self.games.write().await;
            let g = games.get(&id).ok_or_else(|| NotFoundError::Game(id.to_string()))?;
            if g.status() != GameStatus::Pending {
                return Err(StateError::InvalidTransition { from: g.status().to_string(), to: "deleted".into() }.into());
            }
            let code = g.code().to_string();
            games.remove(&id);
            code
        };
        // never hold `games` while taking `codes`
        self.codes.write().await.remove(&code);
        info!(game = %id, "lobby: game deleted");
        Ok(())
    }

    pub async fn join(&self, game_id: GameId, participant: &ParticipantId) -> EngineResult<Arc<Game>> {
        self.profile(participant).await?;
        let game = self.game(game_id).await?;
        game.join(participant).await?;
        // profile may have been deleted meanwhile; the membership stands either way
        if let Some(p) = self.profiles.write().await.get_mut(participant) {
            p.total_games += 1;
            p.level = PlayerLevel::for_games(p.total_games);
        }
        Ok(game)
    }

    pub async fn join_by_code(&self, code: &str, participant: &ParticipantId) -> EngineResult<Arc<Game>> {
        let id = self.game_by_code(code).await?.id();
        self.join(id, participant).await
    }

    // ---------- standings ----------

    async fn tally(&self, participant: &ParticipantId) -> EngineResult<Tally> {
        let games: Vec<Arc<Game>> = self.games.read().await.values().cloned().collect();
        let mut total = Tally::default();
        for g in games {
            if let Some(t) = g.tally(participant).await? {
                total.trades += t.trades;
                total.response_ms_total += t.response_ms_total;
                total.points += t.points;
            }
        }
        Ok(total)
    }

    /// Public aggregates for one player across every game they joined.
    pub async fn player_stats(&self, id: &ParticipantId) -> EngineResult<PlayerStats> {
        let profile = self.profile(id).await?;
        let t = self.tally(id).await?;
        Ok(PlayerStats {
            profile,
            total_trades: t.trades,
            avg_response_ms: (t.trades > 0).then(|| t.response_ms_total / t.trades as i64),
            total_points: t.points,
        })
    }

    /// Registered players ranked by points over all games: points desc,
    /// games played desc, then username.
    pub async fn leaderboard(&self, limit: usize) -> EngineResult<Vec<LobbyStanding>> {
        if limit == 0 || limit > MAX_STANDINGS {
            return Err(EngineError::validation(format!("limit must be within 1..={MAX_STANDINGS}")));
        }
        let mut rows = Vec::new();
        for p in self.profiles(None).await {
            let t = self.tally(&p.id).await?;
            rows.push(LobbyStanding {
                rank: 0,
                participant: p.id,
                username: p.username,
                total_points: t.points,
                total_games: p.total_games,
            });
        }
        rows.sort_by(|a, b| {
            b.total_points
                .cmp(&a.total_points)
                .then_with(|| b.total_games.cmp(&a.total_games))
                .then_with(|| a.username.cmp(&b.username))
        });
        rows.truncate(limit);
        for (i, r) in rows.iter_mut().enumerate() {
            r.rank = i + 1;
        }
        Ok(rows)
    }

    pub async fn health(&self) -> EngineResult<Health> {
        let games: Vec<Arc<Game>> = self.games.read().await.values().cloned().collect();
        let (mut trades, mut participants, mut price_snapshots) = (0, 0, 0);
        for g in &games {
            trades += g.trade_count().await?;
            participants += g.participants().await.len();
            price_snapshots += g.snapshot_count();
        }
        Ok(Health {
            profiles: self.profiles.read().await.len(),
            tickers: self.tickers.read().await.len(),
            active_games: games.iter().filter(|g| g.status() == GameStatus::Active).count(),
            games: games.len(),
            participants,
            price_snapshots,
            trades,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::executor::TradeRequest;
    use crate::plan::RoundPlan;
    use rust_decimal_macros::dec;

    fn plan() -> GamePlan {
        GamePlan {
            starting_cash: dec!(10000),
            round_ms: 60_000,
            gap_ms: 0,
            initial_prices: BTreeMap::from([("ACME".to_string(), dec!(100))]),
            rounds: vec![RoundPlan::default()],
            start_at: None,
        }
    }

    async fn lobby() -> Lobby {
        let lobby = Lobby::new(EngineCfg::default(), Arc::new(ManualClock::new(1_000)));
        lobby.add_ticker("acme", Some("Acme Corp".into()), None).await.unwrap();
        lobby
    }

    #[test]
    fn join_codes_are_six_unambiguous_chars() {
        let c = new_join_code();
        assert_eq!(c.len(), JOIN_CODE_LEN);
        assert!(c.bytes().all(|b| JOIN_CODE_ALPHABET.contains(&b)));
    }

    #[tokio::test]
    async fn profiles_are_unique_and_owner_edited() {
        let lobby = lobby().await;
        let ann = ParticipantId::new("ann");
        lobby.register(ann.clone(), "ann_t", None).await.unwrap();
        assert_eq!(lobby.register(ParticipantId::new("x"), "ANN_T", None).await.unwrap_err().code(), "VALIDATION_ERROR");
        assert!(lobby.register(ParticipantId::new("y"), "ab", None).await.is_err());

        let bob = ParticipantId::new("bob");
        assert_eq!(lobby.update_full_name(&bob, &ann, Some("x".into())).await.unwrap_err().code(), "ACCESS_DENIED");
        let p = lobby.update_full_name(&ann, &ann, Some(" Ann T ".into())).await.unwrap();
        assert_eq!(p.full_name.as_deref(), Some("Ann T"));
        assert_eq!(lobby.profiles(None).await.len(), 1);
        assert_eq!(lobby.profiles(Some(PlayerLevel::Expert)).await.len(), 0);
        lobby.delete_profile(&ann, &ann).await.unwrap();
        assert_eq!(lobby.profile(&ann).await.unwrap_err().code(), "UNKNOWN_PROFILE");
    }

    #[tokio::test]
    async fn ticker_catalog_rejects_duplicates() {
        let lobby = lobby().await;
        assert!(lobby.add_ticker("ACME", None, None).await.is_err());
        assert!(lobby.add_ticker("", None, None).await.is_err());
        assert!(lobby.add_ticker("WAYTOOLONGSYMBOL17", None, None).await.is_err());
        assert_eq!(lobby.tickers().await.len(), 1);
    }

    #[tokio::test]
    async fn games_are_found_by_code_and_joined_once() {
        let lobby = lobby().await;
        let ann = ParticipantId::new("ann");
        lobby.register(ann.clone(), "ann_t", None).await.unwrap();

        let game = lobby.create_game(plan()).await.unwrap();
        let found = lobby.game_by_code(&game.code().to_lowercase()).await.unwrap();
        assert_eq!(found.id(), game.id());

        lobby.join_by_code(game.code(), &ann).await.unwrap();
        assert_eq!(lobby.join(game.id(), &ann).await.unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(lobby.join(game.id(), &ParticipantId::new("ghost")).await.unwrap_err().code(), "UNKNOWN_PROFILE");

        let pending = lobby.list_games(Some(GameStatus::Pending)).await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].participants, 1);
        assert_eq!(pending[0].started_at, None);
        assert!(lobby.list_games(Some(GameStatus::Active)).await.is_empty());

        let h = lobby.health().await.unwrap();
        assert_eq!((h.profiles, h.games, h.tickers, h.trades), (1, 1, 1, 0));
        assert_eq!((h.participants, h.price_snapshots), (1, 1));
    }

    #[test]
    fn level_follows_games_played() {
        assert_eq!(PlayerLevel::for_games(0), PlayerLevel::Beginner);
        assert_eq!(PlayerLevel::for_games(15), PlayerLevel::Intermediate);
        assert_eq!(PlayerLevel::for_games(30), PlayerLevel::Advanced);
        assert_eq!(PlayerLevel::for_games(50), PlayerLevel::Expert);
        assert_eq!(serde_json::to_string(&PlayerLevel::Expert).unwrap(), "\"EXPERT\"");
    }

    #[tokio::test]
    async fn stats_and_standings_span_games() {
        let clock = Arc::new(ManualClock::new(1_000));
        let lobby = Lobby::new(EngineCfg::default(), clock.clone());
        lobby.add_ticker("ACME", None, None).await.unwrap();
        let (ann, bob) = (ParticipantId::new("ann"), ParticipantId::new("bob"));
        lobby.register(ann.clone(), "ann_t", None).await.unwrap();
        lobby.register(bob.clone(), "bob_t", None).await.unwrap();

        // bob idles in a second game, ann trades twice in the first one
        let g1 = lobby.create_game(plan()).await.unwrap();
        let g2 = lobby.create_game(plan()).await.unwrap();
        lobby.join(g1.id(), &ann).await.unwrap();
        lobby.join(g1.id(), &bob).await.unwrap();
        lobby.join(g2.id(), &bob).await.unwrap();
        assert_eq!(lobby.profile(&bob).await.unwrap().total_games, 2);

        let idle = lobby.player_stats(&bob).await.unwrap();
        assert_eq!((idle.total_trades, idle.avg_response_ms), (0, None));

        g1.start().await.unwrap();
        g1.open_round(1).await.unwrap();
        clock.set(1_200);
        g1.execute_trade(TradeRequest::buy(&ann, "ACME", 1, 1)).await.unwrap();
        clock.set(1_600);
        g1.execute_trade(TradeRequest::buy(&ann, "ACME", 1, 1)).await.unwrap();
        clock.set(61_000);
        g1.close_round(1).await.unwrap();

        let stats = lobby.player_stats(&ann).await.unwrap();
        assert_eq!(stats.total_trades, 2);
        assert_eq!(stats.avg_response_ms, Some(400));
        assert!(stats.total_points > 0);

        let board = lobby.leaderboard(10).await.unwrap();
        let names: Vec<&str> = board.iter().map(|r| r.username.as_str()).collect();
        assert_eq!(names, vec!["ann_t", "bob_t"]);
        assert_eq!(board[1].rank, 2);
        assert_eq!(lobby.leaderboard(1).await.unwrap().len(), 1);
        assert_eq!(lobby.leaderboard(0).await.unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(lobby.leaderboard(101).await.unwrap_err().code(), "VALIDATION_ERROR");
        assert_eq!(lobby.player_stats(&ParticipantId::new("ghost")).await.unwrap_err().code(), "UNKNOWN_PROFILE");

        let h = lobby.health().await.unwrap();
        assert_eq!((h.games, h.participants, h.trades), (2, 3, 2));
    }

    #[tokio::test]
    async fn unknown_ticker_in_plan_is_rejected() {
        let lobby = lobby().await;
        let mut p = plan();
        p.initial_prices.insert("ZZZ".into(), dec!(5));
        assert_eq!(lobby.create_game(p).await.unwrap_err().code(), "UNKNOWN_TICKER");
    }

    #[tokio::test]
    async fn only_pending_games_can_be_deleted() {
        let lobby = lobby().await;
        let ann = ParticipantId::new("ann");
        lobby.register(ann.clone(), "ann_t", None).await.unwrap();

        let g1 = lobby.create_game(plan()).await.unwrap();
        lobby.delete_game(g1.id()).await.unwrap();
        assert!(lobby.game_by_code(g1.code()).await.is_err());

        let g2 = lobby.create_game(plan()).await.unwrap();
        lobby.join(g2.id(), &ann).await.unwrap();
        g2.start().await.unwrap();
        assert_eq!(lobby.delete_game(g2.id()).await.unwrap_err().code(), "INVALID_TRANSITION");
    }
}
