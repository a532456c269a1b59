// ===============================
// src/main.rs
// ===============================
/*
 # jalankan demo (3 ronde, 4 bot), journal ke file
 RECORD_FILE=./data/game.jsonl RUST_LOG=info cargo run --release

 # skor & aktivitas
curl -s localhost:9898/metrics | egrep '^(trades_total|trade_rejects_total|market_events_fired_total|rounds_closed_total)'

 # konfigurasi yang aktif
curl -s localhost:9898/metrics | egrep '^config_(ticker|macro_policy|rounds)'
*/
/*
=============================================================================
Project : hedge_arena — real-time market-shock trading game engine in Rust
Module  : main.rs
Version : 0.5.0
Author  : Kukuh Tripamungkas Wicaksono (Kukuh TW)
License : MIT (see LICENSE)

Summary : Runs timed trading rounds over a shared price feed, fires scripted
          market shocks, settles trades atomically per player, scores each
          round, ranks players, exposes Prometheus metrics, and records JSONL
          events.
=============================================================================
*/
use futures_util::future::join_all;
use std::sync::Arc;
use tokio::{
    select,
    sync::{mpsc, watch},
    time::{interval, Duration, MissedTickBehavior},
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use hedge_arena::{
    bots::{self, BotKind},
    clock::TokioClock,
    config,
    domain::{GameStatus, ParticipantId, Record},
    metrics,
    plan::GamePlan,
    recorder, scheduler, Lobby,
};

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // ---- Load config ----
    let (args, cfg) = match config::load() {
        Ok(loaded) => loaded,
        Err(e) => {
            error!(code = e.code(), error = %e, "invalid engine config");
            return;
        }
    };

    // ---- Metrics ----
    metrics::init();
    metrics::serve_metrics(args.metrics_port);

    let tickers = config::parse_tickers(&args.tickers);
    info!(
        tickers = ?tickers.iter().map(|(t, _)| t.symbol.as_str()).collect::<Vec<_>>(),
        rounds = args.rounds,
        round_ms = args.round_ms,
        gap_ms = args.gap_ms,
        bots = args.bots,
        macro_policy = cfg.macro_policy.as_str(),
        "startup config"
    );
    metrics::CONFIG_MACRO_POLICY.with_label_values(&[cfg.macro_policy.as_str()]).set(1);
    metrics::CONFIG_ROUNDS.set(args.rounds as i64);

    // ---- Recorder (optional) ----
    let (rec_tx, rec_rx) = mpsc::channel::<Record>(8192);
    let recorder_task = args.record_file.clone().map(|path| tokio::spawn(recorder::run(rec_rx, path)));

    // ---- Lobby: tickers, players, one game ----
    let lobby = {
        let l = Lobby::new(cfg.clone(), Arc::new(TokioClock::new()));
        if recorder_task.is_some() { l.with_journal(rec_tx.clone()) } else { l }
    };
    for (t, _) in &tickers {
        if let Err(e) = lobby.add_ticker(&t.symbol, t.name.clone(), t.sector.clone()).await {
            warn!(symbol = %t.symbol, error = %e, "skip ticker");
        }
    }

    let plan = GamePlan::random(
        args.seed,
        config::initial_prices(&tickers),
        args.starting_cash,
        args.rounds,
        args.events_per_round,
        args.round_ms,
        args.gap_ms,
    );
    let game = match lobby.create_game(plan).await {
        Ok(g) => g,
        Err(e) => {
            error!(code = e.code(), error = %e, "cannot create game");
            return;
        }
    };
    info!(game = %game.id(), code = %game.code(), "game created");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut bot_tasks = Vec::new();
    for i in 0..args.bots {
        let kind = if i % 2 == 0 { BotKind::DipBuyer } else { BotKind::Momentum };
        let me = ParticipantId::new(format!("bot{:02}", i + 1));
        let username = format!("{}_{:02}", kind.as_str(), i + 1);
        if let Err(e) = lobby.register(me.clone(), &username, None).await {
            warn!(bot = %me, error = %e, "register failed");
            continue;
        }
        if let Err(e) = lobby.join_by_code(game.code(), &me).await {
            warn!(bot = %me, error = %e, "join failed");
            continue;
        }
        bot_tasks.push(tokio::spawn(bots::run(game.clone(), me, kind, shutdown_rx.clone())));
    }

    // ---- Scheduler ----
    let sched = tokio::spawn(scheduler::run(game.clone(), shutdown_rx.clone()));
    if let Err(e) = game.start().await {
        error!(code = e.code(), error = %e, "cannot start game");
        let _ = shutdown_tx.send(true);
        return;
    }

    // ---- Heartbeat: leaderboard until the game completes or Ctrl-C ----
    let mut status = game.subscribe_status();
    let mut hb = interval(Duration::from_millis(args.heartbeat_ms.max(100)));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        select! {
            _ = hb.tick() => {
                let (round, phase) = game.phase().await;
                let leader = game.leaderboard().await.ok().and_then(|b| b.into_iter().next());
                info!(
                    round = ?round,
                    %phase,
                    trades = ?game.trade_count().await.ok(),
                    leader = ?leader.as_ref().map(|s| (s.participant.as_str().to_string(), s.total_points)),
                    "heartbeat"
                );
            }
            r = status.changed() => {
                if r.is_err() || *status.borrow() == GameStatus::Completed { break; }
            }
            _ = tokio::signal::ctrl_c() => {
                warn!("ctrl-c, shutting down");
                break;
            }
        }
    }
    let _ = shutdown_tx.send(true);

    match sched.await {
        Ok(Err(e)) => error!(code = e.code(), error = %e, "scheduler failed"),
        Err(e) => error!(?e, "scheduler task panicked"),
        Ok(Ok(())) => {}
    }
    for r in join_all(bot_tasks).await {
        if let Err(e) = r {
            warn!(?e, "bot task panicked");
        }
    }

    // ---- Final standings ----
    match game.leaderboard().await {
        Ok(board) => {
            for s in board {
                info!(
                    rank = s.rank,
                    participant = %s.participant,
                    points = s.total_points,
                    equity = %s.equity,
                    reacted = s.rounds_reacted,
                    reaction_ms = ?s.cumulative_reaction_ms,
                    "final standing"
                );
            }
        }
        Err(e) => error!(code = e.code(), error = %e, "leaderboard unavailable"),
    }
    match lobby.health().await {
        Ok(h) => info!(
            games = h.games,
            profiles = h.profiles,
            participants = h.participants,
            price_snapshots = h.price_snapshots,
            trades = h.trades,
            "done"
        ),
        Err(e) => warn!(code = e.code(), error = %e, "health unavailable"),
    }

    // close the journal: every sender must go before the recorder drains
    drop(lobby);
    drop(game);
    drop(rec_tx);
    if let Some(task) = recorder_task {
        let _ = task.await;
    }
}
