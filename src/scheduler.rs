// ===============================
// src/scheduler.rs (drives the Round Clock)
// ===============================
//
// One task per game. Waits for the start (explicit, or `start_at`), then for
// each round in order: open at starts_at, fire events at starts_at+offset,
// close at ends_at. A late wake-up never reorders rounds; it only shifts the
// actual open/close instant.
//
use std::sync::Arc;
use tokio::{
    select,
    sync::watch,
    time::{sleep, Duration},
};
use tracing::{info, warn};

use crate::domain::{GameStatus, TsMs};
use crate::errors::EngineResult;
use crate::events::firing_order;
use crate::game::Game;

async fn sleep_until_ms(game: &Game, at: TsMs) {
    let delta = at - game.now_ms();
    if delta > 0 {
        sleep(Duration::from_millis(delta as u64)).await;
    }
}

/// Sleep until `at` on the game clock. Returns false when shutdown was requested.
async fn wait_until(game: &Game, at: TsMs, shutdown: &mut watch::Receiver<bool>) -> bool {
    if *shutdown.borrow() {
        return false;
    }
    select! {
        _ = sleep_until_ms(game, at) => true,
        changed = shutdown.changed() => match changed {
            Ok(()) if *shutdown.borrow() => false,
            // sender gone or flag still false: just finish the wait
            _ => {
                sleep_until_ms(game, at).await;
                true
            }
        },
    }
}

/// Waits until the game leaves PENDING. An explicit `start()` always wins;
/// with `start_at` set the scheduler starts the game itself at that instant.
async fn wait_for_start(game: &Game, shutdown: &mut watch::Receiver<bool>) -> EngineResult<bool> {
    let start_at = game.plan().start_at;
    let mut status = game.subscribe_status();
    let mut shutdown_live = true;
    loop {
        if *status.borrow_and_update() != GameStatus::Pending {
            return Ok(true);
        }
        if *shutdown.borrow() {
            return Ok(false);
        }
        select! {
            _ = sleep_until_ms(game, start_at.unwrap_or(TsMs::MAX)), if start_at.is_some() => {
                match game.start().await {
                    Ok(_) => return Ok(true),
                    // lost the race against an explicit start
                    Err(_) if game.status() != GameStatus::Pending => return Ok(true),
                    Err(e) => return Err(e),
                }
            }
            r = status.changed() => if r.is_err() { return Ok(false) },
            r = shutdown.changed(), if shutdown_live => match r {
                Ok(()) if *shutdown.borrow() => return Ok(false),
                Ok(()) => {}
                Err(_) => shutdown_live = false,
            },
        }
    }
}

pub async fn run(game: Arc<Game>, mut shutdown: watch::Receiver<bool>) -> EngineResult<()> {
    if !wait_for_start(&game, &mut shutdown).await? {
        info!(game = %game.id(), "scheduler: stopped before start");
        return Ok(());
    }

    for round in game.rounds().await {
        if round.round_no <= game.last_closed().await {
            continue;
        }
        if !wait_until(&game, round.starts_at, &mut shutdown).await {
            info!(game = %game.id(), round = round.round_no, "scheduler: shutdown");
            return Ok(());
        }
        let lag = game.now_ms() - round.starts_at;
        game.open_round(round.round_no).await?;
        if lag > 0 {
            warn!(game = %game.id(), round = round.round_no, lag_ms = lag, "scheduler: round opened late");
            game.note(format!("round {} opened {lag}ms late", round.round_no));
        }

        for ev in firing_order(&round.events) {
            if !wait_until(&game, round.starts_at + ev.offset_ms, &mut shutdown).await {
                return Ok(());
            }
            if let Err(e) = game.fire_event(&ev).await {
                warn!(game = %game.id(), event = %ev.id, code = e.code(), error = %e, "scheduler: event not applied");
                game.note(format!("event {} not applied: {}", ev.id, e.code()));
            }
        }

        if !wait_until(&game, round.ends_at, &mut shutdown).await {
            return Ok(());
        }
        let scores = game.close_round(round.round_no).await?;
        info!(game = %game.id(), round = round.round_no, scored = scores.len(), "scheduler: round scored");
    }
    Ok(())
}
