// ===============================
// src/errors.rs
// ===============================
//! Engine error taxonomy.
//!
//! Every error is local and non-fatal: it is handed back to the caller
//! unchanged in kind, and a rejected operation never leaves a partial mutation.

use rust_decimal::Decimal;
use thiserror::Error;

use crate::domain::{GameStatus, RoundNo};

pub type EngineResult<T> = Result<T, EngineError>;

/// Top-level engine error
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Business(#[from] BusinessError),

    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("concurrent update on participant {participant}, retry the whole operation")]
    ConcurrencyConflict { participant: String },

    #[error("access denied: {0}")]
    AccessDenied(String),
}

/// Wrong lifecycle phase for the requested operation
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateError {
    #[error("game is not active (status {status})")]
    GameNotActive { status: GameStatus },

    #[error("round {round_no} is not open for trading")]
    RoundClosed { round_no: RoundNo },

    #[error("round {got} requested out of sequence, expected {expected}")]
    OutOfSequence { expected: RoundNo, got: RoundNo },

    #[error("invalid transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("game has no participants")]
    NoParticipants,

    #[error("score for round {round_no} / {participant} is final and differs from recompute")]
    ScoreFinal { round_no: RoundNo, participant: String },
}

/// Business rule violations on a trade
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BusinessError {
    #[error("insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: Decimal, available: Decimal },

    #[error("insufficient shares of {symbol}: required {required}, held {held}")]
    InsufficientShares { symbol: String, required: u64, held: u64 },

    #[error("notional of {quantity} {symbol} exceeds the representable range")]
    NotionalOverflow { symbol: String, quantity: u64 },
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotFoundError {
    #[error("unknown ticker: {0}")]
    Ticker(String),

    #[error("unknown participant: {0}")]
    Participant(String),

    #[error("unknown game: {0}")]
    Game(String),

    #[error("unknown profile: {0}")]
    Profile(String),

    #[error("unknown round: {0}")]
    Round(RoundNo),

    #[error("no price for {symbol}")]
    Price { symbol: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Validation,
    State,
    BusinessRule,
    NotFound,
    ConcurrencyConflict,
    AccessDenied,
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::State(_) => ErrorKind::State,
            EngineError::Business(_) => ErrorKind::BusinessRule,
            EngineError::NotFound(_) => ErrorKind::NotFound,
            EngineError::ConcurrencyConflict { .. } => ErrorKind::ConcurrencyConflict,
            EngineError::AccessDenied(_) => ErrorKind::AccessDenied,
        }
    }

    /// Stable failure code for the API layer.
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::Validation(_) => "VALIDATION_ERROR",
            EngineError::State(e) => match e {
                StateError::GameNotActive { .. } => "GAME_NOT_ACTIVE",
                StateError::RoundClosed { .. } => "ROUND_CLOSED",
                StateError::OutOfSequence { .. } => "ROUND_OUT_OF_SEQUENCE",
                StateError::InvalidTransition { .. } => "INVALID_TRANSITION",
                StateError::NoParticipants => "NO_PARTICIPANTS",
                StateError::ScoreFinal { .. } => "SCORE_FINAL",
            },
            EngineError::Business(e) => match e {
                BusinessError::InsufficientFunds { .. } => "INSUFFICIENT_FUNDS",
                BusinessError::InsufficientShares { .. } => "INSUFFICIENT_SHARES",
                BusinessError::NotionalOverflow { .. } => "NOTIONAL_OVERFLOW",
            },
            EngineError::NotFound(e) => match e {
                NotFoundError::Ticker(_) => "UNKNOWN_TICKER",
                NotFoundError::Participant(_) => "UNKNOWN_PARTICIPANT",
                NotFoundError::Game(_) => "UNKNOWN_GAME",
                NotFoundError::Profile(_) => "UNKNOWN_PROFILE",
                NotFoundError::Round(_) => "UNKNOWN_ROUND",
                NotFoundError::Price { .. } => "NO_PRICE",
            },
            EngineError::ConcurrencyConflict { .. } => "CONCURRENCY_CONFLICT",
            EngineError::AccessDenied(_) => "ACCESS_DENIED",
        }
    }

    /// HTTP-like status class for the translation layer.
    pub fn status(&self) -> u16 {
        match self.kind() {
            ErrorKind::Validation => 400,
            ErrorKind::AccessDenied => 403,
            ErrorKind::NotFound => 404,
            ErrorKind::State | ErrorKind::ConcurrencyConflict => 409,
            ErrorKind::BusinessRule => 422,
        }
    }

    /// Only a lost race is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, EngineError::ConcurrencyConflict { .. })
    }

    pub fn validation(msg: impl Into<String>) -> Self { EngineError::Validation(msg.into()) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn insufficient_funds_display_and_code() {
        let err: EngineError = BusinessError::InsufficientFunds { required: dec!(6000), available: dec!(4000) }.into();
        assert!(err.to_string().contains("6000"));
        assert_eq!(err.code(), "INSUFFICIENT_FUNDS");
        assert_eq!(err.kind(), ErrorKind::BusinessRule);
        assert_eq!(err.status(), 422);
        assert!(!err.is_retryable());
    }

    #[test]
    fn state_errors_map_to_conflict_status() {
        let err: EngineError = StateError::RoundClosed { round_no: 3 }.into();
        assert_eq!(err.code(), "ROUND_CLOSED");
        assert_eq!(err.status(), 409);
        assert_eq!(err.to_string(), "round 3 is not open for trading");
    }

    #[test]
    fn only_conflicts_are_retryable() {
        let err = EngineError::ConcurrencyConflict { participant: "user_1".into() };
        assert!(err.is_retryable());
        assert!(!EngineError::from(NotFoundError::Ticker("ZZZ".into())).is_retryable());
        assert_eq!(EngineError::from(NotFoundError::Ticker("ZZZ".into())).code(), "UNKNOWN_TICKER");
    }
}
