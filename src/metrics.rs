// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts,
    Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;
use tracing::{error, info, warn};

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Price Ledger / Event Dispatcher --------
pub static PRICE_SNAPSHOTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("price_snapshots_total", "price snapshots appended").unwrap());

pub static EVENTS_FIRED: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("market_events_fired_total", "market events applied (labels: kind, severity)"),
        &["kind", "severity"],
    )
    .unwrap()
});

pub static EVENTS_REDELIVERED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("market_events_redelivered_total", "event deliveries skipped as already applied").unwrap()
});

// -------- Trade Executor --------
pub static TRADES: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(Opts::new("trades_total", "committed trades (label: side)"), &["side"]).unwrap()
});

pub static TRADE_REJECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("trade_rejects_total", "rejected trade requests (label: code)"),
        &["code"],
    )
    .unwrap()
});

// Request -> commit/reject (milliseconds)
pub static TRADE_LATENCY: Lazy<Histogram> = Lazy::new(|| {
    Histogram::with_opts(
        HistogramOpts::new("trade_latency_ms", "Trade execution latency (ms)")
            .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 50.0, 250.0]),
    )
    .unwrap()
});

// -------- Round Clock / lobby --------
pub static ROUNDS_CLOSED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("rounds_closed_total", "rounds closed and scored").unwrap());

pub static GAMES_ACTIVE: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("games_active", "games currently ACTIVE").unwrap());

pub static PARTICIPANTS: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("participants_joined_total", "participants joined across games").unwrap());

// ---- Config visibility ----
pub static CONFIG_TICKER: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_ticker", "configured tickers (label: symbol)"), &["symbol"]).unwrap()
});

pub static CONFIG_MACRO_POLICY: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(Opts::new("config_macro_policy", "macro fan-out policy (label: policy)"), &["policy"])
        .unwrap()
});

pub static CONFIG_ROUNDS: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("config_rounds", "rounds per game").unwrap());

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(PRICE_SNAPSHOTS.clone())),
        REGISTRY.register(Box::new(EVENTS_FIRED.clone())),
        REGISTRY.register(Box::new(EVENTS_REDELIVERED.clone())),
        REGISTRY.register(Box::new(TRADES.clone())),
        REGISTRY.register(Box::new(TRADE_REJECTS.clone())),
        REGISTRY.register(Box::new(TRADE_LATENCY.clone())),
        REGISTRY.register(Box::new(ROUNDS_CLOSED.clone())),
        REGISTRY.register(Box::new(GAMES_ACTIVE.clone())),
        REGISTRY.register(Box::new(PARTICIPANTS.clone())),
        // Config visibility
        REGISTRY.register(Box::new(CONFIG_TICKER.clone())),
        REGISTRY.register(Box::new(CONFIG_MACRO_POLICY.clone())),
        REGISTRY.register(Box::new(CONFIG_ROUNDS.clone())),
    ] {
        if let Err(e) = m {
            warn!(?e, "metrics: register failed");
        }
    }
}

// Encode all metrics in Prometheus text format
pub fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics), tiny HTTP 1.1 responder
fn handle_client(mut stream: TcpStream) {
    // Read a bit to consume headers (no full parse)
    let mut _req_buf = [0u8; 1024];
    let _ = stream.read(&mut _req_buf);

    let body = encode_metrics();
    let header = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: text/plain; version=0.0.4; charset=utf-8\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        body.len()
    );

    let _ = stream.write_all(header.as_bytes());
    let _ = stream.write_all(&body);
    let _ = stream.flush();
}

// Run the metrics server in a dedicated OS thread (keeps Tokio runtime clean)
pub fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = match TcpListener::bind(&addr) {
            Ok(l) => l,
            Err(e) => {
                error!(?e, %addr, "metrics: bind failed, exporter disabled");
                return;
            }
        };
        info!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => warn!(?e, "metrics: accept error"),
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registered_metrics_are_encoded() {
        init();
        TRADES.with_label_values(&["buy"]).inc();
        CONFIG_ROUNDS.set(3);
        let text = String::from_utf8(encode_metrics()).unwrap();
        assert!(text.contains("trades_total"));
        assert!(text.contains("config_rounds 3"));
    }
}
