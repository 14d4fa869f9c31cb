// ===============================
// src/metrics.rs
// ===============================
use once_cell::sync::Lazy;
use prometheus::{
    Encoder, Gauge, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::thread;

// Single custom registry (we register everything here)
pub static REGISTRY: Lazy<Registry> = Lazy::new(Registry::new);

// -------- Reconciler --------
pub static TICKS_APPLIED: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("ticks_applied_total", "quote ticks folded into positions").unwrap());

pub static TICKS_IGNORED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new("ticks_ignored_total", "quote ticks for symbols not in the position set").unwrap()
});

pub static EVENTS_BY_TYPE: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("stream_events_total", "stream events by type"),
        &["type"],
    )
    .unwrap()
});

pub static POSITIONS_COUNT: Lazy<IntGauge> =
    Lazy::new(|| IntGauge::new("positions_count", "positions in the reconciled set").unwrap());

pub static PORTFOLIO_MARKET_VALUE: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_market_value", "aggregate market value").unwrap());

pub static PORTFOLIO_PNL: Lazy<Gauge> =
    Lazy::new(|| Gauge::new("portfolio_pnl", "aggregate unrealized PnL").unwrap());

// -------- Snapshot loader --------
pub static SNAPSHOTS_OK: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("snapshots_ok_total", "snapshot loads applied").unwrap());

pub static SNAPSHOTS_ERR: Lazy<IntCounter> =
    Lazy::new(|| IntCounter::new("snapshots_err_total", "snapshot loads failed").unwrap());

pub static SNAPSHOTS_STALE: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "snapshots_stale_total",
        "snapshot responses discarded for resolving out of order",
    )
    .unwrap()
});

// -------- Stream health --------
pub static WS_CONNECTED: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("ws_connected", "1 if the stream WS is connected, 0 otherwise"),
        &["stream"],
    )
    .unwrap()
});

pub static WS_RECONNECTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_reconnects_total", "reconnect attempts per stream"),
        &["stream"],
    )
    .unwrap()
});

pub static WS_PARSE_ERRORS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("ws_parse_errors_total", "malformed frames dropped per stream"),
        &["stream"],
    )
    .unwrap()
});

// -------- Commands --------
pub static COMMANDS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("commands_total", "dispatched commands (labels: command, outcome)"),
        &["command", "outcome"],
    )
    .unwrap()
});

// ---- Config visibility ----
pub static CONFIG_FEED_MODE: Lazy<IntGaugeVec> = Lazy::new(|| {
    IntGaugeVec::new(
        Opts::new("config_feed_mode", "feed mode (label: mode)"),
        &["mode"],
    )
    .unwrap()
});

pub static CONFIG_POLL_INTERVAL: Lazy<IntGauge> = Lazy::new(|| {
    IntGauge::new("config_poll_interval_seconds", "snapshot poll interval").unwrap()
});

pub fn init() {
    // Register all metrics to the custom registry
    for m in [
        REGISTRY.register(Box::new(TICKS_APPLIED.clone())),
        REGISTRY.register(Box::new(TICKS_IGNORED.clone())),
        REGISTRY.register(Box::new(EVENTS_BY_TYPE.clone())),
        REGISTRY.register(Box::new(POSITIONS_COUNT.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_MARKET_VALUE.clone())),
        REGISTRY.register(Box::new(PORTFOLIO_PNL.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_OK.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_ERR.clone())),
        REGISTRY.register(Box::new(SNAPSHOTS_STALE.clone())),
        REGISTRY.register(Box::new(WS_CONNECTED.clone())),
        REGISTRY.register(Box::new(WS_RECONNECTS.clone())),
        REGISTRY.register(Box::new(WS_PARSE_ERRORS.clone())),
        REGISTRY.register(Box::new(COMMANDS.clone())),
        REGISTRY.register(Box::new(CONFIG_FEED_MODE.clone())),
        REGISTRY.register(Box::new(CONFIG_POLL_INTERVAL.clone())),
    ] {
        let _ = m;
    }
}

// Encode all metrics in Prometheus text format
fn encode_metrics() -> Vec<u8> {
    let encoder = TextEncoder::new();
    let families = REGISTRY.gather();
    let mut buf = Vec::new();
    if encoder.encode(&families, &mut buf).is_err() || buf.is_empty() {
        buf.extend_from_slice(b"# no metrics\n");
    }
    buf
}

// Serve one HTTP request (GET / or /metrics) — tiny HTTP 1.1 responder
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
pub async fn serve_metrics(port: u16) {
    thread::spawn(move || {
        let addr = format!("0.0.0.0:{port}");
        let listener = TcpListener::bind(&addr)
            .unwrap_or_else(|e| panic!("metrics bind {} failed: {}", addr, e));
        eprintln!("metrics listening on http://{addr}/ (and /metrics)");

        for conn in listener.incoming() {
            match conn {
                Ok(stream) => handle_client(stream),
                Err(e) => eprintln!("metrics accept error: {}", e),
            }
        }
    });
}
