// ===============================
// src/main.rs
// ===============================
//
// Wiring: config -> metrics -> channels -> tasks.
//
//   snapshot loader ─┐
//   quote stream ────┼──> reconciler ──> view watch ──> heartbeat log
//   ai-trading stream┘         ^
//   command dispatcher ────────┘ (banners + forced refresh)
//
// A small stdin console drives the command dispatcher:
//   start | stop | trigger | refresh | sync | delete <SYM> | delete-all |
//   exclude <SYM> | quit

use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{info, warn};

use portfolio_sync::commands::Command;
use portfolio_sync::domain::{ConnState, Event, StreamKind};
use portfolio_sync::reconcile::ViewSnapshot;
use portfolio_sync::{api, commands, config, metrics, project, reconcile, recorder, snapshot, stream};

enum Action {
    Cmd(Command),
    Refresh,
    Quit,
}

fn parse_line(line: &str) -> Option<Action> {
    let mut parts = line.split_whitespace();
    let head = parts.next()?;
    let arg = parts.next().map(|s| s.to_ascii_uppercase());
    match (head, arg) {
        ("start", None) => Some(Action::Cmd(Command::EngineStart)),
        ("stop", None) => Some(Action::Cmd(Command::EngineStop)),
        ("trigger", None) => Some(Action::Cmd(Command::EngineTrigger)),
        ("sync", None) => Some(Action::Cmd(Command::SyncHistory(json!({})))),
        ("delete-all", None) => Some(Action::Cmd(Command::DeleteAllAiPositions)),
        ("delete", Some(sym)) => Some(Action::Cmd(Command::DeleteAiPosition(sym))),
        ("exclude", Some(sym)) => Some(Action::Cmd(Command::ExcludeSymbol(sym))),
        ("refresh", None) => Some(Action::Refresh),
        ("quit", None) | ("exit", None) => Some(Action::Quit),
        _ => None,
    }
}

#[tokio::main]
async fn main() {
    // ---- Logging ----
    tracing_subscriber::fmt().with_env_filter("info").init();

    // ---- Config ----
    let args = config::load();

    // ---- Metrics ----
    metrics::init();
    tokio::spawn(metrics::serve_metrics(args.metrics_port));
    metrics::CONFIG_FEED_MODE
        .with_label_values(&[args.feed_mode.as_str()])
        .set(1);
    metrics::CONFIG_POLL_INTERVAL.set(args.poll_interval.as_secs() as i64);

    info!(
        rest = %args.rest_base_url,
        ws = %args.ws_base_url,
        feed = args.feed_mode.as_str(),
        poll_secs = args.poll_interval.as_secs(),
        "startup config"
    );

    // ---- Shutdown fan-out ----
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // ---- Buses ----
    let (ev_tx, ev_rx) = mpsc::channel(4096);
    let (snap_tx, snap_rx) = mpsc::channel(64);
    let (banner_tx, banner_rx) = mpsc::channel(64);
    let (refresh_tx, refresh_rx) = mpsc::channel(64);
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    let (quotes_state_tx, quotes_state_rx) = watch::channel(ConnState::Disconnected);
    let (trading_state_tx, trading_state_rx) = watch::channel(ConnState::Disconnected);
    let (view_tx, view_rx) = watch::channel(ViewSnapshot::default());

    // ---- Recorder (optional) ----
    let rec_tx = if let Some(path) = args.record_file.clone() {
        let (tx, rx) = mpsc::channel::<Event>(8192);
        tokio::spawn(recorder::run(rx, path));
        Some(tx)
    } else {
        None
    };

    let client = api::ApiClient::new(args.rest_base_url.clone());

    // ---- Streams ----
    // In mock mode the ai-trading badge stays offline; its watch sender must
    // outlive the reconciler, so main holds it.
    let mut _held_trading_tx = None;
    match args.feed_mode {
        config::FeedMode::Mock => {
            tokio::spawn(stream::run_mock(
                args.mock_symbols.clone(),
                ev_tx.clone(),
                quotes_state_tx,
                shutdown_rx.clone(),
            ));
            _held_trading_tx = Some(trading_state_tx);
        }
        config::FeedMode::Live => {
            tokio::spawn(stream::run_live(
                StreamKind::Quotes,
                args.ws_base_url.clone(),
                args.reconnect_delay,
                ev_tx.clone(),
                quotes_state_tx,
                shutdown_rx.clone(),
            ));
            tokio::spawn(stream::run_live(
                StreamKind::AiTrading,
                args.ws_base_url.clone(),
                args.reconnect_delay,
                ev_tx.clone(),
                trading_state_tx,
                shutdown_rx.clone(),
            ));
        }
    }
    drop(ev_tx);

    // ---- Snapshot loader ----
    tokio::spawn(snapshot::run(
        client.clone(),
        args.poll_interval,
        refresh_rx,
        snap_tx,
        shutdown_rx.clone(),
    ));

    // ---- Reconciler ----
    tokio::spawn(reconcile::run(
        reconcile::ReconcilerConfig {
            flash_duration: args.flash_duration,
            banner_dismiss: args.banner_dismiss,
            event_log_capacity: args.event_log_capacity,
        },
        ev_rx,
        snap_rx,
        banner_rx,
        quotes_state_rx,
        trading_state_rx,
        view_tx,
        rec_tx.clone(),
        shutdown_rx.clone(),
    ));

    // ---- Command dispatcher ----
    tokio::spawn(commands::run(
        client,
        cmd_rx,
        refresh_tx.clone(),
        banner_tx,
        rec_tx,
        shutdown_rx,
    ));

    // ---- Heartbeat + stdin console ----
    let mut hb = interval(Duration::from_secs(1));
    hb.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;

    loop {
        tokio::select! {
            _ = hb.tick() => {
                let v = view_rx.borrow().clone();
                info!(
                    quotes = project::conn_badge(v.quotes_conn),
                    ticks = v.ticks_applied,
                    "{}",
                    project::totals_line(&v)
                );
            }
            line = lines.next_line(), if stdin_open => {
                let Ok(Some(line)) = line else {
                    // EOF (piped stdin): stop polling, keep the heartbeat
                    stdin_open = false;
                    continue;
                };
                let line = line.trim().to_ascii_lowercase();
                if line.is_empty() { continue }
                match parse_line(&line) {
                    Some(Action::Cmd(cmd)) => {
                        let _ = cmd_tx.send(cmd).await;
                    }
                    Some(Action::Refresh) => {
                        let _ = refresh_tx.send(()).await;
                    }
                    Some(Action::Quit) => break,
                    None => warn!(%line, "unrecognized command"),
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    // unmount: one signal cancels every reconnect sleep, poll interval and
    // expiry timer across the tasks
    info!("shutting down");
    let _ = shutdown_tx.send(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
}
