// ===============================
// src/reconcile.rs (snapshot + delta reconciler)
// ===============================
//
// Single owner of the portfolio state. REST snapshots replace the position
// set wholesale; quote ticks patch one position in place and re-derive
// everything downstream of it in the same transition. The task publishes a
// ViewSnapshot over a watch channel after every visible change, so readers
// never observe a half-applied event.

use ahash::AHashMap;
use chrono::Utc;
use serde_json::Value;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::api::ApiError;
use crate::domain::{
    Banner, BannerKind, ConnState, EngineStatus, Event, EventLog, LogEntry, Position,
    PriceDirection, QuoteEvent, Snapshot, StreamEvent, StreamKind, Totals,
};
use crate::metrics::{
    EVENTS_BY_TYPE, PORTFOLIO_MARKET_VALUE, PORTFOLIO_PNL, POSITIONS_COUNT, SNAPSHOTS_ERR,
    SNAPSHOTS_OK, SNAPSHOTS_STALE, TICKS_APPLIED, TICKS_IGNORED,
};

#[derive(Clone, Debug)]
pub struct ReconcilerConfig {
    pub flash_duration: Duration,
    pub banner_dismiss: Duration,
    pub event_log_capacity: usize,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            flash_duration: Duration::from_secs(1),
            banner_dismiss: Duration::from_secs(5),
            event_log_capacity: 100,
        }
    }
}

/// One snapshot-load outcome, stamped by the loader. Stale sequences lose.
#[derive(Debug)]
pub struct SnapshotResult {
    pub seq: u64,
    pub result: Result<Snapshot, ApiError>,
}

/// Read-only projection input published to consumers.
#[derive(Debug, Clone, Default)]
pub struct ViewSnapshot {
    pub positions: Vec<Position>,
    pub totals: Totals,
    pub account_balance: Option<f64>,
    pub engine: Option<EngineStatus>,
    pub global_settings: Option<Value>,
    pub subscribed: Vec<String>,
    pub flashes: AHashMap<String, PriceDirection>,
    pub log: Vec<LogEntry>,
    pub banner: Option<Banner>,
    pub loaded: bool,
    pub quotes_conn: ConnState,
    pub trading_conn: ConnState,
    pub ticks_applied: u64,
}

pub struct Reconciler {
    cfg: ReconcilerConfig,
    positions: Vec<Position>,
    totals: Totals,
    account_balance: Option<f64>,
    engine: Option<EngineStatus>,
    global_settings: Option<Value>,
    subscribed: Vec<String>,
    // owned per-symbol flash deadlines; replaced on the next change,
    // swept by the housekeeping tick
    flashes: AHashMap<String, (PriceDirection, Instant)>,
    log: EventLog,
    banner: Option<Banner>,
    banner_deadline: Option<Instant>,
    last_seq: u64,
    loaded: bool,
    ticks_applied: u64,
    quotes_conn: ConnState,
    trading_conn: ConnState,
}

impl Reconciler {
    pub fn new(cfg: ReconcilerConfig) -> Self {
        let log = EventLog::new(cfg.event_log_capacity);
        Self {
            cfg,
            positions: Vec::new(),
            totals: Totals::default(),
            account_balance: None,
            engine: None,
            global_settings: None,
            subscribed: Vec::new(),
            flashes: AHashMap::new(),
            log,
            banner: None,
            banner_deadline: None,
            last_seq: 0,
            loaded: false,
            ticks_applied: 0,
            quotes_conn: ConnState::Disconnected,
            trading_conn: ConnState::Disconnected,
        }
    }

    fn export_gauges(&self) {
        POSITIONS_COUNT.set(self.positions.len() as i64);
        PORTFOLIO_MARKET_VALUE.set(self.totals.market_value);
        PORTFOLIO_PNL.set(self.totals.pnl);
    }

    /// Fold one quote tick. Unknown symbol is a no-op (no speculative
    /// position creation); a tick before the first snapshot falls out of the
    /// same rule. All derived fields land in one transition.
    fn apply_quote(&mut self, q: &QuoteEvent) {
        let Some(price) = q.price() else {
            debug!(symbol = %q.symbol, "tick without a price, dropped");
            return;
        };
        let Some(pos) = self.positions.iter_mut().find(|p| p.symbol == q.symbol) else {
            TICKS_IGNORED.inc();
            return;
        };

        if price > pos.current_price {
            self.flashes.insert(
                q.symbol.clone(),
                (PriceDirection::Up, Instant::now() + self.cfg.flash_duration),
            );
        } else if price < pos.current_price {
            self.flashes.insert(
                q.symbol.clone(),
                (PriceDirection::Down, Instant::now() + self.cfg.flash_duration),
            );
        }

        pos.current_price = price;
        pos.last_update = q.timestamp.unwrap_or_else(Utc::now);
        pos.recompute();
        // day_pnl stays server-owned: resum leaves it alone
        self.totals.resum(&self.positions);

        self.ticks_applied += 1;
        TICKS_APPLIED.inc();
        self.export_gauges();
    }

    pub fn apply_stream(&mut self, ev: StreamEvent) {
        match ev {
            StreamEvent::Quote(q) => {
                EVENTS_BY_TYPE.with_label_values(&["quote"]).inc();
                self.apply_quote(&q);
            }
            StreamEvent::PortfolioUpdate {
                mut positions,
                totals,
                account_balance,
            } => {
                EVENTS_BY_TYPE.with_label_values(&["portfolio_update"]).inc();
                for p in positions.iter_mut() {
                    p.recompute();
                }
                self.positions = positions;
                if let Some(t) = totals {
                    // authoritative day baseline
                    self.totals.day_pnl = t.day_pnl;
                    self.totals.day_pnl_percent = t.day_pnl_percent;
                }
                self.totals.resum(&self.positions);
                if account_balance.is_some() {
                    self.account_balance = account_balance;
                }
                self.export_gauges();
            }
            StreamEvent::Status { subscribed_symbols } => {
                EVENTS_BY_TYPE.with_label_values(&["status"]).inc();
                self.subscribed = subscribed_symbols;
            }
            StreamEvent::AiAnalysis(v) => {
                EVENTS_BY_TYPE.with_label_values(&["ai_analysis"]).inc();
                self.log.push("ai_analysis", summarize(&v));
            }
            StreamEvent::Unknown { kind, raw } => {
                EVENTS_BY_TYPE.with_label_values(&["unknown"]).inc();
                debug!(%kind, "unknown stream event logged");
                self.log.push(&kind, summarize(&raw));
            }
        }
    }

    /// Apply an authoritative snapshot. Returns false when the response
    /// resolved out of order and was discarded.
    pub fn apply_snapshot(&mut self, seq: u64, mut snap: Snapshot) -> bool {
        if seq <= self.last_seq {
            SNAPSHOTS_STALE.inc();
            warn!(seq, last = self.last_seq, "stale snapshot discarded");
            return false;
        }
        self.last_seq = seq;

        for p in snap.positions.iter_mut() {
            p.recompute();
        }
        // full overwrite, not a merge: nothing from the prior set survives
        self.positions = snap.positions;
        if let Some(t) = snap.totals {
            self.totals.day_pnl = t.day_pnl;
            self.totals.day_pnl_percent = t.day_pnl_percent;
        }
        self.totals.resum(&self.positions);

        // auxiliary slices keep their prior value when the load degraded
        if snap.account_balance.is_some() {
            self.account_balance = snap.account_balance;
        }
        if snap.global_settings.is_some() {
            self.global_settings = snap.global_settings;
        }
        if snap.engine.is_some() {
            self.engine = snap.engine;
        }

        self.loaded = true;
        SNAPSHOTS_OK.inc();
        self.export_gauges();
        true
    }

    /// Snapshot load failed: keep everything, surface a banner.
    pub fn snapshot_failed(&mut self, err: &ApiError) {
        SNAPSHOTS_ERR.inc();
        self.push_banner(Banner {
            kind: BannerKind::Error,
            text: err.to_string(),
        });
    }

    /// Latest banner wins; every new one resets the dismiss deadline.
    pub fn push_banner(&mut self, banner: Banner) {
        self.banner = Some(banner);
        self.banner_deadline = Some(Instant::now() + self.cfg.banner_dismiss);
    }

    pub fn set_conn(&mut self, stream: StreamKind, state: ConnState) {
        match stream {
            StreamKind::Quotes => self.quotes_conn = state,
            StreamKind::AiTrading => self.trading_conn = state,
        }
    }

    /// Expire flash highlights and the banner. Returns true when anything
    /// changed so the caller knows to republish.
    pub fn sweep(&mut self, now: Instant) -> bool {
        let before = self.flashes.len();
        self.flashes.retain(|_, (_, deadline)| *deadline > now);
        let mut changed = self.flashes.len() != before;

        if let Some(deadline) = self.banner_deadline {
            if now >= deadline {
                self.banner = None;
                self.banner_deadline = None;
                changed = true;
            }
        }
        changed
    }

    pub fn view(&self) -> ViewSnapshot {
        ViewSnapshot {
            positions: self.positions.clone(),
            totals: self.totals.clone(),
            account_balance: self.account_balance,
            engine: self.engine.clone(),
            global_settings: self.global_settings.clone(),
            subscribed: self.subscribed.clone(),
            flashes: self
                .flashes
                .iter()
                .map(|(s, (d, _))| (s.clone(), *d))
                .collect(),
            log: self.log.entries().cloned().collect(),
            banner: self.banner.clone(),
            loaded: self.loaded,
            quotes_conn: self.quotes_conn,
            trading_conn: self.trading_conn,
            ticks_applied: self.ticks_applied,
        }
    }
}

fn summarize(v: &Value) -> String {
    for key in ["message", "summary", "analysis"] {
        if let Some(s) = v.get(key).and_then(|x| x.as_str()) {
            return s.to_string();
        }
    }
    let s = v.to_string();
    if s.chars().count() > 120 {
        s.chars().take(120).collect()
    } else {
        s
    }
}

/// Reconciler task: selects over stream events, snapshot outcomes, command
/// notices, connection-state changes and the housekeeping tick. Shutdown
/// ends the loop, which drops the tick along with everything else.
#[allow(clippy::too_many_arguments)]
pub async fn run(
    cfg: ReconcilerConfig,
    mut ev_rx: mpsc::Receiver<StreamEvent>,
    mut snap_rx: mpsc::Receiver<SnapshotResult>,
    mut banner_rx: mpsc::Receiver<Banner>,
    mut quotes_state: watch::Receiver<ConnState>,
    mut trading_state: watch::Receiver<ConnState>,
    view_tx: watch::Sender<ViewSnapshot>,
    rec_tx: Option<mpsc::Sender<Event>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut task = Reconciler::new(cfg);
    let mut housekeeping = interval(Duration::from_millis(250));
    housekeeping.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            maybe_ev = ev_rx.recv() => {
                let Some(ev) = maybe_ev else { return };
                if let (Some(tx), StreamEvent::Quote(q)) = (&rec_tx, &ev) {
                    let _ = tx.try_send(Event::Quote(q.clone()));
                }
                task.apply_stream(ev);
                let _ = view_tx.send(task.view());
            }
            maybe_snap = snap_rx.recv() => {
                let Some(sr) = maybe_snap else { return };
                match sr.result {
                    Ok(snap) => {
                        if task.apply_snapshot(sr.seq, snap) {
                            info!(seq = sr.seq, positions = task.positions.len(), "snapshot applied");
                            if let Some(tx) = &rec_tx {
                                let _ = tx.try_send(Event::SnapshotApplied {
                                    seq: sr.seq,
                                    positions: task.positions.len(),
                                });
                            }
                        }
                    }
                    Err(e) => {
                        warn!(%e, "snapshot load failed, prior state retained");
                        task.snapshot_failed(&e);
                    }
                }
                let _ = view_tx.send(task.view());
            }
            maybe_banner = banner_rx.recv() => {
                let Some(b) = maybe_banner else { return };
                if let Some(tx) = &rec_tx {
                    let _ = tx.try_send(Event::Note(b.text.clone()));
                }
                task.push_banner(b);
                let _ = view_tx.send(task.view());
            }
            res = quotes_state.changed() => {
                if res.is_err() { return }
                let state = *quotes_state.borrow_and_update();
                task.set_conn(StreamKind::Quotes, state);
                if let Some(tx) = &rec_tx {
                    let _ = tx.try_send(Event::Conn { stream: "quotes".into(), state });
                }
                let _ = view_tx.send(task.view());
            }
            res = trading_state.changed() => {
                if res.is_err() { return }
                let state = *trading_state.borrow_and_update();
                task.set_conn(StreamKind::AiTrading, state);
                if let Some(tx) = &rec_tx {
                    let _ = tx.try_send(Event::Conn { stream: "ai_trading".into(), state });
                }
                let _ = view_tx.send(task.view());
            }
            _ = housekeeping.tick() => {
                if task.sweep(Instant::now()) {
                    let _ = view_tx.send(task.view());
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Direction;

    const EPS: f64 = 1e-9;

    fn pos(symbol: &str, qty: f64, avg_cost: f64, price: f64) -> Position {
        Position {
            symbol: symbol.to_string(),
            quantity: qty,
            direction: Direction::Long,
            avg_cost,
            current_price: price,
            market_value: 0.0,
            pnl: 0.0,
            pnl_percent: 0.0,
            day_pnl: None,
            day_pnl_percent: None,
            last_update: Utc::now(),
        }
    }

    fn tick(symbol: &str, price: f64) -> StreamEvent {
        StreamEvent::Quote(QuoteEvent {
            symbol: symbol.to_string(),
            last_done: Some(price),
            close: None,
            open: None,
            high: None,
            low: None,
            volume: None,
            turnover: None,
            timestamp: None,
            sequence: None,
        })
    }

    fn snap(positions: Vec<Position>) -> Snapshot {
        Snapshot {
            positions,
            ..Default::default()
        }
    }

    fn seeded(positions: Vec<Position>) -> Reconciler {
        let mut r = Reconciler::new(ReconcilerConfig::default());
        assert!(r.apply_snapshot(1, snap(positions)));
        r
    }

    #[test]
    fn tick_recomputes_derived_fields() {
        // snapshot AAPL 10 @ 150, tick to 155
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        r.apply_stream(tick("AAPL.US", 155.0));

        let v = r.view();
        let p = &v.positions[0];
        assert!((p.current_price - 155.0).abs() < EPS);
        assert!((p.market_value - 1550.0).abs() < EPS);
        assert!((p.pnl - 50.0).abs() < EPS);
        assert!((p.pnl_percent - 50.0 / 15.0).abs() < 1e-6); // ~3.33
        assert!((v.totals.market_value - 1550.0).abs() < EPS);
        assert!((v.totals.pnl - 50.0).abs() < EPS);
    }

    #[test]
    fn tick_is_idempotent() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        r.apply_stream(tick("AAPL.US", 155.0));
        let once = r.view();
        r.apply_stream(tick("AAPL.US", 155.0));
        let twice = r.view();

        assert!((once.positions[0].pnl - twice.positions[0].pnl).abs() < EPS);
        assert!((once.totals.pnl - twice.totals.pnl).abs() < EPS);
        assert!((once.totals.market_value - twice.totals.market_value).abs() < EPS);
    }

    #[test]
    fn tick_for_unknown_symbol_is_a_noop() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        let before = r.view();
        r.apply_stream(tick("NVDA.US", 900.0));
        let after = r.view();

        assert_eq!(after.positions.len(), before.positions.len());
        assert!((after.positions[0].current_price - 150.0).abs() < EPS);
    }

    #[test]
    fn tick_before_any_snapshot_is_a_noop() {
        let mut r = Reconciler::new(ReconcilerConfig::default());
        r.apply_stream(tick("AAPL.US", 155.0));
        assert!(r.view().positions.is_empty());
    }

    #[test]
    fn short_position_pnl_sign_flips() {
        let mut r = Reconciler::new(ReconcilerConfig::default());
        let mut p = pos("TSLA.US", 5.0, 200.0, 200.0);
        p.direction = Direction::Short;
        assert!(r.apply_snapshot(1, snap(vec![p])));

        r.apply_stream(tick("TSLA.US", 190.0));
        let v = r.view();
        // price dropped, short gains
        assert!((v.positions[0].pnl - 50.0).abs() < EPS);
        assert!((v.positions[0].pnl_percent - 5.0).abs() < EPS);
    }

    #[test]
    fn zero_avg_cost_yields_zero_percent() {
        let mut r = seeded(vec![pos("FREE.US", 10.0, 0.0, 0.0)]);
        r.apply_stream(tick("FREE.US", 5.0));
        let v = r.view();
        assert_eq!(v.positions[0].pnl_percent, 0.0);
        assert!(v.positions[0].pnl_percent.is_finite());
        assert!(v.totals.pnl_percent.is_finite());
    }

    #[test]
    fn snapshot_replacement_is_total() {
        let mut r = seeded(vec![
            pos("AAPL.US", 10.0, 150.0, 150.0),
            pos("TSLA.US", 5.0, 200.0, 200.0),
        ]);
        assert!(r.apply_snapshot(2, snap(vec![pos("NVDA.US", 1.0, 800.0, 820.0)])));

        let v = r.view();
        assert_eq!(v.positions.len(), 1);
        assert_eq!(v.positions[0].symbol, "NVDA.US");
        assert!(!v.positions.iter().any(|p| p.symbol == "AAPL.US"));
    }

    #[test]
    fn stale_snapshot_is_discarded() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        assert!(r.apply_snapshot(3, snap(vec![pos("NVDA.US", 1.0, 800.0, 820.0)])));
        // an older in-flight load resolving late must not win
        assert!(!r.apply_snapshot(2, snap(vec![pos("OLD.US", 1.0, 1.0, 1.0)])));

        let v = r.view();
        assert_eq!(v.positions[0].symbol, "NVDA.US");
    }

    #[test]
    fn ticks_leave_day_pnl_alone() {
        let mut r = Reconciler::new(ReconcilerConfig::default());
        let mut s = snap(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        s.totals = Some(Totals {
            day_pnl: Some(12.5),
            day_pnl_percent: Some(0.8),
            ..Default::default()
        });
        assert!(r.apply_snapshot(1, s));

        r.apply_stream(tick("AAPL.US", 155.0));
        let v = r.view();
        assert_eq!(v.totals.day_pnl, Some(12.5));
        assert_eq!(v.totals.day_pnl_percent, Some(0.8));
    }

    #[test]
    fn portfolio_update_replaces_positions_wholesale() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        r.apply_stream(StreamEvent::PortfolioUpdate {
            positions: vec![pos("MSFT.US", 3.0, 400.0, 410.0)],
            totals: None,
            account_balance: Some(9_000.0),
        });

        let v = r.view();
        assert_eq!(v.positions.len(), 1);
        assert_eq!(v.positions[0].symbol, "MSFT.US");
        assert!((v.positions[0].market_value - 1230.0).abs() < EPS);
        assert_eq!(v.account_balance, Some(9_000.0));
    }

    #[test]
    fn derived_fields_never_trusted_from_the_wire() {
        let mut r = Reconciler::new(ReconcilerConfig::default());
        let mut lying = pos("AAPL.US", 10.0, 150.0, 150.0);
        lying.market_value = 999_999.0;
        lying.pnl = -1.0;
        lying.pnl_percent = 42.0;
        assert!(r.apply_snapshot(1, snap(vec![lying])));

        let v = r.view();
        assert!((v.positions[0].market_value - 1500.0).abs() < EPS);
        assert!((v.positions[0].pnl - 0.0).abs() < EPS);
        assert!((v.positions[0].pnl_percent - 0.0).abs() < EPS);
    }

    #[test]
    fn flash_direction_recorded_and_swept() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 150.0)]);
        r.apply_stream(tick("AAPL.US", 155.0));
        assert_eq!(r.view().flashes.get("AAPL.US"), Some(&PriceDirection::Up));

        r.apply_stream(tick("AAPL.US", 154.0));
        assert_eq!(r.view().flashes.get("AAPL.US"), Some(&PriceDirection::Down));

        // repeated equal price: existing flash kept, not re-armed
        r.apply_stream(tick("AAPL.US", 154.0));
        assert_eq!(r.view().flashes.get("AAPL.US"), Some(&PriceDirection::Down));

        let later = Instant::now() + Duration::from_secs(2);
        assert!(r.sweep(later));
        assert!(r.view().flashes.is_empty());
    }

    #[test]
    fn unknown_events_land_in_bounded_log() {
        let cfg = ReconcilerConfig {
            event_log_capacity: 3,
            ..Default::default()
        };
        let mut r = Reconciler::new(cfg);
        for i in 0..5 {
            r.apply_stream(StreamEvent::Unknown {
                kind: format!("mystery_{i}"),
                raw: serde_json::json!({ "i": i }),
            });
        }
        let v = r.view();
        assert_eq!(v.log.len(), 3);
        assert_eq!(v.log[0].kind, "mystery_2"); // oldest evicted first
        assert_eq!(v.log[2].kind, "mystery_4");
        // state untouched
        assert!(v.positions.is_empty());
    }

    #[test]
    fn snapshot_failure_keeps_state_and_raises_banner() {
        let mut r = seeded(vec![pos("AAPL.US", 10.0, 150.0, 155.0)]);
        r.snapshot_failed(&ApiError::Network("connection refused".into()));

        let v = r.view();
        assert_eq!(v.positions.len(), 1);
        assert!((v.positions[0].current_price - 155.0).abs() < EPS);
        let banner = v.banner.expect("error banner");
        assert_eq!(banner.kind, BannerKind::Error);
        assert!(banner.text.contains("connection refused"));
    }

    #[test]
    fn new_banner_resets_dismiss_deadline() {
        let mut r = Reconciler::new(ReconcilerConfig {
            banner_dismiss: Duration::from_secs(5),
            ..Default::default()
        });
        r.push_banner(Banner {
            kind: BannerKind::Error,
            text: "first".into(),
        });
        // second banner arrives; the slot shows it and the clock restarts
        r.push_banner(Banner {
            kind: BannerKind::Success,
            text: "second".into(),
        });

        // just shy of the *second* deadline: still visible
        assert!(!r.sweep(Instant::now() + Duration::from_secs(4)));
        assert_eq!(r.view().banner.unwrap().text, "second");

        assert!(r.sweep(Instant::now() + Duration::from_secs(6)));
        assert!(r.view().banner.is_none());
    }

    #[test]
    fn totals_percent_guards_zero_cost() {
        let mut r = seeded(vec![pos("FREE.US", 10.0, 0.0, 1.0)]);
        let v = r.view();
        assert_eq!(v.totals.cost, 0.0);
        assert_eq!(v.totals.pnl_percent, 0.0);
    }
}
