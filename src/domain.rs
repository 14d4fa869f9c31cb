// ===============================
// src/domain.rs
// ===============================
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    #[default]
    Long,
    Short,
}
impl Direction {
    pub fn sign(&self) -> f64 {
        match self {
            Direction::Long => 1.0,
            Direction::Short => -1.0,
        }
    }
}

/// A held position. `market_value`/`pnl`/`pnl_percent` are always recomputed
/// locally from price, cost, quantity and direction; wire values for those
/// fields are never trusted (partial payloads drift otherwise).
/// `day_pnl`/`day_pnl_percent` are server-owned: only snapshots and
/// portfolio_update events refresh them, ticks leave them alone.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    #[serde(default)]
    pub quantity: f64,
    #[serde(default)]
    pub direction: Direction,
    #[serde(default)]
    pub avg_cost: f64,
    #[serde(default)]
    pub current_price: f64,
    #[serde(default)]
    pub market_value: f64,
    #[serde(default)]
    pub pnl: f64,
    #[serde(default)]
    pub pnl_percent: f64,
    #[serde(default)]
    pub day_pnl: Option<f64>,
    #[serde(default)]
    pub day_pnl_percent: Option<f64>,
    #[serde(default = "Utc::now")]
    pub last_update: DateTime<Utc>,
}

impl Position {
    /// Re-establish the derived-field invariants from the base fields.
    pub fn recompute(&mut self) {
        let sign = self.direction.sign();
        self.market_value = self.current_price * self.quantity;
        self.pnl = (self.current_price - self.avg_cost) * self.quantity * sign;
        self.pnl_percent = if self.avg_cost == 0.0 {
            0.0
        } else {
            (self.current_price - self.avg_cost) / self.avg_cost * sign * 100.0
        };
    }

    /// Cost basis; kept positive for shorts so aggregate percentages stay sane.
    pub fn cost(&self) -> f64 {
        self.avg_cost * self.quantity.abs()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub cost: f64,
    pub market_value: f64,
    pub pnl: f64,
    pub pnl_percent: f64,
    #[serde(default)]
    pub day_pnl: Option<f64>,
    #[serde(default)]
    pub day_pnl_percent: Option<f64>,
}

impl Totals {
    /// Sum over positions. Day fields are deliberately left as-is: the server
    /// owns the day baseline and ticks cannot reproduce it.
    pub fn resum(&mut self, positions: &[Position]) {
        self.cost = positions.iter().map(Position::cost).sum();
        self.market_value = positions.iter().map(|p| p.market_value).sum();
        self.pnl = positions.iter().map(|p| p.pnl).sum();
        self.pnl_percent = if self.cost > 0.0 {
            self.pnl / self.cost * 100.0
        } else {
            0.0
        };
    }
}

/// One tick off `/ws/quotes`. Ephemeral: folded into the matching position
/// and dropped, never stored. `sequence` is carried for display/journal only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuoteEvent {
    pub symbol: String,
    #[serde(default)]
    pub last_done: Option<f64>,
    #[serde(default)]
    pub close: Option<f64>,
    #[serde(default)]
    pub open: Option<f64>,
    #[serde(default)]
    pub high: Option<f64>,
    #[serde(default)]
    pub low: Option<f64>,
    #[serde(default)]
    pub volume: Option<f64>,
    #[serde(default)]
    pub turnover: Option<f64>,
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    pub sequence: Option<u64>,
}

impl QuoteEvent {
    pub fn price(&self) -> Option<f64> {
        self.last_done.or(self.close)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineStatus {
    #[serde(default)]
    pub running: bool,
    #[serde(default)]
    pub last_run: Option<DateTime<Utc>>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Authoritative REST snapshot. Replaces the position set wholesale; nothing
/// from the previous set survives a load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub positions: Vec<Position>,
    #[serde(default)]
    pub totals: Option<Totals>,
    #[serde(default)]
    pub account_balance: Option<f64>,
    #[serde(default)]
    pub global_settings: Option<Value>,
    #[serde(default)]
    pub engine: Option<EngineStatus>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StreamKind {
    Quotes,
    AiTrading,
}
impl StreamKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Quotes => "quotes",
            StreamKind::AiTrading => "ai_trading",
        }
    }
    pub fn path(&self) -> &'static str {
        match self {
            StreamKind::Quotes => "/ws/quotes",
            StreamKind::AiTrading => "/ws/ai-trading",
        }
    }
}

/// Connection lifecycle. Drives status display only; a disconnected stream
/// means positions go stale, never invalid.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Error,
}
impl ConnState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnState::Disconnected => "disconnected",
            ConnState::Connecting => "connecting",
            ConnState::Connected => "connected",
            ConnState::Error => "error",
        }
    }
}

/// Tagged stream message (`type` discriminator on the wire). Unrecognized
/// types are preserved raw so they can land in the rolling event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum StreamEvent {
    Quote(QuoteEvent),
    PortfolioUpdate {
        positions: Vec<Position>,
        totals: Option<Totals>,
        account_balance: Option<f64>,
    },
    Status {
        subscribed_symbols: Vec<String>,
    },
    AiAnalysis(Value),
    Unknown {
        kind: String,
        raw: Value,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriceDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BannerKind {
    Success,
    Error,
}

/// One dismissible banner slot; the latest message wins and each new one
/// resets the auto-dismiss deadline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Banner {
    pub kind: BannerKind,
    pub text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub kind: String,
    pub summary: String,
}

/// Bounded rolling log for diagnostic display; oldest entry evicted first.
#[derive(Debug, Clone)]
pub struct EventLog {
    entries: VecDeque<LogEntry>,
    capacity: usize,
}

impl EventLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(capacity),
            capacity,
        }
    }
    pub fn push(&mut self, kind: &str, summary: String) {
        if self.entries.len() == self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(LogEntry {
            ts: Utc::now(),
            kind: kind.to_string(),
            summary,
        });
    }
    pub fn entries(&self) -> impl Iterator<Item = &LogEntry> {
        self.entries.iter()
    }
    pub fn len(&self) -> usize {
        self.entries.len()
    }
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Journal record (JSONL recorder).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    Quote(QuoteEvent),
    SnapshotApplied { seq: u64, positions: usize },
    Command { name: String, ok: bool },
    Conn { stream: String, state: ConnState },
    Note(String),
}
